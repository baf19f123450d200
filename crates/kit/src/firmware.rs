//! UEFI firmware provisioning.
//!
//! Each VM gets its own copy of the firmware code image (`efi.img`) and a
//! writable variable store (`efi_vars.img`). Both are created the first time
//! a VM runs and never touched again, so variables set by the guest survive.

use std::io::{Read as _, Write as _};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use clap::Parser;
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use serde::Serialize;

use crate::arch::{Arch, VarsStore, ARM_PFLASH_SIZE};
use crate::config::{exists, Context};
use crate::VmmError;

/// Per-VM copy of the firmware code.
pub const CODE_IMAGE: &str = "efi.img";
/// Per-VM variable store.
pub const VARS_IMAGE: &str = "efi_vars.img";

/// Firmware images of one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePaths {
    /// Read-only code image
    pub code: Utf8PathBuf,
    /// Read-write variable store
    pub vars: Utf8PathBuf,
}

impl FirmwarePaths {
    /// pflash drives for the emulator, code first.
    pub fn qemu_args(&self) -> Vec<String> {
        vec![
            "-drive".into(),
            format!("if=pflash,format=raw,file={},readonly=on", self.code),
            "-drive".into(),
            format!("if=pflash,format=raw,file={}", self.vars),
        ]
    }
}

/// Return the first candidate (relative to the firmware root) that exists.
pub fn find_first(ctx: &Context, what: &str, candidates: &[&str]) -> Result<Utf8PathBuf> {
    let mut tried = Vec::with_capacity(candidates.len());
    for rel in candidates {
        let path = ctx.firmware_path(rel);
        if exists(&path)? {
            tracing::debug!("Found {what}: {path}");
            return Ok(path);
        }
        tried.push(path.into_string());
    }
    Err(VmmError::NoCandidate {
        what: what.to_owned(),
        tried,
    }
    .into())
}

/// Copy `src` to `name` in `dir`, zero-padding it to `pad_to` bytes.
fn install_copy(dir: &Dir, name: &str, src: &Utf8Path, pad_to: Option<u64>) -> Result<()> {
    let mut input = std::fs::File::open(src).with_context(|| format!("Opening {src}"))?;
    dir.atomic_replace_with(name, |w| -> std::io::Result<()> {
        let copied = std::io::copy(&mut input, w)?;
        if let Some(len) = pad_to.filter(|&len| len > copied) {
            std::io::copy(&mut std::io::repeat(0).take(len - copied), w)?;
        }
        w.flush()
    })
    .with_context(|| format!("Copying {src} to {name}"))
}

/// Create a zero-filled `name` of `len` bytes in `dir`.
fn install_blank(dir: &Dir, name: &str, len: u64) -> Result<()> {
    dir.atomic_replace_with(name, |w| -> std::io::Result<()> {
        w.get_ref().as_file().set_len(len)
    })
    .with_context(|| format!("Creating blank {name}"))
}

/// Ensure `vm_dir` holds the firmware images for `arch`.
pub fn provision(ctx: &Context, arch: Arch, vm_dir: &Utf8Path) -> Result<FirmwarePaths> {
    (|| -> Result<FirmwarePaths> {
        let layout = arch.firmware();
        let dir = Dir::open_ambient_dir(vm_dir, cap_std::ambient_authority())?;

        if !exists(&vm_dir.join(CODE_IMAGE))? {
            let src = find_first(ctx, &format!("{arch} firmware code"), layout.code)?;
            tracing::info!("Installing {src} as {vm_dir}/{CODE_IMAGE}");
            install_copy(&dir, CODE_IMAGE, &src, layout.pad_to)?;
        }

        if !exists(&vm_dir.join(VARS_IMAGE))? {
            match layout.vars {
                VarsStore::Template(candidates) => {
                    let src = find_first(ctx, &format!("{arch} firmware variables"), candidates)?;
                    tracing::info!("Installing {src} as {vm_dir}/{VARS_IMAGE}");
                    install_copy(&dir, VARS_IMAGE, &src, None)?;
                }
                VarsStore::Blank => {
                    install_blank(&dir, VARS_IMAGE, layout.pad_to.unwrap_or(ARM_PFLASH_SIZE))?;
                }
            }
        }

        Ok(FirmwarePaths {
            code: vm_dir.join(CODE_IMAGE),
            vars: vm_dir.join(VARS_IMAGE),
        })
    })()
    .wrap_err_with(|| format!("Provisioning {arch} firmware in {vm_dir}"))
}

/// Options for the print-firmware command
#[derive(Debug, Parser)]
pub struct PrintFirmwareOpts {
    /// Guest architecture (defaults to the host's)
    #[clap(short, long)]
    pub arch: Option<Arch>,

    /// Output format (yaml or json)
    #[clap(long, default_value = "yaml", value_enum)]
    pub format: OutputFormat,
}

/// Output format for print-firmware command
#[derive(Debug, Clone, clap::ValueEnum)]
pub enum OutputFormat {
    /// YAML format (default, human-readable)
    Yaml,
    /// JSON format (machine-readable)
    Json,
}

/// One searched location.
#[derive(Debug, Serialize)]
pub struct Candidate {
    /// Absolute path
    pub path: String,
    /// Whether it exists on this host
    pub present: bool,
}

/// Firmware search results for one architecture.
#[derive(Debug, Serialize)]
pub struct FirmwareReport {
    /// Guest architecture
    pub architecture: Arch,
    /// Code image candidates, in priority order
    pub code: Vec<Candidate>,
    /// Variable store template candidates; empty when a blank store is created
    pub vars: Vec<Candidate>,
    /// Size the code image is padded to, if any
    pub pad_to: Option<u64>,
}

impl FirmwareReport {
    /// Check every candidate location for `arch`.
    pub fn collect(ctx: &Context, arch: Arch) -> Result<Self> {
        let layout = arch.firmware();
        let check = |list: &[&str]| -> Result<Vec<Candidate>> {
            list.iter()
                .map(|rel| {
                    let path = ctx.firmware_path(rel);
                    Ok(Candidate {
                        present: exists(&path)?,
                        path: path.into_string(),
                    })
                })
                .collect()
        };
        let vars = match layout.vars {
            VarsStore::Template(list) => check(list)?,
            VarsStore::Blank => Vec::new(),
        };
        Ok(Self {
            architecture: arch,
            code: check(layout.code)?,
            vars,
            pad_to: layout.pad_to,
        })
    }
}

/// Execute the print-firmware command
pub fn print(ctx: &Context, opts: PrintFirmwareOpts) -> Result<()> {
    let arch = match opts.arch {
        Some(a) => a,
        None => ctx.default_arch()?,
    };
    let report = FirmwareReport::collect(ctx, arch)?;
    match opts.format {
        OutputFormat::Yaml => {
            print!(
                "{}",
                serde_yaml::to_string(&report)
                    .with_context(|| "Failed to serialize firmware info as YAML")?
            );
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report)
                    .with_context(|| "Failed to serialize firmware info as JSON")?
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fake_context, install_firmware};
    use strum::IntoEnumIterator;

    #[test]
    fn test_idempotent_for_every_arch() {
        let td = tempfile::tempdir().unwrap();
        let ctx = fake_context(td.path());
        install_firmware(&ctx);
        for arch in Arch::iter() {
            let vm_dir = ctx.arch_dir(arch).join("test");
            std::fs::create_dir_all(&vm_dir).unwrap();
            let first = provision(&ctx, arch, &vm_dir).unwrap();
            let code = std::fs::read(&first.code).unwrap();
            let vars = std::fs::read(&first.vars).unwrap();
            let mtime = std::fs::metadata(&first.code).unwrap().modified().unwrap();

            let second = provision(&ctx, arch, &vm_dir).unwrap();
            assert_eq!(first, second);
            assert_eq!(std::fs::read(&second.code).unwrap(), code);
            assert_eq!(std::fs::read(&second.vars).unwrap(), vars);
            assert_eq!(
                std::fs::metadata(&second.code).unwrap().modified().unwrap(),
                mtime
            );
        }
    }

    #[test]
    fn test_arm_padding_and_blank_vars() {
        let td = tempfile::tempdir().unwrap();
        let ctx = fake_context(td.path());
        install_firmware(&ctx);
        let vm_dir = ctx.arch_dir(Arch::Aarch64).join("fedora");
        std::fs::create_dir_all(&vm_dir).unwrap();
        let fw = provision(&ctx, Arch::Aarch64, &vm_dir).unwrap();

        let src = std::fs::read(ctx.firmware_path(Arch::Aarch64.firmware().code[0])).unwrap();
        let code = std::fs::read(&fw.code).unwrap();
        assert_eq!(code.len() as u64, ARM_PFLASH_SIZE);
        assert_eq!(&code[..src.len()], &src[..]);
        assert!(code[src.len()..].iter().all(|&b| b == 0));

        let vars = std::fs::metadata(&fw.vars).unwrap();
        assert_eq!(vars.len(), ARM_PFLASH_SIZE);
    }

    #[test]
    fn test_x86_vars_copied() {
        let td = tempfile::tempdir().unwrap();
        let ctx = fake_context(td.path());
        install_firmware(&ctx);
        let vm_dir = ctx.arch_dir(Arch::X86_64).join("arch");
        std::fs::create_dir_all(&vm_dir).unwrap();
        let fw = provision(&ctx, Arch::X86_64, &vm_dir).unwrap();
        let VarsStore::Template(vars) = Arch::X86_64.firmware().vars else {
            unreachable!()
        };
        assert_eq!(
            std::fs::read(&fw.vars).unwrap(),
            std::fs::read(ctx.firmware_path(vars[0])).unwrap()
        );
    }

    #[test]
    fn test_missing_firmware_names_candidates() {
        let td = tempfile::tempdir().unwrap();
        let ctx = fake_context(td.path());
        let vm_dir = ctx.arch_dir(Arch::I386).join("alpine");
        std::fs::create_dir_all(&vm_dir).unwrap();
        let err = provision(&ctx, Arch::I386, &vm_dir).unwrap_err();
        match err.downcast_ref::<VmmError>() {
            Some(VmmError::NoCandidate { tried, .. }) => {
                assert_eq!(tried.len(), Arch::I386.firmware().code.len());
                assert!(tried[0].ends_with("edk2/ia32/OVMF_CODE.fd"));
            }
            o => panic!("unexpected error {o:?}"),
        }
        assert!(!vm_dir.join(CODE_IMAGE).exists());
    }

    #[test]
    fn test_report() {
        let td = tempfile::tempdir().unwrap();
        let ctx = fake_context(td.path());
        install_firmware(&ctx);
        let report = FirmwareReport::collect(&ctx, Arch::X86_64).unwrap();
        assert!(report.code[0].present);
        assert!(!report.code[1].present);
        let yaml = serde_yaml::to_string(&report).unwrap();
        assert!(yaml.contains("architecture: x86_64"));
        let arm = FirmwareReport::collect(&ctx, Arch::Arm).unwrap();
        assert!(arm.vars.is_empty());
        assert_eq!(arm.pad_to, Some(ARM_PFLASH_SIZE));
    }
}
