//! Direct kernel boot inputs.
//!
//! A kernel may be given as an image or as a build tree. The command line
//! and initramfs default to files dropped into the VM's shared folder by the
//! guest, under `kernel_files/`.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context as _;
use color_eyre::Result;

use crate::arch::Arch;
use crate::config::exists;
use crate::VmmError;

/// Directory inside the shared folder holding the guest's boot files.
pub const KERNEL_FILES: &str = "kernel_files";

/// Fully resolved direct boot configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBoot {
    /// Kernel image
    pub kernel: Utf8PathBuf,
    /// Initial ramdisk
    pub initrd: Utf8PathBuf,
    /// Kernel command line
    pub cmdline: String,
}

impl KernelBoot {
    /// Resolve the user's inputs against the architecture and the VM's shared folder.
    pub fn resolve(
        arch: Arch,
        shared: &Utf8Path,
        kernel: &Utf8Path,
        initrd: Option<&Utf8Path>,
        cmdline: Option<&str>,
    ) -> Result<Self> {
        let image = if kernel.is_dir() {
            kernel.join(arch.kernel_image())
        } else {
            kernel.to_owned()
        };
        if !exists(&image)? {
            return Err(VmmError::MissingKernelInput {
                what: "Kernel image",
                path: image,
                from: format!("kernel argument ('{kernel}')"),
            }
            .into());
        }

        let files = shared.join(KERNEL_FILES);
        let cmdline = match cmdline {
            Some(c) => c.to_owned(),
            None => {
                let path = files.join("cmdline");
                if !exists(&path)? {
                    return Err(VmmError::MissingKernelInput {
                        what: "Kernel command line",
                        path,
                        from: "the shared folder, as no cmdline was passed".into(),
                    }
                    .into());
                }
                std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?
            }
        };

        let (initrd, from) = match initrd {
            Some(p) => (p.to_owned(), "initrd argument".to_owned()),
            None => (
                files.join("initramfs"),
                "the shared folder, as no initrd was passed".to_owned(),
            ),
        };
        if !exists(&initrd)? {
            return Err(VmmError::MissingKernelInput {
                what: "Initial ramdisk",
                path: initrd,
                from,
            }
            .into());
        }

        Ok(Self {
            kernel: image,
            initrd,
            cmdline: cmdline.trim().to_owned(),
        })
    }

    /// `-append`, `-initrd` and `-kernel`.
    pub fn qemu_args(&self) -> Vec<String> {
        vec![
            "-append".into(),
            self.cmdline.clone(),
            "-initrd".into(),
            self.initrd.to_string(),
            "-kernel".into(),
            self.kernel.to_string(),
        ]
    }
}
