//! The immutable context of one invocation.
//!
//! The process environment is consulted exactly once, in
//! [`Context::from_env`]; everything below `main` receives a `&Context`.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context as _};
use color_eyre::Result;

use crate::arch::Arch;
use crate::host::HostInfo;

/// Overrides the directory holding all VM state.
pub const ENV_VM_FOLDER: &str = "VM_FOLDER";
/// Overrides the system emulator binary.
pub const ENV_QEMU_BIN: &str = "QEMU_BIN";
/// Overrides the virtiofs helper binary.
pub const ENV_VIRTIOFSD_BIN: &str = "VIRTIOFSD_BIN";

/// External programs, with their overrides applied.
#[derive(Debug, Clone)]
pub struct Tools {
    /// Emulator to use instead of `qemu-system-<arch>`
    pub qemu: Option<Utf8PathBuf>,
    /// virtiofsd to use instead of searching for one
    pub virtiofsd: Option<Utf8PathBuf>,
    /// Privilege elevation program; searched for (doas, then sudo) when unset
    pub elevate: Option<Utf8PathBuf>,
    /// Disk image tool
    pub qemu_img: Utf8PathBuf,
    /// Used to forget stale host keys
    pub ssh_keygen: Utf8PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            qemu: None,
            virtiofsd: None,
            elevate: None,
            qemu_img: "qemu-img".into(),
            ssh_keygen: "ssh-keygen".into(),
        }
    }
}

/// Everything derived from the environment for this invocation.
#[derive(Debug, Clone)]
pub struct Context {
    /// Root of all VM state: `<base>/<arch>/<name>/`
    pub base: Utf8PathBuf,
    /// Directory the firmware candidate lists are relative to
    pub firmware_root: Utf8PathBuf,
    /// Whether a graphical display can be opened
    pub display_available: bool,
    /// The user's `~/.ssh`, if a home directory is known
    pub ssh_dir: Option<Utf8PathBuf>,
    /// External programs
    pub tools: Tools,
    /// Host facts
    pub host: HostInfo,
}

fn env_path(name: &str) -> Option<Utf8PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .map(Utf8PathBuf::from)
}

fn default_base() -> Result<Utf8PathBuf> {
    let exe = std::env::current_exe().context("Locating our executable")?;
    let exe = Utf8PathBuf::try_from(exe)?;
    let dir = exe
        .parent()
        .ok_or_else(|| eyre!("Executable path {exe} has no parent"))?;
    Ok(dir.join("vm"))
}

impl Context {
    /// Assemble the context from the process environment and the host.
    pub fn from_env() -> Result<Self> {
        let base = match env_path(ENV_VM_FOLDER) {
            Some(p) => p,
            None => default_base()?,
        };
        let display_available = ["DISPLAY", "WAYLAND_DISPLAY"]
            .iter()
            .any(|v| std::env::var_os(v).is_some_and(|v| !v.is_empty()));
        let ssh_dir = dirs::home_dir()
            .and_then(|h| Utf8PathBuf::try_from(h).ok())
            .map(|h| h.join(".ssh"));
        let tools = Tools {
            qemu: env_path(ENV_QEMU_BIN),
            virtiofsd: env_path(ENV_VIRTIOFSD_BIN),
            ..Default::default()
        };
        let ctx = Self {
            base,
            firmware_root: "/usr/share".into(),
            display_available,
            ssh_dir,
            tools,
            host: HostInfo::detect()?,
        };
        tracing::debug!("VM state under {}", ctx.base);
        Ok(ctx)
    }

    /// Directory holding every VM of one architecture.
    pub fn arch_dir(&self, arch: Arch) -> Utf8PathBuf {
        self.base.join(arch.as_str())
    }

    /// Architecture-independent ISO download cache.
    pub fn iso_cache(&self) -> Utf8PathBuf {
        self.base.join("iso")
    }

    /// Helper programs downloaded on demand.
    pub fn utils_dir(&self) -> Utf8PathBuf {
        self.base.join("utils")
    }

    /// `~/.ssh/known_hosts`, if a home directory is known.
    pub fn known_hosts(&self) -> Option<Utf8PathBuf> {
        self.ssh_dir.as_deref().map(|d| d.join("known_hosts"))
    }

    /// The architecture used when none is given on the command line.
    pub fn default_arch(&self) -> Result<Arch> {
        self.host.arch.ok_or_else(|| {
            eyre!(
                "Host architecture {} is not supported, pass -a",
                std::env::consts::ARCH
            )
        })
    }

    /// Resolve a path relative to the firmware root.
    pub fn firmware_path(&self, rel: &str) -> Utf8PathBuf {
        self.firmware_root.join(rel)
    }
}

/// Whether `path` names something that exists, following symlinks.
pub(crate) fn exists(path: &Utf8Path) -> Result<bool> {
    path.try_exists()
        .with_context(|| format!("Checking for {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fake_context;

    #[test]
    fn test_layout() {
        let td = tempfile::tempdir().unwrap();
        let ctx = fake_context(td.path());
        assert_eq!(ctx.arch_dir(Arch::Arm), ctx.base.join("arm"));
        assert_eq!(ctx.iso_cache(), ctx.base.join("iso"));
        assert_eq!(ctx.utils_dir(), ctx.base.join("utils"));
        assert_eq!(
            ctx.known_hosts().unwrap(),
            ctx.ssh_dir.as_ref().unwrap().join("known_hosts")
        );
        assert_eq!(ctx.default_arch().unwrap(), Arch::X86_64);
    }

    #[test]
    fn test_default_base_is_next_to_exe() {
        let base = default_base().unwrap();
        assert_eq!(base.file_name(), Some("vm"));
    }
}
