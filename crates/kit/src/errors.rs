//! Failures a caller may want to tell apart.
//!
//! Everything else is an ad-hoc `eyre!` report; these variants are wrapped
//! into [`color_eyre::Report`] as well and can be recovered with
//! `downcast_ref::<VmmError>()`.

use camino::Utf8PathBuf;

/// Recognizable errors raised while preparing or running a VM.
#[derive(Debug, thiserror::Error)]
pub enum VmmError {
    /// An architecture string outside the supported set.
    #[error("Unsupported architecture ('{0}'), expected one of aarch64, arm, i386, x86_64")]
    UnsupportedArchitecture(String),

    /// `run` was invoked for a VM whose primary disk does not exist.
    #[error("Disk image ('{disk}') for virtual machine ('{name}') does not exist, run 'setup' first?")]
    NotSetUp {
        /// VM name
        name: String,
        /// Expected primary disk path
        disk: Utf8PathBuf,
    },

    /// None of the candidate files for a required input exist.
    #[error("No {what} found, tried: {}; do you need to install a package?", .tried.join(", "))]
    NoCandidate {
        /// What was being looked for
        what: String,
        /// Every path that was checked
        tried: Vec<String>,
    },

    /// A disk image in the VM directory is neither qcow2 nor raw.
    #[error("Disk image '{path}' has unsupported format '{format}' (expected qcow2, or raw in whole 512-byte sectors)")]
    UnsupportedDiskFormat {
        /// Offending image
        path: Utf8PathBuf,
        /// Format reported by qemu-img
        format: String,
    },

    /// A direct kernel boot input could not be resolved.
    #[error("{what} ('{path}'), derived from {from}, does not exist!")]
    MissingKernelInput {
        /// kernel image, initrd or cmdline
        what: &'static str,
        /// Derived path
        path: Utf8PathBuf,
        /// What the path was derived from
        from: String,
    },

    /// A local installation ISO that does not exist.
    #[error("{path} does not exist, was the wrong path used or did the download fail?")]
    MissingIso {
        /// ISO path
        path: Utf8PathBuf,
    },

    /// Neither doas nor sudo is installed.
    #[error("Could not find doas or sudo on your system (needed for virtiofsd integration)!")]
    NoElevationTool,

    /// The emulator binary is not installed.
    #[error("Could not find QEMU binary ('{0}') on your system (needed to run virtual machine)!")]
    NoEmulator(String),

    /// The virtiofsd helper had died by the time the emulator failed.
    #[error("virtiofsd exited ({status}) while QEMU was running, its log follows:\n{log}")]
    HelperDied {
        /// Exit status of the helper
        status: String,
        /// Contents of the helper's log file
        log: String,
    },
}
