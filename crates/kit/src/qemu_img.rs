//! Helper functions for interacting with qemu-img

use std::fmt;
use std::process::Command;
use std::str::FromStr;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context as _};
use color_eyre::Result;
use serde::Deserialize;

use crate::cmdext::CommandRunExt;

/// Disk image formats we attach to guests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    /// QEMU copy-on-write v2
    Qcow2,
    /// Plain image
    Raw,
}

impl DiskFormat {
    /// Name used by QEMU
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskFormat {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "qcow2" => Ok(DiskFormat::Qcow2),
            "raw" => Ok(DiskFormat::Raw),
            o => Err(eyre!("Unsupported disk format '{o}'")),
        }
    }
}

/// Information returned by `qemu-img info --output=json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QemuImgInfo {
    /// Virtual size of the disk image in bytes
    pub virtual_size: u64,
    /// Path to the disk image file
    pub filename: String,
    /// Image format (e.g., "qcow2", "raw")
    pub format: String,
    /// Actual size on disk in bytes (if available)
    pub actual_size: Option<u64>,
}

/// Run `qemu-img info --force-share --output=json` on a disk image
///
/// The `--force-share` flag allows reading disk info even when the image
/// is locked by a running VM.
pub fn info(qemu_img: &Utf8Path, path: &Utf8Path) -> Result<QemuImgInfo> {
    Command::new(qemu_img)
        .args(["info", "--force-share", "--output=json", path.as_str()])
        .run_and_parse_json()
}

/// Create a sparse qcow2 image of `size` (anything qemu-img accepts, e.g. `75G`).
pub fn create_qcow2(qemu_img: &Utf8Path, path: &Utf8Path, size: &str) -> Result<()> {
    (|| -> Result<()> {
        Command::new(qemu_img)
            .args(["create", "-f", "qcow2", path.as_str(), size])
            .run()
    })()
    .wrap_err_with(|| format!("Creating {size} disk image {path}"))
}
