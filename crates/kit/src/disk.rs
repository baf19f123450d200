//! The primary system disk and any extra images sitting next to it.

use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use itertools::Itertools;

use crate::config::Context;
use crate::firmware::{CODE_IMAGE, VARS_IMAGE};
use crate::qemu_img::{self, DiskFormat};
use crate::VmmError;

/// File name of the primary disk.
pub const PRIMARY_DISK: &str = "disk.img";
/// Size used by `setup` when none is given.
pub const DEFAULT_DISK_SIZE: &str = "75G";
/// Raw images are a whole number of these.
pub const SECTOR_SIZE: u64 = 512;

/// A disk image attached as a virtio block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    /// Host path
    pub path: Utf8PathBuf,
    /// On-disk format
    pub format: DiskFormat,
}

impl DiskImage {
    /// The `-drive` argument pair for this image.
    pub fn qemu_args(&self) -> [String; 2] {
        [
            "-drive".into(),
            format!("if=virtio,format={},file={}", self.format, self.path),
        ]
    }
}

/// Create the qcow2 system disk at `path`.
pub fn create_primary_disk(ctx: &Context, path: &Utf8Path, size: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
    }
    qemu_img::create_qcow2(&ctx.tools.qemu_img, path, size)
}

/// qemu-img calls anything it does not recognize raw, so a stray text file
/// renamed to `.img` has to be caught by its size.
fn check_raw(path: &Utf8Path) -> Result<()> {
    let len = std::fs::metadata(path)
        .with_context(|| format!("Querying {path}"))?
        .len();
    if len == 0 || len % SECTOR_SIZE != 0 {
        return Err(VmmError::UnsupportedDiskFormat {
            path: path.to_owned(),
            format: format!("raw, {len} bytes"),
        }
        .into());
    }
    Ok(())
}

fn is_secondary(name: &str) -> bool {
    name.ends_with(".img") && ![PRIMARY_DISK, CODE_IMAGE, VARS_IMAGE].contains(&name)
}

/// Every extra `*.img` in `vm_dir`, sorted by name, with its probed format.
pub fn discover_secondary_images(ctx: &Context, vm_dir: &Utf8Path) -> Result<Vec<DiskImage>> {
    let names: Vec<String> = vm_dir
        .read_dir_utf8()
        .with_context(|| format!("Reading {vm_dir}"))?
        .map_ok(|e| e.file_name().to_owned())
        .filter_ok(|n| is_secondary(n))
        .collect::<std::io::Result<_>>()?;

    names
        .into_iter()
        .sorted()
        .map(|name| -> Result<DiskImage> {
            let path = vm_dir.join(name);
            let info = qemu_img::info(&ctx.tools.qemu_img, &path)?;
            let format = info.format.parse::<DiskFormat>().map_err(|_| {
                VmmError::UnsupportedDiskFormat {
                    path: path.clone(),
                    format: info.format.clone(),
                }
            })?;
            if format == DiskFormat::Raw {
                check_raw(&path)?;
            }
            tracing::debug!("Secondary disk {path} ({format})");
            Ok(DiskImage { path, format })
        })
        .collect()
}

/// Delete `vm_dir` and everything in it; a missing directory is not an error.
pub fn remove_all(vm_dir: &Utf8Path) -> Result<()> {
    match std::fs::remove_dir_all(vm_dir) {
        Ok(()) => {
            tracing::debug!("Removed {vm_dir}");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Removing {vm_dir}")),
    }
}
