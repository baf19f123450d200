//! Manage QEMU virtual machines for booting and testing Linux kernels.
//!
//! Each VM lives in `<base>/<arch>/<name>/` and is driven entirely from the
//! command line; see [`vm`] for the lifecycle operations.

pub mod accel;
pub mod arch;
pub mod cmdext;
pub mod common_opts;
pub mod config;
pub mod disk;
mod errors;
pub mod firmware;
pub mod host;
pub mod iso;
pub mod kernel;
pub mod qemu;
pub mod qemu_img;
pub mod signals;
pub mod sizing;
pub mod ssh;
#[cfg(test)]
mod testutil;
pub mod virtiofs;
pub mod vm;

pub use errors::VmmError;
