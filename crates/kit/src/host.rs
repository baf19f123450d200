//! Host introspection.
//!
//! Everything the sizing and acceleration logic needs to know about the
//! machine is read once into [`HostInfo`] and passed around explicitly, which
//! also lets tests describe an arbitrary host.

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use rustix::fs::Access;

use crate::arch::Arch;

/// Device node that must be read/write accessible for KVM.
pub const KVM_DEVICE: &str = "/dev/kvm";

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One line of `/proc/<pid>/{uid,gid}_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapEntry {
    /// First id inside the namespace
    pub inside: u32,
    /// First id in the parent namespace
    pub outside: u32,
    /// Length of the range
    pub count: u32,
}

/// A user namespace id mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdMap(pub Vec<IdMapEntry>);

impl IdMap {
    /// The mapping of the initial user namespace.
    pub fn identity() -> Self {
        Self(vec![IdMapEntry {
            inside: 0,
            outside: 0,
            count: u32::MAX,
        }])
    }

    /// Parse the kernel's `inside outside count` format.
    pub fn parse(s: &str) -> Result<Self> {
        let entries = s
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let fields = line
                    .split_whitespace()
                    .map(|f| f.parse::<u32>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .with_context(|| format!("Parsing id map line '{line}'"))?;
                match fields[..] {
                    [inside, outside, count] => Ok(IdMapEntry {
                        inside,
                        outside,
                        count,
                    }),
                    _ => Err(eyre!("Malformed id map line '{line}'")),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(entries))
    }

    fn read(path: &str) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(s) => Self::parse(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::identity()),
            Err(e) => Err(e).with_context(|| format!("Reading {path}")),
        }
    }

    /// True when every id maps to itself, i.e. we are not in a nested user namespace.
    pub fn is_identity(&self) -> bool {
        self.0.iter().all(|e| e.inside == e.outside)
    }
}

/// Snapshot of the host taken at start-up.
#[derive(Debug, Clone)]
pub struct HostInfo {
    /// Host CPU architecture, if it is one we know
    pub arch: Option<Arch>,
    /// Logical CPUs available to us
    pub cpus: u32,
    /// Total physical memory in bytes
    pub mem_bytes: u64,
    /// Whether `/dev/kvm` is readable and writable
    pub kvm_accessible: bool,
    /// Our user namespace's uid map
    pub uid_map: IdMap,
    /// Our user namespace's gid map
    pub gid_map: IdMap,
}

impl HostInfo {
    /// Inspect the running system.
    pub fn detect() -> Result<Self> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let sysinfo = rustix::system::sysinfo();
        let mem_bytes = (sysinfo.totalram as u64).saturating_mul(sysinfo.mem_unit as u64);
        let kvm_accessible = rustix::fs::access(KVM_DEVICE, Access::READ_OK | Access::WRITE_OK)
            .is_ok();
        let host = Self {
            arch: Arch::host().ok(),
            cpus,
            mem_bytes,
            kvm_accessible,
            uid_map: IdMap::read("/proc/self/uid_map")?,
            gid_map: IdMap::read("/proc/self/gid_map")?,
        };
        tracing::debug!("{host:?}");
        Ok(host)
    }

    /// Total memory in GiB, fractional.
    pub fn mem_gib(&self) -> f64 {
        self.mem_bytes as f64 / GIB
    }
}
