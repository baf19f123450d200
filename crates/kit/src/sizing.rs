//! Default vCPU and memory sizing.
//!
//! Without KVM a fixed, small core count is used because every extra TCG
//! thread costs the host a lot. With KVM the guest gets half the host, capped
//! at eight cores unless the `build` profile asks for everything half the
//! host can give. Memory follows the core count (two GiB per core is enough
//! to compile a kernel) but never exceeds roughly half the host's memory.

use clap::ValueEnum;
use serde::Serialize;

/// Cores used when running under TCG.
pub const TCG_CORES: u32 = 4;
/// Upper bound for the `regular` profile under KVM.
pub const REGULAR_MAX_CORES: u32 = 8;
/// GiB of guest memory per vCPU.
pub const GIB_PER_CORE: u64 = 2;

/// Named sizing presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize)]
pub enum Profile {
    /// Half the host's CPUs, at most eight
    #[default]
    Regular,
    /// Half the host's CPUs, uncapped, for compile-heavy guests
    Build,
}

/// Resolved resources for one emulator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resources {
    /// Number of vCPUs
    pub cores: u32,
    /// Guest memory in GiB
    pub memory_gib: u64,
}

impl Resources {
    /// Resolve cores then memory; user overrides always win.
    pub fn compute(
        cores: Option<u32>,
        memory_gib: Option<u64>,
        profile: Profile,
        kvm: bool,
        host_cpus: u32,
        host_mem_gib: f64,
    ) -> Self {
        let cores = cores.unwrap_or_else(|| default_cores(profile, kvm, host_cpus));
        let memory_gib = memory_gib.unwrap_or_else(|| default_memory_gib(cores, host_mem_gib));
        tracing::debug!("Sizing ({profile:?}, kvm={kvm}): {cores} cores, {memory_gib}G");
        Self { cores, memory_gib }
    }

    /// Value for `-m`.
    pub fn memory_arg(&self) -> String {
        format!("{}G", self.memory_gib)
    }
}

/// Default core count for a profile.
pub fn default_cores(profile: Profile, kvm: bool, host_cpus: u32) -> u32 {
    if !kvm {
        return TCG_CORES;
    }
    let half = (host_cpus / 2).max(1);
    match profile {
        Profile::Regular => half.min(REGULAR_MAX_CORES),
        Profile::Build => half,
    }
}

/// Memory the host can spare for a guest: half its memory, rounded to a power of two.
///
/// Most machines have a power-of-two amount of memory; for others (12G, say)
/// the rounding hands the guest slightly more or less than half, which is
/// acceptable since the user can always pass `-m`.
pub fn host_share_gib(host_mem_gib: f64) -> u64 {
    if host_mem_gib <= 0.0 {
        return 1;
    }
    let exp = host_mem_gib.log2().round() as i64;
    1u64 << (exp - 1).clamp(0, 62)
}

/// Default guest memory for a core count.
pub fn default_memory_gib(cores: u32, host_mem_gib: f64) -> u64 {
    (u64::from(cores) * GIB_PER_CORE)
        .min(host_share_gib(host_mem_gib))
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcg_cores() {
        assert_eq!(default_cores(Profile::Regular, false, 64), TCG_CORES);
        assert_eq!(default_cores(Profile::Build, false, 64), TCG_CORES);
    }

    #[test]
    fn test_kvm_cores() {
        assert_eq!(default_cores(Profile::Regular, true, 8), 4);
        assert_eq!(default_cores(Profile::Regular, true, 64), 8);
        assert_eq!(default_cores(Profile::Build, true, 64), 32);
        assert_eq!(default_cores(Profile::Build, true, 1), 1);
        assert_eq!(default_cores(Profile::Regular, true, 1), 1);
    }

    #[test]
    fn test_host_share() {
        assert_eq!(host_share_gib(16.0), 8);
        assert_eq!(host_share_gib(15.5), 8);
        assert_eq!(host_share_gib(64.0), 32);
        // 12G rounds up to the 16G exponent
        assert_eq!(host_share_gib(12.0), 8);
        assert_eq!(host_share_gib(1.0), 1);
        assert_eq!(host_share_gib(0.5), 1);
        assert_eq!(host_share_gib(0.0), 1);
    }

    #[test]
    fn test_memory_bounds() {
        for cores in 1..=64u32 {
            for host in [0.25, 1.0, 3.7, 8.0, 12.0, 16.0, 31.3, 128.0, 1536.0] {
                let mem = default_memory_gib(cores, host);
                assert!(mem >= 1);
                assert!(mem <= u64::from(cores) * 2);
                assert!(mem <= host_share_gib(host));
            }
        }
    }

    #[test]
    fn test_overrides_win() {
        let r = Resources::compute(Some(3), Some(5), Profile::Build, true, 128, 512.0);
        assert_eq!(
            r,
            Resources {
                cores: 3,
                memory_gib: 5
            }
        );
        // Memory default follows the user's core count, not the default one
        let r = Resources::compute(Some(1), None, Profile::Regular, true, 128, 512.0);
        assert_eq!(r.memory_gib, 2);
    }

    #[test]
    fn test_minimal_x86_64_host() {
        let r = Resources::compute(None, None, Profile::Regular, true, 8, 16.0);
        assert_eq!(r.cores, 4);
        assert_eq!(r.memory_arg(), "8G");
    }
}
