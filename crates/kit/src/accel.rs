//! KVM eligibility.

use std::os::unix::fs::PermissionsExt;
use std::process::Command;

use color_eyre::eyre::Context as _;
use color_eyre::Result;

use crate::arch::Arch;
use crate::config::{exists, Context};
use crate::iso::Downloader;

/// Exits zero when the CPU can run AArch32 code at EL1.
pub const EL1_PROBE_URL: &str =
    "https://github.com/ClangBuiltLinux/boot-utils/raw/main/utils/aarch64_32_bit_el1_supported";
const EL1_PROBE_NAME: &str = "aarch64_32_bit_el1_supported";

/// Whether a 64-bit ARM host can run 32-bit ARM guests under KVM.
///
/// Most server-class cores dropped AArch32 support, so this is checked by
/// running a small probe program rather than assumed.
fn aarch32_el1_supported(ctx: &Context, downloader: &dyn Downloader) -> Result<bool> {
    let probe = ctx.utils_dir().join(EL1_PROBE_NAME);
    if !exists(&probe)? {
        downloader.download(EL1_PROBE_URL, &probe)?;
        std::fs::set_permissions(&probe, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Making {probe} executable"))?;
    }
    let status = Command::new(&probe)
        .status()
        .with_context(|| format!("Running {probe}"))?;
    Ok(status.success())
}

/// Whether `guest` can be run with KVM on this host.
pub fn kvm_eligible(ctx: &Context, guest: Arch, downloader: &dyn Downloader) -> Result<bool> {
    let Some(host) = ctx.host.arch else {
        return Ok(false);
    };
    let eligible = if !ctx.host.kvm_accessible {
        false
    } else if guest == Arch::Arm && host == Arch::Aarch64 {
        aarch32_el1_supported(ctx, downloader)?
    } else {
        guest.kvm_hosts().contains(&host)
    };
    tracing::debug!("KVM for {guest} on {host}: {eligible}");
    Ok(eligible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso::tests::CountingDownloader;
    use crate::testutil::fake_context;

    #[test]
    fn test_no_kvm_device() {
        let td = tempfile::tempdir().unwrap();
        let ctx = fake_context(td.path());
        let dl = CountingDownloader::default();
        assert!(!kvm_eligible(&ctx, Arch::X86_64, &dl).unwrap());
    }

    #[test]
    fn test_matching_host() {
        let td = tempfile::tempdir().unwrap();
        let mut ctx = fake_context(td.path());
        ctx.host.kvm_accessible = true;
        let dl = CountingDownloader::default();
        assert!(kvm_eligible(&ctx, Arch::X86_64, &dl).unwrap());
        assert!(kvm_eligible(&ctx, Arch::I386, &dl).unwrap());
        assert!(!kvm_eligible(&ctx, Arch::Aarch64, &dl).unwrap());
        assert!(!kvm_eligible(&ctx, Arch::Arm, &dl).unwrap());
        assert_eq!(dl.calls.get(), 0);
    }

    #[test]
    fn test_arm_on_aarch64_runs_probe() {
        let td = tempfile::tempdir().unwrap();
        let mut ctx = fake_context(td.path());
        ctx.host.kvm_accessible = true;
        ctx.host.arch = Some(Arch::Aarch64);
        let probe = ctx.utils_dir().join(EL1_PROBE_NAME);

        // The fake download writes the URL, which is not a runnable program
        std::fs::create_dir_all(ctx.utils_dir()).unwrap();
        std::fs::write(&probe, "#!/bin/sh\nexit 1\n").unwrap();
        std::fs::set_permissions(&probe, std::fs::Permissions::from_mode(0o755)).unwrap();
        let dl = CountingDownloader::default();
        assert!(!kvm_eligible(&ctx, Arch::Arm, &dl).unwrap());

        std::fs::write(&probe, "#!/bin/sh\nexit 0\n").unwrap();
        assert!(kvm_eligible(&ctx, Arch::Arm, &dl).unwrap());
        assert!(kvm_eligible(&ctx, Arch::Aarch64, &dl).unwrap());
        assert_eq!(dl.calls.get(), 0);
    }
}
