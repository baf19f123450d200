//! Guest architecture table.
//!
//! Every per-architecture constant lives here: the emulator binary, the
//! machine type, firmware search lists, the in-tree kernel image and the
//! default VM name. Callers never match on architecture strings themselves.

use std::fmt;
use std::str::FromStr;

use color_eyre::Result;
use serde::Serialize;
use strum::{EnumIter, IntoStaticStr};

use crate::VmmError;

/// Size of the pflash devices on the `virt` machine, in bytes.
pub const ARM_PFLASH_SIZE: u64 = 64 * 1024 * 1024;

/// Supported guest CPU architectures, named the way QEMU names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, IntoStaticStr, Serialize)]
pub enum Arch {
    /// 64-bit ARM
    #[strum(serialize = "aarch64")]
    #[serde(rename = "aarch64")]
    Aarch64,
    /// 32-bit ARM
    #[strum(serialize = "arm")]
    #[serde(rename = "arm")]
    Arm,
    /// 32-bit x86
    #[strum(serialize = "i386")]
    #[serde(rename = "i386")]
    I386,
    /// 64-bit x86
    #[strum(serialize = "x86_64")]
    #[serde(rename = "x86_64")]
    X86_64,
}

/// How the writable UEFI variable store is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarsStore {
    /// Copied from a distribution-provided template.
    Template(&'static [&'static str]),
    /// A zero-filled blob the firmware formats itself.
    Blank,
}

/// Where the firmware images come from and how they are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareLayout {
    /// Candidate code images, relative to the firmware root, in priority order.
    pub code: &'static [&'static str],
    /// Variable store source.
    pub vars: VarsStore,
    /// Pad the copied code image (and size a blank vars image) to this many bytes.
    pub pad_to: Option<u64>,
}

impl Arch {
    /// The architecture of the machine we are running on.
    pub fn host() -> Result<Self> {
        std::env::consts::ARCH.parse()
    }

    /// The QEMU name for this architecture.
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// The ARM variants, which share the `virt` machine and pflash sizing.
    pub fn is_arm(&self) -> bool {
        matches!(self, Arch::Aarch64 | Arch::Arm)
    }

    /// QEMU machine type.
    pub fn machine(&self) -> &'static str {
        if self.is_arm() {
            "virt"
        } else {
            "q35"
        }
    }

    /// Name of the system emulator binary used without acceleration.
    pub fn emulator(&self) -> String {
        format!("qemu-system-{}", self.as_str())
    }

    /// Path of the bootable image inside a kernel build tree.
    pub fn kernel_image(&self) -> &'static str {
        match self {
            Arch::Aarch64 => "arch/arm64/boot/Image",
            Arch::Arm => "arch/arm/boot/zImage",
            Arch::I386 | Arch::X86_64 => "arch/x86/boot/bzImage",
        }
    }

    /// Default VM name, after the distribution normally installed on it.
    pub fn default_name(&self) -> &'static str {
        match self {
            Arch::Aarch64 => "fedora",
            Arch::Arm => "debian",
            Arch::I386 => "alpine",
            Arch::X86_64 => "arch",
        }
    }

    /// CPU model to use when KVM is enabled.
    pub fn kvm_cpu(&self) -> &'static str {
        match self {
            // A 32-bit guest on a 64-bit host CPU
            Arch::Arm => "host,aarch64=off",
            _ => "host",
        }
    }

    /// CPU model to use under TCG, if the QEMU default is unsuitable.
    pub fn tcg_cpu(&self) -> Option<&'static str> {
        match self {
            // Use impdef pointer auth, otherwise QEMU is just brutally slow:
            // https://lore.kernel.org/YlgVa+AP0g4IYvzN@lakrids/
            Arch::Aarch64 => Some("max,pauth-impdef=true"),
            _ => None,
        }
    }

    /// Host architectures on which this guest can use KVM.
    pub fn kvm_hosts(&self) -> &'static [Arch] {
        match self {
            Arch::Aarch64 => &[Arch::Aarch64],
            // Only when the host CPU implements AArch32 at EL1, see `accel`
            Arch::Arm => &[Arch::Aarch64],
            Arch::I386 => &[Arch::I386, Arch::X86_64],
            Arch::X86_64 => &[Arch::X86_64],
        }
    }

    /// Firmware search lists, relative to `/usr/share`.
    pub fn firmware(&self) -> FirmwareLayout {
        match self {
            Arch::Aarch64 => FirmwareLayout {
                code: &[
                    "edk2/aarch64/QEMU_EFI.silent.fd", // Fedora
                    "edk2/aarch64/QEMU_EFI.fd",        // Arch Linux
                    "edk2-armvirt/aarch64/QEMU_EFI.fd", // Arch Linux (old)
                    "qemu-efi-aarch64/QEMU_EFI.fd",    // Debian and Ubuntu
                ],
                vars: VarsStore::Blank,
                pad_to: Some(ARM_PFLASH_SIZE),
            },
            Arch::Arm => FirmwareLayout {
                code: &[
                    "edk2/arm/QEMU_EFI.fd", // Arch Linux and Fedora
                ],
                vars: VarsStore::Blank,
                pad_to: Some(ARM_PFLASH_SIZE),
            },
            Arch::I386 => FirmwareLayout {
                code: &[
                    "edk2/ia32/OVMF_CODE.fd",            // Arch Linux
                    "edk2/ovmf-ia32/OVMF_CODE.fd",       // Fedora
                    "OVMF/OVMF32_CODE_4M.secboot.fd",    // Debian and Ubuntu
                ],
                vars: VarsStore::Template(&[
                    "edk2/ia32/OVMF_VARS.fd",
                    "edk2/ovmf-ia32/OVMF_VARS.fd",
                    "OVMF/OVMF32_VARS_4M.fd",
                ]),
                pad_to: None,
            },
            Arch::X86_64 => FirmwareLayout {
                code: &[
                    "edk2/x64/OVMF_CODE.fd",       // Arch Linux and Fedora
                    "edk2/ovmf/OVMF_CODE.fd",      // Fedora (older)
                    "edk2-ovmf/x64/OVMF_CODE.fd",  // Arch Linux (old)
                    "OVMF/OVMF_CODE.fd",           // Debian and Ubuntu
                ],
                vars: VarsStore::Template(&[
                    "edk2/x64/OVMF_VARS.fd",
                    "edk2/ovmf/OVMF_VARS.fd",
                    "edk2-ovmf/x64/OVMF_VARS.fd",
                    "OVMF/OVMF_VARS.fd",
                ]),
                pad_to: None,
            },
        }
    }
}

impl FromStr for Arch {
    type Err = color_eyre::Report;

    /// Accepts QEMU names as well as the kernel and `uname -m` spellings.
    fn from_str(s: &str) -> Result<Self> {
        let arch = match s {
            "aarch64" | "arm64" => Arch::Aarch64,
            "arm" | "armv7l" | "armhf" => Arch::Arm,
            "i386" | "i686" | "x86" => Arch::I386,
            "x86_64" | "amd64" | "x86-64" => Arch::X86_64,
            other => return Err(VmmError::UnsupportedArchitecture(other.to_owned()).into()),
        };
        Ok(arch)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_aliases() {
        assert_eq!("arm64".parse::<Arch>().unwrap(), Arch::Aarch64);
        assert_eq!("armv7l".parse::<Arch>().unwrap(), Arch::Arm);
        assert_eq!("i686".parse::<Arch>().unwrap(), Arch::I386);
        assert_eq!("x86".parse::<Arch>().unwrap(), Arch::I386);
        assert_eq!("amd64".parse::<Arch>().unwrap(), Arch::X86_64);
    }

    #[test]
    fn test_unsupported_arch() {
        let err = "riscv64".parse::<Arch>().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VmmError>(),
            Some(VmmError::UnsupportedArchitecture(a)) if a == "riscv64"
        ));
    }

    #[test]
    fn test_names_round_trip() {
        for arch in Arch::iter() {
            assert_eq!(arch.as_str().parse::<Arch>().unwrap(), arch);
            assert_eq!(arch.emulator(), format!("qemu-system-{arch}"));
        }
        assert_eq!(Arch::X86_64.as_str(), "x86_64");
    }

    #[test]
    fn test_firmware_layouts() {
        for arch in Arch::iter() {
            let layout = arch.firmware();
            assert!(!layout.code.is_empty());
            if arch.is_arm() {
                assert_eq!(layout.vars, VarsStore::Blank);
                assert_eq!(layout.pad_to, Some(ARM_PFLASH_SIZE));
                assert_eq!(arch.machine(), "virt");
            } else {
                assert!(matches!(layout.vars, VarsStore::Template(v) if !v.is_empty()));
                assert_eq!(layout.pad_to, None);
                assert_eq!(arch.machine(), "q35");
            }
        }
    }

    #[test]
    fn test_cpu_models() {
        assert_eq!(Arch::Aarch64.tcg_cpu(), Some("max,pauth-impdef=true"));
        assert_eq!(Arch::X86_64.tcg_cpu(), None);
        assert_eq!(Arch::Arm.kvm_cpu(), "host,aarch64=off");
        assert_eq!(Arch::I386.kvm_cpu(), "host");
    }
}
