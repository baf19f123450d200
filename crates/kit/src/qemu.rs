//! QEMU command line assembly and the foreground emulator run.
//!
//! The argument vector is built as plain data first so it can be inspected
//! and tested without starting anything.

use std::os::unix::process::CommandExt as _;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context as _};
use color_eyre::Result;

use crate::arch::Arch;
use crate::cmdext::{display_cmd, print_cmd};
use crate::config::Context;
use crate::disk::DiskImage;
use crate::firmware::FirmwarePaths;
use crate::kernel::KernelBoot;
use crate::signals::{wait_foreground, ForegroundSignals};
use crate::sizing::Resources;
use crate::VmmError;

/// Host port forwarded to the guest's SSH server by default.
pub const DEFAULT_SSH_PORT: u16 = 8022;
/// virtiofs mount tag seen by the guest.
pub const VIRTIOFS_TAG: &str = "host";

/// Everything that determines the emulator invocation.
#[derive(Debug, Clone)]
pub struct QemuConfig {
    /// Guest architecture
    pub arch: Arch,
    /// Use KVM
    pub kvm: bool,
    /// vCPUs and memory
    pub resources: Resources,
    /// pflash images
    pub firmware: FirmwarePaths,
    /// Block devices, primary disk first
    pub disks: Vec<DiskImage>,
    /// Direct kernel boot
    pub kernel: Option<KernelBoot>,
    /// Installation media
    pub iso: Option<Utf8PathBuf>,
    /// GPU display instead of a serial console
    pub graphical: bool,
    /// Start halted with a gdb stub on :1234
    pub gdb: bool,
    /// Host port forwarded to guest port 22
    pub ssh_port: u16,
    /// virtiofsd's listening socket
    pub virtiofs_socket: Utf8PathBuf,
}

/// The emulator binary name for a guest.
///
/// A 32-bit ARM guest under KVM runs on the 64-bit emulator, as a 64-bit
/// host CPU in AArch32 mode.
pub fn emulator_name(arch: Arch, kvm: bool) -> String {
    if arch == Arch::Arm && kvm {
        Arch::Aarch64.emulator()
    } else {
        arch.emulator()
    }
}

/// Locate the emulator, honoring the `QEMU_BIN` override.
pub fn find_emulator(ctx: &Context, name: &str) -> Result<Utf8PathBuf> {
    if let Some(p) = &ctx.tools.qemu {
        return Ok(p.clone());
    }
    let path = which::which(name).map_err(|_| VmmError::NoEmulator(name.to_owned()))?;
    Ok(Utf8PathBuf::try_from(path)?)
}

impl QemuConfig {
    fn display_args(&self) -> [&'static str; 4] {
        if self.graphical {
            ["-device", "virtio-vga-gl", "-display", "gtk,gl=on"]
        } else {
            ["-display", "none", "-serial", "mon:stdio"]
        }
    }

    /// The full argument vector, without the binary.
    pub fn args(&self) -> Vec<String> {
        let mem = self.resources.memory_arg();
        let mut args: Vec<String> = vec!["-M".into(), self.arch.machine().into()];
        args.extend(self.display_args().map(String::from));
        args.extend([
            "-nic".into(),
            format!(
                "user,model=virtio-net-pci,hostfwd=tcp::{}-:22",
                self.ssh_port
            ),
            "-object".into(),
            "rng-random,filename=/dev/urandom,id=rng0".into(),
            "-device".into(),
            "virtio-rng-pci".into(),
            // vhost-user-fs needs guest memory shared with virtiofsd
            "-chardev".into(),
            format!("socket,id=char0,path={}", self.virtiofs_socket),
            "-device".into(),
            format!("vhost-user-fs-pci,queue-size=1024,chardev=char0,tag={VIRTIOFS_TAG}"),
            "-object".into(),
            format!("memory-backend-memfd,id=mem,share=on,size={mem}"),
            "-numa".into(),
            "node,memdev=mem".into(),
            "-m".into(),
            mem,
            "-device".into(),
            "virtio-balloon".into(),
            "-smp".into(),
            self.resources.cores.to_string(),
        ]);
        args.extend(self.firmware.qemu_args());
        if let Some(iso) = &self.iso {
            args.extend(crate::iso::qemu_args(iso));
        }
        if self.kvm {
            args.extend(["-cpu".into(), self.arch.kvm_cpu().into(), "-enable-kvm".into()]);
        } else if let Some(cpu) = self.arch.tcg_cpu() {
            args.extend(["-cpu".into(), cpu.into()]);
        }
        if self.gdb {
            args.extend(["-s".into(), "-S".into()]);
        }
        if let Some(kernel) = &self.kernel {
            args.extend(kernel.qemu_args());
        }
        for disk in &self.disks {
            args.extend(disk.qemu_args());
        }
        args
    }
}

/// Run the emulator attached to the terminal until the guest exits.
pub fn run_foreground(qemu: &Utf8Path, args: &[String], signals: &ForegroundSignals) -> Result<()> {
    let mut cmd = Command::new(qemu);
    cmd.args(args);
    // SAFETY: This API is safe to call in a forked child.
    #[allow(unsafe_code)]
    unsafe {
        cmd.pre_exec(|| {
            rustix::process::set_parent_process_death_signal(Some(rustix::process::Signal::TERM))
                .map_err(Into::into)
        });
    }
    print_cmd(&cmd);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to execute {qemu}"))?;
    let status = wait_foreground(&mut child, signals)?;
    if status.success() {
        Ok(())
    } else {
        Err(eyre!("{} exited with {status}", display_cmd(&cmd)))
    }
}
