//! Virtual machine lifecycle: list, setup, run and remove.
//!
//! A VM is nothing but its directory, `<base>/<arch>/<name>/`. There is no
//! manifest; every run re-derives the emulator configuration from the command
//! line, the environment and what is in that directory.

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use itertools::Itertools;

use crate::accel::kvm_eligible;
use crate::arch::Arch;
use crate::common_opts::{DisplayOpts, ResourceOpts, VmOpts};
use crate::config::{exists, Context};
use crate::disk::{self, DiskImage, DEFAULT_DISK_SIZE, PRIMARY_DISK};
use crate::iso::{Downloader, IsoSource};
use crate::kernel::KernelBoot;
use crate::qemu::{self, QemuConfig, DEFAULT_SSH_PORT};
use crate::qemu_img::DiskFormat;
use crate::signals::ForegroundSignals;
use crate::virtiofs::{Preflight, SharedFolder};
use crate::{firmware, ssh, VmmError};

/// On-disk location of one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDir {
    /// Guest architecture
    pub arch: Arch,
    /// VM name
    pub name: String,
    /// `<base>/<arch>/<name>`
    pub root: Utf8PathBuf,
}

impl VmDir {
    /// Resolve the VM selected on the command line.
    pub fn new(ctx: &Context, opts: &VmOpts) -> Result<Self> {
        let arch = opts.arch(ctx)?;
        let name = opts.name(arch)?;
        let root = ctx.arch_dir(arch).join(&name);
        Ok(Self { arch, name, root })
    }

    /// Primary qcow2 disk.
    pub fn disk(&self) -> Utf8PathBuf {
        self.root.join(PRIMARY_DISK)
    }

    /// Directory exported to the guest over virtiofs.
    pub fn shared(&self) -> Utf8PathBuf {
        self.root.join("shared")
    }

    /// virtiofsd's output.
    pub fn helper_log(&self) -> Utf8PathBuf {
        self.root.join("vfsd.log")
    }
}

/// Options for booting a VM
#[derive(Parser, Debug, Clone)]
pub struct BootOpts {
    /// CPU and memory
    #[clap(flatten)]
    pub resources: ResourceOpts,

    /// Console or graphical output
    #[clap(flatten)]
    pub display: DisplayOpts,

    /// Host port forwarded to the guest's SSH server
    #[clap(short = 'p', long, default_value_t = DEFAULT_SSH_PORT)]
    pub ssh_port: u16,
}

/// Direct kernel boot options
#[derive(Parser, Debug, Clone, Default)]
pub struct KernelOpts {
    /// Kernel image or kernel build directory
    #[clap(short, long)]
    pub kernel: Option<Utf8PathBuf>,

    /// Initial ramdisk (default: shared/kernel_files/initramfs)
    #[clap(short, long, requires = "kernel")]
    pub initrd: Option<Utf8PathBuf>,

    /// Kernel command line (default: contents of shared/kernel_files/cmdline)
    #[clap(short = 'C', long, requires = "kernel")]
    pub cmdline: Option<String>,

    /// Start halted, waiting for gdb on localhost:1234
    #[clap(long)]
    pub gdb: bool,
}

/// Options for the list command
#[derive(Parser, Debug, Clone, Default)]
pub struct ListOpts {
    /// Guest architecture (defaults to the host's)
    #[clap(short, long)]
    pub arch: Option<Arch>,
}

/// Options for the setup command
#[derive(Parser, Debug, Clone)]
pub struct SetupOpts {
    /// Which VM
    #[clap(flatten)]
    pub vm: VmOpts,

    /// How to boot it
    #[clap(flatten)]
    pub boot: BootOpts,

    /// Installation ISO, a local path or a URL to download
    #[clap(short, long)]
    pub iso: IsoSource,

    /// Size of the primary disk
    #[clap(short, long, default_value = DEFAULT_DISK_SIZE)]
    pub size: String,
}

/// Options for the run command
#[derive(Parser, Debug, Clone)]
pub struct RunOpts {
    /// Which VM
    #[clap(flatten)]
    pub vm: VmOpts,

    /// How to boot it
    #[clap(flatten)]
    pub boot: BootOpts,

    /// Direct kernel boot
    #[clap(flatten)]
    pub kernel: KernelOpts,

    /// Attach an ISO, a local path or a URL to download
    #[clap(short = 'I', long)]
    pub iso: Option<IsoSource>,
}

/// Options for the remove command
#[derive(Parser, Debug, Clone, Default)]
pub struct RemoveOpts {
    /// Which VM
    #[clap(flatten)]
    pub vm: VmOpts,
}

/// Names of the VMs of one architecture, sorted.
pub fn list(ctx: &Context, arch: Arch) -> Result<Vec<String>> {
    let dir = ctx.arch_dir(arch);
    if !exists(&dir)? {
        return Ok(Vec::new());
    }
    let names = dir
        .read_dir_utf8()
        .with_context(|| format!("Reading {dir}"))?
        .filter_ok(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map_ok(|e| e.file_name().to_owned())
        .collect::<std::io::Result<Vec<_>>>()?;
    Ok(names.into_iter().sorted().collect())
}

/// Execute the list command
pub fn print_list(ctx: &Context, opts: &ListOpts) -> Result<()> {
    let arch = match opts.arch {
        Some(a) => a,
        None => ctx.default_arch()?,
    };
    let names = list(ctx, arch)?;
    println!("\nAvailable virtual machines for {arch}:\n");
    if names.is_empty() {
        println!("None");
    } else {
        for name in names {
            println!("{name}");
        }
    }
    Ok(())
}

/// Execute the remove command; removing a VM that does not exist succeeds.
pub fn remove(ctx: &Context, opts: &RemoveOpts) -> Result<()> {
    let vm = VmDir::new(ctx, &opts.vm)?;
    tracing::info!("Removing {} VM '{}'", vm.arch, vm.name);
    disk::remove_all(&vm.root)
}

/// Execute the setup command: recreate the VM from scratch and boot the installer.
pub fn setup(ctx: &Context, opts: &SetupOpts, downloader: &dyn Downloader) -> Result<()> {
    let vm = VmDir::new(ctx, &opts.vm)?;
    tracing::info!("Setting up {} VM '{}' in {}", vm.arch, vm.name, vm.root);
    disk::remove_all(&vm.root)?;
    std::fs::create_dir_all(&vm.root).with_context(|| format!("Creating {}", vm.root))?;
    disk::create_primary_disk(ctx, &vm.disk(), &opts.size)?;
    boot(
        ctx,
        &vm,
        &opts.boot,
        &KernelOpts::default(),
        Some(&opts.iso),
        downloader,
    )
}

/// Execute the run command
pub fn run(ctx: &Context, opts: &RunOpts, downloader: &dyn Downloader) -> Result<()> {
    let vm = VmDir::new(ctx, &opts.vm)?;
    boot(
        ctx,
        &vm,
        &opts.boot,
        &opts.kernel,
        opts.iso.as_ref(),
        downloader,
    )
}

fn resolve_kernel(vm: &VmDir, opts: &KernelOpts) -> Result<Option<KernelBoot>> {
    let Some(kernel) = opts.kernel.as_deref() else {
        return Ok(None);
    };
    KernelBoot::resolve(
        vm.arch,
        &vm.shared(),
        kernel,
        opts.initrd.as_deref(),
        opts.cmdline.as_deref(),
    )
    .map(Some)
}

fn boot(
    ctx: &Context,
    vm: &VmDir,
    opts: &BootOpts,
    kernel_opts: &KernelOpts,
    iso: Option<&IsoSource>,
    downloader: &dyn Downloader,
) -> Result<()> {
    let primary = vm.disk();
    if !exists(&primary)? {
        return Err(VmmError::NotSetUp {
            name: vm.name.clone(),
            disk: primary,
        }
        .into());
    }
    let graphical = opts.display.graphical(ctx)?;

    let kvm = kvm_eligible(ctx, vm.arch, downloader)?;
    let resources = opts.resources.resolve(ctx, kvm);
    let emulator = qemu::find_emulator(ctx, &qemu::emulator_name(vm.arch, kvm))?;
    let preflight = Preflight::check(ctx, &emulator)?;
    ssh::clear_host_key(ctx, opts.ssh_port)?;

    let firmware = firmware::provision(ctx, vm.arch, &vm.root)?;
    let kernel = resolve_kernel(vm, kernel_opts)?;
    let iso = iso
        .map(|src| src.resolve(&ctx.iso_cache(), downloader))
        .transpose()?;
    let mut disks = vec![DiskImage {
        path: primary,
        format: DiskFormat::Qcow2,
    }];
    disks.extend(disk::discover_secondary_images(ctx, &vm.root)?);

    // Declared before the folder so the handlers outlive its teardown
    let signals = ForegroundSignals::install()?;
    let mut folder = SharedFolder::start(
        ctx,
        &preflight,
        &vm.shared(),
        &vm.helper_log(),
        &signals,
    )?;
    let config = QemuConfig {
        arch: vm.arch,
        kvm,
        resources,
        firmware,
        disks,
        kernel,
        iso,
        graphical,
        gdb: kernel_opts.gdb,
        ssh_port: opts.ssh_port,
        virtiofs_socket: folder.socket().to_owned(),
    };
    qemu::run_foreground(&emulator, &config.args(), &signals)
        .map_err(|e| folder.explain_failure(e))
}
