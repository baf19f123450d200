//! Common CLI options shared across commands

use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use crate::arch::Arch;
use crate::config::Context;
use crate::sizing::{Profile, Resources};

/// Which virtual machine to operate on
#[derive(Parser, Debug, Clone, Default)]
pub struct VmOpts {
    /// Guest architecture (aarch64, arm, i386, x86_64; defaults to the host's)
    #[clap(short, long)]
    pub arch: Option<Arch>,

    /// Virtual machine name (defaults to the distribution usually installed for the architecture)
    #[clap(short, long)]
    pub name: Option<String>,
}

impl VmOpts {
    /// The architecture, falling back to the host's.
    pub fn arch(&self, ctx: &Context) -> Result<Arch> {
        match self.arch {
            Some(a) => Ok(a),
            None => ctx.default_arch(),
        }
    }

    /// The VM name, falling back to the architecture's default.
    pub fn name(&self, arch: Arch) -> Result<String> {
        let name = self.name.as_deref().unwrap_or(arch.default_name());
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(eyre!("Invalid virtual machine name '{name}'"));
        }
        Ok(name.to_owned())
    }
}

/// CPU and memory options
#[derive(Parser, Debug, Clone, Default)]
pub struct ResourceOpts {
    /// Number of virtual CPUs (default depends on the profile and KVM availability)
    #[clap(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    pub cores: Option<u32>,

    /// Memory in GiB (default: two per core, at most about half the host's)
    #[clap(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    pub memory: Option<u64>,

    /// Sizing profile used for defaults
    #[clap(short = 'P', long, value_enum, default_value_t = Profile::Regular)]
    pub profile: Profile,
}

impl ResourceOpts {
    /// Apply the user's overrides on top of the profile defaults.
    pub fn resolve(&self, ctx: &Context, kvm: bool) -> Resources {
        Resources::compute(
            self.cores,
            self.memory,
            self.profile,
            kvm,
            ctx.host.cpus,
            ctx.host.mem_gib(),
        )
    }
}

/// Display options
#[derive(Parser, Debug, Clone, Default)]
pub struct DisplayOpts {
    /// Open a graphical window instead of using the terminal as serial console
    #[clap(short, long)]
    pub graphical: bool,
}

/// Hide `--graphical` from `subcommands` of `cmd` when there is no display to
/// open a window on.
pub fn gate_graphical(
    mut cmd: clap::Command,
    subcommands: &[&str],
    display_available: bool,
) -> clap::Command {
    if display_available {
        return cmd;
    }
    for name in subcommands {
        cmd = cmd.mut_subcommand(*name, |sub| sub.mut_arg("graphical", |a| a.hide(true)));
    }
    cmd
}

impl DisplayOpts {
    /// Whether to use a graphical display; fails if one was asked for but none exists.
    pub fn graphical(&self, ctx: &Context) -> Result<bool> {
        if self.graphical && !ctx.display_available {
            return Err(eyre!(
                "Graphical output requested but neither DISPLAY nor WAYLAND_DISPLAY is set"
            ));
        }
        Ok(self.graphical)
    }
}
