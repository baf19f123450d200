//! SSH host key housekeeping.
//!
//! Every VM forwards the same host port to its SSH server, so a fresh
//! install (or a different VM) would trip ssh's changed-host-key check.

use std::process::Command;

use camino::Utf8Path;
use color_eyre::eyre::Context as _;
use color_eyre::Result;

use crate::cmdext::CommandRunExt;
use crate::config::{exists, Context};

/// How ssh names a forwarded localhost port in `known_hosts`.
pub fn known_hosts_name(port: u16) -> String {
    format!("[localhost]:{port}")
}

fn remove_optional(path: &Utf8Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(e).with_context(|| format!("Removing {path}"))
        }
        _ => Ok(()),
    }
}

/// Forget any host key recorded for `localhost:port`.
pub fn clear_host_key(ctx: &Context, port: u16) -> Result<()> {
    let Some(known_hosts) = ctx.known_hosts() else {
        tracing::debug!("No home directory, not clearing host keys");
        return Ok(());
    };
    if !exists(&known_hosts)? {
        return Ok(());
    }
    Command::new(&ctx.tools.ssh_keygen)
        .args(["-R", &known_hosts_name(port), "-f", known_hosts.as_str()])
        .run_captured()?;
    // ssh-keygen leaves the previous contents behind
    remove_optional(&known_hosts.with_extension("old"))
}
