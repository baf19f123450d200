//! Extensions for running external programs.
//!
//! Every command we run on behalf of the user is echoed as `$ argv...` first,
//! so the terminal transcript shows exactly what was executed.

use std::borrow::Cow;
use std::process::{Command, Stdio};

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

/// Render a command as a single shell-quoted line.
pub fn display_cmd(cmd: &Command) -> String {
    let parts: Vec<Cow<'_, str>> = std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy())
        .collect();
    shlex::try_join(parts.iter().map(|s| s.as_ref())).unwrap_or_else(|_| parts.join(" "))
}

/// Print a command the way the user would type it.
pub fn print_cmd(cmd: &Command) {
    println!("$ {}", display_cmd(cmd));
}

/// Run-and-check helpers for [`Command`].
pub trait CommandRunExt {
    /// Echo the command, run it with inherited stdio and fail on a non-zero exit.
    fn run(&mut self) -> Result<()>;

    /// Run the command capturing stdout, which is returned on success.
    fn run_captured(&mut self) -> Result<String>;

    /// Run the command and deserialize its stdout as JSON.
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;
}

impl CommandRunExt for Command {
    fn run(&mut self) -> Result<()> {
        print_cmd(self);
        let status = self
            .status()
            .with_context(|| format!("Failed to execute {}", display_cmd(self)))?;
        if status.success() {
            Ok(())
        } else {
            Err(eyre!("{} exited with {status}", display_cmd(self)))
        }
    }

    fn run_captured(&mut self) -> Result<String> {
        tracing::debug!("{}", display_cmd(self));
        let out = self
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to execute {}", display_cmd(self)))?;
        if !out.status.success() {
            return Err(eyre!(
                "{} exited with {}: {}",
                display_cmd(self),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let stdout = self.run_captured()?;
        serde_json::from_str(&stdout)
            .with_context(|| format!("Parsing JSON output of {}", display_cmd(self)))
    }
}
