//! Integration tests for cbl-vmm
//!
//! These drive the real binary against a throwaway `VM_FOLDER`; none of
//! them needs QEMU or virtiofsd to be installed.

use std::process::Output;

use camino::{Utf8Path, Utf8PathBuf};
use cbl_vmm::config::{ENV_QEMU_BIN, ENV_VIRTIOFSD_BIN, ENV_VM_FOLDER};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use tempfile::TempDir;
use xshell::{cmd, Shell};

pub(crate) use integration_tests::{integration_test, INTEGRATION_TESTS};

mod tests {
    pub mod firmware;
    pub mod lifecycle;
}

/// Get the path to the cbl-vmm binary, checking CBL_VMM_PATH first, then falling back to "cbl-vmm"
pub(crate) fn get_vmm_command() -> Result<String> {
    if let Ok(path) = std::env::var("CBL_VMM_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/cbl-vmm", "target/release/cbl-vmm"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set CBL_VMM_PATH={path} to run using this binary"
        ));
    }
    Ok("cbl-vmm".to_owned())
}

/// Captured output from a command with decoded stdout/stderr strings
pub(crate) struct CapturedOutput {
    pub output: Output,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Create from a raw Output
    pub fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    /// Assert that the command succeeded, printing debug info on failure
    pub fn assert_success(&self, context: &str) {
        assert!(
            self.output.status.success(),
            "{} failed: {}",
            context,
            self.stderr
        );
    }

    /// Assert that the command failed and mentioned `needle` on stderr
    pub fn assert_failure(&self, context: &str, needle: &str) {
        assert!(
            !self.output.status.success(),
            "{} unexpectedly succeeded: {}",
            context,
            self.stdout
        );
        assert!(
            self.stderr.contains(needle),
            "{} did not mention '{}': {}",
            context,
            needle,
            self.stderr
        );
    }
}

/// A private VM base directory, with emulator and helper overrides
/// pointing at programs that do not exist, and no display.
pub(crate) struct TestVms {
    pub base: Utf8PathBuf,
    _td: TempDir,
}

impl TestVms {
    pub fn new() -> Result<Self> {
        let td = tempfile::tempdir()?;
        let base = Utf8PathBuf::try_from(td.path().join("vm"))?;
        Ok(Self { base, _td: td })
    }

    /// Run cbl-vmm with `args`, capturing output
    pub fn cmd(&self, args: &[&str]) -> Result<CapturedOutput> {
        let sh = Shell::new()?;
        let vmm = get_vmm_command()?;
        let missing = self.base.join("nonexistent");
        let _env = (
            sh.push_env(ENV_VM_FOLDER, &self.base),
            sh.push_env(ENV_QEMU_BIN, &missing),
            sh.push_env(ENV_VIRTIOFSD_BIN, &missing),
        );
        let output = cmd!(sh, "{vmm} {args...}")
            .env_remove("DISPLAY")
            .env_remove("WAYLAND_DISPLAY")
            .ignore_status()
            .output()?;
        Ok(CapturedOutput::new(output))
    }
}

fn main() {
    let args = Arguments::from_args();

    // Collect tests from the distributed slice
    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let name = test.name;
            let f = test.f;
            Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into()))
        })
        .collect();

    // Run the tests and exit with the result
    libtest_mimic::run(&args, tests).exit();
}
