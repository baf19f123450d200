//! Signal handling for the duration of a boot.
//!
//! Handlers are installed before virtiofsd starts so that no signal can end
//! the process while the helper or its socket directory exist. Until the
//! emulator is running, any of them aborts the boot through an ordinary error.
//! Afterwards the terminal delivers SIGINT to the whole process group, so the
//! emulator sees it directly; we only record it so that we keep waiting and
//! still run cleanup afterwards. SIGTERM and SIGHUP are aimed at us alone and
//! are forwarded to the emulator.

use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

const CAUGHT: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Last signal received, or 0.
static PENDING: AtomicI32 = AtomicI32::new(0);
/// Only one set of handlers may be installed at a time.
static INSTALLED: Mutex<()> = Mutex::new(());

extern "C" fn record(sig: nix::libc::c_int) {
    PENDING.store(sig, Ordering::SeqCst);
}

/// Our handlers for [`CAUGHT`], restored to the previous ones on drop.
#[derive(Debug)]
pub struct ForegroundSignals {
    previous: Vec<(Signal, SigAction)>,
    _lock: MutexGuard<'static, ()>,
}

impl ForegroundSignals {
    /// Install the recording handler.
    pub fn install() -> Result<Self> {
        let lock = INSTALLED.lock().unwrap_or_else(|e| e.into_inner());
        PENDING.store(0, Ordering::SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(record),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let mut previous = Vec::with_capacity(CAUGHT.len());
        for sig in CAUGHT {
            // SAFETY: the handler only stores into an atomic, which is async-signal-safe.
            #[allow(unsafe_code)]
            let old = unsafe { signal::sigaction(sig, &action) }
                .with_context(|| format!("Installing {sig} handler"))?;
            previous.push((sig, old));
        }
        Ok(Self {
            previous,
            _lock: lock,
        })
    }

    /// Take the most recently received signal, if any.
    pub fn take(&self) -> Option<Signal> {
        match PENDING.swap(0, Ordering::SeqCst) {
            0 => None,
            n => Signal::try_from(n).ok(),
        }
    }

    /// Fail if a signal arrived since the last check.
    pub fn check(&self, what: &str) -> Result<()> {
        match self.take() {
            Some(sig) => Err(eyre!("Received {sig} while {what}, stopping")),
            None => Ok(()),
        }
    }
}

impl Drop for ForegroundSignals {
    fn drop(&mut self) {
        for (sig, old) in self.previous.drain(..).rev() {
            // SAFETY: reinstating the handler that was in place before install().
            #[allow(unsafe_code)]
            if let Err(e) = unsafe { signal::sigaction(sig, &old) } {
                tracing::warn!("Failed to restore {sig} handler: {e}");
            }
        }
    }
}

/// Wait for `child`, forwarding SIGTERM and SIGHUP to it.
pub fn wait_foreground(child: &mut Child, signals: &ForegroundSignals) -> Result<ExitStatus> {
    let pid = Pid::from_raw(child.id() as i32);
    loop {
        if let Some(status) = child.try_wait().context("Waiting for child")? {
            return Ok(status);
        }
        match signals.take() {
            Some(Signal::SIGINT) => tracing::debug!("Interrupted, waiting for the guest to exit"),
            Some(sig) => {
                tracing::info!("Received {sig}, forwarding to pid {pid}");
                if let Err(e) = signal::kill(pid, sig) {
                    tracing::warn!("Failed to forward {sig}: {e}");
                }
            }
            None => {}
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_record_and_restore() {
        let guard = ForegroundSignals::install().unwrap();
        assert_eq!(guard.take(), None);
        signal::raise(Signal::SIGHUP).unwrap();
        assert_eq!(guard.take(), Some(Signal::SIGHUP));
        assert_eq!(guard.take(), None);
        guard.check("idle").unwrap();
        signal::raise(Signal::SIGTERM).unwrap();
        let err = guard.check("idle").unwrap_err();
        assert!(err.to_string().contains("SIGTERM"), "{err}");
    }

    #[test]
    fn test_wait_foreground_status() {
        let signals = ForegroundSignals::install().unwrap();
        let mut child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let status = wait_foreground(&mut child, &signals).unwrap();
        assert_eq!(status.code(), Some(3));
    }
}
