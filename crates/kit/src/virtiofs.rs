//! The virtiofsd helper sharing a host directory with the guest.
//!
//! virtiofsd must run as root to serve arbitrary host files, so it is started
//! through doas or sudo, while QEMU itself runs unprivileged and connects to
//! the helper's socket. The socket lives in a private temporary directory.
//!
//! [`SharedFolder`] owns both the helper process and that directory: dropping
//! it terminates the helper and removes the socket, whichever way the run
//! ends.

use std::fs::File;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context as _};
use color_eyre::{Report, Result};
use rustix::process::{kill_process, Pid, Signal};

use crate::cmdext::{print_cmd, CommandRunExt};
use crate::config::{exists, Context};
use crate::host::IdMap;
use crate::signals::ForegroundSignals;
use crate::VmmError;

/// Name of the socket inside the private directory.
pub const SOCKET_NAME: &str = "vfsd.sock";
/// How often readiness is checked.
pub const READY_POLL: Duration = Duration::from_millis(100);
/// Upper bound on helper start-up.
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period between SIGTERM and SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

/// Which virtiofsd implementation is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// The deprecated C daemon shipped with QEMU (`-o source=...`)
    Legacy,
    /// The standalone Rust daemon (`--shared-dir ...`)
    Rust,
}

impl Flavor {
    /// Classify the output of `virtiofsd --version`.
    pub fn from_version_output(s: &str) -> Self {
        if s.contains("virtiofsd version") {
            Flavor::Legacy
        } else {
            Flavor::Rust
        }
    }
}

/// `--translate-{uid,gid}` rules mapping the ids the guest sees to the ones
/// visible inside our user namespace.
fn translation_args(flag: &str, map: &IdMap) -> Vec<String> {
    if map.is_identity() {
        return Vec::new();
    }
    map.0
        .iter()
        .flat_map(|e| {
            [
                flag.to_owned(),
                format!("map:{}:{}:{}", e.outside, e.inside, e.count),
            ]
        })
        .collect()
}

/// Arguments for the helper, after the binary.
pub fn helper_args(
    flavor: Flavor,
    shared: &Utf8Path,
    socket: &Utf8Path,
    group: &str,
    uid_map: &IdMap,
    gid_map: &IdMap,
) -> Vec<String> {
    match flavor {
        Flavor::Legacy => {
            if !(uid_map.is_identity() && gid_map.is_identity()) {
                tracing::warn!("Legacy virtiofsd cannot translate ids, ownership may look wrong");
            }
            vec![
                format!("--socket-group={group}"),
                format!("--socket-path={socket}"),
                "-o".into(),
                "cache=always".into(),
                "-o".into(),
                format!("source={shared}"),
            ]
        }
        Flavor::Rust => {
            let mut args = vec![
                "--cache".into(),
                "always".into(),
                "--shared-dir".into(),
                shared.to_string(),
                "--socket-group".into(),
                group.to_owned(),
                "--socket-path".into(),
                socket.to_string(),
            ];
            args.extend(translation_args("--translate-uid", uid_map));
            args.extend(translation_args("--translate-gid", gid_map));
            args
        }
    }
}

/// Places virtiofsd may live, given the emulator's resolved path.
pub fn helper_candidates(qemu: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut r = Vec::new();
    if let Some(bindir) = qemu.parent() {
        // An uninstalled QEMU build tree
        r.push(bindir.join("tools/virtiofsd/virtiofsd"));
    }
    r.push("/usr/lib/virtiofsd".into()); // Arch Linux (virtiofsd)
    if let Some(prefix) = qemu.parent().and_then(|p| p.parent()) {
        r.push(prefix.join("libexec/virtiofsd")); // Default QEMU installation, Fedora
        r.push(prefix.join("lib/qemu/virtiofsd")); // Arch Linux (qemu-virtiofsd)
    }
    r.push("/usr/libexec/virtiofsd".into());
    r
}

fn which_utf8(name: &str) -> Option<Utf8PathBuf> {
    which::which(name)
        .ok()
        .and_then(|p| Utf8PathBuf::try_from(p).ok())
}

/// Find doas or sudo.
pub fn find_elevation(ctx: &Context) -> Result<Utf8PathBuf> {
    if let Some(p) = &ctx.tools.elevate {
        return Ok(p.clone());
    }
    ["doas", "sudo"]
        .into_iter()
        .find_map(which_utf8)
        .ok_or_else(|| VmmError::NoElevationTool.into())
}

/// Find virtiofsd, preferring the override and then `PATH`.
pub fn find_helper(ctx: &Context, qemu: &Utf8Path) -> Result<Utf8PathBuf> {
    if let Some(p) = &ctx.tools.virtiofsd {
        return Ok(p.clone());
    }
    if let Some(p) = which_utf8("virtiofsd") {
        return Ok(p);
    }
    let qemu = qemu
        .canonicalize_utf8()
        .unwrap_or_else(|_| qemu.to_owned());
    let candidates = helper_candidates(&qemu);
    for c in &candidates {
        if exists(c)? {
            return Ok(c.clone());
        }
    }
    Err(VmmError::NoCandidate {
        what: "virtiofsd".into(),
        tried: candidates.into_iter().map(|c| c.into_string()).collect(),
    }
    .into())
}

/// Programs needed to start the helper, located before anything is changed.
#[derive(Debug, Clone)]
pub struct Preflight {
    /// doas or sudo
    pub elevate: Utf8PathBuf,
    /// virtiofsd
    pub helper: Utf8PathBuf,
}

impl Preflight {
    /// Locate the elevation tool and the helper.
    pub fn check(ctx: &Context, qemu: &Utf8Path) -> Result<Self> {
        let elevate = find_elevation(ctx)?;
        let helper = find_helper(ctx, qemu)?;
        tracing::debug!("Using {elevate} to run {helper}");
        Ok(Self { elevate, helper })
    }
}

fn primary_group_name() -> String {
    let gid = nix::unistd::getgid();
    match nix::unistd::Group::from_gid(gid) {
        Ok(Some(g)) => g.name,
        _ => gid.to_string(),
    }
}

/// A running helper and its private socket directory.
#[derive(Debug)]
pub struct SharedFolder {
    child: Child,
    socket: Utf8PathBuf,
    log: Utf8PathBuf,
    _sockdir: tempfile::TempDir,
}

impl SharedFolder {
    /// Start the helper serving `shared`, logging to `log`, and wait until it listens.
    ///
    /// A signal recorded by `signals` before the helper is ready aborts the
    /// start; the helper and socket directory are cleaned up on the way out.
    pub fn start(
        ctx: &Context,
        pre: &Preflight,
        shared: &Utf8Path,
        log: &Utf8Path,
        signals: &ForegroundSignals,
    ) -> Result<Self> {
        std::fs::create_dir_all(shared).with_context(|| format!("Creating {shared}"))?;

        // Get any password prompt over with before the helper goes to the background
        println!("Requesting root privileges to run virtiofsd...");
        Command::new(&pre.elevate).arg("true").run()?;
        signals.check("requesting root privileges")?;

        let version = Command::new(&pre.elevate)
            .arg(&pre.helper)
            .arg("--version")
            .run_captured()?;
        let flavor = Flavor::from_version_output(&version);
        tracing::debug!("virtiofsd flavor: {flavor:?}");

        let sockdir = tempfile::Builder::new().prefix("cbl-vmm-vfsd").tempdir()?;
        let socket = Utf8Path::from_path(sockdir.path())
            .ok_or_else(|| eyre!("Non-UTF-8 temporary directory {:?}", sockdir.path()))?
            .join(SOCKET_NAME);

        let logf = File::create(log).with_context(|| format!("Creating {log}"))?;
        let mut cmd = Command::new(&pre.elevate);
        cmd.arg(&pre.helper)
            .args(helper_args(
                flavor,
                shared,
                &socket,
                &primary_group_name(),
                &ctx.host.uid_map,
                &ctx.host.gid_map,
            ))
            .stdin(Stdio::null())
            .stdout(logf.try_clone()?)
            .stderr(logf);
        print_cmd(&cmd);
        let child = cmd.spawn().context("Spawning virtiofsd")?;

        let mut this = Self {
            child,
            socket,
            log: log.to_owned(),
            _sockdir: sockdir,
        };
        this.wait_ready(signals)?;
        Ok(this)
    }

    fn read_log(&self) -> String {
        std::fs::read_to_string(&self.log).unwrap_or_else(|e| format!("<unreadable: {e}>"))
    }

    fn wait_ready(&mut self, signals: &ForegroundSignals) -> Result<()> {
        let deadline = Instant::now() + READY_TIMEOUT;
        loop {
            signals.check("waiting for virtiofsd")?;
            if exists(&self.socket)? {
                tracing::debug!("virtiofsd listening on {}", self.socket);
                return Ok(());
            }
            if let Some(status) = self.child.try_wait()? {
                return Err(eyre!(
                    "virtiofsd exited ({status}) before creating {}, its log follows:\n{}",
                    self.socket,
                    self.read_log()
                ));
            }
            if Instant::now() >= deadline {
                return Err(eyre!(
                    "Timed out waiting for virtiofsd to create {}",
                    self.socket
                ));
            }
            std::thread::sleep(READY_POLL);
        }
    }

    /// The helper's listening socket.
    pub fn socket(&self) -> &Utf8Path {
        &self.socket
    }

    /// The helper's exit status, if it has already exited.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Attach the helper's log to an emulator failure if the helper is gone.
    pub fn explain_failure(&mut self, err: Report) -> Report {
        match self.exit_status() {
            Some(status) => err.wrap_err(VmmError::HelperDied {
                status: status.to_string(),
                log: self.read_log(),
            }),
            None => err,
        }
    }

    fn terminate(&mut self) -> Result<()> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        // sudo and doas relay SIGTERM to virtiofsd
        kill_process(Pid::from_child(&self.child), Signal::TERM)?;
        let deadline = Instant::now() + TERM_GRACE;
        while Instant::now() < deadline {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(READY_POLL);
        }
        tracing::warn!("virtiofsd ignored SIGTERM, killing it");
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for SharedFolder {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            tracing::warn!("Failed to stop virtiofsd: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::host::IdMapEntry;
    use crate::testutil::{bin_dir, fake_context, write_script};

    /// A helper that records its pid, creates its socket and idles.
    pub(crate) fn helper_stub(dir: &Utf8Path, pidfile: &Utf8Path) -> Utf8PathBuf {
        write_script(
            dir,
            "virtiofsd",
            &format!(
                r#"
case "$1" in --version) echo "virtiofsd backend 1.10.1"; exit 0 ;; esac
while [ $# -gt 0 ]; do
    case "$1" in --socket-path) sock="$2"; shift ;; esac
    shift
done
echo $$ > {pidfile}
echo "listening on $sock"
: > "$sock"
exec sleep 600
"#
            ),
        )
    }

    /// Stub tools in `ctx`; returns the pid file the helper writes.
    pub(crate) fn stub_tools(ctx: &mut Context) -> Utf8PathBuf {
        let bin = bin_dir(ctx);
        let pidfile = bin.join("helper.pid");
        ctx.tools.elevate = Some(write_script(&bin, "sudo", r#"exec "$@""#));
        ctx.tools.virtiofsd = Some(helper_stub(&bin, &pidfile));
        pidfile
    }

    pub(crate) fn helper_alive(pidfile: &Utf8Path) -> bool {
        let pid: i32 = std::fs::read_to_string(pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    fn nested() -> IdMap {
        IdMap(vec![IdMapEntry {
            inside: 0,
            outside: 100000,
            count: 65536,
        }])
    }

    #[test]
    fn test_flavor() {
        assert_eq!(
            Flavor::from_version_output("virtiofsd version 7.2.0\n"),
            Flavor::Legacy
        );
        assert_eq!(
            Flavor::from_version_output("virtiofsd backend 1.10.1\n"),
            Flavor::Rust
        );
    }

    #[test]
    fn test_helper_args() {
        let id = IdMap::identity();
        let legacy = helper_args(
            Flavor::Legacy,
            Utf8Path::new("/vm/shared"),
            Utf8Path::new("/tmp/x/vfsd.sock"),
            "users",
            &id,
            &id,
        );
        similar_asserts::assert_eq!(
            legacy,
            [
                "--socket-group=users",
                "--socket-path=/tmp/x/vfsd.sock",
                "-o",
                "cache=always",
                "-o",
                "source=/vm/shared",
            ]
        );
        let rust = helper_args(
            Flavor::Rust,
            Utf8Path::new("/vm/shared"),
            Utf8Path::new("/tmp/x/vfsd.sock"),
            "users",
            &id,
            &id,
        );
        similar_asserts::assert_eq!(
            rust,
            [
                "--cache",
                "always",
                "--shared-dir",
                "/vm/shared",
                "--socket-group",
                "users",
                "--socket-path",
                "/tmp/x/vfsd.sock",
            ]
        );
    }

    #[test]
    fn test_nested_translation() {
        let args = helper_args(
            Flavor::Rust,
            Utf8Path::new("/s"),
            Utf8Path::new("/t"),
            "g",
            &nested(),
            &nested(),
        );
        assert_eq!(
            args[8..],
            [
                "--translate-uid",
                "map:100000:0:65536",
                "--translate-gid",
                "map:100000:0:65536"
            ]
        );
    }

    #[test]
    fn test_helper_candidates() {
        let c = helper_candidates(Utf8Path::new("/opt/qemu/bin/qemu-system-x86_64"));
        let c: Vec<&str> = c.iter().map(|p| p.as_str()).collect();
        assert_eq!(
            c,
            [
                "/opt/qemu/bin/tools/virtiofsd/virtiofsd",
                "/usr/lib/virtiofsd",
                "/opt/qemu/libexec/virtiofsd",
                "/opt/qemu/lib/qemu/virtiofsd",
                "/usr/libexec/virtiofsd",
            ]
        );
    }

    #[test]
    fn test_overrides() {
        let td = tempfile::tempdir().unwrap();
        let mut ctx = fake_context(td.path());
        stub_tools(&mut ctx);
        let pre = Preflight::check(&ctx, Utf8Path::new("/usr/bin/qemu-system-x86_64")).unwrap();
        assert_eq!(Some(pre.elevate), ctx.tools.elevate);
        assert_eq!(Some(pre.helper), ctx.tools.virtiofsd);
    }

    #[test]
    fn test_start_and_drop_cleans_up() {
        let td = tempfile::tempdir().unwrap();
        let mut ctx = fake_context(td.path());
        let pidfile = stub_tools(&mut ctx);
        let pre = Preflight::check(&ctx, Utf8Path::new("/usr/bin/qemu-system-x86_64")).unwrap();
        let vm_dir = ctx.base.join("x86_64/arch");
        let log = vm_dir.join("vfsd.log");
        std::fs::create_dir_all(&vm_dir).unwrap();

        let signals = ForegroundSignals::install().unwrap();
        let mut folder =
            SharedFolder::start(&ctx, &pre, &vm_dir.join("shared"), &log, &signals).unwrap();
        let sockdir = folder.socket().parent().unwrap().to_owned();
        assert!(folder.socket().exists());
        assert!(vm_dir.join("shared").is_dir());
        assert!(helper_alive(&pidfile));
        assert!(folder.exit_status().is_none());
        let err = folder.explain_failure(eyre!("qemu failed"));
        assert!(err.downcast_ref::<VmmError>().is_none());

        drop(folder);
        assert!(!sockdir.exists());
        assert!(!helper_alive(&pidfile));
        let log = std::fs::read_to_string(&log).unwrap();
        assert!(log.contains("listening on"));
    }

    #[test]
    fn test_helper_dies_early() {
        let td = tempfile::tempdir().unwrap();
        let mut ctx = fake_context(td.path());
        stub_tools(&mut ctx);
        ctx.tools.virtiofsd = Some(write_script(
            &bin_dir(&ctx),
            "virtiofsd-broken",
            r#"[ "$1" = --version ] && exit 0; echo "fuse: bad mount point" >&2; exit 1"#,
        ));
        let pre = Preflight::check(&ctx, Utf8Path::new("/usr/bin/qemu-system-x86_64")).unwrap();
        let log = ctx.base.join("vfsd.log");
        let signals = ForegroundSignals::install().unwrap();
        let err =
            SharedFolder::start(&ctx, &pre, &ctx.base.join("shared"), &log, &signals).unwrap_err();
        let msg = format!("{err:?}");
        assert!(msg.contains("fuse: bad mount point"), "{msg}");
    }

    #[test]
    fn test_explain_failure_with_dead_helper() {
        let td = tempfile::tempdir().unwrap();
        let mut ctx = fake_context(td.path());
        let pidfile = stub_tools(&mut ctx);
        let pre = Preflight::check(&ctx, Utf8Path::new("/usr/bin/qemu-system-x86_64")).unwrap();
        let log = ctx.base.join("vfsd.log");
        let signals = ForegroundSignals::install().unwrap();
        let mut folder =
            SharedFolder::start(&ctx, &pre, &ctx.base.join("shared"), &log, &signals).unwrap();

        let pid: i32 = std::fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while folder.exit_status().is_none() && Instant::now() < deadline {
            std::thread::sleep(READY_POLL);
        }
        let err = folder.explain_failure(eyre!("qemu failed"));
        match err.downcast_ref::<VmmError>() {
            Some(VmmError::HelperDied { log, .. }) => assert!(log.contains("listening on")),
            o => panic!("unexpected error {o:?}"),
        }
    }

    #[test]
    fn test_signal_while_waiting_cleans_up() {
        let td = tempfile::tempdir().unwrap();
        let mut ctx = fake_context(td.path());
        let pidfile = stub_tools(&mut ctx);
        // Never creates its socket
        ctx.tools.virtiofsd = Some(write_script(
            &bin_dir(&ctx),
            "virtiofsd-stuck",
            &format!(
                r#"
case "$1" in --version) echo "virtiofsd backend 1.10.1"; exit 0 ;; esac
while [ $# -gt 0 ]; do
    case "$1" in --socket-path) sock="$2"; shift ;; esac
    shift
done
echo "waiting on $sock"
echo $$ > {pidfile}
exec sleep 600
"#
            ),
        ));
        let pre = Preflight::check(&ctx, Utf8Path::new("/usr/bin/qemu-system-x86_64")).unwrap();
        let log = ctx.base.join("vfsd.log");

        let signals = ForegroundSignals::install().unwrap();
        let started = pidfile.clone();
        let sender = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !started.exists() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
        });
        let err = SharedFolder::start(&ctx, &pre, &ctx.base.join("shared"), &log, &signals)
            .unwrap_err();
        sender.join().unwrap();
        assert!(err.to_string().contains("SIGTERM"), "{err}");

        let log = std::fs::read_to_string(&log).unwrap();
        let socket = log
            .lines()
            .find_map(|l| l.strip_prefix("waiting on "))
            .unwrap();
        assert!(!Utf8Path::new(socket).parent().unwrap().exists());
        assert!(!helper_alive(&pidfile));
    }
}
