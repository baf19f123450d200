//! Fixtures shared by unit tests.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};

use crate::arch::Arch;
use crate::config::{Context, Tools};
use crate::host::{HostInfo, IdMap};

/// An x86_64 host with 8 CPUs, 16 GiB and no KVM, rooted at `dir`.
pub(crate) fn fake_context(dir: &Path) -> Context {
    let dir = Utf8Path::from_path(dir).unwrap();
    let base = dir.join("vm");
    let firmware_root = dir.join("share");
    let ssh_dir = dir.join("ssh");
    let bin = dir.join("bin");
    for d in [&base, &firmware_root, &ssh_dir, &bin] {
        std::fs::create_dir_all(d).unwrap();
    }
    Context {
        base,
        firmware_root,
        display_available: false,
        ssh_dir: Some(ssh_dir),
        tools: Tools::default(),
        host: HostInfo {
            arch: Some(Arch::X86_64),
            cpus: 8,
            mem_bytes: 16 << 30,
            kvm_accessible: false,
            uid_map: IdMap::identity(),
            gid_map: IdMap::identity(),
        },
    }
}

/// Directory stub programs are written to.
pub(crate) fn bin_dir(ctx: &Context) -> Utf8PathBuf {
    ctx.base.parent().unwrap().join("bin")
}

/// Write an executable `/bin/sh` script.
pub(crate) fn write_script(dir: &Utf8Path, name: &str, body: &str) -> Utf8PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Populate a fake `/usr/share` with the first firmware candidates of every architecture.
pub(crate) fn install_firmware(ctx: &Context) {
    use crate::arch::VarsStore;
    use strum::IntoEnumIterator;

    for arch in Arch::iter() {
        let layout = arch.firmware();
        let mut files = vec![layout.code[0]];
        if let VarsStore::Template(vars) = layout.vars {
            files.push(vars[0]);
        }
        for rel in files {
            let path = ctx.firmware_path(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, format!("{arch} {rel}").repeat(64)).unwrap();
        }
    }
}
