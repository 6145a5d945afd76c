// Copyright 2019 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Root mount orchestrator (§4.J): computes the `RequiredDevice` set from
//! the parsed kernel cmdline, arms the mount timeout, mounts the root
//! filesystem once every dependency resolves, and performs switch-root.
//! This is where most of the other components' results converge, the
//! way `install.rs`'s `install()` is the teacher's own top-level
//! convergence point for disk layout, Ignition, and network config.

use crate::blockdev::Mount;
use crate::cmdline::{ParsedCmdline, RootSpec};
use crate::config::Config;
use crate::kernel::PseudoFilesystems;
use crate::state::{RequiredDevice, RequiredDeviceId, RequiredPurpose};
use anyhow::{Context, Result};
use nix::mount::MsFlags;
use nix::unistd::{chdir, chroot};
use std::ffi::CString;
use std::path::Path;

pub const NEW_ROOT: &str = "/new_root";

/// Builds the set of devices that must resolve before switch-root can
/// happen: the root device itself, plus one `CryptoSource` entry per
/// `rd.luks.uuid=` (§3, §4.J, I1).
pub fn required_devices(cmdline: &ParsedCmdline) -> Vec<RequiredDevice> {
    let mut required = Vec::new();
    if let Some(root) = &cmdline.root {
        let id = match root {
            RootSpec::Uuid(u) => RequiredDeviceId::Uuid(u.clone()),
            RootSpec::Label(l) => RequiredDeviceId::Label(l.clone()),
            RootSpec::Path(p) => RequiredDeviceId::Path(p.clone()),
        };
        required.push(RequiredDevice {
            id,
            purpose: RequiredPurpose::Root,
            mount_options: cmdline.effective_rootflags(),
        });
    }
    for luks in &cmdline.luks {
        required.push(RequiredDevice {
            id: RequiredDeviceId::Uuid(luks.uuid.clone()),
            purpose: RequiredPurpose::CryptoSource,
            mount_options: Vec::new(),
        });
    }
    required
}

/// Resolves which on-disk fstype to request from `mount(2)` for a given
/// `BlockFormat`. LUKS/GPT/MBR/Empty are never mount targets themselves —
/// callers only reach this once a device has already classified as a
/// real filesystem.
pub fn fstype_name(format: crate::state::BlockFormat) -> Option<&'static str> {
    use crate::state::BlockFormat::*;
    match format {
        Ext4 => Some("ext4"),
        Btrfs => Some("btrfs"),
        Xfs => Some("xfs"),
        F2fs => Some("f2fs"),
        _ => None,
    }
}

/// Mounts `device` at `/new_root` with `fstype` and the effective
/// rootflags (§4.J). `rw`/`ro` is folded into `MsFlags::MS_RDONLY` by the
/// caller reading `"ro"` out of `options` — the flag list otherwise
/// passes straight through as the mount's `data` string.
pub fn mount_root(device: &str, fstype: &str, options: &[String]) -> Result<Mount> {
    std::fs::create_dir_all(NEW_ROOT).context("creating /new_root")?;
    let mut flags = MsFlags::empty();
    let mut data_opts = Vec::new();
    for opt in options {
        match opt.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => {}
            other => data_opts.push(other.to_string()),
        }
    }
    let data = if data_opts.is_empty() {
        None
    } else {
        Some(data_opts.join(","))
    };
    Mount::mount(device, Path::new(NEW_ROOT), fstype, flags, data.as_deref())
        .with_context(|| format!("mounting {} ({}) at {}", device, fstype, NEW_ROOT))
}

/// Move-mounts each pseudo-filesystem into the new root, chroots, and
/// `execve`s the real init (§4.J). Never returns on success — the
/// process image becomes `init_path`. The final `Switching to the new
/// userspace now` log line fires immediately before the `execve`, per
/// spec.
pub fn switch_root(pseudo: PseudoFilesystems, init_path: &str) -> Result<()> {
    let new_root = Path::new(NEW_ROOT);
    move_mount_into(pseudo.proc, new_root, "proc")?;
    move_mount_into(pseudo.sys, new_root, "sys")?;
    move_mount_into(pseudo.dev, new_root, "dev")?;
    move_mount_into(pseudo.run, new_root, "run")?;

    chdir(new_root).context("chdir into new root")?;
    nix::mount::mount(Some("."), "/", None::<&str>, MsFlags::MS_MOVE, None::<&str>)
        .context("moving new root to /")?;
    chroot(".").context("chroot into new root")?;
    chdir("/").context("chdir to / after chroot")?;

    log::info!("Switching to the new userspace now");

    let path = CString::new(init_path).context("init path contains a NUL byte")?;
    let argv = [path.as_ptr(), std::ptr::null()];
    // PID 1 must keep its environment; the kernel already set up a
    // minimal one. execv (not execve with a fresh envp) preserves it.
    unsafe {
        libc::execv(path.as_ptr(), argv.as_ptr());
    }
    Err(std::io::Error::last_os_error()).context(format!("execv of {} failed", init_path))
}

fn move_mount_into(mount: Mount, new_root: &Path, name: &str) -> Result<()> {
    let target = new_root.join(name);
    std::fs::create_dir_all(&target).with_context(|| format!("creating {}", target.display()))?;
    nix::mount::mount(
        Some(mount.mountpoint()),
        &target,
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .with_context(|| format!("move-mounting {} to {}", mount.mountpoint().display(), target.display()))?;
    // The source mount now lives at `target`; this process has no further
    // responsibility for unmounting the old mountpoint.
    mount.forget();
    Ok(())
}

/// Applies `Config::mount_timeout` and cmdline debug-mode detail (§6,
/// SPEC_FULL §11): logs the full resolved/pending `RequiredDevice` sets
/// when `booster.debug` is set, regardless of outcome.
pub fn log_debug_snapshot(debug: bool, required: &crate::state::RequiredDeviceSet, elapsed: std::time::Duration) {
    if !debug {
        return;
    }
    log::debug!("resolved required devices: {:?}", required.resolved_snapshot());
    log::debug!("pending required devices: {:?}", required.pending_snapshot());
    log::debug!("elapsed waiting for root: {:?}", elapsed);
}

pub const TIMEOUT_MESSAGE: &str = "Timeout waiting for root filesystem";

/// Arms `config.mount_timeout` against `required`. Returns `Ok(())` on
/// full resolution; on timeout, logs the spec-mandated message and
/// returns an error the caller should treat as a fatal exit (§4.J, §7
/// device-absent-timeout).
pub fn wait_for_required_devices(
    required: &crate::state::RequiredDeviceSet,
    config: &Config,
) -> Result<()> {
    let start = std::time::Instant::now();
    let resolved = required.wait_all(config.mount_timeout.as_duration());
    log_debug_snapshot(true, required, start.elapsed());
    if resolved {
        Ok(())
    } else {
        log::error!("{}", TIMEOUT_MESSAGE);
        anyhow::bail!(TIMEOUT_MESSAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdline::ParsedCmdline;

    #[test]
    fn required_devices_from_root_and_luks() {
        let cmdline = ParsedCmdline::parse(
            "root=UUID=7bbf9363-eb42-4476-8c1c-9f1f4d091385 rd.luks.uuid=639b8fdd-36ba-443e-be3e-e5b335935502",
        );
        let required = required_devices(&cmdline);
        assert_eq!(required.len(), 2);
        assert!(required
            .iter()
            .any(|r| r.purpose == RequiredPurpose::Root && r.id == RequiredDeviceId::Uuid("7bbf9363-eb42-4476-8c1c-9f1f4d091385".into())));
        assert!(required
            .iter()
            .any(|r| r.purpose == RequiredPurpose::CryptoSource));
    }

    #[test]
    fn required_devices_empty_without_root() {
        let cmdline = ParsedCmdline::parse("");
        assert!(required_devices(&cmdline).is_empty());
    }

    #[test]
    fn fstype_name_maps_known_formats() {
        assert_eq!(fstype_name(crate::state::BlockFormat::Ext4), Some("ext4"));
        assert_eq!(fstype_name(crate::state::BlockFormat::Luks2), None);
    }
}
