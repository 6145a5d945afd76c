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

//! Kernel interface (§4.A): the very first thing PID 1 does. Mounts the
//! pseudo-filesystems everything else in this runtime assumes are
//! present, then hands back `Mount` guards the root-mount orchestrator
//! later move-mounts into the new root (§4.J). Any failure here is
//! fatal-init (§7): there is no meaningful recovery from a missing
//! `/proc` or `/sys`.

use crate::blockdev::Mount;
use anyhow::{Context, Result};
use nix::mount::MsFlags;
use std::fs;
use std::path::Path;

/// The pseudo-filesystems this runtime needs before anything else can
/// run: uevents need `/sys`, module loading and LUKS/LVM need `/dev`,
/// cmdline parsing needs `/proc`, and the image's writable scratch space
/// (resolv.conf, mtab) needs `/run`.
pub struct PseudoFilesystems {
    pub proc: Mount,
    pub sys: Mount,
    pub dev: Mount,
    pub run: Mount,
}

/// Mounts `/proc`, `/sys`, `/dev`, `/run` in that order. Each mountpoint
/// is created if missing. A failure at any step is fatal-init (§7): the
/// caller should log and halt rather than attempt to continue with a
/// partially-initialized kernel interface.
pub fn bootstrap() -> Result<PseudoFilesystems> {
    let proc = mount_one("/proc", "proc", "proc", MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV, None)?;
    let sys = mount_one("/sys", "sysfs", "sysfs", MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV, None)?;
    let dev = mount_one(
        "/dev",
        "devtmpfs",
        "devtmpfs",
        MsFlags::MS_NOSUID,
        Some("mode=0755"),
    )?;
    let run = mount_one(
        "/run",
        "tmpfs",
        "tmpfs",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=0755"),
    )?;
    Ok(PseudoFilesystems { proc, sys, dev, run })
}

fn mount_one(target: &str, device: &str, fstype: &str, flags: MsFlags, data: Option<&str>) -> Result<Mount> {
    let path = Path::new(target);
    fs::create_dir_all(path).with_context(|| format!("creating mountpoint {}", target))?;
    let mount = Mount::mount(device, path, fstype, flags, data)
        .with_context(|| format!("mounting {} at {}", fstype, target))?;
    log::debug!("mounted {} at {}", fstype, target);
    Ok(mount)
}

#[cfg(test)]
mod tests {
    // bootstrap() requires real mount(2) privileges and a kernel-provided
    // /sys, /proc, /dev — not exercisable in a unit test sandbox. The
    // integration test suite (out of scope, §1) covers this end to end;
    // mount_one's error-context wiring is otherwise a thin wrapper over
    // blockdev::Mount, which carries its own tests.
}
