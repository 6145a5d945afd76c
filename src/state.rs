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

//! Shared, process-wide data model (§3, §5): the `BlockDevice` arena, the
//! `ModuleState` table enforcing I2, and the `RequiredDevice` set
//! enforcing I1. Everything here is a plain `Arc<Mutex<_>>`/`Condvar`
//! structure — no async runtime, matching the teacher's fully
//! synchronous style; suspension points are real blocking syscalls or
//! condvar waits (§5).

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// (major, minor) kernel device identity.
pub type DevId = (u32, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFormat {
    Unclassified,
    Ext4,
    Btrfs,
    Xfs,
    F2fs,
    Luks1,
    Luks2,
    Gpt,
    Mbr,
    Empty,
}

#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub devid: DevId,
    pub devpath: String,
    pub format: BlockFormat,
    pub uuid: Option<Vec<u8>>,
    pub label: Option<String>,
    /// Parent device, for dm children stacked on a partition/LUKS/LVM
    /// volume; indices into the arena, never pointers (§9).
    pub parent: Option<DevId>,
}

impl BlockDevice {
    pub fn uuid_string(&self) -> Option<String> {
        self.uuid.as_ref().map(|bytes| match bytes.len() {
            16 => format_uuid16(bytes),
            _ => hex::encode(bytes),
        })
    }
}

fn format_uuid16(b: &[u8]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
    )
}

/// Arena of all block devices seen so far, keyed by (major, minor).
/// Mutated only by the uevent engine (§3).
#[derive(Default)]
pub struct BlockDeviceArena {
    devices: Mutex<HashMap<DevId, BlockDevice>>,
}

impl BlockDeviceArena {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, dev: BlockDevice) {
        let mut devices = self.devices.lock().expect("block device arena poisoned");
        devices.insert(dev.devid, dev);
    }

    pub fn remove(&self, id: DevId) {
        let mut devices = self.devices.lock().expect("block device arena poisoned");
        devices.remove(&id);
    }

    pub fn get(&self, id: DevId) -> Option<BlockDevice> {
        let devices = self.devices.lock().expect("block device arena poisoned");
        devices.get(&id).cloned()
    }

    pub fn find_by_uuid(&self, uuid: &str) -> Option<BlockDevice> {
        let devices = self.devices.lock().expect("block device arena poisoned");
        devices
            .values()
            .find(|d| d.uuid_string().as_deref() == Some(uuid))
            .cloned()
    }

    pub fn find_by_label(&self, label: &str) -> Option<BlockDevice> {
        let devices = self.devices.lock().expect("block device arena poisoned");
        devices
            .values()
            .find(|d| d.label.as_deref() == Some(label))
            .cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

struct ModuleEntry {
    state: LoadState,
}

/// Per-module load state with condvar-based waiters, enforcing I2: a
/// module name transitions not-loaded -> loading -> {loaded, failed}
/// exactly once (§3, §4.C).
#[derive(Default)]
pub struct ModuleTable {
    inner: Mutex<HashMap<String, ModuleEntry>>,
    cond: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// Caller won the CAS and must load the module.
    ShouldLoad,
    /// Another caller is already loading it; we waited for terminal state.
    AlreadyLoaded,
    AlreadyFailed,
}

impl ModuleTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attempts to claim the right to load `name`. Exactly one caller
    /// across the whole boot receives `ShouldLoad` for a given name;
    /// every other caller blocks until the winner finishes and then
    /// receives the terminal state (I2).
    pub fn claim(&self, name: &str) -> ClaimResult {
        let mut table = self.inner.lock().expect("module table poisoned");
        loop {
            match table.get(name).map(|e| e.state) {
                None => {
                    table.insert(
                        name.to_string(),
                        ModuleEntry {
                            state: LoadState::Loading,
                        },
                    );
                    return ClaimResult::ShouldLoad;
                }
                Some(LoadState::Loaded) => return ClaimResult::AlreadyLoaded,
                Some(LoadState::Failed) => return ClaimResult::AlreadyFailed,
                Some(LoadState::NotLoaded) => unreachable!("entries are only inserted as Loading"),
                Some(LoadState::Loading) => {
                    table = self.cond.wait(table).expect("module table poisoned");
                }
            }
        }
    }

    /// Called by the claim winner once `finit_module` returns.
    pub fn finish(&self, name: &str, success: bool) {
        let mut table = self.inner.lock().expect("module table poisoned");
        if let Some(entry) = table.get_mut(name) {
            entry.state = if success {
                LoadState::Loaded
            } else {
                LoadState::Failed
            };
        }
        self.cond.notify_all();
    }
}

/// One block device the root-mount orchestrator must see resolved
/// before switch-root (I1, §3, §4.J).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequiredDeviceId {
    Uuid(String),
    Label(String),
    Path(String),
    DmName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredPurpose {
    Root,
    Resume,
    CryptoSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredDevice {
    pub id: RequiredDeviceId,
    pub purpose: RequiredPurpose,
    pub mount_options: Vec<String>,
}

struct RequiredDeviceSetInner {
    pending: Vec<RequiredDevice>,
    resolved: Vec<RequiredDevice>,
}

/// Tracks the set of `RequiredDevice`s computed from the kernel cmdline
/// and signals `wait_all` once every one of them has resolved, or times
/// out — the mechanism behind I1.
pub struct RequiredDeviceSet {
    inner: Mutex<RequiredDeviceSetInner>,
    cond: Condvar,
}

impl RequiredDeviceSet {
    pub fn new(required: Vec<RequiredDevice>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RequiredDeviceSetInner {
                pending: required,
                resolved: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().expect("required device set poisoned");
        inner.pending.is_empty()
    }

    /// Marks `id` resolved. No-op if `id` isn't (or is no longer)
    /// pending.
    pub fn mark_resolved(&self, id: &RequiredDeviceId) {
        let mut inner = self.inner.lock().expect("required device set poisoned");
        if let Some(pos) = inner.pending.iter().position(|d| &d.id == id) {
            let dev = inner.pending.remove(pos);
            inner.resolved.push(dev);
        }
        if inner.pending.is_empty() {
            self.cond.notify_all();
        }
    }

    /// Blocks until every required device has resolved or `timeout`
    /// elapses. Returns `true` on full resolution, `false` on timeout.
    pub fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().expect("required device set poisoned");
        while !inner.pending.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .expect("required device set poisoned");
            inner = guard;
            if result.timed_out() && !inner.pending.is_empty() {
                return false;
            }
        }
        true
    }

    pub fn resolved_snapshot(&self) -> Vec<RequiredDevice> {
        let inner = self.inner.lock().expect("required device set poisoned");
        inner.resolved.clone()
    }

    pub fn pending_snapshot(&self) -> Vec<RequiredDevice> {
        let inner = self.inner.lock().expect("required device set poisoned");
        inner.pending.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn module_table_enforces_single_load() {
        let table = ModuleTable::new();
        assert_eq!(table.claim("ext4"), ClaimResult::ShouldLoad);

        let t2 = table.clone();
        let handle = thread::spawn(move || t2.claim("ext4"));
        // give the second thread a chance to block on Loading
        thread::sleep(Duration::from_millis(20));
        table.finish("ext4", true);
        assert_eq!(handle.join().unwrap(), ClaimResult::AlreadyLoaded);
    }

    #[test]
    fn module_table_reports_failure() {
        let table = ModuleTable::new();
        table.claim("badmod");
        table.finish("badmod", false);
        assert_eq!(table.claim("badmod"), ClaimResult::AlreadyFailed);
    }

    #[test]
    fn required_device_set_resolves() {
        let set = RequiredDeviceSet::new(vec![RequiredDevice {
            id: RequiredDeviceId::Uuid("abc".into()),
            purpose: RequiredPurpose::Root,
            mount_options: vec![],
        }]);
        assert!(!set.is_empty());
        set.mark_resolved(&RequiredDeviceId::Uuid("abc".into()));
        assert!(set.wait_all(Duration::from_millis(50)));
    }

    #[test]
    fn required_device_set_times_out() {
        let set = RequiredDeviceSet::new(vec![RequiredDevice {
            id: RequiredDeviceId::Uuid("missing".into()),
            purpose: RequiredPurpose::Root,
            mount_options: vec![],
        }]);
        assert!(!set.wait_all(Duration::from_millis(50)));
    }

    #[test]
    fn uuid_formatting() {
        let dev = BlockDevice {
            devid: (8, 1),
            devpath: "/dev/sda1".into(),
            format: BlockFormat::Ext4,
            uuid: Some(vec![
                0x5c, 0x92, 0xfc, 0x66, 0x73, 0x15, 0x40, 0x8b, 0xb6, 0x52, 0x17, 0x6d, 0xc5, 0x54,
                0xd3, 0x70,
            ]),
            label: None,
            parent: None,
        };
        assert_eq!(
            dev.uuid_string().unwrap(),
            "5c92fc66-7315-408b-b652-176dc554d370"
        );
    }
}
