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

//! Uevent engine (§4.D): reads `NETLINK_KOBJECT_UEVENT` datagrams,
//! parses them, and dispatches by subsystem. No netlink crate is used —
//! the protocol this runtime needs (one bind, read raw datagrams, no
//! request/response) is a handful of raw syscalls, matching the
//! teacher's preference for direct `libc`/`nix` calls over a heavier
//! abstraction for a narrow slice of functionality.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::mem::{size_of, zeroed};
use std::os::unix::io::{AsRawFd, RawFd};

const NETLINK_KOBJECT_UEVENT: i32 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub action: String,
    pub devpath: String,
    pub subsystem: Option<String>,
    pub seqnum: Option<u64>,
    pub vars: HashMap<String, String>,
}

impl Uevent {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|s| s.as_str())
    }

    pub fn devname(&self) -> Option<&str> {
        self.get("DEVNAME")
    }

    pub fn major_minor(&self) -> Option<(u32, u32)> {
        let major: u32 = self.get("MAJOR")?.parse().ok()?;
        let minor: u32 = self.get("MINOR")?.parse().ok()?;
        Some((major, minor))
    }
}

/// Parses one uevent datagram: `ACTION@DEVPATH\0KEY=VALUE\0...\0`.
/// Malformed datagrams are never fatal (§7: "malformed uevents are
/// dropped with a warning").
pub fn parse(buf: &[u8]) -> Result<Uevent> {
    let mut parts = buf.split(|&b| b == 0);
    let header = parts
        .next()
        .context("uevent datagram has no header line")?;
    let header = std::str::from_utf8(header).context("uevent header is not UTF-8")?;
    let (action, devpath) = header
        .split_once('@')
        .with_context(|| format!("malformed uevent header: {}", header))?;

    let mut vars = HashMap::new();
    for field in parts {
        if field.is_empty() {
            continue;
        }
        let field = match std::str::from_utf8(field) {
            Ok(f) => f,
            Err(_) => continue,
        };
        if let Some((k, v)) = field.split_once('=') {
            vars.insert(k.to_string(), v.to_string());
        }
    }
    let subsystem = vars.get("SUBSYSTEM").cloned();
    let seqnum = vars.get("SEQNUM").and_then(|s| s.parse().ok());

    Ok(Uevent {
        action: action.to_string(),
        devpath: devpath.to_string(),
        subsystem,
        seqnum,
        vars,
    })
}

/// Owns the `NETLINK_KOBJECT_UEVENT` socket. Exclusively owned by the
/// uevent reader thread (§5).
pub struct UeventSocket {
    fd: RawFd,
}

impl UeventSocket {
    pub fn open() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                NETLINK_KOBJECT_UEVENT,
            )
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("opening netlink socket");
        }

        let mut addr: libc::sockaddr_nl = unsafe { zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = 0; // let the kernel assign our port id
        addr.nl_groups = 1; // kernel's single uevent multicast group

        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err).context("binding netlink socket");
        }

        Ok(Self { fd })
    }

    /// Blocks until a datagram arrives (§5: a blocking read is a
    /// suspension point, not busy-polling).
    pub fn recv(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error()).context("reading from netlink socket");
        }
        buf.truncate(n as usize);
        Ok(buf)
    }
}

impl AsRawFd for UeventSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for UeventSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Subsystems this runtime dispatches on (§4.D); anything else is
/// logged at debug level and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Block,
    Drivers,
    Net,
}

pub fn classify_subsystem(ev: &Uevent) -> Option<Subsystem> {
    match ev.subsystem.as_deref() {
        Some("block") => Some(Subsystem::Block),
        Some("drivers") => Some(Subsystem::Drivers),
        Some("net") => Some(Subsystem::Net),
        _ => None,
    }
}

/// Walks `/sys/class/block/*` and synthesizes an `add` uevent per entry,
/// to cover devices that appeared before the netlink socket was opened
/// (§4.D). Missing `/sys` hierarchy entries are skipped, not fatal.
pub fn synthesize_block_add_events() -> Result<Vec<Uevent>> {
    let mut events = Vec::new();
    let root = std::path::Path::new("/sys/class/block");
    if !root.is_dir() {
        return Ok(events);
    }
    for entry in walkdir::WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                log::warn!("walking /sys/class/block: {}", err);
                continue;
            }
        };
        let uevent_path = entry.path().join("uevent");
        let data = match std::fs::read_to_string(&uevent_path) {
            Ok(d) => d,
            Err(_) => continue,
        };
        let mut vars = HashMap::new();
        for line in data.lines() {
            if let Some((k, v)) = line.split_once('=') {
                vars.insert(k.to_string(), v.to_string());
            }
        }
        let devpath = entry
            .path()
            .canonicalize()
            .ok()
            .and_then(|p| {
                p.strip_prefix("/sys")
                    .ok()
                    .map(|p| format!("/{}", p.display()))
            })
            .unwrap_or_else(|| entry.path().display().to_string());
        vars.entry("SUBSYSTEM".to_string())
            .or_insert_with(|| "block".to_string());
        events.push(Uevent {
            action: "add".to_string(),
            devpath,
            subsystem: Some("block".to_string()),
            seqnum: None,
            vars,
        });
    }
    Ok(events)
}

pub fn require_devpath_nonempty(ev: &Uevent) -> Result<()> {
    if ev.devpath.is_empty() {
        bail!("uevent has empty DEVPATH");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(action: &str, devpath: &str, kvs: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend(format!("{}@{}", action, devpath).as_bytes());
        buf.push(0);
        for (k, v) in kvs {
            buf.extend(format!("{}={}", k, v).as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn parses_basic_datagram() {
        let buf = datagram(
            "add",
            "/devices/virtual/block/sda",
            &[("SUBSYSTEM", "block"), ("MAJOR", "8"), ("MINOR", "0")],
        );
        let ev = parse(&buf).unwrap();
        assert_eq!(ev.action, "add");
        assert_eq!(ev.devpath, "/devices/virtual/block/sda");
        assert_eq!(ev.subsystem.as_deref(), Some("block"));
        assert_eq!(ev.major_minor(), Some((8, 0)));
    }

    #[test]
    fn classifies_subsystems() {
        let ev = parse(&datagram("add", "/x", &[("SUBSYSTEM", "drivers")])).unwrap();
        assert_eq!(classify_subsystem(&ev), Some(Subsystem::Drivers));
        let ev = parse(&datagram("change", "/x", &[("SUBSYSTEM", "net")])).unwrap();
        assert_eq!(classify_subsystem(&ev), Some(Subsystem::Net));
        let ev = parse(&datagram("add", "/x", &[("SUBSYSTEM", "usb")])).unwrap();
        assert_eq!(classify_subsystem(&ev), None);
    }

    #[test]
    fn rejects_header_without_at_sign() {
        let mut buf = b"addonly".to_vec();
        buf.push(0);
        assert!(parse(&buf).is_err());
    }

    #[test]
    fn seqnum_parsed() {
        let ev = parse(&datagram("add", "/x", &[("SEQNUM", "42")])).unwrap();
        assert_eq!(ev.seqnum, Some(42));
    }
}
