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

//! Low-level block device primitives: the ioctls for size/sector-size
//! queries, and a small owned-mount guard. No `lsblk`/`kpartx`/`udevadm`
//! shell-outs here (unlike the teacher's `Disk`/`Partition` machinery) —
//! PID 1 runs before any of those binaries exist in the image, so every
//! classification this runtime needs comes from `probe.rs` reading raw
//! bytes, never from shelling out to userland tools.

use anyhow::{Context, Result};
use nix::mount::{self, MsFlags};
use std::fs::{File, OpenOptions};
use std::num::NonZeroU32;
use std::os::raw::c_int;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

mod ioctl {
    use super::c_int;
    use nix::{ioctl_none, ioctl_read, ioctl_read_bad, request_code_none};

    ioctl_none!(blkrrpart, 0x12, 95);
    ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), c_int);
    ioctl_read!(blkgetsize64, 0x12, 114, libc::size_t);
}

/// Re-reads the partition table of a whole-disk device node.
pub fn reread_partition_table(disk: &File) -> Result<()> {
    unsafe { ioctl::blkrrpart(disk.as_raw_fd()) }.context("re-reading partition table")?;
    Ok(())
}

/// Logical sector size of the device, via `BLKSSZGET`.
pub fn sector_size(dev: &File) -> Result<NonZeroU32> {
    let mut size: c_int = 0;
    unsafe { ioctl::blksszget(dev.as_raw_fd(), &mut size) }.context("getting sector size")?;
    NonZeroU32::new(size as u32).context("kernel reported a zero sector size")
}

/// Size of the device in bytes, via `BLKGETSIZE64`.
pub fn device_size(dev: &File) -> Result<u64> {
    let mut size: libc::size_t = 0;
    unsafe { ioctl::blkgetsize64(dev.as_raw_fd(), &mut size) }.context("getting device size")?;
    Ok(size as u64)
}

/// Sniffs the sector size a formatted filesystem expects by looking for
/// known magic bytes at the 1024/2048/4096-offset superblock location;
/// used as a fallback when `BLKSSZGET` disagrees with the on-disk format.
pub fn detect_formatted_sector_size(buf: &[u8]) -> Option<NonZeroU32> {
    const MAGIC_OFFSETS: &[(usize, &[u8])] = &[
        (1080, &[0x53, 0xEF]),           // ext2/3/4 s_magic
        (0x40, b"_BHRfS_M"),             // btrfs magic (relative to 64KiB superblock start)
        (0, b"XFSB"),                   // xfs magic
    ];
    for &(offset, magic) in MAGIC_OFFSETS {
        if buf.len() >= offset + magic.len() && &buf[offset..offset + magic.len()] == magic {
            return NonZeroU32::new(512);
        }
    }
    None
}

pub fn open_blockdev(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(false)
        .open(path)
        .with_context(|| format!("opening block device {}", path.display()))
}

/// An owned mount, unmounted when dropped. Used for the final root mount
/// (§4.J) as well as the pseudo-filesystem mounts performed during
/// kernel-interface bootstrap (§4.A).
#[derive(Debug)]
pub struct Mount {
    device: String,
    mountpoint: PathBuf,
    owned: bool,
}

impl Mount {
    pub fn mount(
        device: &str,
        mountpoint: &Path,
        fstype: &str,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<Mount> {
        mount::mount(Some(device), mountpoint, Some(fstype), flags, data)
            .with_context(|| format!("mounting {} on {}", device, mountpoint.display()))?;
        Ok(Mount {
            device: device.to_string(),
            mountpoint: mountpoint.to_path_buf(),
            owned: true,
        })
    }

    /// Wraps an already-mounted filesystem without taking ownership of
    /// unmounting it (used for the pseudo-fs mounts that get
    /// move-mounted into the new root rather than unmounted, §4.J).
    pub fn adopt_unowned(device: &str, mountpoint: &Path) -> Mount {
        Mount {
            device: device.to_string(),
            mountpoint: mountpoint.to_path_buf(),
            owned: false,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Detaches this mount from the `Drop` unmount logic; used by
    /// switch-root once a pseudo-fs has been move-mounted into the new
    /// root and is no longer this process's to tear down.
    pub fn forget(mut self) {
        self.owned = false;
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if let Err(err) = mount::umount(&self.mountpoint) {
            log::warn!("unmounting {}: {}", self.mountpoint.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_ext4_magic() {
        let mut buf = vec![0u8; 2048];
        buf[1080] = 0x53;
        buf[1081] = 0xEF;
        assert!(detect_formatted_sector_size(&buf).is_some());
    }

    #[test]
    fn no_magic_no_match() {
        let buf = vec![0u8; 2048];
        assert!(detect_formatted_sector_size(&buf).is_none());
    }
}
