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

//! Block info probe (§4.B): reads a bounded window from a block device
//! and classifies it by matching a fixed table of magic-byte signatures,
//! in priority order. Never mutates the device.

use crate::io::PeekReader;
use crate::state::BlockFormat;
use anyhow::{Context, Result};
use std::io::{Read, Seek, SeekFrom};

/// Upper bound on how much of the device this probe ever reads (§4.B).
pub const PROBE_WINDOW: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub format: BlockFormat,
    pub uuid: Option<Vec<u8>>,
    pub label: Option<String>,
}

fn empty() -> Classification {
    Classification {
        format: BlockFormat::Empty,
        uuid: None,
        label: None,
    }
}

/// Classifies a device given a reader positioned at its start. Reads at
/// most `PROBE_WINDOW` bytes plus the small out-of-window probes this
/// format table requires (btrfs's 64 KiB superblock).
pub fn classify<R: Read + Seek>(dev: &mut R) -> Result<Classification> {
    let mut reader = PeekReader::with_capacity(PROBE_WINDOW, &mut *dev);
    let head = reader.peek(PROBE_WINDOW).context("reading probe window")?;

    if let Some(c) = probe_luks(head) {
        return Ok(c);
    }
    if let Some(c) = probe_ext4(head) {
        return Ok(c);
    }
    if let Some(c) = probe_xfs(head) {
        return Ok(c);
    }
    if let Some(c) = probe_f2fs(head) {
        return Ok(c);
    }
    // btrfs's superblock lives at a fixed 64KiB offset, outside the
    // probe window read above if the window is smaller; seek for it.
    if let Some(c) = probe_btrfs(dev)? {
        return Ok(c);
    }
    if let Some(c) = probe_gpt(head) {
        return Ok(c);
    }
    if let Some(c) = probe_mbr(head) {
        return Ok(c);
    }
    Ok(empty())
}

fn probe_luks(head: &[u8]) -> Option<Classification> {
    const MAGIC: &[u8] = b"LUKS\xba\xbe";
    if head.len() < 8 || &head[0..6] != MAGIC {
        return None;
    }
    let version = u16::from_be_bytes([head[6], head[7]]);
    let format = match version {
        1 => BlockFormat::Luks1,
        2 => BlockFormat::Luks2,
        _ => return None,
    };
    // LUKS1 keeps its UUID as an ASCII string at a fixed header offset;
    // LUKS2's UUID lives in the JSON metadata area and is extracted by
    // luks.rs once the header is fully parsed, not here.
    let uuid = if format == BlockFormat::Luks1 && head.len() >= 168 + 40 {
        ascii_uuid_to_bytes(&head[168..168 + 40])
    } else {
        None
    };
    Some(Classification {
        format,
        uuid,
        label: None,
    })
}

fn probe_ext4(head: &[u8]) -> Option<Classification> {
    const SB_OFFSET: usize = 1024;
    const MAGIC_OFFSET: usize = SB_OFFSET + 56; // s_magic at offset 56 into the superblock
    if head.len() < MAGIC_OFFSET + 2 {
        return None;
    }
    if u16::from_le_bytes([head[MAGIC_OFFSET], head[MAGIC_OFFSET + 1]]) != 0xEF53 {
        return None;
    }
    let uuid = head
        .get(SB_OFFSET + 0x68..SB_OFFSET + 0x68 + 16)
        .map(|b| b.to_vec());
    let label = head
        .get(SB_OFFSET + 0x78..SB_OFFSET + 0x78 + 16)
        .map(|b| cstr_to_string(b));
    Some(Classification {
        format: BlockFormat::Ext4,
        uuid,
        label,
    })
}

fn probe_xfs(head: &[u8]) -> Option<Classification> {
    if head.len() < 4 || &head[0..4] != b"XFSB" {
        return None;
    }
    let uuid = head.get(32..48).map(|b| b.to_vec());
    let label = head.get(108..108 + 12).map(|b| cstr_to_string(b));
    Some(Classification {
        format: BlockFormat::Xfs,
        uuid,
        label,
    })
}

fn probe_f2fs(head: &[u8]) -> Option<Classification> {
    const OFFSET: usize = 1024;
    if head.len() < OFFSET + 4 {
        return None;
    }
    if u32::from_le_bytes([
        head[OFFSET],
        head[OFFSET + 1],
        head[OFFSET + 2],
        head[OFFSET + 3],
    ]) != 0xF2F5_2010
    {
        return None;
    }
    let uuid = head.get(OFFSET + 108..OFFSET + 108 + 16).map(|b| b.to_vec());
    let label = head
        .get(OFFSET + 0xF0..OFFSET + 0xF0 + 512)
        .map(|b| utf16le_to_string(b));
    Some(Classification {
        format: BlockFormat::F2fs,
        uuid,
        label,
    })
}

fn probe_btrfs<R: Read + Seek>(dev: &mut R) -> Result<Option<Classification>> {
    const SB_OFFSET: u64 = 64 * 1024;
    let mut buf = [0u8; 0x48];
    dev.seek(SeekFrom::Start(SB_OFFSET))
        .context("seeking to btrfs superblock")?;
    if dev.read_exact(&mut buf).is_err() {
        return Ok(None);
    }
    if &buf[0x40..0x48] != b"_BHRfS_M" {
        return Ok(None);
    }
    // The label field sits at 0x12b and is 0x100 bytes wide, well past
    // the 0x123-byte window that covers only the fixed superblock header;
    // the buffer must reach 0x12b + 0x100 or every label reads as empty.
    const LABEL_OFFSET: usize = 0x12b;
    const LABEL_LEN: usize = 0x100;
    let mut full = vec![0u8; LABEL_OFFSET + LABEL_LEN];
    dev.seek(SeekFrom::Start(SB_OFFSET))
        .context("re-seeking to btrfs superblock")?;
    dev.read_exact(&mut full)
        .context("reading btrfs superblock")?;
    let uuid = full.get(32..48).map(|b| b.to_vec());
    let label = full
        .get(LABEL_OFFSET..LABEL_OFFSET + LABEL_LEN)
        .map(|b| cstr_to_string(b));
    Ok(Some(Classification {
        format: BlockFormat::Btrfs,
        uuid,
        label,
    }))
}

fn probe_gpt(head: &[u8]) -> Option<Classification> {
    const OFFSET: usize = 512;
    if head.len() < OFFSET + 8 || &head[OFFSET..OFFSET + 8] != b"EFI PART" {
        return None;
    }
    Some(Classification {
        format: BlockFormat::Gpt,
        uuid: None,
        label: None,
    })
}

fn probe_mbr(head: &[u8]) -> Option<Classification> {
    if head.len() < 512 || u16::from_le_bytes([head[510], head[511]]) != 0xAA55 {
        return None;
    }
    // 4-byte disk signature at offset 440 (§4.B).
    let uuid = head.get(440..444).map(|b| b.to_vec());
    Some(Classification {
        format: BlockFormat::Mbr,
        uuid,
        label: None,
    })
}

fn cstr_to_string(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

fn utf16le_to_string(b: &[u8]) -> String {
    let units: Vec<u16> = b
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&c| c != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn ascii_uuid_to_bytes(ascii: &[u8]) -> Option<Vec<u8>> {
    let s = std::str::from_utf8(ascii).ok()?;
    let s = s.trim_end_matches('\0');
    let hex: String = s.chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 {
        return None;
    }
    hex::decode(hex).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn classifies_luks1() {
        let mut buf = vec![0u8; 512];
        buf[0..6].copy_from_slice(b"LUKS\xba\xbe");
        buf[6..8].copy_from_slice(&1u16.to_be_bytes());
        let mut c = Cursor::new(buf);
        let classification = classify(&mut c).unwrap();
        assert_eq!(classification.format, BlockFormat::Luks1);
    }

    #[test]
    fn classifies_luks2() {
        let mut buf = vec![0u8; 512];
        buf[0..6].copy_from_slice(b"LUKS\xba\xbe");
        buf[6..8].copy_from_slice(&2u16.to_be_bytes());
        let mut c = Cursor::new(buf);
        let classification = classify(&mut c).unwrap();
        assert_eq!(classification.format, BlockFormat::Luks2);
    }

    #[test]
    fn classifies_ext4() {
        let mut buf = vec![0u8; 2048];
        buf[1080..1082].copy_from_slice(&0xEF53u16.to_le_bytes());
        buf[1024 + 0x68..1024 + 0x68 + 16].copy_from_slice(&[0xAB; 16]);
        let mut c = Cursor::new(buf);
        let classification = classify(&mut c).unwrap();
        assert_eq!(classification.format, BlockFormat::Ext4);
        assert_eq!(classification.uuid, Some(vec![0xAB; 16]));
    }

    #[test]
    fn classifies_xfs() {
        let mut buf = vec![0u8; 512];
        buf[0..4].copy_from_slice(b"XFSB");
        let mut c = Cursor::new(buf);
        assert_eq!(classify(&mut c).unwrap().format, BlockFormat::Xfs);
    }

    #[test]
    fn classifies_btrfs_with_label() {
        const SB_OFFSET: usize = 64 * 1024;
        let mut buf = vec![0u8; SB_OFFSET + 0x12b + 0x100];
        buf[SB_OFFSET + 0x40..SB_OFFSET + 0x48].copy_from_slice(b"_BHRfS_M");
        buf[SB_OFFSET + 32..SB_OFFSET + 48].copy_from_slice(&[0xCD; 16]);
        let label = b"my-root";
        buf[SB_OFFSET + 0x12b..SB_OFFSET + 0x12b + label.len()].copy_from_slice(label);
        let mut c = Cursor::new(buf);
        let classification = classify(&mut c).unwrap();
        assert_eq!(classification.format, BlockFormat::Btrfs);
        assert_eq!(classification.uuid, Some(vec![0xCD; 16]));
        assert_eq!(classification.label, Some("my-root".to_string()));
    }

    #[test]
    fn classifies_gpt() {
        let mut buf = vec![0u8; 1024];
        buf[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());
        buf[512..520].copy_from_slice(b"EFI PART");
        let mut c = Cursor::new(buf);
        assert_eq!(classify(&mut c).unwrap().format, BlockFormat::Gpt);
    }

    #[test]
    fn classifies_mbr_when_no_gpt() {
        let mut buf = vec![0u8; 512];
        buf[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());
        buf[440..444].copy_from_slice(&[1, 2, 3, 4]);
        let mut c = Cursor::new(buf);
        let classification = classify(&mut c).unwrap();
        assert_eq!(classification.format, BlockFormat::Mbr);
        assert_eq!(classification.uuid, Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn unrecognized_is_empty() {
        let buf = vec![0u8; 2048];
        let mut c = Cursor::new(buf);
        assert_eq!(classify(&mut c).unwrap().format, BlockFormat::Empty);
    }
}
