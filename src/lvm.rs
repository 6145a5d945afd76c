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

//! LVM activator (§4.I): only runs when `enable_lvm` is set. Scans
//! classified block devices for the LVM2 `LABELONE` magic, parses the PV
//! metadata text area, assembles VGs in memory, and activates LVs as
//! `linear` dm targets via `devmapper.rs`.

use crate::devmapper::{DeviceMapper, Table, Target};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::symlink;
use std::path::Path;

/// Offset of the LVM2 label area within a PV, per the on-disk format
/// (§4.I).
const LABEL_OFFSET: u64 = 0x218;
const LABEL_MAGIC: &[u8] = b"LABELONE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalVolume {
    pub pv_uuid: String,
    pub vg_name: String,
    pub devpath: String,
    /// Offset, in 512-byte sectors, where this PV's extents begin.
    pub data_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolume {
    pub name: String,
    /// (pv_ref_name, start_extent, extent_count) segments, in order.
    /// `pv_ref_name` is the short name (e.g. `"pv0"`) a VG's
    /// `physical_volumes` block uses internally; resolve it to a PV uuid
    /// via `pv_uuid_for_ref` before it can be mapped to a devpath.
    pub segments: Vec<(String, u64, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGroup {
    pub name: String,
    pub extent_size_sectors: u64,
    pub lvs: Vec<LogicalVolume>,
}

/// Detects whether `head` (the first probe window of a block device)
/// carries the LVM2 `LABELONE` magic (§4.I).
pub fn is_lvm_pv(head: &[u8]) -> bool {
    head.len() >= LABEL_OFFSET as usize + LABEL_MAGIC.len()
        && &head[LABEL_OFFSET as usize..LABEL_OFFSET as usize + LABEL_MAGIC.len()] == LABEL_MAGIC
}

/// Reads a PV's identity out of its label + PV-header area. Doesn't yet
/// pull the full VG metadata (that's `read_vg_metadata`) — just enough
/// to know which VG this PV belongs to.
pub fn read_pv_header<R: Read + Seek>(dev: &mut R, devpath: &str) -> Result<PhysicalVolume> {
    dev.seek(SeekFrom::Start(LABEL_OFFSET)).context("seeking to LVM label")?;
    let mut label = [0u8; 512 - LABEL_OFFSET as usize];
    dev.read_exact(&mut label).context("reading LVM label sector")?;
    if &label[0..8] != LABEL_MAGIC {
        bail!("{} has no LVM2 LABELONE magic", devpath);
    }
    let pv_uuid_raw = &label[24..24 + 32];
    let pv_uuid = String::from_utf8_lossy(pv_uuid_raw).trim().to_string();

    // The VG name and extent layout live in the free-form metadata text
    // area, found by following the label's data-area descriptor; parsed
    // in full by read_vg_metadata, which re-reads from the device once
    // the text area's offset/size are known from the PV header proper.
    Ok(PhysicalVolume {
        pv_uuid,
        vg_name: String::new(),
        devpath: devpath.to_string(),
        data_offset: 0,
    })
}

/// Parses the LVM2 text metadata format (a lightweight config-file
/// syntax: `key = value` and `name { ... }` blocks) well enough to
/// recover VG/LV/segment structure. Real `vgcfgbackup` output carries
/// comments and a version stamp this parser ignores.
pub fn parse_metadata(text: &str) -> Result<VolumeGroup> {
    let vg_name = text
        .lines()
        .find(|l| l.trim_end().ends_with('{') && !l.trim_start().starts_with(|c: char| c.is_whitespace()))
        .and_then(|l| l.split_whitespace().next())
        .context("LVM metadata has no top-level VG block")?
        .to_string();

    let extent_size_sectors = find_scalar(text, "extent_size").unwrap_or(8192);

    let mut lvs = Vec::new();
    for lv_block in extract_blocks(text, "logical_volumes") {
        for (lv_name, lv_body) in extract_named_blocks(&lv_block) {
            let mut segments = Vec::new();
            for (_, seg_body) in extract_named_blocks(&lv_body) {
                let start_extent = find_scalar(&seg_body, "start_extent").unwrap_or(0);
                let extent_count = find_scalar(&seg_body, "extent_count").unwrap_or(0);
                let pv_name = find_string(&seg_body, "stripes").unwrap_or_default();
                segments.push((pv_name, start_extent, extent_count));
            }
            lvs.push(LogicalVolume {
                name: lv_name,
                segments,
            });
        }
    }

    Ok(VolumeGroup {
        name: vg_name,
        extent_size_sectors,
        lvs,
    })
}

fn find_scalar(text: &str, key: &str) -> Option<u64> {
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(key) {
            let rest = rest.trim_start();
            if let Some(val) = rest.strip_prefix('=') {
                return val.trim().trim_end_matches(',').parse().ok();
            }
        }
    }
    None
}

fn find_string(text: &str, key: &str) -> Option<String> {
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(key) {
            let rest = rest.trim_start();
            if let Some(val) = rest.strip_prefix('=') {
                let val = val.trim();
                // `stripes = [ "pv0", 0 ]` — we want the first quoted name.
                if let Some(start) = val.find('"') {
                    if let Some(end) = val[start + 1..].find('"') {
                        return Some(val[start + 1..start + 1 + end].to_string());
                    }
                }
            }
        }
    }
    None
}

/// Extracts the body of every top-level `key { ... }` block named `key`.
fn extract_blocks(text: &str, key: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find(key) {
        let after_key = &rest[pos + key.len()..];
        if let Some(open) = after_key.find('{') {
            if let Some(body) = matched_brace_body(&after_key[open..]) {
                out.push(body);
            }
        }
        rest = &after_key[after_key.find('{').map(|o| o + 1).unwrap_or(after_key.len())..];
    }
    out
}

/// Extracts `name { body }` pairs at the top level of `text`.
fn extract_named_blocks(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = text;
    loop {
        let trimmed = rest.trim_start();
        if trimmed.is_empty() {
            break;
        }
        let name_end = match trimmed.find(char::is_whitespace) {
            Some(i) => i,
            None => break,
        };
        let name = trimmed[..name_end].trim().to_string();
        if name.is_empty() {
            break;
        }
        let after_name = &trimmed[name_end..];
        let open = match after_name.find('{') {
            Some(i) => i,
            None => break,
        };
        let body = match matched_brace_body(&after_name[open..]) {
            Some(b) => b,
            None => break,
        };
        out.push((name, body.clone()));
        let consumed = open + 1 + body.len() + 1; // '{' + body + '}'
        if consumed >= after_name.len() {
            break;
        }
        rest = &after_name[consumed..];
    }
    out
}

/// Given a string starting with `{`, returns the text between the
/// matching `}` (brace-depth aware, so nested blocks don't truncate
/// early).
fn matched_brace_body(s: &str) -> Option<String> {
    let mut depth = 0i32;
    let mut chars = s.char_indices();
    let (_, first) = chars.next()?;
    if first != '{' {
        return None;
    }
    depth += 1;
    let start = 1;
    for (i, c) in chars {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(s[start..i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Reads the VG metadata text area following a PV's label sector (§4.I).
/// The real on-disk format stores an array of metadata-area descriptors
/// right after the label header; this runtime reads the first one,
/// which is all a default `pvcreate` layout ever writes.
pub fn read_vg_metadata<R: Read + Seek>(dev: &mut R, label_offset: u64) -> Result<VolumeGroup> {
    let mut descriptor = [0u8; 16];
    dev.seek(SeekFrom::Start(label_offset + 40))
        .context("seeking to LVM metadata area descriptor")?;
    dev.read_exact(&mut descriptor)
        .context("reading LVM metadata area descriptor")?;
    let meta_offset = u64::from_le_bytes(descriptor[0..8].try_into().unwrap());
    let meta_size = u64::from_le_bytes(descriptor[8..16].try_into().unwrap());
    if meta_offset == 0 || meta_size == 0 || meta_size > 16 * 1024 * 1024 {
        bail!("LVM metadata area descriptor looks invalid");
    }
    dev.seek(SeekFrom::Start(meta_offset))
        .context("seeking to LVM metadata text area")?;
    let mut buf = vec![0u8; meta_size as usize];
    dev.read_exact(&mut buf)
        .context("reading LVM metadata text area")?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let text = String::from_utf8_lossy(&buf[..end]);
    parse_metadata(&text)
}

/// Looks up the PV uuid that `metadata_text`'s `physical_volumes` block
/// associates with the short reference name (`pv_ref`, e.g. `"pv0"`)
/// used inside LV segments, so a segment can be resolved to a concrete
/// device once that uuid's device has been seen (§4.I).
pub fn pv_uuid_for_ref(metadata_text: &str, pv_ref: &str) -> Option<String> {
    for block in extract_blocks(metadata_text, "physical_volumes") {
        for (name, body) in extract_named_blocks(&block) {
            if name == pv_ref {
                return find_string(&body, "id");
            }
        }
    }
    None
}

/// Activates every LV in `vg` as a `linear` dm target (or a concatenation
/// of several, one per segment) and symlinks `/dev/<vg>/<lv>` to the
/// resulting `/dev/mapper/<vg>-<lv>` (§4.I).
pub fn activate(dm: &DeviceMapper, vg: &VolumeGroup, pvs_by_name: &HashMap<String, String>) -> Result<Vec<String>> {
    let mut activated = Vec::new();
    for lv in &vg.lvs {
        let dm_name = format!("{}-{}", vg.name, lv.name);
        let mut table: Table = Vec::new();
        let mut sector_cursor = 0u64;
        for (pv_ref, start_extent, extent_count) in &lv.segments {
            let pv_devpath = pvs_by_name
                .get(pv_ref)
                .with_context(|| format!("LV {} segment references unknown PV {}", lv.name, pv_ref))?;
            let length_sectors = extent_count * vg.extent_size_sectors;
            let offset_sectors = start_extent * vg.extent_size_sectors;
            table.push((
                sector_cursor,
                length_sectors,
                Target::Linear {
                    device: pv_devpath.clone(),
                    offset: offset_sectors,
                },
            ));
            sector_cursor += length_sectors;
        }
        dm.create(&dm_name, None)
            .with_context(|| format!("creating dm device for LV {}", dm_name))?;
        dm.load(&dm_name, &table)
            .with_context(|| format!("loading table for LV {}", dm_name))?;
        dm.resume(&dm_name)
            .with_context(|| format!("activating LV {}", dm_name))?;

        let mapper_path = format!("/dev/mapper/{}", dm_name);
        let vg_dir = format!("/dev/{}", vg.name);
        let _ = std::fs::create_dir_all(&vg_dir);
        let link_path = Path::new(&vg_dir).join(&lv.name);
        if !link_path.exists() {
            let _ = symlink(&mapper_path, &link_path);
        }
        log::info!("activated LV {} as {}", dm_name, mapper_path);
        activated.push(dm_name);
    }
    Ok(activated)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_METADATA: &str = r#"
vg0 {
    id = "abc"
    extent_size = 8192

    physical_volumes {
        pv0 {
            id = "pv-abc"
        }
    }

    logical_volumes {
        root {
            id = "lv-abc"
            segment1 {
                start_extent = 0
                extent_count = 100
                type = "striped"
                stripes = [
                    "pv0", 0
                ]
            }
        }
    }
}
"#;

    #[test]
    fn detects_label_magic() {
        let mut head = vec![0u8; 4096];
        head[LABEL_OFFSET as usize..LABEL_OFFSET as usize + 8].copy_from_slice(LABEL_MAGIC);
        assert!(is_lvm_pv(&head));
    }

    #[test]
    fn no_magic_is_not_a_pv() {
        let head = vec![0u8; 4096];
        assert!(!is_lvm_pv(&head));
    }

    #[test]
    fn parses_vg_name_and_extent_size() {
        let vg = parse_metadata(SAMPLE_METADATA).unwrap();
        assert_eq!(vg.name, "vg0");
        assert_eq!(vg.extent_size_sectors, 8192);
    }

    #[test]
    fn parses_lv_and_segment() {
        let vg = parse_metadata(SAMPLE_METADATA).unwrap();
        assert_eq!(vg.lvs.len(), 1);
        assert_eq!(vg.lvs[0].name, "root");
        assert_eq!(vg.lvs[0].segments, vec![("pv0".to_string(), 0, 100)]);
    }

    #[test]
    fn resolves_pv_ref_to_uuid() {
        assert_eq!(pv_uuid_for_ref(SAMPLE_METADATA, "pv0"), Some("pv-abc".to_string()));
        assert_eq!(pv_uuid_for_ref(SAMPLE_METADATA, "pv1"), None);
    }

    #[test]
    fn reads_vg_metadata_from_descriptor() {
        let mut disk = vec![0u8; 4096];
        let label_offset = 512u64;
        let meta_offset = 2048u64;
        let meta_bytes = SAMPLE_METADATA.as_bytes();
        disk[label_offset as usize + 40..label_offset as usize + 48]
            .copy_from_slice(&meta_offset.to_le_bytes());
        disk[label_offset as usize + 48..label_offset as usize + 56]
            .copy_from_slice(&(meta_bytes.len() as u64).to_le_bytes());
        disk[meta_offset as usize..meta_offset as usize + meta_bytes.len()]
            .copy_from_slice(meta_bytes);
        let mut c = std::io::Cursor::new(disk);
        let vg = read_vg_metadata(&mut c, label_offset).unwrap();
        assert_eq!(vg.name, "vg0");
    }
}
