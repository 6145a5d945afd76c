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

//! Module loader (§4.C): resolves dependencies from the image's
//! precomputed `modules.dep`, decompresses `.ko`/`.ko.xz`/`.ko.zst`
//! payloads, and calls `finit_module`. CAS state transitions and I2
//! (load each module at most once) are delegated to `state::ModuleTable`.

use crate::io::DecompressReader;
use crate::state::{ClaimResult, ModuleTable};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{self, File};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const MODULES_DEP_PATH: &str = "/lib/modules/booster/modules.dep";
const MODULES_DIR: &str = "/lib/modules/booster";

/// Maps a bare module name (no path, no `.ko`/`.ko.xz`/`.ko.zst` suffix)
/// to its on-disk path and direct dependency names.
#[derive(Debug, Clone, Default)]
pub struct ModuleIndex {
    entries: HashMap<String, ModuleDepEntry>,
}

#[derive(Debug, Clone)]
struct ModuleDepEntry {
    path: PathBuf,
    deps: Vec<String>,
}

impl ModuleIndex {
    pub fn load_default() -> Result<Self> {
        Self::load(Path::new(MODULES_DEP_PATH))
    }

    /// Parses a `modutils`-style `modules.dep`: each line is
    /// `path/to/mod.ko[.xz|.zst]: path/to/dep1.ko path/to/dep2.ko...`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut entries = HashMap::new();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (target, deps) = line
                .split_once(':')
                .with_context(|| format!("malformed modules.dep line: {}", line))?;
            let target = target.trim();
            let name = canonical_name(target);
            let deps: Vec<String> = deps
                .split_whitespace()
                .map(canonical_name)
                .collect();
            entries.insert(
                name,
                ModuleDepEntry {
                    path: PathBuf::from(target),
                    deps,
                },
            );
        }
        Ok(Self { entries })
    }

    /// Returns `name` and all its transitive dependencies, dependencies
    /// first (topological order), each listed exactly once.
    pub fn resolve_order(&self, name: &str) -> Result<Vec<String>> {
        let mut order = Vec::new();
        let mut visiting = Vec::new();
        self.visit(name, &mut order, &mut visiting)?;
        Ok(order)
    }

    fn visit(&self, name: &str, order: &mut Vec<String>, visiting: &mut Vec<String>) -> Result<()> {
        if order.contains(&name.to_string()) {
            return Ok(());
        }
        if visiting.contains(&name.to_string()) {
            bail!("cyclic module dependency involving {}", name);
        }
        visiting.push(name.to_string());
        if let Some(entry) = self.entries.get(name) {
            for dep in entry.deps.clone() {
                self.visit(&dep, order, visiting)?;
            }
        }
        visiting.pop();
        order.push(name.to_string());
        Ok(())
    }

    fn path_for(&self, name: &str) -> Option<PathBuf> {
        self.entries.get(name).map(|e| {
            if e.path.is_absolute() {
                e.path.clone()
            } else {
                Path::new(MODULES_DIR).join(&e.path)
            }
        })
    }
}

fn canonical_name(raw: &str) -> String {
    let base = Path::new(raw)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| raw.to_string());
    let base = base
        .trim_end_matches(".zst")
        .trim_end_matches(".xz")
        .trim_end_matches(".ko");
    // kmod's own convention: dash is the on-disk/cmdline spelling,
    // underscore is canonical (matches /proc/modules and the name the
    // kernel itself reports), e.g. "vfio-pci.ko" loads as "vfio_pci".
    base.replace('-', "_")
}

/// Loads `name` (and its dependencies) with `params` applied to `name`
/// itself. `force_serial` corresponds to
/// `booster.disable_concurrent_module_loading` (§4.C, §5): when set, a
/// single global mutex serializes every `finit_module` call.
pub struct ModuleLoader {
    index: ModuleIndex,
    table: Arc<ModuleTable>,
    serialize: Mutex<()>,
    force_serial: bool,
}

impl ModuleLoader {
    pub fn new(index: ModuleIndex, table: Arc<ModuleTable>, force_serial: bool) -> Self {
        Self {
            index,
            table,
            serialize: Mutex::new(()),
            force_serial,
        }
    }

    /// Loads `name` and its dependency chain, applying `params` only to
    /// `name` (dependencies load with no parameters, matching the
    /// kernel's own modprobe semantics).
    pub fn load(&self, name: &str, params: Option<&str>) -> Result<()> {
        let canonical = canonical_name(name);
        let order = self.index.resolve_order(&canonical)?;
        for module in order {
            let p = if module == canonical { params } else { None };
            self.load_one(&module, p)?;
        }
        Ok(())
    }

    fn load_one(&self, name: &str, params: Option<&str>) -> Result<()> {
        match self.table.claim(name) {
            ClaimResult::AlreadyLoaded => return Ok(()),
            ClaimResult::AlreadyFailed => bail!("module {} previously failed to load", name),
            ClaimResult::ShouldLoad => {}
        }

        let _guard = if self.force_serial {
            Some(self.serialize.lock().expect("module loader mutex poisoned"))
        } else {
            None
        };

        let result = self.do_load(name, params);
        self.table.finish(name, result.is_ok());
        if let Err(err) = &result {
            log::warn!("failed to load module {}: {:#}", name, err);
        } else {
            log::info!(
                "loading module {} params=\"{}\"",
                name,
                params.unwrap_or("")
            );
        }
        result
    }

    fn do_load(&self, name: &str, params: Option<&str>) -> Result<()> {
        let path = self
            .index
            .path_for(name)
            .with_context(|| format!("module {} not found in modules.dep", name))?;
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        let mut decoder = DecompressReader::new(std::io::BufReader::with_capacity(crate::io::BUFFER_SIZE, file))
            .context("sniffing module compression")?;
        let mut image = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut image)
            .with_context(|| format!("decompressing module {}", name))?;
        finit_module(&image, params.unwrap_or(""))
            .with_context(|| format!("finit_module({})", name))?;
        Ok(())
    }
}

/// Wraps the `finit_module(2)` syscall. No safe wrapper exists in `libc`
/// for this syscall, so it's invoked directly via `libc::syscall`.
fn finit_module(image: &[u8], params: &str) -> Result<()> {
    // finit_module wants a file descriptor, not a buffer; memfd_create
    // gives us one backed by the already-decompressed image without a
    // temporary file on disk.
    let name = CString::new("booster-module").expect("no NUL bytes in literal");
    let fd = unsafe { libc::syscall(libc::SYS_memfd_create, name.as_ptr(), 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("memfd_create");
    }
    let fd = fd as i32;
    let file = unsafe { <File as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
    {
        use std::io::Write;
        (&file).write_all(image).context("writing module image to memfd")?;
    }

    let params_c = CString::new(params).context("module params contain a NUL byte")?;
    let ret = unsafe {
        libc::syscall(
            libc::SYS_finit_module,
            file.as_raw_fd(),
            params_c.as_ptr(),
            0,
        )
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        // EEXIST: module already present (raced with another loader, or
        // built in); treat as success since I2 only requires *this*
        // process issue at most one finit_module call per name, which it
        // did.
        if err.raw_os_error() == Some(libc::EEXIST) {
            return Ok(());
        }
        return Err(err).context("finit_module");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_names() {
        assert_eq!(canonical_name("vfio-pci"), "vfio_pci");
        assert_eq!(canonical_name("/lib/modules/booster/kernel/vfio.ko.zst"), "vfio");
        assert_eq!(canonical_name("ext4.ko.xz"), "ext4");
    }

    #[test]
    fn resolves_dependency_order() {
        let mut index = ModuleIndex::default();
        index.entries.insert(
            "dm-crypt".into(),
            ModuleDepEntry {
                path: "kernel/dm-crypt.ko.zst".into(),
                deps: vec!["dm-mod".into()],
            },
        );
        index.entries.insert(
            "dm-mod".into(),
            ModuleDepEntry {
                path: "kernel/dm-mod.ko.zst".into(),
                deps: vec![],
            },
        );
        let order = index.resolve_order("dm-crypt").unwrap();
        assert_eq!(order, vec!["dm-mod".to_string(), "dm-crypt".to_string()]);
    }

    #[test]
    fn detects_cycles() {
        let mut index = ModuleIndex::default();
        index.entries.insert(
            "a".into(),
            ModuleDepEntry {
                path: "a.ko".into(),
                deps: vec!["b".into()],
            },
        );
        index.entries.insert(
            "b".into(),
            ModuleDepEntry {
                path: "b.ko".into(),
                deps: vec!["a".into()],
            },
        );
        assert!(index.resolve_order("a").is_err());
    }
}
