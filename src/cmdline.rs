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

//! Kernel cmdline parsing (§4.J, §6).  A generalization of the
//! `KargsEditor` token-rewrite approach: split on whitespace, respect
//! `"`-quoted values, and let the last occurrence of a conflicting atom
//! win.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;

pub const DEFAULT_CMDLINE_PATH: &str = "/proc/cmdline";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootSpec {
    Uuid(String),
    Label(String),
    Path(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuksRequirement {
    pub uuid: String,
    pub name: Option<String>,
}

impl LuksRequirement {
    /// The name used both for dm activation and for the passphrase
    /// prompt (§4.F): explicit `rd.luks.name=` mapping, else `luks-<uuid>`.
    pub fn activation_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("luks-{}", self.uuid))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCmdline {
    pub root: Option<RootSpec>,
    pub rootflags: Vec<String>,
    pub rw: Option<bool>,
    pub luks: Vec<LuksRequirement>,
    pub luks_options: Vec<String>,
    pub debug: bool,
    pub disable_concurrent_module_loading: bool,
    /// module name -> aggregated "param=val,param2=val2" string (§4.C).
    pub module_params: BTreeMap<String, Vec<String>>,
    pub init: Option<String>,
}

impl ParsedCmdline {
    pub fn from_proc() -> Result<Self> {
        let raw = fs::read_to_string(DEFAULT_CMDLINE_PATH)
            .with_context(|| format!("reading {}", DEFAULT_CMDLINE_PATH))?;
        Ok(Self::parse(&raw))
    }

    pub fn parse(line: &str) -> Self {
        let mut out = ParsedCmdline::default();
        // rootflags atoms accumulate keyed by their "bare" name so that
        // a later "nolazytime" overrides an earlier "lazytime" (last
        // conflicting atom wins, §4.J).
        let mut rootflag_order: Vec<String> = Vec::new();
        let mut rootflag_set: BTreeSet<String> = BTreeSet::new();

        for token in tokenize(line) {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(unquote(v))),
                None => (token.as_str(), None),
            };
            match key {
                "root" => {
                    if let Some(v) = value {
                        out.root = Some(parse_root(&v));
                    }
                }
                "rootflags" => {
                    if let Some(v) = value {
                        for atom in v.split(',').filter(|s| !s.is_empty()) {
                            merge_flag_atom(&mut rootflag_order, &mut rootflag_set, atom);
                        }
                    }
                }
                "rw" => out.rw = Some(true),
                "ro" => out.rw = Some(false),
                "rd.luks.uuid" => {
                    if let Some(v) = value {
                        upsert_luks(&mut out.luks, v, None);
                    }
                }
                "rd.luks.name" => {
                    if let Some(v) = value {
                        if let Some((uuid, name)) = v.split_once('=') {
                            upsert_luks(&mut out.luks, uuid.to_string(), Some(name.to_string()));
                        }
                    }
                }
                "rd.luks.options" => {
                    if let Some(v) = value {
                        out.luks_options = v.split(',').map(|s| s.to_string()).collect();
                    }
                }
                "booster.debug" => out.debug = true,
                "booster.disable_concurrent_module_loading" => {
                    out.disable_concurrent_module_loading = true
                }
                "init" => out.init = value,
                _ => {
                    if let Some((module, param)) = key.split_once('.') {
                        if let Some(v) = value {
                            out.module_params
                                .entry(canonical_module_name(module))
                                .or_default()
                                .push(format!("{}={}", param, v));
                        }
                    }
                }
            }
        }
        out.rootflags = rootflag_order;
        out
    }

    /// Final mount-flags string: `rw`/`ro` overrides any rootflags atom
    /// of the same kind (§4.J).
    pub fn effective_rootflags(&self) -> Vec<String> {
        let mut flags = self.rootflags.clone();
        if let Some(rw) = self.rw {
            flags.retain(|f| f != "rw" && f != "ro");
            flags.push(if rw { "rw".to_string() } else { "ro".to_string() });
        }
        flags
    }

    pub fn module_param_string(&self, module: &str) -> Option<String> {
        self.module_params
            .get(&canonical_module_name(module))
            .map(|v| v.join(","))
    }

    pub fn init_path(&self) -> &str {
        self.init.as_deref().unwrap_or("/sbin/init")
    }
}

/// kmod's own name canonicalization is dash-to-underscore (a module
/// file `vfio-pci.ko` and the loaded module `vfio_pci` are the same
/// thing); `<module>.<param>=` cmdline tokens and `modules_force_load`
/// config names must be folded to the same form before either is used
/// as a lookup key, or `vfio-pci.ids=` silently never matches
/// `modules_force_load: vfio_pci` (§4.C, §8 scenario 5).
fn canonical_module_name(raw: &str) -> String {
    raw.replace('-', "_")
}

fn merge_flag_atom(order: &mut Vec<String>, seen: &mut BTreeSet<String>, atom: &str) {
    // Atoms conflict when they share a "no"-stripped base, e.g.
    // lazytime/nolazytime, ro/rw. Drop any prior atom with the same
    // base before appending, so last-wins.
    let base = atom.strip_prefix("no").unwrap_or(atom);
    order.retain(|existing| {
        let existing_base = existing.strip_prefix("no").unwrap_or(existing);
        existing_base != base
    });
    seen.retain(|existing| {
        let existing_base = existing.strip_prefix("no").unwrap_or(existing);
        existing_base != base
    });
    seen.insert(atom.to_string());
    order.push(atom.to_string());
}

fn upsert_luks(luks: &mut Vec<LuksRequirement>, uuid: String, name: Option<String>) {
    if let Some(existing) = luks.iter_mut().find(|l| l.uuid == uuid) {
        if name.is_some() {
            existing.name = name;
        }
    } else {
        luks.push(LuksRequirement { uuid, name });
    }
}

fn parse_root(v: &str) -> RootSpec {
    if let Some(u) = v.strip_prefix("UUID=") {
        RootSpec::Uuid(u.to_string())
    } else if let Some(l) = v.strip_prefix("LABEL=") {
        RootSpec::Label(l.to_string())
    } else {
        RootSpec::Path(v.to_string())
    }
}

fn unquote(v: &str) -> String {
    if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
        v[1..v.len() - 1].to_string()
    } else {
        v.to_string()
    }
}

/// Splits on whitespace but keeps `"`-quoted spans intact, mirroring how
/// `KargsEditor` avoids breaking quoted karg values apart.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in line.trim().chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_root_uuid() {
        let p = ParsedCmdline::parse(
            "root=UUID=5c92fc66-7315-408b-b652-176dc554d370 rootflags=user_xattr,nobarrier booster.debug",
        );
        assert_eq!(
            p.root,
            Some(RootSpec::Uuid("5c92fc66-7315-408b-b652-176dc554d370".into()))
        );
        assert_eq!(p.rootflags, vec!["user_xattr", "nobarrier"]);
        assert!(p.debug);
    }

    #[test]
    fn last_conflicting_atom_wins() {
        let p = ParsedCmdline::parse("rootflags=ro,rw,ro rootflags=lazytime,nolazytime");
        assert_eq!(p.rootflags, vec!["ro", "nolazytime"]);
    }

    #[test]
    fn rw_flag_overrides_rootflags() {
        let p = ParsedCmdline::parse("rootflags=ro rw");
        assert_eq!(p.effective_rootflags(), vec!["rw"]);
    }

    #[test]
    fn luks_requirement_and_name_mapping() {
        let p = ParsedCmdline::parse(
            "rd.luks.uuid=639b8fdd-36ba-443e-be3e-e5b335935502 root=UUID=7bbf9363-eb42-4476-8c1c-9f1f4d091385",
        );
        assert_eq!(p.luks.len(), 1);
        assert_eq!(
            p.luks[0].activation_name(),
            "luks-639b8fdd-36ba-443e-be3e-e5b335935502"
        );
    }

    #[test]
    fn luks_name_mapping_overrides_default_prompt_name() {
        let p = ParsedCmdline::parse(
            "rd.luks.uuid=639b8fdd-36ba-443e-be3e-e5b335935502 rd.luks.name=639b8fdd-36ba-443e-be3e-e5b335935502=mydata",
        );
        assert_eq!(p.luks[0].activation_name(), "mydata");
    }

    #[test]
    fn module_params_aggregate() {
        let p = ParsedCmdline::parse("vfio-pci.ids=1002:67df,1002:aaf0");
        // The cmdline token spells the module with a dash, but lookups
        // key on the canonical (underscore) module name either way.
        assert_eq!(
            p.module_param_string("vfio_pci"),
            Some("ids=1002:67df,1002:aaf0".to_string())
        );
        assert_eq!(
            p.module_param_string("vfio-pci"),
            Some("ids=1002:67df,1002:aaf0".to_string())
        );
    }

    #[test]
    fn quoted_values_kept_intact() {
        let p = ParsedCmdline::parse(r#"rootflags="user_xattr,nobarrier""#);
        assert_eq!(p.rootflags, vec!["user_xattr", "nobarrier"]);
    }

    #[test]
    fn init_override() {
        let p = ParsedCmdline::parse("init=/bin/mysh");
        assert_eq!(p.init_path(), "/bin/mysh");
        let p2 = ParsedCmdline::parse("");
        assert_eq!(p2.init_path(), "/sbin/init");
    }
}
