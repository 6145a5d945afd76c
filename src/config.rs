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

//! The image-embedded, read-only runtime config (§3 Config, §6).

use anyhow::{Context, Result};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/booster.yaml";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Comma-separated MAC addresses (dashes or colons), selecting which
    /// `net` interfaces to bring up (§4.H).
    #[serde(default)]
    pub interfaces: Option<String>,
    #[serde(default)]
    pub dhcp: bool,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub modules_force_load: HashSet<String>,
    #[serde(default = "default_mount_timeout")]
    pub mount_timeout: Timeout,
    #[serde(default)]
    pub enable_lvm: bool,
    #[serde(default)]
    pub enable_virtual_console: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network: None,
            modules_force_load: HashSet::new(),
            mount_timeout: default_mount_timeout(),
            enable_lvm: false,
            enable_virtual_console: false,
        }
    }
}

fn default_mount_timeout() -> Timeout {
    Timeout(Duration::from_secs(10))
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_str(&data)
    }

    pub fn from_str(data: &str) -> Result<Self> {
        // Deny-unknown-fields is too strict for a config whose writer
        // (the image generator) and reader (this runtime) version
        // independently; instead the generic yaml Value is walked first
        // so unrecognized top-level keys are warned about rather than
        // silently ignored or treated as fatal.
        let raw: serde_yaml::Value =
            serde_yaml::from_str(data).context("parsing config as YAML")?;
        if let serde_yaml::Value::Mapping(map) = &raw {
            const KNOWN: &[&str] = &[
                "network",
                "modules_force_load",
                "mount_timeout",
                "enable_lvm",
                "enable_virtual_console",
            ];
            for key in map.keys() {
                if let Some(key) = key.as_str() {
                    if !KNOWN.contains(&key) {
                        log::warn!("ignoring unrecognized config key \"{}\"", key);
                    }
                }
            }
        }
        serde_yaml::from_value(raw).context("deserializing config")
    }

    pub fn load_default() -> Result<Self> {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        if path.exists() {
            Self::from_path(path)
        } else {
            log::debug!("no config at {}, using defaults", DEFAULT_CONFIG_PATH);
            Ok(Self::default())
        }
    }
}

/// A `Duration` that deserializes from the informal `"1s"` / `"10s"` /
/// `"500ms"` suffix syntax the test scenarios use for `mount_timeout`
/// (spec §8 scenario 4). Kept as a hand-written impl rather than pulling
/// in a duration crate the rest of the stack has no other use for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Timeout(#[serde(serialize_with = "serialize_duration")] pub Duration);

impl Timeout {
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

fn serialize_duration<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{}ms", d.as_millis()))
}

impl<'de> Deserialize<'de> for Timeout {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl<'de> de::Visitor<'de> for Visitor {
            type Value = Timeout;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration such as \"1s\", \"500ms\", or \"10s\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Timeout, E> {
                parse_duration(v).map(Timeout).map_err(de::Error::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Timeout, E> {
                Ok(Timeout(Duration::from_secs(v)))
            }
        }
        deserializer.deserialize_any(Visitor)
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit) = s
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| s.split_at(i))
        .ok_or_else(|| format!("duration \"{}\" has no unit", s))?;
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("duration \"{}\" has a non-numeric magnitude", s))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        _ => Err(format!("duration \"{}\" has an unrecognized unit", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("blah").is_err());
    }

    #[test]
    fn defaults_when_absent() {
        let c = Config::from_str("enable_lvm: true").unwrap();
        assert!(c.enable_lvm);
        assert!(!c.enable_virtual_console);
        assert_eq!(c.mount_timeout.as_duration(), Duration::from_secs(10));
        assert!(c.network.is_none());
    }

    #[test]
    fn parses_full_config() {
        let yaml = r#"
network:
  interfaces: "aa:bb:cc:dd:ee:ff"
  dhcp: false
  ip: "10.0.2.15/24"
  gateway: "10.0.2.2"
  dns_servers: ["10.0.2.3"]
modules_force_load:
  - vfio_pci
  - vfio
mount_timeout: "1s"
enable_lvm: true
enable_virtual_console: true
"#;
        let c = Config::from_str(yaml).unwrap();
        assert_eq!(c.mount_timeout.as_duration(), Duration::from_secs(1));
        assert!(c.modules_force_load.contains("vfio_pci"));
        let net = c.network.unwrap();
        assert_eq!(net.ip.as_deref(), Some("10.0.2.15/24"));
        assert_eq!(net.dns_servers, vec!["10.0.2.3".to_string()]);
    }

    #[test]
    fn unknown_key_is_not_fatal() {
        let c = Config::from_str("totally_unknown_key: 5\nenable_lvm: true").unwrap();
        assert!(c.enable_lvm);
    }
}
