//! Configuration file loading.
//!
//! An INI-like document with a `[master]` section (interface name,
//! controller MAC, optional uid/gid, optional datalog path) and one
//! section per device, named by the device's colon-hex MAC.

use std::collections::BTreeMap;
use std::path::Path;

use ini::Ini;
use thiserror::Error;

use crate::mac::{Mac, MacParseError};

/// Errors loading or validating the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read/parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: ini::Error,
    },

    #[error("missing [master] section")]
    MissingMaster,

    #[error("[master] section missing required key {0:?}")]
    MissingMasterKey(&'static str),

    #[error("bad MAC address {value:?}: {source}")]
    BadMac {
        value: String,
        #[source]
        source: MacParseError,
    },

    #[error("bad integer value {value:?} for key {key:?}: {source}")]
    BadInt {
        key: String,
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// The `[master]` section.
#[derive(Clone, Debug, PartialEq)]
pub struct MasterSection {
    pub interface: String,
    pub mac: Mac,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub datalog: Option<String>,
}

/// Per-device configuration from its own `[aa:bb:cc:dd:ee:ff]` section.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceSection {
    pub interval: Option<u64>,
    pub alias: Option<String>,
    pub force_rewrite: bool,
}

/// The fully parsed configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub master: MasterSection,
    pub devices: BTreeMap<Mac, DeviceSection>,
}

impl Config {
    /// Load and validate the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let master_section = ini.section(Some("master")).ok_or(ConfigError::MissingMaster)?;

        let interface = master_section
            .get("interface")
            .ok_or(ConfigError::MissingMasterKey("interface"))?
            .to_string();
        let mac_str = master_section
            .get("mac")
            .ok_or(ConfigError::MissingMasterKey("mac"))?;
        let mac: Mac = mac_str.parse().map_err(|source| ConfigError::BadMac {
            value: mac_str.to_string(),
            source,
        })?;
        let uid = parse_optional_u32(master_section.get("uid"), "uid")?;
        let gid = parse_optional_u32(master_section.get("gid"), "gid")?;
        let datalog = master_section.get("datalog").map(|s| s.to_string());

        let mut devices = BTreeMap::new();
        for (name, props) in ini.iter() {
            let Some(name) = name else { continue };
            if name == "master" {
                continue;
            }
            let Ok(mac) = name.parse::<Mac>() else {
                continue;
            };

            let interval = match props.get("interval") {
                Some(v) => Some(
                    v.parse::<u64>()
                        .map_err(|source| ConfigError::BadInt {
                            key: "interval".to_string(),
                            value: v.to_string(),
                            source,
                        })?,
                ),
                None => None,
            };
            let alias = props.get("alias").map(|s| s.to_string());
            let force_rewrite = props
                .get("force_rewrite")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);

            devices.insert(
                mac,
                DeviceSection {
                    interval,
                    alias,
                    force_rewrite,
                },
            );
        }

        Ok(Config {
            master: MasterSection {
                interface,
                mac,
                uid,
                gid,
                datalog,
            },
            devices,
        })
    }
}

fn parse_optional_u32(value: Option<&str>, key: &str) -> Result<Option<u32>, ConfigError> {
    match value {
        None => Ok(None),
        Some(v) => v
            .parse::<u32>()
            .map(Some)
            .map_err(|source| ConfigError::BadInt {
                key: key.to_string(),
                value: v.to_string(),
                source,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ini {
        let text = "\
[master]
interface = eth0
mac = 00:11:22:33:44:55
datalog = /var/log/asoka.tsv

[aa:bb:cc:dd:ee:ff]
interval = 30
alias = living room lamp
";
        Ini::load_from_str(text).unwrap()
    }

    #[test]
    fn parses_master_and_device_sections() {
        let config = Config::from_ini(&sample()).unwrap();
        assert_eq!(config.master.interface, "eth0");
        assert_eq!(config.master.mac, "00:11:22:33:44:55".parse().unwrap());
        assert_eq!(config.master.datalog.as_deref(), Some("/var/log/asoka.tsv"));

        let dev = config
            .devices
            .get(&"aa:bb:cc:dd:ee:ff".parse().unwrap())
            .unwrap();
        assert_eq!(dev.interval, Some(30));
        assert_eq!(dev.alias.as_deref(), Some("living room lamp"));
        assert!(!dev.force_rewrite);
    }

    #[test]
    fn missing_master_section_is_an_error() {
        let ini = Ini::load_from_str("[aa:bb:cc:dd:ee:ff]\nalias = x\n").unwrap();
        assert!(matches!(
            Config::from_ini(&ini),
            Err(ConfigError::MissingMaster)
        ));
    }

    #[test]
    fn sections_without_a_mac_name_are_ignored() {
        let text = "\
[master]
interface = eth0
mac = 00:11:22:33:44:55

[not-a-mac]
alias = ignored
";
        let config = Config::from_ini(&Ini::load_from_str(text).unwrap()).unwrap();
        assert!(config.devices.is_empty());
    }
}
