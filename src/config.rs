//! Loads `cpcache.toml`: an intermediate `*_File` struct with every field
//! optional, defaults filled in afterwards via `Config::load` /
//! `Config::load_from_config_dir`.

use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/etc/cpcache/cpcache.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorSelectionMethod {
    Predefined,
    Auto,
}

#[derive(Debug, Clone)]
pub struct AutoMirrorConfig {
    pub https_required: bool,
    pub ipv4: bool,
    pub ipv6: bool,
    pub max_score: f64,
    pub timeout_secs: u64,
    pub test_interval_secs: u64,
}

impl Default for AutoMirrorConfig {
    fn default() -> Self {
        Self {
            https_required: true,
            ipv4: true,
            ipv6: false,
            max_score: 5.0,
            timeout_secs: 5,
            test_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub cache_directory: PathBuf,
    pub wanted_packages_directory: PathBuf,
    pub ipv6_enabled: bool,
    pub mirrors_predefined: Vec<String>,
    pub mirrors_blacklist: Vec<String>,
    pub mirror_selection_method: MirrorSelectionMethod,
    pub recv_packages_key: Vec<u8>,
    pub mirrors_auto: AutoMirrorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7878,
            cache_directory: PathBuf::from("/var/cache/cpcache"),
            wanted_packages_directory: PathBuf::from("/var/cache/cpcache/wanted"),
            ipv6_enabled: false,
            mirrors_predefined: Vec::new(),
            mirrors_blacklist: Vec::new(),
            mirror_selection_method: MirrorSelectionMethod::Predefined,
            recv_packages_key: Vec::new(),
            mirrors_auto: AutoMirrorConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RecvPackagesFile {
    key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AutoMirrorFile {
    https_required: Option<bool>,
    ipv4: Option<bool>,
    ipv6: Option<bool>,
    max_score: Option<f64>,
    timeout: Option<u64>,
    test_interval: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    port: Option<u16>,
    cache_directory: Option<PathBuf>,
    wanted_packages_directory: Option<PathBuf>,
    ipv6_enabled: Option<bool>,
    mirrors_predefined: Option<Vec<String>>,
    mirrors_blacklist: Option<Vec<String>>,
    mirror_selection_method: Option<String>,
    recv_packages: Option<RecvPackagesFile>,
    mirrors_auto: Option<AutoMirrorFile>,
}

impl Config {
    /// Loads from an explicit path. A config file that exists but fails to
    /// parse is a hard error (see SPEC_FULL.md REDESIGN FLAGS #5) — only a
    /// genuinely missing file falls back to defaults.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("config file {} not found, using defaults", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let file: ConfigFile = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {}", path, e))?;

        Self::from_file(file)
    }

    pub fn load_from_config_dir() -> anyhow::Result<Self> {
        Self::load(DEFAULT_CONFIG_PATH)
    }

    fn from_file(file: ConfigFile) -> anyhow::Result<Self> {
        let default = Self::default();

        let mirror_selection_method = match file.mirror_selection_method.as_deref() {
            None => default.mirror_selection_method,
            Some("predefined") => MirrorSelectionMethod::Predefined,
            Some("auto") => MirrorSelectionMethod::Auto,
            Some(other) => {
                anyhow::bail!("unknown mirror_selection_method: {}", other);
            }
        };

        let recv_packages_key = match file.recv_packages.and_then(|r| r.key) {
            None => Vec::new(),
            Some(k) => hex::decode(&k).unwrap_or_else(|_| k.into_bytes()),
        };

        let mirrors_auto = match file.mirrors_auto {
            None => AutoMirrorConfig::default(),
            Some(a) => {
                let d = AutoMirrorConfig::default();
                AutoMirrorConfig {
                    https_required: a.https_required.unwrap_or(d.https_required),
                    ipv4: a.ipv4.unwrap_or(d.ipv4),
                    ipv6: a.ipv6.unwrap_or(d.ipv6),
                    max_score: a.max_score.unwrap_or(d.max_score),
                    timeout_secs: a.timeout.unwrap_or(d.timeout_secs),
                    test_interval_secs: a.test_interval.unwrap_or(d.test_interval_secs),
                }
            }
        };

        Ok(Self {
            port: file.port.unwrap_or(default.port),
            cache_directory: file.cache_directory.unwrap_or(default.cache_directory),
            wanted_packages_directory: file
                .wanted_packages_directory
                .unwrap_or(default.wanted_packages_directory),
            ipv6_enabled: file.ipv6_enabled.unwrap_or(default.ipv6_enabled),
            mirrors_predefined: file.mirrors_predefined.unwrap_or(default.mirrors_predefined),
            mirrors_blacklist: file.mirrors_blacklist.unwrap_or(default.mirrors_blacklist),
            mirror_selection_method,
            recv_packages_key,
            mirrors_auto,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing() {
        let cfg = Config::load("/nonexistent/path/cpcache.toml").unwrap();
        assert_eq!(cfg.port, 7878);
        assert_eq!(cfg.mirror_selection_method, MirrorSelectionMethod::Predefined);
    }

    #[test]
    fn parses_full_example() {
        let toml = r#"
            port = 9000
            cache_directory = "/tmp/cache"
            wanted_packages_directory = "/tmp/wanted"
            ipv6_enabled = true
            mirrors_predefined = ["https://a.example", "https://b.example"]
            mirror_selection_method = "auto"

            [recv_packages]
            key = "68656c6c6f"

            [mirrors_auto]
            https_required = false
            max_score = 2.5
        "#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        let cfg = Config::from_file(file).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.mirror_selection_method, MirrorSelectionMethod::Auto);
        assert_eq!(cfg.recv_packages_key, b"hello");
        assert!(!cfg.mirrors_auto.https_required);
        assert_eq!(cfg.mirrors_auto.max_score, 2.5);
    }

    #[test]
    fn rejects_unknown_selection_method() {
        let toml = r#"mirror_selection_method = "bogus""#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        assert!(Config::from_file(file).is_err());
    }
}
