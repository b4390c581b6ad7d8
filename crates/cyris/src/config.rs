//! Tool configuration loading for `config.yml`, environment and legacy INI
//!
//! Configuration is resolved in three layers: built-in defaults, then a
//! configuration file (YAML preferred, legacy INI accepted), then `CYRIS_*`
//! environment variables. Later layers win.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{eyre::Context as _, Result};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::errors::CyrisError;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "CYRIS_";

/// Default configuration file candidates, tried in order.
pub const CONFIG_CANDIDATES: &[&str] = &["config.yml", "/etc/cyris/config.yml"];

/// Upper bound accepted for any concurrency knob.
const MAX_CONCURRENCY: u32 = 9999;

/// Resolved tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Install root of cyris itself
    pub cyris_path: Utf8PathBuf,
    /// Directory holding per-range state (`cyber_range/<id>/...`)
    pub cyber_range_dir: Utf8PathBuf,
    /// Enable gateway/tunnel mode for entry point access
    pub gw_mode: bool,
    /// Gateway account name
    pub gw_account: Option<String>,
    /// Gateway management address
    pub gw_mgmt_addr: Option<String>,
    /// Gateway inside address
    pub gw_inside_addr: Option<String>,
    /// Optional address for creation notifications
    pub user_email: Option<String>,
    /// Per-call SSH timeout in seconds
    pub ssh_timeout: u64,
    /// SSH retry attempts on transient failures
    pub ssh_retry_count: u32,
    /// Delay between SSH retries in seconds
    pub ssh_retry_delay: u64,
    /// Overall IP discovery timeout in seconds
    pub ip_discovery_timeout: u64,
    /// IP resolver cache TTL in seconds
    pub ip_cache_ttl: u64,
    /// Hypervisor connection URI
    pub libvirt_uri: String,
    /// Concurrency cap for parallel SSH fan-out
    pub parallel_ssh_concurrency: u32,
    /// Concurrency cap for base image distribution
    pub image_distribution_concurrency: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cyris_path: Utf8PathBuf::from("."),
            cyber_range_dir: Utf8PathBuf::from("cyber_range"),
            gw_mode: false,
            gw_account: None,
            gw_mgmt_addr: None,
            gw_inside_addr: None,
            user_email: None,
            ssh_timeout: 30,
            ssh_retry_count: 3,
            ssh_retry_delay: 5,
            ip_discovery_timeout: 180,
            ip_cache_ttl: 60,
            libvirt_uri: "qemu:///system".to_string(),
            parallel_ssh_concurrency: 50,
            image_distribution_concurrency: 4,
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, or the first existing
    /// candidate, then apply environment overrides. A missing file is not
    /// an error; defaults apply.
    pub fn load(explicit: Option<&Utf8Path>) -> Result<Self> {
        let mut config = match Self::locate(explicit) {
            Some(path) => Self::load_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    fn locate(explicit: Option<&Utf8Path>) -> Option<Utf8PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_owned());
        }
        if let Ok(path) = std::env::var("CYRIS_CONFIG") {
            return Some(Utf8PathBuf::from(path));
        }
        CONFIG_CANDIDATES
            .iter()
            .map(Utf8PathBuf::from)
            .find(|p| p.exists())
    }

    /// Load a single configuration file, sniffing YAML vs legacy INI.
    pub fn load_file(path: &Utf8Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        if looks_like_ini(&content) {
            Self::parse_legacy_ini(&content)
                .with_context(|| format!("Failed to parse legacy INI config: {}", path))
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path))
        }
    }

    /// Parse the legacy `[config]`-section INI format still found in older
    /// deployments. Unknown keys are ignored for compatibility.
    pub fn parse_legacy_ini(content: &str) -> Result<Self> {
        let mut config = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            config.set_key(key.trim(), value.trim())?;
        }
        Ok(config)
    }

    /// Apply `CYRIS_*` environment overrides. The lookup is injected so
    /// tests do not mutate process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in [
            "cyris_path",
            "cyber_range_dir",
            "gw_mode",
            "gw_account",
            "gw_mgmt_addr",
            "gw_inside_addr",
            "user_email",
            "ssh_timeout",
            "ssh_retry_count",
            "ssh_retry_delay",
            "ip_discovery_timeout",
            "ip_cache_ttl",
            "libvirt_uri",
            "parallel_ssh_concurrency",
            "image_distribution_concurrency",
        ] {
            let env_name = format!("{}{}", ENV_PREFIX, key.to_uppercase());
            if let Some(value) = lookup(&env_name) {
                // An unparsable override is a configuration mistake, but
                // overrides are applied before validate(); report it there.
                let _ = self.set_key(key, &value);
            }
        }
    }

    fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "cyris_path" => self.cyris_path = Utf8PathBuf::from(value),
            "cyber_range_dir" => self.cyber_range_dir = Utf8PathBuf::from(value),
            "gw_mode" => self.gw_mode = parse_bool(value)?,
            "gw_account" => self.gw_account = non_empty(value),
            "gw_mgmt_addr" => self.gw_mgmt_addr = non_empty(value),
            "gw_inside_addr" => self.gw_inside_addr = non_empty(value),
            "user_email" => self.user_email = non_empty(value),
            "ssh_timeout" => self.ssh_timeout = parse_num(key, value)?,
            "ssh_retry_count" => self.ssh_retry_count = parse_num(key, value)?,
            "ssh_retry_delay" => self.ssh_retry_delay = parse_num(key, value)?,
            "ip_discovery_timeout" => self.ip_discovery_timeout = parse_num(key, value)?,
            "ip_cache_ttl" => self.ip_cache_ttl = parse_num(key, value)?,
            "libvirt_uri" => self.libvirt_uri = value.to_string(),
            "parallel_ssh_concurrency" => self.parallel_ssh_concurrency = parse_num(key, value)?,
            "image_distribution_concurrency" => {
                self.image_distribution_concurrency = parse_num(key, value)?
            }
            _ => {}
        }
        Ok(())
    }

    /// Reject configurations that would misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("parallel_ssh_concurrency", self.parallel_ssh_concurrency),
            (
                "image_distribution_concurrency",
                self.image_distribution_concurrency,
            ),
        ] {
            if value == 0 || value >= MAX_CONCURRENCY {
                return Err(CyrisError::Config(format!(
                    "{} must be between 1 and {}, got {}",
                    name,
                    MAX_CONCURRENCY - 1,
                    value
                ))
                .into());
            }
        }
        if self.ssh_timeout == 0 {
            return Err(CyrisError::Config("ssh_timeout must be non-zero".into()).into());
        }
        if self.gw_mode && (self.gw_account.is_none() || self.gw_mgmt_addr.is_none()) {
            return Err(CyrisError::Config(
                "gw_mode requires gw_account and gw_mgmt_addr".into(),
            )
            .into());
        }
        Ok(())
    }

    /// Root directory for one range's state.
    pub fn range_dir(&self, range_id: &str) -> Utf8PathBuf {
        self.cyber_range_dir.join(range_id)
    }

    /// Path of the shared metadata document.
    pub fn metadata_path(&self) -> Utf8PathBuf {
        self.cyber_range_dir.join("ranges_metadata.json")
    }

    /// Path of the shared resource inventory document.
    pub fn resources_path(&self) -> Utf8PathBuf {
        self.cyber_range_dir.join("ranges_resources.json")
    }

    /// Directory holding built base images.
    pub fn image_cache_dir(&self) -> Utf8PathBuf {
        self.cyber_range_dir.join("images")
    }
}

fn looks_like_ini(content: &str) -> bool {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        return line.starts_with('[');
    }
    false
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => Err(CyrisError::Config(format!("invalid boolean value: {}", other)).into()),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CyrisError::Config(format!("{}: expected a number, got {:?}", key, value)).into())
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
