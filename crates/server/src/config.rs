//! Server configuration management
//!
//! Outer-surface settings only: where to listen, how much to log, which
//! devices to export. Engine tuning (concurrency cap, chunk sizes, memory
//! low-water) is compile-time, in [`crate::engine::dispatcher`].

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::net::USBIP_PORT;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address to bind; the port is the IANA USB/IP port unless overridden.
    pub bind_addr: String,
    #[serde(default = "ServerSettings::default_port")]
    pub port: u16,
    pub log_level: String,
}

impl ServerSettings {
    fn default_port() -> u16 {
        USBIP_PORT
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// `VID:PID` patterns selecting which devices are exported; empty
    /// exports everything. `*` wildcards either side, e.g. `"0x04f9:*"`.
    #[serde(default)]
    pub filters: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_addr: "0.0.0.0".to_string(),
                port: USBIP_PORT,
                log_level: "info".to_string(),
            },
            usb: UsbSettings { filters: Vec::new() },
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path, or from the standard
    /// locations when none is given.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => {
                let candidates =
                    [Self::default_path(), PathBuf::from("/etc/usbip-export/server.toml")];
                candidates
                    .into_iter()
                    .find(|p| p.exists())
                    .ok_or_else(|| anyhow!("no configuration file found"))?
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;
        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", config_path.display()))?;
        config.validate()?;

        tracing::info!("loaded configuration from {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or fall back to defaults.
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("using default configuration: {e:#}");
                Self::default()
            }
        }
    }

    /// Save configuration to the given path, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        }
        fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        tracing::info!("saved configuration to {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbip-export").join("server.toml")
        } else {
            PathBuf::from(".config/usbip-export/server.toml")
        }
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }
        Ok(())
    }

    /// Validate a `VID:PID` device filter pattern.
    fn validate_filter(filter: &str) -> Result<()> {
        let (vid, pid) = filter
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid filter '{filter}', expected VID:PID (e.g. '0x04f9:*')"))?;
        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }
        Ok(())
    }

    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let digits = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")).unwrap_or(id);
        if digits.is_empty() || digits.len() > 4 {
            return Err(anyhow!("invalid {name} '{id}', expected 1-4 hex digits"));
        }
        u16::from_str_radix(digits, 16)
            .map_err(|_| anyhow!("invalid {name} '{id}', not a hex number"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.server.port, 3240);
        assert_eq!(config.server.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn filter_validation() {
        assert!(ServerConfig::validate_filter("0x1234:0x5678").is_ok());
        assert!(ServerConfig::validate_filter("0x1234:*").is_ok());
        assert!(ServerConfig::validate_filter("*:*").is_ok());
        assert!(ServerConfig::validate_filter("04f9:2042").is_ok());

        assert!(ServerConfig::validate_filter("0x1234").is_err());
        assert!(ServerConfig::validate_filter("0xGHIJ:*").is_err());
        assert!(ServerConfig::validate_filter("0x12345:*").is_err());
    }

    #[test]
    fn log_level_validation() {
        let mut config = ServerConfig::default();
        config.server.log_level = "noisy".to_string();
        assert!(config.validate().is_err());
        config.server.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");

        let mut config = ServerConfig::default();
        config.usb.filters.push("0x04f9:*".to_string());
        config.save(&path).unwrap();

        let loaded = ServerConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.server.port, config.server.port);
        assert_eq!(loaded.usb.filters, config.usb.filters);
    }

    #[test]
    fn missing_port_takes_default() {
        let parsed: ServerConfig = toml::from_str(
            "[server]\nbind_addr = \"127.0.0.1\"\nlog_level = \"info\"\n\n[usb]\n",
        )
        .unwrap();
        assert_eq!(parsed.server.port, 3240);
    }
}
