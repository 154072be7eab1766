//! Viewer configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Server endpoint.
    pub server: ServerConfig,
    /// Session behavior.
    pub session: SessionSettings,
    /// Frame cache location.
    pub cache: CacheConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Server endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Hostname or IP of the framebuffer server.
    pub host: String,
    /// TCP port (5900 is the conventional default).
    pub port: u16,
    /// Connect timeout in milliseconds; 0 disables the bound.
    pub connect_timeout_ms: u64,
}

/// Session behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Skip the client-caching encoding entirely.
    pub disable_caching: bool,
    /// Leave other viewers connected (ClientInit share flag).
    pub share_desktop: bool,
    /// Application name reported over the RPC side channel.
    pub app_name: String,
}

/// Frame cache location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory. Empty means the OS cache directory under
    /// an `rfv` subfolder.
    pub directory: String,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (overridden by `RUST_LOG`).
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionSettings::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5900,
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            disable_caching: false,
            share_desktop: true,
            app_name: "rfv-viewer".into(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ViewerConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// The resolved cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        if self.cache.directory.is_empty() {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("rfv")
        } else {
            PathBuf::from(&self.cache.directory)
        }
    }

    /// The connect timeout as a `Duration`, if bounded.
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.server.connect_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = ViewerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("host"));
        assert!(text.contains("disable_caching"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = ViewerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ViewerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.port, 5900);
        assert_eq!(parsed.server.host, "127.0.0.1");
        assert!(!parsed.session.disable_caching);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let parsed: ViewerConfig = toml::from_str("[server]\nhost = \"10.0.0.9\"\n").unwrap();
        assert_eq!(parsed.server.host, "10.0.0.9");
        assert_eq!(parsed.server.port, 5900);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let mut cfg = ViewerConfig::default();
        cfg.server.connect_timeout_ms = 0;
        assert!(cfg.connect_timeout().is_none());
        cfg.server.connect_timeout_ms = 250;
        assert_eq!(cfg.connect_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn explicit_cache_dir_wins() {
        let mut cfg = ViewerConfig::default();
        cfg.cache.directory = "/tmp/rfv-test-cache".into();
        assert_eq!(cfg.cache_dir(), PathBuf::from("/tmp/rfv-test-cache"));
    }
}
