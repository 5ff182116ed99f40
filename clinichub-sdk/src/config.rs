//! Client configuration.
//!
//! Lives at `~/.config/clinichub/hub.toml` by default. Every field is
//! optional in the file; missing ones take the defaults below.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelOptions;
use crate::error::{HubError, Result};
use crate::reconnect::ReconnectConfig;

/// Default chat hub address (host:port).
pub const DEFAULT_CHAT_ENDPOINT: &str = "127.0.0.1:7400";
/// Default payments hub address (host:port).
pub const DEFAULT_PAYMENTS_ENDPOINT: &str = "127.0.0.1:7401";
/// Default REST base URL.
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080/api";
pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Chat hub (conversations, typing, read receipts).
    pub chat_endpoint: String,
    /// Payment notification hub.
    pub payments_endpoint: String,
    /// Base URL of the messaging REST API.
    pub api_base_url: String,
    /// Messages per history page.
    pub page_size: u32,
    /// Force TLS on hub connections (otherwise only for port 443).
    pub tls: bool,
    pub reconnect: ReconnectConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            chat_endpoint: DEFAULT_CHAT_ENDPOINT.to_string(),
            payments_endpoint: DEFAULT_PAYMENTS_ENDPOINT.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            tls: false,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// `<config_dir>/clinichub/hub.toml`.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clinichub")
        .join("hub.toml")
}

impl HubConfig {
    /// Read `path`. A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: Self = toml::from_str(&text)
            .map_err(|e| HubError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_default() -> Result<Self> {
        Self::load(&default_path())
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions::from(&self.reconnect)
    }

    fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(HubError::Config("page_size must be at least 1".to_string()));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(HubError::Config(
                "reconnect.max_delay_ms is smaller than reconnect.base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}
