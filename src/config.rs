use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::session::SessionConfig;
use crate::simulator::SimulatorConfig;

/// Session timings as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSettings {
    pub discovery_attempts: u32,
    pub discovery_backoff_ms: u64,
    pub discovery_window_ms: u64,
    pub session_attempts: u32,
    pub session_pause_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            discovery_attempts: 3,
            discovery_backoff_ms: 5_000,
            discovery_window_ms: 5_000,
            session_attempts: 5,
            session_pause_ms: 2_000,
            command_timeout_ms: 3_000,
        }
    }
}

/// Contents of a TOML configuration file.
///
/// ```toml
/// allow_list = ["0TFDFG700601881"]
///
/// [session]
/// discovery_window_ms = 3000
///
/// [simulator]
/// discovery_failures = 1
///
/// [[simulator.devices]]
/// broadcast_code = "0TFDFG700601881"
/// ip = "192.168.1.101"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub allow_list: Vec<String>,
    pub session: SessionSettings,
    pub simulator: SimulatorConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse TOML")
    }

    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            allow_list: self.allow_list.clone(),
            discovery_attempts: s.discovery_attempts,
            discovery_backoff: Duration::from_millis(s.discovery_backoff_ms),
            discovery_window: Duration::from_millis(s.discovery_window_ms),
            session_attempts: s.session_attempts,
            session_pause: Duration::from_millis(s.session_pause_ms),
            command_timeout: Duration::from_millis(s.command_timeout_ms),
            target_mode: None,
        }
    }
}
