// Client configuration file.
//
// Global config: `~/.eventsync/config.toml`
// Every section is optional; missing keys fall back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use eventsync_common::types::NoticePriority;

/// Root directory for eventsync state: `~/.eventsync/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".eventsync"))
}

/// Path to the config file: `~/.eventsync/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Default location of the shared mailbox slot: `~/.eventsync/mailbox.db`.
pub fn default_mailbox_store_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("mailbox.db"))
}

// ── Top level ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SyncConfig {
    pub api: ApiConfig,
    pub namespaces: Vec<NamespaceConfig>,
    pub chat: ChatConfig,
    pub mailbox: MailboxConfig,
    pub reconnect: ReconnectConfig,
}

impl SyncConfig {
    /// Load from `~/.eventsync/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    pub fn namespace(&self, name: &str) -> Option<&NamespaceConfig> {
        self.namespaces.iter().find(|ns| ns.name == name)
    }
}

// ── REST collaborators ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the REST API (e.g. `https://events.example.com/api`).
    pub base_url: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { base_url: None, request_timeout_ms: 10_000 }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        clamp_millis(self.request_timeout_ms, 500, 120_000)
    }
}

// ── Namespaces ─────────────────────────────────────────────────────

/// One push-channel namespace (e.g. `actor` chat vs `admin` chat).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamespaceConfig {
    pub name: String,
    /// WebSocket endpoint, `wss://` (or `ws://` for localhost).
    pub url: String,
    #[serde(default)]
    pub anonymous: AnonymousPolicy,
}

/// What `connect` does when no credential is available.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnonymousPolicy {
    /// Open the channel without a credential and let the server decide.
    #[default]
    BestEffort,
    /// Do not open the channel at all.
    Refuse,
}

// ── Chat ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    pub history_page_limit: u32,
    pub ack_timeout_ms: u64,
    /// Minimum spacing between outbound `typing=true` emissions.
    pub typing_emit_window_ms: u64,
    /// Quiet time after the last keystroke before `typing=false` is sent.
    pub typing_stop_delay_ms: u64,
    /// How long a remote `typing=true` keeps the indicator lit.
    pub remote_typing_window_ms: u64,
    pub seen_debounce_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_page_limit: 30,
            ack_timeout_ms: 5_000,
            typing_emit_window_ms: 600,
            typing_stop_delay_ms: 900,
            remote_typing_window_ms: 2_200,
            seen_debounce_ms: 400,
        }
    }
}

impl ChatConfig {
    pub fn history_page_limit(&self) -> u32 {
        self.history_page_limit.clamp(1, 200)
    }

    pub fn ack_timeout(&self) -> Duration {
        clamp_millis(self.ack_timeout_ms, 100, 60_000)
    }

    pub fn typing_emit_window(&self) -> Duration {
        clamp_millis(self.typing_emit_window_ms, 100, 5_000)
    }

    pub fn typing_stop_delay(&self) -> Duration {
        clamp_millis(self.typing_stop_delay_ms, 100, 10_000)
    }

    pub fn remote_typing_window(&self) -> Duration {
        clamp_millis(self.remote_typing_window_ms, 500, 30_000)
    }

    pub fn seen_debounce(&self) -> Duration {
        clamp_millis(self.seen_debounce_ms, 50, 5_000)
    }
}

// ── Mailbox ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MailboxConfig {
    /// Reconciliation tick; the fallback when change notifications are missed.
    pub tick_ms: u64,
    pub poll_interval_sec: u64,
    /// Server notices below this priority are never shown.
    pub min_priority: NoticePriority,
    /// How long a published server notice stays owned by its publisher
    /// without renewal. After that any instance may take over its ack.
    pub publisher_lease_ms: u64,
    /// Shared slot database. Defaults to `~/.eventsync/mailbox.db`.
    pub store_path: Option<PathBuf>,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            tick_ms: 900,
            poll_interval_sec: 30,
            min_priority: NoticePriority::Normal,
            publisher_lease_ms: 10_000,
            store_path: None,
        }
    }
}

impl MailboxConfig {
    pub fn tick(&self) -> Duration {
        clamp_millis(self.tick_ms, 100, 10_000)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec.clamp(5, 3_600))
    }

    /// Never shorter than four ticks, so a live publisher always renews in time.
    pub fn publisher_lease(&self) -> Duration {
        clamp_millis(self.publisher_lease_ms, 2_000, 300_000).max(self.tick() * 4)
    }

    pub fn store_path(&self) -> Option<PathBuf> {
        self.store_path.clone().or_else(default_mailbox_store_path)
    }
}

// ── Reconnect ──────────────────────────────────────────────────────

/// Backoff used by the WebSocket transport's own reconnect loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// `None` retries indefinitely.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { base_delay_ms: 250, max_delay_ms: 30_000, max_attempts: None }
    }
}

fn clamp_millis(value: u64, min: u64, max: u64) -> Duration {
    Duration::from_millis(value.clamp(min, max))
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
