//! Configuration system for the `ProjChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/projchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use projchat_proto::message::{ConversationKey, ProjectId, UserId};

use crate::sync::echo::DEFAULT_SEND_TIMEOUT;
use crate::sync::poll::DEFAULT_POLL_INTERVAL;
use crate::sync::reconcile::DEFAULT_DEDUP_WINDOW;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A required setting was not provided anywhere.
    #[error("missing required setting `{0}` (pass --{0} or set it in the config file)")]
    Missing(&'static str),

    /// A setting has a value that cannot be used.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    relay: RelayFileConfig,
    sync: SyncFileConfig,
    ui: UiFileConfig,
}

/// `[relay]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayFileConfig {
    url: Option<String>,
    user_id: Option<String>,
    counterpart_id: Option<String>,
    project_id: Option<String>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    poll_interval_secs: Option<u64>,
    send_timeout_secs: Option<u64>,
    dedup_window_secs: Option<u64>,
    stall_after_failures: Option<u32>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Sync engine tuning (used by `ConversationEngine`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Time between history fetches while a view is active.
    pub poll_interval: Duration,
    /// Upper bound on one send call before it is marked failed.
    pub send_timeout: Duration,
    /// Tolerance for matching a pending entry to a server record by time.
    pub dedup_window: Duration,
    /// Consecutive fetch failures (while push is down) before the
    /// conversation is reported as stalled.
    pub stall_after_failures: u32,
}

impl SyncConfig {
    /// Rejects settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero poll interval, send
    /// timeout or stall threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "poll-interval-secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "send-timeout-secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.stall_after_failures == 0 {
            return Err(ConfigError::Invalid {
                field: "stall-after-failures",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            stall_after_failures: 3,
        }
    }
}

/// Relay connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// WebSocket URL of the relay server.
    pub url: String,
    /// Timeout for the WebSocket handshake and `Welcome`.
    pub connect_timeout: Duration,
    /// Timeout for one request/response exchange.
    pub request_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000/ws".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Relay --
    /// Relay connection settings.
    pub relay: RelaySettings,
    /// Local user identity.
    pub user_id: Option<String>,
    /// User to chat with.
    pub counterpart_id: Option<String>,
    /// Project the conversation belongs to.
    pub project_id: Option<String>,

    // -- Sync --
    /// Engine tuning.
    pub sync: SyncConfig,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay: RelaySettings::default(),
            user_id: None,
            counterpart_id: None,
            project_id: None,
            sync: SyncConfig::default(),
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/projchat/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if a resolved value is invalid.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve from CLI args and environment only, ignoring any file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a resolved value is invalid.
    pub fn from_cli(cli: &CliArgs) -> Result<Self, ConfigError> {
        Self::resolve(cli, &ConfigFile::default())
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            relay: RelaySettings {
                url: cli
                    .relay_url
                    .clone()
                    .or_else(|| file.relay.url.clone())
                    .unwrap_or(defaults.relay.url),
                connect_timeout: file
                    .relay
                    .connect_timeout_secs
                    .map_or(defaults.relay.connect_timeout, Duration::from_secs),
                request_timeout: file
                    .relay
                    .request_timeout_secs
                    .map_or(defaults.relay.request_timeout, Duration::from_secs),
            },
            user_id: cli.user_id.clone().or_else(|| file.relay.user_id.clone()),
            counterpart_id: cli
                .counterpart_id
                .clone()
                .or_else(|| file.relay.counterpart_id.clone()),
            project_id: cli
                .project_id
                .clone()
                .or_else(|| file.relay.project_id.clone()),
            sync: SyncConfig {
                poll_interval: cli
                    .poll_interval_secs
                    .or(file.sync.poll_interval_secs)
                    .map_or(defaults.sync.poll_interval, Duration::from_secs),
                send_timeout: file
                    .sync
                    .send_timeout_secs
                    .map_or(defaults.sync.send_timeout, Duration::from_secs),
                dedup_window: file
                    .sync
                    .dedup_window_secs
                    .map_or(defaults.sync.dedup_window, Duration::from_secs),
                stall_after_failures: file
                    .sync
                    .stall_after_failures
                    .unwrap_or(defaults.sync.stall_after_failures),
            },
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        };
        config.sync.validate()?;
        Ok(config)
    }

    /// The local user and conversation key, if all three ids are present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] naming the first absent id and
    /// [`ConfigError::Invalid`] if the counterpart is the local user.
    pub fn conversation(&self) -> Result<(UserId, ConversationKey), ConfigError> {
        let me = non_empty(self.user_id.as_deref(), "user-id")?;
        let counterpart = non_empty(self.counterpart_id.as_deref(), "counterpart-id")?;
        let project = non_empty(self.project_id.as_deref(), "project-id")?;
        if me == counterpart {
            return Err(ConfigError::Invalid {
                field: "counterpart-id",
                reason: "cannot chat with yourself".to_string(),
            });
        }
        Ok((
            UserId::new(me),
            ConversationKey::new(UserId::new(counterpart), ProjectId::new(project)),
        ))
    }
}

fn non_empty<'a>(value: Option<&'a str>, field: &'static str) -> Result<&'a str, ConfigError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(field)),
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Project chat client with optimistic sync")]
pub struct CliArgs {
    /// WebSocket URL of the relay server.
    #[arg(long, env = "PROJCHAT_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Your user id.
    #[arg(long, env = "PROJCHAT_USER_ID")]
    pub user_id: Option<String>,

    /// User to chat with.
    #[arg(long, env = "PROJCHAT_COUNTERPART_ID")]
    pub counterpart_id: Option<String>,

    /// Project the conversation belongs to.
    #[arg(long, env = "PROJCHAT_PROJECT_ID")]
    pub project_id: Option<String>,

    /// Seconds between history fetches.
    #[arg(long)]
    pub poll_interval_secs: Option<u64>,

    /// Path to config file (default: `~/.config/projchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PROJCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/projchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("projchat").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
