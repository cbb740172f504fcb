//! Logger configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file (`.task-logger.toml`)
//! 2. Environment variables (with `TASK_LOGGER_` prefix)
//!
//! Environment variables override TOML configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [task_logger]
//! backend = "redis"
//! restore_timeout_ms = 5000
//! stream_fields = ["logs", "memory", "cpu"]
//!
//! [task_logger.redis]
//! url = "redis://127.0.0.1:6379"
//! db = 1
//! key_root = "build-logs"
//! pubsub = true
//! pubsub_scope = "codefresh"
//!
//! [task_logger.firebase]
//! base_url = "https://example.firebaseio.com/"
//! secret = "..."
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::constants::{
    DEFAULT_KEY_ROOT, DEFAULT_PUBSUB_SCOPE, DEFAULT_RESTORE_TIMEOUT_MS, DEFAULT_STREAM_FIELDS,
};

/// Which store a task writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Process-local key-value store.
    #[default]
    Memory,
    /// Redis key-value store, optionally with pub/sub fan-out.
    Redis,
    /// Firebase Realtime Database document store.
    Firebase,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
            Self::Firebase => write!(f, "firebase"),
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "firebase" => Ok(Self::Firebase),
            other => Err(ConfigError::Unsupported(other.to_string())),
        }
    }
}

/// Main logger configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Backend selection.
    pub backend: BackendType,

    /// How long restore waits for the backend, in milliseconds.
    pub restore_timeout_ms: u64,

    /// Final path segments treated as append-only streams.
    pub stream_fields: Vec<String>,

    /// Redis-specific configuration.
    pub redis: RedisSettings,

    /// Firebase-specific configuration.
    pub firebase: FirebaseSettings,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Memory,
            restore_timeout_ms: DEFAULT_RESTORE_TIMEOUT_MS,
            stream_fields: DEFAULT_STREAM_FIELDS.iter().map(|f| f.to_string()).collect(),
            redis: RedisSettings::default(),
            firebase: FirebaseSettings::default(),
        }
    }
}

/// Redis connection and key layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Server URL, `redis://host:port`.
    pub url: String,
    /// Password, merged into the URL when set.
    pub password: Option<String>,
    /// Database index, merged into the URL when set.
    pub db: Option<u32>,
    /// Prefix of every task key.
    pub key_root: String,
    /// Mirror writes to the task's pub/sub channel.
    pub pubsub: bool,
    /// Channel scope; channels are `<scope>:<jobId>`.
    pub pubsub_scope: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            password: None,
            db: None,
            key_root: DEFAULT_KEY_ROOT.to_string(),
            pubsub: true,
            pubsub_scope: DEFAULT_PUBSUB_SCOPE.to_string(),
        }
    }
}

impl RedisSettings {
    /// Connection URL with password and database merged in.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] if `url` is not a valid URL.
    ///
    /// # Examples
    ///
    /// ```
    /// use task_logger::config::RedisSettings;
    ///
    /// let settings = RedisSettings {
    ///     password: Some("pw".into()),
    ///     db: Some(2),
    ///     ..Default::default()
    /// };
    /// assert_eq!(settings.connection_url().unwrap(), "redis://:pw@127.0.0.1:6379/2");
    /// ```
    pub fn connection_url(&self) -> Result<String, ConfigError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| ConfigError::Parse(format!("invalid redis url '{}': {e}", self.url)))?;
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            url.set_password(Some(password))
                .map_err(|()| ConfigError::Parse(format!("redis url '{}' cannot carry a password", self.url)))?;
        }
        if let Some(db) = self.db {
            url.set_path(&format!("/{db}"));
        }
        Ok(url.to_string())
    }
}

/// Firebase database location and credentials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirebaseSettings {
    /// Database URL; job trees live directly under it.
    pub base_url: String,
    /// Database secret used for authentication.
    pub secret: String,
}

impl LoggerConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. TOML configuration file
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = if let Ok(contents) = std::fs::read_to_string(".task-logger.toml") {
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct FullConfig {
            #[serde(default)]
            task_logger: LoggerConfig,
        }

        let full: FullConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(full.task_logger)
    }

    /// Apply `TASK_LOGGER_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides resolved by `lookup`, keyed by environment variable
    /// name. Unparseable values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("TASK_LOGGER_BACKEND") {
            if let Ok(v) = backend.parse() {
                self.backend = v;
            }
        }
        if let Some(timeout) = lookup("TASK_LOGGER_RESTORE_TIMEOUT_MS") {
            if let Ok(v) = timeout.parse() {
                self.restore_timeout_ms = v;
            }
        }
        if let Some(fields) = lookup("TASK_LOGGER_STREAM_FIELDS") {
            self.stream_fields = fields
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect();
        }

        // Redis overrides
        if let Some(url) = lookup("TASK_LOGGER_REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(password) = lookup("TASK_LOGGER_REDIS_PASSWORD") {
            self.redis.password = Some(password);
        }
        if let Some(db) = lookup("TASK_LOGGER_REDIS_DB") {
            if let Ok(v) = db.parse() {
                self.redis.db = Some(v);
            }
        }
        if let Some(key_root) = lookup("TASK_LOGGER_REDIS_KEY_ROOT") {
            self.redis.key_root = key_root;
        }
        if let Some(pubsub) = lookup("TASK_LOGGER_REDIS_PUBSUB") {
            if let Ok(v) = pubsub.parse() {
                self.redis.pubsub = v;
            }
        }
        if let Some(scope) = lookup("TASK_LOGGER_REDIS_PUBSUB_SCOPE") {
            self.redis.pubsub_scope = scope;
        }

        // Firebase overrides
        if let Some(base_url) = lookup("TASK_LOGGER_FIREBASE_BASE_URL") {
            self.firebase.base_url = base_url;
        }
        if let Some(secret) = lookup("TASK_LOGGER_FIREBASE_SECRET") {
            self.firebase.secret = secret;
        }
    }

    /// Checks that the selected backend has what it needs.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] naming the first missing field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend {
            BackendType::Memory => {},
            BackendType::Redis => {
                if self.redis.url.trim().is_empty() {
                    return Err(ConfigError::Missing("redis.url"));
                }
                if self.redis.key_root.trim().is_empty() {
                    return Err(ConfigError::Missing("redis.key_root"));
                }
            },
            BackendType::Firebase => {
                if self.firebase.base_url.trim().is_empty() {
                    return Err(ConfigError::Missing("firebase.base_url"));
                }
                if self.firebase.secret.is_empty() {
                    return Err(ConfigError::Missing("firebase.secret"));
                }
            },
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading configuration file.
    Io {
        /// Path to the configuration file.
        path: String,
        /// Error message.
        error: String,
    },
    /// Parse error in configuration.
    Parse(String),
    /// A field the selected backend requires is empty.
    Missing(&'static str),
    /// The backend is unknown or not compiled in.
    Unsupported(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, error } => {
                write!(f, "Failed to read config file '{path}': {error}")
            },
            Self::Parse(e) => write!(f, "Failed to parse config: {e}"),
            Self::Missing(field) => write!(f, "{field} is missing"),
            Self::Unsupported(backend) => write!(f, "{backend} is not implemented"),
        }
    }
}

impl std::error::Error for ConfigError {}
