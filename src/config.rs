//! Configuration and CLI argument handling

use std::{
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use serde::Deserialize;

use crate::error::{BringUpError, ConfigError};

/// CLI argument parsing structure
#[derive(Parser, Debug, Default)]
#[command(name = "paste-server")]
#[command(about = "Lifecycle-managed HTTP backend for a paste and image hosting service")]
#[command(version)]
pub struct Config {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host address to bind to (overrides [server] host)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind the server to (overrides [server] port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Orphaned image reap interval in seconds (overrides [reaper] interval_secs)
    #[arg(long)]
    pub reap_interval: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    /// Parse configuration from command line arguments
    pub fn parse() -> Self {
        Parser::parse()
    }

    /// Get the appropriate log level based on verbose flag
    pub fn log_level(&self) -> &'static str {
        if self.verbose { "debug" } else { "info" }
    }

    /// Load the settings file (if any) and layer the CLI overrides on top.
    pub fn load_settings(&self) -> Result<Settings, ConfigError> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };

        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(secs) = self.reap_interval {
            settings.reaper.interval_secs = secs;
        }

        Ok(settings)
    }
}

/// Full service configuration, as read from the TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    /// Database descriptor. Required; bring-up fails without it.
    pub database: Option<DatabaseConfig>,
    pub storage: StorageSettings,
    pub limits: Limits,
    pub reaper: ReaperSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// How long in-flight requests may take to finish once draining starts.
    pub drain_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            drain_timeout_secs: 30,
        }
    }
}

impl ServerSettings {
    /// Bind address as `host:port`. An empty host binds all interfaces.
    pub fn address(&self) -> String {
        let host = self.host.trim();
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Where the paste records live.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the JSON document holding the records.
    pub path: PathBuf,
    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_collection() -> String {
    "pastes".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub upload_dir: PathBuf,
    /// URL path the static file server is mounted on.
    pub public_prefix: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            public_prefix: "/uploads".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_upload_bytes: usize,
    pub max_paste_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
            max_paste_bytes: 1024 * 1024,
        }
    }
}

impl Limits {
    /// Largest request body the router accepts.
    pub fn max_body_bytes(&self) -> usize {
        self.max_upload_bytes.max(self.max_paste_bytes)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub interval_secs: u64,
    /// Upper bound on waiting for an in-progress cycle at shutdown. Unset waits indefinitely.
    pub stop_timeout_secs: Option<u64>,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
            stop_timeout_secs: None,
        }
    }
}

impl ReaperSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout_secs.map(Duration::from_secs)
    }
}

impl Settings {
    /// Read settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Check limits and reaper settings.
    pub fn validate_limits(&self) -> Result<(), ConfigError> {
        if self.limits.max_upload_bytes == 0 || self.limits.max_paste_bytes == 0 {
            return Err(ConfigError::Invalid(
                "limits must be greater than zero".to_string(),
            ));
        }
        if self.reaper.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "reaper.interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Check the storage section and the bind address.
    pub fn validate_storage(&self) -> Result<(), ConfigError> {
        if self.storage.upload_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "storage.upload_dir must not be empty".to_string(),
            ));
        }
        if !self.storage.public_prefix.starts_with('/') || self.storage.public_prefix == "/" {
            return Err(ConfigError::Invalid(format!(
                "storage.public_prefix {:?} must be a non-root absolute path",
                self.storage.public_prefix
            )));
        }
        if let Some(db) = &self.database {
            let uploads = lexical_absolute(&self.storage.upload_dir);
            if lexical_absolute(&db.path).starts_with(&uploads) {
                return Err(ConfigError::Invalid(format!(
                    "database.path {} must not be inside storage.upload_dir {}",
                    db.path.display(),
                    self.storage.upload_dir.display()
                )));
            }
        }
        let addr = self.server.address();
        addr.parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("server address {addr}: {e}")))?;
        Ok(())
    }

    /// The database descriptor, or the fatal bring-up error for its absence.
    pub fn database(&self) -> Result<&DatabaseConfig, BringUpError> {
        self.database.as_ref().ok_or(BringUpError::MissingDatabase)
    }
}

/// Absolute form of `path` with `.` and `..` folded away, without touching the filesystem.
fn lexical_absolute(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
