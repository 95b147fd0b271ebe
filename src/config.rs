use crate::persistence::{PersistenceType, TransferTable};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Default destination folder for new tasks.
    pub folder: PathBuf,
    /// Number of transfers allowed to run at once.
    pub worker_threads: usize,
    /// Bytes written per loop iteration; also the progress notification granularity.
    pub chunk_size: usize,
    #[serde(with = "humantime_serde_compat")]
    pub connection_timeout: Duration,
    pub persistence_type: PersistenceType,
    pub table: TransferTable,
    /// Capacity of the listener delivery queue.
    pub callback_queue: usize,
    pub debug: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("downloads"),
            worker_threads: 3,
            chunk_size: DEFAULT_CHUNK_SIZE,
            connection_timeout: Duration::from_secs(30),
            persistence_type: PersistenceType::Sqlite("rangeload.db".into()),
            table: TransferTable::Download,
            callback_queue: 256,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferConfigBuilder {
    inner: TransferConfig,
}

impl TransferConfigBuilder {
    pub fn new() -> Self {
        Self {
            inner: TransferConfig::default(),
        }
    }

    pub fn folder(mut self, dir: impl Into<PathBuf>) -> Self {
        self.inner.folder = dir.into();
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.inner.worker_threads = n;
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.inner.chunk_size = bytes;
        self
    }

    pub fn connection_timeout(mut self, secs: u64) -> Self {
        self.inner.connection_timeout = Duration::from_secs(secs);
        self
    }

    pub fn persistence_type(mut self, p: PersistenceType) -> Self {
        self.inner.persistence_type = p;
        self
    }

    pub fn table(mut self, table: TransferTable) -> Self {
        self.inner.table = table;
        self
    }

    pub fn callback_queue(mut self, capacity: usize) -> Self {
        self.inner.callback_queue = capacity;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.inner.debug = debug;
        self
    }

    pub fn build(self) -> Result<TransferConfig, TransferConfigError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[derive(Debug, Error)]
pub enum TransferConfigError {
    #[error("Invalid download folder: {0}")]
    InvalidFolder(String),
    #[error("Invalid number of workers: {0}")]
    InvalidWorkers(usize),
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(usize),
    #[error("Invalid callback queue capacity: {0}")]
    InvalidCallbackQueue(usize),
    #[error("Failed to read config file {0}: {1}")]
    Read(String, String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), TransferConfigError> {
        if self.folder.as_os_str().is_empty() {
            return Err(TransferConfigError::InvalidFolder(
                self.folder.to_string_lossy().to_string(),
            ));
        }

        if self.worker_threads == 0 || self.worker_threads > 64 {
            return Err(TransferConfigError::InvalidWorkers(self.worker_threads));
        }

        if self.chunk_size == 0 {
            return Err(TransferConfigError::InvalidChunkSize(self.chunk_size));
        }

        if self.callback_queue == 0 {
            return Err(TransferConfigError::InvalidCallbackQueue(self.callback_queue));
        }

        Ok(())
    }

    /// Loads and validates a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, TransferConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TransferConfigError::Read(path.display().to_string(), e.to_string()))?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }
}

impl FromStr for TransferConfig {
    type Err = TransferConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(|e| TransferConfigError::Parse(e.to_string()))
    }
}

/// Durations are written as human readable strings such as `"30s"`.
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
