use crate::error::TransferError;
use crate::request::TransferRequest;
use crate::status::TransferStatus;
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Placeholder total used while the server has not declared a length.
pub const UNKNOWN_SIZE_SENTINEL: i64 = i64::MAX;

/// Persistent state of one transfer, keyed by `tag`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub tag: String,
    pub url: String,
    pub folder: Option<String>,
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub temp_file_name: Option<String>,
    pub fraction: f32,
    pub total_size: i64,
    pub current_size: i64,
    /// Bytes per second; never persisted.
    pub speed: i64,
    pub status: TransferStatus,
    pub priority: i32,
    pub date: i64,
    pub file_suffix: Option<String>,
    pub request: TransferRequest,
    /// Change token (ETag or Last-Modified) of the last response.
    pub extra1: Option<String>,
    pub extra2: Option<Vec<u8>>,
    pub extra3: Option<Vec<u8>>,
    /// Cause of the last `Error` transition; never persisted.
    pub error: Option<TransferError>,
}

impl TransferRecord {
    pub fn new(tag: impl Into<String>, request: TransferRequest) -> Self {
        Self {
            tag: tag.into(),
            url: request.url.clone(),
            folder: None,
            file_path: None,
            file_name: None,
            temp_file_name: None,
            fraction: 0.0,
            total_size: -1,
            current_size: 0,
            speed: 0,
            status: TransferStatus::None,
            priority: 0,
            date: Utc::now().timestamp_millis(),
            file_suffix: None,
            request,
            extra1: None,
            extra2: None,
            extra3: None,
            error: None,
        }
    }

    /// True once a finite total has been learned from the server.
    pub fn has_known_total(&self) -> bool {
        self.total_size >= 0 && self.total_size != UNKNOWN_SIZE_SENTINEL
    }

    /// Recomputes `fraction` from the byte counters.
    pub fn refresh_fraction(&mut self) {
        self.fraction = if self.has_known_total() && self.total_size > 0 {
            (self.current_size as f64 / self.total_size as f64).min(1.0) as f32
        } else {
            0.0
        };
    }

    pub fn folder_path(&self) -> Option<&Path> {
        self.folder.as_deref().map(Path::new)
    }

    /// `folder/file_name` when both are configured.
    pub fn derived_file_path(&self) -> Option<PathBuf> {
        match (self.folder.as_deref(), self.file_name.as_deref()) {
            (Some(folder), Some(name)) if !folder.is_empty() && !name.is_empty() => {
                Some(Path::new(folder).join(name))
            }
            _ => None,
        }
    }

    pub fn temp_file_path(&self) -> Option<PathBuf> {
        match (self.folder.as_deref(), self.temp_file_name.as_deref()) {
            (Some(folder), Some(name)) if !name.is_empty() => Some(Path::new(folder).join(name)),
            _ => None,
        }
    }

    /// The file bytes are written to: the temp file when configured, else the final path.
    pub fn download_file_path(&self) -> Option<PathBuf> {
        self.temp_file_path()
            .or_else(|| self.file_path.as_deref().map(PathBuf::from))
    }

    /// `folder/file_name + file_suffix`, checked when a finished file was renamed by the caller.
    pub fn suffixed_file_path(&self) -> Option<PathBuf> {
        let suffix = self.file_suffix.as_deref().filter(|s| !s.is_empty())?;
        let name = self.file_name.as_deref()?;
        let parent = self
            .file_path
            .as_deref()
            .and_then(|p| Path::new(p).parent().map(Path::to_path_buf))
            .or_else(|| self.folder_path().map(Path::to_path_buf))?;
        Some(parent.join(format!("{}{}", name, suffix)))
    }
}

/// A sparse update of a persisted record. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub url: Option<String>,
    pub folder: Option<Option<String>>,
    pub file_path: Option<Option<String>>,
    pub file_name: Option<Option<String>>,
    pub fraction: Option<f32>,
    pub total_size: Option<i64>,
    pub current_size: Option<i64>,
    pub status: Option<TransferStatus>,
    pub priority: Option<i32>,
    pub date: Option<i64>,
    pub extra1: Option<Option<String>>,
}

impl RecordPatch {
    /// The columns that change while a transfer runs.
    pub fn progress(record: &TransferRecord) -> Self {
        Self {
            url: Some(record.url.clone()),
            folder: Some(record.folder.clone()),
            file_path: Some(record.file_path.clone()),
            file_name: Some(record.file_name.clone()),
            fraction: Some(record.fraction),
            total_size: Some(record.total_size),
            current_size: Some(record.current_size),
            status: Some(record.status),
            priority: Some(record.priority),
            date: Some(record.date),
            extra1: Some(record.extra1.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == RecordPatch::default()
    }

    pub fn apply(&self, record: &mut TransferRecord) {
        if let Some(url) = &self.url {
            record.url = url.clone();
        }
        if let Some(folder) = &self.folder {
            record.folder = folder.clone();
        }
        if let Some(file_path) = &self.file_path {
            record.file_path = file_path.clone();
        }
        if let Some(file_name) = &self.file_name {
            record.file_name = file_name.clone();
        }
        if let Some(fraction) = self.fraction {
            record.fraction = fraction;
        }
        if let Some(total_size) = self.total_size {
            record.total_size = total_size;
        }
        if let Some(current_size) = self.current_size {
            record.current_size = current_size;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
        if let Some(date) = self.date {
            record.date = date;
        }
        if let Some(extra1) = &self.extra1 {
            record.extra1 = extra1.clone();
        }
    }
}
