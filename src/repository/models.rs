use crate::record::RecordPatch;
use serde::{Deserialize, Serialize};

/// Row of the `download` / `upload` tables as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DBTransferRecord {
    pub tag: String,
    pub url: String,
    pub folder: Option<String>,
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub fraction: Option<String>,
    pub total_size: i64,
    pub current_size: i64,
    pub status: i64, // 0 None / 1 Waiting / 2 Loading / 3 Pause / 4 Error / 5 Finish
    pub priority: i64,
    pub date: i64,
    pub request: Option<Vec<u8>>,
    pub extra1: Option<Vec<u8>>,
    pub extra2: Option<Vec<u8>>,
    pub extra3: Option<Vec<u8>>,
    pub file_suffix: Option<String>,
    pub temp_file_name: Option<String>,
}

impl DBTransferRecord {
    pub fn apply_patch(&mut self, patch: &RecordPatch) {
        if let Some(url) = &patch.url {
            self.url = url.clone();
        }
        if let Some(folder) = &patch.folder {
            self.folder = folder.clone();
        }
        if let Some(file_path) = &patch.file_path {
            self.file_path = file_path.clone();
        }
        if let Some(file_name) = &patch.file_name {
            self.file_name = file_name.clone();
        }
        if let Some(fraction) = patch.fraction {
            self.fraction = Some(fraction.to_string());
        }
        if let Some(total_size) = patch.total_size {
            self.total_size = total_size;
        }
        if let Some(current_size) = patch.current_size {
            self.current_size = current_size;
        }
        if let Some(status) = patch.status {
            self.status = status.code();
        }
        if let Some(priority) = patch.priority {
            self.priority = priority as i64;
        }
        if let Some(date) = patch.date {
            self.date = date;
        }
        if let Some(extra1) = &patch.extra1 {
            self.extra1 = extra1.as_ref().map(|s| s.as_bytes().to_vec());
        }
    }
}
