use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{FileRecord, MessageRecord, RoomView};

// -- Files --

/// A file as listed to clients, with human-readable size and time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub upload_time: DateTime<Utc>,
    pub formatted_size: String,
    /// `YYYY-MM-DD HH:MM:SS`, UTC.
    pub formatted_time: String,
}

impl From<FileRecord> for FileSummary {
    fn from(record: FileRecord) -> Self {
        Self {
            formatted_size: format_bytes(record.size),
            formatted_time: record.upload_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            id: record.id,
            name: record.name,
            size: record.size,
            upload_time: record.upload_time,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub files: Vec<FileSummary>,
}

// -- Rooms --

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomData {
    pub success: bool,
    pub files: Vec<FileSummary>,
    pub messages: Vec<MessageSummary>,
    pub storage_used: u64,
    pub max_storage: u64,
    pub storage_percent: f64,
}

impl From<RoomView> for RoomData {
    fn from(view: RoomView) -> Self {
        let storage_percent = if view.storage_max == 0 {
            0.0
        } else {
            let pct = view.storage_used as f64 / view.storage_max as f64 * 100.0;
            (pct * 100.0).round() / 100.0
        };
        Self {
            success: true,
            files: view.files.into_iter().map(FileSummary::from).collect(),
            messages: view.messages.into_iter().map(MessageSummary::from).collect(),
            storage_used: view.storage_used,
            max_storage: view.storage_max,
            storage_percent,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub success: bool,
    pub removed: usize,
}

// -- Messages --

/// A message as shown in the room, with its clock time and date split out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// `HH:MM:SS`, UTC.
    pub time: String,
    /// `YYYY-MM-DD`, UTC.
    pub date: String,
}

impl From<MessageRecord> for MessageSummary {
    fn from(record: MessageRecord) -> Self {
        Self {
            time: record.timestamp.format("%H:%M:%S").to_string(),
            date: record.timestamp.format("%Y-%m-%d").to_string(),
            id: record.id,
            text: record.text,
            timestamp: record.timestamp,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub success: bool,
    pub message: MessageSummary,
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Render a byte count in binary units with at most two decimals.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rendered = format!("{:.2}", value);
    let rendered = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", rendered, UNITS[unit])
}
