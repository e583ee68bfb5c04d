use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of ASCII digits in a room code.
pub const ROOM_CODE_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("room code must be exactly {ROOM_CODE_LEN} ASCII digits")]
pub struct InvalidRoomId;

/// A 4-digit room code. Kept as a string so leading zeros survive.
///
/// Construction is the only validation point; every `RoomId` in the system
/// has already passed it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    pub fn parse(code: &str) -> Result<Self, InvalidRoomId> {
        if code.len() == ROOM_CODE_LEN && code.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(code.to_string()))
        } else {
            Err(InvalidRoomId)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RoomId {
    type Err = InvalidRoomId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = InvalidRoomId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata for one stored file. The plaintext itself only exists on disk
/// as a ciphertext blob addressed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    /// Original filename as supplied by the uploader. Display only.
    pub name: String,
    /// Plaintext size in bytes.
    pub size: u64,
    pub upload_time: DateTime<Utc>,
}

/// A chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    /// Markup-escaped text.
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of a room, computed on every read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    pub files: Vec<FileRecord>,
    pub messages: Vec<MessageRecord>,
    pub storage_used: u64,
    pub storage_max: u64,
}
