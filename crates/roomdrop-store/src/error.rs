use roomdrop_crypto::CipherError;
use roomdrop_types::InvalidRoomId;
use thiserror::Error;

/// Why an upload was refused before anything was persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("file type not allowed")]
    UnsafeType,
    #[error("file exceeds the per-file size limit")]
    TooLarge,
    #[error("room storage is full")]
    RoomFull,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed room code, empty message, bad file id. No side effects.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("rejected: {0}")]
    Rejected(PolicyViolation),
    #[error("not found")]
    NotFound,
    #[error("decryption failed")]
    CipherMismatch,
    #[error(transparent)]
    StorageFault(#[from] anyhow::Error),
}

impl StoreError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<PolicyViolation> for StoreError {
    fn from(v: PolicyViolation) -> Self {
        Self::Rejected(v)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::StorageFault(e.into())
    }
}

impl From<CipherError> for StoreError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::Mismatch => Self::CipherMismatch,
            CipherError::Io(io) => Self::StorageFault(io.into()),
        }
    }
}

impl From<InvalidRoomId> for StoreError {
    fn from(e: InvalidRoomId) -> Self {
        Self::InvalidInput(e.to_string())
    }
}
