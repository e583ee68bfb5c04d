use std::fmt;

use sha2::{Digest, Sha256};

/// Process-wide secret every room key is derived from.
///
/// The [`Debug`] implementation is redacted so the secret never reaches logs.
#[derive(Clone)]
pub struct MasterSecret(Vec<u8>);

impl MasterSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(secret.into())
    }

    /// Derive the 256-bit key for one room: `SHA-256(secret || room)`.
    ///
    /// Deterministic, so keys are recomputed per operation and never stored.
    pub fn derive_room_key(&self, room: &str) -> RoomKey {
        derive_key(&self.0, room)
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret([REDACTED])")
    }
}

/// A per-room AES-256 key.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey([u8; 32]);

impl RoomKey {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Separate key for blob tags, so the cipher key is never reused as a
    /// MAC key.
    pub(crate) fn mac_key(&self) -> [u8; 32] {
        Sha256::new()
            .chain_update(b"roomdrop blob tag")
            .chain_update(self.0)
            .finalize()
            .into()
    }
}

impl fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoomKey([REDACTED])")
    }
}

pub fn derive_key(secret: &[u8], room: &str) -> RoomKey {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(room.as_bytes());
    RoomKey(hasher.finalize().into())
}
