//! Roomdrop Crypto Library
//!
//! Per-room keys are derived from one process-wide secret; file contents are
//! stored as chunked AES-256-CBC blobs. Compromise of the secret compromises
//! every room.

pub mod keys;
pub mod stream;

pub use keys::{MasterSecret, RoomKey, derive_key};
pub use stream::{CipherError, Sealed, TAG_LEN, decrypt_stream, encrypt_stream};
