//! Chunked AES-256-CBC stream.
//!
//! Blob layout: `[16-byte IV][ciphertext...]`. Plaintext is read in
//! [`CHUNK_SIZE`] pieces; every chunk after the first uses the last ciphertext
//! block of the previous chunk as its IV, which is exactly CBC chaining. Only
//! the final chunk is PKCS#7 padded, so the output is byte-identical to
//! encrypting the whole plaintext in one CBC pass.
//!
//! Encryption also returns an HMAC-SHA256 tag over IV and ciphertext. The tag
//! is kept next to the blob's metadata; decryption checks it before the final
//! chunk is released, so a wrong key or a modified blob is always a
//! [`CipherError::Mismatch`].

use aes::Aes256;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::keys::RoomKey;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Plaintext bytes encrypted per chunk.
pub const CHUNK_SIZE: usize = 8 * 1024;
/// Ciphertext bytes consumed per decryption step.
pub const DECRYPT_CHUNK_SIZE: usize = CHUNK_SIZE + BLOCK_SIZE;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 32;
const BLOCK_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CipherError {
    /// Wrong key, truncated or corrupted blob. Deliberately carries no detail.
    #[error("decryption failed")]
    Mismatch,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What an encryption pass produced besides the blob itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub plaintext_len: u64,
    pub tag: [u8; TAG_LEN],
}

fn blob_mac(key: &RoomKey) -> Result<HmacSha256, CipherError> {
    HmacSha256::new_from_slice(&key.mac_key())
        .map_err(|_| std::io::Error::other("invalid MAC key length").into())
}

/// Encrypt `reader` into `writer` under a fresh random IV.
pub async fn encrypt_stream<R, W>(key: &RoomKey, reader: &mut R, writer: &mut W) -> Result<Sealed, CipherError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);
    encrypt_stream_with_iv(key, iv, reader, writer).await
}

async fn encrypt_stream_with_iv<R, W>(
    key: &RoomKey,
    mut iv: [u8; IV_LEN],
    reader: &mut R,
    writer: &mut W,
) -> Result<Sealed, CipherError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut mac = blob_mac(key)?;
    mac.update(&iv);
    writer.write_all(&iv).await?;

    // Extra block of headroom for the final padding.
    let mut buf = vec![0u8; CHUNK_SIZE + BLOCK_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = read_full(reader, &mut buf[..CHUNK_SIZE]).await?;
        total += n as u64;
        let enc = Aes256CbcEnc::new(&(*key.as_bytes()).into(), &iv.into());

        if n == CHUNK_SIZE {
            let ct = enc
                .encrypt_padded_mut::<NoPadding>(&mut buf, CHUNK_SIZE)
                .map_err(|_| std::io::Error::other("unaligned cipher chunk"))?;
            iv.copy_from_slice(&ct[ct.len() - BLOCK_SIZE..]);
            mac.update(ct);
            writer.write_all(ct).await?;
        } else {
            let ct = enc
                .encrypt_padded_mut::<Pkcs7>(&mut buf, n)
                .map_err(|_| std::io::Error::other("padding buffer too small"))?;
            mac.update(ct);
            writer.write_all(ct).await?;
            break;
        }
    }

    writer.flush().await?;
    Ok(Sealed {
        plaintext_len: total,
        tag: mac.finalize().into_bytes().into(),
    })
}

/// Decrypt a blob from `reader` into `writer`.
/// Returns the number of plaintext bytes written.
///
/// Fails with [`CipherError::Mismatch`] unless `tag` authenticates the blob
/// under `key` and exactly `expected_len` bytes come out. Both are checked
/// before the final chunk is written, but earlier chunks may already be in
/// `writer`; callers must discard the output on error.
pub async fn decrypt_stream<R, W>(
    key: &RoomKey,
    reader: R,
    writer: &mut W,
    expected_len: u64,
    tag: &[u8],
) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);

    let mut iv = [0u8; IV_LEN];
    match reader.read_exact(&mut iv).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(CipherError::Mismatch),
        Err(e) => return Err(e.into()),
    }
    let mut mac = blob_mac(key)?;
    mac.update(&iv);

    let mut buf = vec![0u8; DECRYPT_CHUNK_SIZE];
    let mut total: u64 = 0;

    let last_len = loop {
        let n = read_full(&mut reader, &mut buf).await?;
        if n == 0 || n % BLOCK_SIZE != 0 {
            return Err(CipherError::Mismatch);
        }
        mac.update(&buf[..n]);
        if n < buf.len() || reader.fill_buf().await?.is_empty() {
            break n;
        }

        // Next IV is the last block of the ciphertext, captured before the
        // buffer is decrypted in place.
        let mut next_iv = [0u8; IV_LEN];
        next_iv.copy_from_slice(&buf[n - BLOCK_SIZE..n]);

        let pt = Aes256CbcDec::new(&(*key.as_bytes()).into(), &iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buf[..n])
            .map_err(|_| CipherError::Mismatch)?;
        writer.write_all(pt).await?;
        total += pt.len() as u64;
        iv = next_iv;
    };

    mac.verify_slice(tag).map_err(|_| CipherError::Mismatch)?;

    let pt = Aes256CbcDec::new(&(*key.as_bytes()).into(), &iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf[..last_len])
        .map_err(|_| CipherError::Mismatch)?;
    total += pt.len() as u64;
    if total != expected_len {
        return Err(CipherError::Mismatch);
    }
    writer.write_all(pt).await?;
    writer.flush().await?;
    Ok(total)
}

/// Size of the blob produced for `plaintext_len` bytes.
pub fn ciphertext_len(plaintext_len: u64) -> u64 {
    let block = BLOCK_SIZE as u64;
    IV_LEN as u64 + (plaintext_len / block + 1) * block
}

/// Fill `buf` unless the reader hits EOF first. Returns bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
