//! Streaming authenticated encryption for stored artifacts.
//!
//! Objects are sealed in fixed-size chunks with AES-256-GCM so that both
//! directions stay streaming. A stream starts with a 16 byte header:
//!
//! ```text
//! magic "GFS1" | nonce prefix (7) | chunk size (u32 BE) | reserved (1)
//! ```
//!
//! followed by ciphertext frames of `chunk size + 16` bytes, the last of
//! which may be shorter. Each chunk nonce is the prefix, a big endian chunk
//! counter and a final-chunk flag, and the header is authenticated as
//! associated data, so truncation, reordering and splicing are all detected.

pub mod keys;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::storage::{ByteStream, byte_stream};

pub use keys::{KeyStore, MemoryKeyStore};
#[cfg(feature = "database")]
pub use keys::PostgresKeyStore;

const MAGIC: &[u8; 4] = b"GFS1";
const HEADER_LEN: usize = 16;
const PREFIX_LEN: usize = 7;
const TAG_LEN: usize = 16;
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("ciphertext failed authentication")]
    Integrity,
    #[error("ciphertext ended before its final chunk")]
    Truncated,
    #[error("unrecognised cipher header")]
    BadHeader,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("encryption failed")]
    Seal,
}

impl From<CipherError> for std::io::Error {
    fn from(err: CipherError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

/// A 256-bit per-user content key.
#[derive(Clone)]
pub struct CipherKey(Zeroizing<[u8; 32]>);

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(<redacted>)")
    }
}

impl CipherKey {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(bytes.as_mut());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.as_ref())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|err| CipherError::InvalidKey(err.to_string()))?,
        );
        let bytes: [u8; 32] = decoded.as_slice().try_into().map_err(|_| {
            CipherError::InvalidKey(format!("expected 32 bytes, got {}", decoded.len()))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.0.as_ref()))
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    prefix: [u8; PREFIX_LEN],
    chunk_size: u32,
}

impl Header {
    fn random(chunk_size: u32) -> Self {
        let mut prefix = [0u8; PREFIX_LEN];
        rand::rng().fill_bytes(&mut prefix);
        Self { prefix, chunk_size }
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        out[4..11].copy_from_slice(&self.prefix);
        out[11..15].copy_from_slice(&self.chunk_size.to_be_bytes());
        out
    }

    fn decode(raw: &[u8]) -> Result<Self, CipherError> {
        if raw.len() < HEADER_LEN || &raw[..4] != MAGIC || raw[15] != 0 {
            return Err(CipherError::BadHeader);
        }
        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&raw[4..11]);
        let chunk_size = u32::from_be_bytes([raw[11], raw[12], raw[13], raw[14]]);
        if chunk_size == 0 {
            return Err(CipherError::BadHeader);
        }
        Ok(Self { prefix, chunk_size })
    }

    fn nonce(&self, counter: u32, last: bool) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..PREFIX_LEN].copy_from_slice(&self.prefix);
        nonce[7..11].copy_from_slice(&counter.to_be_bytes());
        nonce[11] = u8::from(last);
        nonce
    }
}

struct Sealer {
    cipher: Aes256Gcm,
    header: Header,
    aad: [u8; HEADER_LEN],
    counter: u32,
}

impl Sealer {
    fn seal(&mut self, plaintext: &[u8], last: bool) -> Result<Bytes, CipherError> {
        let nonce = self.header.nonce(self.counter, last);
        self.counter = self.counter.checked_add(1).ok_or(CipherError::Seal)?;
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &self.aad,
                },
            )
            .map(Bytes::from)
            .map_err(|_| CipherError::Seal)
    }

    fn open(&mut self, frame: &[u8], last: bool) -> Result<Bytes, CipherError> {
        let nonce = self.header.nonce(self.counter, last);
        self.counter = self.counter.checked_add(1).ok_or(CipherError::Integrity)?;
        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: frame,
                    aad: &self.aad,
                },
            )
            .map(Bytes::from)
            .map_err(|_| CipherError::Integrity)
    }

    fn verifies(&self, frame: &[u8], counter: u32, last: bool) -> bool {
        let nonce = self.header.nonce(counter, last);
        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: frame,
                    aad: &self.aad,
                },
            )
            .is_ok()
    }
}

/// Encrypts `plaintext` chunk by chunk under `key`.
pub fn encrypt_stream(key: &CipherKey, plaintext: ByteStream) -> ByteStream {
    encrypt_stream_with_chunk(key, plaintext, DEFAULT_CHUNK_SIZE)
}

pub fn encrypt_stream_with_chunk(
    key: &CipherKey,
    mut plaintext: ByteStream,
    chunk_size: u32,
) -> ByteStream {
    let header = Header::random(chunk_size.max(1));
    let aad = header.encode();
    let mut sealer = Sealer {
        cipher: key.cipher(),
        header,
        aad,
        counter: 0,
    };
    let chunk = header.chunk_size as usize;

    byte_stream(async_stream::try_stream! {
        yield Bytes::copy_from_slice(&aad);
        let mut buffer = BytesMut::new();
        while let Some(next) = plaintext.next().await {
            buffer.extend_from_slice(&next?);
            // Hold back one full chunk so the final one can be flagged.
            while buffer.len() > chunk {
                let piece = buffer.split_to(chunk);
                yield sealer.seal(&piece, false)?;
            }
        }
        yield sealer.seal(&buffer, true)?;
    })
}

/// Verifies and decrypts a stream produced by [`encrypt_stream`]. Any
/// tampering surfaces as an `InvalidData` error wrapping a [`CipherError`].
pub fn decrypt_stream(key: &CipherKey, mut ciphertext: ByteStream) -> ByteStream {
    let cipher = key.cipher();

    byte_stream(async_stream::try_stream! {
        let mut buffer = BytesMut::new();
        let mut opener: Option<Sealer> = None;

        loop {
            let next = ciphertext.next().await;
            let done = next.is_none();
            if let Some(chunk) = next {
                buffer.extend_from_slice(&chunk?);
            }

            if opener.is_none() {
                if buffer.len() < HEADER_LEN {
                    if done {
                        let err = if buffer.is_empty() { CipherError::Truncated } else { CipherError::BadHeader };
                        Err::<(), _>(err)?;
                    }
                    continue;
                }
                let header = Header::decode(&buffer[..HEADER_LEN])?;
                let aad = header.encode();
                buffer.advance(HEADER_LEN);
                opener = Some(Sealer { cipher: cipher.clone(), header, aad, counter: 0 });
            }

            let Some(state) = opener.as_mut() else { continue };
            let frame_len = state.header.chunk_size as usize + TAG_LEN;

            // A full frame is only known to be non-final once more bytes follow it.
            while buffer.len() > frame_len {
                let frame = buffer.split_to(frame_len);
                yield state.open(&frame, false)?;
            }

            if done {
                if buffer.len() < TAG_LEN {
                    Err::<(), _>(CipherError::Truncated)?;
                }
                let frame = buffer.split();
                let counter = state.counter;
                let plain = state.open(&frame, true).map_err(|err| {
                    // A frame that verifies as non-final means the real end was cut off.
                    if state.verifies(&frame, counter, false) {
                        CipherError::Truncated
                    } else {
                        err
                    }
                })?;
                if !plain.is_empty() {
                    yield plain;
                }
                break;
            }
        }
    })
}
