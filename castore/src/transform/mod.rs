//! Converts block plaintext to and from its stored representation, and
//! derives the content address.
//!
//! A stored block is laid out as `[u32 BE header][extra][payload]`. The
//! header bits say which transforms were applied. `extra` holds, in order
//! and only when the matching bit is set: the 12 byte GCM nonce, the u32 BE
//! unpadded length and the u32 BE uncompressed length.
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::Aes256Gcm;
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use sha2::Sha256;
use tracing::{instrument, trace};

use crate::{BlockId, Error};

pub const DEFAULT_SALT: &[u8] = b"tfhfs";
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;

const HEADER_LEN: usize = 4;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransformHeader: u32 {
        /// LZ4 block format.
        const COMPRESSED = 1;
        /// AES-256-GCM.
        const ENCRYPTED = 1 << 1;
        /// Zero-filled up to a multiple of the padding granule.
        const PADDED = 1 << 2;
    }
}

/// Symmetric key material used both for addressing and encryption.
#[derive(Clone, PartialEq, Eq)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// PBKDF2-HMAC-SHA256 over the passphrase.
    ///
    /// The salt must be the same on every machine sharing the store, as the
    /// key feeds into block ids.
    pub fn derive(passphrase: &[u8], salt: &[u8], iterations: u32) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(&self.0))
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key(<redacted>)")
    }
}

/// A block after encoding, ready to be handed to a backend.
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    pub id: BlockId,
    pub header: TransformHeader,
    pub extra: Bytes,
    pub payload: Bytes,
}

impl EncodedBlock {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.extra.len() + self.payload.len());
        buf.put_u32(self.header.bits());
        buf.put_slice(&self.extra);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Encodes and decodes blocks for one store configuration.
#[derive(Debug, Clone)]
pub struct BlockCodec {
    key: Option<Key>,
    compress: bool,
    pad_to: Option<u32>,
}

impl Default for BlockCodec {
    fn default() -> Self {
        Self::new(None)
    }
}

impl BlockCodec {
    pub fn new(key: Option<Key>) -> Self {
        Self {
            key,
            compress: true,
            pad_to: None,
        }
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Rounds stored payloads up to a multiple of `pad_to` bytes.
    pub fn with_padding(mut self, pad_to: Option<u32>) -> Self {
        self.pad_to = pad_to.filter(|granule| *granule > 1);
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    pub fn id_for(&self, plaintext: &[u8]) -> BlockId {
        match &self.key {
            Some(key) => BlockId::hash_parts([plaintext, &key.0[..]]),
            None => BlockId::hash_parts([plaintext]),
        }
    }

    #[instrument(level = "trace", skip_all, fields(plaintext.len = plaintext.len()), err)]
    pub fn encode(&self, plaintext: &[u8]) -> Result<EncodedBlock, Error> {
        let id = self.id_for(plaintext);
        let mut header = TransformHeader::empty();
        let mut payload = None;
        let mut uncompressed_len = None;
        let mut unpadded_len = None;

        if self.compress && !plaintext.is_empty() {
            let compressed = lz4_flex::block::compress(plaintext);
            if compressed.len() < plaintext.len() {
                header |= TransformHeader::COMPRESSED;
                uncompressed_len = Some(length_u32(plaintext.len())?);
                payload = Some(compressed);
            }
        }
        let mut payload = payload.unwrap_or_else(|| plaintext.to_vec());

        if let Some(granule) = self.pad_to {
            let granule = granule as usize;
            let padded = payload.len().div_ceil(granule) * granule;
            if padded != payload.len() {
                header |= TransformHeader::PADDED;
                unpadded_len = Some(length_u32(payload.len())?);
                payload.resize(padded, 0);
            }
        }

        let nonce = self
            .key
            .as_ref()
            .map(|_| Aes256Gcm::generate_nonce(&mut OsRng));
        if nonce.is_some() {
            header |= TransformHeader::ENCRYPTED;
        }

        let mut extra = BytesMut::new();
        if let Some(nonce) = &nonce {
            extra.put_slice(nonce.as_slice());
        }
        if let Some(len) = unpadded_len {
            extra.put_u32(len);
        }
        if let Some(len) = uncompressed_len {
            extra.put_u32(len);
        }

        if let (Some(key), Some(nonce)) = (&self.key, &nonce) {
            let aad = associated_data(&id, header, &extra);
            payload = key
                .cipher()
                .encrypt(
                    nonce,
                    Payload {
                        msg: &payload,
                        aad: &aad,
                    },
                )
                .map_err(|_| Error::StorageError("block encryption failed".into()))?;
        }

        trace!(block.id = %id, ?header, payload.len = payload.len(), "encoded block");

        Ok(EncodedBlock {
            id,
            header,
            extra: extra.freeze(),
            payload: payload.into(),
        })
    }

    /// Inverts [BlockCodec::encode] and checks the result against `id`.
    #[instrument(level = "trace", skip(self, stored), fields(block.id = %id), err)]
    pub fn decode(&self, id: &BlockId, stored: &[u8]) -> Result<Bytes, Error> {
        if stored.len() < HEADER_LEN {
            return Err(Error::Format(format!("block {} is truncated", id)));
        }
        let (raw_header, rest) = stored.split_at(HEADER_LEN);
        let raw_header =
            u32::from_be_bytes([raw_header[0], raw_header[1], raw_header[2], raw_header[3]]);
        let header = TransformHeader::from_bits(raw_header).ok_or_else(|| {
            Error::Format(format!(
                "block {} has unknown transform header {:#x}",
                id, raw_header
            ))
        })?;

        let mut cursor = ExtraCursor { id, rest, read: 0 };
        let nonce = if header.contains(TransformHeader::ENCRYPTED) {
            Some(cursor.take(NONCE_LEN)?)
        } else {
            None
        };
        let unpadded_len = if header.contains(TransformHeader::PADDED) {
            Some(cursor.take_u32()?)
        } else {
            None
        };
        let uncompressed_len = if header.contains(TransformHeader::COMPRESSED) {
            Some(cursor.take_u32()?)
        } else {
            None
        };
        let (extra, payload) = rest.split_at(cursor.read);

        let mut data = match nonce {
            Some(nonce) => {
                let key = self.key.as_ref().ok_or_else(|| {
                    Error::InvalidRequest(format!(
                        "block {} is encrypted, but no key is configured",
                        id
                    ))
                })?;
                let aad = associated_data(id, header, extra);
                key.cipher()
                    .decrypt(
                        GenericArray::from_slice(nonce),
                        Payload {
                            msg: payload,
                            aad: &aad,
                        },
                    )
                    .map_err(|_| {
                        Error::Integrity(format!("block {} failed authentication", id))
                    })?
            }
            None => payload.to_vec(),
        };

        if let Some(len) = unpadded_len {
            let len = len as usize;
            if len > data.len() {
                return Err(Error::Integrity(format!(
                    "block {} claims {} unpadded bytes, has {}",
                    id,
                    len,
                    data.len()
                )));
            }
            data.truncate(len);
        }

        if let Some(len) = uncompressed_len {
            // LZ4 cannot expand by more than 255:1, so anything larger is a
            // corrupted length field rather than a huge allocation.
            if len as usize > data.len().saturating_mul(255).saturating_add(16) {
                return Err(Error::Integrity(format!(
                    "block {} claims implausible uncompressed length {}",
                    id, len
                )));
            }
            data = lz4_flex::block::decompress(&data, len as usize).map_err(|e| {
                Error::Integrity(format!("block {} failed to decompress: {}", id, e))
            })?;
        }

        if self.id_for(&data) != *id {
            return Err(Error::Integrity(format!(
                "block {} does not match its content",
                id
            )));
        }

        Ok(data.into())
    }
}

fn length_u32(len: usize) -> Result<u32, Error> {
    u32::try_from(len)
        .map_err(|_| Error::InvalidRequest(format!("block of {} bytes is too large", len)))
}

/// The GCM associated data binds the ciphertext to its name and to its
/// transform metadata.
fn associated_data(id: &BlockId, header: TransformHeader, extra: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(id.as_slice().len() + HEADER_LEN + extra.len());
    aad.extend_from_slice(id.as_slice());
    aad.extend_from_slice(&header.bits().to_be_bytes());
    aad.extend_from_slice(extra);
    aad
}

struct ExtraCursor<'a> {
    id: &'a BlockId,
    rest: &'a [u8],
    read: usize,
}

impl<'a> ExtraCursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self.read + n;
        if end > self.rest.len() {
            return Err(Error::Format(format!(
                "block {} has truncated transform extra",
                self.id
            )));
        }
        let slice = &self.rest[self.read..end];
        self.read = end;
        Ok(slice)
    }

    fn take_u32(&mut self) -> Result<u32, Error> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests;
