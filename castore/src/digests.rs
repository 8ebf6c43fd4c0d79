use bytes::Bytes;
use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The content address of a block.
///
/// This is the SHA-256 of the block plaintext, followed by the key material
/// if the store is encrypted. Ordering is plain byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId([u8; BLOCK_ID_LEN]);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid block id length: {0}")]
    InvalidLen(usize),

    #[error("invalid block id: {0}")]
    InvalidEncoding(String),
}

pub const BLOCK_ID_LEN: usize = 32;

const PREFIX: &str = "sha256:";

impl BlockId {
    /// Hashes all the given parts, in order, into a single id.
    pub fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl From<[u8; BLOCK_ID_LEN]> for BlockId {
    fn from(value: [u8; BLOCK_ID_LEN]) -> Self {
        Self(value)
    }
}

impl From<&[u8; BLOCK_ID_LEN]> for BlockId {
    fn from(value: &[u8; BLOCK_ID_LEN]) -> Self {
        Self(*value)
    }
}

impl From<BlockId> for [u8; BLOCK_ID_LEN] {
    fn from(value: BlockId) -> Self {
        value.0
    }
}

impl From<BlockId> for Bytes {
    fn from(value: BlockId) -> Self {
        Bytes::copy_from_slice(&value.0)
    }
}

impl TryFrom<&[u8]> for BlockId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let inner: [u8; BLOCK_ID_LEN] = value
            .try_into()
            .map_err(|_| Error::InvalidLen(value.len()))?;
        Ok(Self(inner))
    }
}

impl TryFrom<Vec<u8>> for BlockId {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        value.as_slice().try_into()
    }
}

impl TryFrom<Bytes> for BlockId {
    type Error = Error;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        value.as_ref().try_into()
    }
}

impl std::str::FromStr for BlockId {
    type Err = Error;

    /// Parses the `sha256:<hex>` form produced by [std::fmt::Display].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix(PREFIX).unwrap_or(s);
        let raw = HEXLOWER
            .decode(hex.as_bytes())
            .map_err(|e| Error::InvalidEncoding(e.to_string()))?;
        raw.try_into()
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", PREFIX, HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", PREFIX, HEXLOWER.encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockId, Error};
    use hex_literal::hex;

    #[test]
    fn display_and_parse() {
        let id = BlockId::hash_parts([b"hello".as_slice()]);
        assert_eq!(
            id,
            BlockId::from(hex!(
                "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
            ))
        );
        assert_eq!(
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
            id.to_string()
        );
        assert_eq!(id, id.to_string().parse().unwrap());
    }

    #[test]
    fn wrong_length() {
        assert_eq!(
            Err(Error::InvalidLen(3)),
            BlockId::try_from(vec![1u8, 2, 3])
        );
    }

    #[test]
    fn parts_are_concatenated() {
        assert_eq!(
            BlockId::hash_parts([b"hel".as_slice(), b"lo".as_slice()]),
            BlockId::hash_parts([b"hello".as_slice()])
        );
    }
}
