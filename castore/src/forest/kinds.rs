//! The flavours of B+ trees stored in a forest, and the values they hold.
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use std::fmt::Debug;

use super::node::NodeKind;
use super::path::PathComponent;
use crate::proto::{self, EntryKind};
use crate::{BlockId, Error};

/// Key and value encoding of one flavour of tree.
pub trait TreeKind: Send + Sync + 'static {
    const NODE_KIND: NodeKind;

    type Key: Clone + Debug + Send + Sync + 'static;
    type Value: Clone + Debug + PartialEq + Send + Sync + 'static;

    fn encode_key(key: &Self::Key) -> Bytes;
    fn decode_key(raw: &Bytes) -> Result<Self::Key, Error>;
    fn encode_value(value: &Self::Value) -> Bytes;
    fn decode_value(raw: &[u8]) -> Result<Self::Value, Error>;

    /// Blocks a value keeps alive.
    fn references(value: &Self::Value) -> Vec<BlockId>;
}

/// Metadata of a directory entry. Timestamps are nanoseconds since the unix
/// epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub ctime: u64,
}

/// Where the content of a regular file lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLayout {
    Empty,
    /// A single data block.
    Block(BlockId),
    /// A [FileBlockTree] of data blocks.
    Tree(BlockId),
}

impl FileLayout {
    pub fn block(&self) -> Option<BlockId> {
        match self {
            FileLayout::Empty => None,
            FileLayout::Block(id) | FileLayout::Tree(id) => Some(*id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryTarget {
    /// Root of the child directory tree.
    Directory(BlockId),
    File { layout: FileLayout, size: u64 },
    Symlink(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub target: EntryTarget,
    pub meta: Metadata,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        matches!(self.target, EntryTarget::Directory(_))
    }

    pub fn size(&self) -> u64 {
        match &self.target {
            EntryTarget::Directory(_) => 0,
            EntryTarget::File { size, .. } => *size,
            EntryTarget::Symlink(target) => target.len() as u64,
        }
    }

    /// The block this entry keeps alive, if any.
    pub fn block(&self) -> Option<BlockId> {
        match &self.target {
            EntryTarget::Directory(id) => Some(*id),
            EntryTarget::File { layout, .. } => layout.block(),
            EntryTarget::Symlink(_) => None,
        }
    }
}

impl From<&DirEntry> for proto::DirEntry {
    fn from(entry: &DirEntry) -> Self {
        let (kind, target, size) = match &entry.target {
            EntryTarget::Directory(id) => (EntryKind::Directory, Bytes::from(*id), 0),
            EntryTarget::File {
                layout: FileLayout::Empty,
                size,
            } => (EntryKind::FileEmpty, Bytes::new(), *size),
            EntryTarget::File {
                layout: FileLayout::Block(id),
                size,
            } => (EntryKind::FileBlock, Bytes::from(*id), *size),
            EntryTarget::File {
                layout: FileLayout::Tree(id),
                size,
            } => (EntryKind::FileTree, Bytes::from(*id), *size),
            EntryTarget::Symlink(dest) => (EntryKind::Symlink, dest.clone(), dest.len() as u64),
        };

        proto::DirEntry {
            kind: kind as i32,
            target,
            mode: entry.meta.mode,
            uid: entry.meta.uid,
            gid: entry.meta.gid,
            size,
            mtime: entry.meta.mtime,
            ctime: entry.meta.ctime,
        }
    }
}

impl TryFrom<proto::DirEntry> for DirEntry {
    type Error = Error;

    fn try_from(entry: proto::DirEntry) -> Result<Self, Self::Error> {
        let block = |target: &Bytes| BlockId::try_from(target.as_ref()).map_err(Error::from);
        let target = match EntryKind::try_from(entry.kind) {
            Ok(EntryKind::Directory) => EntryTarget::Directory(block(&entry.target)?),
            Ok(EntryKind::FileEmpty) => EntryTarget::File {
                layout: FileLayout::Empty,
                size: entry.size,
            },
            Ok(EntryKind::FileBlock) => EntryTarget::File {
                layout: FileLayout::Block(block(&entry.target)?),
                size: entry.size,
            },
            Ok(EntryKind::FileTree) => EntryTarget::File {
                layout: FileLayout::Tree(block(&entry.target)?),
                size: entry.size,
            },
            Ok(EntryKind::Symlink) => EntryTarget::Symlink(entry.target),
            Ok(EntryKind::Unspecified) | Err(_) => {
                return Err(Error::Format(format!(
                    "invalid directory entry kind {}",
                    entry.kind
                )))
            }
        };

        Ok(DirEntry {
            target,
            meta: Metadata {
                mode: entry.mode,
                uid: entry.uid,
                gid: entry.gid,
                mtime: entry.mtime,
                ctime: entry.ctime,
            },
        })
    }
}

/// One directory. Keys order entries by the murmur3 hash of their name, then
/// by the name itself.
pub struct DirectoryTree;

pub fn name_hash(name: &[u8]) -> u32 {
    let mut reader = name;
    // reading from a slice does not fail
    murmur3::murmur3_32(&mut reader, 0).unwrap_or_default()
}

impl TreeKind for DirectoryTree {
    const NODE_KIND: NodeKind = NodeKind::Directory;

    type Key = PathComponent;
    type Value = DirEntry;

    fn encode_key(key: &PathComponent) -> Bytes {
        let name = key.as_bytes();
        let mut buf = BytesMut::with_capacity(4 + name.len());
        buf.put_u32(name_hash(name));
        buf.put_slice(name);
        buf.freeze()
    }

    fn decode_key(raw: &Bytes) -> Result<PathComponent, Error> {
        if raw.len() < 5 {
            return Err(Error::Format(format!(
                "directory key of {} bytes is too short",
                raw.len()
            )));
        }
        PathComponent::try_from(raw.slice(4..)).map_err(|e| Error::Format(e.to_string()))
    }

    fn encode_value(value: &DirEntry) -> Bytes {
        proto::DirEntry::from(value).encode_to_vec().into()
    }

    fn decode_value(raw: &[u8]) -> Result<DirEntry, Error> {
        proto::DirEntry::decode(raw)?.try_into()
    }

    fn references(value: &DirEntry) -> Vec<BlockId> {
        value.block().into_iter().collect()
    }
}

/// Reference to one data block of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRef {
    pub block: BlockId,
    /// Number of file bytes in the block.
    pub len: u64,
}

/// Data blocks of a file too large for a single block, keyed by block index.
/// Missing indices are holes.
pub struct FileBlockTree;

impl TreeKind for FileBlockTree {
    const NODE_KIND: NodeKind = NodeKind::FileBlocks;

    type Key = u64;
    type Value = DataRef;

    fn encode_key(key: &u64) -> Bytes {
        Bytes::copy_from_slice(&key.to_be_bytes())
    }

    fn decode_key(raw: &Bytes) -> Result<u64, Error> {
        let raw: [u8; 8] = raw
            .as_ref()
            .try_into()
            .map_err(|_| Error::Format(format!("block index of {} bytes", raw.len())))?;
        Ok(u64::from_be_bytes(raw))
    }

    fn encode_value(value: &DataRef) -> Bytes {
        proto::DataRef {
            block: value.block.into(),
            len: value.len,
        }
        .encode_to_vec()
        .into()
    }

    fn decode_value(raw: &[u8]) -> Result<DataRef, Error> {
        let value = proto::DataRef::decode(raw)?;
        Ok(DataRef {
            block: BlockId::try_from(value.block)?,
            len: value.len,
        })
    }

    fn references(value: &DataRef) -> Vec<BlockId> {
        vec![value.block]
    }
}

/// Value of an [AuxTree] entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuxEntry {
    /// Strong reference, if any.
    pub block: Option<BlockId>,
    pub data: Bytes,
    pub timestamp: u64,
}

/// Local bookkeeping (snapshots, sync bases, remote block usage) keyed by
/// raw labels.
pub struct AuxTree;

impl TreeKind for AuxTree {
    const NODE_KIND: NodeKind = NodeKind::Auxiliary;

    type Key = Bytes;
    type Value = AuxEntry;

    fn encode_key(key: &Bytes) -> Bytes {
        key.clone()
    }

    fn decode_key(raw: &Bytes) -> Result<Bytes, Error> {
        Ok(raw.clone())
    }

    fn encode_value(value: &AuxEntry) -> Bytes {
        proto::AuxEntry {
            block: value.block.map(Bytes::from),
            data: value.data.clone(),
            timestamp: value.timestamp,
        }
        .encode_to_vec()
        .into()
    }

    fn decode_value(raw: &[u8]) -> Result<AuxEntry, Error> {
        let value = proto::AuxEntry::decode(raw)?;
        Ok(AuxEntry {
            block: value.block.map(BlockId::try_from).transpose()?,
            data: value.data,
            timestamp: value.timestamp,
        })
    }

    fn references(value: &AuxEntry) -> Vec<BlockId> {
        value.block.into_iter().collect()
    }
}
