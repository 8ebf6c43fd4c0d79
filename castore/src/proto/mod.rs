//! Wire messages of tree nodes.
//!
//! These are declared with the prost derive macros and are the only schema
//! of the format, so building the crate needs no protoc.
use bytes::Bytes;

/// Timestamps kept at the root node of a directory tree, in nanoseconds
/// since the unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct DirHeader {
    /// Last change anywhere below this directory.
    #[prost(uint64, tag = "1")]
    pub last_modified: u64,
    /// Last time an entry was added.
    #[prost(uint64, tag = "2")]
    pub last_create: u64,
    /// Last time an entry was removed.
    #[prost(uint64, tag = "3")]
    pub last_delete: u64,
}

impl DirHeader {
    /// Field-wise maximum.
    pub fn max(&self, other: &DirHeader) -> DirHeader {
        DirHeader {
            last_modified: self.last_modified.max(other.last_modified),
            last_create: self.last_create.max(other.last_create),
            last_delete: self.last_delete.max(other.last_delete),
        }
    }
}

/// A node of one of the B+ trees.
///
/// Leaves carry `values` parallel to `keys`. Internal nodes carry
/// `children` parallel to `keys`, where each key is the smallest key found
/// below that child.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TreeNode {
    #[prost(message, optional, tag = "1")]
    pub header: Option<DirHeader>,
    #[prost(bool, tag = "2")]
    pub leaf: bool,
    #[prost(bytes = "bytes", repeated, tag = "3")]
    pub keys: Vec<Bytes>,
    #[prost(bytes = "bytes", repeated, tag = "4")]
    pub values: Vec<Bytes>,
    #[prost(bytes = "bytes", repeated, tag = "5")]
    pub children: Vec<Bytes>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EntryKind {
    Unspecified = 0,
    /// `target` is the root of the child directory tree.
    Directory = 1,
    /// Regular file without content, `target` is empty.
    FileEmpty = 2,
    /// `target` is the single data block.
    FileBlock = 3,
    /// `target` is the root of a tree of data blocks.
    FileTree = 4,
    /// `target` is the link destination.
    Symlink = 5,
}

/// Value of a directory tree leaf.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct DirEntry {
    #[prost(enumeration = "EntryKind", tag = "1")]
    pub kind: i32,
    #[prost(bytes = "bytes", tag = "2")]
    pub target: Bytes,
    /// Permission bits.
    #[prost(uint32, tag = "3")]
    pub mode: u32,
    #[prost(uint32, tag = "4")]
    pub uid: u32,
    #[prost(uint32, tag = "5")]
    pub gid: u32,
    #[prost(uint64, tag = "6")]
    pub size: u64,
    #[prost(uint64, tag = "7")]
    pub mtime: u64,
    #[prost(uint64, tag = "8")]
    pub ctime: u64,
}

/// Value of a file block tree leaf.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct DataRef {
    #[prost(bytes = "bytes", tag = "1")]
    pub block: Bytes,
    #[prost(uint64, tag = "2")]
    pub len: u64,
}

/// Value of an auxiliary tree leaf.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct AuxEntry {
    /// Strong reference, if any.
    #[prost(bytes = "bytes", optional, tag = "1")]
    pub block: Option<Bytes>,
    #[prost(bytes = "bytes", tag = "2")]
    pub data: Bytes,
    #[prost(uint64, tag = "3")]
    pub timestamp: u64,
}
