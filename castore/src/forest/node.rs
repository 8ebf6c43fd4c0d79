//! Block-level encoding of tree nodes and file data.
//!
//! Every block written by the forest starts with a [NodeKind] byte. Tree
//! nodes follow it with an encoded [TreeNode], file data blocks with the
//! raw file bytes.
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

use super::kinds::{AuxTree, DirectoryTree, FileBlockTree, TreeKind};
use crate::blockstore::ReferenceExtractor;
use crate::proto::TreeNode;
use crate::{BlockId, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    Directory = 1,
    FileBlocks = 2,
    FileData = 3,
    Auxiliary = 4,
}

impl TryFrom<u8> for NodeKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NodeKind::Directory),
            2 => Ok(NodeKind::FileBlocks),
            3 => Ok(NodeKind::FileData),
            4 => Ok(NodeKind::Auxiliary),
            other => Err(Error::Format(format!("unknown block kind {}", other))),
        }
    }
}

fn split_kind(plaintext: &[u8]) -> Result<(NodeKind, &[u8]), Error> {
    match plaintext.split_first() {
        Some((kind, rest)) => Ok((NodeKind::try_from(*kind)?, rest)),
        None => Err(Error::Format("empty block".into())),
    }
}

/// Size of the node once encoded, including the kind byte.
pub fn node_size(node: &TreeNode) -> usize {
    1 + node.encoded_len()
}

pub fn encode_node(kind: NodeKind, node: &TreeNode) -> Bytes {
    let mut buf = BytesMut::with_capacity(node_size(node));
    buf.put_u8(kind as u8);
    // BytesMut grows as needed
    let _ = node.encode(&mut buf);
    buf.freeze()
}

pub fn decode_node(expected: NodeKind, id: &BlockId, plaintext: &[u8]) -> Result<TreeNode, Error> {
    let (kind, rest) = split_kind(plaintext)?;
    if kind != expected {
        return Err(Error::Format(format!(
            "block {} is a {:?} block, expected {:?}",
            id, kind, expected
        )));
    }

    let node = TreeNode::decode(rest)?;
    let consistent = if node.leaf {
        node.values.len() == node.keys.len() && node.children.is_empty()
    } else {
        node.children.len() == node.keys.len() && node.values.is_empty() && !node.keys.is_empty()
    };
    if !consistent {
        return Err(Error::Format(format!("tree node {} is inconsistent", id)));
    }
    Ok(node)
}

pub fn encode_data(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + data.len());
    buf.put_u8(NodeKind::FileData as u8);
    buf.put_slice(data);
    buf.freeze()
}

pub fn decode_data(id: &BlockId, plaintext: &Bytes) -> Result<Bytes, Error> {
    match split_kind(plaintext)? {
        (NodeKind::FileData, _) => Ok(plaintext.slice(1..)),
        (kind, _) => Err(Error::Format(format!(
            "block {} is a {:?} block, expected file data",
            id, kind
        ))),
    }
}

pub fn child_ids(node: &TreeNode) -> Result<Vec<BlockId>, Error> {
    node.children
        .iter()
        .map(|c| BlockId::try_from(c.as_ref()).map_err(Error::from))
        .collect()
}

fn leaf_references<K: TreeKind>(node: &TreeNode) -> Result<Vec<BlockId>, Error> {
    let mut references = Vec::new();
    for raw in &node.values {
        references.extend(K::references(&K::decode_value(raw)?));
    }
    Ok(references)
}

/// Finds the blocks referenced by any block the forest writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeReferences;

impl ReferenceExtractor for NodeReferences {
    fn references(&self, plaintext: &[u8]) -> Result<Vec<BlockId>, Error> {
        let (kind, rest) = split_kind(plaintext)?;
        if kind == NodeKind::FileData {
            return Ok(Vec::new());
        }

        let node = TreeNode::decode(rest)?;
        if !node.leaf {
            return child_ids(&node);
        }
        match kind {
            NodeKind::Directory => leaf_references::<DirectoryTree>(&node),
            NodeKind::FileBlocks => leaf_references::<FileBlockTree>(&node),
            NodeKind::Auxiliary => leaf_references::<AuxTree>(&node),
            NodeKind::FileData => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use super::*;
    use crate::fixtures::{BLOCK_A_ID, BLOCK_B_ID, BLOCK_C_ID};
    use crate::forest::kinds::{DataRef, DirEntry, EntryTarget, FileLayout, Metadata};
    use crate::forest::PathComponent;

    fn dir_leaf() -> TreeNode {
        let entries = [
            ("sub", EntryTarget::Directory(*BLOCK_A_ID)),
            (
                "file",
                EntryTarget::File {
                    layout: FileLayout::Tree(*BLOCK_B_ID),
                    size: 300_000,
                },
            ),
            ("link", EntryTarget::Symlink(Bytes::from_static(b"sub"))),
        ];
        let mut node = TreeNode {
            leaf: true,
            ..Default::default()
        };
        for (name, target) in entries {
            let name = PathComponent::try_from(name).unwrap();
            node.keys.push(DirectoryTree::encode_key(&name));
            node.values.push(DirectoryTree::encode_value(&DirEntry {
                target,
                meta: Metadata::default(),
            }));
        }
        node
    }

    #[test]
    fn directory_leaf_references() {
        let plaintext = encode_node(NodeKind::Directory, &dir_leaf());
        assert_eq!(plaintext.len(), node_size(&dir_leaf()));
        assert_eq!(
            vec![*BLOCK_A_ID, *BLOCK_B_ID],
            NodeReferences.references(&plaintext).unwrap()
        );
    }

    #[test]
    fn file_blocks_leaf_references() {
        let node = TreeNode {
            leaf: true,
            keys: vec![FileBlockTree::encode_key(&0), FileBlockTree::encode_key(&2)],
            values: vec![
                FileBlockTree::encode_value(&DataRef {
                    block: *BLOCK_C_ID,
                    len: 16,
                }),
                FileBlockTree::encode_value(&DataRef {
                    block: *BLOCK_A_ID,
                    len: 3,
                }),
            ],
            ..Default::default()
        };
        let plaintext = encode_node(NodeKind::FileBlocks, &node);
        assert_eq!(
            vec![*BLOCK_C_ID, *BLOCK_A_ID],
            NodeReferences.references(&plaintext).unwrap()
        );
    }

    #[test]
    fn internal_node_references_children() {
        let node = TreeNode {
            leaf: false,
            keys: vec![Bytes::from_static(b"a"), Bytes::from_static(b"m")],
            children: vec![Bytes::from(*BLOCK_A_ID), Bytes::from(*BLOCK_C_ID)],
            ..Default::default()
        };
        let plaintext = encode_node(NodeKind::Auxiliary, &node);
        assert_eq!(
            vec![*BLOCK_A_ID, *BLOCK_C_ID],
            NodeReferences.references(&plaintext).unwrap()
        );
        assert_eq!(
            node,
            decode_node(NodeKind::Auxiliary, &BLOCK_A_ID, &plaintext).unwrap()
        );
    }

    #[test]
    fn data_blocks_reference_nothing() {
        let plaintext = encode_data(b"\x01\x02");
        assert!(NodeReferences.references(&plaintext).unwrap().is_empty());
        assert_eq!(
            Bytes::from_static(b"\x01\x02"),
            decode_data(&BLOCK_A_ID, &plaintext).unwrap()
        );
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::unknown_kind(&[9, 0])]
    fn unusable_plaintext_is_format_error(#[case] plaintext: &[u8]) {
        assert!(matches!(
            NodeReferences.references(plaintext),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn kind_mismatch_is_format_error() {
        let plaintext = encode_node(NodeKind::Directory, &dir_leaf());
        assert!(matches!(
            decode_node(NodeKind::FileBlocks, &BLOCK_A_ID, &plaintext),
            Err(Error::Format(_))
        ));
        assert!(matches!(
            decode_data(&BLOCK_A_ID, &plaintext),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn inconsistent_node_is_format_error() {
        let node = TreeNode {
            leaf: true,
            keys: vec![Bytes::from_static(b"a")],
            ..Default::default()
        };
        let plaintext = encode_node(NodeKind::Auxiliary, &node);
        assert!(matches!(
            decode_node(NodeKind::Auxiliary, &BLOCK_A_ID, &plaintext),
            Err(Error::Format(_))
        ));
    }
}
