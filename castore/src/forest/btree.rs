//! Copy-on-write B+ trees persisted as blocks.
//!
//! Nodes are immutable once stored. A mutation loads the path from the root
//! to the affected leaf, changes it in memory, and stores the changed nodes
//! bottom-up, splitting every node that grew beyond
//! [TreeParams::max_node_size]. Every node stored on the way is a holder
//! reference which is released once its parent is stored, so the only
//! reference a mutation leaves behind is the one on the new root.
use async_stream::try_stream;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt, TryStreamExt};
use std::marker::PhantomData;
use std::ops::RangeInclusive;
use tracing::{instrument, warn};

use super::kinds::TreeKind;
use super::node::{self, node_size};
use crate::blockstore::BlockStore;
use crate::proto::{DirHeader, TreeNode};
use crate::{BlockId, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeParams {
    /// Nodes with a larger encoding are split.
    pub max_node_size: usize,
    /// Nodes with a smaller encoding are merged with a sibling after a
    /// delete.
    pub min_node_size: usize,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_node_size: 128_000,
            min_node_size: 32_000,
        }
    }
}

/// How a mutation changes the header of a directory tree root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeaderUpdate {
    #[default]
    Keep,
    /// Record a change at the given time. Inserting a new key also bumps
    /// `last_create`, deleting one bumps `last_delete`.
    Touch(u64),
    /// Replace the header.
    Set(DirHeader),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Created,
    Modified,
    Deleted,
}

impl HeaderUpdate {
    fn apply(self, header: &mut Option<DirHeader>, change: Change) {
        match self {
            HeaderUpdate::Keep => {}
            HeaderUpdate::Set(new) => *header = Some(new),
            HeaderUpdate::Touch(now) => {
                let header = header.get_or_insert_with(DirHeader::default);
                header.last_modified = header.last_modified.max(now);
                match change {
                    Change::Created => header.last_create = header.last_create.max(now),
                    Change::Deleted => header.last_delete = header.last_delete.max(now),
                    Change::Modified => {}
                }
            }
        }
    }
}

/// Index of the child whose subtree holds `key`, if any child can.
fn lookup_index(keys: &[Bytes], key: &[u8]) -> Option<usize> {
    keys.partition_point(|k| k.as_ref() <= key).checked_sub(1)
}

/// Like [lookup_index], but keys below the first separator go to the first
/// child.
fn child_index(keys: &[Bytes], key: &[u8]) -> usize {
    lookup_index(keys, key).unwrap_or(0)
}

fn child_at(node: &TreeNode, i: usize) -> Result<BlockId, Error> {
    let raw = node
        .children
        .get(i)
        .ok_or_else(|| Error::Format(format!("tree node has no child {}", i)))?;
    Ok(BlockId::try_from(raw.as_ref())?)
}

fn field_len(len: usize) -> usize {
    1 + prost::length_delimiter_len(len) + len
}

fn entry_size(node: &TreeNode, i: usize) -> usize {
    let payload = if node.leaf {
        &node.values[i]
    } else {
        &node.children[i]
    };
    field_len(node.keys[i].len()) + field_len(payload.len())
}

fn slice_node(node: &TreeNode, start: usize, end: usize) -> TreeNode {
    TreeNode {
        header: None,
        leaf: node.leaf,
        keys: node.keys[start..end].to_vec(),
        values: if node.leaf {
            node.values[start..end].to_vec()
        } else {
            Vec::new()
        },
        children: if node.leaf {
            Vec::new()
        } else {
            node.children[start..end].to_vec()
        },
    }
}

fn concat(mut left: TreeNode, right: TreeNode) -> TreeNode {
    left.keys.extend(right.keys);
    left.values.extend(right.values);
    left.children.extend(right.children);
    left
}

/// A B+ tree of one [TreeKind] inside a [BlockStore]. A tree is identified
/// by the id of its root node, so one handle serves any number of trees.
pub struct BTree<K> {
    store: BlockStore,
    params: TreeParams,
    kind: PhantomData<fn() -> K>,
}

impl<K> Clone for BTree<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            params: self.params,
            kind: PhantomData,
        }
    }
}

impl<K: TreeKind> BTree<K> {
    pub fn new(store: BlockStore, params: TreeParams) -> Self {
        Self {
            store,
            params,
            kind: PhantomData,
        }
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    async fn load(&self, id: &BlockId) -> Result<TreeNode, Error> {
        let plaintext = self.store.get(id).await?;
        node::decode_node(K::NODE_KIND, id, &plaintext)
    }

    /// Stores a non-root node, recording the holder reference.
    async fn put_node(
        &self,
        node: &TreeNode,
        holders: &mut Vec<BlockId>,
    ) -> Result<BlockId, Error> {
        let id = self.store.put(node::encode_node(K::NODE_KIND, node)).await?;
        holders.push(id);
        Ok(id)
    }

    async fn release(&self, holders: Vec<BlockId>) -> Result<(), Error> {
        let mut result = Ok(());
        for id in holders.iter().rev() {
            if let Err(e) = self.store.decref(id).await {
                warn!(block.id = %id, err = %e, "failed to release tree node");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Splits an overfull node into pieces of roughly equal encoded size.
    /// Leaf pieces keep at least one entry, internal pieces at least two.
    fn split(&self, node: TreeNode) -> Vec<TreeNode> {
        let min_entries = if node.leaf { 1 } else { 2 };
        let n = node.keys.len();
        if node_size(&node) <= self.params.max_node_size || n < 2 * min_entries {
            return vec![node];
        }

        let sizes: Vec<usize> = (0..n).map(|i| entry_size(&node, i)).collect();
        let total: usize = sizes.iter().sum();
        let parts = total
            .div_ceil(self.params.max_node_size)
            .clamp(2, n / min_entries);
        let target = total.div_ceil(parts);

        let mut cuts = Vec::with_capacity(parts);
        let (mut start, mut acc) = (0, 0);
        for (i, size) in sizes.iter().enumerate() {
            acc += size;
            let left = parts - cuts.len() - 1;
            if left > 0
                && acc >= target
                && i + 1 - start >= min_entries
                && n - (i + 1) >= left * min_entries
            {
                cuts.push(i + 1);
                start = i + 1;
                acc = 0;
            }
        }
        if cuts.is_empty() {
            // all the weight sits at the end
            cuts.push(n / 2);
        }
        cuts.push(n);

        let mut pieces = Vec::with_capacity(cuts.len());
        let mut start = 0;
        for end in cuts {
            let piece = slice_node(&node, start, end);
            start = end;
            if node_size(&piece) > self.params.max_node_size {
                pieces.extend(self.split(piece));
            } else {
                pieces.push(piece);
            }
        }
        pieces
    }

    /// Replaces the children in `range` of `node` with the pieces of `child`.
    async fn replace_children(
        &self,
        node: &mut TreeNode,
        range: RangeInclusive<usize>,
        child: TreeNode,
        holders: &mut Vec<BlockId>,
    ) -> Result<(), Error> {
        let mut keys = Vec::new();
        let mut ids = Vec::new();
        if !child.keys.is_empty() {
            for piece in self.split(child) {
                keys.push(piece.keys.first().cloned().unwrap_or_default());
                ids.push(Bytes::from(self.put_node(&piece, holders).await?));
            }
        }
        node.keys.splice(range.clone(), keys);
        node.children.splice(range, ids);
        Ok(())
    }

    /// Stores `node` as the new root, growing or shrinking the tree as
    /// needed. The returned id is not part of `holders`.
    async fn write_root(
        &self,
        mut node: TreeNode,
        header: Option<DirHeader>,
        holders: &mut Vec<BlockId>,
    ) -> Result<BlockId, Error> {
        loop {
            node.header = None;
            if !node.leaf && node.keys.is_empty() {
                node = TreeNode {
                    leaf: true,
                    ..Default::default()
                };
            }
            if !node.leaf && node.keys.len() == 1 {
                node = self.load(&child_at(&node, 0)?).await?;
                continue;
            }

            match <[TreeNode; 1]>::try_from(self.split(node)) {
                Ok([mut root]) => {
                    root.header = header;
                    return self
                        .store
                        .put(node::encode_node(K::NODE_KIND, &root))
                        .await;
                }
                Err(parts) => {
                    let mut parent = TreeNode::default();
                    for part in parts {
                        parent
                            .keys
                            .push(part.keys.first().cloned().unwrap_or_default());
                        parent
                            .children
                            .push(self.put_node(&part, holders).await?.into());
                    }
                    node = parent;
                }
            }
        }
    }

    fn insert_into<'a>(
        &'a self,
        mut node: TreeNode,
        key: &'a Bytes,
        value: &'a Bytes,
        holders: &'a mut Vec<BlockId>,
    ) -> BoxFuture<'a, Result<(TreeNode, Change), Error>> {
        async move {
            if node.leaf {
                let change = match node.keys.binary_search(key) {
                    Ok(i) => {
                        node.values[i] = value.clone();
                        Change::Modified
                    }
                    Err(i) => {
                        node.keys.insert(i, key.clone());
                        node.values.insert(i, value.clone());
                        Change::Created
                    }
                };
                return Ok((node, change));
            }

            let i = child_index(&node.keys, key);
            let child = self.load(&child_at(&node, i)?).await?;
            let (child, change) = self.insert_into(child, key, value, holders).await?;
            self.replace_children(&mut node, i..=i, child, holders)
                .await?;
            Ok((node, change))
        }
        .boxed()
    }

    fn delete_from<'a>(
        &'a self,
        mut node: TreeNode,
        key: &'a Bytes,
        holders: &'a mut Vec<BlockId>,
    ) -> BoxFuture<'a, Result<Option<TreeNode>, Error>> {
        async move {
            if node.leaf {
                return Ok(match node.keys.binary_search(key) {
                    Ok(i) => {
                        node.keys.remove(i);
                        node.values.remove(i);
                        Some(node)
                    }
                    Err(_) => None,
                });
            }

            let Some(i) = lookup_index(&node.keys, key) else {
                return Ok(None);
            };
            let child = self.load(&child_at(&node, i)?).await?;
            let Some(mut child) = self.delete_from(child, key, holders).await? else {
                return Ok(None);
            };

            let mut range = i..=i;
            if !child.keys.is_empty()
                && node_size(&child) < self.params.min_node_size
                && node.keys.len() > 1
            {
                if i + 1 < node.keys.len() {
                    let sibling = self.load(&child_at(&node, i + 1)?).await?;
                    child = concat(child, sibling);
                    range = i..=i + 1;
                } else {
                    let sibling = self.load(&child_at(&node, i - 1)?).await?;
                    child = concat(sibling, child);
                    range = i - 1..=i;
                }
            }
            self.replace_children(&mut node, range, child, holders)
                .await?;
            Ok(Some(node))
        }
        .boxed()
    }

    /// Builds a tree from entries in one go, returning its root with a holder
    /// reference. Later duplicates of a key win.
    pub async fn build<I>(&self, entries: I, header: Option<DirHeader>) -> Result<BlockId, Error>
    where
        I: IntoIterator<Item = (K::Key, K::Value)>,
    {
        let mut entries: Vec<(Bytes, Bytes)> = entries
            .into_iter()
            .map(|(k, v)| (K::encode_key(&k), K::encode_value(&v)))
            .collect();
        entries.reverse();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.dedup_by(|a, b| a.0 == b.0);

        let (keys, values) = entries.into_iter().unzip();
        let node = TreeNode {
            header: None,
            leaf: true,
            keys,
            values,
            children: Vec::new(),
        };

        let mut holders = Vec::new();
        let result = self.write_root(node, header, &mut holders).await;
        let released = self.release(holders).await;
        let root = result?;
        released?;
        Ok(root)
    }

    /// Creates an empty tree, returning its root with a holder reference.
    pub async fn empty(&self, header: Option<DirHeader>) -> Result<BlockId, Error> {
        let root = TreeNode {
            header,
            leaf: true,
            ..Default::default()
        };
        self.store
            .put(node::encode_node(K::NODE_KIND, &root))
            .await
    }

    pub(crate) async fn lookup_raw(
        &self,
        root: &BlockId,
        key: &[u8],
    ) -> Result<Option<Bytes>, Error> {
        let mut node = self.load(root).await?;
        loop {
            if node.leaf {
                return Ok(node
                    .keys
                    .binary_search_by(|k| k.as_ref().cmp(key))
                    .ok()
                    .map(|i| node.values[i].clone()));
            }
            let Some(i) = lookup_index(&node.keys, key) else {
                return Ok(None);
            };
            node = self.load(&child_at(&node, i)?).await?;
        }
    }

    pub(crate) async fn insert_raw(
        &self,
        root: &BlockId,
        key: Bytes,
        value: Bytes,
        update: HeaderUpdate,
    ) -> Result<BlockId, Error> {
        let mut holders = Vec::new();
        let result = async {
            let node = self.load(root).await?;
            let mut header = node.header;
            let (node, change) = self.insert_into(node, &key, &value, &mut holders).await?;
            update.apply(&mut header, change);
            self.write_root(node, header, &mut holders).await
        }
        .await;

        let released = self.release(holders).await;
        let root = result?;
        released?;
        Ok(root)
    }

    pub(crate) async fn delete_raw(
        &self,
        root: &BlockId,
        key: &Bytes,
        update: HeaderUpdate,
    ) -> Result<Option<BlockId>, Error> {
        let mut holders = Vec::new();
        let result = async {
            let node = self.load(root).await?;
            let mut header = node.header;
            let Some(node) = self.delete_from(node, key, &mut holders).await? else {
                return Ok(None);
            };
            update.apply(&mut header, Change::Deleted);
            self.write_root(node, header, &mut holders).await.map(Some)
        }
        .await;

        let released = self.release(holders).await;
        let root = result?;
        released?;
        Ok(root)
    }

    /// Entries in key order, starting at the first key not below `from`.
    pub(crate) fn range_raw(
        &self,
        root: &BlockId,
        from: Option<Bytes>,
    ) -> BoxStream<'static, Result<(Bytes, Bytes), Error>> {
        let tree = self.clone();
        let root = *root;

        Box::pin(try_stream! {
            let mut stack: Vec<(TreeNode, usize)> = Vec::new();

            let mut node = tree.load(&root).await?;
            loop {
                if node.leaf {
                    let start = match &from {
                        Some(from) => node.keys.partition_point(|k| k < from),
                        None => 0,
                    };
                    stack.push((node, start));
                    break;
                }
                let i = match &from {
                    Some(from) => child_index(&node.keys, from),
                    None => 0,
                };
                let child = child_at(&node, i)?;
                stack.push((node, i + 1));
                node = tree.load(&child).await?;
            }

            while let Some((node, pos)) = stack.pop() {
                if node.leaf {
                    for i in pos..node.keys.len() {
                        yield (node.keys[i].clone(), node.values[i].clone());
                    }
                } else if pos < node.children.len() {
                    let child = child_at(&node, pos)?;
                    stack.push((node, pos + 1));
                    stack.push((tree.load(&child).await?, 0));
                }
            }
        })
    }

    #[instrument(skip_all, fields(tree.root = %root), err)]
    pub async fn lookup(&self, root: &BlockId, key: &K::Key) -> Result<Option<K::Value>, Error> {
        self.lookup_raw(root, &K::encode_key(key))
            .await?
            .map(|raw| K::decode_value(&raw))
            .transpose()
    }

    /// Inserts or replaces `key`. Returns the new root with a holder
    /// reference; `root` itself stays untouched.
    pub async fn insert(
        &self,
        root: &BlockId,
        key: &K::Key,
        value: &K::Value,
    ) -> Result<BlockId, Error> {
        self.insert_with(root, key, value, HeaderUpdate::Keep).await
    }

    #[instrument(skip_all, fields(tree.root = %root), err)]
    pub async fn insert_with(
        &self,
        root: &BlockId,
        key: &K::Key,
        value: &K::Value,
        update: HeaderUpdate,
    ) -> Result<BlockId, Error> {
        self.insert_raw(root, K::encode_key(key), K::encode_value(value), update)
            .await
    }

    /// Removes `key`. Returns `None` if it was not there, otherwise the new
    /// root with a holder reference.
    pub async fn delete(&self, root: &BlockId, key: &K::Key) -> Result<Option<BlockId>, Error> {
        self.delete_with(root, key, HeaderUpdate::Keep).await
    }

    #[instrument(skip_all, fields(tree.root = %root), err)]
    pub async fn delete_with(
        &self,
        root: &BlockId,
        key: &K::Key,
        update: HeaderUpdate,
    ) -> Result<Option<BlockId>, Error> {
        self.delete_raw(root, &K::encode_key(key), update).await
    }

    /// Entries in key order, starting at `from` (inclusive) if given.
    /// Trees are immutable, so the same root always yields the same entries.
    pub fn range(
        &self,
        root: &BlockId,
        from: Option<&K::Key>,
    ) -> BoxStream<'static, Result<(K::Key, K::Value), Error>> {
        self.range_raw(root, from.map(K::encode_key))
            .map(|entry| -> Result<(K::Key, K::Value), Error> {
                let (key, value) = entry?;
                Ok((K::decode_key(&key)?, K::decode_value(&value)?))
            })
            .boxed()
    }

    pub fn traverse(
        &self,
        root: &BlockId,
    ) -> BoxStream<'static, Result<(K::Key, K::Value), Error>> {
        self.range(root, None)
    }

    pub async fn first(&self, root: &BlockId) -> Result<Option<(K::Key, K::Value)>, Error> {
        self.traverse(root).try_next().await
    }

    pub async fn last(&self, root: &BlockId) -> Result<Option<(K::Key, K::Value)>, Error> {
        let mut node = self.load(root).await?;
        while !node.leaf {
            let last = node.children.len().saturating_sub(1);
            node = self.load(&child_at(&node, last)?).await?;
        }
        match (node.keys.last(), node.values.last()) {
            (Some(key), Some(value)) => Ok(Some((K::decode_key(key)?, K::decode_value(value)?))),
            _ => Ok(None),
        }
    }

    pub async fn len(&self, root: &BlockId) -> Result<u64, Error> {
        self.range_raw(root, None)
            .try_fold(0, |n, _| async move { Ok(n + 1) })
            .await
    }

    pub async fn is_empty(&self, root: &BlockId) -> Result<bool, Error> {
        Ok(self.load(root).await?.keys.is_empty())
    }

    pub async fn header(&self, root: &BlockId) -> Result<Option<DirHeader>, Error> {
        Ok(self.load(root).await?.header)
    }

    /// Stores a copy of the root with a different header, returning it with a
    /// holder reference.
    pub async fn set_header(&self, root: &BlockId, header: DirHeader) -> Result<BlockId, Error> {
        let mut node = self.load(root).await?;
        node.header = Some(header);
        self.store
            .put(node::encode_node(K::NODE_KIND, &node))
            .await
    }
}
