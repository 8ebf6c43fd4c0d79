//! File content: stored inline in a single data block while small, as a
//! [FileBlockTree] of fixed-size data blocks otherwise. Blocks missing from
//! the tree are holes and read as zeroes.
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use tracing::{instrument, warn};

use super::btree::{BTree, TreeParams};
use super::kinds::{DataRef, DirEntry, FileBlockTree, FileLayout};
use super::node;
use crate::blockstore::BlockStore;
use crate::{BlockId, Error};

/// Size of the data blocks files are cut into.
pub const DEFAULT_FILE_BLOCK_SIZE: usize = 128_000;

/// Largest range a single read returns. Larger files are read in pieces.
pub const MAX_READ_SIZE: u64 = 64 << 20;

fn copy_overlap(buf: &mut [u8], buf_offset: u64, data_offset: u64, data: &[u8]) {
    let start = buf_offset.max(data_offset);
    let end = (buf_offset + buf.len() as u64).min(data_offset + data.len() as u64);
    if start >= end {
        return;
    }
    buf[(start - buf_offset) as usize..(end - buf_offset) as usize]
        .copy_from_slice(&data[(start - data_offset) as usize..(end - data_offset) as usize]);
}

/// Every function returning a [FileLayout] hands out one holder reference on
/// its block, to be released with [Files::release] once the layout is stored
/// in a directory entry.
#[derive(Clone)]
pub(crate) struct Files {
    store: BlockStore,
    blocks: BTree<FileBlockTree>,
    block_size: u64,
}

impl Files {
    pub fn new(store: BlockStore, params: TreeParams, block_size: usize) -> Self {
        Self {
            blocks: BTree::new(store.clone(), params),
            store,
            block_size: block_size.max(1) as u64,
        }
    }

    async fn put_data(&self, data: &[u8]) -> Result<BlockId, Error> {
        self.store.put(node::encode_data(data)).await
    }

    async fn load_data(&self, id: &BlockId) -> Result<Bytes, Error> {
        node::decode_data(id, &self.store.get(id).await?)
    }

    /// Takes another holder reference on the layout.
    pub async fn retain(&self, layout: &FileLayout) -> Result<FileLayout, Error> {
        if let Some(id) = layout.block() {
            self.store.addref(&id).await?;
        }
        Ok(*layout)
    }

    pub async fn release(&self, layout: &FileLayout) -> Result<(), Error> {
        if let Some(id) = layout.block() {
            self.store.decref(&id).await?;
        }
        Ok(())
    }

    /// Swaps the held tree root `root` for `new`.
    async fn advance(&self, root: &mut BlockId, new: BlockId) -> Result<(), Error> {
        let old = std::mem::replace(root, new);
        self.store.decref(&old).await?;
        Ok(())
    }

    /// Stores `data` as the complete content of a file. Blocks consisting of
    /// zeroes only are left out as holes.
    #[instrument(skip_all, fields(len = data.len()), err)]
    pub async fn write_all(&self, data: &[u8]) -> Result<FileLayout, Error> {
        if data.is_empty() {
            return Ok(FileLayout::Empty);
        }
        if data.len() as u64 <= self.block_size {
            return Ok(FileLayout::Block(self.put_data(data).await?));
        }

        let chunks: Vec<(u64, &[u8])> = data
            .chunks(self.block_size as usize)
            .enumerate()
            .filter(|(_, chunk)| chunk.iter().any(|b| *b != 0))
            .map(|(i, chunk)| (i as u64, chunk))
            .collect();
        let ids = self
            .store
            .put_many(chunks.iter().map(|(_, c)| node::encode_data(c)).collect())
            .await?;

        let entries = chunks.iter().zip(&ids).map(|((index, chunk), id)| {
            (
                *index,
                DataRef {
                    block: *id,
                    len: chunk.len() as u64,
                },
            )
        });
        let root = self.blocks.build(entries, None).await;
        for id in &ids {
            self.store.decref(id).await?;
        }
        Ok(FileLayout::Tree(root?))
    }

    /// Reads up to `len` bytes at `offset` of a file of `size` bytes. Fails
    /// with [Error::InvalidRequest] if more than [MAX_READ_SIZE] bytes would
    /// be returned.
    pub async fn read_at(
        &self,
        layout: &FileLayout,
        size: u64,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, Error> {
        let end = size.min(offset.saturating_add(len));
        if offset >= end {
            return Ok(Bytes::new());
        }

        let len = end - offset;
        if len > MAX_READ_SIZE {
            return Err(Error::InvalidRequest(format!(
                "read of {} bytes exceeds the limit of {}",
                len, MAX_READ_SIZE
            )));
        }
        let len = usize::try_from(len)
            .map_err(|_| Error::InvalidRequest(format!("read of {} bytes", len)))?;

        let mut buf = BytesMut::zeroed(len);
        match layout {
            FileLayout::Empty => {}
            FileLayout::Block(id) => {
                let data = self.load_data(id).await?;
                copy_overlap(&mut buf, offset, 0, &data);
            }
            FileLayout::Tree(root) => {
                let first = offset / self.block_size;
                let mut entries = self.blocks.range(root, Some(&first));
                while let Some((index, data_ref)) = entries.try_next().await? {
                    let start = index * self.block_size;
                    if start >= end {
                        break;
                    }
                    let data = self.load_data(&data_ref.block).await?;
                    copy_overlap(&mut buf, offset, start, &data);
                }
            }
        }
        Ok(buf.freeze())
    }

    /// The content as a block tree, with a holder reference on the root.
    async fn as_tree(&self, layout: &FileLayout) -> Result<BlockId, Error> {
        match layout {
            FileLayout::Tree(root) => {
                self.store.addref(root).await?;
                Ok(*root)
            }
            FileLayout::Empty => self.blocks.empty(None).await,
            FileLayout::Block(id) => {
                let len = self.load_data(id).await?.len() as u64;
                self.blocks
                    .build([(0, DataRef { block: *id, len })], None)
                    .await
            }
        }
    }

    /// Stores a new version of one block of the tree.
    async fn replace_block(
        &self,
        root: &mut BlockId,
        index: u64,
        data: &[u8],
    ) -> Result<(), Error> {
        let id = self.put_data(data).await?;
        let inserted = self
            .blocks
            .insert(
                root,
                &index,
                &DataRef {
                    block: id,
                    len: data.len() as u64,
                },
            )
            .await;
        self.store.decref(&id).await?;
        self.advance(root, inserted?).await
    }

    /// Writes `data` at `offset`, filling any gap with zeroes. Returns the
    /// new layout and size.
    #[instrument(skip(self, layout, data), fields(len = data.len()), err)]
    pub async fn write_at(
        &self,
        layout: &FileLayout,
        size: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<(FileLayout, u64), Error> {
        if data.is_empty() {
            return Ok((self.retain(layout).await?, size));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::InvalidRequest("write past the maximum file size".into()))?;
        let new_size = size.max(end);

        if new_size <= self.block_size {
            let mut content = BytesMut::from(&self.read_at(layout, size, 0, size).await?[..]);
            content.resize(new_size as usize, 0);
            content[offset as usize..end as usize].copy_from_slice(data);
            let id = self.put_data(&content).await?;
            return Ok((FileLayout::Block(id), new_size));
        }

        let mut root = self.as_tree(layout).await?;
        let bs = self.block_size;
        for index in offset / bs..=(end - 1) / bs {
            let block_start = index * bs;
            let mut block = match self.blocks.lookup(&root, &index).await? {
                Some(existing) => BytesMut::from(&self.load_data(&existing.block).await?[..]),
                None => BytesMut::new(),
            };

            let from = offset.max(block_start);
            let to = end.min(block_start + bs);
            let (lo, hi) = ((from - block_start) as usize, (to - block_start) as usize);
            if block.len() < hi {
                block.resize(hi, 0);
            }
            block[lo..hi].copy_from_slice(&data[(from - offset) as usize..(to - offset) as usize]);

            self.replace_block(&mut root, index, &block).await?;
        }

        Ok((FileLayout::Tree(root), new_size))
    }

    /// Cuts or extends a file to `new_size` bytes. Extensions read as
    /// zeroes.
    #[instrument(skip(self, layout), err)]
    pub async fn truncate(
        &self,
        layout: &FileLayout,
        size: u64,
        new_size: u64,
    ) -> Result<FileLayout, Error> {
        if new_size == 0 {
            return Ok(FileLayout::Empty);
        }
        if new_size == size {
            return self.retain(layout).await;
        }

        if new_size <= self.block_size {
            let content = self.read_at(layout, size, 0, size.min(new_size)).await?;
            if content.is_empty() {
                return Ok(FileLayout::Empty);
            }
            return Ok(FileLayout::Block(self.put_data(&content).await?));
        }

        let mut root = self.as_tree(layout).await?;
        if new_size > size {
            return Ok(FileLayout::Tree(root));
        }

        let last = (new_size - 1) / self.block_size;
        let doomed: Vec<u64> = self
            .blocks
            .range(&root, Some(&(last + 1)))
            .map_ok(|(index, _)| index)
            .try_collect()
            .await?;
        for index in doomed {
            if let Some(new) = self.blocks.delete(&root, &index).await? {
                self.advance(&mut root, new).await?;
            }
        }

        let tail = (new_size - last * self.block_size) as usize;
        if let Some(existing) = self.blocks.lookup(&root, &last).await? {
            if existing.len as usize > tail {
                let data = self.load_data(&existing.block).await?;
                let keep = data.len().min(tail);
                self.replace_block(&mut root, last, &data[..keep]).await?;
            }
        }

        Ok(FileLayout::Tree(root))
    }
}

/// An open file. Holds a reference on the content it was opened with, so
/// later writes, merges or deletes never change what it reads.
///
/// Has to be released with [FileHandle::close].
pub struct FileHandle {
    files: Files,
    entry: DirEntry,
    layout: FileLayout,
    size: u64,
    closed: bool,
}

impl FileHandle {
    /// Wraps a layout the caller already holds a reference on.
    pub(crate) fn new(files: Files, entry: DirEntry, layout: FileLayout, size: u64) -> Self {
        Self {
            files,
            entry,
            layout,
            size,
            closed: false,
        }
    }

    pub fn entry(&self) -> &DirEntry {
        &self.entry
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn read_at(&self, offset: u64, len: u64) -> Result<Bytes, Error> {
        self.files
            .read_at(&self.layout, self.size, offset, len)
            .await
    }

    pub async fn read_all(&self) -> Result<Bytes, Error> {
        self.read_at(0, self.size).await
    }

    pub async fn close(mut self) -> Result<(), Error> {
        self.closed = true;
        self.files.release(&self.layout).await
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if !self.closed {
            if let Some(id) = self.layout.block() {
                warn!(
                    block.id = %id,
                    "file handle dropped without close, content stays referenced until fsck"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::TryStreamExt;
    use rstest::rstest;
    use std::sync::Arc;

    use super::{FileLayout, Files};
    use crate::blockservice::{BlockService, MemoryBlockService};
    use crate::blockstore::{BlockStore, StoreOptions};
    use crate::fixtures::PLAIN_CODEC;
    use crate::forest::btree::TreeParams;
    use crate::forest::node::NodeReferences;

    const BLOCK: usize = 16;

    fn files() -> (Files, MemoryBlockService) {
        let service = MemoryBlockService::default();
        let store = BlockStore::new(
            Arc::new(service.clone()),
            PLAIN_CODEC.clone(),
            &StoreOptions::default(),
        );
        store.set_reference_extractor(Arc::new(NodeReferences));
        let params = TreeParams {
            max_node_size: 200,
            min_node_size: 50,
        };
        (Files::new(store, params, BLOCK), service)
    }

    async fn stored_count(service: &MemoryBlockService) -> usize {
        service.list().try_collect::<Vec<_>>().await.unwrap().len()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    #[rstest]
    #[case::empty(0)]
    #[case::small(5)]
    #[case::exactly_one_block(BLOCK)]
    #[case::two_blocks(BLOCK + 1)]
    #[case::many_blocks(BLOCK * 40 + 3)]
    #[tokio::test]
    async fn write_all_layouts(#[case] len: usize) {
        let (files, service) = files();
        let data = pattern(len);
        let layout = files.write_all(&data).await.unwrap();

        match len {
            0 => assert_eq!(FileLayout::Empty, layout),
            n if n <= BLOCK => assert!(matches!(layout, FileLayout::Block(_))),
            _ => assert!(matches!(layout, FileLayout::Tree(_))),
        }
        assert_eq!(
            Bytes::from(data),
            files.read_at(&layout, len as u64, 0, len as u64).await.unwrap()
        );

        files.release(&layout).await.unwrap();
        assert_eq!(0, stored_count(&service).await);
    }

    #[tokio::test]
    async fn zero_blocks_become_holes() {
        let (files, _) = files();
        let mut data = vec![0u8; BLOCK * 4];
        data[BLOCK * 3] = 7;
        let layout = files.write_all(&data).await.unwrap();

        let FileLayout::Tree(root) = layout else {
            panic!("expected a block tree, got {:?}", layout);
        };
        assert_eq!(1, files.blocks.len(&root).await.unwrap());
        assert_eq!(
            Bytes::from(data.clone()),
            files.read_at(&layout, data.len() as u64, 0, data.len() as u64).await.unwrap()
        );
    }

    #[tokio::test]
    async fn read_is_clamped_to_size() {
        let (files, _) = files();
        let layout = files.write_all(b"hello").await.unwrap();

        assert_eq!(
            Bytes::from_static(b"llo"),
            files.read_at(&layout, 5, 2, 100).await.unwrap()
        );
        assert!(files.read_at(&layout, 5, 5, 10).await.unwrap().is_empty());
        assert!(files.read_at(&layout, 5, 50, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sparse_write_far_past_the_end() {
        let (files, service) = files();
        let layout = files.write_all(b"head").await.unwrap();

        let offset = (BLOCK * 10 + 2) as u64;
        let (grown, size) = files.write_at(&layout, 4, offset, b"tail").await.unwrap();
        files.release(&layout).await.unwrap();

        assert_eq!(offset + 4, size);
        let content = files.read_at(&grown, size, 0, size).await.unwrap();
        assert_eq!(b"head", &content[..4]);
        assert!(content[4..offset as usize].iter().all(|b| *b == 0));
        assert_eq!(b"tail", &content[offset as usize..]);

        files.release(&grown).await.unwrap();
        assert_eq!(0, stored_count(&service).await);
    }

    #[tokio::test]
    async fn overwrite_across_block_boundary() {
        let (files, _) = files();
        let data = pattern(BLOCK * 3);
        let layout = files.write_all(&data).await.unwrap();

        let offset = BLOCK as u64 - 2;
        let (layout2, size) = files
            .write_at(&layout, data.len() as u64, offset, b"XXXX")
            .await
            .unwrap();
        assert_eq!(data.len() as u64, size);

        let mut expected = data.clone();
        expected[BLOCK - 2..BLOCK + 2].copy_from_slice(b"XXXX");
        assert_eq!(
            Bytes::from(expected),
            files.read_at(&layout2, size, 0, size).await.unwrap()
        );
        // the old version is untouched
        assert_eq!(
            Bytes::from(data),
            files.read_at(&layout, size, 0, size).await.unwrap()
        );
    }

    #[tokio::test]
    async fn small_file_stays_inline() {
        let (files, _) = files();
        let layout = files.write_all(b"abc").await.unwrap();
        let (layout, size) = files.write_at(&layout, 3, 5, b"de").await.unwrap();

        assert!(matches!(layout, FileLayout::Block(_)));
        assert_eq!(
            Bytes::from_static(b"abc\0\0de"),
            files.read_at(&layout, size, 0, size).await.unwrap()
        );
    }

    #[rstest]
    #[case::to_zero(0)]
    #[case::inside_first_block(5)]
    #[case::inside_later_block(BLOCK as u64 * 2 + 3)]
    #[case::on_block_boundary(BLOCK as u64 * 2)]
    #[tokio::test]
    async fn shrink_then_grow_reads_zeroes(#[case] cut: u64) {
        let (files, _) = files();
        let data = pattern(BLOCK * 5);
        let len = data.len() as u64;
        let layout = files.write_all(&data).await.unwrap();

        let shrunk = files.truncate(&layout, len, cut).await.unwrap();
        assert_eq!(
            Bytes::copy_from_slice(&data[..cut as usize]),
            files.read_at(&shrunk, cut, 0, cut).await.unwrap()
        );

        let grown = files.truncate(&shrunk, cut, len).await.unwrap();
        let content = files.read_at(&grown, len, 0, len).await.unwrap();
        assert_eq!(&data[..cut as usize], &content[..cut as usize]);
        assert!(content[cut as usize..].iter().all(|b| *b == 0));
    }
}
