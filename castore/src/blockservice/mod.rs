use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::{BlockId, Error};

mod from_addr;
mod memory;
mod redb;
mod simplefs;
mod sled;

#[cfg(test)]
mod tests;

pub use self::from_addr::from_addr;
pub use self::memory::MemoryBlockService;
pub use self::redb::RedbBlockService;
pub use self::simplefs::SimpleFsBlockService;
pub use self::sled::SledBlockService;

/// An encoded block as held by a backend, together with its refcount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub data: Bytes,
    pub refcount: u64,
}

/// The storage contract the [crate::blockstore::BlockStore] is built on.
///
/// Backends store opaque encoded block bytes and a refcount per [BlockId],
/// plus a separate namespace of labels pointing at block ids. They do not
/// interpret either; all refcount arithmetic happens above them.
#[async_trait]
pub trait BlockService: Send + Sync {
    /// Returns the stored block, or None if it does not exist.
    async fn get(&self, id: &BlockId) -> Result<Option<StoredBlock>, Error>;

    /// Check if the block with the given id exists.
    async fn contains(&self, id: &BlockId) -> Result<bool, Error> {
        Ok(self.refcount(id).await?.is_some())
    }

    /// Returns just the refcount, without loading the block data.
    async fn refcount(&self, id: &BlockId) -> Result<Option<u64>, Error>;

    /// Stores a block with an initial refcount, replacing any previous one.
    async fn insert(&self, id: &BlockId, data: Bytes, refcount: u64) -> Result<(), Error>;

    /// Overwrites the refcount of an existing block.
    /// Fails with [Error::NotFound] if the block does not exist.
    async fn set_refcount(&self, id: &BlockId, refcount: u64) -> Result<(), Error>;

    /// Removes a block and its refcount. Returns whether it existed.
    async fn delete(&self, id: &BlockId) -> Result<bool, Error>;

    /// Lists all stored blocks and their refcounts, in no particular order.
    fn list(&self) -> BoxStream<'static, Result<(BlockId, u64), Error>>;

    /// Resolves a label.
    async fn get_root(&self, label: &str) -> Result<Option<BlockId>, Error>;

    /// Atomically points a label at a block, or removes it when `id` is None.
    /// Concurrent readers observe either the old or the new target.
    async fn set_root(&self, label: &str, id: Option<&BlockId>) -> Result<(), Error>;

    async fn list_roots(&self) -> Result<Vec<(String, BlockId)>, Error>;

    /// Persists anything buffered.
    async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
impl<A> BlockService for A
where
    A: AsRef<dyn BlockService> + Send + Sync,
{
    async fn get(&self, id: &BlockId) -> Result<Option<StoredBlock>, Error> {
        self.as_ref().get(id).await
    }

    async fn contains(&self, id: &BlockId) -> Result<bool, Error> {
        self.as_ref().contains(id).await
    }

    async fn refcount(&self, id: &BlockId) -> Result<Option<u64>, Error> {
        self.as_ref().refcount(id).await
    }

    async fn insert(&self, id: &BlockId, data: Bytes, refcount: u64) -> Result<(), Error> {
        self.as_ref().insert(id, data, refcount).await
    }

    async fn set_refcount(&self, id: &BlockId, refcount: u64) -> Result<(), Error> {
        self.as_ref().set_refcount(id, refcount).await
    }

    async fn delete(&self, id: &BlockId) -> Result<bool, Error> {
        self.as_ref().delete(id).await
    }

    fn list(&self) -> BoxStream<'static, Result<(BlockId, u64), Error>> {
        self.as_ref().list()
    }

    async fn get_root(&self, label: &str) -> Result<Option<BlockId>, Error> {
        self.as_ref().get_root(label).await
    }

    async fn set_root(&self, label: &str, id: Option<&BlockId>) -> Result<(), Error> {
        self.as_ref().set_root(label, id).await
    }

    async fn list_roots(&self) -> Result<Vec<(String, BlockId)>, Error> {
        self.as_ref().list_roots().await
    }

    async fn flush(&self) -> Result<(), Error> {
        self.as_ref().flush().await
    }
}
