use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::instrument;

use super::{BlockService, StoredBlock};
use crate::{BlockId, Error};

#[derive(Clone, Default)]
pub struct MemoryBlockService {
    blocks: Arc<RwLock<HashMap<BlockId, StoredBlock>>>,
    roots: Arc<RwLock<BTreeMap<String, BlockId>>>,
}

#[async_trait]
impl BlockService for MemoryBlockService {
    #[instrument(skip(self, id), fields(block.id = %id))]
    async fn get(&self, id: &BlockId) -> Result<Option<StoredBlock>, Error> {
        Ok(self.blocks.read().get(id).cloned())
    }

    #[instrument(skip(self, id), fields(block.id = %id))]
    async fn refcount(&self, id: &BlockId) -> Result<Option<u64>, Error> {
        Ok(self.blocks.read().get(id).map(|b| b.refcount))
    }

    #[instrument(skip(self, id, data), fields(block.id = %id))]
    async fn insert(&self, id: &BlockId, data: Bytes, refcount: u64) -> Result<(), Error> {
        self.blocks
            .write()
            .insert(*id, StoredBlock { data, refcount });
        Ok(())
    }

    #[instrument(skip(self, id), fields(block.id = %id))]
    async fn set_refcount(&self, id: &BlockId, refcount: u64) -> Result<(), Error> {
        match self.blocks.write().get_mut(id) {
            Some(block) => {
                block.refcount = refcount;
                Ok(())
            }
            None => Err(Error::NotFound(format!("block {}", id))),
        }
    }

    #[instrument(skip(self, id), fields(block.id = %id))]
    async fn delete(&self, id: &BlockId) -> Result<bool, Error> {
        Ok(self.blocks.write().remove(id).is_some())
    }

    fn list(&self) -> BoxStream<'static, Result<(BlockId, u64), Error>> {
        let entries: Vec<_> = self
            .blocks
            .read()
            .iter()
            .map(|(id, block)| Ok((*id, block.refcount)))
            .collect();
        stream::iter(entries).boxed()
    }

    #[instrument(skip(self))]
    async fn get_root(&self, label: &str) -> Result<Option<BlockId>, Error> {
        Ok(self.roots.read().get(label).copied())
    }

    #[instrument(skip(self, id))]
    async fn set_root(&self, label: &str, id: Option<&BlockId>) -> Result<(), Error> {
        let mut roots = self.roots.write();
        match id {
            Some(id) => roots.insert(label.to_owned(), *id),
            None => roots.remove(label),
        };
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_roots(&self) -> Result<Vec<(String, BlockId)>, Error> {
        Ok(self
            .roots
            .read()
            .iter()
            .map(|(label, id)| (label.clone(), *id))
            .collect())
    }
}
