use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use sled::transaction::{TransactionError, TransactionResult, Transactional};
use std::path::Path;
use tracing::{instrument, warn};

use super::{BlockService, StoredBlock};
use crate::{BlockId, Error};

/// Keeps block data, refcounts and labels in three sled trees, so refcount
/// updates never rewrite block data.
#[derive(Clone)]
pub struct SledBlockService {
    db: sled::Db,
    blocks: sled::Tree,
    refcounts: sled::Tree,
    roots: sled::Tree,
}

impl SledBlockService {
    pub fn new<P: AsRef<Path>>(p: P) -> Result<Self, sled::Error> {
        let config = sled::Config::default()
            .use_compression(false) // blocks are compressed before they get here
            .path(p);
        Self::from_db(config.open()?)
    }

    pub fn new_temporary() -> Result<Self, sled::Error> {
        let config = sled::Config::default().temporary(true);
        Self::from_db(config.open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, sled::Error> {
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            refcounts: db.open_tree("refcounts")?,
            roots: db.open_tree("roots")?,
            db,
        })
    }
}

fn decode_refcount(id: &BlockId, value: &[u8]) -> Result<u64, Error> {
    let raw: [u8; 8] = value.try_into().map_err(|_| {
        warn!(block.id = %id, "stored refcount has the wrong length");
        Error::StorageError(format!("invalid refcount stored for {}", id))
    })?;
    Ok(u64::from_be_bytes(raw))
}

fn transaction_error(e: TransactionError<()>) -> Error {
    match e {
        TransactionError::Abort(()) => Error::StorageError("transaction aborted".into()),
        TransactionError::Storage(e) => e.into(),
    }
}

#[async_trait]
impl BlockService for SledBlockService {
    #[instrument(skip(self, id), fields(block.id = %id))]
    async fn get(&self, id: &BlockId) -> Result<Option<StoredBlock>, Error> {
        let Some(refcount) = self.refcounts.get(id.as_slice())? else {
            return Ok(None);
        };
        let refcount = decode_refcount(id, &refcount)?;

        match self.blocks.get(id.as_slice())? {
            Some(data) => Ok(Some(StoredBlock {
                data: Bytes::copy_from_slice(&data),
                refcount,
            })),
            None => {
                warn!(block.id = %id, "refcount present, but block data missing");
                Err(Error::StorageError(format!("block data missing for {}", id)))
            }
        }
    }

    #[instrument(skip(self, id), fields(block.id = %id))]
    async fn refcount(&self, id: &BlockId) -> Result<Option<u64>, Error> {
        self.refcounts
            .get(id.as_slice())?
            .map(|v| decode_refcount(id, &v))
            .transpose()
    }

    #[instrument(skip(self, id, data), fields(block.id = %id))]
    async fn insert(&self, id: &BlockId, data: Bytes, refcount: u64) -> Result<(), Error> {
        let res: TransactionResult<()> =
            (&self.blocks, &self.refcounts).transaction(|(blocks, refcounts)| {
                blocks.insert(id.as_slice(), data.as_ref())?;
                refcounts.insert(id.as_slice(), &refcount.to_be_bytes()[..])?;
                Ok(())
            });
        res.map_err(transaction_error)
    }

    #[instrument(skip(self, id), fields(block.id = %id))]
    async fn set_refcount(&self, id: &BlockId, refcount: u64) -> Result<(), Error> {
        if !self.refcounts.contains_key(id.as_slice())? {
            return Err(Error::NotFound(format!("block {}", id)));
        }
        self.refcounts
            .insert(id.as_slice(), &refcount.to_be_bytes()[..])?;
        Ok(())
    }

    #[instrument(skip(self, id), fields(block.id = %id))]
    async fn delete(&self, id: &BlockId) -> Result<bool, Error> {
        let res: TransactionResult<bool> =
            (&self.blocks, &self.refcounts).transaction(|(blocks, refcounts)| {
                blocks.remove(id.as_slice())?;
                Ok(refcounts.remove(id.as_slice())?.is_some())
            });
        res.map_err(transaction_error)
    }

    fn list(&self) -> BoxStream<'static, Result<(BlockId, u64), Error>> {
        stream::iter(self.refcounts.iter())
            .map(|item| {
                let (k, v) = item?;
                let id = BlockId::try_from(k.as_ref())?;
                Ok((id, decode_refcount(&id, &v)?))
            })
            .boxed()
    }

    #[instrument(skip(self))]
    async fn get_root(&self, label: &str) -> Result<Option<BlockId>, Error> {
        Ok(self
            .roots
            .get(label.as_bytes())?
            .map(|v| BlockId::try_from(v.as_ref()))
            .transpose()?)
    }

    #[instrument(skip(self, id))]
    async fn set_root(&self, label: &str, id: Option<&BlockId>) -> Result<(), Error> {
        match id {
            Some(id) => self.roots.insert(label.as_bytes(), id.as_slice())?,
            None => self.roots.remove(label.as_bytes())?,
        };
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_roots(&self) -> Result<Vec<(String, BlockId)>, Error> {
        self.roots
            .iter()
            .map(|item| {
                let (k, v) = item?;
                let label = String::from_utf8(k.to_vec())
                    .map_err(|e| Error::StorageError(format!("invalid label: {}", e)))?;
                Ok((label, BlockId::try_from(v.as_ref())?))
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn flush(&self) -> Result<(), Error> {
        self.db.flush_async().await?;
        Ok(())
    }
}
