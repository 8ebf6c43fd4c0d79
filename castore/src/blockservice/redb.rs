use async_trait::async_trait;
use bytes::Bytes;
use async_stream::try_stream;
use futures::stream::BoxStream;
use redb::{Database, ReadableTable, TableDefinition};
use std::{path::PathBuf, sync::Arc};
use tracing::{instrument, warn};

use super::{BlockService, StoredBlock};
use crate::{digests::BLOCK_ID_LEN, BlockId, Error};

const BLOCK_TABLE: TableDefinition<[u8; BLOCK_ID_LEN], &[u8]> = TableDefinition::new("block");
const REFCOUNT_TABLE: TableDefinition<[u8; BLOCK_ID_LEN], u64> =
    TableDefinition::new("refcount");
const ROOT_TABLE: TableDefinition<&str, [u8; BLOCK_ID_LEN]> = TableDefinition::new("root");

#[derive(Clone)]
pub struct RedbBlockService {
    // We wrap the db in an Arc to be able to move it into spawn_blocking,
    // as discussed in https://github.com/cberner/redb/issues/789
    db: Arc<Database>,
}

impl RedbBlockService {
    /// Constructs a new instance using the specified filesystem path for
    /// storage.
    pub async fn new(path: PathBuf) -> Result<Self, Error> {
        if path == PathBuf::from("/") {
            return Err(Error::StorageError(
                "cowardly refusing to open / with redb".to_string(),
            ));
        }

        let db = tokio::task::spawn_blocking(|| -> Result<_, redb::Error> {
            let db = redb::Database::create(path)?;
            create_schema(&db)?;
            Ok(db)
        })
        .await??;

        Ok(Self { db: Arc::new(db) })
    }

    /// Constructs a new instance using the in-memory backend.
    pub fn new_temporary() -> Result<Self, Error> {
        let db =
            redb::Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;

        create_schema(&db)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Runs `f` against the database on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, Error> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

/// Ensures all tables are present.
fn create_schema(db: &redb::Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(BLOCK_TABLE)?;
    txn.open_table(REFCOUNT_TABLE)?;
    txn.open_table(ROOT_TABLE)?;
    txn.commit()?;

    Ok(())
}

#[async_trait]
impl BlockService for RedbBlockService {
    #[instrument(skip(self, id), fields(block.id = %id))]
    async fn get(&self, id: &BlockId) -> Result<Option<StoredBlock>, Error> {
        let key: [u8; BLOCK_ID_LEN] = (*id).into();
        let id = *id;
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let refcounts = txn.open_table(REFCOUNT_TABLE)?;
            let blocks = txn.open_table(BLOCK_TABLE)?;
            let Some(refcount) = refcounts.get(key)? else {
                return Ok(None);
            };
            let refcount = refcount.value();
            match blocks.get(key)? {
                Some(data) => Ok(Some(StoredBlock {
                    data: Bytes::copy_from_slice(data.value()),
                    refcount,
                })),
                None => {
                    warn!(block.id = %id, "refcount present, but block data missing");
                    Err(Error::StorageError(format!("block data missing for {}", id)))
                }
            }
        })
        .await
    }

    #[instrument(skip(self, id), fields(block.id = %id))]
    async fn refcount(&self, id: &BlockId) -> Result<Option<u64>, Error> {
        let key: [u8; BLOCK_ID_LEN] = (*id).into();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(REFCOUNT_TABLE)?;
            Ok(table.get(key)?.map(|v| v.value()))
        })
        .await
    }

    #[instrument(skip(self, id, data), fields(block.id = %id))]
    async fn insert(&self, id: &BlockId, data: Bytes, refcount: u64) -> Result<(), Error> {
        let key: [u8; BLOCK_ID_LEN] = (*id).into();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut blocks = txn.open_table(BLOCK_TABLE)?;
                let mut refcounts = txn.open_table(REFCOUNT_TABLE)?;
                blocks.insert(key, data.as_ref())?;
                refcounts.insert(key, refcount)?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, id), fields(block.id = %id))]
    async fn set_refcount(&self, id: &BlockId, refcount: u64) -> Result<(), Error> {
        let key: [u8; BLOCK_ID_LEN] = (*id).into();
        let id = *id;
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(REFCOUNT_TABLE)?;
                if table.get(key)?.is_none() {
                    return Err(Error::NotFound(format!("block {}", id)));
                }
                table.insert(key, refcount)?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, id), fields(block.id = %id))]
    async fn delete(&self, id: &BlockId) -> Result<bool, Error> {
        let key: [u8; BLOCK_ID_LEN] = (*id).into();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            let existed = {
                let mut blocks = txn.open_table(BLOCK_TABLE)?;
                let mut refcounts = txn.open_table(REFCOUNT_TABLE)?;
                blocks.remove(key)?;
                let removed = refcounts.remove(key)?;
                removed.is_some()
            };
            txn.commit()?;
            Ok(existed)
        })
        .await
    }

    fn list(&self) -> BoxStream<'static, Result<(BlockId, u64), Error>> {
        let db = self.db.clone();
        Box::pin(try_stream! {
            let entries = tokio::task::spawn_blocking(move || -> Result<Vec<_>, Error> {
                let txn = db.begin_read()?;
                let table = txn.open_table(REFCOUNT_TABLE)?;
                let mut entries = Vec::new();
                for item in table.iter()? {
                    let (k, v) = item?;
                    entries.push((BlockId::from(k.value()), v.value()));
                }
                Ok(entries)
            })
            .await??;

            for entry in entries {
                yield entry;
            }
        })
    }

    #[instrument(skip(self))]
    async fn get_root(&self, label: &str) -> Result<Option<BlockId>, Error> {
        let label = label.to_owned();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(ROOT_TABLE)?;
            Ok(table.get(label.as_str())?.map(|v| BlockId::from(v.value())))
        })
        .await
    }

    #[instrument(skip(self, id))]
    async fn set_root(&self, label: &str, id: Option<&BlockId>) -> Result<(), Error> {
        let label = label.to_owned();
        let target: Option<[u8; BLOCK_ID_LEN]> = id.map(|id| (*id).into());
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(ROOT_TABLE)?;
                match target {
                    Some(target) => {
                        table.insert(label.as_str(), target)?;
                    }
                    None => {
                        table.remove(label.as_str())?;
                    }
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_roots(&self) -> Result<Vec<(String, BlockId)>, Error> {
        self.blocking(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(ROOT_TABLE)?;
            let mut roots = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                roots.push((k.value().to_owned(), BlockId::from(v.value())));
            }
            Ok(roots)
        })
        .await
    }
}
