//! Reference-counted, content-addressed block storage on top of a
//! [BlockService].
//!
//! A block's refcount is the number of stored blocks pointing at it, plus
//! the number of labels bound to it, plus transient holder references taken
//! by callers. Storing a new block takes one reference on every block its
//! plaintext points at; physically deleting it releases them again.
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::blockservice::{self, BlockService};
use crate::transform::BlockCodec;
use crate::{BlockId, Error};

mod options;

#[cfg(test)]
mod tests;

pub use self::options::StoreOptions;

/// Number of mutexes ids are hashed onto to serialize refcount updates.
const LOCK_STRIPES: usize = 256;

/// How many blocks [BlockStore::put_many] encodes at the same time.
const PUT_CONCURRENCY: usize = 16;

/// Tells the store which blocks a block plaintext points at.
pub trait ReferenceExtractor: Send + Sync {
    fn references(&self, plaintext: &[u8]) -> Result<Vec<BlockId>, Error>;
}

/// Treats every block as a leaf.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReferences;

impl ReferenceExtractor for NoReferences {
    fn references(&self, _plaintext: &[u8]) -> Result<Vec<BlockId>, Error> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub deleted: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    /// Blocks reachable from some label.
    pub reachable: u64,
    /// Blocks whose stored refcount was wrong.
    pub rewritten: u64,
    /// Unreachable blocks that were removed.
    pub deleted: u64,
    /// Reachable blocks that are missing or do not decode.
    pub unreadable: Vec<BlockId>,
}

#[derive(Debug, Default, PartialEq)]
pub struct VerifyReport {
    pub checked: u64,
    pub failures: Vec<(BlockId, Error)>,
    /// Labels pointing at blocks that do not exist.
    pub dangling_roots: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.dangling_roots.is_empty()
    }
}

struct Inner {
    service: Arc<dyn BlockService>,
    codec: Arc<BlockCodec>,
    references: RwLock<Arc<dyn ReferenceExtractor>>,
    shared: bool,

    /// Serializes put/addref/decref per id.
    stripes: Vec<tokio::sync::Mutex<()>>,
    /// Held shared by every mutation, exclusively by gc and rebuild.
    gate: tokio::sync::RwLock<()>,
    /// Serializes read-modify-write of labels.
    roots: tokio::sync::Mutex<()>,

    cache: Option<Mutex<LruCache<BlockId, Bytes>>>,
}

/// Handle to a block store. Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct BlockStore {
    inner: Arc<Inner>,
}

impl BlockStore {
    pub fn new(service: Arc<dyn BlockService>, codec: BlockCodec, options: &StoreOptions) -> Self {
        let cache = NonZeroUsize::new(options.cache_size).map(|n| Mutex::new(LruCache::new(n)));
        Self {
            inner: Arc::new(Inner {
                service,
                codec: Arc::new(codec),
                references: RwLock::new(Arc::new(NoReferences)),
                shared: options.shared,
                stripes: (0..LOCK_STRIPES)
                    .map(|_| tokio::sync::Mutex::new(()))
                    .collect(),
                gate: tokio::sync::RwLock::new(()),
                roots: tokio::sync::Mutex::new(()),
                cache,
            }),
        }
    }

    /// Opens the store described by `uri` (see [blockservice::from_addr]).
    /// Without a passphrase blocks are stored unencrypted.
    pub async fn open(uri: &str, passphrase: Option<&[u8]>) -> Result<Self, Error> {
        let (service, options) = blockservice::from_addr(uri).await?;
        let key = match passphrase {
            Some(passphrase) => {
                let options = options.clone();
                let passphrase = passphrase.to_vec();
                Some(tokio::task::spawn_blocking(move || options.derive_key(&passphrase)).await?)
            }
            None => None,
        };
        let codec = options.codec(key);
        Ok(Self::new(service, codec, &options))
    }

    /// Installs the decoder used to find references inside block plaintext.
    pub fn set_reference_extractor(&self, references: Arc<dyn ReferenceExtractor>) {
        *self.inner.references.write() = references;
    }

    pub fn codec(&self) -> &BlockCodec {
        &self.inner.codec
    }

    pub fn is_shared(&self) -> bool {
        self.inner.shared
    }

    fn stripe(&self, id: &BlockId) -> &tokio::sync::Mutex<()> {
        &self.inner.stripes[id.as_slice()[0] as usize % LOCK_STRIPES]
    }

    fn references(&self, plaintext: &[u8]) -> Result<Vec<BlockId>, Error> {
        let extractor = self.inner.references.read().clone();
        extractor.references(plaintext)
    }

    fn cache_get(&self, id: &BlockId) -> Option<Bytes> {
        self.inner
            .cache
            .as_ref()
            .and_then(|cache| cache.lock().get(id).cloned())
    }

    fn cache_put(&self, id: &BlockId, plaintext: Bytes) {
        if let Some(cache) = &self.inner.cache {
            cache.lock().put(*id, plaintext);
        }
    }

    fn cache_remove(&self, id: &BlockId) {
        if let Some(cache) = &self.inner.cache {
            cache.lock().pop(id);
        }
    }

    async fn decode(&self, id: &BlockId, data: Bytes) -> Result<Bytes, Error> {
        let codec = self.inner.codec.clone();
        let id = *id;
        tokio::task::spawn_blocking(move || codec.decode(&id, &data)).await?
    }

    /// Loads a block regardless of its refcount.
    async fn load(&self, id: &BlockId) -> Result<Bytes, Error> {
        if let Some(plaintext) = self.cache_get(id) {
            return Ok(plaintext);
        }
        let stored = self
            .inner
            .service
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("block {}", id)))?;
        let plaintext = self.decode(id, stored.data).await?;
        self.cache_put(id, plaintext.clone());
        Ok(plaintext)
    }

    /// Returns the plaintext of a live block.
    #[instrument(skip(self, id), fields(block.id = %id), err)]
    pub async fn get(&self, id: &BlockId) -> Result<Bytes, Error> {
        if let Some(plaintext) = self.cache_get(id) {
            return Ok(plaintext);
        }
        let stored = match self.inner.service.get(id).await? {
            Some(stored) if stored.refcount > 0 => stored,
            _ => return Err(Error::NotFound(format!("block {}", id))),
        };
        let plaintext = self.decode(id, stored.data).await?;
        self.cache_put(id, plaintext.clone());
        Ok(plaintext)
    }

    /// Whether a live block with this id exists.
    #[instrument(skip(self, id), fields(block.id = %id), ret, err)]
    pub async fn contains(&self, id: &BlockId) -> Result<bool, Error> {
        Ok(self.refcount(id).await?.is_some_and(|refcount| refcount > 0))
    }

    /// The stored refcount. Zero only happens in shared mode, for blocks
    /// awaiting collection.
    pub async fn refcount(&self, id: &BlockId) -> Result<Option<u64>, Error> {
        self.inner.service.refcount(id).await
    }

    /// Stores a block, returning its id with one holder reference the caller
    /// has to release eventually.
    #[instrument(skip_all, fields(plaintext.len = plaintext.len()), err)]
    pub async fn put(&self, plaintext: Bytes) -> Result<BlockId, Error> {
        let _gate = self.inner.gate.read().await;
        self.put_locked(plaintext).await
    }

    /// Stores many blocks, encoding them concurrently on the blocking pool.
    /// Returns the ids in input order, each with one holder reference.
    #[instrument(skip_all, fields(blocks = blocks.len()), err)]
    pub async fn put_many(&self, blocks: Vec<Bytes>) -> Result<Vec<BlockId>, Error> {
        let _gate = self.inner.gate.read().await;
        futures::stream::iter(blocks)
            .map(|plaintext| self.put_locked(plaintext))
            .buffered(PUT_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn put_locked(&self, plaintext: Bytes) -> Result<BlockId, Error> {
        let codec = self.inner.codec.clone();
        let (id, plaintext) =
            tokio::task::spawn_blocking(move || (codec.id_for(&plaintext), plaintext)).await?;

        let children = {
            let _stripe = self.stripe(&id).lock().await;
            if let Some(refcount) = self.inner.service.refcount(&id).await? {
                if refcount == 0 {
                    debug!(block.id = %id, "reviving block awaiting collection");
                }
                self.inner.service.set_refcount(&id, refcount + 1).await?;
                return Ok(id);
            }

            let children = self.references(&plaintext)?;
            let codec = self.inner.codec.clone();
            let encoded = {
                let plaintext = plaintext.clone();
                tokio::task::spawn_blocking(move || codec.encode(&plaintext)).await??
            };
            self.inner
                .service
                .insert(&id, encoded.to_bytes(), 1)
                .await?;
            self.cache_put(&id, plaintext);
            children
        };

        // The caller holds the children, so they cannot vanish in between.
        for child in &children {
            self.addref_locked(child).await?;
        }

        Ok(id)
    }

    #[instrument(skip(self, id), fields(block.id = %id), err)]
    pub async fn addref(&self, id: &BlockId) -> Result<(), Error> {
        let _gate = self.inner.gate.read().await;
        self.addref_locked(id).await
    }

    async fn addref_locked(&self, id: &BlockId) -> Result<(), Error> {
        let _stripe = self.stripe(id).lock().await;
        match self.inner.service.refcount(id).await? {
            Some(refcount) => self.inner.service.set_refcount(id, refcount + 1).await,
            None => Err(Error::NotFound(format!("block {}", id))),
        }
    }

    /// Releases one reference. Returns whether the refcount dropped to zero.
    #[instrument(skip(self, id), fields(block.id = %id), err)]
    pub async fn decref(&self, id: &BlockId) -> Result<bool, Error> {
        let _gate = self.inner.gate.read().await;
        self.release(id).await
    }

    async fn release(&self, id: &BlockId) -> Result<bool, Error> {
        let mut freed = None;
        let mut work = vec![*id];

        while let Some(id) = work.pop() {
            let (zero, children) = {
                let _stripe = self.stripe(&id).lock().await;
                let refcount = self
                    .inner
                    .service
                    .refcount(&id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("block {}", id)))?;

                match refcount {
                    0 => return Err(Error::RefcountUnderflow(id)),
                    1 if self.inner.shared => {
                        self.inner.service.set_refcount(&id, 0).await?;
                        self.cache_remove(&id);
                        (true, Vec::new())
                    }
                    1 => {
                        let children = self.children_of(&id).await;
                        self.inner.service.delete(&id).await?;
                        self.cache_remove(&id);
                        (true, children)
                    }
                    n => {
                        self.inner.service.set_refcount(&id, n - 1).await?;
                        (false, Vec::new())
                    }
                }
            };
            freed.get_or_insert(zero);
            work.extend(children);
        }

        Ok(freed.unwrap_or(false))
    }

    /// References held by a block about to be deleted. A block that cannot
    /// be read leaks its children, which [BlockStore::rebuild_refcounts]
    /// recovers.
    async fn children_of(&self, id: &BlockId) -> Vec<BlockId> {
        match self.load(id).await.and_then(|p| self.references(&p)) {
            Ok(children) => children,
            Err(e) => {
                warn!(block.id = %id, err = %e, "unable to read references of deleted block");
                Vec::new()
            }
        }
    }

    /// Binds `label` to `id`. The new target is referenced before the label
    /// moves, the old target is released afterwards.
    #[instrument(skip(self, id), fields(block.id = %id), err)]
    pub async fn bind_root(&self, label: &str, id: &BlockId) -> Result<(), Error> {
        let _gate = self.inner.gate.read().await;
        let _roots = self.inner.roots.lock().await;

        let old = self.inner.service.get_root(label).await?;
        if old == Some(*id) {
            return Ok(());
        }

        self.addref_locked(id).await?;
        self.inner.service.set_root(label, Some(id)).await?;
        if let Some(old) = old {
            self.release(&old).await?;
        }
        Ok(())
    }

    /// Removes a label, releasing its target. Returns whether it was bound.
    #[instrument(skip(self), err)]
    pub async fn unbind_root(&self, label: &str) -> Result<bool, Error> {
        let _gate = self.inner.gate.read().await;
        let _roots = self.inner.roots.lock().await;

        match self.inner.service.get_root(label).await? {
            Some(old) => {
                self.inner.service.set_root(label, None).await?;
                self.release(&old).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn resolve_root(&self, label: &str) -> Result<BlockId, Error> {
        self.inner
            .service
            .get_root(label)
            .await?
            .ok_or_else(|| Error::NotFound(format!("root {}", label)))
    }

    /// Like [BlockStore::resolve_root], but an unbound label is not an error.
    pub async fn lookup_root(&self, label: &str) -> Result<Option<BlockId>, Error> {
        self.inner.service.get_root(label).await
    }

    pub async fn list_roots(&self) -> Result<Vec<(String, BlockId)>, Error> {
        self.inner.service.list_roots().await
    }

    /// Deletes all blocks whose refcount dropped to zero, cascading into
    /// their children. Waits for all in-flight mutations and blocks new ones
    /// while running.
    #[instrument(skip(self), err)]
    pub async fn gc(&self) -> Result<GcReport, Error> {
        let _gate = self.inner.gate.write().await;
        self.inner.service.flush().await?;

        let mut report = GcReport::default();
        loop {
            let unreferenced: Vec<BlockId> = self
                .inner
                .service
                .list()
                .try_filter_map(|(id, refcount)| async move { Ok((refcount == 0).then_some(id)) })
                .try_collect()
                .await?;
            if unreferenced.is_empty() {
                break;
            }

            for id in unreferenced {
                let children = self.children_of(&id).await;
                self.inner.service.delete(&id).await?;
                self.cache_remove(&id);
                report.deleted += 1;

                for child in children {
                    match self.inner.service.refcount(&child).await? {
                        Some(refcount) if refcount > 0 => {
                            self.inner
                                .service
                                .set_refcount(&child, refcount - 1)
                                .await?
                        }
                        _ => warn!(block.id = %child, "child of collected block has no references"),
                    }
                }
            }
        }

        self.inner.service.flush().await?;
        info!(deleted = report.deleted, "garbage collection finished");
        Ok(report)
    }

    /// Recomputes every refcount from the labels and the references inside
    /// reachable blocks, and removes everything unreachable.
    ///
    /// Holder references are not part of the stored state, so this must only
    /// run while nobody holds any (no open files, no running writers).
    #[instrument(skip(self), err)]
    pub async fn rebuild_refcounts(&self) -> Result<RebuildReport, Error> {
        let _gate = self.inner.gate.write().await;
        let mut report = RebuildReport::default();

        let mut counts: HashMap<BlockId, u64> = HashMap::new();
        let mut visited: HashSet<BlockId> = HashSet::new();
        let mut work: Vec<BlockId> = Vec::new();

        for (_label, id) in self.inner.service.list_roots().await? {
            *counts.entry(id).or_default() += 1;
            work.push(id);
        }

        while let Some(id) = work.pop() {
            if !visited.insert(id) {
                continue;
            }
            match self.load(&id).await.and_then(|p| self.references(&p)) {
                Ok(children) => {
                    report.reachable += 1;
                    for child in children {
                        *counts.entry(child).or_default() += 1;
                        work.push(child);
                    }
                }
                Err(e) => {
                    warn!(block.id = %id, err = %e, "reachable block is unreadable");
                    report.unreadable.push(id);
                }
            }
        }

        let stored: Vec<(BlockId, u64)> = self.inner.service.list().try_collect().await?;
        for (id, old) in stored {
            match counts.get(&id) {
                None => {
                    self.inner.service.delete(&id).await?;
                    report.deleted += 1;
                }
                Some(&new) if new != old => {
                    debug!(block.id = %id, old, new, "fixing refcount");
                    self.inner.service.set_refcount(&id, new).await?;
                    report.rewritten += 1;
                }
                Some(_) => {}
            }
        }

        if let Some(cache) = &self.inner.cache {
            cache.lock().clear();
        }
        self.inner.service.flush().await?;

        info!(
            reachable = report.reachable,
            rewritten = report.rewritten,
            deleted = report.deleted,
            unreadable = report.unreadable.len(),
            "refcounts rebuilt"
        );
        Ok(report)
    }

    /// Decodes every live block and checks every label, without changing
    /// anything.
    #[instrument(skip(self), err)]
    pub async fn verify(&self) -> Result<VerifyReport, Error> {
        let mut report = VerifyReport::default();

        let stored: Vec<(BlockId, u64)> = self.inner.service.list().try_collect().await?;
        for (id, refcount) in stored {
            if refcount == 0 {
                continue;
            }
            report.checked += 1;
            let result = match self.inner.service.get(&id).await {
                Ok(Some(stored)) => self.decode(&id, stored.data).await.map(|_| ()),
                // deleted since listing
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(block.id = %id, err = %e, "block failed verification");
                report.failures.push((id, e));
            }
        }

        for (label, id) in self.inner.service.list_roots().await? {
            if !self.inner.service.contains(&id).await? {
                warn!(label = %label, block.id = %id, "label points at a missing block");
                report.dangling_roots.push(label);
            }
        }

        Ok(report)
    }

    pub async fn flush(&self) -> Result<(), Error> {
        self.inner.service.flush().await
    }
}
