//! The forest: directory trees reachable from the `content` label, plus the
//! local bookkeeping trees next to it.
//!
//! Every mutation runs under a single writer lock. It rebuilds the changed
//! directory and all of its ancestors copy-on-write, and publishes the new
//! content root with one [BlockStore::bind_root]. Readers never see a
//! half-applied change.
use async_stream::try_stream;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::blockstore::BlockStore;
use crate::proto::DirHeader;
use crate::sync::{MergeOutcome, Synchronizer};
use crate::{BlockId, Error};

pub mod btree;
mod clock;
mod file;
pub mod kinds;
pub mod node;
mod path;


pub use self::btree::{BTree, HeaderUpdate, TreeParams};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::file::{FileHandle, DEFAULT_FILE_BLOCK_SIZE, MAX_READ_SIZE};
pub use self::kinds::{
    AuxEntry, AuxTree, DataRef, DirEntry, DirectoryTree, EntryTarget, FileBlockTree, FileLayout,
    Metadata, TreeKind,
};
pub use self::node::NodeReferences;
pub use self::path::{join_path, split_path, PathComponent};

use self::file::Files;

/// Root of the directory hierarchy.
pub const CONTENT_LABEL: &str = "content";
/// [AuxTree] of snapshot names.
pub const SNAPSHOTS_LABEL: &str = "snapshots";
/// [AuxTree] of the last merged root per peer.
pub const SYNC_LABEL: &str = "sync";
/// [AuxTree] counting accesses to blocks adopted from remote stores.
pub const REMOTE_USAGE_LABEL: &str = "remote-usage";

pub const RESERVED_LABELS: [&str; 4] = [
    CONTENT_LABEL,
    SNAPSHOTS_LABEL,
    SYNC_LABEL,
    REMOTE_USAGE_LABEL,
];

pub const DEFAULT_DIR_MODE: u32 = 0o755;
pub const DEFAULT_FILE_MODE: u32 = 0o644;
pub const DEFAULT_SYMLINK_MODE: u32 = 0o777;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForestOptions {
    pub tree: TreeParams,
    /// Files up to this size live in a single block, larger ones are cut
    /// into blocks of this size.
    pub file_block_size: usize,
}

impl Default for ForestOptions {
    fn default() -> Self {
        Self {
            tree: TreeParams::default(),
            file_block_size: DEFAULT_FILE_BLOCK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub name: String,
    pub root: BlockId,
    pub timestamp: u64,
}

enum DirEdit {
    Insert(PathComponent, DirEntry),
    Remove(PathComponent),
}

fn split_parent(path: &[u8]) -> Result<(Vec<PathComponent>, PathComponent), Error> {
    let mut components = split_path(path)?;
    match components.pop() {
        Some(name) => Ok((components, name)),
        None => Err(Error::InvalidRequest(
            "operation not permitted on the root directory".into(),
        )),
    }
}

fn child_path(parent: &[PathComponent], name: &PathComponent) -> String {
    let mut components = parent.to_vec();
    components.push(name.clone());
    join_path(&components)
}

fn file_layout(entry: &DirEntry, path: &[PathComponent]) -> Result<(FileLayout, u64), Error> {
    match &entry.target {
        EntryTarget::File { layout, size } => Ok((*layout, *size)),
        EntryTarget::Directory(_) => Err(Error::IsADirectory(join_path(path))),
        EntryTarget::Symlink(_) => Err(Error::InvalidRequest(format!(
            "{} is a symlink",
            join_path(path)
        ))),
    }
}

fn check_label(name: &str) -> Result<(), Error> {
    if name.is_empty() || RESERVED_LABELS.contains(&name) {
        return Err(Error::InvalidRequest(format!(
            "{:?} cannot be used as a label",
            name
        )));
    }
    Ok(())
}

fn decode_count(data: &[u8]) -> u64 {
    <[u8; 8]>::try_from(data)
        .map(u64::from_be_bytes)
        .unwrap_or_default()
}

/// A holder reference on a block, released when the owner is done with it
/// or dropped.
struct Pinned {
    store: BlockStore,
    id: Option<BlockId>,
}

impl Pinned {
    fn new(store: BlockStore, id: BlockId) -> Self {
        Self {
            store,
            id: Some(id),
        }
    }

    async fn release(&mut self) -> Result<(), Error> {
        if let Some(id) = self.id.take() {
            self.store.decref(&id).await?;
        }
        Ok(())
    }
}

impl Drop for Pinned {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move {
                    if let Err(e) = store.decref(&id).await {
                        warn!(block.id = %id, err = %e, "failed to release pinned block");
                    }
                });
            }
            Err(_) => {
                warn!(
                    block.id = %id,
                    "no runtime to release pinned block, it stays referenced until fsck"
                )
            }
        }
    }
}

struct ForestInner {
    store: BlockStore,
    options: ForestOptions,
    dirs: BTree<DirectoryTree>,
    aux: BTree<AuxTree>,
    files: Files,
    clock: Arc<dyn Clock>,

    /// Serializes mutations.
    writer: tokio::sync::Mutex<()>,
    /// Held shared by readers, exclusively while a label moves.
    publish: tokio::sync::RwLock<()>,
}

/// Handle to a forest. Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct Forest {
    inner: Arc<ForestInner>,
}

impl Forest {
    pub async fn open(store: BlockStore, options: ForestOptions) -> Result<Self, Error> {
        Self::with_clock(store, options, Arc::new(SystemClock)).await
    }

    /// Opens the forest in `store`, creating the reserved labels that are
    /// not bound yet.
    #[instrument(skip_all, err)]
    pub async fn with_clock(
        store: BlockStore,
        options: ForestOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        store.set_reference_extractor(Arc::new(NodeReferences));

        let forest = Self {
            inner: Arc::new(ForestInner {
                dirs: BTree::new(store.clone(), options.tree),
                aux: BTree::new(store.clone(), options.tree),
                files: Files::new(store.clone(), options.tree, options.file_block_size),
                store,
                options,
                clock,
                writer: tokio::sync::Mutex::new(()),
                publish: tokio::sync::RwLock::new(()),
            }),
        };

        let writer = forest.inner.writer.lock().await;
        for label in RESERVED_LABELS {
            if forest.inner.store.lookup_root(label).await?.is_some() {
                continue;
            }
            let root = if label == CONTENT_LABEL {
                forest.inner.dirs.empty(Some(DirHeader::default())).await?
            } else {
                forest.inner.aux.empty(None).await?
            };
            debug!(label = %label, "creating reserved label");
            forest.publish(label, root).await?;
        }
        drop(writer);

        Ok(forest)
    }

    pub fn store(&self) -> &BlockStore {
        &self.inner.store
    }

    pub fn options(&self) -> &ForestOptions {
        &self.inner.options
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub(crate) fn dirs(&self) -> &BTree<DirectoryTree> {
        &self.inner.dirs
    }

    fn now(&self) -> u64 {
        self.inner.clock.now()
    }

    fn default_meta(&self, mode: u32) -> Metadata {
        let now = self.now();
        Metadata {
            mode,
            uid: 0,
            gid: 0,
            mtime: now,
            ctime: now,
        }
    }

    /// The currently published root of the directory hierarchy.
    pub async fn root(&self) -> Result<BlockId, Error> {
        self.inner.store.resolve_root(CONTENT_LABEL).await
    }

    /// Binds `label` to `root`, consuming the holder reference on `root`.
    async fn publish(&self, label: &str, root: BlockId) -> Result<(), Error> {
        let bound = {
            let _publish = self.inner.publish.write().await;
            self.inner.store.bind_root(label, &root).await
        };
        self.inner.store.decref(&root).await?;
        bound
    }

    /// Directory roots from `root` down to the directory named by
    /// `components`, both included.
    async fn walk(
        &self,
        root: &BlockId,
        components: &[PathComponent],
    ) -> Result<Vec<BlockId>, Error> {
        let mut chain = Vec::with_capacity(components.len() + 1);
        let mut current = *root;
        chain.push(current);

        for (i, name) in components.iter().enumerate() {
            let entry = self
                .inner
                .dirs
                .lookup(&current, name)
                .await?
                .ok_or_else(|| Error::NotFound(join_path(&components[..=i])))?;
            match entry.target {
                EntryTarget::Directory(id) => {
                    current = id;
                    chain.push(id);
                }
                _ => return Err(Error::NotADirectory(join_path(&components[..=i]))),
            }
        }
        Ok(chain)
    }

    async fn dir_at(&self, root: &BlockId, components: &[PathComponent]) -> Result<BlockId, Error> {
        Ok(self
            .walk(root, components)
            .await?
            .last()
            .copied()
            .unwrap_or(*root))
    }

    async fn root_entry(&self, root: &BlockId) -> Result<DirEntry, Error> {
        let header = self.inner.dirs.header(root).await?.unwrap_or_default();
        Ok(DirEntry {
            target: EntryTarget::Directory(*root),
            meta: Metadata {
                mode: DEFAULT_DIR_MODE,
                uid: 0,
                gid: 0,
                mtime: header.last_modified,
                ctime: header.last_modified,
            },
        })
    }

    async fn entry_at(
        &self,
        root: &BlockId,
        components: &[PathComponent],
    ) -> Result<DirEntry, Error> {
        match components.split_last() {
            None => self.root_entry(root).await,
            Some((name, parent)) => {
                let dir = self.dir_at(root, parent).await?;
                self.inner
                    .dirs
                    .lookup(&dir, name)
                    .await?
                    .ok_or_else(|| Error::NotFound(join_path(components)))
            }
        }
    }

    /// Rewrites the directory at `dir` below `root` and all its ancestors.
    /// Returns the new content root with a holder reference.
    async fn edit_dir(
        &self,
        root: &BlockId,
        dir: &[PathComponent],
        edit: DirEdit,
    ) -> Result<BlockId, Error> {
        let chain = self.walk(root, dir).await?;
        let target = chain.last().copied().unwrap_or(*root);
        let now = self.now();
        let store = &self.inner.store;

        let mut new = match edit {
            DirEdit::Insert(name, entry) => {
                self.inner
                    .dirs
                    .insert_with(&target, &name, &entry, HeaderUpdate::Touch(now))
                    .await?
            }
            DirEdit::Remove(name) => self
                .inner
                .dirs
                .delete_with(&target, &name, HeaderUpdate::Touch(now))
                .await?
                .ok_or_else(|| Error::NotFound(child_path(dir, &name)))?,
        };

        for (name, parent) in dir.iter().zip(&chain).rev() {
            let inserted = async {
                let mut entry = self
                    .inner
                    .dirs
                    .lookup(parent, name)
                    .await?
                    .ok_or_else(|| Error::NotFound(name.to_string()))?;
                entry.target = EntryTarget::Directory(new);
                self.inner
                    .dirs
                    .insert_with(parent, name, &entry, HeaderUpdate::Touch(now))
                    .await
            }
            .await;
            store.decref(&new).await?;
            new = inserted?;
        }

        Ok(new)
    }

    /// Applies `edit` to the published tree. `holder` is a reference the
    /// edit's entry carries, released once the entry is stored.
    async fn commit(
        &self,
        root: &BlockId,
        dir: &[PathComponent],
        edit: DirEdit,
        holder: Option<BlockId>,
    ) -> Result<(), Error> {
        let edited = self.edit_dir(root, dir, edit).await;
        if let Some(holder) = holder {
            self.inner.store.decref(&holder).await?;
        }
        self.publish(CONTENT_LABEL, edited?).await
    }

    #[instrument(skip_all, err)]
    pub async fn stat(&self, path: impl AsRef<[u8]>) -> Result<DirEntry, Error> {
        let components = split_path(path.as_ref())?;
        let _read = self.inner.publish.read().await;
        let root = self.root().await?;
        self.entry_at(&root, &components).await
    }

    /// Looks up one name in a directory tree. An absent name is not an
    /// error.
    pub async fn lookup(
        &self,
        dir_root: &BlockId,
        name: &PathComponent,
    ) -> Result<Option<DirEntry>, Error> {
        self.inner.dirs.lookup(dir_root, name).await
    }

    /// Lists a directory in key order. The stream sees the directory as it
    /// was when listed and holds a reference on it until it ends or is
    /// dropped, so writers proceed meanwhile.
    pub async fn readdir(
        &self,
        path: impl AsRef<[u8]>,
    ) -> Result<BoxStream<'static, Result<(PathComponent, DirEntry), Error>>, Error> {
        let components = split_path(path.as_ref())?;
        let (dir, pin) = {
            let _read = self.inner.publish.read().await;
            let root = self.root().await?;
            let dir = self.dir_at(&root, &components).await?;
            self.inner.store.addref(&dir).await?;
            (dir, Pinned::new(self.inner.store.clone(), dir))
        };
        let dirs = self.inner.dirs.clone();

        Ok(Box::pin(try_stream! {
            let mut pin = pin;
            let mut entries = dirs.traverse(&dir);
            while let Some(entry) = entries.next().await {
                yield entry?;
            }
            pin.release().await?;
        }))
    }

    #[instrument(skip(self, path), err)]
    pub async fn read_at(
        &self,
        path: impl AsRef<[u8]>,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, Error> {
        let components = split_path(path.as_ref())?;
        let _read = self.inner.publish.read().await;
        let root = self.root().await?;
        let entry = self.entry_at(&root, &components).await?;
        let (layout, size) = file_layout(&entry, &components)?;
        self.inner.files.read_at(&layout, size, offset, len).await
    }

    /// Reads a whole file. Files above [MAX_READ_SIZE] have to be read with
    /// [Forest::read_at] in pieces.
    pub async fn read_file(&self, path: impl AsRef<[u8]>) -> Result<Bytes, Error> {
        self.read_at(path, 0, u64::MAX).await
    }

    pub async fn read_link(&self, path: impl AsRef<[u8]>) -> Result<Bytes, Error> {
        let components = split_path(path.as_ref())?;
        match self.stat(path).await?.target {
            EntryTarget::Symlink(target) => Ok(target),
            _ => Err(Error::InvalidRequest(format!(
                "{} is not a symlink",
                join_path(&components)
            ))),
        }
    }

    /// Opens a file for reading. The handle keeps seeing this version of
    /// the file until it is closed.
    #[instrument(skip_all, err)]
    pub async fn open_file(&self, path: impl AsRef<[u8]>) -> Result<FileHandle, Error> {
        let components = split_path(path.as_ref())?;
        let _read = self.inner.publish.read().await;
        let root = self.root().await?;
        let entry = self.entry_at(&root, &components).await?;
        let (layout, size) = file_layout(&entry, &components)?;
        let layout = self.inner.files.retain(&layout).await?;
        Ok(FileHandle::new(self.inner.files.clone(), entry, layout, size))
    }

    #[instrument(skip(self, path, meta), err)]
    pub async fn mkdir(&self, path: impl AsRef<[u8]>, meta: Option<Metadata>) -> Result<(), Error> {
        let (parent, name) = split_parent(path.as_ref())?;
        let _writer = self.inner.writer.lock().await;
        let root = self.root().await?;

        let dir = self.dir_at(&root, &parent).await?;
        if self.inner.dirs.lookup(&dir, &name).await?.is_some() {
            return Err(Error::AlreadyExists(child_path(&parent, &name)));
        }

        let header = DirHeader {
            last_modified: self.now(),
            ..Default::default()
        };
        let child = self.inner.dirs.empty(Some(header)).await?;
        let entry = DirEntry {
            target: EntryTarget::Directory(child),
            meta: meta.unwrap_or_else(|| self.default_meta(DEFAULT_DIR_MODE)),
        };
        self.commit(&root, &parent, DirEdit::Insert(name, entry), Some(child))
            .await
    }

    #[instrument(skip(self, path, target, meta), err)]
    pub async fn create_symlink(
        &self,
        path: impl AsRef<[u8]>,
        target: impl AsRef<[u8]>,
        meta: Option<Metadata>,
    ) -> Result<(), Error> {
        let (parent, name) = split_parent(path.as_ref())?;
        let _writer = self.inner.writer.lock().await;
        let root = self.root().await?;

        let dir = self.dir_at(&root, &parent).await?;
        if self.inner.dirs.lookup(&dir, &name).await?.is_some() {
            return Err(Error::AlreadyExists(child_path(&parent, &name)));
        }

        let entry = DirEntry {
            target: EntryTarget::Symlink(Bytes::copy_from_slice(target.as_ref())),
            meta: meta.unwrap_or_else(|| self.default_meta(DEFAULT_SYMLINK_MODE)),
        };
        self.commit(&root, &parent, DirEdit::Insert(name, entry), None)
            .await
    }

    /// Replaces the whole content of a file, creating it if needed. Without
    /// `meta` an existing file keeps its metadata apart from `mtime`.
    #[instrument(skip(self, path, data, meta), fields(len = data.len()), err)]
    pub async fn write_file(
        &self,
        path: impl AsRef<[u8]>,
        data: &[u8],
        meta: Option<Metadata>,
    ) -> Result<(), Error> {
        let (parent, name) = split_parent(path.as_ref())?;

        // data blocks are stored before taking the writer lock, so large
        // writes hash in parallel
        let layout = self.inner.files.write_all(data).await?;

        let _writer = self.inner.writer.lock().await;
        let prepared = async {
            let root = self.root().await?;
            let dir = self.dir_at(&root, &parent).await?;
            let meta = match self.inner.dirs.lookup(&dir, &name).await? {
                Some(existing) if existing.is_dir() => {
                    return Err(Error::IsADirectory(child_path(&parent, &name)))
                }
                Some(existing) => meta.unwrap_or(Metadata {
                    mtime: self.now(),
                    ..existing.meta
                }),
                None => meta.unwrap_or_else(|| self.default_meta(DEFAULT_FILE_MODE)),
            };
            Ok((root, meta))
        }
        .await;
        let (root, meta) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.inner.files.release(&layout).await?;
                return Err(e);
            }
        };

        let entry = DirEntry {
            target: EntryTarget::File {
                layout,
                size: data.len() as u64,
            },
            meta,
        };
        self.commit(&root, &parent, DirEdit::Insert(name, entry), layout.block())
            .await
    }

    /// The file at `parent`/`name` for an in-place change. A missing file
    /// counts as empty.
    async fn file_for_update(
        &self,
        root: &BlockId,
        parent: &[PathComponent],
        name: &PathComponent,
        create: bool,
    ) -> Result<(FileLayout, u64, Metadata), Error> {
        let dir = self.dir_at(root, parent).await?;
        match self.inner.dirs.lookup(&dir, name).await? {
            Some(entry) => {
                let mut path = parent.to_vec();
                path.push(name.clone());
                let (layout, size) = file_layout(&entry, &path)?;
                Ok((layout, size, entry.meta))
            }
            None if create => Ok((FileLayout::Empty, 0, self.default_meta(DEFAULT_FILE_MODE))),
            None => Err(Error::NotFound(child_path(parent, name))),
        }
    }

    /// Writes `data` at `offset`, creating the file if needed. A gap between
    /// the old end and `offset` reads as zeroes.
    #[instrument(skip(self, path, data), fields(len = data.len()), err)]
    pub async fn write_at(
        &self,
        path: impl AsRef<[u8]>,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, Error> {
        let (parent, name) = split_parent(path.as_ref())?;
        let _writer = self.inner.writer.lock().await;
        let root = self.root().await?;

        let (layout, size, mut meta) = self.file_for_update(&root, &parent, &name, true).await?;
        let (layout, size) = self
            .inner
            .files
            .write_at(&layout, size, offset, data)
            .await?;
        meta.mtime = self.now();

        let entry = DirEntry {
            target: EntryTarget::File { layout, size },
            meta,
        };
        self.commit(&root, &parent, DirEdit::Insert(name, entry), layout.block())
            .await?;
        Ok(size)
    }

    #[instrument(skip(self, path), err)]
    pub async fn truncate(&self, path: impl AsRef<[u8]>, size: u64) -> Result<(), Error> {
        let (parent, name) = split_parent(path.as_ref())?;
        let _writer = self.inner.writer.lock().await;
        let root = self.root().await?;

        let (layout, old_size, mut meta) =
            self.file_for_update(&root, &parent, &name, false).await?;
        let layout = self.inner.files.truncate(&layout, old_size, size).await?;
        meta.mtime = self.now();

        let entry = DirEntry {
            target: EntryTarget::File { layout, size },
            meta,
        };
        self.commit(&root, &parent, DirEdit::Insert(name, entry), layout.block())
            .await
    }

    #[instrument(skip(self, path), err)]
    pub async fn set_metadata(&self, path: impl AsRef<[u8]>, meta: Metadata) -> Result<(), Error> {
        let (parent, name) = split_parent(path.as_ref())?;
        let _writer = self.inner.writer.lock().await;
        let root = self.root().await?;

        let dir = self.dir_at(&root, &parent).await?;
        let mut entry = self
            .inner
            .dirs
            .lookup(&dir, &name)
            .await?
            .ok_or_else(|| Error::NotFound(child_path(&parent, &name)))?;
        entry.meta = meta;
        self.commit(&root, &parent, DirEdit::Insert(name, entry), None)
            .await
    }

    /// Removes an entry. Directories go with everything below them.
    #[instrument(skip(self, path), err)]
    pub async fn remove(&self, path: impl AsRef<[u8]>) -> Result<(), Error> {
        let (parent, name) = split_parent(path.as_ref())?;
        let _writer = self.inner.writer.lock().await;
        let root = self.root().await?;
        self.commit(&root, &parent, DirEdit::Remove(name), None)
            .await
    }

    /// Moves an entry, replacing a file or an empty directory at the
    /// destination.
    #[instrument(skip(self, from, to), err)]
    pub async fn rename(&self, from: impl AsRef<[u8]>, to: impl AsRef<[u8]>) -> Result<(), Error> {
        let (from_parent, from_name) = split_parent(from.as_ref())?;
        let (to_parent, to_name) = split_parent(to.as_ref())?;
        let mut from_path = from_parent.clone();
        from_path.push(from_name.clone());
        let mut to_path = to_parent.clone();
        to_path.push(to_name.clone());

        let _writer = self.inner.writer.lock().await;
        let root = self.root().await?;
        let entry = self.entry_at(&root, &from_path).await?;
        if from_path == to_path {
            return Ok(());
        }
        if to_path.starts_with(&from_path) {
            return Err(Error::InvalidRequest(format!(
                "cannot move {} into itself",
                join_path(&from_path)
            )));
        }

        let to_dir = self.dir_at(&root, &to_parent).await?;
        if let Some(existing) = self.inner.dirs.lookup(&to_dir, &to_name).await? {
            match (&entry.target, &existing.target) {
                (EntryTarget::Directory(_), EntryTarget::Directory(existing)) => {
                    if !self.inner.dirs.is_empty(existing).await? {
                        return Err(Error::AlreadyExists(join_path(&to_path)));
                    }
                }
                (EntryTarget::Directory(_), _) => {
                    return Err(Error::NotADirectory(join_path(&to_path)))
                }
                (_, EntryTarget::Directory(_)) => {
                    return Err(Error::IsADirectory(join_path(&to_path)))
                }
                _ => {}
            }
        }

        // the entry's blocks stay referenced by the published root meanwhile
        let removed = self
            .edit_dir(&root, &from_parent, DirEdit::Remove(from_name))
            .await?;
        let moved = self
            .edit_dir(&removed, &to_parent, DirEdit::Insert(to_name, entry))
            .await;
        self.inner.store.decref(&removed).await?;
        self.publish(CONTENT_LABEL, moved?).await
    }

    /// Entries have at most one link, so this always fails with
    /// [Error::LinkLimit].
    pub async fn link(&self, _from: impl AsRef<[u8]>, _to: impl AsRef<[u8]>) -> Result<(), Error> {
        Err(Error::LinkLimit)
    }

    /// Inserts or removes one entry of the auxiliary tree at `label`.
    /// Returns whether the tree changed.
    async fn update_aux(
        &self,
        label: &str,
        key: Bytes,
        value: Option<AuxEntry>,
    ) -> Result<bool, Error> {
        let root = self.inner.store.resolve_root(label).await?;
        let new = match value {
            Some(value) => Some(self.inner.aux.insert(&root, &key, &value).await?),
            None => self.inner.aux.delete(&root, &key).await?,
        };
        match new {
            Some(new) => {
                self.publish(label, new).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn aux_entry(&self, label: &str, key: &Bytes) -> Result<Option<AuxEntry>, Error> {
        let _read = self.inner.publish.read().await;
        let root = self.inner.store.resolve_root(label).await?;
        self.inner.aux.lookup(&root, key).await
    }

    /// Records the current content under `name`, both as a label and in the
    /// snapshot index. Returns the recorded root.
    #[instrument(skip(self), err)]
    pub async fn snapshot(&self, name: &str) -> Result<BlockId, Error> {
        check_label(name)?;
        let key = Bytes::copy_from_slice(name.as_bytes());
        let _writer = self.inner.writer.lock().await;

        if self.aux_entry(SNAPSHOTS_LABEL, &key).await?.is_some()
            || self.inner.store.lookup_root(name).await?.is_some()
        {
            return Err(Error::AlreadyExists(format!("snapshot {}", name)));
        }

        let root = self.root().await?;
        {
            let _publish = self.inner.publish.write().await;
            self.inner.store.bind_root(name, &root).await?;
        }
        let entry = AuxEntry {
            block: Some(root),
            data: Bytes::new(),
            timestamp: self.now(),
        };
        self.update_aux(SNAPSHOTS_LABEL, key, Some(entry)).await?;

        info!(snapshot = name, root = %root, "snapshot created");
        Ok(root)
    }

    pub async fn snapshots(&self) -> Result<Vec<Snapshot>, Error> {
        let _read = self.inner.publish.read().await;
        let root = self.inner.store.resolve_root(SNAPSHOTS_LABEL).await?;
        self.inner
            .aux
            .traverse(&root)
            .and_then(|(name, entry)| async move {
                let name = String::from_utf8_lossy(&name).into_owned();
                let root = entry
                    .block
                    .ok_or_else(|| Error::Format(format!("snapshot {} has no root", name)))?;
                Ok::<_, Error>(Snapshot {
                    name,
                    root,
                    timestamp: entry.timestamp,
                })
            })
            .try_collect()
            .await
    }

    pub async fn snapshot_root(&self, name: &str) -> Result<BlockId, Error> {
        self.aux_entry(SNAPSHOTS_LABEL, &Bytes::copy_from_slice(name.as_bytes()))
            .await?
            .and_then(|entry| entry.block)
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", name)))
    }

    #[instrument(skip(self), err)]
    pub async fn delete_snapshot(&self, name: &str) -> Result<(), Error> {
        check_label(name)?;
        let _writer = self.inner.writer.lock().await;

        let indexed = self
            .update_aux(SNAPSHOTS_LABEL, Bytes::copy_from_slice(name.as_bytes()), None)
            .await?;
        let labelled = {
            let _publish = self.inner.publish.write().await;
            self.inner.store.unbind_root(name).await?
        };
        if !indexed && !labelled {
            return Err(Error::NotFound(format!("snapshot {}", name)));
        }
        info!(snapshot = name, "snapshot deleted");
        Ok(())
    }

    /// Makes a snapshot the current content.
    #[instrument(skip(self), err)]
    pub async fn restore_snapshot(&self, name: &str) -> Result<(), Error> {
        let root = self.snapshot_root(name).await?;
        let _writer = self.inner.writer.lock().await;
        self.inner.store.addref(&root).await?;
        self.publish(CONTENT_LABEL, root).await
    }

    /// The content root last merged with `peer`.
    pub async fn sync_base(&self, peer: &str) -> Result<Option<BlockId>, Error> {
        let key = Bytes::copy_from_slice(peer.as_bytes());
        Ok(self
            .aux_entry(SYNC_LABEL, &key)
            .await?
            .and_then(|entry| entry.block))
    }

    /// Merges the content of a remote store into this forest and publishes
    /// the result. The merged root is remembered as the base for the next
    /// merge with `peer`.
    ///
    /// The returned outcome's root is published, it carries no holder
    /// reference.
    #[instrument(skip(self, remote, remote_root), fields(remote.root = %remote_root), err)]
    pub async fn sync_from(
        &self,
        remote: &BlockStore,
        remote_root: &BlockId,
        peer: &str,
    ) -> Result<MergeOutcome, Error> {
        if peer.is_empty() {
            return Err(Error::InvalidRequest("peer name must not be empty".into()));
        }
        let synchronizer = Synchronizer::new(self, remote)?;

        let _writer = self.inner.writer.lock().await;
        let local = self.root().await?;
        let base = self.sync_base(peer).await?;
        let outcome = synchronizer
            .merge(&local, remote_root, base.as_ref())
            .await?;

        let base_entry = AuxEntry {
            block: Some(outcome.root),
            data: Bytes::new(),
            timestamp: self.now(),
        };
        let recorded = self
            .update_aux(SYNC_LABEL, Bytes::copy_from_slice(peer.as_bytes()), Some(base_entry))
            .await;
        if let Err(e) = recorded {
            self.inner.store.decref(&outcome.root).await?;
            return Err(e);
        }
        self.publish(CONTENT_LABEL, outcome.root).await?;
        self.note_remote_blocks_locked(&outcome.adopted).await?;

        info!(
            peer,
            root = %outcome.root,
            adopted = outcome.adopted.len(),
            deferred = outcome.deferred.len(),
            "merged remote content"
        );
        Ok(outcome)
    }

    async fn note_remote_blocks_locked(&self, ids: &[BlockId]) -> Result<(), Error> {
        if ids.is_empty() {
            return Ok(());
        }

        let store = &self.inner.store;
        let mut root = store.resolve_root(REMOTE_USAGE_LABEL).await?;
        store.addref(&root).await?;
        let now = self.now();

        for id in ids {
            let key = Bytes::from(*id);
            let updated = async {
                let count = self
                    .inner
                    .aux
                    .lookup(&root, &key)
                    .await?
                    .map(|entry| decode_count(&entry.data))
                    .unwrap_or(0);
                let entry = AuxEntry {
                    block: None,
                    data: Bytes::copy_from_slice(&(count + 1).to_be_bytes()),
                    timestamp: now,
                };
                self.inner.aux.insert(&root, &key, &entry).await
            }
            .await;
            store.decref(&root).await?;
            root = updated?;
        }

        self.publish(REMOTE_USAGE_LABEL, root).await
    }

    /// Counts an access to a block that came from a remote store. The
    /// bookkeeping does not keep the block alive.
    pub async fn note_remote_block(&self, id: &BlockId) -> Result<(), Error> {
        let _writer = self.inner.writer.lock().await;
        self.note_remote_blocks_locked(&[*id]).await
    }

    pub async fn remote_block_usage(&self, id: &BlockId) -> Result<u64, Error> {
        Ok(self
            .aux_entry(REMOTE_USAGE_LABEL, &Bytes::from(*id))
            .await?
            .map(|entry| decode_count(&entry.data))
            .unwrap_or(0))
    }

    pub async fn flush(&self) -> Result<(), Error> {
        self.inner.store.flush().await
    }
}
