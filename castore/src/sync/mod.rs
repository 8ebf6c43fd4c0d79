//! Merging of a remote directory hierarchy into the local one.
//!
//! Both hierarchies are walked directory by directory. Inside a directory
//! the two entry lists are merged linearly in key order and every key is
//! resolved on its own:
//!
//! * present on both sides: equal entries stay, two directories are merged
//!   recursively, anything else goes to the newer side;
//! * present on one side only: with a common base, an entry the base lacks
//!   was added and stays, an entry equal to the base was deleted on the
//!   other side and goes. Otherwise the entry survives if it changed after
//!   the other side's last delete in that directory.
//!
//! "Newer" compares the effective modification time of an entry, which for
//! directories includes the last change anywhere below them. Equal times go
//! to the entry whose encoding compares greater.
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

use crate::blockstore::{BlockStore, ReferenceExtractor};
use crate::forest::{
    join_path, BTree, DirEntry, DirectoryTree, EntryTarget, Forest, HeaderUpdate, NodeReferences,
    PathComponent, TreeKind,
};
use crate::{BlockId, Error};

#[cfg(test)]
mod tests;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeStats {
    /// Directories present on both sides that were merged.
    pub merged_dirs: u64,
    /// Entries replaced or added from the remote side.
    pub taken_remote: u64,
    /// Conflicting entries where the local side won.
    pub kept_local: u64,
    /// Local entries removed because the remote side deleted them.
    pub deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The merged content root.
    pub root: BlockId,
    /// Paths whose remote side could not be read. The local version was
    /// kept for them.
    pub deferred: Vec<String>,
    /// Blocks copied from the remote store.
    pub adopted: Vec<BlockId>,
    pub stats: MergeStats,
}

/// Which store an error came from. Only remote errors can be deferred.
#[derive(Debug)]
enum Failure {
    Local(Error),
    Remote(Error),
}

impl From<Error> for Failure {
    fn from(value: Error) -> Self {
        Failure::Local(value)
    }
}

impl From<Failure> for Error {
    fn from(value: Failure) -> Self {
        match value {
            Failure::Local(e) | Failure::Remote(e) => e,
        }
    }
}

fn remote(e: Error) -> Failure {
    Failure::Remote(e)
}

fn deferrable(failure: &Failure) -> bool {
    match failure {
        Failure::Remote(e) => e.is_corruption() || matches!(e, Error::NotFound(_)),
        Failure::Local(_) => false,
    }
}

/// What happens to one key of the local directory.
enum Resolution {
    Keep,
    /// Store this encoded entry. The block is a holder reference to release
    /// once the entry is stored.
    Put(Bytes, Option<BlockId>),
    Delete,
}

#[derive(Default)]
struct MergeState {
    deferred: Vec<String>,
    adopted: Vec<BlockId>,
    stats: MergeStats,
}

/// Headers of the two directories a key is resolved in.
#[derive(Clone, Copy)]
struct DirPair {
    local_last_delete: u64,
    remote_last_delete: u64,
    /// Whether a common base is known for this directory.
    has_base: bool,
}

/// Entries of one key on each side.
struct KeyEntries<'a> {
    key: &'a Bytes,
    local: Option<&'a Bytes>,
    remote: Option<&'a Bytes>,
    base: Option<&'a Bytes>,
}

fn display_path(path: &[PathComponent], key: &Bytes) -> String {
    match DirectoryTree::decode_key(key) {
        Ok(name) => {
            let mut components = path.to_vec();
            components.push(name);
            join_path(&components)
        }
        Err(_) => format!("{}/<{}>", join_path(path), data_encoding::HEXLOWER.encode(key)),
    }
}

pub struct Synchronizer<'a> {
    local: &'a Forest,
    remote: BlockStore,
    remote_dirs: BTree<DirectoryTree>,
}

impl<'a> Synchronizer<'a> {
    /// Both stores have to use the same key, so that equal content has equal
    /// ids on both sides.
    pub fn new(local: &'a Forest, remote: &BlockStore) -> Result<Self, Error> {
        if local.store().codec().id_for(b"") != remote.codec().id_for(b"") {
            return Err(Error::InvalidRequest(
                "the remote store uses a different key".into(),
            ));
        }
        Ok(Self {
            local,
            remote: remote.clone(),
            remote_dirs: BTree::new(remote.clone(), local.options().tree),
        })
    }

    fn dirs(&self) -> &BTree<DirectoryTree> {
        self.local.dirs()
    }

    fn store(&self) -> &BlockStore {
        self.local.store()
    }

    /// Merges the directory tree `remote_root` of the remote store into
    /// `local_root`, using `base_root` (a previous merge result) to tell
    /// deletes from adds. Returns the merged root with a holder reference.
    /// Nothing is published.
    #[instrument(skip_all, fields(local.root = %local_root, remote.root = %remote_root), err)]
    pub async fn merge(
        &self,
        local_root: &BlockId,
        remote_root: &BlockId,
        base_root: Option<&BlockId>,
    ) -> Result<MergeOutcome, Error> {
        let mut state = MergeState::default();
        let merged = self
            .merge_dir(*local_root, *remote_root, base_root.copied(), Vec::new(), &mut state)
            .await;

        let root = match merged {
            Ok(root) => root,
            Err(failure) if deferrable(&failure) => {
                warn!(err = %Error::from(failure), "remote root unreadable, keeping local content");
                state.deferred.push("/".into());
                self.store().addref(local_root).await?;
                *local_root
            }
            Err(failure) => return Err(failure.into()),
        };

        debug!(stats = ?state.stats, "merge finished");
        Ok(MergeOutcome {
            root,
            deferred: state.deferred,
            adopted: state.adopted,
            stats: state.stats,
        })
    }

    /// Copies a remote block and everything below it into the local store,
    /// children first. Returns it with a holder reference.
    fn adopt<'s>(
        &'s self,
        id: BlockId,
        state: &'s mut MergeState,
    ) -> BoxFuture<'s, Result<BlockId, Failure>> {
        async move {
            let store = self.store();
            if store.contains(&id).await? {
                store.addref(&id).await?;
                return Ok(id);
            }

            let plaintext = self.remote.get(&id).await.map_err(remote)?;
            let children = NodeReferences.references(&plaintext).map_err(remote)?;

            let mut holders = Vec::with_capacity(children.len());
            let mut adopted = Ok(());
            for child in children {
                match self.adopt(child, state).await {
                    Ok(holder) => holders.push(holder),
                    Err(failure) => {
                        adopted = Err(failure);
                        break;
                    }
                }
            }
            let put = match adopted {
                Ok(()) => store.put(plaintext).await.map_err(Failure::from),
                Err(failure) => Err(failure),
            };
            for holder in &holders {
                store.decref(holder).await?;
            }

            let new = put?;
            if new != id {
                store.decref(&new).await?;
                return Err(Failure::Remote(Error::Integrity(format!(
                    "remote block {} hashes to {}",
                    id, new
                ))));
            }
            state.adopted.push(id);
            Ok(id)
        }
        .boxed()
    }

    async fn local_effective_mtime(&self, entry: &DirEntry) -> Result<u64, Failure> {
        Ok(match &entry.target {
            EntryTarget::Directory(id) => {
                let header = self.dirs().header(id).await?.unwrap_or_default();
                entry.meta.mtime.max(header.last_modified)
            }
            _ => entry.meta.mtime,
        })
    }

    async fn remote_effective_mtime(&self, entry: &DirEntry) -> Result<u64, Failure> {
        Ok(match &entry.target {
            EntryTarget::Directory(id) => {
                let header = self
                    .remote_dirs
                    .header(id)
                    .await
                    .map_err(remote)?
                    .unwrap_or_default();
                entry.meta.mtime.max(header.last_modified)
            }
            _ => entry.meta.mtime,
        })
    }

    async fn take_remote(
        &self,
        raw: &Bytes,
        entry: &DirEntry,
        state: &mut MergeState,
    ) -> Result<Resolution, Failure> {
        let holder = match entry.block() {
            Some(id) => Some(self.adopt(id, state).await?),
            None => None,
        };
        state.stats.taken_remote += 1;
        Ok(Resolution::Put(raw.clone(), holder))
    }

    fn resolve<'s>(
        &'s self,
        entries: KeyEntries<'s>,
        dirs: DirPair,
        path: &'s [PathComponent],
        state: &'s mut MergeState,
    ) -> BoxFuture<'s, Result<Resolution, Failure>> {
        async move {
            let decode_local =
                |raw: &Bytes| DirectoryTree::decode_value(raw).map_err(Failure::Local);
            let decode_remote = |raw: &Bytes| DirectoryTree::decode_value(raw).map_err(remote);

            match (entries.local, entries.remote) {
                (None, None) => Ok(Resolution::Keep),

                (Some(local_raw), Some(remote_raw)) => {
                    if local_raw == remote_raw {
                        return Ok(Resolution::Keep);
                    }
                    let local = decode_local(local_raw)?;
                    let remote = decode_remote(remote_raw)?;

                    if let (EntryTarget::Directory(local_dir), EntryTarget::Directory(remote_dir)) =
                        (&local.target, &remote.target)
                    {
                        let base_dir = match entries.base.map(decode_local).transpose()? {
                            Some(DirEntry {
                                target: EntryTarget::Directory(id),
                                ..
                            }) => Some(id),
                            _ => None,
                        };
                        let mut child_path = path.to_vec();
                        child_path.push(DirectoryTree::decode_key(entries.key)?);

                        let merged = self
                            .merge_dir(*local_dir, *remote_dir, base_dir, child_path, state)
                            .await?;
                        let remote_newer =
                            (remote.meta.mtime, remote_raw) > (local.meta.mtime, local_raw);
                        let meta = if remote_newer { remote.meta } else { local.meta };
                        let raw = DirectoryTree::encode_value(&DirEntry {
                            target: EntryTarget::Directory(merged),
                            meta,
                        });
                        if raw == *local_raw {
                            self.store().decref(&merged).await?;
                            return Ok(Resolution::Keep);
                        }
                        state.stats.merged_dirs += 1;
                        return Ok(Resolution::Put(raw, Some(merged)));
                    }

                    if let Some(base_raw) = entries.base {
                        if base_raw == local_raw {
                            return self.take_remote(remote_raw, &remote, state).await;
                        }
                        if base_raw == remote_raw {
                            return Ok(Resolution::Keep);
                        }
                    }

                    let local_mtime = self.local_effective_mtime(&local).await?;
                    let remote_mtime = self.remote_effective_mtime(&remote).await?;
                    if (remote_mtime, remote_raw) > (local_mtime, local_raw) {
                        self.take_remote(remote_raw, &remote, state).await
                    } else {
                        state.stats.kept_local += 1;
                        Ok(Resolution::Keep)
                    }
                }

                (Some(local_raw), None) => {
                    if dirs.has_base {
                        match entries.base {
                            // added locally since the base
                            None => return Ok(Resolution::Keep),
                            Some(base) if base == local_raw => {
                                state.stats.deleted += 1;
                                return Ok(Resolution::Delete);
                            }
                            Some(_) => {}
                        }
                    }
                    let local = decode_local(local_raw)?;
                    if self.local_effective_mtime(&local).await? > dirs.remote_last_delete {
                        Ok(Resolution::Keep)
                    } else {
                        state.stats.deleted += 1;
                        Ok(Resolution::Delete)
                    }
                }

                (None, Some(remote_raw)) => {
                    if dirs.has_base {
                        match entries.base {
                            None => {
                                let remote = decode_remote(remote_raw)?;
                                return self.take_remote(remote_raw, &remote, state).await;
                            }
                            Some(base) if base == remote_raw => return Ok(Resolution::Keep),
                            Some(_) => {}
                        }
                    }
                    let remote = decode_remote(remote_raw)?;
                    if self.remote_effective_mtime(&remote).await? > dirs.local_last_delete {
                        self.take_remote(remote_raw, &remote, state).await
                    } else {
                        Ok(Resolution::Keep)
                    }
                }
            }
        }
        .boxed()
    }

    async fn release_resolutions(&self, resolutions: &[(Bytes, Resolution)]) {
        for (_, resolution) in resolutions {
            if let Resolution::Put(_, Some(holder)) = resolution {
                if let Err(e) = self.store().decref(holder).await {
                    warn!(block.id = %holder, err = %e, "failed to release merge holder");
                }
            }
        }
    }

    /// Resolves every key of the two directories.
    async fn resolve_all(
        &self,
        local: &[(Bytes, Bytes)],
        remote: &[(Bytes, Bytes)],
        base: Option<&HashMap<Bytes, Bytes>>,
        dirs: DirPair,
        path: &[PathComponent],
        state: &mut MergeState,
        resolutions: &mut Vec<(Bytes, Resolution)>,
    ) -> Result<(), Failure> {
        let (mut i, mut j) = (0, 0);
        while i < local.len() || j < remote.len() {
            let order = match (local.get(i), remote.get(j)) {
                (Some((l, _)), Some((r, _))) => l.cmp(r),
                (Some(_), None) => Ordering::Less,
                _ => Ordering::Greater,
            };
            let (key, local_raw, remote_raw) = match order {
                Ordering::Less => {
                    i += 1;
                    (&local[i - 1].0, Some(&local[i - 1].1), None)
                }
                Ordering::Greater => {
                    j += 1;
                    (&remote[j - 1].0, None, Some(&remote[j - 1].1))
                }
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                    (&local[i - 1].0, Some(&local[i - 1].1), Some(&remote[j - 1].1))
                }
            };

            let entries = KeyEntries {
                key,
                local: local_raw,
                remote: remote_raw,
                base: base.and_then(|base| base.get(key)),
            };
            let resolution = match self.resolve(entries, dirs, path, state).await {
                Ok(resolution) => resolution,
                Err(failure) if deferrable(&failure) => {
                    let deferred = display_path(path, key);
                    warn!(
                        path = %deferred,
                        err = %Error::from(failure),
                        "deferring entry the remote store cannot provide"
                    );
                    state.deferred.push(deferred);
                    Resolution::Keep
                }
                Err(failure) => return Err(failure),
            };
            resolutions.push((key.clone(), resolution));
        }
        Ok(())
    }

    fn merge_dir<'s>(
        &'s self,
        local: BlockId,
        remote_dir: BlockId,
        base: Option<BlockId>,
        path: Vec<PathComponent>,
        state: &'s mut MergeState,
    ) -> BoxFuture<'s, Result<BlockId, Failure>> {
        async move {
            let store = self.store();
            if local == remote_dir {
                store.addref(&local).await?;
                return Ok(local);
            }

            let remote_header = self
                .remote_dirs
                .header(&remote_dir)
                .await
                .map_err(remote)?
                .unwrap_or_default();
            let remote_entries: Vec<(Bytes, Bytes)> = self
                .remote_dirs
                .range_raw(&remote_dir, None)
                .try_collect()
                .await
                .map_err(remote)?;

            let local_header = self.dirs().header(&local).await?.unwrap_or_default();
            let local_entries: Vec<(Bytes, Bytes)> =
                self.dirs().range_raw(&local, None).try_collect().await?;
            let base_entries: Option<HashMap<Bytes, Bytes>> = match &base {
                Some(base) => Some(self.dirs().range_raw(base, None).try_collect().await?),
                None => None,
            };

            let dirs = DirPair {
                local_last_delete: local_header.last_delete,
                remote_last_delete: remote_header.last_delete,
                has_base: base.is_some(),
            };
            let mut resolutions = Vec::new();
            let resolved = self
                .resolve_all(
                    &local_entries,
                    &remote_entries,
                    base_entries.as_ref(),
                    dirs,
                    &path,
                    state,
                    &mut resolutions,
                )
                .await;
            if let Err(failure) = resolved {
                self.release_resolutions(&resolutions).await;
                return Err(failure);
            }

            let mut current = local;
            store.addref(&current).await?;
            let mut pending = resolutions.into_iter();
            let applied: Result<(), Failure> = async {
                for (key, resolution) in pending.by_ref() {
                    let next = match resolution {
                        Resolution::Keep => continue,
                        Resolution::Put(raw, holder) => {
                            let inserted = self
                                .dirs()
                                .insert_raw(&current, key, raw, HeaderUpdate::Keep)
                                .await;
                            if let Some(holder) = holder {
                                store.decref(&holder).await?;
                            }
                            Some(inserted?)
                        }
                        Resolution::Delete => {
                            self.dirs()
                                .delete_raw(&current, &key, HeaderUpdate::Keep)
                                .await?
                        }
                    };
                    if let Some(next) = next {
                        store.decref(&current).await?;
                        current = next;
                    }
                }

                let header = local_header.max(&remote_header);
                if self.dirs().header(&current).await? != Some(header) {
                    let next = self.dirs().set_header(&current, header).await?;
                    store.decref(&current).await?;
                    current = next;
                }
                Ok(())
            }
            .await;

            if let Err(failure) = applied {
                let rest: Vec<_> = pending.collect();
                self.release_resolutions(&rest).await;
                store.decref(&current).await?;
                return Err(failure);
            }
            Ok(current)
        }
        .boxed()
    }
}
