use bytes::Bytes;
use futures::TryStreamExt;
use std::sync::Arc;

use crate::blockservice::{BlockService, MemoryBlockService};
use crate::blockstore::{BlockStore, StoreOptions};
use crate::fixtures::{ENCRYPTED_CODEC, PLAIN_CODEC};
use crate::forest::{EntryTarget, Forest, ForestOptions, ManualClock};
use crate::transform::BlockCodec;
use crate::Error;

use super::Synchronizer;

struct Replica {
    forest: Forest,
    clock: Arc<ManualClock>,
    service: MemoryBlockService,
}

impl Replica {
    async fn new() -> Self {
        Self::with_codec(ENCRYPTED_CODEC.clone()).await
    }

    async fn with_codec(codec: BlockCodec) -> Self {
        let service = MemoryBlockService::default();
        // no cache, so tampering with the service is visible
        let options = StoreOptions {
            cache_size: 0,
            ..Default::default()
        };
        let store = BlockStore::new(Arc::new(service.clone()), codec, &options);
        let clock = Arc::new(ManualClock::new(1));
        let forest = Forest::with_clock(store, ForestOptions::default(), clock.clone())
            .await
            .unwrap();
        Self {
            forest,
            clock,
            service,
        }
    }

    fn at(&self, now: u64) -> &Forest {
        self.clock.set(now);
        &self.forest
    }

    /// Merges the current content of `other` into this replica.
    async fn pull(&self, other: &Replica, peer: &str) -> super::MergeOutcome {
        let remote_root = other.forest.root().await.unwrap();
        self.forest
            .sync_from(other.forest.store(), &remote_root, peer)
            .await
            .unwrap()
    }

    async fn names(&self, path: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .forest
            .readdir(path)
            .await
            .unwrap()
            .map_ok(|(name, _)| name.to_string())
            .try_collect()
            .await
            .unwrap();
        names.sort();
        names
    }
}

#[tokio::test]
async fn different_keys_are_rejected() {
    let local = Replica::new().await;
    let other = Replica::with_codec(PLAIN_CODEC.clone()).await;

    assert!(matches!(
        Synchronizer::new(&local.forest, other.forest.store()),
        Err(Error::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn pull_into_empty_replica() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    a.at(10).mkdir("/docs", None).await.unwrap();
    a.at(11)
        .write_file("/docs/big", &vec![7u8; 300_000], None)
        .await
        .unwrap();
    a.at(12).create_symlink("/link", "docs/big", None).await.unwrap();

    let outcome = b.pull(&a, "a").await;

    assert!(outcome.deferred.is_empty());
    assert!(!outcome.adopted.is_empty());
    assert_eq!(a.forest.root().await.unwrap(), b.forest.root().await.unwrap());
    assert_eq!(
        Bytes::from(vec![7u8; 300_000]),
        b.forest.read_file("/docs/big").await.unwrap()
    );
    assert_eq!(
        Bytes::from_static(b"docs/big"),
        b.forest.read_link("/link").await.unwrap()
    );
    for id in &outcome.adopted {
        assert_eq!(1, b.forest.remote_block_usage(id).await.unwrap());
    }

    // pulling again changes nothing
    let again = b.pull(&a, "a").await;
    assert_eq!(outcome.root, again.root);
    assert!(again.adopted.is_empty());
}

#[tokio::test]
async fn disjoint_adds_merge_in_either_order() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    a.at(10).write_file("/x", b"from a", None).await.unwrap();
    b.at(20).write_file("/y", b"from b", None).await.unwrap();

    let a_root = a.forest.root().await.unwrap();
    let b_root = b.forest.root().await.unwrap();

    let into_a = a.pull(&b, "b").await;
    let into_b = b.pull(&a, "a").await;
    assert_ne!(a_root, into_a.root);
    assert_ne!(b_root, into_b.root);

    for replica in [&a, &b] {
        assert_eq!(vec!["x", "y"], replica.names("/").await);
        assert_eq!(
            Bytes::from_static(b"from a"),
            replica.forest.read_file("/x").await.unwrap()
        );
        assert_eq!(
            Bytes::from_static(b"from b"),
            replica.forest.read_file("/y").await.unwrap()
        );
    }
    assert_eq!(into_a.root, into_b.root);
}

/// Both replicas start with `/d/a`, then the remote deletes `/d` at
/// `delete_at` while the local replica rewrites `/d/a` at 100.
async fn update_against_remote_delete(delete_at: u64) -> Replica {
    let local = Replica::new().await;
    let remote = Replica::new().await;
    local.at(10).mkdir("/d", None).await.unwrap();
    local.at(10).write_file("/d/a", b"v1", None).await.unwrap();
    remote.pull(&local, "local").await;

    remote.at(delete_at).remove("/d").await.unwrap();
    local.at(100).write_file("/d/a", b"v2", None).await.unwrap();

    local.at(200);
    local.pull(&remote, "remote").await;
    local
}

#[tokio::test]
async fn newer_update_survives_older_delete() {
    let local = update_against_remote_delete(50).await;
    assert_eq!(
        Bytes::from_static(b"v2"),
        local.forest.read_file("/d/a").await.unwrap()
    );
}

#[tokio::test]
async fn newer_delete_wins_over_older_update() {
    let local = update_against_remote_delete(150).await;
    assert!(matches!(
        local.forest.stat("/d/a").await,
        Err(Error::NotFound(_))
    ));
    assert!(local.names("/").await.is_empty());
}

#[tokio::test]
async fn remote_add_older_than_local_delete_stays_deleted() {
    let local = Replica::new().await;
    let remote = Replica::new().await;
    remote.at(10).write_file("/old", b"x", None).await.unwrap();
    local.at(5).write_file("/gone", b"y", None).await.unwrap();
    local.at(20).remove("/gone").await.unwrap();

    local.pull(&remote, "remote").await;
    assert!(local.names("/").await.is_empty());
}

#[tokio::test]
async fn base_turns_older_timestamps_into_deletes() {
    let local = Replica::new().await;
    let remote = Replica::new().await;
    local.at(100).write_file("/f", b"data", None).await.unwrap();
    remote.pull(&local, "local").await;
    local.pull(&remote, "remote").await;
    assert_eq!(
        local.forest.root().await.unwrap(),
        local.forest.sync_base("remote").await.unwrap().unwrap()
    );

    // the remote clock runs behind
    remote.at(50).remove("/f").await.unwrap();

    // without a base the file would come back, its mtime is newer than the
    // remote delete
    let fresh = Replica::new().await;
    fresh.pull(&local, "local").await;
    fresh.pull(&remote, "remote").await;
    assert_eq!(vec!["f"], fresh.names("/").await);

    let outcome = local.pull(&remote, "remote").await;
    assert_eq!(1, outcome.stats.deleted);
    assert!(local.names("/").await.is_empty());
}

#[tokio::test]
async fn adds_since_the_base_survive_unrelated_deletes() {
    let local = Replica::new().await;
    let remote = Replica::new().await;
    local.at(1).write_file("/z", b"z", None).await.unwrap();
    local.at(1).write_file("/w", b"w", None).await.unwrap();
    remote.pull(&local, "local").await;
    local.pull(&remote, "remote").await;

    // each side adds a file, then the other side deletes something else
    // later in the same directory
    remote.at(10).write_file("/y", b"y", None).await.unwrap();
    local.at(20).remove("/z").await.unwrap();
    local.at(25).write_file("/x", b"x", None).await.unwrap();
    remote.at(30).remove("/w").await.unwrap();

    local.at(40);
    let outcome = local.pull(&remote, "remote").await;
    assert_eq!(1, outcome.stats.taken_remote);
    assert_eq!(vec!["x", "y"], local.names("/").await);
}

#[tokio::test]
async fn equal_timestamps_break_ties_the_same_way_everywhere() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    a.at(10).write_file("/t", b"aaa", None).await.unwrap();
    b.at(10).write_file("/t", b"bbb", None).await.unwrap();

    a.pull(&b, "b").await;
    b.pull(&a, "a").await;

    let from_a = a.forest.read_file("/t").await.unwrap();
    let from_b = b.forest.read_file("/t").await.unwrap();
    assert_eq!(from_a, from_b);
}

#[tokio::test]
async fn later_write_wins() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    a.at(10).write_file("/t", b"older", None).await.unwrap();
    b.at(20).write_file("/t", b"newer", None).await.unwrap();

    let outcome = a.pull(&b, "b").await;
    assert_eq!(1, outcome.stats.taken_remote);
    assert_eq!(
        Bytes::from_static(b"newer"),
        a.forest.read_file("/t").await.unwrap()
    );

    b.pull(&a, "a").await;
    assert_eq!(
        Bytes::from_static(b"newer"),
        b.forest.read_file("/t").await.unwrap()
    );
}

#[tokio::test]
async fn nested_directories_merge_recursively() {
    let a = Replica::new().await;
    let b = Replica::new().await;
    a.at(10).mkdir("/shared", None).await.unwrap();
    b.pull(&a, "a").await;

    a.at(20).write_file("/shared/from-a", b"1", None).await.unwrap();
    b.at(30).write_file("/shared/from-b", b"2", None).await.unwrap();

    let outcome = a.pull(&b, "b").await;
    assert_eq!(1, outcome.stats.merged_dirs);
    assert_eq!(vec!["from-a", "from-b"], a.names("/shared").await);

    let header = a
        .forest
        .dirs()
        .header(&a.forest.root().await.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(30, header.last_modified);
}

#[tokio::test]
async fn corrupt_remote_subtree_is_deferred() {
    let local = Replica::new().await;
    let remote = Replica::new().await;
    local.at(5).write_file("/bad", b"local version", None).await.unwrap();
    remote.at(10).write_file("/good", b"fine", None).await.unwrap();
    remote.at(10).write_file("/bad", b"remote version", None).await.unwrap();

    let EntryTarget::File { layout, .. } = remote.forest.stat("/bad").await.unwrap().target else {
        panic!("expected a file");
    };
    let bad = layout.block().unwrap();
    let stored = remote.service.get(&bad).await.unwrap().unwrap();
    let mut tampered = stored.data.to_vec();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    remote
        .service
        .insert(&bad, tampered.into(), stored.refcount)
        .await
        .unwrap();

    let outcome = local.pull(&remote, "remote").await;

    assert_eq!(vec!["/bad".to_string()], outcome.deferred);
    assert_eq!(
        Bytes::from_static(b"fine"),
        local.forest.read_file("/good").await.unwrap()
    );
    assert_eq!(
        Bytes::from_static(b"local version"),
        local.forest.read_file("/bad").await.unwrap()
    );
}
