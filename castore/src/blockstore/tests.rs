use bytes::{BufMut, Bytes, BytesMut};
use futures::TryStreamExt;
use rstest::rstest;
use std::sync::Arc;

use super::{BlockStore, ReferenceExtractor, StoreOptions};
use crate::blockservice::{BlockService, MemoryBlockService};
use crate::fixtures::{BLOCK_A, BLOCK_B, BLOCK_C, ENCRYPTED_CODEC, PLAIN_CODEC};
use crate::{BlockId, Error};

/// Blocks starting with `P` are followed by the ids they point at.
struct PrefixReferences;

impl ReferenceExtractor for PrefixReferences {
    fn references(&self, plaintext: &[u8]) -> Result<Vec<BlockId>, Error> {
        match plaintext.split_first() {
            Some((b'P', ids)) => ids
                .chunks(32)
                .map(|c| BlockId::try_from(c).map_err(Error::from))
                .collect(),
            _ => Ok(Vec::new()),
        }
    }
}

fn parent_of(children: &[BlockId]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'P');
    for child in children {
        buf.put_slice(child.as_slice());
    }
    buf.freeze()
}

fn store(shared: bool) -> (BlockStore, MemoryBlockService) {
    let service = MemoryBlockService::default();
    let options = StoreOptions {
        shared,
        ..Default::default()
    };
    let store = BlockStore::new(Arc::new(service.clone()), PLAIN_CODEC.clone(), &options);
    store.set_reference_extractor(Arc::new(PrefixReferences));
    (store, service)
}

async fn stored_count(service: &MemoryBlockService) -> usize {
    service.list().try_collect::<Vec<_>>().await.unwrap().len()
}

#[tokio::test]
async fn dedup() {
    let (store, service) = store(false);

    let first = store.put(BLOCK_A.clone()).await.unwrap();
    let second = store.put(BLOCK_A.clone()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(Some(2), store.refcount(&first).await.unwrap());
    assert_eq!(1, stored_count(&service).await);
    assert_eq!(BLOCK_A.clone(), store.get(&first).await.unwrap());
}

#[rstest]
#[case::exclusive(false)]
#[case::shared(true)]
#[tokio::test]
async fn refcount_zero_reclaimed(#[case] shared: bool) {
    let (store, service) = store(shared);

    let mut id = None;
    for _ in 0..3 {
        id = Some(store.put(BLOCK_B.clone()).await.unwrap());
    }
    let id = id.unwrap();

    assert!(!store.decref(&id).await.unwrap());
    assert!(!store.decref(&id).await.unwrap());
    assert!(store.decref(&id).await.unwrap());

    assert!(matches!(store.get(&id).await, Err(Error::NotFound(_))));
    assert!(!store.contains(&id).await.unwrap());

    if shared {
        // still there, but invisible until collected
        assert_eq!(Some(0), store.refcount(&id).await.unwrap());
        assert!(matches!(
            store.decref(&id).await,
            Err(Error::RefcountUnderflow(_))
        ));
        assert_eq!(1, store.gc().await.unwrap().deleted);
    }

    assert_eq!(0, stored_count(&service).await);
    assert!(matches!(store.decref(&id).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn shared_mode_revives() {
    let (store, _service) = store(true);

    let id = store.put(BLOCK_A.clone()).await.unwrap();
    assert!(store.decref(&id).await.unwrap());
    assert_eq!(id, store.put(BLOCK_A.clone()).await.unwrap());

    assert_eq!(Some(1), store.refcount(&id).await.unwrap());
    assert_eq!(0, store.gc().await.unwrap().deleted);
    assert_eq!(BLOCK_A.clone(), store.get(&id).await.unwrap());
}

#[rstest]
#[case::exclusive(false)]
#[case::shared(true)]
#[tokio::test]
async fn cascade(#[case] shared: bool) {
    let (store, service) = store(shared);

    let a = store.put(BLOCK_A.clone()).await.unwrap();
    let b = store.put(BLOCK_B.clone()).await.unwrap();
    let parent = store.put(parent_of(&[a, b])).await.unwrap();
    assert_eq!(Some(2), store.refcount(&a).await.unwrap());

    // drop the holders, only the parent keeps them alive
    store.decref(&a).await.unwrap();
    store.decref(&b).await.unwrap();
    assert_eq!(BLOCK_A.clone(), store.get(&a).await.unwrap());

    // storing the same parent again only references the parent
    let again = store.put(parent_of(&[a, b])).await.unwrap();
    assert_eq!(parent, again);
    assert_eq!(Some(1), store.refcount(&a).await.unwrap());

    store.decref(&parent).await.unwrap();
    store.decref(&parent).await.unwrap();
    if shared {
        assert_eq!(3, store.gc().await.unwrap().deleted);
    }

    assert_eq!(0, stored_count(&service).await);
}

#[tokio::test]
async fn roots() {
    let (store, _service) = store(false);

    assert!(matches!(
        store.resolve_root("content").await,
        Err(Error::NotFound(_))
    ));

    let a = store.put(BLOCK_A.clone()).await.unwrap();
    store.bind_root("content", &a).await.unwrap();
    store.decref(&a).await.unwrap();
    assert_eq!(a, store.resolve_root("content").await.unwrap());
    assert_eq!(Some(1), store.refcount(&a).await.unwrap());

    // binding the same target twice does not take another reference
    store.bind_root("content", &a).await.unwrap();
    assert_eq!(Some(1), store.refcount(&a).await.unwrap());

    let b = store.put(BLOCK_B.clone()).await.unwrap();
    store.bind_root("content", &b).await.unwrap();
    store.decref(&b).await.unwrap();
    assert!(!store.contains(&a).await.unwrap());
    assert_eq!(b, store.resolve_root("content").await.unwrap());

    assert!(store.unbind_root("content").await.unwrap());
    assert!(!store.unbind_root("content").await.unwrap());
    assert!(!store.contains(&b).await.unwrap());
}

#[tokio::test]
async fn put_many_in_order() {
    let (store, _service) = store(false);

    let blocks = vec![BLOCK_A.clone(), BLOCK_B.clone(), BLOCK_C.clone(), BLOCK_A.clone()];
    let ids = store.put_many(blocks.clone()).await.unwrap();

    assert_eq!(4, ids.len());
    for (id, block) in ids.iter().zip(blocks.iter()) {
        assert_eq!(PLAIN_CODEC.id_for(block), *id);
    }
    assert_eq!(Some(2), store.refcount(&ids[0]).await.unwrap());
}

#[tokio::test]
async fn concurrent_refcounting() {
    let (store, _service) = store(false);
    let id = store.put(BLOCK_C.clone()).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..32 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                store.put(BLOCK_C.clone()).await.map(|_| ())
            } else {
                store.addref(&id).await
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(Some(33), store.refcount(&id).await.unwrap());

    let mut tasks = Vec::new();
    for _ in 0..33 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move { store.decref(&id).await }));
    }
    let mut freed = 0;
    for task in tasks {
        if task.await.unwrap().unwrap() {
            freed += 1;
        }
    }
    assert_eq!(1, freed);
    assert!(!store.contains(&id).await.unwrap());
}

#[tokio::test]
async fn rebuild_refcounts() {
    let (store, service) = store(false);

    let a = store.put(BLOCK_A.clone()).await.unwrap();
    let parent = store.put(parent_of(&[a, a])).await.unwrap();
    store.bind_root("content", &parent).await.unwrap();
    store.bind_root("snapshot", &a).await.unwrap();
    store.decref(&parent).await.unwrap();
    store.decref(&a).await.unwrap();

    // an unreachable block and some damage
    let orphan = store.put(BLOCK_C.clone()).await.unwrap();
    service.set_refcount(&a, 17).await.unwrap();
    service.set_refcount(&parent, 0).await.unwrap();

    let report = store.rebuild_refcounts().await.unwrap();
    assert_eq!(2, report.reachable);
    assert_eq!(2, report.rewritten);
    assert_eq!(1, report.deleted);
    assert!(report.unreadable.is_empty());

    // two edges from the parent, one label
    assert_eq!(Some(3), store.refcount(&a).await.unwrap());
    assert_eq!(Some(1), store.refcount(&parent).await.unwrap());
    assert_eq!(None, store.refcount(&orphan).await.unwrap());
}

#[tokio::test]
async fn tampering_surfaces_as_integrity_error() {
    let service = MemoryBlockService::default();
    let store = BlockStore::new(
        Arc::new(service.clone()),
        ENCRYPTED_CODEC.clone(),
        &StoreOptions {
            cache_size: 0,
            ..Default::default()
        },
    );

    let id = store.put(BLOCK_C.clone()).await.unwrap();
    let stored = service.get(&id).await.unwrap().unwrap();
    let mut data = stored.data.to_vec();
    let last = data.len() - 1;
    data[last] ^= 1;
    service.insert(&id, data.into(), 1).await.unwrap();

    assert!(matches!(store.get(&id).await, Err(Error::Integrity(_))));

    let report = store.verify().await.unwrap();
    assert_eq!(1, report.checked);
    assert_eq!(1, report.failures.len());
    assert!(!report.is_clean());
}

#[tokio::test]
async fn verify_dangling_root() {
    let (store, service) = store(false);
    service
        .set_root("content", Some(&PLAIN_CODEC.id_for(b"nothing")))
        .await
        .unwrap();

    let report = store.verify().await.unwrap();
    assert_eq!(vec!["content".to_string()], report.dangling_roots);
}
