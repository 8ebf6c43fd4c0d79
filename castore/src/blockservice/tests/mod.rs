//! This contains test scenarios that a given [BlockService] needs to pass.
//! We use [rstest] and [rstest_reuse] to provide all services we want to test
//! against, and then apply this template to all test functions.

use futures::TryStreamExt;
use rstest::*;
use rstest_reuse::{self, *};
use std::sync::Arc;

use super::{BlockService, SimpleFsBlockService};
use crate::blockservice;
use crate::fixtures::{BLOCK_A, BLOCK_A_ID, BLOCK_B, BLOCK_B_ID};
use crate::Error;

async fn make_simplefs_block_service() -> Arc<dyn BlockService> {
    let dir = tempfile::TempDir::new().unwrap().into_path();
    Arc::new(SimpleFsBlockService::new(dir).await.unwrap())
}

/// This produces a template, which will be applied to all individual test functions.
/// See https://github.com/la10736/rstest/issues/130#issuecomment-968864832
#[template]
#[rstest]
#[case::memory(blockservice::from_addr("memory://").await.unwrap().0)]
#[case::sled(blockservice::from_addr("sled://").await.unwrap().0)]
#[case::redb(blockservice::from_addr("redb://").await.unwrap().0)]
#[case::simplefs(make_simplefs_block_service().await)]
pub fn block_services(#[case] block_service: impl BlockService) {}

/// Looking up a non-existing block yields None, not an error.
#[apply(block_services)]
#[tokio::test]
async fn nonexistent(block_service: impl BlockService) {
    assert!(block_service.get(&BLOCK_A_ID).await.unwrap().is_none());
    assert!(block_service.refcount(&BLOCK_A_ID).await.unwrap().is_none());
    assert!(!block_service.contains(&BLOCK_A_ID).await.unwrap());
    assert!(!block_service.delete(&BLOCK_A_ID).await.unwrap());
}

/// Insert a block, read it back.
#[apply(block_services)]
#[tokio::test]
async fn insert_get(block_service: impl BlockService) {
    block_service
        .insert(&BLOCK_A_ID, BLOCK_A.clone(), 1)
        .await
        .expect("must succeed");

    let stored = block_service
        .get(&BLOCK_A_ID)
        .await
        .unwrap()
        .expect("must be some");
    assert_eq!(BLOCK_A.clone(), stored.data);
    assert_eq!(1, stored.refcount);
    assert!(block_service.contains(&BLOCK_A_ID).await.unwrap());
}

/// Refcounts can be updated independently of the data, but only for
/// existing blocks.
#[apply(block_services)]
#[tokio::test]
async fn set_refcount(block_service: impl BlockService) {
    assert!(matches!(
        block_service.set_refcount(&BLOCK_B_ID, 3).await,
        Err(Error::NotFound(_))
    ));

    block_service
        .insert(&BLOCK_B_ID, BLOCK_B.clone(), 1)
        .await
        .unwrap();
    block_service.set_refcount(&BLOCK_B_ID, 3).await.unwrap();
    assert_eq!(Some(3), block_service.refcount(&BLOCK_B_ID).await.unwrap());

    // a zero refcount keeps the block around
    block_service.set_refcount(&BLOCK_B_ID, 0).await.unwrap();
    assert_eq!(Some(0), block_service.refcount(&BLOCK_B_ID).await.unwrap());
    assert_eq!(
        BLOCK_B.clone(),
        block_service.get(&BLOCK_B_ID).await.unwrap().unwrap().data
    );
}

#[apply(block_services)]
#[tokio::test]
async fn delete(block_service: impl BlockService) {
    block_service
        .insert(&BLOCK_A_ID, BLOCK_A.clone(), 2)
        .await
        .unwrap();

    assert!(block_service.delete(&BLOCK_A_ID).await.unwrap());
    assert!(!block_service.delete(&BLOCK_A_ID).await.unwrap());
    assert!(block_service.get(&BLOCK_A_ID).await.unwrap().is_none());
    assert!(block_service.refcount(&BLOCK_A_ID).await.unwrap().is_none());
}

#[apply(block_services)]
#[tokio::test]
async fn list(block_service: impl BlockService) {
    block_service
        .insert(&BLOCK_A_ID, BLOCK_A.clone(), 1)
        .await
        .unwrap();
    block_service
        .insert(&BLOCK_B_ID, BLOCK_B.clone(), 5)
        .await
        .unwrap();

    let mut listed: Vec<_> = block_service.list().try_collect().await.unwrap();
    listed.sort();

    let mut expected = vec![(*BLOCK_A_ID, 1), (*BLOCK_B_ID, 5)];
    expected.sort();
    assert_eq!(expected, listed);
}

/// Labels are replaced atomically and can be removed again.
#[apply(block_services)]
#[tokio::test]
async fn roots(block_service: impl BlockService) {
    assert!(block_service.get_root("content").await.unwrap().is_none());

    block_service
        .set_root("content", Some(&BLOCK_A_ID))
        .await
        .unwrap();
    block_service
        .set_root("snap/2024-01-01", Some(&BLOCK_A_ID))
        .await
        .unwrap();
    block_service
        .set_root("content", Some(&BLOCK_B_ID))
        .await
        .unwrap();

    assert_eq!(
        Some(*BLOCK_B_ID),
        block_service.get_root("content").await.unwrap()
    );
    assert_eq!(
        vec![
            ("content".to_string(), *BLOCK_B_ID),
            ("snap/2024-01-01".to_string(), *BLOCK_A_ID),
        ],
        block_service.list_roots().await.unwrap()
    );

    block_service.set_root("content", None).await.unwrap();
    assert!(block_service.get_root("content").await.unwrap().is_none());
    // removing twice is fine
    block_service.set_root("content", None).await.unwrap();
    block_service.flush().await.unwrap();
}
