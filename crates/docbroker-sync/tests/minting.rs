mod common;

use std::collections::HashSet;

use common::*;
use docbroker_core::{IdentityStore, ObjectIdentifiers, SequenceCounter};
use serde_json::Map;

#[tokio::test]
async fn test_mint_from_repository_triple() {
    let harness = Harness::with_sequence(100);
    let doc = harness
        .repository
        .add_document(DRIVE, "a.docx", b"a", Map::new())
        .unwrap();

    let object_id = harness
        .ctx
        .minter
        .mint(&ObjectIdentifiers::from_repository(SITE, LIST, &doc.list_item_id))
        .await
        .unwrap();
    assert_eq!(object_id, "ZLD2024-101");

    let record = harness
        .identities
        .get_by_object_id("ZLD2024-101")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.drive_id, DRIVE);
    assert_eq!(record.drive_item_id, doc.drive_item_id);
    assert_eq!(record.external_reference_list_id, "refs-1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mints_for_distinct_documents_are_unique() {
    let harness = Harness::new();
    let docs: Vec<_> = (0..20)
        .map(|i| {
            harness
                .repository
                .add_document(DRIVE, &format!("{}.docx", i), b"x", Map::new())
                .unwrap()
        })
        .collect();

    let handles: Vec<_> = docs
        .into_iter()
        .map(|doc| {
            let minter = harness.ctx.minter.clone();
            tokio::spawn(async move { minter.mint(&doc).await })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().unwrap());
    }
    assert_eq!(ids.len(), 20);
    assert_eq!(harness.counter.current().await.unwrap(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mints_for_one_document_converge() {
    let harness = Harness::new();
    let doc = harness
        .repository
        .add_document(DRIVE, "a.docx", b"a", Map::new())
        .unwrap();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let minter = harness.ctx.minter.clone();
            // Half the callers only know the storage pair.
            let partial = if i % 2 == 0 {
                ObjectIdentifiers::from_repository(SITE, LIST, &doc.list_item_id)
            } else {
                ObjectIdentifiers::from_storage(DRIVE, &doc.drive_item_id)
            };
            tokio::spawn(async move { minter.mint(&partial).await })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().unwrap());
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(harness.counter.current().await.unwrap(), 1);
    assert_eq!(harness.identities.len(), 1);
}

#[tokio::test]
async fn test_sequence_is_monotonic() {
    let harness = Harness::new();
    let mut previous = 0;
    for i in 0..5 {
        let doc = harness
            .repository
            .add_document(DRIVE, &format!("{}.docx", i), b"x", Map::new())
            .unwrap();
        let object_id = harness.ctx.minter.mint(&doc).await.unwrap();
        let sequence: u64 = object_id
            .rsplit_once('-')
            .and_then(|(_, n)| n.parse().ok())
            .unwrap();
        assert!(sequence > previous);
        previous = sequence;
    }
}

#[tokio::test]
async fn test_remint_augments_without_overwriting() {
    let harness = Harness::new();
    let doc = harness
        .repository
        .add_document(DRIVE, "a.docx", b"a", Map::new())
        .unwrap();
    harness
        .identities
        .upsert(&ObjectIdentifiers {
            object_id: "ZLD2020-9".into(),
            external_reference_list_id: "legacy-refs".into(),
            ..ObjectIdentifiers::from_repository(SITE, LIST, &doc.list_item_id)
        })
        .await
        .unwrap();

    let record = harness.ctx.minter.mint_record(&doc).await.unwrap();
    assert_eq!(record.object_id, "ZLD2020-9");
    assert_eq!(record.drive_item_id, doc.drive_item_id);
    assert_eq!(record.external_reference_list_id, "legacy-refs");
    assert_eq!(harness.counter.current().await.unwrap(), 0);

    let by_storage = harness
        .identities
        .get_by_storage_key(&doc.storage_key().unwrap())
        .await
        .unwrap();
    assert_eq!(by_storage.map(|r| r.object_id), Some("ZLD2020-9".to_string()));
}

#[tokio::test]
async fn test_resolver_is_idempotent() {
    let harness = Harness::new();
    let doc = harness
        .repository
        .add_document(DRIVE, "a.docx", b"a", Map::new())
        .unwrap();
    let partial = ObjectIdentifiers::from_repository(SITE, LIST, &doc.list_item_id);

    let once = harness.ctx.resolver.resolve(&partial).await.unwrap();
    let twice = harness.ctx.resolver.resolve(&partial).await.unwrap();
    let again = harness.ctx.resolver.resolve(&once).await.unwrap();
    assert_eq!(once, twice);
    assert_eq!(once, again);
}
