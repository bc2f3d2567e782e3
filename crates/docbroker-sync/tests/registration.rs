mod common;

use common::*;
use docbroker_core::{BrokerError, CallbackEvent, FeedType, IdentityStore};
use serde_json::json;

#[tokio::test]
async fn test_register_creates_and_mints() {
    let harness = Harness::with_sequence(41);
    let record = harness
        .registrar()
        .register(SITE, LIST, "new.docx", b"hello", &fields(&[("Title", json!("New"))]))
        .await
        .unwrap();

    assert_eq!(record.object_id, "ZLD2024-42");
    assert!(record.has_repository_triple());
    assert!(record.has_storage_pair());
    assert_eq!(
        harness
            .identities
            .get_by_object_id("ZLD2024-42")
            .await
            .unwrap(),
        Some(record)
    );
}

#[tokio::test]
async fn test_failed_mint_rolls_back_upload() {
    let harness = Harness::new();
    harness.counter.fail(true);

    let err = harness
        .registrar()
        .register(SITE, LIST, "new.docx", b"hello", &fields(&[]))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Conflict(_)));
    assert!(harness.repository.is_deleted("1"));
    assert!(harness.identities.is_empty());
}

#[tokio::test]
async fn test_register_into_unknown_library_fails() {
    let harness = Harness::new();
    let err = harness
        .registrar()
        .register(SITE, "no-such-list", "new.docx", b"x", &fields(&[]))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_removes_object_everywhere() {
    let harness = Harness::new();
    harness
        .repository
        .add_document(DRIVE, "a.docx", b"a", fields(&[("Title", json!("A"))]))
        .unwrap();
    harness.engine().run(FeedType::New).await.unwrap();
    assert_eq!(harness.content.names("documents").len(), 1);

    harness.registrar().delete("ZLD2024-1").await.unwrap();

    assert!(harness.repository.is_deleted("1"));
    assert!(harness.content.names("documents").is_empty());
    assert!(harness.content.names("metadata").is_empty());
    assert!(harness.identities.is_empty());
    assert_eq!(
        harness.callbacks.events().last(),
        Some(&CallbackEvent::Delete {
            object_id: "ZLD2024-1".into()
        })
    );

    let err = harness.registrar().delete("ZLD2024-1").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}
