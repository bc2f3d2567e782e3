use std::sync::Arc;

use chrono::{DateTime, Utc};
use docbroker_core::{
    CallbackEvent, CallbackSink, ContentStore, DocumentMetadata, FieldMapping, ObjectIdentifiers,
    RepositoryClient, Result,
};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::Clock;

/// Which callback an export announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Create,
    Update,
}

/// Writes a document's content and JSON side-car to the blob store and notifies the third party.
pub struct Exporter {
    repository: Arc<dyn RepositoryClient>,
    content: Arc<dyn ContentStore>,
    callbacks: Arc<dyn CallbackSink>,
    mapping: Arc<FieldMapping>,
    content_container: String,
    metadata_container: String,
    clock: Clock,
}

impl Exporter {
    pub fn new(
        repository: Arc<dyn RepositoryClient>,
        content: Arc<dyn ContentStore>,
        callbacks: Arc<dyn CallbackSink>,
        mapping: Arc<FieldMapping>,
        content_container: impl Into<String>,
        metadata_container: impl Into<String>,
        clock: Clock,
    ) -> Self {
        Self {
            repository,
            content,
            callbacks,
            mapping,
            content_container: content_container.into(),
            metadata_container: metadata_container.into(),
            clock,
        }
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    /// Read and coerce the repository fields of a document.
    pub async fn load_metadata(&self, ids: &ObjectIdentifiers) -> Result<DocumentMetadata> {
        let raw = self.repository.get_item_fields(ids).await?;
        Ok(self.mapping.read(&raw))
    }

    /// Upload content, then side-car, then fire the create/update callback.
    #[instrument(skip(self, ids, metadata), level = "debug", fields(object_id = %ids.object_id))]
    pub async fn export(
        &self,
        ids: &ObjectIdentifiers,
        metadata: &DocumentMetadata,
        kind: ExportKind,
    ) -> Result<()> {
        let object_id = ids.object_id.as_str();
        let (file_name, bytes) = self.repository.download_content(ids).await?;

        self.content
            .put(
                &self.content_container,
                &format!("{}/{}", object_id, file_name),
                &bytes,
                content_type_for(&file_name),
                object_id,
            )
            .await?;

        let sidecar = serde_json::to_vec_pretty(&sidecar(ids, metadata, (self.clock)()))?;
        self.content
            .put(
                &self.metadata_container,
                &format!("{}.json", object_id),
                &sidecar,
                "application/json",
                object_id,
            )
            .await?;
        debug!("Exported {} ({} bytes)", file_name, bytes.len());

        let mut body = metadata.public_view(&self.mapping);
        body.insert("objectId".to_string(), Value::String(object_id.to_string()));
        let event = match kind {
            ExportKind::Create => CallbackEvent::Create {
                object_id: object_id.to_string(),
                body,
            },
            ExportKind::Update => CallbackEvent::Update {
                object_id: object_id.to_string(),
                body,
            },
        };
        self.announce(&event).await;
        Ok(())
    }

    /// Delete every exported artifact of an object and fire the delete callback.
    #[instrument(skip(self), level = "debug")]
    pub async fn remove(&self, object_id: &str) -> Result<usize> {
        let content = self
            .content
            .delete_by_tag(&self.content_container, object_id)
            .await?;
        let sidecars = self
            .content
            .delete_by_tag(&self.metadata_container, object_id)
            .await?;
        self.announce(&CallbackEvent::Delete {
            object_id: object_id.to_string(),
        })
        .await;
        Ok(content + sidecars)
    }

    async fn announce(&self, event: &CallbackEvent) {
        if let Err(e) = self.callbacks.send(event).await {
            warn!(
                "Callback {} for {} failed: {}",
                event.action(),
                event.object_id(),
                e
            );
        }
    }
}

fn sidecar(
    ids: &ObjectIdentifiers,
    metadata: &DocumentMetadata,
    exported_at: DateTime<Utc>,
) -> Value {
    json!({
        "objectId": ids.object_id,
        "identifiers": ids,
        "metadata": metadata.to_json(),
        "exportedAt": exported_at.to_rfc3339(),
    })
}

fn content_type_for(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_clock;
    use crate::memory::{MemoryContentStore, MemoryRepository, RecordingCallbackSink};
    use chrono::TimeZone;
    use serde_json::Map;

    fn setup() -> (
        Arc<MemoryRepository>,
        Arc<MemoryContentStore>,
        Arc<RecordingCallbackSink>,
        Exporter,
    ) {
        let repository = Arc::new(MemoryRepository::new());
        repository.add_library("site-1", "list-1", "drive-1");
        let content = Arc::new(MemoryContentStore::new());
        let callbacks = Arc::new(RecordingCallbackSink::new());
        let mapping: FieldMapping = serde_json::from_value(json!([
            {"name": "Title", "column": "Title", "kind": "text", "public": true},
            {"name": "Classification", "column": "Klass", "kind": "text"}
        ]))
        .unwrap();
        let exporter = Exporter::new(
            repository.clone(),
            content.clone(),
            callbacks.clone(),
            Arc::new(mapping),
            "documents",
            "metadata",
            fixed_clock(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
        );
        (repository, content, callbacks, exporter)
    }

    #[tokio::test]
    async fn test_export_writes_content_and_sidecar() {
        let (repository, content, callbacks, exporter) = setup();
        let mut fields = Map::new();
        fields.insert("Title".into(), json!("Report"));
        fields.insert("Klass".into(), json!("Internal"));
        let doc = repository.add_document("drive-1", "report.pdf", b"%PDF", fields).unwrap();
        let ids = ObjectIdentifiers {
            object_id: "ZLD2024-1".into(),
            ..doc
        };

        let metadata = exporter.load_metadata(&ids).await.unwrap();
        exporter
            .export(&ids, &metadata, ExportKind::Create)
            .await
            .unwrap();

        let blob = content.get("documents", "ZLD2024-1/report.pdf").unwrap();
        assert_eq!(blob.data, b"%PDF");
        assert_eq!(blob.content_type, "application/pdf");
        assert_eq!(blob.tag, "ZLD2024-1");

        let sidecar = content.get("metadata", "ZLD2024-1.json").unwrap();
        let value: Value = serde_json::from_slice(&sidecar.data).unwrap();
        assert_eq!(value["objectId"], "ZLD2024-1");
        assert_eq!(value["metadata"]["Classification"], "Internal");
        assert_eq!(value["identifiers"]["driveId"], "drive-1");
        assert_eq!(value["exportedAt"], "2024-06-01T12:00:00+00:00");

        let events = callbacks.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            CallbackEvent::Create { object_id, body } => {
                assert_eq!(object_id, "ZLD2024-1");
                assert_eq!(body["Title"], "Report");
                assert!(body.get("Classification").is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_callback_failure_is_not_an_export_failure() {
        let (repository, _, callbacks, exporter) = setup();
        callbacks.fail(true);
        let doc = repository.add_document("drive-1", "a.docx", b"x", Map::new()).unwrap();
        let ids = ObjectIdentifiers {
            object_id: "ZLD2024-2".into(),
            ..doc
        };
        let metadata = exporter.load_metadata(&ids).await.unwrap();
        assert!(exporter
            .export(&ids, &metadata, ExportKind::Update)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_remove_deletes_tagged_artifacts() {
        let (repository, content, callbacks, exporter) = setup();
        let doc = repository.add_document("drive-1", "a.docx", b"x", Map::new()).unwrap();
        let ids = ObjectIdentifiers {
            object_id: "ZLD2024-3".into(),
            ..doc
        };
        let metadata = exporter.load_metadata(&ids).await.unwrap();
        exporter
            .export(&ids, &metadata, ExportKind::Create)
            .await
            .unwrap();

        assert_eq!(exporter.remove("ZLD2024-3").await.unwrap(), 2);
        assert!(content.get("documents", "ZLD2024-3/a.docx").is_none());
        assert!(matches!(
            callbacks.events().last(),
            Some(CallbackEvent::Delete { .. })
        ));
    }

    #[test]
    fn test_content_type() {
        assert_eq!(
            content_type_for("A.DOCX"),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        );
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }
}
