use async_trait::async_trait;
use docbroker_core::{ContentStore, Result};
use tracing::{debug, info, instrument};

use crate::r2::{PutOptions, R2Bucket};

/// User metadata key carrying the object id on exported blobs.
const TAG_METADATA: &str = "object-id";

/// Exported content and side-cars in R2.
///
/// R2 has no object tagging, so every blob gets a zero-byte marker under a per-tag prefix that
/// `delete_by_tag` lists:
/// ```text
/// content/{container}/{name}
/// content-tags/{container}/{tag}/{name}
/// ```
pub struct R2ContentStore {
    bucket: R2Bucket,
}

impl R2ContentStore {
    pub fn new(bucket: R2Bucket) -> Self {
        Self { bucket }
    }
}

fn content_key(container: &str, name: &str) -> String {
    format!("content/{}/{}", container, name)
}

fn tag_prefix(container: &str, tag: &str) -> String {
    format!("content-tags/{}/{}/", container, urlencoding::encode(tag))
}

fn marker_key(container: &str, tag: &str, name: &str) -> String {
    format!("{}{}", tag_prefix(container, tag), urlencoding::encode(name))
}

/// Blob name encoded in a marker key.
fn name_of_marker(prefix: &str, marker: &str) -> Option<String> {
    let encoded = marker.strip_prefix(prefix)?;
    urlencoding::decode(encoded).ok().map(|name| name.into_owned())
}

#[async_trait]
impl ContentStore for R2ContentStore {
    #[instrument(skip(self, data), level = "debug", fields(len = data.len()))]
    async fn put(
        &self,
        container: &str,
        name: &str,
        data: &[u8],
        content_type: &str,
        tag: &str,
    ) -> Result<()> {
        self.bucket
            .put_object(
                &content_key(container, name),
                data,
                PutOptions {
                    content_type: Some(content_type),
                    metadata: Some((TAG_METADATA, tag)),
                },
            )
            .await?;
        self.bucket
            .put_object(&marker_key(container, tag, name), &[], PutOptions::default())
            .await?;
        debug!("Stored {}/{} ({} bytes)", container, name, data.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_by_tag(&self, container: &str, tag: &str) -> Result<usize> {
        let prefix = tag_prefix(container, tag);
        let markers = self.bucket.list_objects(&prefix, None).await?;

        let mut deleted = 0;
        for marker in &markers {
            if let Some(name) = name_of_marker(&prefix, marker) {
                self.bucket.delete_object(&content_key(container, &name)).await?;
                deleted += 1;
            }
            self.bucket.delete_object(marker).await?;
        }

        if deleted > 0 {
            info!("Deleted {} blob(s) tagged {} from {}", deleted, tag, container);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_round_trip() {
        let prefix = tag_prefix("documents", "ZLD2024-1");
        assert_eq!(prefix, "content-tags/documents/ZLD2024-1/");

        let marker = marker_key("documents", "ZLD2024-1", "ZLD2024-1/report final.docx");
        assert_eq!(
            marker,
            "content-tags/documents/ZLD2024-1/ZLD2024-1%2Freport%20final.docx"
        );
        assert_eq!(
            name_of_marker(&prefix, &marker).as_deref(),
            Some("ZLD2024-1/report final.docx")
        );
        assert_eq!(name_of_marker("content-tags/metadata/", &marker), None);
    }

    #[test]
    fn test_tags_do_not_share_prefixes() {
        // ZLD2024-1 must not match blobs of ZLD2024-10.
        let other = marker_key("documents", "ZLD2024-10", "x");
        assert!(!other.starts_with(&tag_prefix("documents", "ZLD2024-1")));
    }
}
