use std::sync::Arc;

use async_trait::async_trait;
use docbroker_core::{AuthorNotice, AuthorNotifier, BrokerError, Result};
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::client::{GraphClient, GRAPH_SCOPE};

/// Sends processing outcomes to document authors via Graph `sendMail`.
pub struct GraphMailNotifier {
    client: Arc<GraphClient>,
    sender: String,
}

impl GraphMailNotifier {
    /// `sender` is the mailbox (UPN or id) the mail is sent from.
    pub fn new(client: Arc<GraphClient>, sender: impl Into<String>) -> Self {
        Self {
            client,
            sender: sender.into(),
        }
    }

    fn message(notice: &AuthorNotice) -> Value {
        let (subject, summary) = if notice.succeeded {
            (
                format!("Document {} processed", notice.object_id),
                format!(
                    "Your document \"{}\" was processed as {}.",
                    notice.document_name, notice.object_id
                ),
            )
        } else {
            (
                format!("Document {} could not be processed", notice.document_name),
                format!(
                    "Processing of your document \"{}\" failed.",
                    notice.document_name
                ),
            )
        };
        let content = if notice.message.is_empty() {
            summary
        } else {
            format!("{}\n\n{}", summary, notice.message)
        };

        json!({
            "message": {
                "subject": subject,
                "body": { "contentType": "Text", "content": content },
                "toRecipients": [{ "emailAddress": { "address": notice.recipient } }]
            },
            "saveToSentItems": false
        })
    }
}

#[async_trait]
impl AuthorNotifier for GraphMailNotifier {
    #[instrument(skip(self, notice), fields(object_id = %notice.object_id), level = "debug")]
    async fn notify(&self, notice: &AuthorNotice) -> Result<()> {
        if notice.recipient.is_empty() {
            return Err(BrokerError::InvalidInput(
                "notice has no recipient".to_string(),
            ));
        }
        let url = self.client.graph_url(&format!(
            "/users/{}/sendMail",
            urlencoding::encode(&self.sender)
        ));
        let request = self.client.http().post(&url).json(&Self::message(notice));
        self.client
            .send(GRAPH_SCOPE, request)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("mailbox {}", self.sender)))?;
        info!("Notified {} about {}", notice.recipient, notice.object_id);
        Ok(())
    }
}
