//! Push-notification pipeline.
//!
//! The repository calls the intake endpoint whenever something changes in a subscribed list.
//! Intake only validates and enqueues; a worker drains the queue, pulls the list's changes since
//! the stored change token and exports each completed document.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use docbroker_core::{
    AuthorNotice, AuthorNotifier, BrokerError, ChangeNotification, ChangeType, DocumentMetadata,
    FieldValue, ListChange, NotificationBatch, NotificationQueue, ObjectIdentifiers, Result,
    SubscriptionStore, WebhookSubscriptionState, WellKnownField,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::context::BrokerContext;
use crate::export::ExportKind;
use crate::settings::MonitoredContainer;
use crate::{FailedItem, ItemOutcome};

/// What the intake endpoint should answer.
#[derive(Debug, Clone, PartialEq)]
pub enum IntakeOutcome {
    /// Subscription handshake: echo the token as plain text.
    Validation(String),
    Queued { message_id: String, notifications: usize },
}

/// Outcome of processing the changes of one list.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReport {
    pub container: String,
    pub processed: Vec<String>,
    pub deferred: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedItem>,
    pub change_token: String,
}

pub struct WebhookPipeline {
    ctx: BrokerContext,
    subscriptions: Arc<dyn SubscriptionStore>,
    queue: Arc<dyn NotificationQueue>,
    notifier: Arc<dyn AuthorNotifier>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl WebhookPipeline {
    pub fn new(
        ctx: BrokerContext,
        subscriptions: Arc<dyn SubscriptionStore>,
        queue: Arc<dyn NotificationQueue>,
        notifier: Arc<dyn AuthorNotifier>,
    ) -> Self {
        Self {
            ctx,
            subscriptions,
            queue,
            notifier,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    // =========================================================================
    // Intake
    // =========================================================================

    pub async fn intake(
        &self,
        validation_token: Option<&str>,
        batch: Option<NotificationBatch>,
    ) -> Result<IntakeOutcome> {
        if let Some(token) = validation_token {
            debug!("Answering subscription validation");
            return Ok(IntakeOutcome::Validation(token.to_string()));
        }

        let batch = batch.ok_or_else(|| {
            BrokerError::InvalidInput("notification body is missing".to_string())
        })?;
        if batch.value.is_empty() {
            return Err(BrokerError::InvalidInput("notification batch is empty".to_string()));
        }

        let message_id = self.queue.enqueue(&batch).await?;
        info!(
            "Queued {} notification(s) as {}",
            batch.value.len(),
            message_id
        );
        Ok(IntakeOutcome::Queued {
            message_id,
            notifications: batch.value.len(),
        })
    }

    // =========================================================================
    // Subscription lifecycle
    // =========================================================================

    /// Create a subscription for a container that has none stored.
    #[instrument(skip(self, container), fields(container = %container.key))]
    pub async fn ensure_subscription(
        &self,
        container: &MonitoredContainer,
    ) -> Result<WebhookSubscriptionState> {
        let mut state = self
            .subscriptions
            .load(&container.list_id)
            .await?
            .unwrap_or_else(|| WebhookSubscriptionState::new(&container.list_id));
        if !state.subscription_id.is_empty() {
            return Ok(state);
        }

        let webhook = &self.ctx.settings.webhook;
        if webhook.notification_url.is_empty() {
            return Err(BrokerError::Config(
                "webhook.notificationUrl is not configured".to_string(),
            ));
        }

        let created = self
            .ctx
            .repository
            .create_subscription(
                &container.site_url,
                &container.list_id,
                &webhook.notification_url,
                self.next_expiration(),
            )
            .await?;
        info!(
            "Created subscription {} (expires {})",
            created.subscription_id, created.expiration_date_time
        );

        state.subscription_id = created.subscription_id;
        state.expiration_date_time = Some(created.expiration_date_time);
        self.subscriptions.save(&state).await?;
        Ok(state)
    }

    pub async fn ensure_all_subscriptions(&self) -> Result<Vec<WebhookSubscriptionState>> {
        let mut states = Vec::new();
        for container in &self.ctx.settings.containers {
            states.push(self.ensure_subscription(container).await?);
        }
        Ok(states)
    }

    /// Ensure every container has a subscription and renew the ones close to expiry.
    /// Returns the number of renewals.
    pub async fn maintain_subscriptions(&self) -> Result<usize> {
        let mut renewed = 0;
        for container in &self.ctx.settings.containers {
            let state = self.ensure_subscription(container).await?;
            let expiration = state.expiration_date_time.unwrap_or_else(|| self.ctx.now());
            if self.renew_if_needed(container, expiration).await? {
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    /// Renew the container's subscription when `expiration` falls inside the renewal window.
    /// Returns whether a renewal happened.
    pub async fn renew_if_needed(
        &self,
        container: &MonitoredContainer,
        expiration: DateTime<Utc>,
    ) -> Result<bool> {
        let window = Duration::days(self.ctx.settings.webhook.renewal_window_days);
        if expiration - self.ctx.now() > window {
            return Ok(false);
        }

        let Some(mut state) = self.subscriptions.load(&container.list_id).await? else {
            warn!("No stored subscription for {}, nothing to renew", container.key);
            return Ok(false);
        };
        if state.subscription_id.is_empty() {
            return Ok(false);
        }

        let renewed = self
            .ctx
            .repository
            .renew_subscription(
                &container.site_url,
                &container.list_id,
                &state.subscription_id,
                self.next_expiration(),
            )
            .await?;
        info!(
            "Renewed subscription {} until {}",
            state.subscription_id, renewed.expiration_date_time
        );
        state.expiration_date_time = Some(renewed.expiration_date_time);
        self.subscriptions.save(&state).await?;
        Ok(true)
    }

    fn next_expiration(&self) -> DateTime<Utc> {
        self.ctx.now() + Duration::days(self.ctx.settings.webhook.subscription_lifetime_days)
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Process up to `max` queued batches. A batch is acknowledged only when it was fully
    /// processed; a failing batch stays queued for redelivery until it has been delivered
    /// `maxDeliveries` times, then it is dead-lettered so later batches are not held up.
    pub async fn drain_queue(&self, max: usize) -> Result<usize> {
        let max_deliveries = self.ctx.settings.webhook.max_deliveries;
        let messages = self.queue.receive(max).await?;
        let mut acked = 0;
        for message in messages {
            if self.is_cancelled() {
                break;
            }
            match self.process_batch(&message.batch).await {
                Ok(reports) => {
                    debug!("Message {} produced {} report(s)", message.receipt, reports.len());
                    self.queue.ack(&message.receipt).await?;
                    acked += 1;
                }
                Err(BrokerError::Cancelled) => break,
                Err(e) if message.deliveries >= max_deliveries => {
                    error!(
                        "Message {} failed {} delivery(ies), dead-lettering: {}",
                        message.receipt, message.deliveries, e
                    );
                    self.queue.dead_letter(&message.receipt).await?;
                }
                Err(e) => {
                    warn!(
                        "Message {} left on queue (delivery {} of {}): {}",
                        message.receipt, message.deliveries, max_deliveries, e
                    );
                }
            }
        }
        Ok(acked)
    }

    /// Process every notification of a batch. Notifications for the same list are handled once.
    pub async fn process_batch(&self, batch: &NotificationBatch) -> Result<Vec<WebhookReport>> {
        let mut reports = Vec::new();
        let mut seen: Vec<String> = Vec::new();

        for notification in &batch.value {
            if !self.client_state_matches(notification) {
                warn!(
                    "Dropping notification for {} with unexpected client state",
                    notification.resource
                );
                continue;
            }
            let Some(container) = self.ctx.settings.container_by_list(&notification.resource)
            else {
                warn!("Notification for unmonitored list {}", notification.resource);
                continue;
            };
            if seen.iter().any(|list| list == &container.list_id) {
                continue;
            }
            seen.push(container.list_id.clone());

            let container = container.clone();
            reports.push(self.process_notification(&container, notification).await?);
        }
        Ok(reports)
    }

    fn client_state_matches(&self, notification: &ChangeNotification) -> bool {
        match &self.ctx.settings.webhook.client_state {
            Some(expected) => notification.client_state.as_deref() == Some(expected.as_str()),
            None => true,
        }
    }

    #[instrument(skip(self, container, notification), fields(container = %container.key))]
    async fn process_notification(
        &self,
        container: &MonitoredContainer,
        notification: &ChangeNotification,
    ) -> Result<WebhookReport> {
        if let Err(e) = self
            .renew_if_needed(container, notification.expiration_date_time)
            .await
        {
            error!("Subscription renewal failed: {}", e);
        }

        let mut state = self
            .subscriptions
            .load(&container.list_id)
            .await?
            .unwrap_or_else(|| WebhookSubscriptionState::new(&container.list_id));

        let (changes, token) = match self
            .fetch_changes(container, &state.last_change_token)
            .await
        {
            Err(BrokerError::InvalidToken(reason)) => {
                warn!("Change token rejected ({}), resyncing from full history", reason);
                state.last_change_token.clear();
                self.subscriptions.save(&state).await?;
                self.fetch_changes(container, "").await?
            }
            other => other?,
        };

        let mut report = WebhookReport {
            container: container.key.clone(),
            ..Default::default()
        };
        for change in collapse_changes(changes) {
            if self.is_cancelled() {
                // Token not advanced; the message stays queued and is replayed.
                return Err(BrokerError::Cancelled);
            }
            let kind = match change.change_type {
                ChangeType::Add => ExportKind::Create,
                _ => ExportKind::Update,
            };
            match self.process_item(container, &change.item_id, kind).await {
                Ok(ItemOutcome::Exported) => report.processed.push(change.item_id),
                Ok(ItemOutcome::Deferred) => report.deferred.push(change.item_id),
                Ok(ItemOutcome::Skipped(reason)) => {
                    debug!("Skipped item {}: {}", change.item_id, reason);
                    report.skipped.push(change.item_id);
                }
                Err(e) => report.failed.push(FailedItem {
                    id: change.item_id,
                    error: e.to_string(),
                }),
            }
        }

        state.last_change_token = token;
        self.subscriptions.save(&state).await?;
        report.change_token = state.last_change_token;
        Ok(report)
    }

    async fn fetch_changes(
        &self,
        container: &MonitoredContainer,
        start_token: &str,
    ) -> Result<(Vec<ListChange>, String)> {
        let mut token = start_token.to_string();
        let mut changes = Vec::new();
        loop {
            let page = self
                .ctx
                .repository
                .get_list_changes(&container.site_url, &container.list_id, &token)
                .await?;
            changes.extend(page.changes);
            let advanced = !page.new_token.is_empty() && page.new_token != token;
            if advanced {
                token = page.new_token;
            }
            if !page.has_more {
                break;
            }
            if !advanced {
                warn!("List changes reported more pages without a new token");
                break;
            }
        }
        Ok((changes, token))
    }

    async fn process_item(
        &self,
        container: &MonitoredContainer,
        list_item_id: &str,
        kind: ExportKind,
    ) -> Result<ItemOutcome> {
        let partial =
            ObjectIdentifiers::from_repository(&container.site_id, &container.list_id, list_item_id);
        let ids = match self.ctx.resolver.resolve(&partial).await {
            Ok(ids) => ids,
            Err(e) if e.is_not_found() => {
                return Ok(ItemOutcome::Skipped(format!("no longer in repository: {}", e)))
            }
            Err(e) => return Err(e),
        };
        let metadata = self.ctx.exporter.load_metadata(&ids).await?;

        let webhook = &self.ctx.settings.webhook;
        if !metadata.flag(WellKnownField::MetadataComplete) {
            return Ok(ItemOutcome::Skipped("metadata not complete".to_string()));
        }
        if metadata.text(WellKnownField::ExportStatus) == Some(webhook.processed_status.as_str()) {
            return Ok(ItemOutcome::Skipped("already processed".to_string()));
        }

        match self.export_item(ids.clone(), &metadata, kind).await {
            Ok((record, outcome)) => {
                let message = match outcome {
                    ItemOutcome::Deferred => format!(
                        "Publication deferred until {}",
                        metadata
                            .publication_date()
                            .map(|d| d.date_naive().to_string())
                            .unwrap_or_default()
                    ),
                    _ => String::new(),
                };
                self.mark(&record, &webhook.processed_status, &message).await?;
                self.notify_author(&record, &metadata, true, &message).await;
                Ok(outcome)
            }
            Err(e) => {
                warn!("Export of item {} failed: {}", list_item_id, e);
                if let Err(mark_error) = self.mark(&ids, &webhook.error_status, &e.to_string()).await
                {
                    error!("Could not mark item {} as failed: {}", list_item_id, mark_error);
                }
                self.notify_author(&ids, &metadata, false, &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn export_item(
        &self,
        ids: ObjectIdentifiers,
        metadata: &DocumentMetadata,
        kind: ExportKind,
    ) -> Result<(ObjectIdentifiers, ItemOutcome)> {
        let minted = self.ctx.minter.mint_tracked(&ids).await?;
        // Whatever the change type, the third party has never seen an id minted just now.
        let kind = if minted.created { ExportKind::Create } else { kind };
        let mut record = minted.record;

        let destination = metadata
            .text(WellKnownField::Classification)
            .and_then(|label| self.ctx.settings.classification_destinations.get(label));
        if let Some(destination) = destination {
            let moved = self.ctx.repository.move_item(&record, destination).await?;
            // A move into another library changes the coordinates but never the object id.
            let moved = ObjectIdentifiers {
                object_id: record.object_id.clone(),
                ..moved
            }
            .merged(&record);
            if moved != record {
                info!(
                    "Moved {} into {}/{}",
                    record.object_id, destination.drive_id, destination.folder_id
                );
                self.relocate_identity(&record, &moved).await?;
                record = moved;
            }
        }

        if let Some(publication_date) = metadata.publication_date() {
            if publication_date > self.ctx.now() {
                self.ctx
                    .publications
                    .enqueue(&record.object_id, publication_date)
                    .await?;
                return Ok((record, ItemOutcome::Deferred));
            }
        }

        self.ctx.exporter.export(&record, metadata, kind).await?;
        Ok((record, ItemOutcome::Exported))
    }

    /// Point the identity record at its new coordinates. The new rows are written before the
    /// old natural-key and storage-key rows go, and the by-id row is only ever overwritten.
    async fn relocate_identity(
        &self,
        from: &ObjectIdentifiers,
        to: &ObjectIdentifiers,
    ) -> Result<()> {
        self.ctx.identities.upsert(to).await?;
        let natural = from.natural_key().filter(|key| to.natural_key().as_ref() != Some(key));
        let storage = from.storage_key().filter(|key| to.storage_key().as_ref() != Some(key));
        self.ctx
            .identities
            .delete_keys(&from.object_id, natural.as_ref(), storage.as_ref())
            .await
    }

    async fn mark(&self, ids: &ObjectIdentifiers, status: &str, message: &str) -> Result<()> {
        let mut values = vec![(
            WellKnownField::ExportStatus,
            FieldValue::Text(status.to_string()),
        )];
        if self
            .ctx
            .mapping
            .descriptor(WellKnownField::ExportMessage.name())
            .is_some()
        {
            values.push((
                WellKnownField::ExportMessage,
                FieldValue::Text(message.to_string()),
            ));
        }
        let patch = self.ctx.mapping.write(&values)?;
        self.ctx.repository.update_item_fields(ids, &patch).await
    }

    async fn notify_author(
        &self,
        ids: &ObjectIdentifiers,
        metadata: &DocumentMetadata,
        succeeded: bool,
        message: &str,
    ) {
        let Some(recipient) = metadata.text(WellKnownField::Author) else {
            debug!("No author to notify for item {}", ids.list_item_id);
            return;
        };
        let notice = AuthorNotice {
            recipient: recipient.to_string(),
            object_id: ids.object_id.clone(),
            document_name: metadata
                .text(WellKnownField::Title)
                .unwrap_or(&ids.list_item_id)
                .to_string(),
            succeeded,
            message: message.to_string(),
        };
        if let Err(e) = self.notifier.notify(&notice).await {
            warn!("Failed to notify {}: {}", recipient, e);
        }
    }
}

/// Keep each item's last change, in first-seen order, and drop items whose last change is a
/// delete. Change kinds the pipeline does not act on are dropped as well.
pub fn collapse_changes(changes: Vec<ListChange>) -> Vec<ListChange> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut latest: Vec<ListChange> = Vec::new();
    for change in changes {
        match index.get(&change.item_id) {
            Some(&position) => latest[position] = change,
            None => {
                index.insert(change.item_id.clone(), latest.len());
                latest.push(change);
            }
        }
    }
    latest
        .into_iter()
        .filter(|c| matches!(c.change_type, ChangeType::Add | ChangeType::Update))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(id: &str, change_type: ChangeType) -> ListChange {
        ListChange {
            item_id: id.to_string(),
            change_type,
        }
    }

    #[test]
    fn test_later_delete_wins() {
        let collapsed = collapse_changes(vec![
            change("1", ChangeType::Add),
            change("2", ChangeType::Add),
            change("1", ChangeType::Update),
            change("1", ChangeType::Delete),
            change("3", ChangeType::Other),
        ]);
        assert_eq!(collapsed, vec![change("2", ChangeType::Add)]);
    }

    #[test]
    fn test_later_update_wins() {
        let collapsed = collapse_changes(vec![
            change("1", ChangeType::Delete),
            change("1", ChangeType::Add),
            change("1", ChangeType::Update),
        ]);
        assert_eq!(collapsed, vec![change("1", ChangeType::Update)]);
    }
}
