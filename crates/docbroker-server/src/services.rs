//! Wiring of the engine to the configured backends.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use docbroker_cloudflare::{
    KvCheckpointStore, KvClient, KvSubscriptionStore, R2Bucket, R2ContentStore, R2IdentityStore,
    R2NotificationQueue, R2PublicationStore, R2SequenceCounter,
};
use docbroker_core::{
    AuthorNotifier, CallbackSink, CheckpointStore, NotificationQueue, SubscriptionStore,
};
use docbroker_graph::{GraphClient, GraphConfig, GraphMailNotifier, GraphRepository};
use docbroker_sync::memory::{
    MemoryCheckpointStore, MemoryContentStore, MemoryIdentityStore, MemoryNotificationQueue,
    MemoryPublicationStore, MemoryRepository, MemorySequenceCounter, MemorySubscriptionStore,
};
use docbroker_sync::{
    system_clock, Backends, BrokerContext, BrokerSettings, Clock, DeltaSyncEngine,
    DocumentRegistrar, WebhookPipeline,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{BackendKind, Config};
use crate::sinks::{HttpCallbackSink, LogCallbackSink, LogNotifier};

/// Everything the engine needs besides the shared context.
pub struct Stores {
    pub backends: Backends,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub queue: Arc<dyn NotificationQueue>,
    pub notifier: Arc<dyn AuthorNotifier>,
}

/// The running broker: shared context plus the three workflows.
#[derive(Clone)]
pub struct Services {
    pub ctx: BrokerContext,
    pub engine: Arc<DeltaSyncEngine>,
    pub pipeline: Arc<WebhookPipeline>,
    pub registrar: Arc<DocumentRegistrar>,
}

impl Services {
    pub fn assemble(
        settings: BrokerSettings,
        stores: Stores,
        clock: Clock,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let ctx = BrokerContext::new(settings, stores.backends, clock);
        let engine = DeltaSyncEngine::new(ctx.clone(), stores.checkpoints)
            .with_shutdown(shutdown.clone());
        let pipeline = WebhookPipeline::new(
            ctx.clone(),
            stores.subscriptions,
            stores.queue,
            stores.notifier,
        )
        .with_shutdown(shutdown);
        let registrar = DocumentRegistrar::new(ctx.clone());

        Self {
            ctx,
            engine: Arc::new(engine),
            pipeline: Arc::new(pipeline),
            registrar: Arc::new(registrar),
        }
    }

    /// Build the services for the backend selected in `config`.
    pub fn from_config(
        config: &Config,
        settings: BrokerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let callbacks = callback_sink(config)?;
        let stores = match config.backend {
            BackendKind::Memory => memory_stores(&settings, callbacks),
            BackendKind::Cloud => cloud_stores(config, &settings, callbacks)?,
        };
        Ok(Self::assemble(settings, stores, system_clock(), shutdown))
    }
}

fn callback_sink(config: &Config) -> anyhow::Result<Arc<dyn CallbackSink>> {
    match &config.callback_base_url {
        Some(base_url) => {
            info!("  Callbacks: {}", base_url);
            let sink =
                HttpCallbackSink::new(base_url, Duration::from_secs(config.http_timeout_secs))?;
            Ok(Arc::new(sink))
        }
        None => {
            warn!("  Callbacks: DISABLED (set CALLBACK_BASE_URL to enable)");
            Ok(Arc::new(LogCallbackSink))
        }
    }
}

/// In-process stores. Every monitored container is registered as an empty library.
pub fn memory_stores(settings: &BrokerSettings, callbacks: Arc<dyn CallbackSink>) -> Stores {
    info!("  Backend: memory");
    let repository = MemoryRepository::new();
    for container in &settings.containers {
        repository.add_library(&container.site_id, &container.list_id, &container.drive_id);
    }

    Stores {
        backends: Backends {
            repository: Arc::new(repository),
            identities: Arc::new(MemoryIdentityStore::new()),
            counter: Arc::new(MemorySequenceCounter::default()),
            publications: Arc::new(MemoryPublicationStore::new()),
            content: Arc::new(MemoryContentStore::new()),
            callbacks,
        },
        checkpoints: Arc::new(MemoryCheckpointStore::new()),
        subscriptions: Arc::new(MemorySubscriptionStore::new()),
        queue: Arc::new(MemoryNotificationQueue::new()),
        notifier: Arc::new(LogNotifier),
    }
}

fn required<'a>(value: &'a Option<String>, env: &str) -> anyhow::Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .with_context(|| format!("{} is required for the cloud backend", env))
}

/// Graph repository, R2 tables/content/queue and KV checkpoints.
fn cloud_stores(
    config: &Config,
    settings: &BrokerSettings,
    callbacks: Arc<dyn CallbackSink>,
) -> anyhow::Result<Stores> {
    let mut graph_config = GraphConfig::new(
        required(&config.tenant_id, "AZURE_TENANT_ID")?,
        required(&config.client_id, "AZURE_CLIENT_ID")?,
        required(&config.client_secret, "AZURE_CLIENT_SECRET")?,
    );
    graph_config.graph_base_url = config.graph_base_url.trim_end_matches('/').to_string();
    graph_config.authority_url = config.authority_url.trim_end_matches('/').to_string();
    graph_config.client_state = settings.webhook.client_state.clone();
    graph_config.timeout = Duration::from_secs(config.http_timeout_secs);
    let graph = GraphClient::new(graph_config)?;

    let account_id = required(&config.cloudflare_account_id, "CLOUDFLARE_ACCOUNT_ID")?;
    let bucket = R2Bucket::connect(
        account_id,
        required(&config.r2_access_key_id, "R2_ACCESS_KEY_ID")?,
        required(&config.r2_secret_access_key, "R2_SECRET_ACCESS_KEY")?,
        required(&config.r2_bucket_name, "R2_BUCKET_NAME")?,
    );
    let kv = Arc::new(KvClient::new(
        account_id,
        required(&config.kv_namespace_id, "KV_NAMESPACE_ID")?,
        required(&config.cloudflare_api_token, "CLOUDFLARE_API_TOKEN")?,
    ));

    info!("  Backend: cloud");
    info!("  Graph: {}", config.graph_base_url);
    info!("  R2 bucket: {}", bucket.bucket_name());

    let notifier: Arc<dyn AuthorNotifier> = match &config.mail_sender {
        Some(sender) => {
            info!("  Author mail: {}", sender);
            Arc::new(GraphMailNotifier::new(graph.clone(), sender.clone()))
        }
        None => {
            warn!("  Author mail: DISABLED (set MAIL_SENDER to enable)");
            Arc::new(LogNotifier)
        }
    };

    Ok(Stores {
        backends: Backends {
            repository: Arc::new(GraphRepository::new(graph)),
            identities: Arc::new(R2IdentityStore::new(bucket.clone())),
            counter: Arc::new(R2SequenceCounter::new(bucket.clone())),
            publications: Arc::new(R2PublicationStore::new(bucket.clone())),
            content: Arc::new(R2ContentStore::new(bucket.clone())),
            callbacks,
        },
        checkpoints: Arc::new(KvCheckpointStore::new(kv.clone())),
        subscriptions: Arc::new(KvSubscriptionStore::new(kv)),
        queue: Arc::new(R2NotificationQueue::new(bucket)),
        notifier,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_settings() {
        assert_eq!(required(&Some("t".to_string()), "AZURE_TENANT_ID").unwrap(), "t");
        let err = required(&None, "AZURE_CLIENT_ID").unwrap_err();
        assert!(err.to_string().contains("AZURE_CLIENT_ID"));
        assert!(required(&Some(String::new()), "R2_BUCKET_NAME").is_err());
    }
}
