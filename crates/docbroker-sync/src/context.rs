use std::sync::Arc;

use docbroker_core::{
    CallbackSink, ContentStore, FieldMapping, IdentityStore, PublicationStore, RepositoryClient,
    SequenceCounter,
};

use crate::export::Exporter;
use crate::minter::ObjectIdMinter;
use crate::publication::PublicationQueue;
use crate::resolver::IdentityResolver;
use crate::settings::BrokerSettings;
use crate::Clock;

/// Backend implementations the broker runs against.
#[derive(Clone)]
pub struct Backends {
    pub repository: Arc<dyn RepositoryClient>,
    pub identities: Arc<dyn IdentityStore>,
    pub counter: Arc<dyn SequenceCounter>,
    pub publications: Arc<dyn PublicationStore>,
    pub content: Arc<dyn ContentStore>,
    pub callbacks: Arc<dyn CallbackSink>,
}

/// Services shared by the delta engine, the webhook pipeline and the registrar.
#[derive(Clone)]
pub struct BrokerContext {
    pub settings: Arc<BrokerSettings>,
    pub repository: Arc<dyn RepositoryClient>,
    pub identities: Arc<dyn IdentityStore>,
    pub resolver: Arc<IdentityResolver>,
    pub minter: Arc<ObjectIdMinter>,
    pub exporter: Arc<Exporter>,
    pub publications: Arc<PublicationQueue>,
    pub mapping: Arc<FieldMapping>,
    pub clock: Clock,
}

impl BrokerContext {
    pub fn new(settings: BrokerSettings, backends: Backends, clock: Clock) -> Self {
        let mapping = Arc::new(settings.fields.clone());
        let resolver = Arc::new(IdentityResolver::new(
            backends.repository.clone(),
            backends.identities.clone(),
            settings.reference_map(),
        ));
        let minter = Arc::new(ObjectIdMinter::new(
            resolver.clone(),
            backends.identities.clone(),
            backends.counter,
            settings.object_id_prefix.clone(),
            clock.clone(),
        ));
        let exporter = Arc::new(Exporter::new(
            backends.repository.clone(),
            backends.content,
            backends.callbacks,
            mapping.clone(),
            settings.content_container.clone(),
            settings.metadata_container.clone(),
            clock.clone(),
        ));
        let publications = Arc::new(PublicationQueue::new(
            backends.publications,
            resolver.clone(),
            exporter.clone(),
            clock.clone(),
        ));

        Self {
            settings: Arc::new(settings),
            repository: backends.repository,
            identities: backends.identities,
            resolver,
            minter,
            exporter,
            publications,
            mapping,
            clock,
        }
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        (self.clock)()
    }
}
