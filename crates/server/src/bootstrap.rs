use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use ringback_agent::{ConversationProcessor, HttpConversationProcessor, ScriptedProcessor};
use ringback_core::config::{AppConfig, ConfigError, LoadOptions};
use ringback_core::domain::OrgId;
use ringback_core::WebhookVerifier;
use ringback_db::repositories::{
    SqlConversationJobRepository, SqlLeadRepository, SqlMessagingStore, SqlOutboxRepository,
    SqlProcessedEventStore,
};
use ringback_db::{connect_with_settings, migrations, DbPool};
use thiserror::Error;
use tracing::info;

use crate::health;
use crate::outbound::OutboundMessenger;
use crate::outbox_relay::{LoggingOutboxSink, OutboxRelay, OutboxSink};
use crate::provider::{MessageSender, ProviderMessageSender};
use crate::publisher::ConversationPublisher;
use crate::queue::{ConversationQueue, MemoryQueue};
use crate::retry::RetrySweeper;
use crate::voice_session::VoiceSessionCache;
use crate::webhooks::{self, WebhookState};
use crate::worker::{WorkerConfig, WorkerPool};

/// External collaborators. Production builds them from config; tests hand
/// in doubles.
#[derive(Clone)]
pub struct Integrations {
    pub sender: Arc<dyn MessageSender>,
    pub processor: Arc<dyn ConversationProcessor>,
    pub outbox_sink: Arc<dyn OutboxSink>,
}

impl Integrations {
    pub fn from_config(config: &AppConfig) -> Self {
        let processor: Arc<dyn ConversationProcessor> = match &config.conversation.processor_url {
            Some(url) => Arc::new(HttpConversationProcessor::new(
                url.clone(),
                config.conversation.processor_timeout_secs,
            )),
            None => Arc::new(ScriptedProcessor::new()),
        };
        Self {
            sender: Arc::new(ProviderMessageSender::new(&config.provider)),
            processor,
            outbox_sink: Arc::new(LoggingOutboxSink),
        }
    }
}

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub store: SqlMessagingStore,
    pub webhook_state: WebhookState,
    pub worker_pool: WorkerPool,
    pub retry_sweeper: Option<RetrySweeper>,
    pub outbox_relay: Option<OutboxRelay>,
    pub router: Router,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    let integrations = Integrations::from_config(&config);
    bootstrap_with(config, integrations).await
}

pub async fn bootstrap_with(
    config: AppConfig,
    integrations: Integrations,
) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );
    config.validate()?;
    let compliance = Arc::new(config.compliance.build_engine()?);

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let store = SqlMessagingStore::new(db_pool.clone());
    let jobs = Arc::new(SqlConversationJobRepository::new(db_pool.clone()));
    let policy = config.retry.policy();

    let messenger = OutboundMessenger::new(
        store.clone(),
        integrations.sender.clone(),
        compliance.clone(),
        policy.clone(),
        Duration::from_secs(config.provider.send_timeout_secs),
        config.provider.messaging_profile_id.clone(),
    );

    let queue: Arc<dyn ConversationQueue> =
        Arc::new(MemoryQueue::new(config.conversation.queue_capacity));
    let publisher = ConversationPublisher::new(
        queue.clone(),
        jobs.clone(),
        Duration::from_secs(config.conversation.enqueue_timeout_secs),
    );

    let verifier = config.provider.verify_signatures.then(|| {
        WebhookVerifier::new(
            config.provider.webhook_secret.clone(),
            config.provider.signature_max_skew_secs,
        )
    });

    let webhook_state = WebhookState {
        store: store.clone(),
        processed: Arc::new(SqlProcessedEventStore::new(db_pool.clone())),
        leads: Arc::new(SqlLeadRepository::new(db_pool.clone())),
        compliance,
        verifier,
        messenger: messenger.clone(),
        publisher,
        voice_processor: config
            .conversation
            .voice_sync
            .then(|| integrations.processor.clone()),
        voice_sessions: Arc::new(VoiceSessionCache::new(Duration::from_secs(
            config.voice.session_ttl_secs,
        ))),
        demo_org_id: config.tenancy.demo_org_id.as_deref().map(OrgId::from),
        processor_timeout: Duration::from_secs(config.conversation.processor_timeout_secs),
        handler_timeout: Duration::from_secs(config.server.webhook_timeout_secs),
    };

    let worker_pool = WorkerPool::new(
        WorkerConfig::from(&config.conversation),
        queue,
        integrations.processor.clone(),
        jobs,
        messenger.clone(),
    );

    let retry_sweeper = config.retry.sweep_enabled.then(|| {
        RetrySweeper::new(
            store.clone(),
            messenger.clone(),
            policy,
            config.retry.sweep_batch,
            Duration::from_secs(config.retry.sweep_interval_secs),
        )
    });

    let outbox_relay = config.outbox.relay_enabled.then(|| {
        OutboxRelay::new(
            SqlOutboxRepository::new(db_pool.clone()),
            integrations.outbox_sink.clone(),
            config.outbox.relay_batch,
            Duration::from_secs(config.outbox.relay_interval_secs),
        )
    });

    let router = webhooks::router(webhook_state.clone()).merge(health::router(db_pool.clone()));

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        verify_signatures = config.provider.verify_signatures,
        workers = config.conversation.worker_count,
        retry_sweep = retry_sweeper.is_some(),
        outbox_relay = outbox_relay.is_some(),
        "application components wired"
    );

    Ok(Application {
        config,
        db_pool,
        store,
        webhook_state,
        worker_pool,
        retry_sweeper,
        outbox_relay,
        router,
    })
}
