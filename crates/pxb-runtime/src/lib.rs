//! Broker assembly.
//!
//! Builds the collaborator graph (store, event fabric, schema engine, file
//! store, request + flow services, scheduler), wires the late-bound seams,
//! and owns the startup sequence: flow recovery first, then timer re-arm.
//! Nothing here is process-global; tests assemble as many independent
//! brokers as they like.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use pxb_config::BrokerConfig;
use pxb_db::Store;
use pxb_events::{EventFabric, EventLog, MemEventLog};
use pxb_files::{FileStore, LocalFileStore};
use pxb_flows::{FlowRunner, FlowService};
use pxb_requests::RequestService;
use pxb_schema::{HttpRetriever, RefAllowlist, SchemaEngine, SchemaRetriever, StaticRetriever};
use pxb_schemas::{
    new_sortable_id, BrokerError, Entity, EntityKind, Result,
};
use pxb_scheduler::Scheduler;

mod tasks;

pub use tasks::BrokerTaskHandler;

pub struct Broker {
    pub config: BrokerConfig,
    pub store: Arc<dyn Store>,
    pub fabric: Arc<EventFabric>,
    pub schema: Arc<SchemaEngine>,
    pub files: Arc<dyn FileStore>,
    pub requests: Arc<RequestService>,
    pub flows: Arc<FlowService>,
    pub scheduler: Scheduler,
}

impl Broker {
    /// Assemble a broker over explicit collaborators. Runners beyond the
    /// built-in basic one are registered here, before anything can race a
    /// flow.
    pub fn build(
        config: BrokerConfig,
        store: Arc<dyn Store>,
        event_log: Arc<dyn EventLog>,
        retriever: Arc<dyn SchemaRetriever>,
        runners: Vec<(String, Arc<dyn FlowRunner>)>,
    ) -> Arc<Broker> {
        let fabric = Arc::new(EventFabric::new(event_log, config.hub_queue_depth));
        let schema = Arc::new(SchemaEngine::new(
            RefAllowlist::new(config.ref_allowlist.clone()),
            retriever,
            config.schema_cache_capacity,
            std::time::Duration::from_secs(config.schema_cache_ttl_secs),
        ));
        let files: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(
            config.files_dir.clone(),
            config.files_base_url.clone(),
            config.token_secret.clone(),
        ));

        let (scheduler, worker) = Scheduler::new();

        let requests = Arc::new(RequestService::new(
            Arc::clone(&store),
            Arc::clone(&schema),
            Arc::clone(&fabric),
            scheduler.clone(),
            config.deadline_warning_secs,
        ));

        let mut flow_service = FlowService::new(
            Arc::clone(&store),
            Arc::clone(&fabric),
            Arc::clone(&requests),
            scheduler.clone(),
        );
        for (kind, runner) in runners {
            flow_service.register_runner(&kind, runner);
        }
        let flows = Arc::new(flow_service);

        requests.set_flow_hook(Arc::clone(&flows) as Arc<dyn pxb_requests::FlowWake>);

        let handler = Arc::new(BrokerTaskHandler::new(
            Arc::clone(&requests),
            Arc::clone(&flows),
        ));
        tokio::spawn(worker.run(handler));

        Arc::new(Broker {
            config,
            store,
            fabric,
            schema,
            files,
            requests,
            flows,
            scheduler,
        })
    }

    /// All-in-memory broker for development mode and tests.
    pub fn in_memory(config: BrokerConfig) -> Arc<Broker> {
        Self::build(
            config,
            Arc::new(pxb_db::MemStore::new()),
            Arc::new(MemEventLog::new()),
            Arc::new(StaticRetriever::new()),
            Vec::new(),
        )
    }

    /// Postgres-backed broker using the configured URLs.
    pub async fn connect(config: BrokerConfig) -> Result<Arc<Broker>> {
        let url = config.storage_url.clone().ok_or_else(|| {
            BrokerError::InvalidInput("storage URL is required (PXB_DATABASE_URL)".into())
        })?;
        let pool = pxb_db::connect(&url).await?;
        pxb_db::migrate(&pool).await?;

        let event_pool = match config.effective_event_log_url() {
            Some(ev_url) if ev_url != url => {
                let p = pxb_db::connect(ev_url).await?;
                pxb_db::migrate(&p).await?;
                p
            }
            _ => pool.clone(),
        };

        Ok(Self::build(
            config,
            Arc::new(pxb_db::PgStore::new(pool)),
            Arc::new(pxb_events::PgEventLog::new(event_pool)),
            Arc::new(HttpRetriever::new()),
            Vec::new(),
        ))
    }

    /// Startup: crash-safe flow recovery, then re-arm every timer derived
    /// from open rows. Both passes are idempotent.
    pub async fn start(&self) -> Result<()> {
        let report = self.flows.recover().await?;
        info!(
            resumed = report.resumed,
            ticked = report.ticked,
            "broker recovery complete"
        );
        self.rearm_timers().await?;
        Ok(())
    }

    async fn rearm_timers(&self) -> Result<()> {
        let open = self.store.open_timed_requests().await?;
        let rearmed = open.len();
        for request in open {
            self.requests.arm_timers(&request);
        }

        let mut reminders = 0usize;
        for reminder in self.store.open_reminders().await? {
            // past-due reminders are dropped by the scheduler's policy
            self.scheduler.schedule(
                pxb_scheduler::TaskKind::Reminder {
                    reminder_id: reminder.reminder_id,
                },
                reminder.remind_at_utc,
            );
            reminders += 1;
        }

        info!(requests = rearmed, reminders, "timers re-armed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // entity operations
    // -----------------------------------------------------------------------

    pub async fn create_entity(
        &self,
        kind: EntityKind,
        handle: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<Entity> {
        if let Some(handle) = &handle {
            if handle.trim().is_empty() {
                return Err(BrokerError::InvalidInput("handle must not be blank".into()));
            }
            if self.store.entity_by_handle(handle).await?.is_some() {
                return Err(BrokerError::InvalidInput(format!(
                    "handle already in use: {handle}"
                )));
            }
        }
        let now = Utc::now();
        let entity = Entity {
            entity_id: new_sortable_id(),
            kind,
            handle,
            metadata: if metadata.is_null() {
                serde_json::json!({})
            } else {
                metadata
            },
            created_at_utc: now,
            updated_at_utc: now,
        };
        self.store.insert_entity(&entity).await?;
        Ok(entity)
    }

    pub async fn entity(&self, id: Uuid) -> Result<Entity> {
        self.store
            .entity_by_id(id)
            .await?
            .ok_or_else(|| BrokerError::EntityNotFound(id.to_string()))
    }

    pub async fn update_entity_metadata(
        &self,
        id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<Entity> {
        if !self.store.update_entity_metadata(id, metadata).await? {
            return Err(BrokerError::EntityNotFound(id.to_string()));
        }
        self.entity(id).await
    }

    /// Dev-mode convenience: log loudly when running without durable storage.
    pub fn warn_if_ephemeral(&self) {
        if self.config.storage_url.is_none() {
            warn!("no storage URL configured; running with in-memory state (development only)");
        }
    }
}
