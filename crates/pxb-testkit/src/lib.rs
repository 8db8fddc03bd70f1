//! Test fixtures: an in-memory broker assembly plus the runners and input
//! builders the scenario tests share.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use pxb_config::BrokerConfig;
use pxb_db::MemStore;
use pxb_events::MemEventLog;
use pxb_flows::{FlowRunner, StepCtx, StepOutcome};
use pxb_runtime::Broker;
use pxb_schemas::{
    events, CreateRequestInput, Entity, EntityKind, EntityRef, Identity, Result,
};

/// Flow kind handled by [`AwaitInputRunner`].
pub const INTAKE_KIND: &str = "intake";

/// Broker config suitable for tests: permissive allowlist, dev header auth,
/// fixed secret, uploads kept out of the working directory.
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        token_secret: "test-secret".into(),
        dev_header_auth: true,
        files_dir: std::env::temp_dir()
            .join("pxbox-testkit-files")
            .to_string_lossy()
            .into_owned(),
        ..BrokerConfig::default()
    }
}

/// An in-memory broker whose store and event log survive "restarts":
/// [`TestBroker::restart`] assembles a fresh broker (new hub, new scheduler,
/// new service objects) over the same storage, which is exactly what a
/// process crash plus reboot looks like to the recovery pass.
pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub store: Arc<MemStore>,
    pub log: Arc<MemEventLog>,
}

impl TestBroker {
    pub fn new() -> Self {
        let store = Arc::new(MemStore::new());
        let log = Arc::new(MemEventLog::new());
        Self::over(store, log)
    }

    pub fn over(store: Arc<MemStore>, log: Arc<MemEventLog>) -> Self {
        let broker = Broker::build(
            test_config(),
            store.clone(),
            log.clone(),
            Arc::new(pxb_schema::StaticRetriever::new()),
            vec![(INTAKE_KIND.to_string(), Arc::new(AwaitInputRunner))],
        );
        Self { broker, store, log }
    }

    /// Drop every in-memory service and rebuild over the same durable state.
    /// The caller decides when to run `broker.start()` (the recovery pass).
    pub fn restart(self) -> Self {
        let TestBroker { broker, store, log } = self;
        drop(broker);
        Self::over(store, log)
    }

    pub async fn seed_user(&self, handle: &str) -> Entity {
        self.broker
            .create_entity(EntityKind::User, Some(handle.to_string()), json!({}))
            .await
            .expect("seed entity")
    }

    pub fn requestor(&self) -> Identity {
        Identity {
            subject: "agent:test".into(),
            entity_id: None,
        }
    }
}

impl Default for TestBroker {
    fn default() -> Self {
        Self::new()
    }
}

// re-exported so scenario tests only need the testkit
pub use pxb_schema;

/// `{name: string, required}` — the schema every basic scenario uses.
pub fn name_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {"name": {"type": "string"}},
        "required": ["name"]
    })
}

/// Input targeting an entity by handle with the standard name schema.
pub fn name_request(handle: &str) -> CreateRequestInput {
    CreateRequestInput {
        entity: EntityRef {
            id: None,
            handle: Some(handle.to_string()),
        },
        schema: name_schema(),
        schema_kind: None,
        ui_hints: json!({}),
        prefill: json!({}),
        expires_at: None,
        deadline_at: None,
        attention_at: None,
        autocancel_grace_secs: None,
        callback_url: None,
        callback_secret: None,
        file_policy: None,
        flow_id: None,
    }
}

/// Input targeting an entity by ID.
pub fn name_request_for(entity_id: Uuid) -> CreateRequestInput {
    CreateRequestInput {
        entity: EntityRef {
            id: Some(entity_id),
            handle: None,
        },
        ..name_request("unused")
    }
}

// ---------------------------------------------------------------------------
// AwaitInputRunner
// ---------------------------------------------------------------------------

/// Three-step runner: ask the owner for a name, suspend, complete once the
/// answer lands. Cancellation, expiry, or a timeout fails the flow.
pub struct AwaitInputRunner;

#[async_trait]
impl FlowRunner for AwaitInputRunner {
    async fn run(&self, ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
        match ctx.step() {
            None | Some("start") => {
                let owner = ctx.flow().owner_entity;
                let spec = ctx.await_input(name_request_for(owner)).await?;
                ctx.set_step("await-address");
                Ok(StepOutcome::Suspend(spec))
            }
            Some("await-address") => match ctx.last_event() {
                Some((kind, _)) if kind == events::REQUEST_ANSWERED => {
                    ctx.set_step("done");
                    Ok(StepOutcome::Done)
                }
                Some((kind, _))
                    if kind == events::REQUEST_CANCELLED
                        || kind == events::REQUEST_EXPIRED
                        || kind == "timeout" =>
                {
                    Ok(StepOutcome::Fail(format!("input not provided: {kind}")))
                }
                _ => Ok(StepOutcome::Continue),
            },
            Some(_) => Ok(StepOutcome::Done),
        }
    }
}
