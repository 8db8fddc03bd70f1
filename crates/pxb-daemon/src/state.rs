//! Shared daemon state.
//!
//! Handlers receive `State<Arc<AppState>>`; this module owns nothing async
//! itself.

use std::sync::Arc;

use pxb_auth::TokenVerifier;
use pxb_runtime::Broker;
use serde::{Deserialize, Serialize};

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

pub struct AppState {
    pub broker: Arc<Broker>,
    pub verifier: TokenVerifier,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(broker: Arc<Broker>) -> Arc<Self> {
        let verifier = TokenVerifier::new(
            broker.config.token_secret.clone(),
            broker.config.dev_header_auth,
        );
        Arc::new(Self {
            broker,
            verifier,
            build: BuildInfo {
                service: "pxbox",
                version: env!("CARGO_PKG_VERSION"),
            },
        })
    }
}
