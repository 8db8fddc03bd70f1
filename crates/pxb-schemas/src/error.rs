//! Error taxonomy shared by every layer.
//!
//! Each variant carries a stable machine-readable `code` and maps to one HTTP
//! status. Services return these unmodified; transports translate them into
//! `{error, code, message}` bodies or session `error` envelopes.

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("flow not found: {0}")]
    FlowNotFound(Uuid),

    /// Schema preparation failed (compile error or reference not allowlisted).
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    /// Response payload fails the request's compiled schema.
    #[error("payload does not satisfy the request schema at: {}", paths.join(", "))]
    SchemaViolation { paths: Vec<String> },

    #[error("file policy violation: {0}")]
    FilePolicyViolation(String),

    /// Claim raced and lost, or the request already left PENDING.
    #[error("claim conflict: request {0} is not PENDING")]
    ClaimConflict(Uuid),

    /// Mutation attempted on a terminal row, or along a missing edge.
    #[error("invalid transition: {id} is {state}")]
    InvalidTransition { id: Uuid, state: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::InvalidInput(_) => "invalid-input",
            BrokerError::Unauthorized(_) => "unauthorized",
            BrokerError::EntityNotFound(_) => "entity-not-found",
            BrokerError::RequestNotFound(_) => "request-not-found",
            BrokerError::FlowNotFound(_) => "flow-not-found",
            BrokerError::SchemaInvalid(_) => "schema-invalid",
            BrokerError::SchemaViolation { .. } => "schema-violation",
            BrokerError::FilePolicyViolation(_) => "file-policy-violation",
            BrokerError::ClaimConflict(_) => "claim-conflict",
            BrokerError::InvalidTransition { .. } => "invalid-transition",
            BrokerError::StorageUnavailable(_) => "storage-unavailable",
            BrokerError::Internal(_) => "internal",
        }
    }

    /// HTTP status for the request/response surface.
    pub fn http_status(&self) -> u16 {
        match self {
            BrokerError::InvalidInput(_)
            | BrokerError::SchemaInvalid(_)
            | BrokerError::FilePolicyViolation(_) => 400,
            BrokerError::Unauthorized(_) => 401,
            BrokerError::EntityNotFound(_)
            | BrokerError::RequestNotFound(_)
            | BrokerError::FlowNotFound(_) => 404,
            BrokerError::ClaimConflict(_) | BrokerError::InvalidTransition { .. } => 409,
            BrokerError::SchemaViolation { .. } => 422,
            BrokerError::StorageUnavailable(_) | BrokerError::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let id = Uuid::nil();
        let cases: Vec<(BrokerError, &str, u16)> = vec![
            (BrokerError::InvalidInput("x".into()), "invalid-input", 400),
            (BrokerError::Unauthorized("x".into()), "unauthorized", 401),
            (
                BrokerError::EntityNotFound("x".into()),
                "entity-not-found",
                404,
            ),
            (BrokerError::RequestNotFound(id), "request-not-found", 404),
            (BrokerError::FlowNotFound(id), "flow-not-found", 404),
            (BrokerError::SchemaInvalid("x".into()), "schema-invalid", 400),
            (
                BrokerError::SchemaViolation { paths: vec![] },
                "schema-violation",
                422,
            ),
            (
                BrokerError::FilePolicyViolation("x".into()),
                "file-policy-violation",
                400,
            ),
            (BrokerError::ClaimConflict(id), "claim-conflict", 409),
            (
                BrokerError::InvalidTransition {
                    id,
                    state: "ANSWERED".into(),
                },
                "invalid-transition",
                409,
            ),
            (
                BrokerError::StorageUnavailable("x".into()),
                "storage-unavailable",
                500,
            ),
            (BrokerError::Internal("x".into()), "internal", 500),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.http_status(), status);
        }
    }

    #[test]
    fn violation_message_includes_paths() {
        let err = BrokerError::SchemaViolation {
            paths: vec!["/name".into(), "/age".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("/name"));
        assert!(msg.contains("/age"));
    }
}
