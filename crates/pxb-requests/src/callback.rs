//! Webhook callback delivery.
//!
//! Fires after the state write commits; failures log and never touch the
//! mutation. The body is signed with the request's callback secret so the
//! receiver can authenticate the origin.

use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// `sha256(secret || body)`, hex. Sent as `X-PxBox-Signature`.
pub fn sign_callback_body(secret: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

/// POST the payload with bounded retry. Detached: the caller has already
/// committed its state change.
pub fn spawn_delivery(
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
    payload: Value,
) {
    tokio::spawn(async move {
        let body = payload.to_string();
        let mut delay = Duration::from_millis(250);
        for attempt in 1..=3u32 {
            let mut req = client
                .post(&url)
                .header("content-type", "application/json")
                .body(body.clone());
            if let Some(secret) = &secret {
                req = req.header("X-PxBox-Signature", sign_callback_body(secret, &body));
            }
            match req.timeout(Duration::from_secs(10)).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(%url, attempt, "callback delivered");
                    return;
                }
                Ok(resp) => {
                    warn!(%url, attempt, status = %resp.status(), "callback rejected");
                }
                Err(e) => {
                    warn!(%url, attempt, error = %e, "callback delivery failed");
                }
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::sign_callback_body;

    #[test]
    fn signature_is_deterministic_and_secret_bound() {
        let a = sign_callback_body("s1", r#"{"kind":"request.answered"}"#);
        let b = sign_callback_body("s1", r#"{"kind":"request.answered"}"#);
        let c = sign_callback_body("s2", r#"{"kind":"request.answered"}"#);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
