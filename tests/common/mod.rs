//! Common test utilities and helpers for integration tests
#![allow(dead_code)]

use mailsink::SinkContext;
use mailsink::services::config::Config;
use mailsink::services::idempotency::IdempotencyStore;
use mailsink::services::mailer::Mailer;
use std::sync::Arc;

/// Context over test doubles; no broker, store, or relay required.
pub fn test_context(store: Arc<dyn IdempotencyStore>, mailer: Arc<dyn Mailer>) -> SinkContext {
    SinkContext::with_parts(Config::default(), store, mailer)
}

/// Generate a unique idempotency key for tests
pub fn unique_key() -> String {
    format!("test-{}", uuid::Uuid::new_v4())
}

/// Wire-form envelope with a plain-text body and one recipient
pub fn envelope(key: &str, to: &[&str], body: &str) -> Vec<u8> {
    serde_json::json!({
        "idempotencyKey": key,
        "payload": {
            "to": to,
            "body": body,
            "isHtml": false,
        }
    })
    .to_string()
    .into_bytes()
}
