/// Per-message pipeline: parse, claim, validate, send, finalize
///
/// The pipeline is side-effect-bearing but deterministic in outcome
/// classification: the worker's state machine acts on the returned error
/// kind alone, never on error message text.
use crate::constants::{CLAIM_TTL_SECONDS, PROCESSED_TTL_SECONDS};
use crate::context::SinkContext;
use crate::error::MailSinkError;
use crate::models::MailSinkMessage;
use crate::services::idempotency::ClaimOutcome;
use std::time::Duration;
use tracing::{error, info};

/// How a message that completed without error was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The email went out through the relay on this delivery.
    Delivered,
    /// Another worker owns or has completed this key; nothing was sent.
    Duplicate,
}

pub async fn process_message(
    worker_id: usize,
    body: &[u8],
    ctx: &SinkContext,
) -> Result<Disposition, MailSinkError> {
    let message: MailSinkMessage = serde_json::from_slice(body).map_err(|e| {
        error!(
            worker = worker_id,
            error = %e,
            raw = %String::from_utf8_lossy(body),
            "failed to parse message JSON"
        );
        MailSinkError::InvalidSchema(e.to_string())
    })?;

    let key = message.idempotency_key.as_str();
    if key.trim().is_empty() {
        error!(worker = worker_id, "blank idempotency key");
        return Err(MailSinkError::InvalidSchema(
            "blank idempotency key".to_string(),
        ));
    }

    let claim = ctx
        .store
        .claim(key, Duration::from_secs(CLAIM_TTL_SECONDS))
        .await
        .map_err(|e| {
            error!(worker = worker_id, key, error = %e, "failed to write idempotency claim");
            MailSinkError::KeyValueStore(e.to_string())
        })?;
    if claim == ClaimOutcome::AlreadyPresent {
        info!(
            worker = worker_id,
            key, "message already processed or in flight, skipping"
        );
        return Ok(Disposition::Duplicate);
    }

    if !message.payload.validate(worker_id) {
        return Err(MailSinkError::InvalidSchema(
            "payload failed validation".to_string(),
        ));
    }

    info!(
        worker = worker_id,
        key,
        to = ?message.payload.to,
        subject = %message.payload.subject,
        is_html = message.payload.is_html,
        "processing email message"
    );

    if let Err(e) = ctx.mailer.send(&message.payload).await {
        error!(worker = worker_id, key, error = %e, "failed to send email");
        // A claim left in place would short-circuit every redelivery as a
        // duplicate until its TTL expires.
        if let Err(release_err) = ctx.store.release(key).await {
            error!(
                worker = worker_id,
                key,
                error = %release_err,
                "failed to release idempotency claim after send failure"
            );
        }
        return Err(MailSinkError::Transient(e.to_string()));
    }

    // The email is already sent; a finalize failure must not turn the
    // outcome into a retry.
    if let Err(e) = ctx
        .store
        .finalize(key, Duration::from_secs(PROCESSED_TTL_SECONDS))
        .await
    {
        error!(
            worker = worker_id,
            key,
            error = %e,
            "failed to finalize idempotency key (email already sent)"
        );
    } else {
        info!(worker = worker_id, key, "message processed and key finalized");
    }

    Ok(Disposition::Delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::config::Config;
    use crate::services::idempotency::{
        CLAIM_VALUE, ClaimOutcome, IdempotencyStore, InMemoryIdempotencyStore, PROCESSED_VALUE,
        StoreError,
    };
    use crate::services::mailer::MockMailer;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn context(store: Arc<dyn IdempotencyStore>, mailer: Arc<MockMailer>) -> SinkContext {
        SinkContext::with_parts(Config::default(), store, mailer)
    }

    fn valid_body(key: &str) -> Vec<u8> {
        format!(
            r#"{{"idempotencyKey":"{key}","payload":{{"to":["a@x"],"body":"hi","isHtml":false}}}}"#
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_happy_path_delivers_and_finalizes() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let mailer = Arc::new(MockMailer::new());
        let ctx = context(store.clone(), mailer.clone());

        let result = process_message(0, &valid_body("k1"), &ctx).await;

        assert_eq!(result.unwrap(), Disposition::Delivered);
        assert_eq!(mailer.sent_count().await, 1);
        assert_eq!(store.value_of("k1").await.as_deref(), Some(PROCESSED_VALUE));
        assert_eq!(store.claim_calls(), 1);
        assert_eq!(store.finalize_calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_short_circuits_without_sending() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let mailer = Arc::new(MockMailer::new());
        let ctx = context(store.clone(), mailer.clone());

        let first = process_message(0, &valid_body("k1"), &ctx).await;
        let second = process_message(1, &valid_body("k1"), &ctx).await;

        assert_eq!(first.unwrap(), Disposition::Delivered);
        assert_eq!(second.unwrap(), Disposition::Duplicate);
        assert_eq!(mailer.sent_count().await, 1);
        assert_eq!(store.claim_calls(), 2);
        assert_eq!(store.finalize_calls(), 1);
    }

    #[tokio::test]
    async fn test_bad_json_touches_neither_store_nor_mailer() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let mailer = Arc::new(MockMailer::new());
        let ctx = context(store.clone(), mailer.clone());

        let result = process_message(0, b"not-json", &ctx).await;

        assert!(matches!(result, Err(MailSinkError::InvalidSchema(_))));
        assert_eq!(store.claim_calls(), 0);
        assert_eq!(store.finalize_calls(), 0);
        assert_eq!(mailer.sent_count().await, 0);
    }

    #[tokio::test]
    async fn test_blank_idempotency_key_is_invalid_before_claim() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let mailer = Arc::new(MockMailer::new());
        let ctx = context(store.clone(), mailer.clone());

        let result = process_message(0, &valid_body("  "), &ctx).await;

        assert!(matches!(result, Err(MailSinkError::InvalidSchema(_))));
        assert_eq!(store.claim_calls(), 0);
    }

    #[tokio::test]
    async fn test_validation_failure_keeps_the_claim() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let mailer = Arc::new(MockMailer::new());
        let ctx = context(store.clone(), mailer.clone());

        let body = br#"{"idempotencyKey":"k4","payload":{"to":[],"body":"x"}}"#;
        let result = process_message(0, body, &ctx).await;

        assert!(matches!(result, Err(MailSinkError::InvalidSchema(_))));
        assert_eq!(mailer.sent_count().await, 0);
        // the claim is written before validation and is not rolled back;
        // a republish of the same key short-circuits until the TTL expires
        assert_eq!(store.value_of("k4").await.as_deref(), Some(CLAIM_VALUE));
    }

    #[tokio::test]
    async fn test_smtp_failure_is_transient_and_releases_the_claim() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let mailer = Arc::new(MockMailer::failing(1));
        let ctx = context(store.clone(), mailer.clone());

        let result = process_message(0, &valid_body("k5"), &ctx).await;

        assert!(matches!(result, Err(MailSinkError::Transient(_))));
        assert_eq!(store.finalize_calls(), 0);
        // the claim is freed so the redelivery is not mistaken for a
        // duplicate
        assert_eq!(store.value_of("k5").await, None);
    }

    #[tokio::test]
    async fn test_redelivery_after_smtp_failure_sends() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let mailer = Arc::new(MockMailer::failing(2));
        let ctx = context(store.clone(), mailer.clone());

        assert!(process_message(0, &valid_body("k5"), &ctx).await.is_err());
        assert!(process_message(1, &valid_body("k5"), &ctx).await.is_err());
        let third = process_message(0, &valid_body("k5"), &ctx).await;

        assert_eq!(third.unwrap(), Disposition::Delivered);
        assert_eq!(mailer.sent_count().await, 1);
        assert_eq!(store.value_of("k5").await.as_deref(), Some(PROCESSED_VALUE));
    }

    /// Store whose claim always errors, modeling an unreachable backend.
    struct DownStore;

    #[async_trait]
    impl IdempotencyStore for DownStore {
        async fn claim(&self, _: &str, _: Duration) -> Result<ClaimOutcome, StoreError> {
            Err(injected_error())
        }

        async fn finalize(&self, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(injected_error())
        }

        async fn release(&self, _: &str) -> Result<(), StoreError> {
            Err(injected_error())
        }
    }

    /// Store that claims fine but fails every finalize.
    struct FinalizeFailsStore {
        inner: InMemoryIdempotencyStore,
    }

    #[async_trait]
    impl IdempotencyStore for FinalizeFailsStore {
        async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, StoreError> {
            self.inner.claim(key, ttl).await
        }

        async fn finalize(&self, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(injected_error())
        }

        async fn release(&self, key: &str) -> Result<(), StoreError> {
            self.inner.release(key).await
        }
    }

    fn injected_error() -> StoreError {
        StoreError::Backend(redis::RedisError::from(std::io::Error::other(
            "store offline",
        )))
    }

    #[tokio::test]
    async fn test_claim_error_maps_to_key_value_store_failure() {
        let mailer = Arc::new(MockMailer::new());
        let ctx = context(Arc::new(DownStore), mailer.clone());

        let result = process_message(0, &valid_body("k6"), &ctx).await;

        assert!(matches!(result, Err(MailSinkError::KeyValueStore(_))));
        assert_eq!(mailer.sent_count().await, 0);
    }

    #[tokio::test]
    async fn test_finalize_error_does_not_change_the_outcome() {
        let store = Arc::new(FinalizeFailsStore {
            inner: InMemoryIdempotencyStore::new(),
        });
        let mailer = Arc::new(MockMailer::new());
        let ctx = context(store, mailer.clone());

        let result = process_message(0, &valid_body("k7"), &ctx).await;

        assert_eq!(result.unwrap(), Disposition::Delivered);
        assert_eq!(mailer.sent_count().await, 1);
    }
}
