/// Shared per-process state handed to every worker
use crate::error::MailSinkError;
use crate::services::config::Config;
use crate::services::idempotency::{IdempotencyStore, RedisIdempotencyStore};
use crate::services::mailer::{Mailer, SmtpMailer};
use std::sync::Arc;
use tracing::info;

/// Built once in `main`, shared read-only across workers. The store handle
/// is connection-pooled; the mailer dials per send.
pub struct SinkContext {
    pub config: Config,
    pub store: Arc<dyn IdempotencyStore>,
    pub mailer: Arc<dyn Mailer>,
}

impl SinkContext {
    /// Connects the key-value store (with a reachability check) and
    /// prepares the SMTP relay client. Any failure here is a fatal
    /// startup error.
    pub async fn initialize(config: Config) -> Result<Self, MailSinkError> {
        let store = RedisIdempotencyStore::connect(&config.redis_url())
            .await
            .map_err(|e| MailSinkError::KeyValueStore(e.to_string()))?;
        store
            .ping()
            .await
            .map_err(|e| MailSinkError::KeyValueStore(e.to_string()))?;
        info!(host = %config.redis_host, db = config.redis_db, "connected to key-value store");

        let mailer = SmtpMailer::new(&config);

        Ok(Self {
            config,
            store: Arc::new(store),
            mailer: Arc::new(mailer),
        })
    }

    /// Assembles a context from parts; used by tests to substitute doubles.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn IdempotencyStore>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            config,
            store,
            mailer,
        }
    }
}
