/// External collaborators: configuration, key-value store, SMTP relay
pub mod config;
pub mod idempotency;
pub mod mailer;

// Re-export service traits
pub use config::Config;
pub use idempotency::IdempotencyStore;
pub use mailer::Mailer;
