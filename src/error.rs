/// Error types for the mail sink
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailSinkError {
    #[error("invalid message schema: {0}")]
    InvalidSchema(String),

    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("key-value store failure: {0}")]
    KeyValueStore(String),

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl MailSinkError {
    /// Determines whether the broker should redeliver the message.
    ///
    /// Permanent failures are acked and dropped; everything else cycles
    /// through the retry queue until the retry budget runs out.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::InvalidSchema(_) | Self::Config(_))
    }
}
