/// Message schemas consumed off the queue
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A single file carried inline with an email job. `data` is base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: String,
}

/// The delivery payload: everything needed to assemble one outgoing email.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub is_html: bool,
    #[serde(default)]
    pub attachments: Vec<EmailAttachment>,
}

/// The envelope consumed off the queue. `idempotency_key` is the identity
/// used for at-most-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailSinkMessage {
    pub idempotency_key: String,
    pub payload: EmailMessage,
}

impl EmailMessage {
    /// Checks the payload is deliverable: at least one non-blank recipient
    /// and a non-blank body. Logs each defect, returns a single verdict.
    pub fn validate(&self, worker_id: usize) -> bool {
        let mut valid = true;

        if self.to.is_empty() {
            warn!(worker = worker_id, "missing 'to' recipients");
            valid = false;
        } else if self.to.iter().any(|addr| addr.trim().is_empty()) {
            warn!(worker = worker_id, "blank 'to' recipient found");
            valid = false;
        }

        if self.body.trim().is_empty() {
            warn!(worker = worker_id, "missing 'body'");
            valid = false;
        }

        valid
    }
}
