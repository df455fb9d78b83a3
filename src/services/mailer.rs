/// SMTP delivery via lettre
///
/// Assembles a MIME message from an `EmailMessage` and hands it to the
/// relay in a single dial-and-send. The transport is built per send, so
/// concurrent workers never share SMTP state.
use crate::models::{EmailAttachment, EmailMessage};
use crate::services::config::Config;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum MailError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("message assembly failed: {0}")]
    Assembly(#[from] lettre::error::Error),

    #[error("smtp transport failure: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("{0}")]
    Unknown(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &EmailMessage) -> Result<(), MailError>;
}

/// Relay client configured from the SMTP_* environment.
pub struct SmtpMailer {
    server: String,
    port: u16,
    user: String,
    pass: String,
    use_tls: bool,
}

impl SmtpMailer {
    pub fn new(config: &Config) -> Self {
        Self {
            server: config.smtp_server.clone(),
            port: config.smtp_port(),
            user: config.smtp_user.clone(),
            pass: config.smtp_pass.clone(),
            use_tls: config.smtp_use_ssl,
        }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailError> {
        let mut builder = if self.use_tls {
            // TLS-wrapped session with certificate verification
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.server)?
        } else {
            // plain session, upgraded opportunistically; the relay is
            // expected to sit inside the same trust boundary
            let tls = TlsParameters::builder(self.server.clone())
                .dangerous_accept_invalid_certs(true)
                .build()?;
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.server)
                .tls(Tls::Opportunistic(tls))
        };

        builder = builder.port(self.port);

        if !self.user.is_empty() {
            builder = builder.credentials(Credentials::new(self.user.clone(), self.pass.clone()));
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &EmailMessage) -> Result<(), MailError> {
        let message = build_message(email, &self.user)?;

        info!(
            to = ?email.to,
            cc = ?email.cc,
            bcc = ?email.bcc,
            subject = %email.subject,
            is_html = email.is_html,
            attachments = email.attachments.len(),
            "sending email"
        );

        self.transport()?.send(message).await?;
        Ok(())
    }
}

/// Builds the MIME message. `From` is the relay account; recipient headers
/// are set only when their list is non-empty, preserving producer order.
pub fn build_message(email: &EmailMessage, from: &str) -> Result<Message, MailError> {
    let mut builder = Message::builder()
        .from(from.parse::<Mailbox>()?)
        .subject(&email.subject);

    for to in &email.to {
        builder = builder.to(to.trim().parse()?);
    }
    for cc in &email.cc {
        builder = builder.cc(cc.trim().parse()?);
    }
    for bcc in &email.bcc {
        builder = builder.bcc(bcc.trim().parse()?);
    }

    let body_type = if email.is_html {
        ContentType::TEXT_HTML
    } else {
        ContentType::TEXT_PLAIN
    };
    let body_part = SinglePart::builder()
        .header(body_type)
        .body(email.body.clone());

    let attachment_parts = decode_attachments(&email.attachments);

    let message = if attachment_parts.is_empty() {
        builder.singlepart(body_part)?
    } else {
        let mut multipart = MultiPart::mixed().singlepart(body_part);
        for part in attachment_parts {
            multipart = multipart.singlepart(part);
        }
        builder.multipart(multipart)?
    };

    Ok(message)
}

/// Decodes attachment payloads. An attachment that fails base64 decoding
/// is dropped with a warning; the rest of the message still goes out.
fn decode_attachments(attachments: &[EmailAttachment]) -> Vec<SinglePart> {
    let mut parts = Vec::with_capacity(attachments.len());

    for attachment in attachments {
        let data = match BASE64.decode(&attachment.data) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    filename = %attachment.filename,
                    error = %e,
                    "failed to decode attachment, skipping"
                );
                continue;
            }
        };

        let content_type = attachment
            .content_type
            .parse::<ContentType>()
            .or_else(|_| "application/octet-stream".parse());
        let Ok(content_type) = content_type else {
            warn!(filename = %attachment.filename, "unusable attachment content type, skipping");
            continue;
        };

        parts.push(Attachment::new(attachment.filename.clone()).body(data, content_type));
    }

    parts
}

/// Test double: records what would have been sent and can be told to fail
/// the first N sends.
#[derive(Default)]
pub struct MockMailer {
    sent: tokio::sync::Mutex<Vec<EmailMessage>>,
    failures_remaining: std::sync::atomic::AtomicU32,
}

impl MockMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mailer whose first `times` sends fail with a transport-style error.
    pub fn failing(times: u32) -> Self {
        Self {
            sent: tokio::sync::Mutex::new(Vec::new()),
            failures_remaining: std::sync::atomic::AtomicU32::new(times),
        }
    }

    pub async fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send(&self, email: &EmailMessage) -> Result<(), MailError> {
        use std::sync::atomic::Ordering;

        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(MailError::Unknown("injected smtp failure".to_string()));
        }

        self.sent.lock().await.push(email.clone());
        Ok(())
    }
}
