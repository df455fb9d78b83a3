// Library root - exports public API

pub mod broker;
pub mod constants;
pub mod context;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;

// Re-export commonly used types
pub use context::SinkContext;
pub use error::MailSinkError;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
