/// Per-message processing pipeline
pub mod processor;

pub use processor::{Disposition, process_message};
