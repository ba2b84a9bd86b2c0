#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON logging and event publishing shared by the Argus services.

/// JSON-lines logger and log records.
pub mod log;

/// Event records and publishers.
pub mod events;

pub use events::{EventPublisher, EventRecord, FileEventPublisher, MemoryEventBus};
pub use log::{JsonLogger, LogLevel, LogRecord};
