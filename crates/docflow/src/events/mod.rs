//! Event channel connecting ingestion to indexing

mod bus;

pub use bus::{publish_json, Consumer, EventBus, EventPublisher, Message, Receipt, DEFAULT_RETENTION};
