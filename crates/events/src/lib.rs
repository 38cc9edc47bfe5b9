pub mod hub;
pub mod log;
pub mod publisher;
pub mod retention;
pub mod webhook;

pub use hub::{EventHub, HubConfig, HubOutbound};
pub use log::{EventLogService, ReplayOutcome};
pub use publisher::EventPublisher;
pub use retention::{RetentionConfig, RetentionJob};
pub use webhook::WebhookPublisher;
