pub mod gateway;
pub mod health;
pub mod ratelimit;
pub mod ws;

pub use gateway::{AppState, Gateway};
pub use health::{HealthRegistry, NamedCheck};
pub use ratelimit::RequestRateLimiter;
