// src/lib.rs
// Connection and channel lifecycle management for RabbitMQ clients.
//
// Two pieces: `ConnectionRegistry` tracks one shared connection per scope
// (a default scope plus caller-defined connection types) with lazy,
// race-safe get-or-create and stale replacement; `ChannelFactory` derives
// fresh channels from it, assuring the target queue and optional exchange
// binding exist before handing the channel to the caller. Publishing,
// consuming, and payload handling stay with the caller.

pub mod channel;
pub mod config;
pub mod errors;
pub mod registry;
mod shutdown;

// Re-export specific items to simplify imports elsewhere
pub use channel::{ChannelFactory, ExchangeSpec, QueueOptions};
pub use config::BrokerConfig;
pub use errors::{BrokerError, Result};
pub use registry::{ConnectionRegistry, ConnectionType};
