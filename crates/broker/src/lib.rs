#![forbid(unsafe_code)]

//! The broker: engine orchestration over the store, the pending-fetch queue
//! and its schedulers, and the Kafka-wire connection server.

pub mod async_transport;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod pending;
pub mod scheduler;
pub mod security;
pub mod transport;

pub use async_transport::BrokerServer;
pub use config::{Config, ConfigError, StorageBackend};
pub use engine::{Engine, EngineError};
pub use metrics::TransportMetrics;
pub use pending::{PendingFetch, PendingQueue};
pub use scheduler::Schedulers;
pub use transport::{ConnectionState, Dispatch, Transport, TransportError};

/// Milliseconds since the Unix epoch, the timestamp unit used across the
/// store and the wire.
pub fn now_ms() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0_u128, |elapsed| elapsed.as_millis());
    i64::try_from(now).unwrap_or(i64::MAX)
}
