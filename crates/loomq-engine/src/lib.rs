#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! The `loomq` engine: an AMQP broker client, the per-message worker loop, the pure scaling
//! policy, and the supervisor that ties them into a self-scaling pool.

/// Public API for the engine crate.
pub mod api;

/// AMQP broker client used by workers to consume and publish messages.
pub mod broker;
mod policy;
mod supervisor;
mod worker;

pub use api::{
    start_supervisor, ScaleAction, StatusSnapshot, SupervisorConfig, SupervisorEvent,
    SupervisorHandle,
};
pub use broker::{AmqpBroker, Broker, BrokerError};
pub use policy::{decide, Decision, Direction, Tier};
