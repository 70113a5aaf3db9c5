//! Realtime connection management: one shared duplex socket, a
//! subscription registry that survives reconnects, and queued
//! subscriptions for consumers that arrive before the socket is open.

pub mod connection;
pub mod frames;
pub mod registry;

pub use connection::{
    ConnectionState, RealtimeConnectionManager, RealtimeOptions, SubscriptionHandle,
};
pub use registry::{Payload, SubscriptionRegistry};
