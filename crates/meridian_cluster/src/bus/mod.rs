//! Subject bus: named-channel publish/subscribe/request between nodes.
//!
//! The bus is the only transport the cluster plane uses. A deployment runs
//! one [`Broker`] (standalone or embedded in the master process); every node
//! holds one [`BusClient`]. Subjects are flat strings; request/reply is
//! built from pub/sub with per-request `_INBOX.*` subjects, so the broker
//! itself only ever forwards.
//!
//! Delivery is at-most-once and ordered per subject per publisher; nothing
//! is ordered across distinct subjects.

mod broker;
mod client;
mod frame;

pub use broker::Broker;
pub use client::{BusClient, BusMessage, BusOptions, Subscription};
