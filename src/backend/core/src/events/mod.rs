//! Event Sourcing System
//!
//! - **`event`**: Domain events, stream identifiers and the metadata envelope.
//! - **`store`**: The append-only `EventStore` with optimistic concurrency per stream.
//! - **`bus`**: In-process fan-out of committed events to subscribed handlers.

pub mod bus;
pub mod event;
pub mod store;

pub use bus::*;
pub use event::*;
pub use store::*;
