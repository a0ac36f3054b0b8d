//! Messaging fabric clients
//!
//! Two fabrics share the envelope from `colloquy-core`:
//! - [`EphemeralBus`]: subject-based, low-latency request/reply and pub/sub
//!   with no retention guarantees (core NATS).
//! - [`DurableLog`]: topic-based, persistent log with keyed ordering,
//!   competing consumers and dead-letter topics (NATS JetStream).

pub mod durable;
pub mod ephemeral;
mod error;

pub use durable::{ConsumeAction, DurableLog, DurableLogConfig, InitialPosition, MessageMeta};
pub use ephemeral::{EphemeralBus, EphemeralBusConfig};
pub use error::BusError;
