//! Event contracts shared by the domain and the history store.
//!
//! - [`Event`]: typed domain events know their stable type name and payload
//! - [`EventEnvelope`]: the persisted, sequenced form of an event
//! - [`EventBus`]: post-commit notification fan-out

mod bus;
mod envelope;
mod event;
mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{DEFAULT_SUBSCRIBER_CAPACITY, InMemoryBusError, InMemoryEventBus};
