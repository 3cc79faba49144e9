//! `entitle-events`: event mechanics shared by the billing engine and its observers.
//!
//! The reconciler publishes every observable transition as an event. Observers
//! (loggers, audit sinks, tests) subscribe through an [`EventBus`]; delivery is
//! at-least-once and consumers are expected to be idempotent.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
