//! Persistence layer: trigger, event, and execution stores over SQLite.
//!
//! The stores are the only code that touches the four tables; the scheduler
//! and daemon go through these APIs exclusively.

pub mod events;
pub mod executions;
pub mod triggers;

pub use events::{Event, EventFilters, EventStore, NewEvent};
pub use executions::{ExecutionFilters, ExecutionStore, TriggerExecution};
pub use triggers::{CreateTrigger, Trigger, TriggerFilters, TriggerStore, UpdateTrigger};
