//! Outbound task queue.

pub mod memory;

pub use memory::{DEFAULT_QUEUE_CAPACITY, PriorityMessageQueue, QueueFull};
