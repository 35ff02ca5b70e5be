//! Session tracking.

pub mod manager;
pub mod registry;

pub use manager::SessionManager;
pub use registry::{SessionCounters, SessionRegistry, TimeoutCallback};
