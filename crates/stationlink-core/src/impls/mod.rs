//! Impls - ports の実装（開発・テスト用）

pub mod flaky;
pub mod inmem_transport;

pub use self::flaky::FlakyTransport;
pub use self::inmem_transport::{InMemoryFeed, InMemoryTransport, LoopbackNetwork, RecordingTransport};
