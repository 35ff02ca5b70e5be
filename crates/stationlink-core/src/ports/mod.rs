//! Ports - 抽象化レイヤー
//!
//! 外部の協調者（時刻・ID 発行・配送）へのインターフェースを定義します。
//! 実装は `impls` に置き、テストでは差し替えます。

pub mod clock;
pub mod id_generator;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::transport::{InboundFeed, Transport, TransportError};
