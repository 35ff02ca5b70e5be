//! App - アプリケーション層
//!
//! ports・queue・session・recovery・store を組み合わせてディスパッチャにする。
//!
//! # 主要コンポーネント
//! - **DispatcherBuilder**: 構築とワイヤリング（起動時検証）
//! - **Dispatcher**: 送信キュー・受信ルーティング・セッション操作の窓口
//! - **worker_loop**: 送信キューの配送ループ
//! - **run_loop**: 受信の取り込みとセッション掃除
//! - **backup_loop**: 定期バックアップ

pub mod builder;
pub mod dispatcher;
pub mod status;

mod backup_loop;
mod run_loop;
mod worker_loop;

pub use self::builder::{BuildError, DispatcherBuilder};
pub use self::dispatcher::{DeliveryOutcome, Dispatcher, EnqueueOptions};
pub use self::status::DispatcherStatistics;
