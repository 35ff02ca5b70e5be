//! stationlink-core
//!
//! Message plumbing for cooperating production-line stations.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, priority, message, task, session, errors, records）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, Transport, InboundFeed）
//! - **queue**: 優先度付き送信キュー
//! - **session**: プロトコルセッションの状態機械とタイムアウト掃除
//! - **recovery**: エラー分類・リカバリ戦略・優先度ルール
//! - **protocol**: 受信ハンドラとその登録簿（material_transfer）
//! - **store**: SQLite の記録ストア（履歴・統計・バックアップ・エクスポート）
//! - **app**: 上記を束ねるディスパッチャと背景ループ
//! - **impls**: 開発・テスト用の実装（ループバック網、故障注入）

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod protocol;
pub mod queue;
pub mod recovery;
pub mod session;
pub mod store;

pub use app::{Dispatcher, DispatcherBuilder};
pub use config::Config;
