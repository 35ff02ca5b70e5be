//! Record store: SQLite-backed history, statistics, backup and export.

pub mod backup;
pub mod error;
pub mod export;
pub mod migrations;
pub mod record_store;
pub mod stats;

pub use backup::{BackupState, backup_id_for};
pub use error::{StoreError, StoreResult};
pub use export::{DateRange, ExportDocument, ExportFormat};
pub use record_store::{CleanupReport, DEFAULT_HISTORY_LIMIT, HistoryQuery, RecordStore};
pub use stats::{ErrorStatistics, MessageStatistics, SessionStatistics, StoreStatistics};
