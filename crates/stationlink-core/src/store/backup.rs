//! Backup / restore
//!
//! バックアップは `VACUUM INTO` で `backup_<id>.db` を書き出し、横に統計スナップショット
//! `state_<id>.json` を置く。リストアは ATTACH したバックアップから 1 トランザクションで
//! 全テーブルを入れ替える。途中で失敗すればロールバックされ、元のデータが残る。

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::{RecordStore, StoreError, StoreResult, StoreStatistics};

const BACKUP_PREFIX: &str = "backup_";
const STATE_PREFIX: &str = "state_";
const TABLES: [&str; 4] = ["messages", "errors", "sessions", "daily_stats"];

/// Statistics window recorded in the state file.
const STATE_STATISTICS_DAYS: u32 = 7;

/// Side file written next to each backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupState {
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    pub database_path: Option<PathBuf>,
    pub statistics: StoreStatistics,
}

/// Resets the pause flag when the restore ends, however it ends.
struct PauseGuard<'a>(&'a RecordStore);

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.0.backups_paused.store(false, Ordering::SeqCst);
    }
}

impl RecordStore {
    pub fn backup_path(&self, backup_id: &str) -> PathBuf {
        self.backup_dir.join(format!("{BACKUP_PREFIX}{backup_id}.db"))
    }

    pub fn state_path(&self, backup_id: &str) -> PathBuf {
        self.backup_dir.join(format!("{STATE_PREFIX}{backup_id}.json"))
    }

    /// Write a consistent copy of the database and return its id.
    pub fn create_backup(&self) -> StoreResult<String> {
        std::fs::create_dir_all(&self.backup_dir)?;

        let now = self.clock.now();
        let base_id = backup_id_for(now);
        let mut backup_id = base_id.clone();
        let mut suffix = 1;
        while self.backup_path(&backup_id).exists() {
            backup_id = format!("{base_id}_{suffix}");
            suffix += 1;
        }
        let path = self.backup_path(&backup_id);

        {
            let conn = self.conn.lock();
            conn.execute("VACUUM INTO ?1", params![path.to_string_lossy().into_owned()])?;
        }

        let state = BackupState {
            backup_id: backup_id.clone(),
            timestamp: now,
            database_path: self.db_path.clone(),
            statistics: self.get_statistics(STATE_STATISTICS_DAYS)?,
        };
        std::fs::write(self.state_path(&backup_id), serde_json::to_string_pretty(&state)?)?;

        self.observer.in_scope(|| {
            info!(backup_id = %backup_id, path = %path.display(), "Backup created")
        });
        Ok(backup_id)
    }

    /// Replace every table with the contents of backup `backup_id`.
    /// Automatic backups are paused until this returns.
    pub fn restore_from_backup(&self, backup_id: &str) -> StoreResult<()> {
        let path = self.backup_path(backup_id);
        if !is_backup_id(backup_id) || !path.exists() {
            return Err(StoreError::NotFound(format!("backup {backup_id}")));
        }

        self.backups_paused.store(true, Ordering::SeqCst);
        let _resume = PauseGuard(self);

        let mut conn = self.conn.lock();
        conn.execute(
            "ATTACH DATABASE ?1 AS snapshot",
            params![path.to_string_lossy().into_owned()],
        )?;

        let restored = (|| -> StoreResult<()> {
            let tx = conn.transaction()?;
            for table in TABLES {
                tx.execute(&format!("DELETE FROM main.{table}"), [])?;
                tx.execute(
                    &format!("INSERT INTO main.{table} SELECT * FROM snapshot.{table}"),
                    [],
                )?;
            }
            tx.commit()?;
            Ok(())
        })();

        if let Err(e) = conn.execute("DETACH DATABASE snapshot", []) {
            self.observer
                .in_scope(|| warn!(error = %e, "Failed to detach backup database"));
        }
        drop(conn);

        match &restored {
            Ok(()) => self
                .observer
                .in_scope(|| info!(backup_id, "Restored from backup")),
            Err(e) => self
                .observer
                .in_scope(|| warn!(backup_id, error = %e, "Restore failed, data left unchanged")),
        }
        restored
    }

    /// Backup ids present in the backup directory, oldest first.
    pub fn list_backups(&self) -> StoreResult<Vec<String>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.backup_dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name
                .strip_prefix(BACKUP_PREFIX)
                .and_then(|rest| rest.strip_suffix(".db"))
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn read_backup_state(&self, backup_id: &str) -> StoreResult<BackupState> {
        let path = self.state_path(backup_id);
        if !is_backup_id(backup_id) || !path.exists() {
            return Err(StoreError::NotFound(format!("backup state {backup_id}")));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

}

/// Ids are digits and underscores only, so they never leave the backup directory.
fn is_backup_id(backup_id: &str) -> bool {
    !backup_id.is_empty() && backup_id.chars().all(|c| c.is_ascii_digit() || c == '_')
}

/// Backup id for `ts`, as [`RecordStore::create_backup`] names them.
pub fn backup_id_for(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d_%H%M%S_%6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorSeverity, MessageStatus, SessionStatus};
    use crate::store::HistoryQuery;
    use crate::store::record_store::tests::{base_time, error, message, open_store, session};

    fn seed(store: &RecordStore) {
        let t = base_time();
        store.save_message_record(&message("m1", "a", MessageStatus::Delivered, t)).unwrap();
        store.save_error_record(&error("e1", ErrorSeverity::High, false, t)).unwrap();
        store
            .save_session_record(&session("s1", SessionStatus::Completed, t, Some(t)))
            .unwrap();
    }

    #[test]
    fn backup_writes_database_and_state() {
        let (store, _, _dir) = open_store();
        seed(&store);

        let id = store.create_backup().unwrap();
        assert_eq!(id, backup_id_for(base_time()));
        assert!(store.backup_path(&id).exists());

        let state = store.read_backup_state(&id).unwrap();
        assert_eq!(state.backup_id, id);
        assert_eq!(state.statistics.message_statistics.total_messages, 1);
        assert_eq!(store.list_backups().unwrap(), vec![id]);
    }

    #[test]
    fn same_instant_backups_get_distinct_ids() {
        let (store, _, _dir) = open_store();
        let first = store.create_backup().unwrap();
        let second = store.create_backup().unwrap();
        assert_ne!(first, second);
        assert_eq!(store.list_backups().unwrap().len(), 2);
    }

    #[test]
    fn restore_replaces_all_tables() {
        let (store, _, _dir) = open_store();
        seed(&store);
        let id = store.create_backup().unwrap();

        store
            .save_message_record(&message("m2", "a", MessageStatus::Failed, base_time()))
            .unwrap();
        store.mark_error_resolved("e1").unwrap();

        store.restore_from_backup(&id).unwrap();
        assert!(!store.backups_paused());

        let messages = store.get_message_history(&HistoryQuery::new()).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, "m1");
        assert!(!store.get_error("e1").unwrap().unwrap().resolved);
        assert_eq!(store.get_daily_stats(30).unwrap()[0].messages_delivered, 1);

        // restoring twice gives the same data
        store.restore_from_backup(&id).unwrap();
        assert_eq!(store.get_message_history(&HistoryQuery::new()).unwrap(), messages);
    }

    #[test]
    fn restore_brings_back_deleted_records() {
        let (store, clock, _dir) = open_store();
        seed(&store);
        let id = store.create_backup().unwrap();
        let messages = store.get_message_history(&HistoryQuery::new()).unwrap();
        let errors = store.get_error_history(&HistoryQuery::new()).unwrap();
        let sessions = store.get_session_history(&HistoryQuery::new()).unwrap();

        clock.advance(chrono::Duration::days(100));
        store.mark_error_resolved("e1").unwrap();
        assert_eq!(store.cleanup_old_data(90).unwrap().total(), 3);
        assert!(store.get_message_history(&HistoryQuery::new()).unwrap().is_empty());

        store.restore_from_backup(&id).unwrap();
        assert_eq!(store.get_message_history(&HistoryQuery::new()).unwrap(), messages);
        assert_eq!(store.get_error_history(&HistoryQuery::new()).unwrap(), errors);
        assert_eq!(store.get_session_history(&HistoryQuery::new()).unwrap(), sessions);
    }

    #[test]
    fn backup_ids_outside_the_directory_are_rejected() {
        let (store, _, dir) = open_store();
        seed(&store);
        let id = store.create_backup().unwrap();
        // backups/backup_/../../outside.db resolves to a real file next to the store
        std::fs::create_dir_all(store.backup_dir().join("backup_")).unwrap();
        std::fs::copy(store.backup_path(&id), dir.path().join("outside.db")).unwrap();
        assert!(store.backup_path("/../../outside").exists());

        for bad in ["/../../outside", "../../elsewhere/x", ""] {
            assert!(matches!(store.restore_from_backup(bad), Err(StoreError::NotFound(_))));
            assert!(matches!(store.read_backup_state(bad), Err(StoreError::NotFound(_))));
        }
        assert!(!store.backups_paused());
        assert!(store.restore_from_backup(&id).is_ok());
    }

    #[test]
    fn restore_of_unknown_backup_is_not_found() {
        let (store, _, _dir) = open_store();
        seed(&store);
        let err = store.restore_from_backup("19700101_000000_000000").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!store.backups_paused());
        assert_eq!(store.get_message_history(&HistoryQuery::new()).unwrap().len(), 1);
    }
}
