//! RecordStore - SQLite に履歴を残す
//!
//! messages / errors / sessions は主キーで upsert し、同じトランザクションで
//! その日の `daily_stats` を集計し直す。タイムスタンプはナノ秒・`Z` 付きの RFC3339
//! 固定幅で保存するので、文字列比較がそのまま時刻比較になる。

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::domain::{
    DailyStats, ErrorAction, ErrorRecord, ErrorSeverity, ErrorType, MessageRecord, MessageStatus,
    SessionRecord, SessionStatus,
};
use crate::observability::Observer;
use crate::ports::Clock;
use crate::store::{StoreError, StoreResult, migrations};

pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Filter for the history queries. Unset fields match everything.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    /// Messages match on sender or receiver; errors and sessions on `agent_id`.
    pub agent_id: Option<String>,
    /// Ignored for errors, which carry no protocol column.
    pub protocol_type: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            agent_id: None,
            protocol_type: None,
            start: None,
            end: None,
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl HistoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn protocol(mut self, protocol_type: impl Into<String>) -> Self {
        self.protocol_type = Some(protocol_type.into());
        self
    }

    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Rows removed by [`RecordStore::cleanup_old_data`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CleanupReport {
    pub messages: usize,
    pub errors: usize,
    pub sessions: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.messages + self.errors + self.sessions
    }
}

pub struct RecordStore {
    pub(crate) conn: Mutex<Connection>,
    pub(crate) db_path: Option<PathBuf>,
    pub(crate) backup_dir: PathBuf,
    pub(crate) backups_paused: AtomicBool,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) observer: Observer,
}

impl RecordStore {
    /// Open (or create) the database file and run pending migrations.
    pub fn open(config: &StoreConfig, clock: Arc<dyn Clock>, observer: Observer) -> StoreResult<Self> {
        if let Some(parent) = config.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        observer.in_scope(|| info!(path = %config.db_path.display(), "Opening record store"));

        let conn = Connection::open(&config.db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::from_connection(
            conn,
            Some(config.db_path.clone()),
            config.backup_dir.clone(),
            clock,
            observer,
        )
    }

    /// In-memory store, for tests and dry runs.
    pub fn open_in_memory(
        backup_dir: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        observer: Observer,
    ) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, None, backup_dir.into(), clock, observer)
    }

    fn from_connection(
        conn: Connection,
        db_path: Option<PathBuf>,
        backup_dir: PathBuf,
        clock: Arc<dyn Clock>,
        observer: Observer,
    ) -> StoreResult<Self> {
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            backup_dir,
            backups_paused: AtomicBool::new(false),
            clock,
            observer,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// True while a restore is running. Automatic backups skip their turn.
    pub fn backups_paused(&self) -> bool {
        self.backups_paused.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub fn save_message_record(&self, record: &MessageRecord) -> StoreResult<()> {
        let content = serde_json::to_string(&record.content)?;
        let error_info = record.error_info.as_ref().map(serde_json::to_string).transpose()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO messages
             (message_id, timestamp, sender, receiver, protocol_type, content,
              priority, status, session_id, error_info)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.message_id,
                format_ts(record.timestamp),
                record.sender,
                record.receiver,
                record.protocol_type,
                content,
                record.priority,
                record.status.as_str(),
                record.session_id,
                error_info,
            ],
        )?;
        refresh_daily_stats(&tx, record.timestamp.date_naive())?;
        tx.commit()?;

        self.observer.in_scope(|| {
            debug!(message_id = %record.message_id, status = %record.status, "Message record saved")
        });
        Ok(())
    }

    pub fn save_error_record(&self, record: &ErrorRecord) -> StoreResult<()> {
        let context = serde_json::to_string(&record.context)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO errors
             (error_id, timestamp, agent_id, error_type, severity, message, context,
              action_taken, recovery_attempts, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.error_id,
                format_ts(record.timestamp),
                record.agent_id,
                record.error_type.as_str(),
                record.severity.value(),
                record.message,
                context,
                record.action_taken.as_str(),
                record.recovery_attempts,
                record.resolved,
            ],
        )?;
        refresh_daily_stats(&tx, record.timestamp.date_naive())?;
        tx.commit()?;

        self.observer.in_scope(|| {
            debug!(error_id = %record.error_id, action = record.action_taken.as_str(), "Error record saved")
        });
        Ok(())
    }

    pub fn save_session_record(&self, record: &SessionRecord) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO sessions
             (session_id, timestamp, agent_id, protocol_type, status, start_time,
              end_time, messages_count, error_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.session_id,
                format_ts(record.timestamp),
                record.agent_id,
                record.protocol_type,
                record.status.as_str(),
                format_ts(record.start_time),
                record.end_time.map(format_ts),
                record.messages_count,
                record.error_count,
            ],
        )?;
        refresh_daily_stats(&tx, record.timestamp.date_naive())?;
        tx.commit()?;

        self.observer.in_scope(|| {
            debug!(session_id = %record.session_id, status = %record.status, "Session record saved")
        });
        Ok(())
    }

    /// Returns false if no such error was stored.
    pub fn mark_error_resolved(&self, error_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE errors SET resolved = 1 WHERE error_id = ?1",
            params![error_id],
        )?;
        Ok(updated > 0)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get_message(&self, message_id: &str) -> StoreResult<Option<MessageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?1"
        ))?;
        Ok(stmt.query_row(params![message_id], message_from_row).optional()?)
    }

    pub fn get_error(&self, error_id: &str) -> StoreResult<Option<ErrorRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ERROR_COLUMNS} FROM errors WHERE error_id = ?1"
        ))?;
        Ok(stmt.query_row(params![error_id], error_from_row).optional()?)
    }

    pub fn get_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"
        ))?;
        Ok(stmt.query_row(params![session_id], session_from_row).optional()?)
    }

    /// Newest first.
    pub fn get_message_history(&self, query: &HistoryQuery) -> StoreResult<Vec<MessageRecord>> {
        let mut filter = Filter::default();
        if let Some(agent) = &query.agent_id {
            filter.push_pair("(sender = ? OR receiver = ?)", agent);
        }
        if let Some(protocol) = &query.protocol_type {
            filter.push("protocol_type = ?", protocol.clone());
        }
        filter.push_range(query.start, query.end);

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages{} ORDER BY timestamp DESC LIMIT ?",
            filter.where_clause()
        );
        self.query_history(&sql, filter, query.limit, message_from_row)
    }

    /// Newest first.
    pub fn get_error_history(&self, query: &HistoryQuery) -> StoreResult<Vec<ErrorRecord>> {
        let mut filter = Filter::default();
        if let Some(agent) = &query.agent_id {
            filter.push("agent_id = ?", agent.clone());
        }
        filter.push_range(query.start, query.end);

        let sql = format!(
            "SELECT {ERROR_COLUMNS} FROM errors{} ORDER BY timestamp DESC LIMIT ?",
            filter.where_clause()
        );
        self.query_history(&sql, filter, query.limit, error_from_row)
    }

    /// Newest first.
    pub fn get_session_history(&self, query: &HistoryQuery) -> StoreResult<Vec<SessionRecord>> {
        let mut filter = Filter::default();
        if let Some(agent) = &query.agent_id {
            filter.push("agent_id = ?", agent.clone());
        }
        if let Some(protocol) = &query.protocol_type {
            filter.push("protocol_type = ?", protocol.clone());
        }
        filter.push_range(query.start, query.end);

        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions{} ORDER BY timestamp DESC LIMIT ?",
            filter.where_clause()
        );
        self.query_history(&sql, filter, query.limit, session_from_row)
    }

    fn query_history<T>(
        &self,
        sql: &str,
        mut filter: Filter,
        limit: usize,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<Vec<T>> {
        filter.values.push(SqlValue::Integer(clamp_limit(limit)));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(filter.values), map)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Daily aggregates for the last `days` days (today included), newest first.
    pub fn get_daily_stats(&self, days: u32) -> StoreResult<Vec<DailyStats>> {
        let since = self.clock.now().date_naive() - chrono::Days::new(u64::from(days));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT date, messages_sent, messages_delivered, errors_count,
                    sessions_completed, avg_response_time
             FROM daily_stats WHERE date > ?1 ORDER BY date DESC",
        )?;
        let rows = stmt.query_map(params![since.to_string()], |row| {
            Ok(DailyStats {
                date: parse_col(row, 0, |s: &str| NaiveDate::from_str(s))?,
                messages_sent: row.get(1)?,
                messages_delivered: row.get(2)?,
                errors_count: row.get(3)?,
                sessions_completed: row.get(4)?,
                avg_response_time: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Delete data older than `days`: all messages, resolved errors, and
    /// completed sessions. Unresolved errors and unfinished sessions stay.
    pub fn cleanup_old_data(&self, days: u32) -> StoreResult<CleanupReport> {
        let cutoff = format_ts(self.clock.now() - chrono::Duration::days(i64::from(days)));

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let messages = tx.execute("DELETE FROM messages WHERE timestamp < ?1", params![cutoff])?;
        let errors = tx.execute(
            "DELETE FROM errors WHERE timestamp < ?1 AND resolved = 1",
            params![cutoff],
        )?;
        let sessions = tx.execute(
            "DELETE FROM sessions WHERE timestamp < ?1 AND status = 'completed'",
            params![cutoff],
        )?;
        tx.commit()?;

        let report = CleanupReport {
            messages,
            errors,
            sessions,
        };
        self.observer.in_scope(|| {
            info!(days, messages, errors, sessions, "Old records cleaned up")
        });
        Ok(report)
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("db_path", &self.db_path)
            .field("backup_dir", &self.backup_dir)
            .field("backups_paused", &self.backups_paused())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Row mapping
// ============================================================================

pub(crate) const MESSAGE_COLUMNS: &str = "message_id, timestamp, sender, receiver, protocol_type, \
     content, priority, status, session_id, error_info";

pub(crate) const ERROR_COLUMNS: &str = "error_id, timestamp, agent_id, error_type, severity, \
     message, context, action_taken, recovery_attempts, resolved";

pub(crate) const SESSION_COLUMNS: &str = "session_id, timestamp, agent_id, protocol_type, status, \
     start_time, end_time, messages_count, error_count";

pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let error_info: Option<String> = row.get(9)?;
    Ok(MessageRecord {
        message_id: row.get(0)?,
        timestamp: ts_col(row, 1)?,
        sender: row.get(2)?,
        receiver: row.get(3)?,
        protocol_type: row.get(4)?,
        content: parse_col(row, 5, |s| serde_json::from_str(s))?,
        priority: row.get(6)?,
        status: parse_col(row, 7, MessageStatus::from_str)?,
        session_id: row.get(8)?,
        error_info: error_info
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| conversion_error(9, e))?,
    })
}

pub(crate) fn error_from_row(row: &Row<'_>) -> rusqlite::Result<ErrorRecord> {
    let severity: i64 = row.get(4)?;
    Ok(ErrorRecord {
        error_id: row.get(0)?,
        timestamp: ts_col(row, 1)?,
        agent_id: row.get(2)?,
        error_type: parse_col(row, 3, ErrorType::from_str)?,
        severity: ErrorSeverity::from_value(severity).ok_or_else(|| {
            conversion_error(4, StoreError::InvalidData(format!("severity {severity}")))
        })?,
        message: row.get(5)?,
        context: parse_col(row, 6, |s| serde_json::from_str(s))?,
        action_taken: parse_col(row, 7, ErrorAction::from_str)?,
        recovery_attempts: row.get(8)?,
        resolved: row.get(9)?,
    })
}

pub(crate) fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let end_time: Option<String> = row.get(6)?;
    Ok(SessionRecord {
        session_id: row.get(0)?,
        timestamp: ts_col(row, 1)?,
        agent_id: row.get(2)?,
        protocol_type: row.get(3)?,
        status: parse_col(row, 4, SessionStatus::from_str)?,
        start_time: ts_col(row, 5)?,
        end_time: end_time
            .map(|s| parse_datetime(&s))
            .transpose()
            .map_err(|e| conversion_error(6, e))?,
        messages_count: row.get(7)?,
        error_count: row.get(8)?,
    })
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_col(row, idx, parse_datetime)
}

fn parse_col<T, E>(row: &Row<'_>, idx: usize, parse: impl FnOnce(&str) -> Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// WHERE clause built from optional filters, with positional values.
#[derive(Default)]
struct Filter {
    clauses: Vec<&'static str>,
    values: Vec<SqlValue>,
}

impl Filter {
    fn push(&mut self, clause: &'static str, value: String) {
        self.clauses.push(clause);
        self.values.push(SqlValue::Text(value));
    }

    fn push_pair(&mut self, clause: &'static str, value: &str) {
        self.clauses.push(clause);
        self.values.push(SqlValue::Text(value.to_string()));
        self.values.push(SqlValue::Text(value.to_string()));
    }

    fn push_range(&mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) {
        if let Some(start) = start {
            self.push("timestamp >= ?", format_ts(start));
        }
        if let Some(end) = end {
            self.push("timestamp <= ?", format_ts(end));
        }
    }

    fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// Recompute the `daily_stats` row for `date` from the base tables.
fn refresh_daily_stats(conn: &Connection, date: NaiveDate) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO daily_stats
         (date, messages_sent, messages_delivered, errors_count, sessions_completed, avg_response_time)
         VALUES (
            ?1,
            (SELECT COUNT(*) FROM messages
             WHERE substr(timestamp, 1, 10) = ?1 AND status IN ('sent', 'delivered', 'failed')),
            (SELECT COUNT(*) FROM messages
             WHERE substr(timestamp, 1, 10) = ?1 AND status = 'delivered'),
            (SELECT COUNT(*) FROM errors WHERE substr(timestamp, 1, 10) = ?1),
            (SELECT COUNT(*) FROM sessions
             WHERE substr(timestamp, 1, 10) = ?1 AND status = 'completed'),
            (SELECT COALESCE(AVG((julianday(end_time) - julianday(start_time)) * 86400.0), 0.0)
             FROM sessions
             WHERE substr(timestamp, 1, 10) = ?1 AND status = 'completed' AND end_time IS NOT NULL)
         )
         ON CONFLICT(date) DO UPDATE SET
            messages_sent = excluded.messages_sent,
            messages_delivered = excluded.messages_delivered,
            errors_count = excluded.errors_count,
            sessions_completed = excluded.sessions_completed,
            avg_response_time = excluded.avg_response_time",
        params![date.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    pub(crate) fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    pub(crate) fn open_store() -> (RecordStore, Arc<FixedClock>, TempDir) {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FixedClock::new(base_time()));
        let config = StoreConfig {
            db_path: dir.path().join("records.db"),
            backup_dir: dir.path().join("backups"),
            ..StoreConfig::default()
        };
        let store = RecordStore::open(&config, clock.clone(), Observer::disabled()).unwrap();
        (store, clock, dir)
    }

    pub(crate) fn message(id: &str, sender: &str, status: MessageStatus, ts: DateTime<Utc>) -> MessageRecord {
        MessageRecord {
            message_id: id.to_string(),
            timestamp: ts,
            sender: sender.to_string(),
            receiver: "crane-1".to_string(),
            protocol_type: "material_transfer".to_string(),
            content: json!({"message_type": "material_transfer_request", "quantity": 3}),
            priority: 3,
            status,
            session_id: None,
            error_info: None,
        }
    }

    pub(crate) fn error(id: &str, severity: ErrorSeverity, resolved: bool, ts: DateTime<Utc>) -> ErrorRecord {
        ErrorRecord {
            error_id: id.to_string(),
            timestamp: ts,
            agent_id: "conveyor-1".to_string(),
            error_type: ErrorType::Network,
            severity,
            message: "link down".to_string(),
            context: json!({"details": {}}),
            action_taken: ErrorAction::Retry,
            recovery_attempts: 1,
            resolved,
        }
    }

    pub(crate) fn session(
        id: &str,
        status: SessionStatus,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            timestamp: end.unwrap_or(start),
            agent_id: "crane-1".to_string(),
            protocol_type: "material_transfer".to_string(),
            status,
            start_time: start,
            end_time: end,
            messages_count: 4,
            error_count: 1,
        }
    }

    #[test]
    fn message_record_round_trips() {
        let (store, _, _dir) = open_store();
        let ts = base_time() + chrono::Duration::nanoseconds(123_456_789);
        let rec = message("msg-1", "conveyor-1", MessageStatus::Sent, ts)
            .with_error_info(json!({"error": "unreachable"}));
        store.save_message_record(&rec).unwrap();

        assert_eq!(store.get_message("msg-1").unwrap(), Some(rec));
        assert_eq!(store.get_message("missing").unwrap(), None);
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let (store, _, _dir) = open_store();
        store
            .save_message_record(&message("msg-1", "a", MessageStatus::Sent, base_time()))
            .unwrap();
        store
            .save_message_record(&message("msg-1", "a", MessageStatus::Delivered, base_time()))
            .unwrap();

        let history = store.get_message_history(&HistoryQuery::new()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MessageStatus::Delivered);
    }

    #[test]
    fn message_history_filters_and_orders() {
        let (store, _, _dir) = open_store();
        let t0 = base_time();
        for (i, sender) in ["a", "b", "a", "c"].iter().enumerate() {
            let ts = t0 + chrono::Duration::minutes(i as i64);
            store
                .save_message_record(&message(&format!("m{i}"), sender, MessageStatus::Sent, ts))
                .unwrap();
        }

        let from_a = store.get_message_history(&HistoryQuery::new().agent("a")).unwrap();
        let ids: Vec<_> = from_a.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m0"]);

        // receiver matches too
        let to_crane = store.get_message_history(&HistoryQuery::new().agent("crane-1")).unwrap();
        assert_eq!(to_crane.len(), 4);

        let window = HistoryQuery::new().between(
            Some(t0 + chrono::Duration::minutes(1)),
            Some(t0 + chrono::Duration::minutes(2)),
        );
        let ids: Vec<_> = store
            .get_message_history(&window)
            .unwrap()
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec!["m2", "m1"]);

        assert_eq!(store.get_message_history(&HistoryQuery::new().limit(1)).unwrap().len(), 1);
    }

    #[test]
    fn error_history_and_resolution() {
        let (store, _, _dir) = open_store();
        let rec = error("err-1", ErrorSeverity::High, false, base_time());
        store.save_error_record(&rec).unwrap();

        assert!(store.mark_error_resolved("err-1").unwrap());
        assert!(!store.mark_error_resolved("err-404").unwrap());

        let history = store
            .get_error_history(&HistoryQuery::new().agent("conveyor-1"))
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].resolved);
        assert_eq!(history[0].severity, ErrorSeverity::High);
        assert!(store.get_error_history(&HistoryQuery::new().agent("other")).unwrap().is_empty());
    }

    #[test]
    fn session_history_filters_by_protocol() {
        let (store, _, _dir) = open_store();
        let t0 = base_time();
        store
            .save_session_record(&session("s1", SessionStatus::Active, t0, None))
            .unwrap();
        let mut other = session("s2", SessionStatus::Active, t0, None);
        other.protocol_type = "quality_check".to_string();
        store.save_session_record(&other).unwrap();

        let history = store
            .get_session_history(&HistoryQuery::new().protocol("material_transfer"))
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].session_id, "s1");
        assert_eq!(history[0].end_time, None);
    }

    #[test]
    fn daily_stats_follow_writes() {
        let (store, _, _dir) = open_store();
        let t0 = base_time();
        store.save_message_record(&message("m1", "a", MessageStatus::Delivered, t0)).unwrap();
        store.save_message_record(&message("m2", "a", MessageStatus::Failed, t0)).unwrap();
        store.save_message_record(&message("m3", "a", MessageStatus::Processed, t0)).unwrap();
        store.save_error_record(&error("e1", ErrorSeverity::Low, false, t0)).unwrap();
        store
            .save_session_record(&session(
                "s1",
                SessionStatus::Completed,
                t0,
                Some(t0 + chrono::Duration::seconds(30)),
            ))
            .unwrap();

        let stats = store.get_daily_stats(7).unwrap();
        assert_eq!(stats.len(), 1);
        let today = &stats[0];
        assert_eq!(today.date, t0.date_naive());
        assert_eq!(today.messages_sent, 2);
        assert_eq!(today.messages_delivered, 1);
        assert_eq!(today.errors_count, 1);
        assert_eq!(today.sessions_completed, 1);
        assert!((today.avg_response_time - 30.0).abs() < 0.01);
    }

    #[test]
    fn cleanup_keeps_open_work() {
        let (store, clock, _dir) = open_store();
        let old = base_time();
        store.save_message_record(&message("m-old", "a", MessageStatus::Sent, old)).unwrap();
        store.save_error_record(&error("e-resolved", ErrorSeverity::Low, true, old)).unwrap();
        store.save_error_record(&error("e-open", ErrorSeverity::Low, false, old)).unwrap();
        store
            .save_session_record(&session("s-done", SessionStatus::Completed, old, Some(old)))
            .unwrap();
        store
            .save_session_record(&session("s-live", SessionStatus::Active, old, None))
            .unwrap();

        clock.advance(chrono::Duration::days(100));
        store
            .save_message_record(&message("m-new", "a", MessageStatus::Sent, clock.now()))
            .unwrap();

        let report = store.cleanup_old_data(90).unwrap();
        assert_eq!(
            report,
            CleanupReport {
                messages: 1,
                errors: 1,
                sessions: 1
            }
        );
        assert_eq!(report.total(), 3);
        assert!(store.get_message("m-new").unwrap().is_some());
        assert!(store.get_error("e-open").unwrap().is_some());
        assert!(store.get_session("s-live").unwrap().is_some());
        assert!(store.get_session("s-done").unwrap().is_none());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn open_logs_inside_the_store_span() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            db_path: dir.path().join("records.db"),
            backup_dir: dir.path().join("backups"),
            ..StoreConfig::default()
        };
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let clock = Arc::new(FixedClock::new(base_time()));
            RecordStore::open(&config, clock, Observer::new("line-7", "store")).unwrap();
        });

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        let line = output
            .lines()
            .find(|l| l.contains("Opening record store"))
            .unwrap();
        assert!(line.contains("stationlink{"), "{line}");
        assert!(line.contains("agent=line-7"), "{line}");
    }

    #[test]
    fn in_memory_store_works() {
        let clock = Arc::new(FixedClock::new(base_time()));
        let store = RecordStore::open_in_memory("unused", clock, Observer::disabled()).unwrap();
        store.save_message_record(&message("m", "a", MessageStatus::Sent, base_time())).unwrap();
        assert!(store.db_path().is_none());
        assert_eq!(store.get_message_history(&HistoryQuery::new()).unwrap().len(), 1);
    }
}
