//! Aggregate statistics over a trailing window.

use chrono::Duration as ChronoDuration;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::store::record_store::format_ts;
use crate::store::{RecordStore, StoreResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub period_days: u32,
    pub message_statistics: MessageStatistics,
    pub error_statistics: ErrorStatistics,
    pub session_statistics: SessionStatistics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageStatistics {
    pub total_messages: u64,
    pub delivered_messages: u64,
    pub failed_messages: u64,
    /// Distinct session ids seen on messages in the window.
    pub total_sessions: u64,
    /// Percent, 0 when there are no messages.
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub resolved_errors: u64,
    /// Percent, 0 when there are no errors.
    pub resolution_rate: f64,
    /// Mean numeric severity (1 = critical).
    pub average_severity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub completed_sessions: u64,
    pub average_messages_per_session: f64,
    pub average_errors_per_session: f64,
}

impl RecordStore {
    /// Statistics for records stamped within the last `days` days.
    pub fn get_statistics(&self, days: u32) -> StoreResult<StoreStatistics> {
        let now = self.clock.now();
        let start = format_ts(now - ChronoDuration::days(i64::from(days)));
        let end = format_ts(now);

        let conn = self.conn.lock();

        let (total_messages, delivered_messages, failed_messages, total_sessions): (u64, u64, u64, u64) =
            conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN status = 'delivered' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                        COUNT(DISTINCT session_id)
                 FROM messages WHERE timestamp >= ?1 AND timestamp <= ?2",
                params![start, end],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        let (total_errors, resolved_errors, average_severity): (u64, u64, f64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN resolved THEN 1 ELSE 0 END), 0),
                    COALESCE(AVG(severity), 0.0)
             FROM errors WHERE timestamp >= ?1 AND timestamp <= ?2",
            params![start, end],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let (completed_sessions, average_messages_per_session, average_errors_per_session): (
            u64,
            f64,
            f64,
        ) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(AVG(messages_count), 0.0),
                    COALESCE(AVG(error_count), 0.0)
             FROM sessions
             WHERE status = 'completed' AND timestamp >= ?1 AND timestamp <= ?2",
            params![start, end],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(StoreStatistics {
            period_days: days,
            message_statistics: MessageStatistics {
                total_messages,
                delivered_messages,
                failed_messages,
                total_sessions,
                success_rate: percent(delivered_messages, total_messages),
            },
            error_statistics: ErrorStatistics {
                total_errors,
                resolved_errors,
                resolution_rate: percent(resolved_errors, total_errors),
                average_severity,
            },
            session_statistics: SessionStatistics {
                completed_sessions,
                average_messages_per_session,
                average_errors_per_session,
            },
        })
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
