//! Export of stored records to JSON or CSV.

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{ErrorRecord, MessageRecord, ParseEnumError, SessionRecord};
use crate::store::{HistoryQuery, RecordStore, StoreResult, StoreStatistics};

const EXPORT_MESSAGE_LIMIT: usize = 10_000;
const EXPORT_ERROR_LIMIT: usize = 10_000;
const EXPORT_SESSION_LIMIT: usize = 1_000;
const EXPORT_STATISTICS_DAYS: u32 = 30;

const CSV_HEADER: &str = "Message_ID,Timestamp,Sender,Receiver,Status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    /// Messages only.
    Csv,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(ParseEnumError::new("export format", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub export_timestamp: DateTime<Utc>,
    pub date_range: DateRange,
    pub messages: Vec<MessageRecord>,
    pub errors: Vec<ErrorRecord>,
    pub sessions: Vec<SessionRecord>,
    pub statistics: StoreStatistics,
}

impl RecordStore {
    /// Write records stamped within `[start, end]` to `path`.
    pub fn export_data(
        &self,
        path: &Path,
        format: ExportFormat,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let window = HistoryQuery::new().between(start, end);
        let messages = self.get_message_history(&window.clone().limit(EXPORT_MESSAGE_LIMIT))?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        match format {
            ExportFormat::Json => {
                let document = ExportDocument {
                    export_timestamp: self.clock.now(),
                    date_range: DateRange { start, end },
                    errors: self.get_error_history(&window.clone().limit(EXPORT_ERROR_LIMIT))?,
                    sessions: self.get_session_history(&window.limit(EXPORT_SESSION_LIMIT))?,
                    statistics: self.get_statistics(EXPORT_STATISTICS_DAYS)?,
                    messages,
                };
                std::fs::write(path, serde_json::to_string_pretty(&document)?)?;
                self.observer.in_scope(|| {
                    info!(path = %path.display(), messages = document.messages.len(), "Exported JSON")
                });
            }
            ExportFormat::Csv => {
                let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
                writeln!(out, "{CSV_HEADER}")?;
                for m in &messages {
                    writeln!(
                        out,
                        "{},{},{},{},{}",
                        csv_field(&m.message_id),
                        m.timestamp.to_rfc3339(),
                        csv_field(&m.sender),
                        csv_field(&m.receiver),
                        m.status
                    )?;
                }
                out.flush()?;
                self.observer.in_scope(|| {
                    info!(path = %path.display(), messages = messages.len(), "Exported CSV")
                });
            }
        }
        Ok(())
    }
}

/// Quote a field if it contains a separator, quote, or line break.
fn csv_field(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\"")).into()
    } else {
        value.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorSeverity, MessageStatus, SessionStatus};
    use crate::store::record_store::tests::{base_time, error, message, open_store, session};
    use rstest::rstest;

    #[rstest]
    #[case("plain", "plain")]
    #[case("a,b", "\"a,b\"")]
    #[case("say \"hi\"", "\"say \"\"hi\"\"\"")]
    fn csv_quoting(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(csv_field(raw), expected);
    }

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn json_export_contains_all_sections() {
        let (store, _, dir) = open_store();
        let t = base_time();
        store.save_message_record(&message("m1", "a", MessageStatus::Delivered, t)).unwrap();
        store.save_error_record(&error("e1", ErrorSeverity::Low, false, t)).unwrap();
        store
            .save_session_record(&session("s1", SessionStatus::Completed, t, Some(t)))
            .unwrap();

        let path = dir.path().join("out/export.json");
        store.export_data(&path, ExportFormat::Json, None, None).unwrap();

        let doc: ExportDocument =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc.messages.len(), 1);
        assert_eq!(doc.errors.len(), 1);
        assert_eq!(doc.sessions.len(), 1);
        assert_eq!(doc.date_range.start, None);
        assert_eq!(doc.statistics.message_statistics.delivered_messages, 1);
    }

    #[test]
    fn csv_export_lists_messages_in_range() {
        let (store, _, dir) = open_store();
        let t = base_time();
        store.save_message_record(&message("m1", "a,b", MessageStatus::Sent, t)).unwrap();
        store
            .save_message_record(&message(
                "m-old",
                "a",
                MessageStatus::Sent,
                t - chrono::Duration::days(2),
            ))
            .unwrap();

        let path = dir.path().join("export.csv");
        store
            .export_data(&path, ExportFormat::Csv, Some(t - chrono::Duration::hours(1)), None)
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("m1,"));
        assert!(lines[1].contains("\"a,b\""));
        assert!(lines[1].ends_with(",crane-1,sent"));
    }
}
