//! Record store against a real database file: persistence across reopen,
//! history queries, snapshots and export.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

use stationlink_core::config::StoreConfig;
use stationlink_core::domain::{
    ErrorAction, ErrorRecord, ErrorSeverity, ErrorType, MessageRecord, MessageStatus,
    SessionRecord, SessionStatus,
};
use stationlink_core::observability::Observer;
use stationlink_core::ports::FixedClock;
use stationlink_core::store::{ExportDocument, ExportFormat, HistoryQuery, RecordStore, StoreError};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 11, 4, 9, 30, 0).unwrap()
}

fn store_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        db_path: dir.path().join("data/line.db"),
        backup_dir: dir.path().join("backups"),
        auto_backup_interval_secs: 0,
        retention_days: 30,
    }
}

fn open(config: &StoreConfig, clock: &Arc<FixedClock>) -> RecordStore {
    RecordStore::open(config, clock.clone(), Observer::disabled()).unwrap()
}

fn message(id: &str, sender: &str, receiver: &str, at: DateTime<Utc>) -> MessageRecord {
    MessageRecord {
        message_id: id.into(),
        timestamp: at,
        sender: sender.into(),
        receiver: receiver.into(),
        protocol_type: "material_transfer".into(),
        content: json!({"message_type": "material_transfer_request", "quantity": 1}),
        priority: 2,
        status: MessageStatus::Delivered,
        session_id: Some("s-1".into()),
        error_info: None,
    }
}

fn error(id: &str, at: DateTime<Utc>) -> ErrorRecord {
    ErrorRecord {
        error_id: id.into(),
        timestamp: at,
        agent_id: "conveyor-1".into(),
        error_type: ErrorType::Timeout,
        severity: ErrorSeverity::Medium,
        message: "send timed out".into(),
        context: json!({"details": {"to": "crane-1"}}),
        action_taken: ErrorAction::Retry,
        recovery_attempts: 1,
        resolved: false,
    }
}

fn session(id: &str, at: DateTime<Utc>) -> SessionRecord {
    SessionRecord {
        session_id: id.into(),
        timestamp: at,
        agent_id: "crane-1".into(),
        protocol_type: "material_transfer".into(),
        status: SessionStatus::Completed,
        start_time: at - ChronoDuration::seconds(4),
        end_time: Some(at),
        messages_count: 4,
        error_count: 0,
    }
}

#[test]
fn records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let config = store_config(&dir);
    let clock = Arc::new(FixedClock::new(now()));

    {
        let store = open(&config, &clock);
        store.save_message_record(&message("m-1", "conveyor-1", "crane-1", now())).unwrap();
        store.save_error_record(&error("e-1", now())).unwrap();
        store.save_session_record(&session("s-1", now())).unwrap();
    }

    let store = open(&config, &clock);
    assert_eq!(store.db_path(), Some(config.db_path.as_path()));
    assert_eq!(
        store.get_message("m-1").unwrap().unwrap(),
        message("m-1", "conveyor-1", "crane-1", now())
    );
    assert_eq!(store.get_error("e-1").unwrap().unwrap().error_type, ErrorType::Timeout);

    let daily = store.get_daily_stats(7).unwrap();
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].date, now().date_naive());
    assert_eq!(daily[0].messages_delivered, 1);
    assert_eq!(daily[0].sessions_completed, 1);
    assert!((daily[0].avg_response_time - 4.0).abs() < 1e-3);
}

#[test]
fn history_by_sender_is_newest_first_and_limited() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FixedClock::new(now()));
    let store = open(&store_config(&dir), &clock);

    for i in 0..5 {
        let at = now() - ChronoDuration::minutes(i);
        store
            .save_message_record(&message(&format!("m-{i}"), "conveyor-1", "crane-1", at))
            .unwrap();
    }
    store
        .save_message_record(&message("other", "press-2", "oven-4", now()))
        .unwrap();

    let history = store
        .get_message_history(&HistoryQuery::new().agent("conveyor-1").limit(3))
        .unwrap();
    let ids: Vec<_> = history.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, vec!["m-0", "m-1", "m-2"]);

    let window = store
        .get_message_history(&HistoryQuery::new().between(
            Some(now() - ChronoDuration::minutes(2)),
            Some(now() - ChronoDuration::minutes(1)),
        ))
        .unwrap();
    assert_eq!(window.len(), 2);
}

#[test]
fn history_returns_the_saved_record_unchanged() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FixedClock::new(now()));
    let store = open(&store_config(&dir), &clock);

    let mut saved = message(
        "m-full",
        "conveyor-1",
        "crane-1",
        now() + ChronoDuration::nanoseconds(123_456_789),
    );
    saved.status = MessageStatus::Sent;
    saved.content = json!({"message_type": "material_transfer_request", "material_id": "coil-7", "quantity": 3});
    saved.error_info = Some(json!({"error": "link down", "retry_count": 1}));
    store.save_message_record(&saved).unwrap();

    let history = store
        .get_message_history(&HistoryQuery::new().agent(saved.sender.clone()))
        .unwrap();
    assert_eq!(history, vec![saved]);
}

#[test]
fn restore_brings_back_the_snapshot() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FixedClock::new(now()));
    let store = open(&store_config(&dir), &clock);

    store.save_message_record(&message("kept", "conveyor-1", "crane-1", now())).unwrap();
    let backup_id = store.create_backup().unwrap();
    assert_eq!(store.list_backups().unwrap(), vec![backup_id.clone()]);
    assert_eq!(store.read_backup_state(&backup_id).unwrap().backup_id, backup_id);

    store.save_message_record(&message("later", "conveyor-1", "crane-1", now())).unwrap();
    store.save_error_record(&error("e-later", now())).unwrap();

    store.restore_from_backup(&backup_id).unwrap();
    store.restore_from_backup(&backup_id).unwrap();

    assert!(store.get_message("kept").unwrap().is_some());
    assert!(store.get_message("later").unwrap().is_none());
    assert!(store.get_error("e-later").unwrap().is_none());
    assert!(!store.backups_paused());

    assert!(matches!(
        store.restore_from_backup("19700101_000000_000000"),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn cleanup_then_export() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(FixedClock::new(now()));
    let store = open(&store_config(&dir), &clock);

    let old = now() - ChronoDuration::days(40);
    store.save_message_record(&message("old", "conveyor-1", "crane-1", old)).unwrap();
    store.save_message_record(&message("new", "conveyor-1", "crane-1", now())).unwrap();
    store.save_session_record(&session("s-old", old)).unwrap();

    let report = store.cleanup_old_data(30).unwrap();
    assert_eq!(report.messages, 1);
    assert_eq!(report.sessions, 1);

    let json_path = dir.path().join("exports/records.json");
    store.export_data(&json_path, ExportFormat::Json, None, None).unwrap();
    let doc: ExportDocument =
        serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(doc.messages.len(), 1);
    assert_eq!(doc.messages[0].message_id, "new");

    let csv_path = dir.path().join("exports/records.csv");
    store.export_data(&csv_path, ExportFormat::Csv, None, None).unwrap();
    let csv = std::fs::read_to_string(&csv_path).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("Message_ID,Timestamp,Sender,Receiver,Status"));
    let row = lines.next().unwrap();
    assert!(row.starts_with("new,"));
    assert!(row.ends_with(",conveyor-1,crane-1,delivered"));
    assert_eq!(lines.next(), None);
}
