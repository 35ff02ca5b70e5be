//! BackupLoop - 定期スナップショット
//!
//! `interval` ごとに `create_backup` を blocking スレッドで走らせる。
//! リストア中（backups_paused）の周期は飛ばす。失敗はログのみで次の周期へ。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::observability::Observer;
use crate::store::RecordStore;

pub(crate) async fn run(
    store: Arc<RecordStore>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    observer: Observer,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        if store.backups_paused() {
            observer.in_scope(|| debug!("restore in progress, skipping auto backup"));
            continue;
        }

        let s = Arc::clone(&store);
        match tokio::task::spawn_blocking(move || s.create_backup()).await {
            Ok(Ok(backup_id)) => {
                observer.in_scope(|| info!(backup_id = %backup_id, "auto backup created"));
            }
            Ok(Err(e)) => {
                observer.in_scope(|| error!(error = %e, "auto backup failed"));
            }
            Err(e) => {
                observer.in_scope(|| error!(error = %e, "auto backup task panicked"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemClock;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_backups_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            RecordStore::open_in_memory(
                dir.path().join("backups"),
                Arc::new(SystemClock),
                Observer::disabled(),
            )
            .unwrap(),
        );
        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(run(
            Arc::clone(&store),
            Duration::from_millis(20),
            rx,
            Observer::disabled(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.list_backups().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), join).await.unwrap().unwrap();
    }
}
