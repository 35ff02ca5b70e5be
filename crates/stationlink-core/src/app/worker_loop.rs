//! WorkerLoop - 送信キューを 1 件ずつ配送する
//!
//! 配送は直列。1 件の送信（とその再試行判断）が終わるまで次を取らない。

use tokio::sync::watch;
use tracing::debug;

use crate::app::dispatcher::Dispatcher;

pub(crate) async fn run(dispatcher: Dispatcher, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        // shutdown が来ていたら抜ける
        if *shutdown_rx.borrow() {
            break;
        }

        // pop は poll_interval まで待つので select で shutdown と競合させる
        let task = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                // 変更が入ったら次のループで判定
                continue;
            }
            task = dispatcher.next_task() => task,
        };

        let Some(task) = task else {
            continue;
        };

        // 取り出した後は select の外で最後まで配送する（途中で捨てない）
        let task_id = task.task_id;
        let outcome = dispatcher.deliver(task).await;
        dispatcher
            .observer()
            .in_scope(|| debug!(task_id = %task_id, ?outcome, "task processed"));
    }
}
