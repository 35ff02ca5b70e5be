//! IdGenerator port - ID 生成の抽象化
//!
//! 複数ステーションが調整なしで ID を発行できるように ULID を使います。
//! テスト容易性のために、trait として抽象化しています。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::{ErrorId, MessageId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散システムで使える ID を生成
///
/// # ULID の特性
/// - 時刻でソート可能
/// - 分散環境で生成可能（調整不要）
/// - 128-bit（UUID 互換）
pub trait IdGenerator: Send + Sync {
    /// 送信タスクの ID を生成
    fn generate_task_id(&self) -> TaskId;

    /// エラー発生の ID を生成
    fn generate_error_id(&self) -> ErrorId;

    /// 受信メッセージの ID を生成
    fn generate_message_id(&self) -> MessageId;

    /// 相関用の生 ULID（プロトコルの session_id に使う）
    fn generate_ulid(&self) -> Ulid;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// テスト時に FixedClock を使えば timestamp 部分が固定されます。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn generate_error_id(&self) -> ErrorId {
        ErrorId::from(self.next())
    }

    fn generate_message_id(&self) -> MessageId {
        MessageId::from(self.next())
    }

    fn generate_ulid(&self) -> Ulid {
        self.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();
        let id3 = id_gen.generate_task_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_is_deterministic() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_error_id();
        let id2 = id_gen.generate_error_id();

        // ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);

        // timestamp 部分は同じ
        let timestamp1 = (id1.as_ulid().0 >> 80) as u64;
        let timestamp2 = (id2.as_ulid().0 >> 80) as u64;
        assert_eq!(timestamp1, timestamp2);
        assert_eq!(timestamp1, fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn different_id_types_are_generated() {
        let id_gen = UlidGenerator::new(SystemClock);

        let task_id = id_gen.generate_task_id();
        let error_id = id_gen.generate_error_id();
        let message_id = id_gen.generate_message_id();

        // let _: TaskId = error_id; // <- これはコンパイルエラー

        assert!(task_id.to_string().starts_with("task-"));
        assert!(error_id.to_string().starts_with("err-"));
        assert!(message_id.to_string().starts_with("msg-"));
    }
}
