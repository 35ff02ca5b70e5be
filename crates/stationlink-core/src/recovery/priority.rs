//! PriorityManager - ルールでメッセージの優先度を決める
//!
//! ルールは `(message, context) -> Option<MessagePriority>` で、登録順に評価し
//! 最初に `Some` を返したものを採用する。どれも当たらなければ `Normal`。

use serde_json::Value;

use crate::domain::MessagePriority;

pub type PriorityRule = Box<dyn Fn(&Value, &Value) -> Option<MessagePriority> + Send + Sync>;

pub struct PriorityManager {
    rules: Vec<PriorityRule>,
    default_priority: MessagePriority,
}

impl PriorityManager {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_priority: MessagePriority::Normal,
        }
    }

    /// Manager preloaded with the built-in rules, in this order:
    /// 1. `message.priority == "critical"` -> Critical
    /// 2. `message.error_type == "network_error"` -> High
    /// 3. `message.type == "timeout"` -> Normal
    /// 4. `context.session_active` -> Low
    pub fn with_default_rules() -> Self {
        let mut manager = Self::new();
        manager.add_rule(|message, _| {
            field_is(message, "priority", "critical").then_some(MessagePriority::Critical)
        });
        manager.add_rule(|message, _| {
            field_is(message, "error_type", "network_error").then_some(MessagePriority::High)
        });
        manager.add_rule(|message, _| {
            field_is(message, "type", "timeout").then_some(MessagePriority::Normal)
        });
        manager.add_rule(|_, context| {
            context
                .get("session_active")
                .and_then(Value::as_bool)
                .unwrap_or(false)
                .then_some(MessagePriority::Low)
        });
        manager
    }

    pub fn add_rule(
        &mut self,
        rule: impl Fn(&Value, &Value) -> Option<MessagePriority> + Send + Sync + 'static,
    ) {
        self.rules.push(Box::new(rule));
    }

    pub fn calculate_priority(&self, message: &Value, context: Option<&Value>) -> MessagePriority {
        let empty = Value::Object(Default::default());
        let context = context.unwrap_or(&empty);
        self.rules
            .iter()
            .find_map(|rule| rule(message, context))
            .unwrap_or(self.default_priority)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for PriorityManager {
    fn default() -> Self {
        Self::new()
    }
}

fn field_is(message: &Value, key: &str, expected: &str) -> bool {
    message.get(key).and_then(Value::as_str) == Some(expected)
}
