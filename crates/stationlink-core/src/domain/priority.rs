//! Message urgency.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::ParseEnumError;

/// Urgency of an outbound message.
///
/// Lower numeric value = more urgent. The derived `Ord` follows declaration
/// order, so `Critical < High < ... < Background` and the most urgent
/// priority is the *smallest* one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Critical = 1,
    High = 2,
    #[default]
    Normal = 3,
    Low = 4,
    Background = 5,
}

impl MessagePriority {
    pub const ALL: [MessagePriority; 5] = [
        MessagePriority::Critical,
        MessagePriority::High,
        MessagePriority::Normal,
        MessagePriority::Low,
        MessagePriority::Background,
    ];

    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn from_value(value: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|p| i64::from(p.value()) == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessagePriority::Critical => "critical",
            MessagePriority::High => "high",
            MessagePriority::Normal => "normal",
            MessagePriority::Low => "low",
            MessagePriority::Background => "background",
        }
    }

    /// Promote towards `target` without ever lowering urgency.
    pub fn escalate_to(self, target: MessagePriority) -> MessagePriority {
        self.min(target)
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessagePriority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEnumError::new("message priority", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn more_urgent_sorts_first() {
        let mut all = vec![
            MessagePriority::Low,
            MessagePriority::Background,
            MessagePriority::Critical,
            MessagePriority::Normal,
            MessagePriority::High,
        ];
        all.sort();
        assert_eq!(all, MessagePriority::ALL.to_vec());
    }

    #[rstest]
    #[case(MessagePriority::Background, MessagePriority::High)]
    #[case(MessagePriority::Low, MessagePriority::High)]
    #[case(MessagePriority::High, MessagePriority::High)]
    #[case(MessagePriority::Critical, MessagePriority::Critical)]
    fn escalation_never_lowers_urgency(
        #[case] original: MessagePriority,
        #[case] expected: MessagePriority,
    ) {
        assert_eq!(original.escalate_to(MessagePriority::High), expected);
    }

    #[test]
    fn numeric_values_match_wire_contract() {
        assert_eq!(MessagePriority::Critical.value(), 1);
        assert_eq!(MessagePriority::Background.value(), 5);
        assert_eq!(MessagePriority::from_value(3), Some(MessagePriority::Normal));
        assert_eq!(MessagePriority::from_value(9), None);
    }

    #[test]
    fn defaults_to_normal() {
        assert_eq!(MessagePriority::default(), MessagePriority::Normal);
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("CRITICAL".parse::<MessagePriority>().unwrap(), MessagePriority::Critical);
        assert!("urgent".parse::<MessagePriority>().is_err());
    }
}
