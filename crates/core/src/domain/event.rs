use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::experiment::ExperimentId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    View,
    Conversion,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Conversion => "conversion",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "view" => Some(Self::View),
            "conversion" => Some(Self::Conversion),
            _ => None,
        }
    }
}

/// Append-only record. `variant_name` is copied from the assignment at the
/// time the event is recorded and `revenue` is the amount captured then.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub id: EventId,
    pub experiment_id: ExperimentId,
    pub user_id: String,
    pub variant_name: String,
    pub kind: EventKind,
    pub revenue: Option<Decimal>,
    pub occurred_at: DateTime<Utc>,
}

/// Bounds an event scan: at most `limit` of the newest events, optionally
/// restricted to those at or after `since`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWindow {
    pub limit: u32,
    pub since: Option<DateTime<Utc>>,
}

impl EventWindow {
    pub const DEFAULT_LIMIT: u32 = 50_000;

    pub fn latest(limit: u32) -> Self {
        Self { limit, since: None }
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }
}

impl Default for EventWindow {
    fn default() -> Self {
        Self::latest(Self::DEFAULT_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::EventKind;

    #[test]
    fn event_kind_storage_values_round_trip() {
        for kind in [EventKind::View, EventKind::Conversion] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse(" Conversion "), Some(EventKind::Conversion));
        assert_eq!(EventKind::parse("click"), None);
    }
}
