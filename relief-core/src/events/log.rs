use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::EventKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventDisposition {
    Applied,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedEvent {
    pub event_id: String,
    pub kind: EventKind,
    /// Zone or depot id the event was about.
    #[serde(default)]
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub disposition: EventDisposition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Every event id the store has seen through release, with its outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventLog {
    entries: BTreeMap<String, AppliedEvent>,
    watermarks: BTreeMap<String, DateTime<Utc>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = AppliedEvent>) -> Self {
        let mut log = Self::new();
        for entry in entries {
            log.record(entry);
        }
        log
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.entries.contains_key(event_id)
    }

    pub fn get(&self, event_id: &str) -> Option<&AppliedEvent> {
        self.entries.get(event_id)
    }

    /// Timestamp of the newest applied event about `subject`; rejected
    /// events do not move it.
    pub fn last_applied_for(&self, subject: &str) -> Option<DateTime<Utc>> {
        self.watermarks.get(subject).copied()
    }

    pub fn record(&mut self, entry: AppliedEvent) {
        if entry.disposition == EventDisposition::Applied && !entry.subject.is_empty() {
            let watermark = self
                .watermarks
                .entry(entry.subject.clone())
                .or_insert(entry.timestamp);
            if entry.timestamp > *watermark {
                *watermark = entry.timestamp;
            }
        }
        self.entries.insert(entry.event_id.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppliedEvent> {
        self.entries.values()
    }

    pub fn count(&self, disposition: EventDisposition) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.disposition == disposition)
            .count()
    }
}
