//! Per-device event records and the bounded event ring.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use pdubridge_common::model::current_timestamp_millis;

/// How many events are retained per device.
pub const EVENT_RING_CAPACITY: usize = 100;

/// Event classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Triggered,
    Restored,
    Created,
    Updated,
    Deleted,
    SecurityWarning,
    TransportSwap,
    DeviceReboot,
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub details: String,
    pub timestamp: i64,
}

impl EventRecord {
    pub fn new(
        device_id: impl Into<String>,
        event_type: EventType,
        details: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            rule_name: None,
            event_type,
            details: details.into(),
            timestamp: current_timestamp_millis(),
        }
    }

    pub fn with_rule(mut self, rule_name: impl Into<String>) -> Self {
        self.rule_name = Some(rule_name.into());
        self
    }
}

/// Ring buffer keeping the last [`EVENT_RING_CAPACITY`] events.
#[derive(Debug, Default)]
pub struct EventRing {
    events: VecDeque<EventRecord>,
}

impl EventRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: EventRecord) {
        if self.events.len() == EVENT_RING_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Most recent first.
    pub fn recent(&self) -> Vec<EventRecord> {
        self.events.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
