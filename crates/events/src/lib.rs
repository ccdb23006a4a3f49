//! Lookout events: cluster Event objects correlated to the resources they describe.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use lookout_core::{DeltaKind, LookoutError, LookoutResult, Resource, ResourceKey, WatchEvent};
use serde::Serialize;
use serde_json::Value;

mod correlator;

pub use correlator::{owner_candidates, EventCorrelator, EventIndex, EVENTS_PER_RESOURCE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
            EventType::Error => "ERROR",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Classify an event that arrived without a watch type, from its message text and severity.
pub fn guess_event_type(message: &str, severity: &str) -> EventType {
    let msg = message.to_lowercase();
    if msg.contains("created") || msg.contains("added") {
        EventType::Added
    } else if msg.contains("deleted") || msg.contains("removed") || msg.contains("kill") {
        EventType::Deleted
    } else if severity != "Normal" {
        EventType::Error
    } else {
        EventType::Modified
    }
}

/// An Event object as received, before correlation. Listed events carry no type.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub event_type: Option<DeltaKind>,
    pub object: Resource,
}

impl RawEvent {
    pub fn listed(object: Resource) -> Self { Self { event_type: None, object } }

    pub fn from_watch(ev: WatchEvent) -> Option<Self> {
        let event_type = Some(ev.delta_kind());
        ev.into_resource().map(|object| Self { event_type, object })
    }
}

/// A correlated cluster event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterEvent {
    /// `metadata.uid`, or `namespace/name` when the server sent none.
    pub id: String,
    pub event_type: EventType,
    pub involved: ResourceKey,
    /// Resource the event is attached to; `None` while detached.
    pub key: Option<ResourceKey>,
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
    pub reason: String,
    pub severity: String,
    pub count: u32,
}

fn str_at<'a>(v: &'a Value, field: &str) -> Option<&'a str> { v.get(field).and_then(|s| s.as_str()) }

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

impl ClusterEvent {
    pub fn from_raw(raw: &RawEvent) -> LookoutResult<Self> {
        let obj = &raw.object;
        let involved = ResourceKey::for_reference(obj.field("involvedObject"), obj.namespace.as_deref())
            .ok_or_else(|| LookoutError::MalformedPayload(format!("event {} has no involvedObject", obj.key)))?;
        let message = str_at(&obj.raw, "message").unwrap_or("").to_string();
        let severity = str_at(&obj.raw, "type").unwrap_or("Normal").to_string();
        let event_type = match raw.event_type {
            Some(DeltaKind::Added) => EventType::Added,
            Some(DeltaKind::Modified) => EventType::Modified,
            Some(DeltaKind::Deleted) => EventType::Deleted,
            Some(DeltaKind::Unknown) | None => guess_event_type(&message, &severity),
        };
        let timestamp = ["lastTimestamp", "eventTime", "firstTimestamp"]
            .iter()
            .filter_map(|f| str_at(&obj.raw, f))
            .chain(str_at(obj.metadata(), "creationTimestamp"))
            .find_map(parse_ts);
        let id = str_at(obj.metadata(), "uid")
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{}/{}", obj.key.scope(), obj.name));
        Ok(Self {
            id,
            event_type,
            involved,
            key: None,
            timestamp,
            message,
            reason: str_at(&obj.raw, "reason").unwrap_or("").to_string(),
            severity,
            count: obj.raw.get("count").and_then(|c| c.as_u64()).unwrap_or(1) as u32,
        })
    }

    pub fn is_warning(&self) -> bool { self.severity != "Normal" }
}
