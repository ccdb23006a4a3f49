use std::collections::VecDeque;

use lookout_core::{ResourceKey, WatchEvent};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// Coalescing queue keyed by resource with first-seen order and fixed capacity.
///
/// Within one window the last event for a key wins, while the key keeps the position
/// it had when first observed. Unknown frames are counted and discarded. When full, the
/// oldest pending non-deletion is dropped; pending deletions are never dropped, so the
/// queue may exceed its capacity while it holds only deletions.
pub struct EventAggregator {
    map: FxHashMap<ResourceKey, WatchEvent>,
    order: VecDeque<ResourceKey>,
    cap: usize,
    dropped: u64,
    ignored: u64,
}

impl EventAggregator {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0, ignored: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }
    pub fn ignored(&self) -> u64 { self.ignored }

    /// Returns `false` when the event was discarded.
    pub fn push(&mut self, ev: WatchEvent) -> bool {
        let key = match &ev {
            WatchEvent::Unknown { event_type, payload } => {
                self.ignored += 1;
                debug!(event_type = %event_type, code = ?payload.get("code"), "ignoring non-delta frame");
                return false;
            }
            other => match other.key() {
                Some(k) => k.clone(),
                None => return false,
            },
        };
        if !self.map.contains_key(&key) {
            if self.order.len() >= self.cap {
                self.evict_oldest_update();
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, ev);
        true
    }

    fn evict_oldest_update(&mut self) {
        let map = &self.map;
        let Some(pos) = self.order.iter().position(|k| !matches!(map.get(k), Some(WatchEvent::Deleted(_)))) else {
            debug!(pending = self.order.len(), cap = self.cap, "aggregator full of deletions; keeping them all");
            return;
        };
        if let Some(old) = self.order.remove(pos) {
            self.map.remove(&old);
            self.dropped += 1;
            warn!(key = %old, cap = self.cap, "aggregator full; dropping oldest pending update");
        }
    }

    /// Take one event per key, in first-seen order.
    pub fn drain_ready(&mut self) -> Vec<WatchEvent> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(ev) = self.map.remove(&key) {
                out.push(ev);
            }
        }
        if !out.is_empty() {
            metrics::histogram!("aggregator_flush_size", out.len() as f64);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_core::{DeltaKind, Resource};
    use serde_json::json;

    fn ev(kind: DeltaKind, name: &str, rv: u64) -> WatchEvent {
        let r = Resource::from_value(json!({
            "kind": "Pod",
            "metadata": { "name": name, "namespace": "default", "resourceVersion": rv.to_string() }
        }))
        .expect("pod");
        WatchEvent::new(kind, r)
    }

    #[test]
    fn last_wins_in_first_seen_order() {
        let mut agg = EventAggregator::with_capacity(16);
        agg.push(ev(DeltaKind::Added, "a", 1));
        agg.push(ev(DeltaKind::Added, "b", 2));
        agg.push(ev(DeltaKind::Modified, "a", 3));
        agg.push(ev(DeltaKind::Deleted, "b", 4));
        assert_eq!(agg.len(), 2);
        let out = agg.drain_ready();
        let seen: Vec<(String, DeltaKind, String)> = out
            .iter()
            .map(|e| (e.key().expect("key").name().to_string(), e.delta_kind(), e.resource().expect("res").resource_version.clone()))
            .collect();
        assert_eq!(seen, vec![
            ("a".to_string(), DeltaKind::Modified, "3".to_string()),
            ("b".to_string(), DeltaKind::Deleted, "4".to_string()),
        ]);
        assert!(agg.is_empty());
        assert!(agg.drain_ready().is_empty());
    }

    #[test]
    fn unknown_frames_are_ignored() {
        let mut agg = EventAggregator::with_capacity(4);
        assert!(!agg.push(WatchEvent::Unknown { event_type: "ERROR".into(), payload: json!({ "code": 500 }) }));
        assert_eq!(agg.ignored(), 1);
        assert!(agg.is_empty());
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut agg = EventAggregator::with_capacity(2);
        agg.push(ev(DeltaKind::Added, "a", 1));
        agg.push(ev(DeltaKind::Added, "b", 2));
        agg.push(ev(DeltaKind::Added, "c", 3));
        assert_eq!(agg.dropped(), 1);
        let names: Vec<String> = agg.drain_ready().iter().map(|e| e.key().expect("key").name().to_string()).collect();
        assert_eq!(names, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn full_queue_keeps_pending_deletions() {
        let mut agg = EventAggregator::with_capacity(2);
        agg.push(ev(DeltaKind::Deleted, "a", 1));
        agg.push(ev(DeltaKind::Added, "b", 2));
        agg.push(ev(DeltaKind::Added, "c", 3));
        assert_eq!(agg.dropped(), 1);
        agg.push(ev(DeltaKind::Deleted, "d", 4));
        assert_eq!(agg.dropped(), 2);
        let kept: Vec<(String, DeltaKind)> =
            agg.drain_ready().iter().map(|e| (e.key().expect("key").name().to_string(), e.delta_kind())).collect();
        assert_eq!(kept, vec![("a".to_string(), DeltaKind::Deleted), ("d".to_string(), DeltaKind::Deleted)]);

        agg.push(ev(DeltaKind::Deleted, "x", 5));
        agg.push(ev(DeltaKind::Deleted, "y", 6));
        agg.push(ev(DeltaKind::Added, "z", 7));
        assert_eq!(agg.len(), 3);
        assert_eq!(agg.dropped(), 2);
    }
}
