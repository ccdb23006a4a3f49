use std::time::{Duration, Instant};

use lookout_core::{Config, DeltaKind, ThrottleRule, WatchEvent};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Drops repeated events of noisy classes that arrive faster than their rule allows.
///
/// Entries are keyed by `namespace/kind/name/TYPE`; the rule is looked up by kind and
/// type, with a rule naming the object taking precedence over a kind-wide one.
pub struct ThrottleFilter {
    rules: Vec<ThrottleRule>,
    last_seen: FxHashMap<String, (Instant, Duration)>,
    dropped: u64,
}

impl ThrottleFilter {
    pub fn new(rules: Vec<ThrottleRule>) -> Self {
        Self { rules, last_seen: FxHashMap::default(), dropped: 0 }
    }

    pub fn from_config(cfg: &Config) -> Self { Self::new(cfg.throttles.clone()) }

    pub fn dropped(&self) -> u64 { self.dropped }
    pub fn tracked(&self) -> usize { self.last_seen.len() }

    fn interval_for(&self, kind: &str, delta: DeltaKind, name: &str) -> Option<Duration> {
        let mut kind_wide = None;
        for r in self.rules.iter().filter(|r| r.kind == kind && r.delta == delta) {
            match r.name.as_deref() {
                Some(n) if n == name => return Some(r.interval),
                Some(_) => {}
                None => kind_wide = Some(r.interval),
            }
        }
        kind_wide
    }

    /// Returns `true` when the event should be passed on.
    pub fn admit(&mut self, ev: &WatchEvent, now: Instant) -> bool {
        let Some(r) = ev.resource() else { return true; };
        let delta = ev.delta_kind();
        let Some(interval) = self.interval_for(&r.kind, delta, &r.name) else { return true; };
        let key = format!("{}/{}/{}/{}", r.key.scope(), r.kind, r.name, delta.as_str());
        if let Some((last, _)) = self.last_seen.get(&key) {
            if now.saturating_duration_since(*last) < interval {
                self.dropped += 1;
                metrics::counter!("throttle_dropped_total", 1u64, "kind" => r.kind.clone());
                debug!(key = %key, "throttled");
                return false;
            }
        }
        self.last_seen.insert(key, (now, interval));
        true
    }

    /// Forget entries older than their own interval. Returns how many were removed.
    pub fn purge(&mut self, now: Instant) -> usize {
        let before = self.last_seen.len();
        self.last_seen.retain(|_, (last, interval)| now.saturating_duration_since(*last) <= *interval);
        let purged = before - self.last_seen.len();
        if purged > 0 {
            debug!(purged, remaining = self.last_seen.len(), "throttle entries purged");
        }
        purged
    }
}
