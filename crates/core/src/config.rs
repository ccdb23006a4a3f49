//! Runtime configuration, read from `LOOKOUT_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::{DeltaKind, LookoutError};

/// Minimum interval between accepted events of one class.
///
/// Written as `Kind/TYPE=ms` or `Kind/TYPE/name=ms`, e.g. `Endpoints/MODIFIED=10000`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThrottleRule {
    pub kind: String,
    pub delta: DeltaKind,
    pub name: Option<String>,
    pub interval: Duration,
}

impl FromStr for ThrottleRule {
    type Err = LookoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || LookoutError::MalformedPayload(format!("invalid throttle rule: {} (expect Kind/TYPE[/name]=ms)", s));
        let (class, ms) = s.trim().split_once('=').ok_or_else(bad)?;
        let ms = ms.trim().parse::<u64>().map_err(|_| bad())?;
        let parts: Vec<&str> = class.split('/').collect();
        let (kind, delta, name) = match parts.as_slice() {
            [kind, ty] => (*kind, *ty, None),
            [kind, ty, name] => (*kind, *ty, Some((*name).to_string())),
            _ => return Err(bad()),
        };
        let delta = DeltaKind::parse(delta);
        if kind.is_empty() || delta == DeltaKind::Unknown {
            return Err(bad());
        }
        Ok(Self { kind: kind.to_string(), delta, name, interval: Duration::from_millis(ms) })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Aggregation flush interval.
    pub tick: Duration,
    /// Connect attempts before falling back to long-polling.
    pub retry_limit: u32,
    pub retry_backoff: Duration,
    /// Pause between long-poll rounds in the fallback transport.
    pub poll_interval: Duration,
    pub poll_timeout_secs: u32,
    pub recent_events: usize,
    pub detached_events_cap: usize,
    pub throttle_purge: Duration,
    pub throttles: Vec<ThrottleRule>,
    /// Periodic full reconciliation.
    pub relist: Duration,
    pub queue_cap: usize,
    /// Kinds whose updates do not bump the store revision.
    pub noisy_kinds: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1000),
            retry_limit: 3,
            retry_backoff: Duration::from_millis(3000),
            poll_interval: Duration::from_millis(5000),
            poll_timeout_secs: 10,
            recent_events: 20,
            detached_events_cap: 1000,
            throttle_purge: Duration::from_secs(120),
            throttles: vec![ThrottleRule {
                kind: "Endpoints".into(),
                delta: DeltaKind::Modified,
                name: None,
                interval: Duration::from_millis(10_000),
            }],
            relist: Duration::from_secs(300),
            queue_cap: 2048,
            noisy_kinds: vec!["Endpoints".into()],
        }
    }
}

impl Config {
    pub fn from_env() -> Self { Self::from_lookup(|name| std::env::var(name).ok()) }

    /// Read every knob through `lookup`. Unparseable values, and zero for the periods that
    /// drive timers, fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let env = Env { lookup: &lookup };
        let throttles = match lookup("LOOKOUT_THROTTLES") {
            Some(s) if !s.trim().is_empty() => {
                let parsed: Result<Vec<ThrottleRule>, _> = s.split(',').filter(|p| !p.trim().is_empty()).map(str::parse).collect();
                match parsed {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "invalid LOOKOUT_THROTTLES; using defaults");
                        d.throttles.clone()
                    }
                }
            }
            _ => d.throttles.clone(),
        };
        Self {
            tick: env.period_ms("LOOKOUT_TICK_MS", d.tick),
            retry_limit: env.parse("LOOKOUT_WATCH_RETRIES", d.retry_limit),
            retry_backoff: env.ms("LOOKOUT_WATCH_BACKOFF_MS", d.retry_backoff),
            poll_interval: env.period_ms("LOOKOUT_POLL_MS", d.poll_interval),
            poll_timeout_secs: env.parse("LOOKOUT_POLL_TIMEOUT_SECS", d.poll_timeout_secs),
            recent_events: env.parse("LOOKOUT_RECENT_EVENTS", d.recent_events),
            detached_events_cap: env.parse("LOOKOUT_DETACHED_CAP", d.detached_events_cap),
            throttle_purge: env.period_ms("LOOKOUT_THROTTLE_PURGE_MS", d.throttle_purge),
            throttles,
            relist: env.period_secs("LOOKOUT_RELIST_SECS", d.relist),
            queue_cap: env.nonzero("LOOKOUT_QUEUE_CAP", d.queue_cap),
            noisy_kinds: d.noisy_kinds,
        }
    }
}

impl Config {
    /// Clamp zero timer periods and capacities that would stall or panic the runtime.
    pub fn sanitized(mut self) -> Self {
        let d = Self::default();
        for (field, default) in [
            (&mut self.tick, d.tick),
            (&mut self.throttle_purge, d.throttle_purge),
            (&mut self.relist, d.relist),
            (&mut self.poll_interval, d.poll_interval),
        ] {
            if field.is_zero() {
                *field = default;
            }
        }
        if self.queue_cap == 0 {
            self.queue_cap = d.queue_cap;
        }
        self
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: FromStr + Copy>(&self, name: &str, default: T) -> T {
        match (self.lookup)(name) {
            Some(s) => s.trim().parse::<T>().unwrap_or_else(|_| {
                warn!(var = name, value = %s, "invalid value; using default");
                default
            }),
            None => default,
        }
    }

    fn nonzero<T: FromStr + Copy + Default + PartialEq>(&self, name: &str, default: T) -> T {
        let v = self.parse(name, default);
        if v == T::default() {
            warn!(var = name, "zero is not allowed; using default");
            return default;
        }
        v
    }

    fn ms(&self, name: &str, default: Duration) -> Duration { Duration::from_millis(self.parse(name, default.as_millis() as u64)) }

    fn period_ms(&self, name: &str, default: Duration) -> Duration {
        Duration::from_millis(self.nonzero(name, default.as_millis() as u64))
    }

    fn period_secs(&self, name: &str, default: Duration) -> Duration { Duration::from_secs(self.nonzero(name, default.as_secs())) }
}
