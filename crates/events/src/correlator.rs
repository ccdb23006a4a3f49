use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::Arc;

use im::OrdMap;
use lookout_core::{Config, ResourceKey};
use lookout_store::StoreView;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::{ClusterEvent, RawEvent};

fn strip_last_segment(name: &str) -> Option<&str> {
    name.rsplit_once('-').map(|(head, _)| head).filter(|h| !h.is_empty())
}

/// Likely owners of an object that is not in the store, guessed from generated names,
/// nearest first: `Pod → ReplicationController | ReplicaSet → Deployment`.
pub fn owner_candidates(view: &StoreView, key: &ResourceKey) -> Vec<ResourceKey> {
    let mut out = Vec::new();
    let mut current = key.clone();
    loop {
        let Some(base) = strip_last_segment(current.name()) else { break; };
        let next = match current.kind() {
            "Pod" => {
                let rc = current.sibling("ReplicationController", base);
                if view.contains(&rc) { rc } else { current.sibling("ReplicaSet", base) }
            }
            "ReplicaSet" => current.sibling("Deployment", base),
            _ => break,
        };
        out.push(next.clone());
        current = next;
    }
    out
}

/// Events kept per resource before the oldest are dropped.
pub const EVENTS_PER_RESOURCE: usize = 100;

/// Correlated events, cloned into snapshots for readers. The per-resource tables are
/// persistent maps, so a snapshot shares them with the live index.
#[derive(Debug, Clone, Default)]
pub struct EventIndex {
    by_resource: im::HashMap<ResourceKey, OrdMap<String, Arc<ClusterEvent>>>,
    /// Where each attached event id currently lives; an id is attached at most once.
    ids: im::HashMap<String, ResourceKey>,
    recent: Vec<Arc<ClusterEvent>>,
    detached: VecDeque<Arc<ClusterEvent>>,
}

fn newest_first(events: &mut [Arc<ClusterEvent>]) {
    events.sort_by(|a, b| Reverse(a.timestamp).cmp(&Reverse(b.timestamp)).then_with(|| a.id.cmp(&b.id)));
}

impl EventIndex {
    /// Events of `key` and of everything it transitively owns, newest first, one per id.
    pub fn select_for(&self, view: &StoreView, key: &ResourceKey) -> Vec<Arc<ClusterEvent>> {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        let mut out = Vec::new();
        let keys = std::iter::once(key.clone()).chain(view.descendants(key));
        for k in keys {
            if let Some(events) = self.by_resource.get(&k) {
                for ev in events.values() {
                    if seen.insert(ev.id.as_str()) {
                        out.push(Arc::clone(ev));
                    }
                }
            }
        }
        newest_first(&mut out);
        out
    }

    /// The most recent events across the cluster, newest first.
    pub fn recent(&self) -> &[Arc<ClusterEvent>] { &self.recent }

    pub fn detached(&self) -> impl Iterator<Item = &Arc<ClusterEvent>> { self.detached.iter() }

    pub fn detached_len(&self) -> usize { self.detached.len() }

    pub fn attached_len(&self) -> usize { self.by_resource.values().map(|m| m.len()).sum() }

    /// Resources that currently have events attached.
    pub fn resources_len(&self) -> usize { self.by_resource.len() }

    /// Drop the attached copy of `id`, wherever it is.
    fn unattach(&mut self, id: &str) {
        let Some(key) = self.ids.remove(id) else { return; };
        if let Some(events) = self.by_resource.get_mut(&key) {
            events.remove(id);
            if events.is_empty() {
                self.by_resource.remove(&key);
            }
        }
    }

    /// Forget resources that are neither live nor tombstoned in `view`.
    fn prune(&mut self, view: &StoreView) -> usize {
        let gone: Vec<ResourceKey> =
            self.by_resource.keys().filter(|k| view.get(k).is_none() && view.tombstone(k).is_none()).cloned().collect();
        for key in &gone {
            if let Some(events) = self.by_resource.remove(key) {
                for id in events.keys() {
                    self.ids.remove(id);
                }
            }
        }
        gone.len()
    }
}

/// Attaches cluster events to resources, directly or through guessed owners, and
/// retries detached ones on every reconciliation.
pub struct EventCorrelator {
    index: EventIndex,
    recent_cap: usize,
    detached_cap: usize,
    per_resource_cap: usize,
}

impl EventCorrelator {
    pub fn new(recent_cap: usize, detached_cap: usize) -> Self {
        Self { index: EventIndex::default(), recent_cap, detached_cap: detached_cap.max(1), per_resource_cap: EVENTS_PER_RESOURCE }
    }

    pub fn with_per_resource_cap(mut self, cap: usize) -> Self {
        self.per_resource_cap = cap.max(1);
        self
    }

    pub fn from_config(cfg: &Config) -> Self { Self::new(cfg.recent_events, cfg.detached_events_cap) }

    pub fn index(&self) -> &EventIndex { &self.index }

    pub fn freeze(&self) -> Arc<EventIndex> { Arc::new(self.index.clone()) }

    pub fn recent(&self) -> &[Arc<ClusterEvent>] { self.index.recent() }

    pub fn detached(&self) -> impl Iterator<Item = &Arc<ClusterEvent>> { self.index.detached() }

    pub fn select_for(&self, view: &StoreView, key: &ResourceKey) -> Vec<Arc<ClusterEvent>> {
        self.index.select_for(view, key)
    }

    fn target(view: &StoreView, involved: &ResourceKey) -> Option<ResourceKey> {
        if view.contains(involved) {
            return Some(involved.clone());
        }
        owner_candidates(view, involved).into_iter().find(|k| view.contains(k))
    }

    fn attach(&mut self, key: ResourceKey, mut ev: ClusterEvent) -> Arc<ClusterEvent> {
        if self.index.ids.get(&ev.id).is_some_and(|prev| *prev != key) {
            self.index.unattach(&ev.id);
        }
        ev.key = Some(key.clone());
        let ev = Arc::new(ev);
        self.index.ids.insert(ev.id.clone(), key.clone());
        let events = self.index.by_resource.entry(key).or_insert_with(OrdMap::new);
        events.insert(ev.id.clone(), Arc::clone(&ev));
        if events.len() > self.per_resource_cap {
            let oldest = events.values().min_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id))).map(|e| e.id.clone());
            if let Some(id) = oldest {
                events.remove(&id);
                self.index.ids.remove(&id);
            }
        }
        ev
    }

    fn park(&mut self, ev: Arc<ClusterEvent>) {
        self.index.detached.retain(|d| d.id != ev.id);
        if self.index.detached.len() >= self.detached_cap {
            if let Some(old) = self.index.detached.pop_front() {
                debug!(id = %old.id, involved = %old.involved, "detached pool full; evicting oldest");
            }
        }
        self.index.detached.push_back(ev);
    }

    fn remember(&mut self, ev: Arc<ClusterEvent>) {
        let recent = &mut self.index.recent;
        recent.retain(|r| r.id != ev.id);
        recent.push(ev);
        newest_first(recent);
        recent.truncate(self.recent_cap);
    }

    /// Correlate a batch of events against `view`. Returns how many were attached.
    pub fn receive(&mut self, view: &StoreView, events: Vec<RawEvent>) -> usize {
        let mut attached = 0;
        for raw in events {
            let ev = match ClusterEvent::from_raw(&raw) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(event = %raw.object.key, error = %e, "skipping event");
                    continue;
                }
            };
            self.index.detached.retain(|d| d.id != ev.id);
            let stored = match Self::target(view, &ev.involved) {
                Some(key) => {
                    attached += 1;
                    self.attach(key, ev)
                }
                None => {
                    debug!(involved = %ev.involved, "event detached");
                    self.index.unattach(&ev.id);
                    let ev = Arc::new(ev);
                    self.park(Arc::clone(&ev));
                    ev
                }
            };
            self.remember(stored);
        }
        metrics::gauge!("events_detached", self.index.detached.len() as f64);
        attached
    }

    /// Retry every detached event against `view` and forget resources the view no longer
    /// knows. Returns how many events were reattached.
    pub fn reconcile(&mut self, view: &StoreView) -> usize {
        let pruned = self.index.prune(view);
        if pruned > 0 {
            debug!(pruned, "events of forgotten resources dropped");
        }
        let pending = std::mem::take(&mut self.index.detached);
        let mut reattached = 0;
        for ev in pending {
            match Self::target(view, &ev.involved) {
                Some(key) => {
                    let attached = self.attach(key, (*ev).clone());
                    self.index.recent.iter_mut().filter(|r| r.id == attached.id).for_each(|r| *r = Arc::clone(&attached));
                    reattached += 1;
                }
                None => self.index.detached.push_back(ev),
            }
        }
        if reattached > 0 {
            debug!(reattached, still_detached = self.index.detached.len(), "detached events reconciled");
        }
        metrics::gauge!("events_detached", self.index.detached.len() as f64);
        reattached
    }
}
