use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use im::{OrdMap, OrdSet};
use lookout_core::{parse_version, Config, Listing, Resource, ResourceKey, StatusSummary, WatchEvent};
use lookout_filter::{Autocomplete, FilterSet, Filters, Suggestion};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::graph::OwnershipGraph;
use crate::status::status_for_resource;

/// Result of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Updated,
    /// An object with an equal or newer resourceVersion is already held (live or tombstoned).
    Stale,
}

/// A selected resource and the pods it transitively owns.
#[derive(Debug, Clone)]
pub struct Selection {
    pub resource: Arc<Resource>,
    pub pods: Vec<Arc<Resource>>,
}

/// Immutable state of the store, handed to readers as an `Arc` snapshot.
///
/// The large tables are persistent maps: a clone shares them, and later writes copy only
/// the touched paths.
#[derive(Debug, Clone, Default)]
pub struct StoreView {
    resources: im::HashMap<ResourceKey, Arc<Resource>>,
    graph: OwnershipGraph,
    max_version: FxHashMap<String, u64>,
    revision: u64,
    counts_by_kind: BTreeMap<String, usize>,
    counts_by_namespace: BTreeMap<String, usize>,
    pod_count: usize,
    pods_by_node: OrdMap<String, OrdSet<ResourceKey>>,
    problems: OrdSet<ResourceKey>,
    autocomplete: Autocomplete,
    filters: Filters,
}

impl StoreView {
    /// Live object at `key`; tombstones are not returned.
    pub fn get(&self, key: &ResourceKey) -> Option<&Arc<Resource>> {
        self.resources.get(key).filter(|r| !r.is_deleted)
    }

    pub fn tombstone(&self, key: &ResourceKey) -> Option<&Arc<Resource>> {
        self.resources.get(key).filter(|r| r.is_deleted)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool { self.get(key).is_some() }

    pub fn len(&self) -> usize { self.resources.values().filter(|r| !r.is_deleted).count() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn resources(&self) -> impl Iterator<Item = &Arc<Resource>> {
        self.resources.values().filter(|r| !r.is_deleted)
    }

    /// Live resources that the current filters leave visible.
    pub fn visible(&self) -> impl Iterator<Item = &Arc<Resource>> {
        self.resources().filter(|r| !r.is_filtered)
    }

    /// Live objects directly owned by `key`.
    pub fn owned(&self, key: &ResourceKey) -> Vec<&Arc<Resource>> {
        self.graph.owned(key).filter_map(|k| self.get(k)).collect()
    }

    pub fn owners_of(&self, key: &ResourceKey) -> &[ResourceKey] { self.graph.owners_of(key) }

    pub fn descendants(&self, key: &ResourceKey) -> Vec<ResourceKey> { self.graph.descendants(key) }

    /// The resource plus every Pod reachable through ownership. Unknown or deleted keys
    /// yield a `not_found` placeholder.
    pub fn select(&self, kind: &str, namespace: Option<&str>, name: &str) -> Selection {
        let key = ResourceKey::new(kind, namespace, name);
        let Some(resource) = self.get(&key) else {
            return Selection { resource: Arc::new(Resource::placeholder(kind, namespace, name)), pods: Vec::new() };
        };
        if resource.kind == "Pod" {
            return Selection { resource: Arc::clone(resource), pods: vec![Arc::clone(resource)] };
        }
        let mut pods = Vec::new();
        let mut queue: VecDeque<&ResourceKey> = VecDeque::from([&key]);
        let mut seen: FxHashSet<&ResourceKey> = FxHashSet::default();
        while let Some(owner) = queue.pop_front() {
            for child in self.graph.owned(owner) {
                if !seen.insert(child) {
                    continue;
                }
                match self.get(child) {
                    Some(r) if r.kind == "Pod" => pods.push(Arc::clone(r)),
                    Some(_) => queue.push_back(child),
                    None => {}
                }
            }
        }
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        Selection { resource: Arc::clone(resource), pods }
    }

    pub fn revision(&self) -> u64 { self.revision }

    /// High-water mark of resourceVersions observed for `kind`.
    pub fn max_version(&self, kind: &str) -> Option<u64> { self.max_version.get(kind).copied() }

    pub fn counts_by_kind(&self) -> &BTreeMap<String, usize> { &self.counts_by_kind }
    pub fn counts_by_namespace(&self) -> &BTreeMap<String, usize> { &self.counts_by_namespace }
    pub fn pod_count(&self) -> usize { self.pod_count }

    pub fn pods_on_node(&self, node: &str) -> Vec<&Arc<Resource>> {
        self.pods_by_node
            .get(node)
            .map(|keys| keys.iter().filter_map(|k| self.get(k)).collect())
            .unwrap_or_default()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> { self.pods_by_node.keys().map(|s| s.as_str()) }

    pub fn problems(&self) -> impl Iterator<Item = &Arc<Resource>> {
        self.problems.iter().filter_map(|k| self.get(k))
    }

    /// `(missing owner, waiting child)` pairs.
    pub fn unresolved(&self) -> Vec<(ResourceKey, ResourceKey)> { self.graph.unresolved() }

    pub fn suggest(&self, query: &str, limit: usize) -> Vec<Suggestion> { self.autocomplete.suggest(query, limit) }

    pub fn filters(&self) -> &Filters { &self.filters }

    /// Whether both views hold the very same resource table.
    pub fn shares_resources_with(&self, other: &StoreView) -> bool { self.resources.ptr_eq(&other.resources) }
}

/// The single mutable store. All derived state (status, graph, counters, filters) is
/// maintained by its methods; readers use `view()` or `freeze()`.
pub struct ResourceStore {
    view: StoreView,
    noisy: FxHashSet<String>,
}

impl Default for ResourceStore {
    fn default() -> Self { Self::new(&Config::default()) }
}

impl ResourceStore {
    pub fn new(cfg: &Config) -> Self {
        Self { view: StoreView::default(), noisy: cfg.noisy_kinds.iter().cloned().collect() }
    }

    pub fn view(&self) -> &StoreView { &self.view }

    pub fn freeze(&self) -> Arc<StoreView> { Arc::new(self.view.clone()) }

    pub fn select(&self, kind: &str, namespace: Option<&str>, name: &str) -> Selection {
        self.view.select(kind, namespace, name)
    }

    /// Apply one aggregated watch event.
    pub fn apply(&mut self, ev: WatchEvent) -> Option<PutOutcome> {
        match ev {
            WatchEvent::Added(r) => Some(self.put(r, true)),
            WatchEvent::Modified(r) => Some(self.put(r, false)),
            WatchEvent::Deleted(r) => {
                self.remove_object(r);
                None
            }
            WatchEvent::Unknown { .. } => None,
        }
    }

    fn bump(&mut self) {
        self.view.revision += 1;
        metrics::gauge!("store_revision", self.view.revision as f64);
    }

    fn advance_hwm(&mut self, r: &Resource) {
        match r.version() {
            Some(v) => {
                let hwm = self.view.max_version.entry(r.kind.clone()).or_insert(0);
                if v > *hwm {
                    *hwm = v;
                }
            }
            None if !r.resource_version.is_empty() => {
                warn!(kind = %r.kind, key = %r.key, resource_version = %r.resource_version, "resourceVersion is not numeric; high-water mark unchanged");
            }
            None => {}
        }
    }

    /// Whether the held object (live or tombstone) is at least as new as `incoming`.
    fn is_stale(&self, incoming: &Resource) -> bool {
        let Some(held) = self.view.resources.get(&incoming.key) else { return false; };
        match (held.version(), incoming.version()) {
            (Some(h), Some(i)) => h >= i,
            _ => !incoming.resource_version.is_empty() && held.resource_version == incoming.resource_version,
        }
    }

    /// Incremental upsert. The kind's high-water mark advances even when the object
    /// itself is rejected as stale.
    pub fn put(&mut self, mut resource: Resource, is_new: bool) -> PutOutcome {
        self.advance_hwm(&resource);
        if self.is_stale(&resource) {
            debug!(key = %resource.key, rv = %resource.resource_version, "stale update ignored");
            metrics::counter!("store_stale_total", 1u64, "kind" => resource.kind.clone());
            return PutOutcome::Stale;
        }
        let key = resource.key.clone();
        let was_live = match self.view.resources.get(&key) {
            Some(prev) if !prev.is_deleted => {
                let prev = Arc::clone(prev);
                self.unaccount(&prev);
                true
            }
            _ => false,
        };
        let old_owners = self.view.graph.unlink_child(&key);

        resource.is_deleted = false;
        resource.not_found = false;
        resource.status_summary = self.derive_status(&resource, Utc::now());
        self.view.filters.apply(&mut resource);
        self.account(&resource);
        let owner_keys: Vec<ResourceKey> = resource.owner_keys().collect();
        let kind = resource.kind.clone();
        self.view.resources.insert(key.clone(), Arc::new(resource));

        self.register_owned(&key, &owner_keys);
        for o in old_owners.iter().filter(|o| !owner_keys.contains(o)) {
            self.refresh_status(o);
        }
        let waiting = self.view.graph.take_parked(&key);
        if !waiting.is_empty() {
            debug!(owner = %key, children = waiting.len(), "resolved parked ownership");
            for child in waiting.iter() {
                self.view.graph.link(&key, child);
            }
            self.refresh_status(&key);
        }

        if is_new || !was_live || !self.noisy.contains(&kind) {
            self.bump();
        }
        if was_live { PutOutcome::Updated } else { PutOutcome::Inserted }
    }

    /// Tombstone the object at `key`. Returns `false` when nothing live was there.
    pub fn remove(&mut self, key: &ResourceKey) -> bool {
        let Some(prev) = self.view.get(key).cloned() else { return false; };
        self.unaccount(&prev);
        let owners = self.view.graph.unlink_child(key);
        for child in self.view.graph.orphan_children(key) {
            self.view.graph.park(key, &child);
        }
        let mut tomb = (*prev).clone();
        tomb.is_deleted = true;
        tomb.is_filtered = true;
        self.view.resources.insert(key.clone(), Arc::new(tomb));
        for o in owners.iter() {
            self.refresh_status(o);
        }
        self.bump();
        true
    }

    /// Remove using the final object carried by a DELETED event. A deletion older than
    /// the held object is ignored; a deletion for an unseen key leaves a tombstone.
    pub fn remove_object(&mut self, resource: Resource) -> bool {
        self.advance_hwm(&resource);
        let key = resource.key.clone();
        if let Some(held) = self.view.resources.get(&key) {
            if let (Some(h), Some(i)) = (held.version(), resource.version()) {
                if h > i {
                    debug!(key = %key, "stale deletion ignored");
                    return false;
                }
            }
            return self.remove(&key);
        }
        if resource.version().is_some() {
            let mut tomb = resource;
            tomb.is_deleted = true;
            tomb.is_filtered = true;
            self.view.resources.insert(key, Arc::new(tomb));
        }
        false
    }

    /// Full-list reconciliation. Listed kinds become authoritative: objects of those kinds
    /// that are absent from their listing are tombstoned, newer objects already held are
    /// kept, and every derived structure is rebuilt.
    pub fn replace_all(&mut self, listings: Vec<Listing>) {
        let started = Instant::now();
        let now = Utc::now();
        let mut listed_kinds: FxHashSet<String> = FxHashSet::default();
        let mut read_points: FxHashMap<String, u64> = FxHashMap::default();
        let mut incoming: FxHashMap<ResourceKey, Resource> = FxHashMap::default();
        for listing in listings {
            if let Some(v) = listing.max_version() {
                let hwm = self.view.max_version.entry(listing.kind.clone()).or_insert(0);
                *hwm = (*hwm).max(v);
            }
            if let Some(rv) = listing.resource_version.as_deref() {
                match parse_version(rv) {
                    Some(v) => {
                        read_points.insert(listing.kind.clone(), v);
                    }
                    None => warn!(kind = %listing.kind, resource_version = %rv, "list resourceVersion is not numeric"),
                }
            }
            listed_kinds.insert(listing.kind.clone());
            for item in listing.items {
                self.advance_hwm(&item);
                incoming.insert(item.key.clone(), item);
            }
        }

        let previous = std::mem::take(&mut self.view.resources);
        let mut next: FxHashMap<ResourceKey, Resource> = FxHashMap::default();
        let mut evicted = 0usize;
        for (key, held) in previous {
            if !listed_kinds.contains(key.kind()) {
                next.insert(key, (*held).clone());
                continue;
            }
            match incoming.remove(&key) {
                Some(item) => {
                    let keep_held = match (held.version(), item.version()) {
                        (Some(h), Some(i)) => h > i,
                        _ => false,
                    };
                    next.insert(key, if keep_held { (*held).clone() } else { item });
                }
                None if held.is_deleted => {
                    let newer_than_list = match (held.version(), read_points.get(key.kind())) {
                        (Some(h), Some(rp)) => h > *rp,
                        _ => false,
                    };
                    if newer_than_list {
                        next.insert(key, (*held).clone());
                    } else {
                        evicted += 1;
                    }
                }
                None => {
                    let mut tomb = (*held).clone();
                    tomb.is_deleted = true;
                    tomb.is_filtered = true;
                    next.insert(key, tomb);
                }
            }
        }
        next.extend(incoming);

        self.rebuild(next, now);
        self.bump();

        for (owner, child) in self.view.graph.unresolved() {
            warn!(owner = %owner, child = %child, "owner reference could not be resolved");
        }
        for (kind, n) in self.view.counts_by_kind.iter() {
            metrics::gauge!("store_resources", *n as f64, "kind" => kind.clone());
        }
        info!(
            kinds = listed_kinds.len(),
            resources = self.view.len(),
            evicted,
            unresolved = self.view.graph.unresolved().len(),
            took_ms = %started.elapsed().as_millis(),
            "full reconciliation applied"
        );
    }

    /// Recompute graph, status, filters and counters from scratch.
    fn rebuild(&mut self, mut objects: FxHashMap<ResourceKey, Resource>, now: DateTime<Utc>) {
        let v = &mut self.view;
        v.graph.clear();
        v.counts_by_kind.clear();
        v.counts_by_namespace.clear();
        v.pod_count = 0;
        v.pods_by_node.clear();
        v.problems.clear();
        v.autocomplete.clear();
        for (key, r) in objects.iter() {
            if r.is_deleted {
                continue;
            }
            for owner in r.owner_keys() {
                match objects.get(&owner) {
                    Some(o) if !o.is_deleted => v.graph.link(&owner, key),
                    _ => v.graph.park(&owner, key),
                }
            }
        }

        for key in children_first(&objects, &v.graph) {
            let status = match objects.get(&key) {
                Some(r) if !r.is_deleted => {
                    let owned: Vec<&Resource> =
                        v.graph.owned(&key).filter_map(|c| objects.get(c)).filter(|c| !c.is_deleted).collect();
                    status_for_resource(r, &owned, now)
                }
                _ => continue,
            };
            if let Some(r) = objects.get_mut(&key) {
                r.status_summary = status;
            }
        }

        let filters = v.filters.clone();
        v.resources = objects
            .into_iter()
            .map(|(key, mut r)| {
                if !r.is_deleted {
                    filters.apply(&mut r);
                }
                (key, Arc::new(r))
            })
            .collect();
        let live: Vec<Arc<Resource>> = v.resources.values().filter(|r| !r.is_deleted).cloned().collect();
        for r in live.iter() {
            self.account(r);
        }
    }

    fn derive_status(&self, r: &Resource, now: DateTime<Utc>) -> StatusSummary {
        let owned = self.view.owned(&r.key);
        let owned: Vec<&Resource> = owned.iter().map(|a| a.as_ref()).collect();
        status_for_resource(r, &owned, now)
    }

    /// Link `child` to each owner, parking the edges whose owner is not live yet.
    fn register_owned(&mut self, child: &ResourceKey, owners: &[ResourceKey]) {
        for owner in owners {
            if self.view.contains(owner) {
                self.view.graph.link(owner, child);
                self.refresh_status(owner);
            } else {
                debug!(owner = %owner, child = %child, "owner not yet known; parked");
                self.view.graph.park(owner, child);
            }
        }
    }

    /// Recompute the status of `key` from its owned children and propagate upward while
    /// it keeps changing.
    fn refresh_status(&mut self, key: &ResourceKey) {
        let mut pending = vec![key.clone()];
        let mut visited: FxHashSet<ResourceKey> = FxHashSet::default();
        let now = Utc::now();
        while let Some(k) = pending.pop() {
            if !visited.insert(k.clone()) {
                continue;
            }
            let Some(current) = self.view.get(&k).cloned() else { continue; };
            let status = self.derive_status(&current, now);
            if status == current.status_summary {
                continue;
            }
            let mut next = (*current).clone();
            next.status_summary = status;
            self.view.filters.apply(&mut next);
            self.view.autocomplete.forget(&current);
            self.view.autocomplete.observe(&next);
            if status.is_problem() {
                self.view.problems.insert(k.clone());
            } else {
                self.view.problems.remove(&k);
            }
            self.view.resources.insert(k.clone(), Arc::new(next));
            pending.extend(self.view.graph.owners_of(&k).iter().cloned());
        }
    }

    fn account(&mut self, r: &Resource) {
        let v = &mut self.view;
        v.autocomplete.observe(r);
        *v.counts_by_kind.entry(r.kind.clone()).or_insert(0) += 1;
        *v.counts_by_namespace.entry(r.key.scope().to_string()).or_insert(0) += 1;
        if r.kind == "Pod" {
            v.pod_count += 1;
            if let Some(node) = r.spec().get("nodeName").and_then(|n| n.as_str()) {
                match v.pods_by_node.get_mut(node) {
                    Some(set) => {
                        set.insert(r.key.clone());
                    }
                    None => {
                        v.pods_by_node.insert(node.to_string(), OrdSet::unit(r.key.clone()));
                    }
                }
            }
        }
        if r.status_summary.is_problem() {
            v.problems.insert(r.key.clone());
        } else {
            v.problems.remove(&r.key);
        }
    }

    fn unaccount(&mut self, r: &Resource) {
        let v = &mut self.view;
        v.autocomplete.forget(r);
        decrement(&mut v.counts_by_kind, &r.kind);
        decrement(&mut v.counts_by_namespace, r.key.scope());
        if r.kind == "Pod" {
            v.pod_count = v.pod_count.saturating_sub(1);
            if let Some(node) = r.spec().get("nodeName").and_then(|n| n.as_str()) {
                if let Some(set) = v.pods_by_node.get_mut(node) {
                    set.remove(&r.key);
                    if set.is_empty() {
                        v.pods_by_node.remove(node);
                    }
                }
            }
        }
        v.problems.remove(&r.key);
    }

    /// Replace the dynamic filters and re-evaluate every resource.
    pub fn set_filters<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.view.filters.dynamic = FilterSet::from_names(names);
        self.refilter();
    }

    pub fn set_global_filters<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.view.filters.global = FilterSet::from_names(names);
        self.refilter();
    }

    pub fn add_filter(&mut self, name: &str) -> bool {
        let added = self.view.filters.dynamic.add(name);
        if added {
            self.refilter();
        }
        added
    }

    pub fn remove_filter(&mut self, name: &str) -> bool {
        let removed = self.view.filters.dynamic.remove(name);
        if removed {
            self.refilter();
        }
        removed
    }

    fn refilter(&mut self) {
        let filters = &self.view.filters;
        let flipped: Vec<(ResourceKey, bool)> = self
            .view
            .resources
            .iter()
            .filter(|(_, r)| !r.is_deleted)
            .filter_map(|(k, r)| {
                let hidden = filters.is_filtered(r);
                (hidden != r.is_filtered).then(|| (k.clone(), hidden))
            })
            .collect();
        for (key, hidden) in flipped {
            if let Some(r) = self.view.resources.get_mut(&key) {
                Arc::make_mut(r).is_filtered = hidden;
            }
        }
        self.bump();
    }
}

fn decrement(map: &mut BTreeMap<String, usize>, key: &str) {
    if let Some(n) = map.get_mut(key) {
        *n = n.saturating_sub(1);
        if *n == 0 {
            map.remove(key);
        }
    }
}

/// Keys ordered so that every owned object precedes its owners.
fn children_first(objects: &FxHashMap<ResourceKey, Resource>, graph: &OwnershipGraph) -> Vec<ResourceKey> {
    let mut order = Vec::with_capacity(objects.len());
    let mut seen: FxHashSet<&ResourceKey> = FxHashSet::default();
    for root in objects.keys() {
        if !seen.insert(root) {
            continue;
        }
        let mut stack: Vec<(&ResourceKey, bool)> = vec![(root, false)];
        while let Some((k, expanded)) = stack.pop() {
            if expanded {
                order.push(k.clone());
                continue;
            }
            stack.push((k, true));
            for c in graph.owned(k) {
                if seen.insert(c) {
                    stack.push((c, false));
                }
            }
        }
    }
    order
}
