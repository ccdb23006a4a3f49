use std::collections::VecDeque;

use im::OrdSet;
use lookout_core::ResourceKey;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

/// Owner → owned adjacency with a reverse index, plus the side table of children whose
/// owner has not been observed yet.
///
/// Only the store mutates it; readers get it through a frozen `StoreView`. The maps are
/// persistent, so cloning the graph shares structure with the original.
#[derive(Debug, Clone, Default)]
pub struct OwnershipGraph {
    owned: im::HashMap<ResourceKey, OrdSet<ResourceKey>>,
    owners: im::HashMap<ResourceKey, SmallVec<[ResourceKey; 2]>>,
    unresolved: im::HashMap<ResourceKey, OrdSet<ResourceKey>>,
}

impl OwnershipGraph {
    pub fn clear(&mut self) {
        self.owned.clear();
        self.owners.clear();
        self.unresolved.clear();
    }

    pub fn link(&mut self, owner: &ResourceKey, child: &ResourceKey) {
        if self.owned.entry(owner.clone()).or_insert_with(OrdSet::new).insert(child.clone()).is_none() {
            self.owners.entry(child.clone()).or_insert_with(SmallVec::new).push(owner.clone());
        }
    }

    /// Record `child` as waiting for `owner` to appear.
    pub fn park(&mut self, owner: &ResourceKey, child: &ResourceKey) {
        self.unresolved.entry(owner.clone()).or_insert_with(OrdSet::new).insert(child.clone());
    }

    /// Children that were waiting for `owner`; they are no longer tracked as unresolved.
    pub fn take_parked(&mut self, owner: &ResourceKey) -> OrdSet<ResourceKey> {
        self.unresolved.remove(owner).unwrap_or_default()
    }

    /// Remove every edge where `child` is the owned side, including parked ones.
    /// Returns the owners it was detached from.
    pub fn unlink_child(&mut self, child: &ResourceKey) -> SmallVec<[ResourceKey; 2]> {
        let owners = self.owners.remove(child).unwrap_or_default();
        for o in owners.iter() {
            if let Some(set) = self.owned.get_mut(o) {
                set.remove(child);
                if set.is_empty() {
                    self.owned.remove(o);
                }
            }
        }
        let waiting_on: Vec<ResourceKey> =
            self.unresolved.iter().filter(|(_, waiting)| waiting.contains(child)).map(|(o, _)| o.clone()).collect();
        for o in waiting_on {
            if let Some(waiting) = self.unresolved.get_mut(&o) {
                waiting.remove(child);
                if waiting.is_empty() {
                    self.unresolved.remove(&o);
                }
            }
        }
        owners
    }

    /// Remove every edge where `owner` is the owning side. Returns the detached children.
    pub fn orphan_children(&mut self, owner: &ResourceKey) -> OrdSet<ResourceKey> {
        let children = self.owned.remove(owner).unwrap_or_default();
        for c in children.iter() {
            if let Some(list) = self.owners.get_mut(c) {
                list.retain(|o| o != owner);
                if list.is_empty() {
                    self.owners.remove(c);
                }
            }
        }
        children
    }

    pub fn owned(&self, owner: &ResourceKey) -> impl Iterator<Item = &ResourceKey> {
        self.owned.get(owner).into_iter().flat_map(|s| s.iter())
    }

    pub fn owners_of(&self, child: &ResourceKey) -> &[ResourceKey] {
        self.owners.get(child).map(|s| s.as_slice()).unwrap_or(&[])
    }

    /// Everything transitively owned by `root`, breadth-first, excluding `root`.
    pub fn descendants(&self, root: &ResourceKey) -> Vec<ResourceKey> {
        let mut seen: FxHashSet<&ResourceKey> = FxHashSet::default();
        seen.insert(root);
        let mut queue: VecDeque<&ResourceKey> = VecDeque::from([root]);
        let mut out = Vec::new();
        while let Some(k) = queue.pop_front() {
            for c in self.owned(k) {
                if seen.insert(c) {
                    out.push(c.clone());
                    queue.push_back(c);
                }
            }
        }
        out
    }

    /// `(missing owner, waiting child)` pairs, sorted.
    pub fn unresolved(&self) -> Vec<(ResourceKey, ResourceKey)> {
        let mut out: Vec<(ResourceKey, ResourceKey)> = self
            .unresolved
            .iter()
            .flat_map(|(o, children)| children.iter().map(move |c| (o.clone(), c.clone())))
            .collect();
        out.sort();
        out
    }

    pub fn edge_count(&self) -> usize { self.owned.values().map(|s| s.len()).sum() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(kind: &str, name: &str) -> ResourceKey { ResourceKey::new(kind, Some("default"), name) }

    #[test]
    fn link_and_unlink_keep_both_indexes() {
        let mut g = OwnershipGraph::default();
        let (d, rs, p) = (k("Deployment", "web"), k("ReplicaSet", "web-1"), k("Pod", "web-1-a"));
        g.link(&d, &rs);
        g.link(&rs, &p);
        g.link(&rs, &p);
        assert_eq!(g.edge_count(), 2);
        assert_eq!(g.owners_of(&p), &[rs.clone()]);
        assert_eq!(g.descendants(&d), vec![rs.clone(), p.clone()]);

        let owners = g.unlink_child(&rs);
        assert_eq!(owners.as_slice(), &[d.clone()]);
        assert_eq!(g.owned(&d).count(), 0);
        assert_eq!(g.orphan_children(&rs).into_iter().collect::<Vec<_>>(), vec![p.clone()]);
        assert!(g.owners_of(&p).is_empty());
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn parked_children_are_taken_once() {
        let mut g = OwnershipGraph::default();
        let (d, rs) = (k("Deployment", "web"), k("ReplicaSet", "web-1"));
        g.park(&d, &rs);
        assert_eq!(g.unresolved(), vec![(d.clone(), rs.clone())]);
        assert_eq!(g.take_parked(&d).len(), 1);
        assert!(g.take_parked(&d).is_empty());
        assert!(g.unresolved().is_empty());
    }

    #[test]
    fn descendants_tolerate_cycles() {
        let mut g = OwnershipGraph::default();
        let (a, b) = (k("Thing", "a"), k("Thing", "b"));
        g.link(&a, &b);
        g.link(&b, &a);
        assert_eq!(g.descendants(&a), vec![b.clone()]);
    }
}
