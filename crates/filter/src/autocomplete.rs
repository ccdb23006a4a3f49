use std::collections::BTreeSet;

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use im::OrdMap;
use lookout_core::Resource;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub term: String,
    pub score: i64,
}

/// Candidate filter terms observed on resources (`namespace:`, `kind:`, `status:`, ...),
/// counted by how many live resources carry them.
#[derive(Debug, Clone, Default)]
pub struct Autocomplete {
    terms: OrdMap<String, usize>,
}

fn push(out: &mut BTreeSet<String>, field: &str, value: &str) {
    if !value.is_empty() {
        out.insert(format!("{}:{}", field, value));
    }
}

/// Every term `r` contributes, once each.
fn terms_of(r: &Resource) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if let Some(ns) = r.namespace.as_deref() {
        push(&mut out, "namespace", ns);
    }
    push(&mut out, "kind", &r.kind);
    if let Some(app) = r.labels.get("app") {
        push(&mut out, "app", app);
    }
    push(&mut out, "status", r.status_summary.as_str());
    match r.kind.as_str() {
        "Pod" => {
            if let Some(node) = r.spec().get("nodeName").and_then(|v| v.as_str()) {
                push(&mut out, "node", node);
            }
        }
        "Node" => {
            for (k, v) in r.labels.iter() {
                let short = k.rsplit('/').next().unwrap_or(k);
                push(&mut out, short, v);
            }
        }
        "RoleBinding" | "ClusterRoleBinding" => {
            if let Some(subjects) = r.field("subjects").as_array() {
                for name in subjects.iter().filter_map(|s| s.get("name").and_then(|n| n.as_str())) {
                    push(&mut out, "subject", name);
                }
            }
            if let Some(role) = r.field("roleRef").get("name").and_then(|n| n.as_str()) {
                push(&mut out, "role", role);
            }
        }
        _ => {}
    }
    out
}

impl Autocomplete {
    pub fn len(&self) -> usize { self.terms.len() }
    pub fn is_empty(&self) -> bool { self.terms.is_empty() }
    pub fn clear(&mut self) { self.terms.clear(); }

    pub fn observe(&mut self, r: &Resource) {
        for term in terms_of(r) {
            let n = self.terms.get(&term).copied().unwrap_or(0);
            self.terms.insert(term, n + 1);
        }
    }

    /// Retract what an earlier `observe` of the same object added.
    pub fn forget(&mut self, r: &Resource) {
        for term in terms_of(r) {
            match self.terms.get(&term).copied() {
                Some(n) if n > 1 => {
                    self.terms.insert(term, n - 1);
                }
                Some(_) => {
                    self.terms.remove(&term);
                }
                None => {}
            }
        }
    }

    /// Rank known terms against `query`: best fuzzy score first, then alphabetical.
    /// An empty query lists terms alphabetically.
    pub fn suggest(&self, query: &str, limit: usize) -> Vec<Suggestion> {
        let query = query.trim();
        if query.is_empty() {
            return self.terms.keys().take(limit).map(|t| Suggestion { term: t.clone(), score: 0 }).collect();
        }
        let matcher = SkimMatcherV2::default();
        let mut out: Vec<Suggestion> = self
            .terms
            .keys()
            .filter_map(|t| matcher.fuzzy_match(t, query).map(|score| Suggestion { term: t.clone(), score }))
            .collect();
        out.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.term.cmp(&b.term)));
        out.truncate(limit);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn observes_workload_and_binding_terms() {
        let mut ac = Autocomplete::default();
        let pod = Resource::from_value(json!({
            "kind": "Pod",
            "metadata": { "name": "web-1", "namespace": "default", "labels": { "app": "web" } },
            "spec": { "nodeName": "node-a" }
        }))
        .expect("pod");
        ac.observe(&pod);
        let rb = Resource::from_value(json!({
            "kind": "RoleBinding",
            "metadata": { "name": "rb", "namespace": "default" },
            "subjects": [{ "kind": "User", "name": "alice" }],
            "roleRef": { "name": "view" }
        }))
        .expect("rb");
        ac.observe(&rb);
        let all: Vec<String> = ac.suggest("", 100).into_iter().map(|s| s.term).collect();
        for t in ["namespace:default", "kind:Pod", "app:web", "node:node-a", "subject:alice", "role:view"] {
            assert!(all.contains(&t.to_string()), "missing {}", t);
        }
        // Unknown status renders as "" and is not offered
        assert!(!all.iter().any(|t| t == "status:"));
    }

    #[test]
    fn fuzzy_ranking_prefers_closer_terms() {
        let mut ac = Autocomplete::default();
        for (ns, name) in [("default", "a"), ("kube-system", "b"), ("kube-public", "c")] {
            let r = Resource::from_value(json!({ "kind": "ConfigMap", "metadata": { "name": name, "namespace": ns } })).expect("cm");
            ac.observe(&r);
        }
        let hits = ac.suggest("kubesys", 10);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].term, "namespace:kube-system");
        assert!(ac.suggest("zzzz", 10).is_empty());
    }

    #[test]
    fn forgotten_terms_disappear_once_unused() {
        let mut ac = Autocomplete::default();
        let a = Resource::from_value(json!({ "kind": "ConfigMap", "metadata": { "name": "a", "namespace": "dev" } })).expect("a");
        let b = Resource::from_value(json!({ "kind": "ConfigMap", "metadata": { "name": "b", "namespace": "dev" } })).expect("b");
        ac.observe(&a);
        ac.observe(&b);
        ac.forget(&a);
        assert!(ac.suggest("", 10).iter().any(|s| s.term == "namespace:dev"));
        ac.forget(&b);
        assert!(ac.is_empty());
    }
}
