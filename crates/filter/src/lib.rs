//! Lookout filters: mark resources visible or hidden without removing them from the store.
//!
//! A filter is written `field:value`; a bare `value` targets the wildcard field `*`.
//! Values of one field are OR-ed, fields are AND-ed. A leading `!` on the field negates
//! that field's match. Global (session) filters are evaluated before dynamic (user-entered)
//! ones and short-circuit.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use lookout_core::Resource;
use serde::Serialize;
use serde_json::Value;

mod autocomplete;

pub use autocomplete::{Autocomplete, Suggestion};

pub const ZONE_LABEL: &str = "failure-domain.beta.kubernetes.io/zone";
pub const REGION_LABEL: &str = "failure-domain.beta.kubernetes.io/region";
pub const INSTANCE_TYPE_LABEL: &str = "beta.kubernetes.io/instance-type";
pub const ROLE_LABEL: &str = "kubernetes.io/role";
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

pub const WILDCARD: &str = "*";

/// Split `field:value`; a bare value targets the wildcard field.
pub fn split_filter(name: &str) -> (&str, &str) {
    match name.split_once(':') {
        Some((field, value)) => (field, value),
        None => (WILDCARD, name),
    }
}

/// `field → set<value>`, remembering the filter names in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterSet {
    fields: BTreeMap<String, BTreeSet<String>>,
    names: Vec<String>,
}

impl FilterSet {
    pub fn new() -> Self { Self::default() }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for n in names {
            set.add(n.as_ref());
        }
        set
    }

    /// Returns `false` when the filter was already present.
    pub fn add(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let (field, value) = split_filter(name);
        let inserted = self.fields.entry(field.to_string()).or_default().insert(value.to_string());
        if inserted {
            self.names.push(name.to_string());
        }
        inserted
    }

    /// Returns `false` when the filter was not present.
    pub fn remove(&mut self, name: &str) -> bool {
        let name = name.trim();
        let (field, value) = split_filter(name);
        let Some(values) = self.fields.get_mut(field) else { return false; };
        if !values.remove(value) {
            return false;
        }
        if values.is_empty() {
            self.fields.remove(field);
        }
        if let Some(i) = self.names.iter().position(|n| n == name) {
            self.names.remove(i);
        }
        true
    }

    pub fn is_empty(&self) -> bool { self.fields.is_empty() }
    pub fn names(&self) -> &[String] { &self.names }
    pub fn fields(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> { self.fields.iter().map(|(k, v)| (k.as_str(), v)) }

    /// True when every configured field matches the resource. An empty set matches everything.
    pub fn matches(&self, resource: &Resource) -> bool {
        self.fields.iter().all(|(field, values)| field_matches(field, values, resource))
    }
}

/// Global and dynamic filters held together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Filters {
    pub global: FilterSet,
    pub dynamic: FilterSet,
}

impl Filters {
    pub fn is_empty(&self) -> bool { self.global.is_empty() && self.dynamic.is_empty() }

    pub fn is_filtered(&self, resource: &Resource) -> bool { apply_filters(&self.global, &self.dynamic, resource) }

    /// Update `resource.is_filtered` in place and return the new value.
    pub fn apply(&self, resource: &mut Resource) -> bool {
        resource.is_filtered = self.is_filtered(resource);
        resource.is_filtered
    }
}

/// Returns `true` when the resource should be hidden.
pub fn apply_filters(global: &FilterSet, dynamic: &FilterSet, resource: &Resource) -> bool {
    if !global.matches(resource) {
        return true;
    }
    !dynamic.matches(resource)
}

fn field_matches(field: &str, values: &BTreeSet<String>, r: &Resource) -> bool {
    let (negate, field) = match field.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, field),
    };
    let matched = match field {
        WILDCARD => wildcard_matches(values, r),
        "status" => values.contains(r.status_summary.as_str()),
        "namespace" => values.contains(r.key.scope()),
        "node" => r.kind == "Pod" && r.spec().get("nodeName").and_then(|v| v.as_str()).map(|n| values.contains(n)).unwrap_or(false),
        "subject" => r
            .field("subjects")
            .as_array()
            .map(|subs| subs.iter().filter_map(|s| s.get("name").and_then(|n| n.as_str())).any(|n| values.contains(n)))
            .unwrap_or(false),
        "zone" => label_in(r, ZONE_LABEL, values) || r.field("parameters").get("zone").and_then(|z| z.as_str()).map(|z| values.contains(z)).unwrap_or(false),
        "region" => label_in(r, REGION_LABEL, values),
        "instanceType" => label_in(r, INSTANCE_TYPE_LABEL, values),
        "role" => label_in(r, ROLE_LABEL, values),
        "hostname" => label_in(r, HOSTNAME_LABEL, values),
        _ => generic_matches(field, values, r),
    };
    matched != negate
}

fn label_in(r: &Resource, label: &str, values: &BTreeSet<String>) -> bool {
    r.labels.get(label).map(|v| values.contains(v)).unwrap_or(false)
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn wildcard_matches(values: &BTreeSet<String>, r: &Resource) -> bool {
    let hit = |s: &str| values.iter().any(|v| s.contains(v.as_str()));
    if let Some(meta) = r.metadata().as_object() {
        if meta.values().filter_map(scalar_string).any(|s| hit(s.as_str())) {
            return true;
        }
    }
    r.labels.values().any(|v| hit(v.as_str()))
}

fn generic_matches(field: &str, values: &BTreeSet<String>, r: &Resource) -> bool {
    let in_values = |v: Option<&Value>| v.and_then(scalar_string).map(|s| values.contains(&s)).unwrap_or(false);
    in_values(r.metadata().get(field))
        || in_values(r.raw.get(field))
        || r.labels.get(field).map(|v| values.contains(v)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_core::StatusSummary;
    use serde_json::json;

    fn pod(ns: &str, name: &str, node: &str, app: &str) -> Resource {
        Resource::from_value(json!({
            "kind": "Pod",
            "metadata": { "name": name, "namespace": ns, "resourceVersion": "1", "labels": { "app": app } },
            "spec": { "nodeName": node }
        }))
        .expect("pod")
    }

    #[test]
    fn split_defaults_to_wildcard() {
        assert_eq!(split_filter("status:ok"), ("status", "ok"));
        assert_eq!(split_filter("web"), ("*", "web"));
        assert_eq!(split_filter("!namespace:kube-system"), ("!namespace", "kube-system"));
    }

    #[test]
    fn add_and_remove_dedupe() {
        let mut f = FilterSet::new();
        assert!(f.add("namespace:default"));
        assert!(!f.add("namespace:default"));
        assert!(f.add("namespace:prod"));
        assert_eq!(f.names(), &["namespace:default".to_string(), "namespace:prod".to_string()]);
        assert!(f.remove("namespace:default"));
        assert!(!f.remove("namespace:default"));
        assert!(f.remove("namespace:prod"));
        assert!(f.is_empty());
    }

    #[test]
    fn no_filters_never_hide() {
        let r = pod("default", "web-1", "n1", "web");
        assert!(!apply_filters(&FilterSet::new(), &FilterSet::new(), &r));
    }

    #[test]
    fn values_or_fields_and() {
        let r = pod("default", "web-1", "n1", "web");
        let f = FilterSet::from_names(["namespace:default", "namespace:prod", "app:web"]);
        assert!(f.matches(&r));
        let f = FilterSet::from_names(["namespace:default", "app:api"]);
        assert!(!f.matches(&r));
    }

    #[test]
    fn reserved_fields() {
        let mut r = pod("default", "web-1", "n1", "web");
        r.status_summary = StatusSummary::Warning;
        assert!(FilterSet::from_names(["status:warning"]).matches(&r));
        assert!(FilterSet::from_names(["node:n1"]).matches(&r));
        assert!(!FilterSet::from_names(["node:n2"]).matches(&r));
        assert!(FilterSet::from_names(["kind:Pod"]).matches(&r));

        let binding = Resource::from_value(json!({
            "kind": "RoleBinding",
            "metadata": { "name": "rb", "namespace": "default" },
            "subjects": [{ "kind": "User", "name": "alice" }]
        }))
        .expect("binding");
        assert!(FilterSet::from_names(["subject:alice"]).matches(&binding));
        assert!(!FilterSet::from_names(["node:n1"]).matches(&binding));
    }

    #[test]
    fn wildcard_is_substring_over_metadata_and_labels() {
        let r = pod("default", "web-1", "n1", "frontend");
        assert!(FilterSet::from_names(["web"]).matches(&r));
        assert!(FilterSet::from_names(["front"]).matches(&r));
        assert!(!FilterSet::from_names(["backend"]).matches(&r));
    }

    #[test]
    fn negation_inverts_field() {
        let r = pod("kube-system", "dns-1", "n1", "dns");
        assert!(!FilterSet::from_names(["!namespace:kube-system"]).matches(&r));
        assert!(FilterSet::from_names(["!namespace:default"]).matches(&r));
    }

    #[test]
    fn global_short_circuits_dynamic() {
        let r = pod("kube-system", "dns-1", "n1", "dns");
        let global = FilterSet::from_names(["!namespace:kube-system"]);
        let dynamic = FilterSet::from_names(["app:dns"]);
        assert!(apply_filters(&global, &dynamic, &r));
        assert!(!apply_filters(&FilterSet::new(), &dynamic, &r));
    }

    #[test]
    fn apply_is_idempotent() {
        let filters = Filters { global: FilterSet::new(), dynamic: FilterSet::from_names(["app:web"]) };
        let mut r = pod("default", "api-1", "n1", "api");
        let first = filters.apply(&mut r);
        let second = filters.apply(&mut r);
        assert!(first);
        assert_eq!(first, second);
    }
}
