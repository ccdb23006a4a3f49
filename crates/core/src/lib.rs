//! Lookout core types: resource identity, normalized watch events, status summaries.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use smallvec::SmallVec;

pub mod config;
mod error;

pub use config::{Config, ThrottleRule};
pub use error::{ErrorClass, LookoutError, LookoutResult};

pub mod prelude {
    pub use super::{
        Config, DeltaKind, Listing, LookoutError, LookoutResult, OwnerRef, Resource, ResourceKey,
        StatusSummary, WatchEvent,
    };
}

static NULL: Value = Value::Null;

/// Namespace placeholder used in keys of cluster-scoped objects.
pub const CLUSTER_SCOPE: &str = "~";

/// Identity of an object: `kind/namespace/name`, with `~` standing in for cluster scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    kind: String,
    namespace: Option<String>,
    name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        let namespace = namespace
            .filter(|ns| !ns.is_empty() && *ns != CLUSTER_SCOPE)
            .map(|ns| ns.to_string());
        Self { kind: kind.into(), namespace, name: name.into() }
    }

    pub fn kind(&self) -> &str { &self.kind }
    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
    pub fn name(&self) -> &str { &self.name }

    /// Namespace as it appears in the serialized key.
    pub fn scope(&self) -> &str { self.namespace.as_deref().unwrap_or(CLUSTER_SCOPE) }

    /// Key of a sibling object in the same scope, e.g. a guessed owner.
    pub fn sibling(&self, kind: &str, name: impl Into<String>) -> Self {
        Self { kind: kind.to_string(), namespace: self.namespace.clone(), name: name.into() }
    }

    /// Derive the key of a raw JSON object (`kind` + `metadata.{namespace,name}`).
    pub fn for_object(raw: &Value) -> Option<Self> {
        let kind = raw.get("kind").and_then(|v| v.as_str())?;
        let meta = raw.get("metadata")?;
        let name = meta.get("name").and_then(|v| v.as_str())?;
        let ns = meta.get("namespace").and_then(|v| v.as_str());
        Some(Self::new(kind, ns, name))
    }

    /// Derive the key of an object reference (`{kind, namespace?, name}`) such as an
    /// event's `involvedObject`. A missing namespace falls back to `namespace`.
    pub fn for_reference(reference: &Value, namespace: Option<&str>) -> Option<Self> {
        let kind = reference.get("kind").and_then(|v| v.as_str())?;
        let name = reference.get("name").and_then(|v| v.as_str())?;
        let ns = reference.get("namespace").and_then(|v| v.as_str()).or(namespace);
        Some(Self::new(kind, ns, name))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.scope(), self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = LookoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(3, '/').collect();
        match parts.as_slice() {
            [kind, ns, name] if !kind.is_empty() && !name.is_empty() => Ok(Self::new(*kind, Some(*ns), *name)),
            _ => Err(LookoutError::MalformedPayload(format!("invalid resource key: {} (expect kind/namespace/name)", s))),
        }
    }
}

impl Serialize for ResourceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Watch event type as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeltaKind {
    Added,
    Modified,
    Deleted,
    Unknown,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Added => "ADDED",
            DeltaKind::Modified => "MODIFIED",
            DeltaKind::Deleted => "DELETED",
            DeltaKind::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ADDED" => DeltaKind::Added,
            "MODIFIED" => DeltaKind::Modified,
            "DELETED" => DeltaKind::Deleted,
            _ => DeltaKind::Unknown,
        }
    }
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Derived status of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StatusSummary {
    Ok,
    None,
    /// Unrecognized kind; rendered unstyled.
    #[default]
    Unknown,
    ScalingUp,
    ScalingDown,
    Disabled,
    Warning,
    Error,
    TimedOut,
}

impl StatusSummary {
    pub const ALL: [StatusSummary; 9] = [
        StatusSummary::Ok,
        StatusSummary::None,
        StatusSummary::Unknown,
        StatusSummary::ScalingUp,
        StatusSummary::ScalingDown,
        StatusSummary::Disabled,
        StatusSummary::Warning,
        StatusSummary::Error,
        StatusSummary::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusSummary::Ok => "ok",
            StatusSummary::None => "none",
            StatusSummary::Unknown => "",
            StatusSummary::ScalingUp => "scaling up",
            StatusSummary::ScalingDown => "scaling down",
            StatusSummary::Disabled => "disabled",
            StatusSummary::Warning => "warning",
            StatusSummary::Error => "error",
            StatusSummary::TimedOut => "timed out",
        }
    }

    /// Member of the problem set surfaced by overview panels.
    pub fn is_problem(&self) -> bool {
        matches!(self, StatusSummary::Warning | StatusSummary::Error | StatusSummary::TimedOut)
    }

    fn rank(&self) -> u8 {
        match self {
            StatusSummary::Ok => 1,
            StatusSummary::None => 2,
            StatusSummary::Unknown => 3,
            StatusSummary::ScalingUp => 4,
            StatusSummary::ScalingDown => 5,
            StatusSummary::Disabled => 6,
            StatusSummary::Warning => 7,
            StatusSummary::Error => 8,
            StatusSummary::TimedOut => 9,
        }
    }
}

impl PartialOrd for StatusSummary {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}

impl Ord for StatusSummary {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering { self.rank().cmp(&other.rank()) }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for StatusSummary {
    type Err = LookoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StatusSummary::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| LookoutError::MalformedPayload(format!("unknown status: {}", s)))
    }
}

impl Serialize for StatusSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One `metadata.ownerReferences` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub controller: bool,
}

/// A cluster object as held by the store.
///
/// `raw` keeps the full server payload; the remaining fields are projections of it
/// plus state derived by the store (`status_summary`, `is_filtered`, `is_deleted`).
/// Ownership back-edges are not stored here: the store keeps them in its graph.
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub key: ResourceKey,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner_refs: SmallVec<[OwnerRef; 2]>,
    pub raw: Value,
    pub status_summary: StatusSummary,
    pub is_filtered: bool,
    pub is_deleted: bool,
    /// Synthetic placeholder returned by `select` for a key the store has never seen.
    pub not_found: bool,
}

impl Resource {
    /// Build from a raw object carrying its own `kind`.
    pub fn from_value(raw: Value) -> LookoutResult<Self> {
        let kind = raw
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LookoutError::MalformedPayload("object missing kind".into()))?
            .to_string();
        Self::with_kind(raw, &kind)
    }

    /// Build from a raw object whose kind is known from context (list items often omit it).
    pub fn with_kind(mut raw: Value, kind: &str) -> LookoutResult<Self> {
        if !raw.is_object() {
            return Err(LookoutError::MalformedPayload(format!("{} payload is not an object", kind)));
        }
        if raw.get("kind").and_then(|v| v.as_str()) != Some(kind) {
            raw["kind"] = Value::String(kind.to_string());
        }
        if cfg!(feature = "strip-managed-fields") {
            strip_managed_fields(&mut raw);
        }
        let meta = raw
            .get("metadata")
            .ok_or_else(|| LookoutError::MalformedPayload(format!("{} missing metadata", kind)))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LookoutError::MalformedPayload(format!("{} missing metadata.name", kind)))?
            .to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(|s| s.to_string());
        let resource_version = meta.get("resourceVersion").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let labels = string_map(meta.get("labels"));
        let annotations = string_map(meta.get("annotations"));
        let owner_refs = meta
            .get("ownerReferences")
            .and_then(|v| v.as_array())
            .map(|refs| refs.iter().filter_map(|r| serde_json::from_value::<OwnerRef>(r.clone()).ok()).collect())
            .unwrap_or_default();
        Ok(Self {
            key: ResourceKey::new(kind, namespace.as_deref(), name.clone()),
            kind: kind.to_string(),
            namespace,
            name,
            resource_version,
            labels,
            annotations,
            owner_refs,
            raw,
            status_summary: StatusSummary::Unknown,
            is_filtered: false,
            is_deleted: false,
            not_found: false,
        })
    }

    /// Placeholder for an object that is not (or not yet) in the store.
    pub fn placeholder(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        let key = ResourceKey::new(kind, namespace, name);
        let mut meta = serde_json::json!({ "name": name });
        if let Some(ns) = key.namespace() {
            meta["namespace"] = Value::String(ns.to_string());
        }
        Self {
            kind: kind.to_string(),
            namespace: key.namespace().map(|s| s.to_string()),
            name: name.to_string(),
            key,
            resource_version: String::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            owner_refs: SmallVec::new(),
            raw: serde_json::json!({ "kind": kind, "metadata": meta }),
            status_summary: StatusSummary::Unknown,
            is_filtered: false,
            is_deleted: false,
            not_found: true,
        }
    }

    pub fn metadata(&self) -> &Value { self.raw.get("metadata").unwrap_or(&NULL) }
    pub fn spec(&self) -> &Value { self.raw.get("spec").unwrap_or(&NULL) }
    pub fn status(&self) -> &Value { self.raw.get("status").unwrap_or(&NULL) }

    /// Top-level field other than metadata/spec/status (e.g. `subjects`, `roleRef`).
    pub fn field(&self, name: &str) -> &Value { self.raw.get(name).unwrap_or(&NULL) }

    /// Numeric resourceVersion, when the token parses as one.
    pub fn version(&self) -> Option<u64> { parse_version(&self.resource_version) }

    /// Keys of the owners named in `ownerReferences`, resolved in this object's scope.
    pub fn owner_keys(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        self.owner_refs.iter().map(move |r| ResourceKey::new(r.kind.as_str(), self.namespace.as_deref(), r.name.as_str()))
    }
}

/// Parse a resourceVersion token. Empty tokens and non-numeric tokens yield `None`.
pub fn parse_version(token: &str) -> Option<u64> {
    if token.is_empty() { None } else { token.parse::<u64>().ok() }
}

fn string_map(v: Option<&Value>) -> BTreeMap<String, String> {
    v.and_then(|m| m.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// A watch frame normalized at the ingress boundary.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Resource),
    Modified(Resource),
    Deleted(Resource),
    /// ERROR frames and frames whose object could not be read.
    Unknown { event_type: String, payload: Value },
}

impl WatchEvent {
    pub fn new(kind: DeltaKind, resource: Resource) -> Self {
        match kind {
            DeltaKind::Added => WatchEvent::Added(resource),
            DeltaKind::Modified => WatchEvent::Modified(resource),
            DeltaKind::Deleted => WatchEvent::Deleted(resource),
            DeltaKind::Unknown => WatchEvent::Unknown { event_type: DeltaKind::Unknown.as_str().into(), payload: resource.raw },
        }
    }

    /// Normalize a frame that is either wrapped (`{type, object}`) or a bare object.
    /// Bare objects are treated as modifications.
    pub fn from_wire(frame: Value) -> Self {
        let (event_type, object) = match frame.get("type").and_then(|v| v.as_str()) {
            Some(t) => {
                let t = t.to_string();
                let object = frame.get("object").cloned().unwrap_or(Value::Null);
                (t, object)
            }
            None if frame.get("metadata").is_some() => (DeltaKind::Modified.as_str().to_string(), frame),
            None => return WatchEvent::Unknown { event_type: String::new(), payload: frame },
        };
        let kind = DeltaKind::parse(&event_type);
        if kind == DeltaKind::Unknown {
            return WatchEvent::Unknown { event_type, payload: object };
        }
        match Resource::from_value(object.clone()) {
            Ok(r) => WatchEvent::new(kind, r),
            Err(_) => WatchEvent::Unknown { event_type, payload: object },
        }
    }

    pub fn delta_kind(&self) -> DeltaKind {
        match self {
            WatchEvent::Added(_) => DeltaKind::Added,
            WatchEvent::Modified(_) => DeltaKind::Modified,
            WatchEvent::Deleted(_) => DeltaKind::Deleted,
            WatchEvent::Unknown { .. } => DeltaKind::Unknown,
        }
    }

    pub fn resource(&self) -> Option<&Resource> {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => Some(r),
            WatchEvent::Unknown { .. } => None,
        }
    }

    pub fn into_resource(self) -> Option<Resource> {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => Some(r),
            WatchEvent::Unknown { .. } => None,
        }
    }

    pub fn key(&self) -> Option<&ResourceKey> { self.resource().map(|r| &r.key) }
}

/// Result of one full list for a kind.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub kind: String,
    /// List-level resourceVersion (the consistent read point), if reported.
    pub resource_version: Option<String>,
    pub items: Vec<Resource>,
}

impl Listing {
    /// Read a `*List` payload. A missing `items` array or a `kind` that is not a list
    /// has no safe local recovery and is reported as malformed.
    pub fn from_list_value(value: Value) -> LookoutResult<Self> {
        let list_kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LookoutError::MalformedPayload("list response missing kind".into()))?;
        let kind = list_kind
            .strip_suffix("List")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LookoutError::MalformedPayload(format!("unexpected list kind: {}", list_kind)))?
            .to_string();
        let items = value
            .get("items")
            .and_then(|v| v.as_array())
            .ok_or_else(|| LookoutError::MalformedPayload(format!("{} response missing items", list_kind)))?;
        let resource_version = value
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let items = items.iter().cloned().map(|it| Resource::with_kind(it, &kind)).collect::<LookoutResult<Vec<_>>>()?;
        Ok(Self { kind, resource_version, items })
    }

    /// Highest numeric resourceVersion among the list and its items.
    pub fn max_version(&self) -> Option<u64> {
        let list = self.resource_version.as_deref().and_then(parse_version);
        self.items.iter().filter_map(|r| r.version()).chain(list).max()
    }
}
