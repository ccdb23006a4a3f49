//! Lookout kubehub: kind discovery, access review and watch connections.

#![forbid(unsafe_code)]

use kube::{
    core::ApiResource,
    discovery::{verbs, Discovery, Scope},
    Client,
};
use lookout_core::LookoutError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

mod access;
mod connection;
mod manager;
mod transport;

pub use access::{AccessEvaluator, SsarAccess, StaticAccess};
pub use connection::{ConnectionConfig, ConnectionState, WatchConnection, WatchSignal};
pub use manager::{SyncReport, WatchManager};
pub use transport::{FrameStream, KubeTransport, WatchTransport, WireFrame};

/// Namespace wildcard: one cluster-wide connection.
pub const ALL_NAMESPACES: &str = "*";

/// A served resource kind as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindInfo {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
    /// Whether the server supports the `watch` verb for this kind.
    pub watchable: bool,
}

impl KindInfo {
    /// A kind of the core (`""`) group at `v1`.
    pub fn core(kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            group: String::new(),
            version: "v1".into(),
            kind: kind.into(),
            plural: plural.into(),
            namespaced,
            watchable: true,
        }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

/// Map a kube client error onto the lookout taxonomy.
pub fn classify(err: kube::Error) -> LookoutError {
    match err {
        kube::Error::Api(ae) => classify_status(ae.code, &ae.message),
        kube::Error::SerdeError(e) => LookoutError::MalformedPayload(e.to_string()),
        other => LookoutError::Transport(other.to_string()),
    }
}

/// Map an HTTP status (from a response or an in-stream ERROR frame).
pub fn classify_status(code: u16, message: &str) -> LookoutError {
    match code {
        401 | 403 => LookoutError::Authorization(format!("{} ({})", message, code)),
        410 => LookoutError::Expired(message.to_string()),
        _ => LookoutError::Transport(format!("{} ({})", message, code)),
    }
}

/// Discover served kinds, including CRDs, in a stable order.
pub async fn discover(client: Client) -> Result<Vec<KindInfo>, LookoutError> {
    let t0 = std::time::Instant::now();
    let discovery = Discovery::new(client).run().await.map_err(classify)?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let watchable = caps.supports_operation(verbs::WATCH);
            if !watchable {
                debug!(gvk = %format!("{}/{}/{}", ar.group, ar.version, ar.kind), "kind is not watchable");
            }
            out.push(KindInfo {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
                watchable,
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    info!(kinds = out.len(), took_ms = %t0.elapsed().as_millis(), "discovery complete");
    Ok(out)
}
