use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{ConnectionConfig, KindInfo, WatchConnection, WatchSignal, WatchTransport, ALL_NAMESPACES};

/// What one `sync` changed, by namespace (`*` for the cluster-wide connection).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
    pub recreated: Vec<String>,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool { self.opened.is_empty() && self.closed.is_empty() && self.recreated.is_empty() }
}

/// The watch connections of one kind, one per authorized namespace.
pub struct WatchManager {
    kind: KindInfo,
    transport: Arc<dyn WatchTransport>,
    cfg: ConnectionConfig,
    tx: mpsc::Sender<WatchSignal>,
    connections: BTreeMap<String, WatchConnection>,
}

impl WatchManager {
    pub fn new(kind: KindInfo, transport: Arc<dyn WatchTransport>, cfg: ConnectionConfig, tx: mpsc::Sender<WatchSignal>) -> Self {
        Self { kind, transport, cfg, tx, connections: BTreeMap::new() }
    }

    pub fn kind(&self) -> &KindInfo { &self.kind }

    fn wanted(&self, namespaces: &[String]) -> BTreeSet<String> {
        if namespaces.is_empty() {
            return BTreeSet::new();
        }
        if !self.kind.namespaced || namespaces.iter().any(|ns| ns == ALL_NAMESPACES) {
            return BTreeSet::from([ALL_NAMESPACES.to_string()]);
        }
        namespaces.iter().cloned().collect()
    }

    fn open(&self, ns: &str, resource_version: &str) -> WatchConnection {
        let namespace = if ns == ALL_NAMESPACES { None } else { Some(ns.to_string()) };
        WatchConnection::spawn(
            Arc::clone(&self.transport),
            self.kind.clone(),
            namespace,
            resource_version,
            self.cfg.clone(),
            self.tx.clone(),
        )
    }

    /// Converge on one live connection per namespace in `namespaces`.
    ///
    /// Connections for namespaces no longer listed are destroyed, missing and closed
    /// ones are opened from `resource_version`, live ones are left alone.
    pub fn sync(&mut self, namespaces: &[String], resource_version: &str) -> SyncReport {
        let wanted = self.wanted(namespaces);
        let mut report = SyncReport::default();

        let stale: Vec<String> = self.connections.keys().filter(|ns| !wanted.contains(*ns)).cloned().collect();
        for ns in stale {
            if let Some(mut conn) = self.connections.remove(&ns) {
                conn.destroy();
            }
            report.closed.push(ns);
        }

        for ns in wanted {
            match self.connections.get(&ns) {
                Some(conn) if !conn.closed() => continue,
                Some(_) => report.recreated.push(ns.clone()),
                None => report.opened.push(ns.clone()),
            }
            let conn = self.open(&ns, resource_version);
            self.connections.insert(ns, conn);
        }

        if report.is_noop() {
            debug!(kind = %self.kind.kind, "watch scope unchanged");
        } else {
            info!(
                kind = %self.kind.kind,
                rv = %resource_version,
                opened = ?report.opened,
                closed = ?report.closed,
                recreated = ?report.recreated,
                "watch scope synced"
            );
        }
        report
    }

    /// Namespaces with a connection, live or not.
    pub fn namespaces(&self) -> Vec<String> { self.connections.keys().cloned().collect() }

    pub fn connection(&self, namespace: &str) -> Option<&WatchConnection> { self.connections.get(namespace) }

    pub fn closed_count(&self) -> usize { self.connections.values().filter(|c| c.closed()).count() }

    /// Destroy every connection.
    pub fn destroy(&mut self) {
        let n = self.connections.len();
        for (_, mut conn) in std::mem::take(&mut self.connections) {
            conn.destroy();
        }
        if n > 0 {
            debug!(kind = %self.kind.kind, connections = n, "watch manager destroyed");
        }
    }
}

impl Drop for WatchManager {
    fn drop(&mut self) { self.destroy(); }
}
