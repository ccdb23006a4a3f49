use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use lookout_core::{parse_version, Config, Listing, LookoutError, LookoutResult};
use lookout_kubehub::{AccessEvaluator, ConnectionConfig, KindInfo, WatchManager, WatchSignal, WatchTransport};
use lookout_store::StoreView;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{Command, Control, ErrorReport, RetryAction};

/// Kind of cluster Event objects; routed to the correlator instead of the store.
pub const EVENT_KIND: &str = "Event";

/// Owns listing, watch managers and the error channel.
pub(crate) struct Supervisor {
    cfg: Config,
    transport: Arc<dyn WatchTransport>,
    access: Arc<dyn AccessEvaluator>,
    kinds: BTreeMap<String, KindInfo>,
    managers: BTreeMap<String, WatchManager>,
    disabled: BTreeSet<String>,
    /// Resume points from listings, for kinds the store does not track (events).
    listed_versions: FxHashMap<String, u64>,
    cmd_tx: mpsc::Sender<Command>,
    sig_tx: mpsc::Sender<WatchSignal>,
    view: Arc<ArcSwap<StoreView>>,
    reported: FxHashSet<(String, Option<RetryAction>)>,
    errors: Arc<ArcSwap<Vec<ErrorReport>>>,
    disabled_out: Arc<ArcSwap<Vec<String>>>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cfg: Config,
        transport: Arc<dyn WatchTransport>,
        access: Arc<dyn AccessEvaluator>,
        kinds: Vec<KindInfo>,
        cmd_tx: mpsc::Sender<Command>,
        sig_tx: mpsc::Sender<WatchSignal>,
        view: Arc<ArcSwap<StoreView>>,
        errors: Arc<ArcSwap<Vec<ErrorReport>>>,
        disabled_out: Arc<ArcSwap<Vec<String>>>,
    ) -> Self {
        Self {
            cfg,
            transport,
            access,
            kinds: kinds.into_iter().map(|k| (k.kind.clone(), k)).collect(),
            managers: BTreeMap::new(),
            disabled: BTreeSet::new(),
            listed_versions: FxHashMap::default(),
            cmd_tx,
            sig_tx,
            view,
            reported: FxHashSet::default(),
            errors,
            disabled_out,
        }
    }

    pub(crate) async fn run(mut self, mut ctl_rx: mpsc::UnboundedReceiver<Control>) {
        let all: Vec<String> = self.kinds.keys().cloned().collect();
        self.relist(&all).await;
        let mut relist = tokio::time::interval_at(tokio::time::Instant::now() + self.cfg.relist, self.cfg.relist);
        loop {
            tokio::select! {
                ctl = ctl_rx.recv() => match ctl {
                    Some(Control::Signal(signal)) => self.on_signal(signal).await,
                    Some(Control::Retry(action)) => self.retry(action).await,
                    None => break,
                },
                _ = relist.tick() => {
                    let kinds: Vec<String> = self.kinds.keys().filter(|k| !self.disabled.contains(*k)).cloned().collect();
                    self.relist(&kinds).await;
                }
            }
        }
        for (_, mut m) in std::mem::take(&mut self.managers) {
            m.destroy();
        }
        info!("supervisor stopped");
    }

    fn report(&mut self, error: &LookoutError, retry: Option<RetryAction>) {
        let report = ErrorReport::new(error, retry);
        if !self.reported.insert((report.message.clone(), report.retry.clone())) {
            debug!(error = %error, "error already reported");
            return;
        }
        warn!(error = %error, retry = ?report.retry, "reporting error");
        metrics::counter!("console_errors_total", 1u64, "class" => format!("{:?}", report.class));
        let mut next = self.errors.load().as_ref().clone();
        next.push(report);
        self.errors.store(Arc::new(next));
    }

    fn clear_reports(&mut self, action: &RetryAction) {
        self.reported.retain(|(_, retry)| retry.as_ref() != Some(action));
        let next: Vec<ErrorReport> = self.errors.load().iter().filter(|r| r.retry.as_ref() != Some(action)).cloned().collect();
        self.errors.store(Arc::new(next));
    }

    fn disable(&mut self, kind: &str, error: &LookoutError) {
        if !self.disabled.insert(kind.to_string()) {
            return;
        }
        info!(kind = %kind, error = %error, "access denied everywhere; kind disabled for this session");
        if let Some(mut m) = self.managers.remove(kind) {
            m.destroy();
        }
        self.disabled_out.store(Arc::new(self.disabled.iter().cloned().collect()));
    }

    /// List a kind cluster-wide, falling back to the namespaces the user may access.
    /// `Ok(None)` means access is denied everywhere.
    async fn list_kind(&self, info: &KindInfo) -> LookoutResult<Option<Listing>> {
        let denied = match self.transport.list(info, None).await {
            Ok(listing) => return Ok(Some(listing)),
            Err(LookoutError::Authorization(e)) if info.namespaced => e,
            Err(LookoutError::Authorization(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let namespaces = self.access.listable_namespaces(info).await?;
        debug!(kind = %info.kind, reason = %denied, namespaces = namespaces.len(), "cluster list denied; listing per namespace");
        let mut merged: Option<Listing> = None;
        for ns in namespaces.iter().filter(|ns| ns.as_str() != lookout_kubehub::ALL_NAMESPACES) {
            match self.transport.list(info, Some(ns)).await {
                Ok(listing) => {
                    let acc = merged.get_or_insert_with(|| Listing { kind: info.kind.clone(), resource_version: None, items: Vec::new() });
                    acc.resource_version = match (acc.resource_version.take(), listing.resource_version) {
                        (Some(a), Some(b)) => match (parse_version(&a), parse_version(&b)) {
                            (Some(x), Some(y)) if y < x => Some(b),
                            _ => Some(a),
                        },
                        (a, b) => a.or(b),
                    };
                    acc.items.extend(listing.items);
                }
                Err(LookoutError::Authorization(e)) => debug!(kind = %info.kind, ns = %ns, reason = %e, "namespace list denied"),
                Err(e) => return Err(e),
            }
        }
        Ok(merged)
    }

    /// Full reconciliation of `kinds`, then converge their watches on the new resume points.
    async fn relist(&mut self, kinds: &[String]) {
        let t0 = Instant::now();
        let mut listings = Vec::new();
        let mut listed = Vec::new();
        for kind in kinds {
            if self.disabled.contains(kind) {
                continue;
            }
            let Some(info) = self.kinds.get(kind).cloned() else {
                warn!(kind = %kind, "relist requested for unknown kind");
                continue;
            };
            match self.list_kind(&info).await {
                Ok(Some(listing)) => {
                    if let Some(v) = listing.max_version() {
                        let slot = self.listed_versions.entry(kind.clone()).or_insert(0);
                        *slot = (*slot).max(v);
                    }
                    listings.push(listing);
                    listed.push(kind.clone());
                }
                Ok(None) => self.disable(kind, &LookoutError::Authorization(format!("list {}", kind))),
                Err(LookoutError::Authorization(e)) => self.disable(kind, &LookoutError::Authorization(e)),
                Err(e) => self.report(&e, Some(RetryAction::Relist { kinds: vec![kind.clone()] })),
            }
        }
        if listings.is_empty() {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Replace { listings, done: done_tx }).await.is_err() || done_rx.await.is_err() {
            warn!("ingest loop gone; relist dropped");
            return;
        }
        info!(kinds = listed.len(), took_ms = %t0.elapsed().as_millis(), "relist complete");
        for kind in listed {
            self.rewatch(&kind).await;
        }
    }

    fn resume_point(&self, kind: &str) -> String {
        let stored = self.view.load().max_version(kind);
        let listed = self.listed_versions.get(kind).copied();
        stored.max(listed).map(|v| v.to_string()).unwrap_or_else(|| "0".into())
    }

    /// Open missing or closed connections of `kind` and close the ones no longer allowed.
    async fn rewatch(&mut self, kind: &str) {
        let Some(info) = self.kinds.get(kind).cloned() else { return; };
        if !info.watchable || self.disabled.contains(kind) {
            return;
        }
        let namespaces = match self.access.watchable_namespaces(&info).await {
            Ok(nss) => nss,
            Err(e) => {
                self.report(&e, Some(RetryAction::Rewatch { kind: kind.to_string() }));
                return;
            }
        };
        let rv = self.resume_point(kind);
        let cfg = ConnectionConfig::from(&self.cfg);
        let transport = Arc::clone(&self.transport);
        let sig_tx = self.sig_tx.clone();
        let manager = self
            .managers
            .entry(kind.to_string())
            .or_insert_with(|| WatchManager::new(info, transport, cfg, sig_tx));
        manager.sync(&namespaces, &rv);
    }

    async fn on_signal(&mut self, signal: WatchSignal) {
        match signal {
            WatchSignal::Expired { kind, namespace } => {
                debug!(kind = %kind, ns = ?namespace, "resume point expired; relisting");
                self.relist(&[kind]).await;
            }
            WatchSignal::Failed { kind, namespace, error: LookoutError::Authorization(e) } => {
                // Partial visibility is acceptable; the connection stays closed until the next relist.
                info!(kind = %kind, ns = ?namespace, reason = %e, "watch not permitted");
            }
            WatchSignal::Failed { kind, namespace, error } => {
                debug!(kind = %kind, ns = ?namespace, "watch gave up");
                self.report(&error, Some(RetryAction::Rewatch { kind }));
            }
            WatchSignal::Event { .. } => {}
        }
    }

    async fn retry(&mut self, action: RetryAction) {
        info!(action = ?action, "retry requested");
        self.clear_reports(&action);
        match action {
            RetryAction::Relist { kinds } => self.relist(&kinds).await,
            RetryAction::Rewatch { kind } => self.rewatch(&kind).await,
        }
    }
}
