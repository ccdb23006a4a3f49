//! One long-lived watch for a (kind, namespace) pair.
//!
//! `Connecting → Open → (Error → Reconnecting → Connecting)* → Closed`, with a
//! `Degraded` long-poll mode once connecting has failed more than `retry_limit` times.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use lookout_core::{Config, LookoutError, WatchEvent};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{KindInfo, WatchTransport, WireFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Error,
    Reconnecting,
    /// Streaming failed repeatedly; frames arrive by long-polling.
    Degraded,
    Closed,
}

/// What a connection reports to its owner.
#[derive(Debug, Clone)]
pub enum WatchSignal {
    Event { kind: String, event: WatchEvent },
    /// The resume point is gone (410); the kind needs a relist before rewatching.
    Expired { kind: String, namespace: Option<String> },
    /// The connection gave up; it is closed when this arrives.
    Failed { kind: String, namespace: Option<String>, error: LookoutError },
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub retry_limit: u32,
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
    pub poll_timeout_secs: u32,
}

impl From<&Config> for ConnectionConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            retry_limit: cfg.retry_limit,
            retry_backoff: cfg.retry_backoff,
            poll_interval: cfg.poll_interval,
            poll_timeout_secs: cfg.poll_timeout_secs,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self { Self::from(&Config::default()) }
}

/// Handle to a running watch task. Dropping it destroys the connection.
pub struct WatchConnection {
    kind: String,
    namespace: Option<String>,
    state: Arc<watch::Sender<ConnectionState>>,
    resource_version: Arc<ArcSwap<String>>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WatchConnection {
    /// Start watching `kind` in `namespace` (`None` = all namespaces) after `resource_version`.
    pub fn spawn(
        transport: Arc<dyn WatchTransport>,
        kind: KindInfo,
        namespace: Option<String>,
        resource_version: impl Into<String>,
        cfg: ConnectionConfig,
        tx: mpsc::Sender<WatchSignal>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state_tx);
        let resource_version = Arc::new(ArcSwap::from_pointee(resource_version.into()));
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = Worker {
            transport,
            kind: kind.clone(),
            namespace: namespace.clone(),
            cfg,
            tx,
            state: Arc::clone(&state),
            resource_version: Arc::clone(&resource_version),
        };
        let final_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = stop_rx => {}
                _ = worker.run() => {}
            }
            final_state.send_replace(ConnectionState::Closed);
        });
        info!(kind = %kind.kind, ns = ?namespace, "watch connection started");
        Self { kind: kind.kind, namespace, state, resource_version, stop: Some(stop_tx), task: Some(task) }
    }

    pub fn kind(&self) -> &str { &self.kind }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }

    pub fn state(&self) -> ConnectionState { *self.state.borrow() }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> { self.state.subscribe() }

    pub fn closed(&self) -> bool { self.state() == ConnectionState::Closed }

    /// Latest resume point: the last event's or bookmark's resourceVersion.
    pub fn resource_version(&self) -> String { self.resource_version.load().as_ref().clone() }

    /// Stop the connection. Nothing is delivered once this returns; calling it again is a no-op.
    pub fn destroy(&mut self) {
        let was = self.state.send_replace(ConnectionState::Closed);
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
            if was != ConnectionState::Closed {
                debug!(kind = %self.kind, ns = ?self.namespace, "watch connection destroyed");
            }
        }
    }
}

impl Drop for WatchConnection {
    fn drop(&mut self) { self.destroy(); }
}

struct Worker {
    transport: Arc<dyn WatchTransport>,
    kind: KindInfo,
    namespace: Option<String>,
    cfg: ConnectionConfig,
    tx: mpsc::Sender<WatchSignal>,
    state: Arc<watch::Sender<ConnectionState>>,
    resource_version: Arc<ArcSwap<String>>,
}

enum Ended {
    /// The server closed the stream; resume from the last version.
    Lapsed,
    Failed(LookoutError),
    /// Destroyed or the receiver is gone.
    Detached,
}

impl Worker {
    fn detached(&self) -> bool { *self.state.borrow() == ConnectionState::Closed }

    fn set(&self, next: ConnectionState) {
        self.state.send_if_modified(|cur| {
            if *cur == ConnectionState::Closed || *cur == next {
                return false;
            }
            *cur = next;
            true
        });
    }

    async fn deliver(&self, signal: WatchSignal) -> bool {
        if self.detached() {
            return false;
        }
        self.tx.send(signal).await.is_ok()
    }

    async fn handle(&self, frame: WireFrame) -> bool {
        match frame {
            WireFrame::Bookmark(rv) => {
                if !rv.is_empty() {
                    self.resource_version.store(Arc::new(rv));
                }
                true
            }
            WireFrame::Event(event) => {
                if let Some(r) = event.resource() {
                    if !r.resource_version.is_empty() {
                        self.resource_version.store(Arc::new(r.resource_version.clone()));
                    }
                }
                self.deliver(WatchSignal::Event { kind: self.kind.kind.clone(), event }).await
            }
        }
    }

    /// Report a terminal error and close.
    async fn give_up(&self, error: LookoutError) {
        let kind = self.kind.kind.clone();
        let namespace = self.namespace.clone();
        let signal = match error {
            LookoutError::Expired(msg) => {
                info!(kind = %kind, ns = ?namespace, reason = %msg, "watch expired; relist needed");
                WatchSignal::Expired { kind, namespace }
            }
            error => {
                warn!(kind = %kind, ns = ?namespace, error = %error, "watch failed");
                metrics::counter!("watch_failures_total", 1u64, "kind" => kind.clone());
                WatchSignal::Failed { kind, namespace, error }
            }
        };
        if self.detached() {
            return;
        }
        // Closed before the signal goes out, so whoever reacts to it recreates this connection.
        self.set(ConnectionState::Closed);
        let _ = self.tx.send(signal).await;
    }

    async fn pump(&self, mut stream: crate::FrameStream) -> Ended {
        while let Some(item) = stream.next().await {
            match item {
                Ok(frame) => {
                    if !self.handle(frame).await {
                        return Ended::Detached;
                    }
                }
                Err(e) => return Ended::Failed(e),
            }
        }
        Ended::Lapsed
    }

    async fn run(self) {
        let mut failures: u32 = 0;
        loop {
            self.set(ConnectionState::Connecting);
            let rv = self.resource_version.load_full();
            match self.transport.watch(&self.kind, self.namespace.as_deref(), &rv).await {
                Ok(stream) => {
                    failures = 0;
                    self.set(ConnectionState::Open);
                    debug!(kind = %self.kind.kind, ns = ?self.namespace, rv = %rv, "watch open");
                    match self.pump(stream).await {
                        Ended::Detached => return,
                        Ended::Lapsed => {
                            debug!(kind = %self.kind.kind, ns = ?self.namespace, "watch lapsed; resuming");
                            self.set(ConnectionState::Reconnecting);
                        }
                        Ended::Failed(e @ LookoutError::Transport(_)) => {
                            warn!(kind = %self.kind.kind, ns = ?self.namespace, error = %e, "watch dropped; reconnecting");
                            self.set(ConnectionState::Error);
                            self.set(ConnectionState::Reconnecting);
                            tokio::time::sleep(self.cfg.retry_backoff).await;
                        }
                        Ended::Failed(e) => return self.give_up(e).await,
                    }
                    metrics::counter!("watch_reconnects_total", 1u64, "kind" => self.kind.kind.clone());
                }
                Err(e @ LookoutError::Transport(_)) => {
                    failures += 1;
                    self.set(ConnectionState::Error);
                    if failures > self.cfg.retry_limit {
                        return self.degrade().await;
                    }
                    warn!(kind = %self.kind.kind, ns = ?self.namespace, attempt = failures, error = %e, "watch connect failed; retrying");
                    self.set(ConnectionState::Reconnecting);
                    tokio::time::sleep(self.cfg.retry_backoff).await;
                }
                Err(e) => return self.give_up(e).await,
            }
        }
    }

    async fn degrade(&self) {
        warn!(kind = %self.kind.kind, ns = ?self.namespace, "watch unavailable; falling back to long-polling");
        metrics::counter!("watch_fallbacks_total", 1u64, "kind" => self.kind.kind.clone());
        self.set(ConnectionState::Degraded);
        loop {
            let rv = self.resource_version.load_full();
            match self.transport.poll(&self.kind, self.namespace.as_deref(), &rv, self.cfg.poll_timeout_secs).await {
                Ok(frames) => {
                    for frame in frames {
                        if !self.handle(frame).await {
                            return;
                        }
                    }
                }
                Err(e) => return self.give_up(e).await,
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }
}
