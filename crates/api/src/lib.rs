//! Lookout console context.
//!
//! A `Console` owns everything a session needs: the ingest task (sole owner of the
//! resource store and event correlator), the supervisor task (full lists, watch
//! managers, relist timer) and the published snapshots readers consume through a
//! [`ConsoleHandle`].

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use lookout_core::{Config, ErrorClass, LookoutError, LookoutResult, ResourceKey};
use lookout_events::EventIndex;
use lookout_kubehub::{AccessEvaluator, KindInfo, WatchSignal, WatchTransport};
use lookout_store::{Selection, StoreView};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

mod ingest;
mod supervisor;

pub use lookout_events::ClusterEvent;
pub use supervisor::EVENT_KIND;

/// What the user can ask for to recover from a reported error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum RetryAction {
    Relist { kinds: Vec<String> },
    Rewatch { kind: String },
}

/// An error that needs a user decision. Reported once until retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub message: String,
    pub class: ErrorClass,
    pub retry: Option<RetryAction>,
}

impl ErrorReport {
    pub fn new(error: &LookoutError, retry: Option<RetryAction>) -> Self {
        Self { message: error.to_string(), class: error.class(), retry }
    }
}

pub(crate) enum Command {
    Replace { listings: Vec<lookout_core::Listing>, done: oneshot::Sender<()> },
    SetFilters(Vec<String>),
    SetGlobalFilters(Vec<String>),
    AddFilter(String),
    RemoveFilter(String),
}

pub(crate) enum Control {
    Signal(WatchSignal),
    Retry(RetryAction),
}

/// Read side of a console. Cheap to clone.
#[derive(Clone)]
pub struct ConsoleHandle {
    view: Arc<ArcSwap<StoreView>>,
    events: Arc<ArcSwap<EventIndex>>,
    errors: Arc<ArcSwap<Vec<ErrorReport>>>,
    disabled: Arc<ArcSwap<Vec<String>>>,
    revision_rx: watch::Receiver<u64>,
    cmd_tx: mpsc::Sender<Command>,
    ctl_tx: mpsc::UnboundedSender<Control>,
}

fn closed<T>(_: T) -> LookoutError { LookoutError::Closed("console destroyed".into()) }

impl ConsoleHandle {
    /// Latest store snapshot.
    pub fn current(&self) -> Arc<StoreView> { self.view.load_full() }

    pub fn events(&self) -> Arc<EventIndex> { self.events.load_full() }

    pub fn select(&self, kind: &str, namespace: Option<&str>, name: &str) -> Selection {
        self.current().select(kind, namespace, name)
    }

    /// Events of `key` and everything it owns, newest first.
    pub fn events_for(&self, key: &ResourceKey) -> Vec<Arc<ClusterEvent>> {
        self.events().select_for(&self.current(), key)
    }

    pub fn recent_events(&self) -> Vec<Arc<ClusterEvent>> { self.events().recent().to_vec() }

    /// Store revision; changes whenever the store does.
    pub fn subscribe_revision(&self) -> watch::Receiver<u64> { self.revision_rx.clone() }

    pub fn errors(&self) -> Vec<ErrorReport> { self.errors.load().as_ref().clone() }

    /// Kinds given up on for this session because access was denied everywhere.
    pub fn disabled_kinds(&self) -> Vec<String> { self.disabled.load().as_ref().clone() }

    pub async fn set_filters(&self, names: Vec<String>) -> LookoutResult<()> {
        self.cmd_tx.send(Command::SetFilters(names)).await.map_err(closed)
    }

    pub async fn set_global_filters(&self, names: Vec<String>) -> LookoutResult<()> {
        self.cmd_tx.send(Command::SetGlobalFilters(names)).await.map_err(closed)
    }

    pub async fn add_filter(&self, name: &str) -> LookoutResult<()> {
        self.cmd_tx.send(Command::AddFilter(name.to_string())).await.map_err(closed)
    }

    pub async fn remove_filter(&self, name: &str) -> LookoutResult<()> {
        self.cmd_tx.send(Command::RemoveFilter(name.to_string())).await.map_err(closed)
    }

    /// Run the recovery attached to an error report.
    pub fn retry(&self, action: RetryAction) -> LookoutResult<()> {
        self.ctl_tx.send(Control::Retry(action)).map_err(closed)
    }
}

/// A running console session.
pub struct Console {
    handle: ConsoleHandle,
    ingest: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl Console {
    /// Start ingesting and watching `kinds`. Include the `Event` kind to correlate cluster events.
    pub fn start(cfg: Config, transport: Arc<dyn WatchTransport>, access: Arc<dyn AccessEvaluator>, kinds: Vec<KindInfo>) -> Self {
        let cfg = cfg.sanitized();
        let view = Arc::new(ArcSwap::from_pointee(StoreView::default()));
        let events = Arc::new(ArcSwap::from_pointee(EventIndex::default()));
        let errors = Arc::new(ArcSwap::from_pointee(Vec::new()));
        let disabled = Arc::new(ArcSwap::from_pointee(Vec::new()));
        let (revision_tx, revision_rx) = watch::channel(0u64);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (sig_tx, sig_rx) = mpsc::channel(cfg.queue_cap.max(1));

        let ingest = ingest::spawn_ingest(
            &cfg,
            cmd_rx,
            sig_rx,
            ctl_tx.clone(),
            ingest::Published { view: Arc::clone(&view), events: Arc::clone(&events), revision_tx },
        );
        let supervisor = supervisor::Supervisor::new(
            cfg,
            transport,
            access,
            kinds,
            cmd_tx.clone(),
            sig_tx,
            Arc::clone(&view),
            Arc::clone(&errors),
            Arc::clone(&disabled),
        );
        let supervisor = tokio::spawn(supervisor.run(ctl_rx));
        info!("console started");
        Self {
            handle: ConsoleHandle { view, events, errors, disabled, revision_rx, cmd_tx, ctl_tx },
            ingest: Some(ingest),
            supervisor: Some(supervisor),
        }
    }

    pub fn handle(&self) -> ConsoleHandle { self.handle.clone() }

    pub fn is_running(&self) -> bool { self.supervisor.is_some() }

    /// Tear down every connection and task. Idempotent.
    pub fn destroy(&mut self) {
        let mut stopped = false;
        if let Some(task) = self.supervisor.take() {
            task.abort();
            stopped = true;
        }
        if let Some(task) = self.ingest.take() {
            task.abort();
            stopped = true;
        }
        if stopped {
            info!("console destroyed");
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) { self.destroy(); }
}
