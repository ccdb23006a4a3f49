use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use lookout_core::{Config, Listing, WatchEvent};
use lookout_events::{EventCorrelator, EventIndex, RawEvent};
use lookout_kubehub::WatchSignal;
use lookout_store::{EventAggregator, ResourceStore, StoreView, ThrottleFilter};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::supervisor::EVENT_KIND;
use crate::{Command, Control};

pub(crate) struct Published {
    pub view: Arc<ArcSwap<StoreView>>,
    pub events: Arc<ArcSwap<EventIndex>>,
    pub revision_tx: watch::Sender<u64>,
}

/// Sole owner of the store, correlator, throttle and aggregator.
struct Ingest {
    store: ResourceStore,
    correlator: EventCorrelator,
    throttle: ThrottleFilter,
    aggregator: EventAggregator,
    out: Published,
}

impl Ingest {
    fn publish(&mut self, events_changed: bool) {
        let rev = self.store.view().revision();
        let store_changed = rev != *self.out.revision_tx.borrow();
        if store_changed {
            self.out.view.store(self.store.freeze());
            let _ = self.out.revision_tx.send(rev);
        }
        if events_changed || store_changed {
            self.out.events.store(self.correlator.freeze());
        }
    }

    fn admit(&mut self, event: WatchEvent) {
        if self.throttle.admit(&event, Instant::now()) {
            self.aggregator.push(event);
        }
    }

    /// Apply one tick's worth of aggregated events.
    fn flush(&mut self) {
        let batch = self.aggregator.drain_ready();
        if batch.is_empty() {
            return;
        }
        let before = self.store.view().revision();
        let mut cluster_events = Vec::new();
        for ev in batch {
            if ev.resource().map(|r| r.kind == EVENT_KIND).unwrap_or(false) {
                cluster_events.extend(RawEvent::from_watch(ev));
            } else {
                self.store.apply(ev);
            }
        }
        let mut events_changed = false;
        if !cluster_events.is_empty() {
            self.correlator.receive(self.store.view(), cluster_events);
            events_changed = true;
        }
        if self.store.view().revision() != before && self.correlator.reconcile(self.store.view()) > 0 {
            events_changed = true;
        }
        self.publish(events_changed);
    }

    fn replace(&mut self, listings: Vec<Listing>) {
        self.flush();
        let (events, resources): (Vec<Listing>, Vec<Listing>) = listings.into_iter().partition(|l| l.kind == EVENT_KIND);
        if !resources.is_empty() {
            self.store.replace_all(resources);
        }
        let raws: Vec<RawEvent> = events.into_iter().flat_map(|l| l.items).map(RawEvent::listed).collect();
        if !raws.is_empty() {
            self.correlator.receive(self.store.view(), raws);
        }
        let reattached = self.correlator.reconcile(self.store.view());
        debug!(reattached, revision = self.store.view().revision(), "reconciliation applied");
        self.publish(true);
    }

    fn command(&mut self, cmd: Command) {
        match cmd {
            Command::Replace { listings, done } => {
                self.replace(listings);
                let _ = done.send(());
                return;
            }
            Command::SetFilters(names) => self.store.set_filters(names),
            Command::SetGlobalFilters(names) => self.store.set_global_filters(names),
            Command::AddFilter(name) => {
                self.store.add_filter(&name);
            }
            Command::RemoveFilter(name) => {
                self.store.remove_filter(&name);
            }
        }
        self.publish(false);
    }
}

pub(crate) fn spawn_ingest(
    cfg: &Config,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut sig_rx: mpsc::Receiver<WatchSignal>,
    ctl_tx: mpsc::UnboundedSender<Control>,
    out: Published,
) -> JoinHandle<()> {
    let mut ingest = Ingest {
        store: ResourceStore::new(cfg),
        correlator: EventCorrelator::from_config(cfg),
        throttle: ThrottleFilter::from_config(cfg),
        aggregator: EventAggregator::with_capacity(cfg.queue_cap),
        out,
    };
    let tick = cfg.tick;
    let purge_every = cfg.throttle_purge;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        let mut purge = tokio::time::interval(purge_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => ingest.command(cmd),
                    None => break,
                },
                sig = sig_rx.recv() => match sig {
                    Some(WatchSignal::Event { event, .. }) => ingest.admit(event),
                    Some(other) => {
                        if ctl_tx.send(Control::Signal(other)).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => ingest.flush(),
                _ = purge.tick() => {
                    let purged = ingest.throttle.purge(Instant::now());
                    if purged > 0 {
                        debug!(purged, tracked = ingest.throttle.tracked(), "throttle entries purged");
                    }
                }
            }
        }
        ingest.flush();
        info!(
            revision = ingest.store.view().revision(),
            throttled = ingest.throttle.dropped(),
            ignored = ingest.aggregator.ignored(),
            "ingest loop stopped"
        );
    })
}
