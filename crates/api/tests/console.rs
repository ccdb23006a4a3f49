#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use lookout_api::{Console, ConsoleHandle, RetryAction};
use lookout_core::{Config, DeltaKind, ErrorClass, Listing, LookoutError, LookoutResult, Resource, ResourceKey, WatchEvent};
use lookout_kubehub::{FrameStream, KindInfo, StaticAccess, WatchTransport, WireFrame};
use serde_json::{json, Value};
use tokio::sync::broadcast;

type Frame = (String, Option<String>, LookoutResult<WireFrame>);

/// A cluster whose lists are set by the test and whose watches are fed by `emit`.
struct FakeCluster {
    lists: Mutex<HashMap<(String, Option<String>), LookoutResult<Listing>>>,
    list_calls: Mutex<Vec<(String, Option<String>)>>,
    watch_calls: Mutex<Vec<(String, Option<String>, String)>>,
    frames: broadcast::Sender<Frame>,
}

impl FakeCluster {
    fn new() -> Self {
        Self {
            lists: Mutex::new(HashMap::new()),
            list_calls: Mutex::new(Vec::new()),
            watch_calls: Mutex::new(Vec::new()),
            frames: broadcast::channel(256).0,
        }
    }

    fn set_list(&self, kind: &str, ns: Option<&str>, result: LookoutResult<Listing>) {
        self.lists.lock().unwrap().insert((kind.to_string(), ns.map(|s| s.to_string())), result);
    }

    fn emit(&self, kind: &str, ns: Option<&str>, item: LookoutResult<WireFrame>) {
        let _ = self.frames.send((kind.to_string(), ns.map(|s| s.to_string()), item));
    }

    fn list_calls(&self, kind: &str) -> usize { self.list_calls.lock().unwrap().iter().filter(|(k, _)| k == kind).count() }

    /// `(namespace, resourceVersion)` of every watch opened for `kind`.
    fn watches(&self, kind: &str) -> Vec<(Option<String>, String)> {
        self.watch_calls.lock().unwrap().iter().filter(|(k, _, _)| k == kind).map(|(_, ns, rv)| (ns.clone(), rv.clone())).collect()
    }
}

#[async_trait::async_trait]
impl WatchTransport for FakeCluster {
    async fn watch(&self, kind: &KindInfo, namespace: Option<&str>, resource_version: &str) -> LookoutResult<FrameStream> {
        let mut rx = self.frames.subscribe();
        self.watch_calls.lock().unwrap().push((kind.kind.clone(), namespace.map(|s| s.to_string()), resource_version.to_string()));
        let kind = kind.kind.clone();
        let ns = namespace.map(|s| s.to_string());
        Ok(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok((k, n, item)) if k == kind && n == ns => yield item,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        .boxed())
    }

    async fn poll(&self, _kind: &KindInfo, _namespace: Option<&str>, _rv: &str, _timeout_secs: u32) -> LookoutResult<Vec<WireFrame>> {
        Ok(Vec::new())
    }

    async fn list(&self, kind: &KindInfo, namespace: Option<&str>) -> LookoutResult<Listing> {
        let key = (kind.kind.clone(), namespace.map(|s| s.to_string()));
        self.list_calls.lock().unwrap().push(key.clone());
        self.lists
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Ok(Listing { kind: kind.kind.clone(), resource_version: Some("1".into()), items: Vec::new() }))
    }
}

fn cfg() -> Config {
    Config {
        tick: Duration::from_millis(10),
        retry_backoff: Duration::from_millis(5),
        poll_interval: Duration::from_millis(5),
        poll_timeout_secs: 1,
        relist: Duration::from_secs(3600),
        throttles: Vec::new(),
        ..Config::default()
    }
}

fn deployments() -> KindInfo { KindInfo { group: "apps".into(), version: "v1".into(), ..KindInfo::core("Deployment", "deployments", true) } }
fn replicasets() -> KindInfo { KindInfo { group: "apps".into(), version: "v1".into(), ..KindInfo::core("ReplicaSet", "replicasets", true) } }
fn pods() -> KindInfo { KindInfo::core("Pod", "pods", true) }
fn events() -> KindInfo { KindInfo::core("Event", "events", true) }

fn object(kind: &str, ns: &str, name: &str, rv: u64, owner: Option<(&str, &str)>) -> Resource {
    let mut meta = json!({ "name": name, "namespace": ns, "uid": format!("{}-{}", kind, name), "resourceVersion": rv.to_string() });
    if let Some((okind, oname)) = owner {
        meta["ownerReferences"] = json!([{ "kind": okind, "name": oname, "controller": true }]);
    }
    Resource::from_value(json!({ "kind": kind, "metadata": meta })).expect("object")
}

fn cluster_event(uid: &str, involved: (&str, &str), message: &str, rv: u64) -> Resource {
    let raw: Value = json!({
        "kind": "Event",
        "metadata": { "name": format!("{}.{}", involved.1, uid), "namespace": "default", "uid": uid, "resourceVersion": rv.to_string() },
        "involvedObject": { "kind": involved.0, "name": involved.1, "namespace": "default" },
        "message": message,
        "reason": "Started",
        "type": "Normal",
        "lastTimestamp": "2024-05-01T10:00:00Z"
    });
    Resource::from_value(raw).expect("event")
}

fn listing(kind: &str, rv: u64, items: Vec<Resource>) -> LookoutResult<Listing> {
    Ok(Listing { kind: kind.into(), resource_version: Some(rv.to_string()), items })
}

fn key(kind: &str, ns: &str, name: &str) -> ResourceKey { ResourceKey::new(kind, Some(ns), name) }

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn start(fake: &Arc<FakeCluster>, access: StaticAccess, kinds: Vec<KindInfo>) -> (Console, ConsoleHandle) {
    let console = Console::start(cfg(), Arc::clone(fake) as Arc<dyn WatchTransport>, Arc::new(access), kinds);
    let handle = console.handle();
    (console, handle)
}

fn seed_web(fake: &FakeCluster) {
    fake.set_list("Deployment", None, listing("Deployment", 20, vec![object("Deployment", "default", "web", 10, None)]));
    fake.set_list(
        "ReplicaSet",
        None,
        listing("ReplicaSet", 20, vec![object("ReplicaSet", "default", "web-abc12", 11, Some(("Deployment", "web")))]),
    );
    fake.set_list(
        "Pod",
        None,
        listing("Pod", 20, vec![object("Pod", "default", "web-abc12-xyz", 12, Some(("ReplicaSet", "web-abc12")))]),
    );
}

#[tokio::test]
async fn initial_list_populates_store_and_opens_watches() {
    let fake = Arc::new(FakeCluster::new());
    seed_web(&fake);
    let (_console, handle) = start(&fake, StaticAccess::cluster_wide(), vec![deployments(), replicasets(), pods()]);

    eventually("pod listed", || handle.current().contains(&key("Pod", "default", "web-abc12-xyz"))).await;
    let selection = handle.select("Deployment", Some("default"), "web");
    assert!(!selection.resource.not_found);
    let pods: Vec<&str> = selection.pods.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(pods, vec!["web-abc12-xyz"]);

    eventually("three watches", || ["Deployment", "ReplicaSet", "Pod"].iter().all(|k| !fake.watches(k).is_empty())).await;
    assert_eq!(fake.watches("Pod"), vec![(None, "20".to_string())]);
    assert!(handle.errors().is_empty());
}

#[tokio::test]
async fn watch_events_flow_into_the_store() {
    let fake = Arc::new(FakeCluster::new());
    fake.set_list("Pod", None, listing("Pod", 5, Vec::new()));
    let (_console, handle) = start(&fake, StaticAccess::cluster_wide(), vec![pods()]);
    eventually("pod watch", || !fake.watches("Pod").is_empty()).await;
    let mut revisions = handle.subscribe_revision();
    let before = *revisions.borrow_and_update();

    fake.emit("Pod", None, Ok(WireFrame::Event(WatchEvent::new(DeltaKind::Added, object("Pod", "default", "a", 6, None)))));
    eventually("pod added", || handle.current().contains(&key("Pod", "default", "a"))).await;
    assert!(*revisions.borrow() > before);
    assert_eq!(handle.current().max_version("Pod"), Some(6));

    fake.emit("Pod", None, Ok(WireFrame::Event(WatchEvent::new(DeltaKind::Deleted, object("Pod", "default", "a", 7, None)))));
    eventually("pod deleted", || !handle.current().contains(&key("Pod", "default", "a"))).await;
    assert!(handle.current().tombstone(&key("Pod", "default", "a")).is_some());
}

#[tokio::test]
async fn cluster_events_correlate_to_their_owners() {
    let fake = Arc::new(FakeCluster::new());
    seed_web(&fake);
    fake.set_list("Event", None, listing("Event", 30, vec![cluster_event("e1", ("Pod", "web-abc12-xyz"), "Started container web", 29)]));
    let (_console, handle) = start(&fake, StaticAccess::cluster_wide(), vec![deployments(), replicasets(), pods(), events()]);

    let web = key("Deployment", "default", "web");
    eventually("listed event attached", || handle.events_for(&web).len() == 1).await;
    assert_eq!(handle.events_for(&web)[0].id, "e1");
    assert!(!handle.current().contains(&key("Event", "default", "web-abc12-xyz.e1")));

    eventually("event watch", || !fake.watches("Event").is_empty()).await;
    assert_eq!(fake.watches("Event"), vec![(None, "30".to_string())]);
    let scaled = cluster_event("e2", ("ReplicaSet", "web-abc12"), "Scaled up replica set web-abc12 to 2", 31);
    fake.emit("Event", None, Ok(WireFrame::Event(WatchEvent::new(DeltaKind::Added, scaled))));
    eventually("watched event attached", || handle.events_for(&web).len() == 2).await;
    assert!(handle.recent_events().iter().any(|e| e.id == "e2"));
}

#[tokio::test]
async fn forbidden_cluster_list_falls_back_to_namespaces() {
    let fake = Arc::new(FakeCluster::new());
    let configmaps = KindInfo::core("ConfigMap", "configmaps", true);
    fake.set_list("Pod", None, Err(LookoutError::Authorization("pods is forbidden".into())));
    fake.set_list("Pod", Some("a"), listing("Pod", 9, vec![object("Pod", "a", "p1", 8, None)]));
    fake.set_list("Pod", Some("b"), Err(LookoutError::Authorization("pods is forbidden in b".into())));
    fake.set_list("ConfigMap", None, Err(LookoutError::Authorization("configmaps is forbidden".into())));
    let access = StaticAccess::namespaces(["a", "b"]).with_kind("ConfigMap", Vec::<String>::new());
    let (_console, handle) = start(&fake, access, vec![configmaps, pods()]);

    eventually("namespaced pod listed", || handle.current().contains(&key("Pod", "a", "p1"))).await;
    eventually("per-namespace watches", || fake.watches("Pod").len() == 2).await;
    let mut nss: Vec<Option<String>> = fake.watches("Pod").into_iter().map(|(ns, _)| ns).collect();
    nss.sort();
    assert_eq!(nss, vec![Some("a".to_string()), Some("b".to_string())]);

    eventually("configmaps disabled", || handle.disabled_kinds() == vec!["ConfigMap".to_string()]).await;
    assert!(fake.watches("ConfigMap").is_empty());
    assert!(handle.errors().is_empty(), "denied access is not a user-facing error: {:?}", handle.errors());
}

#[tokio::test]
async fn malformed_list_is_reported_and_retry_clears_it() {
    let fake = Arc::new(FakeCluster::new());
    let services = KindInfo::core("Service", "services", true);
    fake.set_list("Service", None, Err(LookoutError::MalformedPayload("ServiceList response missing items".into())));
    let (_console, handle) = start(&fake, StaticAccess::cluster_wide(), vec![services]);

    eventually("error reported", || handle.errors().len() == 1).await;
    let report = handle.errors().remove(0);
    assert_eq!(report.class, ErrorClass::Payload);
    let retry = report.retry.expect("retry action");
    assert_eq!(retry, RetryAction::Relist { kinds: vec!["Service".to_string()] });
    assert!(fake.watches("Service").is_empty());

    fake.set_list("Service", None, listing("Service", 4, vec![object("Service", "default", "web", 3, None)]));
    handle.retry(retry).expect("console running");
    eventually("service listed", || handle.current().contains(&key("Service", "default", "web"))).await;
    assert!(handle.errors().is_empty());
    assert_eq!(fake.list_calls("Service"), 2);
    eventually("service watch", || !fake.watches("Service").is_empty()).await;
}

#[tokio::test]
async fn expired_watch_relists_and_resumes_from_the_new_version() {
    let fake = Arc::new(FakeCluster::new());
    fake.set_list("Pod", None, listing("Pod", 10, vec![object("Pod", "default", "a", 8, None)]));
    let (_console, handle) = start(&fake, StaticAccess::cluster_wide(), vec![pods()]);
    eventually("first watch", || fake.watches("Pod").len() == 1).await;
    assert_eq!(fake.watches("Pod")[0].1, "10");

    fake.set_list(
        "Pod",
        None,
        listing("Pod", 40, vec![object("Pod", "default", "a", 35, None), object("Pod", "default", "b", 36, None)]),
    );
    fake.emit("Pod", None, Err(LookoutError::Expired("too old resource version: 10 (38)".into())));

    eventually("watch reopened", || fake.watches("Pod").len() == 2).await;
    assert_eq!(fake.watches("Pod")[1], (None, "40".to_string()));
    assert_eq!(fake.list_calls("Pod"), 2);
    let view = handle.current();
    assert!(view.contains(&key("Pod", "default", "b")));
    assert_eq!(view.get(&key("Pod", "default", "a")).map(|r| r.resource_version.clone()), Some("35".to_string()));
    assert!(handle.errors().is_empty());
}

#[tokio::test]
async fn filters_are_applied_through_the_handle() {
    let fake = Arc::new(FakeCluster::new());
    fake.set_list("Pod", None, listing("Pod", 5, vec![object("Pod", "a", "p1", 3, None), object("Pod", "b", "p2", 4, None)]));
    let (_console, handle) = start(&fake, StaticAccess::cluster_wide(), vec![pods()]);
    eventually("pods listed", || handle.current().len() == 2).await;

    let visible = |h: &ConsoleHandle| {
        let mut names: Vec<String> = h.current().visible().map(|r| r.name.clone()).collect();
        names.sort();
        names
    };

    handle.set_filters(vec!["namespace:a".into()]).await.expect("set");
    eventually("only a", || visible(&handle) == vec!["p1".to_string()]).await;
    handle.add_filter("namespace:b").await.expect("add");
    eventually("a and b", || visible(&handle).len() == 2).await;
    handle.remove_filter("namespace:a").await.expect("remove");
    eventually("only b", || visible(&handle) == vec!["p2".to_string()]).await;
    handle.set_global_filters(vec!["!namespace:b".into()]).await.expect("global");
    eventually("nothing", || visible(&handle).is_empty()).await;
    assert_eq!(handle.current().len(), 2);
}

#[tokio::test]
async fn destroy_stops_watches_and_closes_the_handle() {
    let fake = Arc::new(FakeCluster::new());
    let (mut console, handle) = start(&fake, StaticAccess::cluster_wide(), vec![pods()]);
    eventually("pod watch", || !fake.watches("Pod").is_empty()).await;
    assert!(console.is_running());

    console.destroy();
    console.destroy();
    assert!(!console.is_running());
    eventually("watch streams dropped", || fake.frames.receiver_count() == 0).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match handle.set_filters(vec!["namespace:a".into()]).await {
            Err(LookoutError::Closed(_)) => break,
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(()) => {
                assert!(tokio::time::Instant::now() < deadline, "handle still accepts commands");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }
    assert!(matches!(handle.retry(RetryAction::Rewatch { kind: "Pod".into() }), Err(LookoutError::Closed(_))));
}

#[tokio::test]
async fn list_only_kind_falls_back_to_namespace_lists_without_watching() {
    let fake = Arc::new(FakeCluster::new());
    let bindings = KindInfo { watchable: false, ..KindInfo::core("Binding", "bindings", true) };
    fake.set_list("Binding", None, Err(LookoutError::Authorization("bindings is forbidden".into())));
    fake.set_list("Binding", Some("a"), listing("Binding", 7, vec![object("Binding", "a", "b1", 6, None)]));
    let (_console, handle) = start(&fake, StaticAccess::namespaces(["a"]), vec![bindings, pods()]);

    eventually("binding listed per namespace", || handle.current().contains(&key("Binding", "a", "b1"))).await;
    eventually("pod watch", || !fake.watches("Pod").is_empty()).await;
    assert!(handle.disabled_kinds().is_empty());
    assert!(fake.watches("Binding").is_empty());
    assert_eq!(fake.list_calls("Binding"), 2);
}

#[tokio::test]
async fn burst_of_updates_in_one_tick_applies_once_with_the_last_version() {
    let fake = Arc::new(FakeCluster::new());
    fake.set_list("Pod", None, listing("Pod", 5, vec![object("Pod", "default", "a", 5, None)]));
    let config = Config { tick: Duration::from_millis(300), ..cfg() };
    let console = Console::start(config, Arc::clone(&fake) as Arc<dyn WatchTransport>, Arc::new(StaticAccess::cluster_wide()), vec![pods()]);
    let handle = console.handle();
    eventually("pod watch", || !fake.watches("Pod").is_empty()).await;
    let before = handle.current().revision();

    for rv in 6..=10 {
        fake.emit("Pod", None, Ok(WireFrame::Event(WatchEvent::new(DeltaKind::Modified, object("Pod", "default", "a", rv, None)))));
    }
    eventually("last version applied", || {
        handle.current().get(&key("Pod", "default", "a")).map(|r| r.resource_version == "10").unwrap_or(false)
    })
    .await;
    assert_eq!(handle.current().revision(), before + 1);
    assert_eq!(handle.current().max_version("Pod"), Some(10));
}

#[tokio::test]
async fn zero_periods_do_not_stop_the_console() {
    let fake = Arc::new(FakeCluster::new());
    fake.set_list("Pod", None, listing("Pod", 3, vec![object("Pod", "default", "a", 2, None)]));
    let config = Config { tick: Duration::ZERO, throttle_purge: Duration::ZERO, relist: Duration::ZERO, queue_cap: 0, ..cfg() };
    let console = Console::start(config, Arc::clone(&fake) as Arc<dyn WatchTransport>, Arc::new(StaticAccess::cluster_wide()), vec![pods()]);
    let handle = console.handle();

    eventually("pod listed", || handle.current().contains(&key("Pod", "default", "a"))).await;
    handle.set_filters(vec!["namespace:default".into()]).await.expect("ingest still running");
    assert!(console.is_running());
}
