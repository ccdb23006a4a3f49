use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{DynamicObject, WatchEvent as KubeWatchEvent},
    Client,
};
use lookout_core::{DeltaKind, Listing, LookoutError, LookoutResult, Resource, WatchEvent};
use tracing::debug;

use crate::{classify, classify_status, KindInfo};

/// Server-side timeout for streaming watches; the connection resumes when it lapses.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// One frame of a watch, after normalization.
#[derive(Debug, Clone)]
pub enum WireFrame {
    Event(WatchEvent),
    /// Resume point advanced without a change.
    Bookmark(String),
}

pub type FrameStream = BoxStream<'static, LookoutResult<WireFrame>>;

/// The network side of a watch connection.
///
/// `namespace` is `None` for a cluster-wide request.
#[async_trait::async_trait]
pub trait WatchTransport: Send + Sync + 'static {
    /// Open a streaming watch starting after `resource_version`.
    async fn watch(&self, kind: &KindInfo, namespace: Option<&str>, resource_version: &str) -> LookoutResult<FrameStream>;

    /// One long-poll round of the degraded transport: every frame the server sends
    /// before `timeout_secs` elapses.
    async fn poll(&self, kind: &KindInfo, namespace: Option<&str>, resource_version: &str, timeout_secs: u32) -> LookoutResult<Vec<WireFrame>>;

    /// Full list of the kind.
    async fn list(&self, kind: &KindInfo, namespace: Option<&str>) -> LookoutResult<Listing>;
}

/// `WatchTransport` over the kube client and `DynamicObject`.
#[derive(Clone)]
pub struct KubeTransport {
    client: Client,
}

impl KubeTransport {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> LookoutResult<Self> {
        let client = Client::try_default().await.map_err(classify)?;
        Ok(Self { client })
    }

    pub fn client(&self) -> Client { self.client.clone() }

    fn api(&self, kind: &KindInfo, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if kind.namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    async fn open(&self, kind: &KindInfo, namespace: Option<&str>, resource_version: &str, timeout_secs: u32) -> LookoutResult<FrameStream> {
        let wp = WatchParams::default().timeout(timeout_secs);
        let stream = self.api(kind, namespace).watch(&wp, resource_version).await.map_err(classify)?;
        let kind_name = kind.kind.clone();
        Ok(stream
            .map(move |item| item.map_err(classify).and_then(|ev| frame_from(ev, &kind_name)))
            .boxed())
    }
}

fn to_resource(obj: DynamicObject, kind: &str) -> LookoutResult<Resource> {
    let raw = serde_json::to_value(obj).map_err(|e| LookoutError::MalformedPayload(e.to_string()))?;
    Resource::with_kind(raw, kind)
}

fn frame_from(ev: KubeWatchEvent<DynamicObject>, kind: &str) -> LookoutResult<WireFrame> {
    let (delta, obj) = match ev {
        KubeWatchEvent::Added(o) => (DeltaKind::Added, o),
        KubeWatchEvent::Modified(o) => (DeltaKind::Modified, o),
        KubeWatchEvent::Deleted(o) => (DeltaKind::Deleted, o),
        KubeWatchEvent::Bookmark(b) => return Ok(WireFrame::Bookmark(b.metadata.resource_version)),
        KubeWatchEvent::Error(ae) => return Err(classify_status(ae.code, &ae.message)),
    };
    Ok(WireFrame::Event(WatchEvent::new(delta, to_resource(obj, kind)?)))
}

#[async_trait::async_trait]
impl WatchTransport for KubeTransport {
    async fn watch(&self, kind: &KindInfo, namespace: Option<&str>, resource_version: &str) -> LookoutResult<FrameStream> {
        self.open(kind, namespace, resource_version, WATCH_TIMEOUT_SECS).await
    }

    async fn poll(&self, kind: &KindInfo, namespace: Option<&str>, resource_version: &str, timeout_secs: u32) -> LookoutResult<Vec<WireFrame>> {
        let frames: Vec<WireFrame> = self.open(kind, namespace, resource_version, timeout_secs).await?.try_collect().await?;
        debug!(kind = %kind.kind, ns = ?namespace, frames = frames.len(), "long-poll round");
        Ok(frames)
    }

    async fn list(&self, kind: &KindInfo, namespace: Option<&str>) -> LookoutResult<Listing> {
        let list = self.api(kind, namespace).list(&ListParams::default()).await.map_err(classify)?;
        let items = list
            .items
            .into_iter()
            .map(|o| to_resource(o, &kind.kind))
            .collect::<LookoutResult<Vec<_>>>()?;
        Ok(Listing { kind: kind.kind.clone(), resource_version: list.metadata.resource_version, items })
    }
}
