use futures::future::try_join_all;
use k8s_openapi::api::{
    authorization::v1::{ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec},
    core::v1::Namespace,
};
use kube::{
    api::{Api, ListParams, PostParams},
    Client,
};
use lookout_core::{LookoutError, LookoutResult};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{classify, KindInfo, ALL_NAMESPACES};

/// Decides where the current user may list and watch a kind.
#[async_trait::async_trait]
pub trait AccessEvaluator: Send + Sync {
    /// `["*"]` when the kind may be watched cluster-wide, otherwise the namespaces
    /// it may be watched in. Empty when it may not be watched at all.
    async fn watchable_namespaces(&self, kind: &KindInfo) -> LookoutResult<Vec<String>>;

    /// Same shape for the `list` verb. Kinds that cannot be watched may still be listable.
    async fn listable_namespaces(&self, kind: &KindInfo) -> LookoutResult<Vec<String>>;
}

/// Access decided up front; used by tests and by clusters without RBAC.
#[derive(Debug, Clone)]
pub struct StaticAccess {
    default: Vec<String>,
    by_kind: FxHashMap<String, Vec<String>>,
}

impl StaticAccess {
    pub fn cluster_wide() -> Self { Self::namespaces([ALL_NAMESPACES]) }

    pub fn namespaces<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { default: namespaces.into_iter().map(Into::into).collect(), by_kind: FxHashMap::default() }
    }

    /// Override the answer for one kind.
    pub fn with_kind<I, S>(mut self, kind: &str, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.by_kind.insert(kind.to_string(), namespaces.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait::async_trait]
impl AccessEvaluator for StaticAccess {
    async fn watchable_namespaces(&self, kind: &KindInfo) -> LookoutResult<Vec<String>> {
        if !kind.watchable {
            return Ok(Vec::new());
        }
        self.listable_namespaces(kind).await
    }

    async fn listable_namespaces(&self, kind: &KindInfo) -> LookoutResult<Vec<String>> {
        let nss = self.by_kind.get(&kind.kind).unwrap_or(&self.default);
        if !kind.namespaced && !nss.is_empty() {
            return Ok(vec![ALL_NAMESPACES.to_string()]);
        }
        Ok(nss.clone())
    }
}

/// Access evaluated with `SelfSubjectAccessReview`: cluster-wide first, then per namespace.
#[derive(Clone)]
pub struct SsarAccess {
    client: Client,
}

impl SsarAccess {
    pub fn new(client: Client) -> Self { Self { client } }

    async fn review(&self, kind: &KindInfo, namespace: Option<&str>, verb: &str) -> LookoutResult<bool> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let ra = ResourceAttributes {
            group: Some(kind.group.clone()),
            resource: Some(kind.plural.clone()),
            verb: Some(verb.to_string()),
            namespace: namespace.map(|s| s.to_string()),
            ..Default::default()
        };
        let ssar = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec { resource_attributes: Some(ra), ..Default::default() },
            ..Default::default()
        };
        let created = api.create(&PostParams::default(), &ssar).await.map_err(classify)?;
        Ok(created.status.map(|s| s.allowed).unwrap_or(false))
    }

    async fn namespace_names(&self) -> LookoutResult<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.map_err(classify)?;
        Ok(list.items.into_iter().filter_map(|n| n.metadata.name).collect())
    }

    async fn allowed_namespaces(&self, kind: &KindInfo, verb: &str) -> LookoutResult<Vec<String>> {
        if self.review(kind, None, verb).await? {
            return Ok(vec![ALL_NAMESPACES.to_string()]);
        }
        if !kind.namespaced {
            return Ok(Vec::new());
        }
        let names = match self.namespace_names().await {
            Ok(names) => names,
            Err(LookoutError::Authorization(e)) => {
                debug!(kind = %kind.kind, error = %e, "namespaces not listable; no per-namespace access");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let checks = names.iter().map(|ns| self.review(kind, Some(ns), verb));
        let allowed = try_join_all(checks).await?;
        let out: Vec<String> = names.into_iter().zip(allowed).filter(|(_, ok)| *ok).map(|(ns, _)| ns).collect();
        debug!(kind = %kind.kind, verb, namespaces = out.len(), "per-namespace access");
        Ok(out)
    }
}

#[async_trait::async_trait]
impl AccessEvaluator for SsarAccess {
    async fn watchable_namespaces(&self, kind: &KindInfo) -> LookoutResult<Vec<String>> {
        if !kind.watchable {
            return Ok(Vec::new());
        }
        self.allowed_namespaces(kind, "watch").await
    }

    async fn listable_namespaces(&self, kind: &KindInfo) -> LookoutResult<Vec<String>> { self.allowed_namespaces(kind, "list").await }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_access_answers_per_kind() {
        let access = StaticAccess::namespaces(["default", "prod"]).with_kind("Secret", Vec::<String>::new());
        let pods = KindInfo::core("Pod", "pods", true);
        let secrets = KindInfo::core("Secret", "secrets", true);
        let nodes = KindInfo::core("Node", "nodes", false);
        assert_eq!(access.watchable_namespaces(&pods).await.expect("pods"), vec!["default", "prod"]);
        assert!(access.watchable_namespaces(&secrets).await.expect("secrets").is_empty());
        assert_eq!(access.watchable_namespaces(&nodes).await.expect("nodes"), vec![ALL_NAMESPACES]);

        let mut cs = KindInfo::core("ComponentStatus", "componentstatuses", false);
        cs.watchable = false;
        assert!(StaticAccess::cluster_wide().watchable_namespaces(&cs).await.expect("cs").is_empty());
    }

    #[tokio::test]
    async fn list_only_kinds_are_still_listable() {
        let access = StaticAccess::namespaces(["default"]);
        let mut metrics = KindInfo::core("PodMetrics", "pods", true);
        metrics.watchable = false;
        assert!(access.watchable_namespaces(&metrics).await.expect("watch").is_empty());
        assert_eq!(access.listable_namespaces(&metrics).await.expect("list"), vec!["default"]);
    }
}
