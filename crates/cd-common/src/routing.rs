//! Abstracts reverse-proxy configuration writes behind a trait (spec §9's
//! redesign flag: the source wrote proxy config directly to the local
//! filesystem; tests should never have to touch disk for that).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::model::RoutingRule;

#[async_trait::async_trait]
pub trait RoutingPublisher: Send + Sync {
    /// Atomically replace the active routing rule set for `deployment_ref`.
    /// The caller guarantees rules were already validated to sum to 100 when
    /// the deployment becomes active (spec §3 invariant).
    async fn publish(&self, deployment_ref: crate::ids::DeploymentId, rules: Vec<RoutingRule>) -> Result<()>;

    /// Remove all routing state for a deployment (used by cleanup, §4.4.3).
    async fn clear(&self, deployment_ref: crate::ids::DeploymentId) -> Result<()>;

    async fn current(&self, deployment_ref: crate::ids::DeploymentId) -> Result<Vec<RoutingRule>>;
}

/// In-memory implementation used by tests and by single-process deployments
/// that do not need a real reverse proxy.
#[derive(Clone, Default)]
pub struct InMemoryRoutingPublisher {
    table: Arc<RwLock<HashMap<crate::ids::DeploymentId, Vec<RoutingRule>>>>,
}

impl InMemoryRoutingPublisher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RoutingPublisher for InMemoryRoutingPublisher {
    async fn publish(&self, deployment_ref: crate::ids::DeploymentId, rules: Vec<RoutingRule>) -> Result<()> {
        self.table.write().await.insert(deployment_ref, rules);
        Ok(())
    }

    async fn clear(&self, deployment_ref: crate::ids::DeploymentId) -> Result<()> {
        self.table.write().await.remove(&deployment_ref);
        Ok(())
    }

    async fn current(&self, deployment_ref: crate::ids::DeploymentId) -> Result<Vec<RoutingRule>> {
        Ok(self
            .table
            .read()
            .await
            .get(&deployment_ref)
            .cloned()
            .unwrap_or_default())
    }
}

/// Writes a JSON routing table to disk per-deployment, for environments
/// where the reverse proxy watches the filesystem for config changes.
pub struct FileRoutingPublisher {
    root: PathBuf,
}

#[derive(Serialize)]
struct RoutingDoc<'a> {
    rules: &'a [RoutingRule],
}

impl FileRoutingPublisher {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, deployment_ref: crate::ids::DeploymentId) -> PathBuf {
        self.root.join(format!("{deployment_ref}.json"))
    }
}

#[async_trait::async_trait]
impl RoutingPublisher for FileRoutingPublisher {
    async fn publish(&self, deployment_ref: crate::ids::DeploymentId, rules: Vec<RoutingRule>) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let doc = RoutingDoc { rules: &rules };
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| crate::error::Error::source(crate::error::ErrorKind::Internal, e))?;
        let tmp = self.path_for(deployment_ref).with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, self.path_for(deployment_ref)).await?;
        Ok(())
    }

    async fn clear(&self, deployment_ref: crate::ids::DeploymentId) -> Result<()> {
        let path = self.path_for(deployment_ref);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn current(&self, deployment_ref: crate::ids::DeploymentId) -> Result<Vec<RoutingRule>> {
        match tokio::fs::read(self.path_for(deployment_ref)).await {
            Ok(bytes) => {
                #[derive(serde::Deserialize)]
                struct Doc {
                    rules: Vec<RoutingRule>,
                }
                let doc: Doc = serde_json::from_slice(&bytes)
                    .map_err(|e| crate::error::Error::source(crate::error::ErrorKind::Internal, e))?;
                Ok(doc.rules)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(group: &str, pct: u8, active: bool) -> RoutingRule {
        RoutingRule {
            deployment_ref: crate::ids::DeploymentId::new(),
            group: group.to_string(),
            traffic_pct: pct,
            container_ids: vec![],
            is_active: active,
        }
    }

    #[tokio::test]
    async fn in_memory_publisher_round_trips() {
        let publisher = InMemoryRoutingPublisher::new();
        let id = crate::ids::DeploymentId::new();
        publisher
            .publish(id, vec![rule("green", 100, true)])
            .await
            .unwrap();
        let current = publisher.current(id).await.unwrap();
        assert_eq!(current.len(), 1);
        publisher.clear(id).await.unwrap();
        assert!(publisher.current(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_publisher_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = FileRoutingPublisher::new(dir.path().to_path_buf());
        let id = crate::ids::DeploymentId::new();
        publisher
            .publish(id, vec![rule("blue", 0, false), rule("green", 100, true)])
            .await
            .unwrap();
        let current = publisher.current(id).await.unwrap();
        assert_eq!(current.len(), 2);
        publisher.clear(id).await.unwrap();
        assert!(publisher.current(id).await.unwrap().is_empty());
    }
}
