//! The `deploy.triggered` / `project.cleanup` wire schemas (spec §4.4, §6).
//! Incomplete messages fail terminally, mirroring `build-worker`'s
//! `message.rs`.

use cd_common::ids::{BuildId, DeploymentId, ProjectRef};
use cd_common::model::{Environment, Strategy};
use cd_common::{Error, ErrorKind};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectInfo {
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildInfo {
    pub image_tags: Vec<String>,
    pub branch: String,
    pub commit: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentSpec {
    pub environment: Environment,
    pub strategy: Strategy,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeployTriggered {
    pub deployment_id: DeploymentId,
    pub build_id: BuildId,
    pub project_ref: ProjectRef,
    pub project: ProjectInfo,
    pub build: BuildInfo,
    pub deployment: DeploymentSpec,
}

impl DeployTriggered {
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        let parsed: Self =
            serde_json::from_slice(body).map_err(|e| Error::source(ErrorKind::MalformedMessage, e))?;

        if parsed.build.image_tags.is_empty() {
            return Err(Error::custom(
                ErrorKind::MissingRequiredField,
                "build.image_tags is empty",
            ));
        }
        if parsed.deployment.replicas == 0 {
            return Err(Error::custom(
                ErrorKind::MissingRequiredField,
                "deployment.replicas must be at least 1",
            ));
        }

        Ok(parsed)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupContainer {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectCleanup {
    pub project_ref: ProjectRef,
    #[serde(default)]
    pub containers: Vec<CleanupContainer>,
}

impl ProjectCleanup {
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(body).map_err(|e| Error::source(ErrorKind::MalformedMessage, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_body() -> serde_json::Value {
        serde_json::json!({
            "deployment_id": DeploymentId::new().to_string(),
            "build_id": BuildId::new().to_string(),
            "project_ref": ProjectRef::new().to_string(),
            "project": { "slug": "acme", "name": "Acme" },
            "build": { "image_tags": ["img:sha"], "branch": "main", "commit": "abc" },
            "deployment": { "environment": "production", "strategy": "blue_green", "replicas": 2 },
        })
    }

    #[test]
    fn accepts_well_formed_message() {
        let parsed = DeployTriggered::parse(valid_body().to_string().as_bytes()).unwrap();
        assert_eq!(parsed.deployment.replicas, 2);
    }

    #[test]
    fn rejects_empty_image_tags() {
        let mut body = valid_body();
        body["build"]["image_tags"] = serde_json::json!([]);
        let err = DeployTriggered::parse(body.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredField);
    }

    #[test]
    fn rejects_zero_replicas() {
        let mut body = valid_body();
        body["deployment"]["replicas"] = serde_json::json!(0);
        let err = DeployTriggered::parse(body.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredField);
    }

    #[test]
    fn cleanup_parses_container_list() {
        let body = serde_json::json!({
            "project_ref": ProjectRef::new().to_string(),
            "containers": [{ "id": "c1", "name": "web-1" }],
        });
        let parsed = ProjectCleanup::parse(body.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.containers.len(), 1);
    }
}
