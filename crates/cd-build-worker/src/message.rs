//! The `build.triggered` wire schema (spec §4.3, §6). Deserialization
//! failure or a missing required field is a Logic error — terminal, no
//! requeue — never a Transient one.

use cd_common::ids::{BuildId, DeploymentId, ProjectRef};
use cd_common::model::{Environment, Strategy};
use cd_common::{Error, ErrorKind};
use serde::Deserialize;

/// The deployment cd-server should request once the build completes.
/// `build.triggered` carries this inline rather than cd-server having to
/// look it up elsewhere, since nothing upstream of the build queue is in
/// scope here.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentRequest {
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
pub struct BuildTriggered {
    pub build_id: BuildId,
    pub project_ref: ProjectRef,
    pub git_url: String,
    pub branch: String,
    pub commit: String,
    #[serde(default)]
    pub deploy: bool,
    #[serde(default)]
    pub deployment_id: Option<DeploymentId>,
    #[serde(default)]
    pub deployment: Option<DeploymentRequest>,
}

impl BuildTriggered {
    /// Parses and validates a raw message body. Malformed JSON and missing
    /// required fields both fall out of `serde_json`'s own error here since
    /// every field above is non-`Option` except the two explicitly optional
    /// ones; callers must treat any `Err` as terminal, not retriable.
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        let parsed: Self = serde_json::from_slice(body)
            .map_err(|e| Error::source(ErrorKind::MalformedMessage, e))?;

        if parsed.git_url.trim().is_empty() {
            return Err(Error::custom(
                ErrorKind::MissingRequiredField,
                "git_url is empty",
            ));
        }
        if parsed.commit.trim().is_empty() {
            return Err(Error::custom(
                ErrorKind::MissingRequiredField,
                "commit is empty",
            ));
        }
        if parsed.deploy && parsed.deployment_id.is_none() {
            return Err(Error::custom(
                ErrorKind::MissingRequiredField,
                "deploy=true requires deployment_id",
            ));
        }
        if parsed.deploy && parsed.deployment.is_none() {
            return Err(Error::custom(
                ErrorKind::MissingRequiredField,
                "deploy=true requires a deployment request",
            ));
        }

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_json() {
        let err = BuildTriggered::parse(b"not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
    }

    #[test]
    fn rejects_missing_commit() {
        let body = serde_json::json!({
            "build_id": BuildId::new().to_string(),
            "project_ref": ProjectRef::new().to_string(),
            "git_url": "https://example.org/repo.git",
            "branch": "main",
            "commit": "",
        });
        let err = BuildTriggered::parse(body.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredField);
    }

    #[test]
    fn rejects_deploy_without_deployment_id() {
        let body = serde_json::json!({
            "build_id": BuildId::new().to_string(),
            "project_ref": ProjectRef::new().to_string(),
            "git_url": "https://example.org/repo.git",
            "branch": "main",
            "commit": "abc123",
            "deploy": true,
        });
        let err = BuildTriggered::parse(body.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredField);
    }

    #[test]
    fn rejects_deploy_without_deployment_request() {
        let body = serde_json::json!({
            "build_id": BuildId::new().to_string(),
            "project_ref": ProjectRef::new().to_string(),
            "git_url": "https://example.org/repo.git",
            "branch": "main",
            "commit": "abc123",
            "deploy": true,
            "deployment_id": DeploymentId::new().to_string(),
        });
        let err = BuildTriggered::parse(body.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredField);
    }

    #[test]
    fn accepts_well_formed_message() {
        let body = serde_json::json!({
            "build_id": BuildId::new().to_string(),
            "project_ref": ProjectRef::new().to_string(),
            "git_url": "https://example.org/repo.git",
            "branch": "main",
            "commit": "abc123",
        });
        let parsed = BuildTriggered::parse(body.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.commit, "abc123");
        assert!(!parsed.deploy);
    }
}
