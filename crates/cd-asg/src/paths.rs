//! Path layout for the object store (spec §6): every path is namespaced by
//! resource type and id so multiple components can share one bucket safely.

use cd_common::ids::{BuildId, ProjectRef};
use chrono::{DateTime, Utc};

pub fn build_log(project_ref: ProjectRef, build_id: BuildId) -> String {
    format!("builds/{project_ref}/{build_id}.log")
}

pub fn archived_event(event_type: &str, occurred_at: DateTime<Utc>, event_id: &str) -> String {
    format!(
        "platform-logs/{event_type}/{}/{event_id}.json.gz",
        occurred_at.format("%Y-%m-%d")
    )
}

pub fn build_artifact(project_ref: ProjectRef, build_id: BuildId, relative: &str) -> String {
    format!("artifacts/{project_ref}/{build_id}/{relative}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_log_path_matches_spec_layout() {
        let project = ProjectRef::new();
        let build = BuildId::new();
        let path = build_log(project, build);
        assert_eq!(path, format!("builds/{project}/{build}.log"));
    }

    #[test]
    fn archived_event_path_is_date_partitioned() {
        let when = DateTime::parse_from_rfc3339("2026-07-26T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let path = archived_event("deploy.triggered", when, "abc123");
        assert_eq!(path, "platform-logs/deploy.triggered/2026-07-26/abc123.json.gz");
    }
}
