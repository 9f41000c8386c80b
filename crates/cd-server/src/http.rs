//! The read-model HTTP surface (spec §6): health, live log streaming, and
//! paginated lookups over builds/deployments/projects. Grounded on the
//! `gateway` crate's `axum` router shape and its `impl IntoResponse for
//! Error` pattern, generalized from gateway's domain to this one's.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use cd_broker::EventBroker;
use cd_common::ids::{BuildId, DeploymentId, ProjectRef};
use cd_common::model::{Build, Deployment, Environment, ResourceType};
use cd_common::{Error, ErrorKind};
use cd_deploy_orchestrator::store::DeploymentStore;
use futures::stream::StreamExt;
use lapin::Connection;
use serde::Deserialize;
use sqlx::{PgPool, Row};

use crate::pg_sink;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub store: Arc<dyn DeploymentStore>,
    pub broker: EventBroker,
    pub bus: Arc<Connection>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/deployments/:id/logs/stream",
            get(stream_deployment_logs),
        )
        .route("/api/deployments/:id/logs", get(list_deployment_logs))
        .route("/api/builds/:id", get(get_build))
        .route("/api/deployments/:id", get(get_deployment))
        .route(
            "/api/projects/:id/deployments",
            get(list_project_deployments),
        )
        .with_state(state)
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::NotFound => axum::http::StatusCode::NOT_FOUND,
            ErrorKind::QuotaExhausted
            | ErrorKind::RateLimited
            | ErrorKind::ConcurrencyExceeded
            | ErrorKind::MissingRequiredField
            | ErrorKind::MalformedMessage => axum::http::StatusCode::BAD_REQUEST,
            ErrorKind::BusUnavailable
            | ErrorKind::StoreUnavailable
            | ErrorKind::RegistryUnavailable
            | ErrorKind::CacheUnavailable => axum::http::StatusCode::SERVICE_UNAVAILABLE,
            _ => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Response {
    if let Err(e) = sqlx::query("SELECT 1").execute(&state.pool).await {
        return ApiError(Error::source(ErrorKind::StoreUnavailable, e)).into_response();
    }
    if state.bus.status().connected() {
        (axum::http::StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
    } else {
        ApiError(Error::from_kind(ErrorKind::BusUnavailable)).into_response()
    }
}

async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<BuildId>,
) -> Result<Json<Build>, ApiError> {
    let row = sqlx::query("SELECT * FROM builds WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| Error::source(ErrorKind::StoreUnavailable, e))?
        .ok_or(ErrorKind::NotFound)?;

    Ok(Json(Build {
        id: row
            .try_get("id")
            .map_err(|e| Error::source(ErrorKind::StoreUnavailable, e))?,
        project_ref: row
            .try_get("project_ref")
            .map_err(|e| Error::source(ErrorKind::StoreUnavailable, e))?,
        commit: row
            .try_get("commit")
            .map_err(|e| Error::source(ErrorKind::StoreUnavailable, e))?,
        branch: row
            .try_get("branch")
            .map_err(|e| Error::source(ErrorKind::StoreUnavailable, e))?,
        status: row
            .try_get("status")
            .map_err(|e| Error::source(ErrorKind::StoreUnavailable, e))?,
        image_tags: row
            .try_get::<Option<Vec<String>>, _>("image_tags")
            .map_err(|e| Error::source(ErrorKind::StoreUnavailable, e))?
            .unwrap_or_default(),
        error: row
            .try_get("error")
            .map_err(|e| Error::source(ErrorKind::StoreUnavailable, e))?,
        started_at: row
            .try_get("started_at")
            .map_err(|e| Error::source(ErrorKind::StoreUnavailable, e))?,
        completed_at: row
            .try_get("completed_at")
            .map_err(|e| Error::source(ErrorKind::StoreUnavailable, e))?,
        retry_count: row
            .try_get::<i32, _>("retry_count")
            .map_err(|e| Error::source(ErrorKind::StoreUnavailable, e))? as u32,
    }))
}

async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<DeploymentId>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment = state.store.get_deployment(id).await?;
    Ok(Json(deployment))
}

#[derive(Deserialize)]
struct ListDeploymentsQuery {
    environment: Option<Environment>,
    #[serde(default = "default_list_limit")]
    limit: u32,
}

fn default_list_limit() -> u32 {
    50
}

async fn list_project_deployments(
    State(state): State<AppState>,
    Path(project_ref): Path<ProjectRef>,
    Query(q): Query<ListDeploymentsQuery>,
) -> Result<Json<Vec<Deployment>>, ApiError> {
    let limit = q.limit.min(200) as i64;
    let rows = if let Some(environment) = q.environment {
        sqlx::query(
            "SELECT * FROM deployments WHERE project_ref = $1 AND environment = $2
             AND deleted_at IS NULL ORDER BY id DESC LIMIT $3",
        )
        .bind(project_ref)
        .bind(environment)
        .bind(limit)
        .fetch_all(&state.pool)
        .await
    } else {
        sqlx::query(
            "SELECT * FROM deployments WHERE project_ref = $1
             AND deleted_at IS NULL ORDER BY id DESC LIMIT $2",
        )
        .bind(project_ref)
        .bind(limit)
        .fetch_all(&state.pool)
        .await
    }
    .map_err(|e| Error::source(ErrorKind::StoreUnavailable, e))?;

    let deployments = rows
        .iter()
        .map(crate::pg_store::deployment_from_row)
        .collect::<cd_common::Result<Vec<_>>>()?;
    Ok(Json(deployments))
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default)]
    after_sequence: u64,
    #[serde(default = "default_log_limit")]
    limit: u32,
}

fn default_log_limit() -> u32 {
    100
}

async fn list_deployment_logs(
    State(state): State<AppState>,
    Path(id): Path<DeploymentId>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<Vec<cd_common::model::EventRecord>>, ApiError> {
    let events = pg_sink::list_events(
        &state.pool,
        ResourceType::Deployment,
        id.ulid(),
        q.after_sequence,
        q.limit.min(500),
    )
    .await?;
    Ok(Json(events))
}

async fn stream_deployment_logs(
    State(state): State<AppState>,
    Path(id): Path<DeploymentId>,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let handle = state
        .broker
        .subscribe(ResourceType::Deployment, id.ulid())
        .await;
    let stream = handle.into_stream().map(|record| {
        Ok(Event::default()
            .event(format!("{:?}", record.kind).to_lowercase())
            .json_data(record)
            .unwrap_or_else(|_| Event::default().data("serialization error")))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
