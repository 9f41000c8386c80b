//! The `projects` read model: resolves `project_ref -> tenant_ref` plus the
//! `slug`/`name` pair `deploy.triggered` embeds (cd-build-worker's
//! `BuildTriggered` carries neither, so cd-server looks them up once per
//! build/deploy job rather than threading them through the bus schema).

use cd_common::ids::{ProjectRef, TenantRef};
use cd_common::{ErrorKind, Result};
use sqlx::{PgPool, Row};

pub struct ProjectRow {
    pub project_ref: ProjectRef,
    pub tenant_ref: TenantRef,
    pub slug: String,
    pub name: String,
}

fn store_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> cd_common::Error {
    cd_common::Error::source(cd_common::ErrorKind::StoreUnavailable, err)
}

pub async fn get_project(pool: &PgPool, project_ref: ProjectRef) -> Result<ProjectRow> {
    let row = sqlx::query(
        "SELECT project_ref, tenant_ref, slug, name FROM projects
         WHERE project_ref = $1 AND deleted_at IS NULL",
    )
    .bind(project_ref)
    .fetch_optional(pool)
    .await
    .map_err(store_err)?
    .ok_or(ErrorKind::NotFound)?;

    Ok(ProjectRow {
        project_ref: row.try_get("project_ref").map_err(store_err)?,
        tenant_ref: row.try_get("tenant_ref").map_err(store_err)?,
        slug: row.try_get("slug").map_err(store_err)?,
        name: row.try_get("name").map_err(store_err)?,
    })
}
