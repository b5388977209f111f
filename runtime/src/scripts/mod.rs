mod store;

pub use store::{Executable, ExecutableStore, NewScript, ScriptRecord, ScriptStore};

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::auth::CurrentUser;
use crate::error::{ServiceError, ServiceResult};
use crate::server::AppState;

/// Upload size cap.
pub const MAX_UPLOAD_BYTES: usize = 10 << 20;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/scripts/upload",
            post(upload_script).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/scripts", get(list_scripts))
        .route("/scripts/:id", get(get_script).delete(delete_script))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub language: String,
    pub docker_image: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptDetail {
    #[serde(flatten)]
    pub summary: ScriptSummary,
    pub file_path: String,
}

impl From<&ScriptRecord> for ScriptSummary {
    fn from(record: &ScriptRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            language: record.language.clone(),
            docker_image: record.docker_image.clone(),
            created_at: record.created_at,
        }
    }
}

async fn upload_script(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    multipart: Multipart,
) -> ServiceResult<Response> {
    let script = read_upload(multipart).await?;
    let record = state.scripts.create(user, script).await?;
    info!(script = %record.id, user, language = %record.language, "script uploaded");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": record.id,
            "message": "Script uploaded successfully",
        })),
    )
        .into_response())
}

async fn read_upload(mut multipart: Multipart) -> ServiceResult<NewScript> {
    let mut script = NewScript::default();
    let mut saw_file = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ServiceError::validation(format!("invalid multipart body: {}", err)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                script.body = field
                    .bytes()
                    .await
                    .map_err(|err| ServiceError::validation(format!("invalid file: {}", err)))?
                    .to_vec();
                saw_file = true;
            }
            "name" | "description" | "language" => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ServiceError::validation(format!("invalid {}: {}", name, err)))?;
                match name.as_str() {
                    "name" => script.name = value,
                    "description" => script.description = value,
                    _ => script.language = value,
                }
            }
            other => debug!(field = %other, "ignoring unknown upload field"),
        }
    }

    if !saw_file {
        return Err(ServiceError::validation("file is required"));
    }
    Ok(script)
}

async fn list_scripts(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Json<Vec<ScriptSummary>> {
    let scripts = state.scripts.list(user).await;
    Json(scripts.iter().map(ScriptSummary::from).collect())
}

async fn get_script(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(script_id): Path<String>,
) -> ServiceResult<Json<ScriptDetail>> {
    let record = state
        .scripts
        .get(&script_id, user)
        .await
        .ok_or(ServiceError::NotFound("Script"))?;

    Ok(Json(ScriptDetail {
        summary: ScriptSummary::from(&record),
        file_path: record.file_path.display().to_string(),
    }))
}

async fn delete_script(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(script_id): Path<String>,
) -> ServiceResult<StatusCode> {
    state
        .scripts
        .delete(&script_id, user)
        .await?
        .ok_or(ServiceError::NotFound("Script"))?;

    let removed = state.executions.forget_executable(&script_id).await?;
    info!(script = %script_id, user, executions = removed, "script deleted");

    Ok(StatusCode::NO_CONTENT)
}
