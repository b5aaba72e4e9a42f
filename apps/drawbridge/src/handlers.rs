use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use drawbridge_core::{Element, Engine, EngineError, Viewport};

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn engine_error(err: EngineError) -> Response {
    match &err {
        EngineError::InvalidSessionId => error_response(StatusCode::BAD_REQUEST, err.to_string()),
        EngineError::VersionNotFound(_) | EngineError::EmptyLog => {
            error_response(StatusCode::NOT_FOUND, err.to_string())
        }
        EngineError::Store(store_err) => {
            error!(%store_err, "storage failure");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

/// Unwraps a JSON body, turning any rejection into a 400 with `{error}`.
fn require_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match body {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => Err(error_response(StatusCode::BAD_REQUEST, rejection.body_text())),
    }
}

pub async fn health(State(engine): State<Engine>) -> Response {
    let (sessions, clients) = engine.stats().await;
    Json(json!({ "status": "ok", "sessions": sessions, "clients": clients })).into_response()
}

pub async fn list_sessions(State(engine): State<Engine>) -> Response {
    Json(engine.list_sessions().await).into_response()
}

pub async fn get_session(State(engine): State<Engine>, Path(id): Path<String>) -> Response {
    match engine.scene(&id).await {
        Ok(scene) => Json(json!({
            "id": id,
            "elements": scene.elements,
            "appState": scene.app_state,
            "viewport": scene.viewport,
        }))
        .into_response(),
        Err(err) => engine_error(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetElementsRequest {
    pub elements: Vec<Element>,
    #[serde(default)]
    pub app_state: Option<Value>,
}

pub async fn set_elements(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    body: Result<Json<SetElementsRequest>, JsonRejection>,
) -> Response {
    let body = match require_body(body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    match engine.set_elements(&id, body.elements, body.app_state).await {
        Ok((element_count, clients)) => Json(json!({
            "success": true,
            "elementCount": element_count,
            "clients": clients,
        }))
        .into_response(),
        Err(err) => engine_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct AppendElementsRequest {
    pub elements: Vec<Element>,
}

pub async fn append_elements(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    body: Result<Json<AppendElementsRequest>, JsonRejection>,
) -> Response {
    let body = match require_body(body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    match engine.append_elements(&id, body.elements).await {
        Ok(element_count) => {
            Json(json!({ "success": true, "elementCount": element_count })).into_response()
        }
        Err(err) => engine_error(err),
    }
}

pub async fn set_viewport(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    body: Result<Json<Viewport>, JsonRejection>,
) -> Response {
    let viewport = match require_body(body) {
        Ok(viewport) => viewport,
        Err(response) => return response,
    };
    match engine.set_viewport(&id, viewport).await {
        Ok(viewport) => Json(json!({ "success": true, "viewport": viewport })).into_response(),
        Err(err) => engine_error(err),
    }
}

pub async fn clear(State(engine): State<Engine>, Path(id): Path<String>) -> Response {
    match engine.clear(&id).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => engine_error(err),
    }
}

pub async fn undo(State(engine): State<Engine>, Path(id): Path<String>) -> Response {
    match engine.undo(&id).await {
        Ok(element_count) => {
            Json(json!({ "success": true, "elementCount": element_count })).into_response()
        }
        Err(EngineError::EmptyLog) => {
            Json(json!({ "success": false, "message": "nothing to undo" })).into_response()
        }
        Err(err) => engine_error(err),
    }
}

pub async fn versions(State(engine): State<Engine>, Path(id): Path<String>) -> Response {
    match engine.versions(&id).await {
        Ok(listing) => Json(listing).into_response(),
        Err(err) => engine_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub timestamp: i64,
}

pub async fn restore(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    body: Result<Json<RestoreRequest>, JsonRejection>,
) -> Response {
    let body = match require_body(body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    match engine.restore(&id, body.timestamp).await {
        Ok(element_count) => {
            Json(json!({ "success": true, "elementCount": element_count })).into_response()
        }
        Err(err) => engine_error(err),
    }
}

pub async fn files(State(engine): State<Engine>, Path(id): Path<String>) -> Response {
    match engine.files(&id).await {
        Ok(files) => Json(json!({ "files": files })).into_response(),
        Err(err) => engine_error(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFileRequest {
    pub id: String,
    pub cdn_url: String,
    pub mime_type: String,
}

pub async fn add_file(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    body: Result<Json<AddFileRequest>, JsonRejection>,
) -> Response {
    let body = match require_body(body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    match engine.add_file(&id, body.id, body.cdn_url, body.mime_type).await {
        Ok(file_count) => {
            Json(json!({ "success": true, "fileCount": file_count })).into_response()
        }
        Err(err) => engine_error(err),
    }
}
