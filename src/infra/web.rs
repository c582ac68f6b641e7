use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use log::error;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::domain::{
    error::DeployError,
    model::{
        Application, ApplicationPatch, AutoscalerStatus, AutoscalingRequest, Cluster,
        DeploymentStatus, DomainInfo, LogOptions, NewApplication, NewCluster, Revision,
        SecretSummary,
    },
    DeploymentService,
};

type Service = State<Arc<DeploymentService>>;
type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(service: Arc<DeploymentService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/clusters", get(list_clusters).post(register_cluster))
        .route("/clusters/:cluster_id", get(get_cluster).delete(delete_cluster))
        .route("/clusters/:cluster_id/apps", get(list_apps).post(create_app))
        .route("/apps/:app_id", get(get_app).patch(update_app).delete(delete_app))
        .route("/apps/:app_id/deploy", post(deploy))
        .route("/apps/:app_id/rollback", post(rollback))
        .route("/apps/:app_id/revisions", get(list_revisions))
        .route("/apps/:app_id/revisions/:number", get(get_revision))
        .route("/apps/:app_id/secrets", get(list_secrets))
        .route("/apps/:app_id/secrets/:key", put(set_secret).delete(delete_secret))
        .route("/apps/:app_id/autoscaling", get(get_autoscaling).put(set_autoscaling))
        .route("/apps/:app_id/domain", get(get_domain).put(set_domain))
        .route("/apps/:app_id/status", get(get_status))
        .route("/apps/:app_id/logs", get(stream_logs))
        .with_state(service)
}

pub struct ApiError(DeployError);

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        ApiError(err)
    }
}

fn status_code(err: &DeployError) -> StatusCode {
    match err {
        DeployError::Validation(_) => StatusCode::BAD_REQUEST,
        DeployError::NotFound { .. } => StatusCode::NOT_FOUND,
        DeployError::Conflict(_) | DeployError::InvalidState(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        if status.is_server_error() {
            error!("Request failed: {:?}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health(State(service): Service) -> impl IntoResponse {
    Json(json!({ "status": "ok", "background_tasks": service.background_tasks() }))
}

async fn list_clusters(State(service): Service) -> ApiResult<Vec<Cluster>> {
    Ok(Json(service.list_clusters().await?))
}

async fn register_cluster(
    State(service): Service,
    Json(payload): Json<NewCluster>,
) -> Result<(StatusCode, Json<Cluster>), ApiError> {
    let cluster = service.register_cluster(payload).await?;
    Ok((StatusCode::CREATED, Json(cluster)))
}

async fn get_cluster(State(service): Service, Path(cluster_id): Path<Uuid>) -> ApiResult<Cluster> {
    Ok(Json(service.get_cluster(cluster_id).await?))
}

async fn delete_cluster(State(service): Service, Path(cluster_id): Path<Uuid>) -> ApiResult<Cluster> {
    Ok(Json(service.delete_cluster(cluster_id).await?))
}

async fn list_apps(State(service): Service, Path(cluster_id): Path<Uuid>) -> ApiResult<Vec<Application>> {
    Ok(Json(service.list_apps(cluster_id).await?))
}

async fn create_app(
    State(service): Service,
    Path(cluster_id): Path<Uuid>,
    Json(payload): Json<NewApplication>,
) -> Result<(StatusCode, Json<Application>), ApiError> {
    let app = service.create_app(cluster_id, payload).await?;
    Ok((StatusCode::CREATED, Json(app)))
}

async fn get_app(State(service): Service, Path(app_id): Path<Uuid>) -> ApiResult<Application> {
    Ok(Json(service.get_app(app_id).await?))
}

async fn update_app(
    State(service): Service,
    Path(app_id): Path<Uuid>,
    Json(patch): Json<ApplicationPatch>,
) -> ApiResult<Application> {
    Ok(Json(service.update_app(app_id, patch).await?))
}

async fn delete_app(State(service): Service, Path(app_id): Path<Uuid>) -> ApiResult<Application> {
    Ok(Json(service.delete_app(app_id).await?))
}

async fn deploy(
    State(service): Service,
    Path(app_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Application>), ApiError> {
    let app = service.deploy(app_id).await?;
    Ok((StatusCode::ACCEPTED, Json(app)))
}

#[derive(Debug, Default, Deserialize)]
struct RollbackRequest {
    revision: Option<u32>,
}

async fn rollback(
    State(service): Service,
    Path(app_id): Path<Uuid>,
    payload: Option<Json<RollbackRequest>>,
) -> Result<(StatusCode, Json<Application>), ApiError> {
    let Json(request) = payload.unwrap_or_default();
    let app = service.rollback(app_id, request.revision).await?;
    Ok((StatusCode::ACCEPTED, Json(app)))
}

#[derive(Debug, Deserialize)]
struct RevisionQuery {
    limit: Option<usize>,
}

async fn list_revisions(
    State(service): Service,
    Path(app_id): Path<Uuid>,
    Query(query): Query<RevisionQuery>,
) -> ApiResult<Vec<Revision>> {
    Ok(Json(service.list_revisions(app_id, query.limit).await?))
}

async fn get_revision(
    State(service): Service,
    Path((app_id, number)): Path<(Uuid, u32)>,
) -> ApiResult<Revision> {
    Ok(Json(service.get_revision(app_id, number).await?))
}

async fn list_secrets(State(service): Service, Path(app_id): Path<Uuid>) -> ApiResult<Vec<SecretSummary>> {
    Ok(Json(service.list_secrets(app_id).await?))
}

#[derive(Deserialize)]
struct SecretValue {
    value: String,
}

async fn set_secret(
    State(service): Service,
    Path((app_id, key)): Path<(Uuid, String)>,
    Json(payload): Json<SecretValue>,
) -> ApiResult<SecretSummary> {
    Ok(Json(service.set_secret(app_id, &key, &payload.value).await?))
}

async fn delete_secret(
    State(service): Service,
    Path((app_id, key)): Path<(Uuid, String)>,
) -> Result<StatusCode, ApiError> {
    service.delete_secret(app_id, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_autoscaling(State(service): Service, Path(app_id): Path<Uuid>) -> ApiResult<AutoscalerStatus> {
    Ok(Json(service.get_autoscaling(app_id).await?))
}

async fn set_autoscaling(
    State(service): Service,
    Path(app_id): Path<Uuid>,
    Json(request): Json<AutoscalingRequest>,
) -> ApiResult<Application> {
    Ok(Json(service.set_autoscaling(app_id, request).await?))
}

#[derive(Deserialize)]
struct DomainRequest {
    domain: Option<String>,
}

async fn get_domain(State(service): Service, Path(app_id): Path<Uuid>) -> ApiResult<DomainInfo> {
    Ok(Json(service.get_domain(app_id).await?))
}

async fn set_domain(
    State(service): Service,
    Path(app_id): Path<Uuid>,
    Json(request): Json<DomainRequest>,
) -> ApiResult<Application> {
    Ok(Json(service.set_domain(app_id, request.domain).await?))
}

async fn get_status(State(service): Service, Path(app_id): Path<Uuid>) -> ApiResult<DeploymentStatus> {
    Ok(Json(service.get_status(app_id).await?))
}

/// Chunked plain-text body; ends with the upstream stream or when the client goes away.
async fn stream_logs(
    State(service): Service,
    Path(app_id): Path<Uuid>,
    Query(options): Query<LogOptions>,
) -> Result<Response, ApiError> {
    let logs = service.stream_logs(app_id, options).await?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(logs),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::{CipherError, ClusterApiError};

    #[test]
    fn errors_map_to_http_statuses() {
        let cases = [
            (DeployError::validation("bad"), StatusCode::BAD_REQUEST),
            (DeployError::not_found("application", "x"), StatusCode::NOT_FOUND),
            (DeployError::Conflict("taken".to_string()), StatusCode::CONFLICT),
            (DeployError::InvalidState("no history".to_string()), StatusCode::CONFLICT),
            (
                DeployError::Decryption {
                    what: "secret",
                    source: CipherError::Authentication,
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                DeployError::Cluster(ClusterApiError::Request("boom".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(status_code(&err), expected, "{err}");
        }
    }

    #[test]
    fn api_error_renders_its_status() {
        let response = ApiError::from(DeployError::not_found("revision", 4)).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
