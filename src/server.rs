//! REST API.
//!
//! A thin axum router over the repositories, the ingestion pipeline and the
//! assistant. Every route except `/health` requires the `x-user-id` header
//! (and optionally `x-user-roles`) set by the fronting gateway.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Health check (returns version) |
//! | `POST`/`GET` | `/profiles` | Create own profile / list all |
//! | `GET` | `/profiles/me` | Caller's profile |
//! | `GET`/`PUT` | `/profiles/{id}` | Read / update a profile |
//! | `POST`/`GET` | `/projects` | Create / list projects |
//! | `GET`/`PUT`/`DELETE` | `/projects/{id}` | |
//! | `POST`/`GET` | `/projects/{id}/nodes` | Create / list a project's nodes |
//! | `POST`/`GET` | `/threads` | Create / list own threads (`?all=true` for every thread) |
//! | `GET`/`PUT`/`DELETE` | `/threads/{id}` | |
//! | `GET`/`POST` | `/threads/{id}/messages` | List / add messages |
//! | `POST` | `/threads/{id}/ask` | Ask the assistant inside the thread |
//! | `GET` | `/messages/summary` | Messages per month |
//! | `GET`/`PUT`/`DELETE` | `/messages/{id}` | |
//! | `GET`/`PUT`/`DELETE` | `/nodes/{id}` | |
//! | `PUT` | `/nodes/{id}/parent` | Move a node |
//! | `POST` | `/nodes/{id}/presign` | Presigned URL for a client-side upload |
//! | `POST` | `/nodes/{id}/upload?file_name=` | Upload raw bytes as a source document |
//! | `GET`/`POST` | `/source-documents` | List (`?status=&node_id=`) / create |
//! | `GET` | `/source-documents/summary` | Source documents per month |
//! | `GET`/`PUT`/`DELETE` | `/source-documents/{id}` | |
//! | `POST` | `/source-documents/{id}/process` | Extract, split and import |
//! | `POST` | `/source-documents/{id}/reset` | Queue for retraining |
//! | `POST` | `/source-documents/{id}/destroy` | Hard delete |
//! | `POST` | `/search` | Direct archive retrieval |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "thread not found: 42" } }
//! ```
//!
//! Error codes: `bad_request` (400), `forbidden` (403), `not_found` (404),
//! `conflict` (409), `disabled` (400), `internal` (500).

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::access::Caller;
use crate::app::App;
use crate::config::Config;
use crate::dto::*;
use crate::error::CxError;
use crate::models::MonthCount;
use crate::repo::{messages, nodes, profiles, projects, source_documents, threads};
use crate::search;

type AppState = Arc<App>;
type ApiResult<T> = Result<T, AppError>;

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Opens the app, warms the archive and serves until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let app = Arc::new(App::open(config).await?);
    app.warm_archive().await?;

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "server listening");
    println!("cx server listening on http://{}", bind_addr);

    axum::serve(listener, router(app.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    app.persist_cache().await;
    Ok(())
}

pub fn router(app: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/profiles", post(create_profile).get(list_profiles))
        .route("/profiles/me", get(my_profile))
        .route("/profiles/{id}", get(get_profile).put(update_profile))
        .route("/projects", post(create_project).get(list_projects))
        .route(
            "/projects/{id}",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/projects/{id}/nodes", post(create_node).get(list_nodes))
        .route("/threads", post(create_thread).get(list_threads))
        .route(
            "/threads/{id}",
            get(get_thread).put(rename_thread).delete(delete_thread),
        )
        .route(
            "/threads/{id}/messages",
            get(list_messages).post(add_message),
        )
        .route("/threads/{id}/ask", post(ask_in_thread))
        .route("/messages/summary", get(message_summary))
        .route(
            "/messages/{id}",
            get(get_message).put(update_message).delete(delete_message),
        )
        .route(
            "/nodes/{id}",
            get(get_node).put(update_node).delete(delete_node),
        )
        .route("/nodes/{id}/parent", put(move_node))
        .route("/nodes/{id}/presign", post(presign_node_upload))
        .route("/nodes/{id}/upload", post(upload_to_node))
        .route(
            "/source-documents",
            get(list_source_documents).post(create_source_document),
        )
        .route("/source-documents/summary", get(source_document_summary))
        .route(
            "/source-documents/{id}",
            get(get_source_document)
                .put(update_source_document)
                .delete(delete_source_document),
        )
        .route("/source-documents/{id}/process", post(process_source_document))
        .route("/source-documents/{id}/reset", post(reset_source_document))
        .route("/source-documents/{id}/destroy", post(destroy_source_document))
        .route("/search", post(handle_search))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match CxError::find(&err) {
            Some(e @ CxError::Validation(_)) => {
                AppError::new(StatusCode::BAD_REQUEST, "bad_request", e.to_string())
            }
            Some(e @ CxError::Forbidden(_)) => {
                AppError::new(StatusCode::FORBIDDEN, "forbidden", e.to_string())
            }
            Some(e @ CxError::NotFound { .. }) => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", e.to_string())
            }
            Some(e @ CxError::Conflict(_)) => {
                AppError::new(StatusCode::CONFLICT, "conflict", e.to_string())
            }
            Some(e @ CxError::Disabled(_)) => {
                AppError::new(StatusCode::BAD_REQUEST, "disabled", e.to_string())
            }
            None => {
                error!(error = %format!("{:#}", err), "request failed");
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    format!("{:#}", err),
                )
            }
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller::from_headers(&parts.headers)?)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Profiles ============

async fn create_profile(
    State(app): State<AppState>,
    caller: Caller,
    Json(input): Json<ProfileForCreation>,
) -> ApiResult<(StatusCode, Json<ProfileDto>)> {
    let profile = profiles::add(&app.pool, &caller, &input).await?;
    Ok((StatusCode::CREATED, Json(profile.into())))
}

async fn list_profiles(
    State(app): State<AppState>,
    caller: Caller,
    Query(page): Query<Page>,
) -> ApiResult<Json<Vec<ProfileDto>>> {
    let list = profiles::list(&app.pool, &caller, page).await?;
    Ok(Json(list.into_iter().map(Into::into).collect()))
}

async fn my_profile(State(app): State<AppState>, caller: Caller) -> ApiResult<Json<ProfileDto>> {
    Ok(Json(profiles::by_user(&app.pool, &caller).await?.into()))
}

async fn get_profile(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<ProfileDto>> {
    Ok(Json(profiles::get(&app.pool, &caller, &id).await?.into()))
}

async fn update_profile(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(input): Json<ProfileForUpdate>,
) -> ApiResult<Json<ProfileDto>> {
    Ok(Json(profiles::update(&app.pool, &caller, &id, &input).await?.into()))
}

// ============ Projects ============

async fn create_project(
    State(app): State<AppState>,
    caller: Caller,
    Json(input): Json<ProjectForCreation>,
) -> ApiResult<(StatusCode, Json<ProjectDto>)> {
    let project = projects::add(&app.pool, &caller, &input).await?;
    Ok((StatusCode::CREATED, Json(project.into())))
}

async fn list_projects(
    State(app): State<AppState>,
    _caller: Caller,
    Query(page): Query<Page>,
) -> ApiResult<Json<Vec<ProjectDto>>> {
    let list = projects::list(&app.pool, page).await?;
    Ok(Json(list.into_iter().map(Into::into).collect()))
}

async fn get_project(
    State(app): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectDto>> {
    Ok(Json(projects::get(&app.pool, &id).await?.into()))
}

async fn update_project(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(input): Json<ProjectForUpdate>,
) -> ApiResult<Json<ProjectDto>> {
    Ok(Json(projects::update(&app.pool, &caller, &id, &input).await?.into()))
}

async fn delete_project(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    projects::delete(&app.pool, &caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Threads & messages ============

#[derive(Debug, Default, Deserialize)]
struct ThreadScope {
    #[serde(default)]
    all: bool,
}

async fn create_thread(
    State(app): State<AppState>,
    caller: Caller,
    Json(input): Json<ThreadForCreation>,
) -> ApiResult<(StatusCode, Json<ThreadDto>)> {
    let thread = threads::create(&app.pool, &caller, &input).await?;
    Ok((StatusCode::CREATED, Json(thread.into())))
}

async fn list_threads(
    State(app): State<AppState>,
    caller: Caller,
    Query(page): Query<Page>,
    Query(scope): Query<ThreadScope>,
) -> ApiResult<Json<Vec<ThreadDto>>> {
    let list = if scope.all {
        threads::list_all(&app.pool, &caller, page).await?
    } else {
        threads::list_for_caller(&app.pool, &caller, page).await?
    };
    Ok(Json(list.into_iter().map(Into::into).collect()))
}

async fn get_thread(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<ThreadDto>> {
    Ok(Json(threads::get(&app.pool, &caller, &id).await?.into()))
}

async fn rename_thread(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(input): Json<ThreadForUpdate>,
) -> ApiResult<Json<ThreadDto>> {
    Ok(Json(threads::rename(&app.pool, &caller, &id, &input).await?.into()))
}

async fn delete_thread(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    threads::delete(&app.pool, &caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(app): State<AppState>,
    caller: Caller,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<Vec<MessageDto>>> {
    let list = messages::list_for_thread(&app.pool, &caller, &thread_id).await?;
    Ok(Json(list.into_iter().map(Into::into).collect()))
}

async fn add_message(
    State(app): State<AppState>,
    caller: Caller,
    Path(thread_id): Path<String>,
    Json(input): Json<MessageForCreation>,
) -> ApiResult<(StatusCode, Json<MessageDto>)> {
    let message = messages::add(&app.pool, &caller, &thread_id, &input).await?;
    Ok((StatusCode::CREATED, Json(message.into())))
}

async fn ask_in_thread(
    State(app): State<AppState>,
    caller: Caller,
    Path(thread_id): Path<String>,
    Json(req): Json<AskRequest>,
) -> ApiResult<Json<MessageDto>> {
    let answer = app
        .assistant
        .ask_in_thread(&app.pool, &caller, &thread_id, &req.question)
        .await?;
    app.persist_cache().await;
    Ok(Json(answer.into()))
}

async fn message_summary(
    State(app): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<Vec<MonthCount>>> {
    Ok(Json(messages::summary(&app.pool, &caller).await?))
}

async fn get_message(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageDto>> {
    Ok(Json(messages::get(&app.pool, &caller, &id).await?.into()))
}

async fn update_message(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(input): Json<MessageForUpdate>,
) -> ApiResult<Json<MessageDto>> {
    Ok(Json(messages::update(&app.pool, &caller, &id, &input).await?.into()))
}

async fn delete_message(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    messages::delete(&app.pool, &caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Nodes ============

#[derive(Debug, Deserialize)]
struct UploadParams {
    file_name: String,
}

#[derive(Serialize)]
struct DeletedResponse {
    deleted: u64,
}

async fn create_node(
    State(app): State<AppState>,
    caller: Caller,
    Path(project_id): Path<String>,
    Json(input): Json<NodeForCreation>,
) -> ApiResult<(StatusCode, Json<NodeDto>)> {
    let node = nodes::add(&app.pool, &caller, &project_id, &input).await?;
    Ok((StatusCode::CREATED, Json(node.into())))
}

async fn list_nodes(
    State(app): State<AppState>,
    _caller: Caller,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Vec<NodeDto>>> {
    let list = nodes::list_for_project(&app.pool, &project_id).await?;
    Ok(Json(list.into_iter().map(Into::into).collect()))
}

async fn get_node(
    State(app): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<NodeDto>> {
    Ok(Json(nodes::get(&app.pool, &id).await?.into()))
}

async fn update_node(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(input): Json<NodeForUpdate>,
) -> ApiResult<Json<NodeDto>> {
    Ok(Json(nodes::update(&app.pool, &caller, &id, &input).await?.into()))
}

async fn delete_node(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<DeletedResponse>> {
    let deleted = nodes::delete(&app.pool, &caller, &id).await?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn move_node(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(input): Json<NodeParentUpdate>,
) -> ApiResult<Json<NodeDto>> {
    let node = nodes::update_parent(&app.pool, &caller, &id, input.parent_id.as_deref()).await?;
    Ok(Json(node.into()))
}

async fn presign_node_upload(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(req): Json<PresignRequest>,
) -> ApiResult<Json<PresignResponse>> {
    let expires = Duration::from_secs(app.config.storage.presign_expiry_secs);
    let resp = app
        .ingestor
        .presign_upload(&caller, &id, &req, expires)
        .await?;
    Ok(Json(resp))
}

async fn upload_to_node(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<SourceDocumentDto>)> {
    let doc = app
        .ingestor
        .upload_document(&caller, &id, &params.file_name, &body)
        .await?;
    Ok((StatusCode::CREATED, Json(doc.into())))
}

// ============ Source documents ============

async fn list_source_documents(
    State(app): State<AppState>,
    _caller: Caller,
    Query(filter): Query<SourceDocumentFilter>,
) -> ApiResult<Json<Vec<SourceDocumentDto>>> {
    let list = source_documents::list(&app.pool, &filter).await?;
    Ok(Json(list.into_iter().map(Into::into).collect()))
}

async fn create_source_document(
    State(app): State<AppState>,
    caller: Caller,
    Json(input): Json<SourceDocumentForCreation>,
) -> ApiResult<(StatusCode, Json<SourceDocumentDto>)> {
    let doc = source_documents::add(&app.pool, &caller, &input).await?;
    Ok((StatusCode::CREATED, Json(doc.into())))
}

async fn source_document_summary(
    State(app): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<Vec<MonthCount>>> {
    Ok(Json(source_documents::count_summary(&app.pool, &caller).await?))
}

async fn get_source_document(
    State(app): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<SourceDocumentDto>> {
    Ok(Json(source_documents::get(&app.pool, &id).await?.into()))
}

async fn update_source_document(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(input): Json<SourceDocumentForUpdate>,
) -> ApiResult<Json<SourceDocumentDto>> {
    let doc = source_documents::update(&app.pool, &caller, &id, &input).await?;
    Ok(Json(doc.into()))
}

async fn delete_source_document(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    app.ingestor.delete_document(&caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn process_source_document(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<SourceDocumentDto>> {
    app.ingestor.process_document(&caller, &id).await?;
    app.persist_cache().await;
    Ok(Json(source_documents::get(&app.pool, &id).await?.into()))
}

async fn reset_source_document(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<SourceDocumentDto>> {
    Ok(Json(app.ingestor.reset_document(&caller, &id).await?.into()))
}

async fn destroy_source_document(
    State(app): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    app.ingestor.destroy_document(&caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ POST /search ============

async fn handle_search(
    State(app): State<AppState>,
    _caller: Caller,
    Json(req): Json<SearchRequest>,
) -> ApiResult<Json<Vec<SearchHitDto>>> {
    let hits = search::search(app.archive.as_ref(), &app.config.assistant, &req).await?;
    Ok(Json(hits))
}
