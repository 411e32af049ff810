use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::pipeline::approval::ApprovalDecision;
use crate::pipeline::{ApprovalStatus, EventSink, PipelineError, QueryRecord};
use crate::store::SessionState;
use crate::web::state::AppState;

const MAX_QUESTION_CHARS: usize = 2000;
const MAX_PAGE_SIZE: usize = 500;

type ApiError = (StatusCode, String);

// Request types

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    /// Continue an existing conversation instead of starting a new one.
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SessionQueryRequest {
    pub question: String,
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct SchemaParams {
    #[serde(default)]
    pub refresh: bool,
}

// Response types

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    #[serde(flatten)]
    pub record: QueryRecord,
    pub message: &'static str,
}

impl From<QueryRecord> for QueryResponse {
    fn from(record: QueryRecord) -> Self {
        let message = status_message(record.approval_status);
        Self { record, message }
    }
}

fn status_message(status: ApprovalStatus) -> &'static str {
    match status {
        ApprovalStatus::Pending => "SQL generated. Awaiting approval.",
        ApprovalStatus::Approved => "SQL approved. Executing.",
        ApprovalStatus::Rejected => "SQL rejected. Nothing was executed.",
        ApprovalStatus::Executed => "Query executed successfully.",
        ApprovalStatus::Failed => "Query failed.",
    }
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub query_count: usize,
    pub pending_query_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl From<SessionState> for SessionSummary {
    fn from(session: SessionState) -> Self {
        Self {
            query_count: session.query_ids.len(),
            pending_query_id: session.checkpoint.map(|c| c.query_id),
            session_id: session.session_id,
            created_at: session.created_at,
            last_activity: session.last_activity,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub queries: Vec<QueryRecord>,
    pub total: usize,
}

fn pipeline_error(e: PipelineError) -> ApiError {
    let status = match &e {
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if !e.is_client_error() {
        error!("Request failed: {}", e);
    }
    (status, e.to_string())
}

fn check_question(question: &str) -> Result<(), ApiError> {
    let length = question.trim().chars().count();
    if length == 0 || length > MAX_QUESTION_CHARS {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("question must be between 1 and {} characters", MAX_QUESTION_CHARS),
        ));
    }
    Ok(())
}

/// Client identity for rate limiting: the peer address, or the
/// `x-client-id` header when the deployment says it can be trusted.
fn client_key(request: &Request, trust_header: bool) -> String {
    let header = trust_header
        .then(|| request.headers().get("x-client-id"))
        .flatten()
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(|v| format!("client:{}", v));

    header
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let key = client_key(&request, state.config.rate_limit.trust_client_header);
    if !state.rate_limiter.check(&key) {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
    }
    next.run(request).await
}

// API Implementations

/// Single-shot question. Starts a conversation unless one is named.
pub async fn submit_query(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    check_question(&payload.question)?;
    let orchestrator = &state.orchestrator;

    let session_id = match payload.session_id {
        Some(id) => id,
        None => orchestrator.create_session().await.map_err(pipeline_error)?.session_id,
    };
    let record = orchestrator
        .submit(&session_id, &payload.question)
        .await
        .map_err(pipeline_error)?;
    Ok(Json(record.into()))
}

pub async fn create_session(State(state): State<Arc<AppState>>) -> Result<Json<SessionSummary>, ApiError> {
    let session = state.orchestrator.create_session().await.map_err(pipeline_error)?;
    Ok(Json(session.into()))
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageParams>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let sessions = state
        .orchestrator
        .list_sessions(page.limit.min(MAX_PAGE_SIZE), page.offset)
        .await
        .map_err(pipeline_error)?;
    Ok(Json(sessions.into_iter().map(SessionSummary::from).collect()))
}

pub async fn submit_session_query(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<SessionQueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    check_question(&payload.question)?;
    let record = state
        .orchestrator
        .submit(&session_id, &payload.question)
        .await
        .map_err(pipeline_error)?;
    Ok(Json(record.into()))
}

/// Server-sent events for one question, one per pipeline transition, named
/// after the event type. The last one is `done` with the full record.
pub async fn stream_session_query(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(payload): Query<SessionQueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    check_question(&payload.question)?;
    let rx = state
        .orchestrator
        .stream(&session_id, &payload.question)
        .await
        .map_err(pipeline_error)?;
    debug!("Streaming question for session {}", session_id);

    let events = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let sse = Event::default()
            .event(event.event_type())
            .json_data(&event)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
        Some((Ok::<_, Infallible>(sse), rx))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn session_history(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let queries = state
        .orchestrator
        .session_history(&session_id)
        .await
        .map_err(pipeline_error)?;
    Ok(Json(json!({
        "session_id": session_id,
        "total": queries.len(),
        "queries": queries,
    })))
}

pub async fn approve_query(
    State(state): State<Arc<AppState>>,
    Path(query_id): Path<String>,
    Json(decision): Json<ApprovalDecision>,
) -> Result<Json<QueryResponse>, ApiError> {
    info!(
        "Decision for query {}: approved={}, modified={}",
        query_id,
        decision.approved,
        decision.modified_sql().is_some()
    );
    let record = state
        .orchestrator
        .resume(&query_id, decision, &EventSink::disabled())
        .await
        .map_err(pipeline_error)?;
    Ok(Json(record.into()))
}

pub async fn get_query(
    State(state): State<Arc<AppState>>,
    Path(query_id): Path<String>,
) -> Result<Json<QueryResponse>, ApiError> {
    let record = state.orchestrator.get_query(&query_id).await.map_err(pipeline_error)?;
    Ok(Json(record.into()))
}

pub async fn query_history(
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let (queries, total) = state
        .orchestrator
        .history(page.limit.min(MAX_PAGE_SIZE), page.offset)
        .await
        .map_err(pipeline_error)?;
    Ok(Json(HistoryResponse { queries, total }))
}

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.orchestrator.cache() {
        Some(cache) => {
            let stats = cache.stats().await;
            Json(json!({ "enabled": true, "hits": stats.hits, "misses": stats.misses, "size": stats.size }))
        }
        None => Json(json!({ "enabled": false, "hits": 0, "misses": 0, "size": 0 })),
    }
}

pub async fn flush_cache(State(state): State<Arc<AppState>>) -> Json<Value> {
    let flushed = match state.orchestrator.cache() {
        Some(cache) => cache.flush().await,
        None => 0,
    };
    info!("Flushed {} cached queries", flushed);
    Json(json!({ "flushed": flushed }))
}

async fn schema_body(state: &AppState, refresh: bool) -> Result<Json<Value>, ApiError> {
    let snapshot = state
        .orchestrator
        .schema()
        .get(refresh)
        .await
        .map_err(|e| pipeline_error(e.into()))?;
    Ok(Json(json!({
        "schema_hash": snapshot.schema_hash(),
        "fetched_at": snapshot.fetched_at,
        "table_count": snapshot.tables.len(),
        "tables": snapshot.tables,
    })))
}

pub async fn get_schema(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SchemaParams>,
) -> Result<Json<Value>, ApiError> {
    schema_body(&state, params.refresh).await
}

pub async fn refresh_schema(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    info!("Schema refresh requested");
    schema_body(&state, true).await
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let metrics = state.orchestrator.metrics().snapshot();
    let cache = match state.orchestrator.cache() {
        Some(cache) => Some(cache.stats().await),
        None => None,
    };
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "database": state.config.database.backend,
        "started_at": state.startup_time,
        "uptime_seconds": metrics.uptime_seconds,
        "metrics": metrics,
        "cache": cache,
    }))
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;
    use crate::db::duckdb_backend::tests::music_backend;
    use crate::pipeline::testing::{self, ScriptedChat};
    use crate::web::routes::api_routes;
    use crate::web::state::AppState;
    use axum::body::{to_bytes, Body};
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(chat: Arc<ScriptedChat>, config: AppConfig) -> Router {
        let orchestrator = testing::orchestrator(chat, Arc::new(music_backend()));
        let state = Arc::new(AppState::new(config, orchestrator));
        api_routes(state.clone()).with_state(state)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        post_from(uri, body, "tests", [127, 0, 0, 1])
    }

    fn post_from(uri: &str, body: Value, client_id: &str, ip: [u8; 4]) -> Request<Body> {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-client-id", client_id)
            .body(Body::from(body.to_string()))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 40000))));
        request
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn submit_then_read_history() {
        let chat = ScriptedChat::new(vec![
            ScriptedChat::text(r#"{"query_type": "simple"}"#),
            ScriptedChat::run_query("SELECT COUNT(*) AS count FROM Track"),
            ScriptedChat::text("There are 42 tracks."),
        ]);
        let app = app(chat, AppConfig::default());

        let response = app
            .clone()
            .oneshot(post("/api/query", json!({"question": "How many tracks are in the database?"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["approval_status"], "executed");
        assert_eq!(body["result"][0]["count"], 42);
        assert_eq!(body["message"], "Query executed successfully.");

        let session_id = body["session_id"].as_str().unwrap().to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/sessions/{}/history", session_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["total"], 1);
    }

    #[tokio::test]
    async fn unknown_query_approval_is_not_found() {
        let app = app(ScriptedChat::new(Vec::new()), AppConfig::default());
        let response = app
            .oneshot(post("/api/approve/missing", json!({"approved": true})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_question_is_a_bad_request() {
        let app = app(ScriptedChat::new(Vec::new()), AppConfig::default());
        let response = app
            .oneshot(post("/api/query", json!({"question": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn mutating_routes_are_rate_limited() {
        let mut config = AppConfig::default();
        config.rate_limit.max_requests = 1;
        let app = app(ScriptedChat::new(Vec::new()), config);

        let first = app
            .clone()
            .oneshot(post("/api/approve/missing", json!({"approved": false})))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::NOT_FOUND);
        let second = app
            .clone()
            .oneshot(post("/api/approve/missing", json!({"approved": false})))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        // read-only routes are not counted
        let health = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(json_body(health).await["status"], "ok");
    }

    #[tokio::test]
    async fn rotating_client_header_does_not_reset_the_limit() {
        let mut config = AppConfig::default();
        config.rate_limit.max_requests = 1;
        let app = app(ScriptedChat::new(Vec::new()), config);
        let body = json!({"approved": false});

        let first = app
            .clone()
            .oneshot(post_from("/api/approve/missing", body.clone(), "alice", [10, 0, 0, 1]))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::NOT_FOUND);
        let rotated = app
            .clone()
            .oneshot(post_from("/api/approve/missing", body.clone(), "mallory", [10, 0, 0, 1]))
            .await
            .unwrap();
        assert_eq!(rotated.status(), StatusCode::TOO_MANY_REQUESTS);

        let other_peer = app
            .oneshot(post_from("/api/approve/missing", body, "alice", [10, 0, 0, 2]))
            .await
            .unwrap();
        assert_eq!(other_peer.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trusted_client_header_keys_the_limit() {
        let mut config = AppConfig::default();
        config.rate_limit.max_requests = 1;
        config.rate_limit.trust_client_header = true;
        let app = app(ScriptedChat::new(Vec::new()), config);
        let body = json!({"approved": false});

        for client in ["alice", "bob"] {
            let response = app
                .clone()
                .oneshot(post_from("/api/approve/missing", body.clone(), client, [10, 0, 0, 1]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
        let again = app
            .oneshot(post_from("/api/approve/missing", body, "alice", [10, 0, 0, 1]))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
