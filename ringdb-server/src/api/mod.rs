//! HTTP API endpoints

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use ringdb_core::index::TagFilter;
use ringdb_core::query::{QueryExecutor, QueryParser, QueryPlanner, QueryRow, RowSink};
use ringdb_core::storage::Storage;
use ringdb_core::RingError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Application state
pub type AppState = Arc<Storage>;

/// Bytes of CSV gathered before a chunk is handed to the response body
const CHUNK_SIZE: usize = 16 * 1024;
/// Chunks buffered between the executor and a slow client
const CHANNEL_DEPTH: usize = 16;

/// Create the API router
pub fn create_router(storage: Arc<Storage>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/", post(query))
        .route("/api/query", post(query))
        .route("/api/stats", get(stats).post(stats))
        .route("/api/suggest", post(suggest))
        .route("/api/search", post(search))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(storage)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct VolumeResponse {
    pub free_space: u64,
    pub capacity: u64,
    pub generation: u64,
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuggestRequest {
    pub select: String,
    pub metric: Option<String>,
    pub tag: Option<String>,
    #[serde(rename = "starts-with", default)]
    pub starts_with: String,
    /// Accepted for symmetry with queries; output is always line based
    pub output: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchRequest {
    #[serde(default)]
    pub select: String,
    #[serde(rename = "where")]
    pub filter: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: ringdb_core::VERSION.to_string(),
    })
}

/// One JSON key per volume
async fn stats(State(storage): State<AppState>) -> Json<serde_json::Value> {
    let mut out = serde_json::Map::new();
    for volume in storage.volume_stats() {
        let entry = VolumeResponse {
            free_space: volume.free_space,
            capacity: volume.capacity,
            generation: volume.generation,
            path: volume.path.display().to_string(),
        };
        out.insert(
            format!("volume_{}", volume.index),
            serde_json::json!(entry),
        );
    }
    Json(serde_json::Value::Object(out))
}

/// Run a query and stream the CSV result.
///
/// Parse and resolution errors are reported as a single `-message` line.
/// Errors after the first row was sent end the body with the same line.
async fn query(State(storage): State<AppState>, body: String) -> Response {
    let plan = QueryParser::parse(&body).and_then(|q| QueryPlanner::plan(&q, storage.index()));
    let plan = match plan {
        Ok(plan) => plan,
        Err(e) => {
            debug!("Rejected query: {}", e);
            return error_line(&e);
        }
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(CHANNEL_DEPTH);
    tokio::task::spawn_blocking(move || {
        let mut sink = ChannelSink {
            tx,
            buf: String::with_capacity(CHUNK_SIZE),
            closed: false,
        };
        let result = QueryExecutor::execute(&plan, &storage, &mut sink);
        if let Err(e) = result {
            warn!("Query failed: {}", e);
            sink.buf.push_str(&e.wire_message());
            sink.buf.push_str("\r\n");
        }
        sink.flush();
    });

    text(Body::from_stream(ReceiverStream::new(rx)))
}

/// `select` is one of `metric-names`, `tag-names` or `tag-values`
async fn suggest(State(storage): State<AppState>, body: String) -> Response {
    let request: SuggestRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => return error_line(&RingError::QueryParse(e.to_string())),
    };
    let prefix = request.starts_with.as_str();
    let index = storage.index();

    let names = match (request.select.as_str(), &request.metric, &request.tag) {
        ("metric-names", _, _) => index.suggest_metrics(prefix),
        ("tag-names", Some(metric), _) => index.suggest_tags(metric, prefix),
        ("tag-values", Some(metric), Some(tag)) => index.suggest_tag_values(metric, tag, prefix),
        (other, _, _) => {
            return error_line(&RingError::QueryParse(format!(
                "bad suggest request `{}`",
                other
            )))
        }
    };
    text(Body::from(lines(names)))
}

/// Full names of the series of a metric (or of all metrics) matching `where`
async fn search(State(storage): State<AppState>, body: String) -> Response {
    let request: SearchRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => return error_line(&RingError::QueryParse(e.to_string())),
    };
    let filter = match &request.filter {
        Some(v) => match QueryParser::tag_filter(v) {
            Ok(filter) => filter,
            Err(e) => return error_line(&e),
        },
        None => TagFilter::new(),
    };
    let metric = Some(request.select.as_str()).filter(|m| !m.is_empty());
    text(Body::from(lines(storage.index().search(metric, &filter))))
}

// ============================================================================
// Helpers
// ============================================================================

struct ChannelSink {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    buf: String,
    closed: bool,
}

impl ChannelSink {
    fn flush(&mut self) {
        if self.closed || self.buf.is_empty() {
            return;
        }
        let chunk = Bytes::from(std::mem::take(&mut self.buf));
        if self.tx.blocking_send(Ok(chunk)).is_err() {
            debug!("Client went away, query stopped");
            self.closed = true;
        }
    }
}

impl RowSink for ChannelSink {
    fn emit(&mut self, row: QueryRow) -> bool {
        self.buf.push_str(&row.to_csv());
        if self.buf.len() >= CHUNK_SIZE {
            self.flush();
        }
        !self.closed
    }
}

fn lines(names: Vec<String>) -> String {
    let mut out = String::new();
    for name in names {
        out.push_str(&name);
        out.push_str("\r\n");
    }
    out
}

fn text(body: Body) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

fn error_line(e: &RingError) -> Response {
    text(Body::from(format!("{}\r\n", e.wire_message())))
}
