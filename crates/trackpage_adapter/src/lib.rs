#![forbid(unsafe_code)]

use std::env;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::warn;
use trackpage_contracts::activity::{ArtifactName, ARTIFACT_EXTENSION};
use trackpage_engines::activity_source::ActivitySource;
use trackpage_engines::track_render::{GpxPngRenderer, RenderConfig};
use trackpage_os::{PollLoopConfig, PollPhase, PollStatus, SharedPollStatus, SyncEngine};
use trackpage_storage::output::INDEX_FILE_NAME;
use trackpage_storage::{FileLedger, OutputLocation, StorageError};

pub const DEFAULT_HTTP_BIND: &str = "0.0.0.0:42069";
pub const DEFAULT_OUTPUT_DIR: &str = "output";

const INDEX_CONTENT_TYPE: &str = "text/html; charset=utf-8";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterRuntimeConfig {
    pub bind: SocketAddr,
    pub output_dir: PathBuf,
    pub ledger_path: Option<PathBuf>,
    pub sync_enabled: bool,
    pub poll: PollLoopConfig,
    pub render: RenderConfig,
}

impl AdapterRuntimeConfig {
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::from_env_var_map(|key| env::var(key).ok())?;
        config.poll = PollLoopConfig::from_env();
        config.render = RenderConfig::from_env();
        Ok(config)
    }

    /// Parses the server-level settings through `lookup`, leaving poll and render
    /// settings at their defaults.
    pub fn from_env_var_map<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let bind_raw = non_empty("TRACKPAGE_HTTP_BIND").unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());
        let bind = bind_raw
            .parse::<SocketAddr>()
            .map_err(|e| format!("invalid TRACKPAGE_HTTP_BIND '{bind_raw}': {e}"))?;
        let output_dir = non_empty("TRACKPAGE_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
        let ledger_path = non_empty("TRACKPAGE_LEDGER_PATH").map(PathBuf::from);
        let sync_enabled = match lookup("TRACKPAGE_SYNC_ENABLED") {
            Some(v) => !matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "off" | "no"
            ),
            None => true,
        };
        Ok(Self {
            bind,
            output_dir,
            ledger_path,
            sync_enabled,
            poll: PollLoopConfig::mvp_v1(),
            render: RenderConfig::mvp_v1(),
        })
    }

    pub fn output_location(&self) -> OutputLocation {
        OutputLocation::new(&self.output_dir)
    }

    pub fn resolved_ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| self.output_location().default_ledger_path())
    }
}

/// Wires an authenticated source to the file ledger and the PNG renderer.
pub fn build_sync_engine(
    config: &AdapterRuntimeConfig,
    source: Box<dyn ActivitySource + Send>,
) -> Result<SyncEngine, StorageError> {
    let output = config.output_location();
    output.ensure_exists()?;
    let ledger = FileLedger::open(config.resolved_ledger_path())?;
    Ok(SyncEngine::new(
        source,
        Box::new(GpxPngRenderer::new(config.render)),
        Box::new(ledger),
        output,
    ))
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub poll: PollStatus,
}

#[derive(Debug, Clone)]
pub struct PublishState {
    output: OutputLocation,
    status: SharedPollStatus,
}

/// Read-only view of the output location plus `/healthz`. Files are read from disk
/// on every request.
pub fn publish_router(output: OutputLocation, status: SharedPollStatus) -> Router {
    Router::new()
        .route("/", get(serve_index))
        .route("/healthz", get(healthz))
        .route("/:filename", get(serve_named))
        .with_state(PublishState { output, status })
        .layer(TraceLayer::new_for_http())
}

async fn serve_index(State(state): State<PublishState>) -> Response {
    read_index(&state.output).await
}

async fn serve_named(
    State(state): State<PublishState>,
    Path(filename): Path<String>,
) -> Response {
    if filename == INDEX_FILE_NAME {
        return read_index(&state.output).await;
    }
    let Some(name) = ArtifactName::parse(&filename).filter(|n| n.extension() == ARTIFACT_EXTENSION)
    else {
        return not_found("not found");
    };
    match tokio::fs::read(state.output.artifact_path(&name)).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(err) if err.kind() == ErrorKind::NotFound => not_found("not found"),
        Err(err) => {
            warn!(artifact = %name, "artifact read failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "artifact read failed").into_response()
        }
    }
}

async fn read_index(output: &OutputLocation) -> Response {
    match tokio::fs::read(output.index_path()).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, INDEX_CONTENT_TYPE)], bytes).into_response(),
        Err(err) if err.kind() == ErrorKind::NotFound => not_found("index not generated yet"),
        Err(err) => {
            warn!("index read failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "index read failed").into_response()
        }
    }
}

fn not_found(body: &'static str) -> Response {
    (StatusCode::NOT_FOUND, body).into_response()
}

async fn healthz(
    State(state): State<PublishState>,
) -> (StatusCode, Json<AdapterHealthResponse>) {
    // Poisoned only by a poll thread panicking mid-update; the status stays readable.
    let poll = state
        .status
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    if poll.phase == PollPhase::Failed {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(AdapterHealthResponse {
                status: "error".to_string(),
                outcome: "UNHEALTHY".to_string(),
                reason: poll.last_error.clone(),
                poll,
            }),
        );
    }
    (
        StatusCode::OK,
        Json(AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            reason: poll.last_error.clone(),
            poll,
        }),
    )
}
