use axum::{Router, routing::{post, get}, extract::{State, Path, Query}, Json, serve, response::{IntoResponse, Response}, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::path::Path as FsPath;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::dataset::DatasetSource;
use crate::defaults::DEFAULT_ADDR;
use crate::engine::{ProximityEngine, RunHandle};
use crate::errors::ProximityError;
use crate::geo::{DistanceUnit, RadiusBands};
use crate::metrics::get_metrics_collector;
use crate::model::{EntityDirectory, QuerySpec, TimeWindow};
use crate::report::ReportBuilder;
use crate::source::{resolve_center, DeviceFilter, Session};
use crate::EngineConfig;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProximityEngine>,
    pub report: Arc<ReportBuilder>,
    current: Arc<Mutex<Option<TrackedRun>>>,
}

#[derive(Clone)]
struct TrackedRun {
    handle: RunHandle,
    address: String,
}

impl AppState {
    pub fn new(engine: Arc<ProximityEngine>, report: Arc<ReportBuilder>) -> Self {
        Self {
            engine,
            report,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Only the latest run is addressable.
    async fn tracked(&self, id: Uuid) -> Result<TrackedRun, ProximityError> {
        match self.current.lock().await.as_ref() {
            Some(run) if run.handle.id() == id => Ok(run.clone()),
            _ => Err(ProximityError::RunNotFound(id)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    pub address: String,
    #[serde(default)]
    pub radius_m: Option<f64>,
    #[serde(default)]
    pub unit_radius_m: Option<f64>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default)]
    pub entity_ids: Vec<String>,
    #[serde(default)]
    pub all_devices: bool,
}

impl IntoResponse for ProximityError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProximityError::Validation(_) | ProximityError::AddressNotFound(_) => StatusCode::BAD_REQUEST,
            ProximityError::RunNotFound(_) => StatusCode::NOT_FOUND,
            ProximityError::Transport(_)
            | ProximityError::MisalignedBatch { .. }
            | ProximityError::RunFailed(_) => StatusCode::BAD_GATEWAY,
            ProximityError::Worker(_) | ProximityError::RunAborted => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            ProximityError::Validation(problems) => json!({"error": self.to_string(), "problems": problems}),
            _ => json!({"error": self.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy", "version": crate::VERSION})).into_response()
}

async fn list_devices(State(state): State<AppState>, Query(filter): Query<DeviceFilter>) -> Response {
    match state.engine.source().fetch_devices(&filter, state.engine.session()).await {
        Ok(devices) => Json(json!({"devices": devices})).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn create_run(State(state): State<AppState>, Json(req): Json<CreateRunRequest>) -> Response {
    match start(&state, req).await {
        Ok(body) => (StatusCode::ACCEPTED, Json(body)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn start(state: &AppState, req: CreateRunRequest) -> Result<serde_json::Value, ProximityError> {
    let engine = &state.engine;
    let center = resolve_center(engine.source().as_ref(), engine.session(), &req.address).await?;
    let devices = engine
        .source()
        .fetch_devices(&DeviceFilter::all(), engine.session())
        .await?;
    let entity_ids = if req.all_devices {
        devices.iter().map(|d| d.id.clone()).collect()
    } else {
        req.entity_ids
    };
    let directory = EntityDirectory::new(devices);

    let config = engine.config();
    let mut spec = QuerySpec::new(center, TimeWindow::new(req.from, req.to), entity_ids)
        .with_limits(config.record_cap, config.chunk_size);
    if let Some(unit) = req.unit_radius_m {
        spec = spec.with_unit_radius(unit);
    }
    if let Some(radius) = req.radius_m {
        spec = spec.with_radius(radius);
    }
    let bands = RadiusBands::from_radius(spec.radius_m);
    let entities = spec.entity_ids.len();

    let handle = engine.start_run(spec, directory).await?;
    tracing::info!("Run {} accepted for {} ({} entities)", handle.id(), req.address, entities);
    *state.current.lock().await = Some(TrackedRun {
        handle: handle.clone(),
        address: req.address,
    });

    Ok(json!({
        "runId": handle.id(),
        "center": center,
        "bands": bands.radii(),
    }))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.tracked(id).await {
        Ok(run) => Json(json!({
            "runId": id,
            "status": run.handle.status(),
            "hits": run.handle.hits(),
            "cancelRequested": run.handle.is_cancel_requested(),
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn cancel_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.tracked(id).await {
        Ok(run) => {
            state.engine.cancel(&run.handle);
            (StatusCode::ACCEPTED, Json(json!({"runId": id, "cancelRequested": true}))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn run_summary(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let run = match state.tracked(id).await {
        Ok(run) => run,
        Err(e) => return e.into_response(),
    };
    match state.engine.await_completion(&run.handle).await {
        Ok(summary) => {
            let message = state.report.summary_message(&summary, &run.address);
            Json(json!({"summary": summary, "message": message})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn metrics() -> impl IntoResponse {
    Json(json!({"metrics": get_metrics_collector().snapshot()})).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/devices", get(list_devices))
        .route("/runs", post(create_run))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/cancel", post(cancel_run))
        .route("/runs/:id/summary", get(run_summary))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn run(dataset: &FsPath, unit: DistanceUnit) -> anyhow::Result<()> {
    let source = Arc::new(DatasetSource::from_path(dataset).await?);
    let config = EngineConfig::from_env();
    let session = Session::new(std::env::var("PROXIMITY_SESSION").unwrap_or_default());
    let report = Arc::new(ReportBuilder::new(unit).with_record_cap(config.record_cap));
    let engine = Arc::new(ProximityEngine::new(source, session, report.clone(), config));

    let app = router(AppState::new(engine, report));

    let addr = std::env::var("PROXIMITY_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("API listening on {addr}");
    serve(listener, app).await?;
    Ok(())
}
