use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use ulid::Ulid;
use zenith_experiments_core::{
    detect_winner, sample_size, Allocation, Experiment, ExperimentDefinition, ExperimentError,
    ExperimentId, ExperimentStatus, ExperimentType, ExperimentVariant, SampleSizeAnalysis,
    SignificanceTest, Subject, VariantCounts, WinnerAnalysis,
};
use zenith_experiments_store_sqlite::{
    AllocationOutcome, BatchTrackReport, CreateExperimentResult, EventStatistics, EventWindow,
    ExperimentFilter, ExperimentPage, SqliteExperimentStore, TrackEventInput,
};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const DATA_CONTRACT_VERSION: &str = "experiments.v1";

#[derive(Clone)]
struct ServiceState {
    store: Arc<Mutex<SqliteExperimentStore>>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    current_schema_version: i64,
    target_schema_version: i64,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    configuration_error_total: AtomicU64,
    allocation_error_total: AtomicU64,
    experiment_error_total: AtomicU64,
    not_found_total: AtomicU64,
    forbidden_total: AtomicU64,
    storage_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    configuration_error_total: u64,
    allocation_error_total: u64,
    experiment_error_total: u64,
    not_found_total: u64,
    forbidden_total: u64,
    storage_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ListQuery {
    status: Option<String>,
    #[serde(rename = "type")]
    experiment_type: Option<String>,
    page: Option<u64>,
    limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct StatusRequest {
    status: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AllocateRequest {
    experiment_id: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    force_variant: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubjectQuery {
    user_id: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoveQuery {
    experiment_id: String,
    user_id: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchRequest {
    events: Vec<TrackEventInput>,
}

#[derive(Debug, Clone, Deserialize)]
struct StatsQuery {
    experiment_id: String,
    event_type: Option<String>,
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SampleSizeRequest {
    #[serde(default = "default_baseline_rate")]
    baseline_rate: f64,
    minimum_detectable_effect: f64,
    #[serde(default = "default_confidence_level")]
    confidence_level: f64,
    #[serde(default = "default_statistical_power")]
    statistical_power: f64,
}

fn default_baseline_rate() -> f64 {
    0.1
}

fn default_confidence_level() -> f64 {
    0.95
}

fn default_statistical_power() -> f64 {
    0.8
}

#[derive(Debug, Clone, Serialize)]
struct ExperimentDetail {
    experiment: Experiment,
    variants: Vec<ExperimentVariant>,
}

#[derive(Debug, Clone, Serialize)]
struct AllocationList {
    allocations: Vec<Allocation>,
}

#[derive(Debug, Parser)]
#[command(name = "zenith-experiments-service")]
#[command(about = "Local HTTP service for Zenith experiments")]
struct Args {
    #[arg(long, default_value = "./zenith_experiments.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::invalid_json(rejection)
    }

    fn bad_request(&self, code: &'static str, message: impl Into<String>) -> ServiceFailure {
        self.telemetry.record_failure(code, false);
        Self::failure(StatusCode::BAD_REQUEST, code, message, None)
    }

    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();

        if let Some(domain) = err.downcast_ref::<ExperimentError>() {
            return match domain {
                ExperimentError::Configuration(_) => {
                    Self::failure(StatusCode::BAD_REQUEST, "configuration_error", message, None)
                }
                ExperimentError::Allocation(_) => {
                    Self::failure(StatusCode::BAD_REQUEST, "allocation_error", message, None)
                }
                ExperimentError::Experiment(_) => {
                    Self::failure(StatusCode::BAD_REQUEST, "experiment_error", message, None)
                }
                ExperimentError::NotFound(_) => {
                    Self::failure(StatusCode::NOT_FOUND, "experiment_not_found", message, None)
                }
                ExperimentError::Forbidden(_) => {
                    Self::failure(StatusCode::FORBIDDEN, "forbidden", message, None)
                }
            };
        }

        let normalized = format!("{err:#}").to_ascii_lowercase();
        if normalized.contains("sqlite")
            || normalized.contains("database")
            || normalized.contains("schema")
        {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                message,
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteExperimentStore) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let store = Arc::clone(&self.store);
        let handle = tokio::task::spawn_blocking(move || {
            let mut guard = store
                .lock()
                .map_err(|_| anyhow!("experiment store mutex poisoned"))?;
            op(&mut guard)
        });

        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err, default_status, default_code);
                self.telemetry.record_failure(failure.code, false);
                tracing::warn!(
                    operation = operation_label,
                    code = failure.code,
                    "request failed: {}",
                    failure.message
                );
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "configuration_error" => {
                self.configuration_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "allocation_error" => {
                self.allocation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "experiment_error" => {
                self.experiment_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "experiment_not_found" => {
                self.not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "forbidden" => {
                self.forbidden_total.fetch_add(1, Ordering::Relaxed);
            }
            "storage_unavailable" => {
                self.storage_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            configuration_error_total: self.configuration_error_total.load(Ordering::Relaxed),
            allocation_error_total: self.allocation_error_total.load(Ordering::Relaxed),
            experiment_error_total: self.experiment_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            forbidden_total: self.forbidden_total.load(Ordering::Relaxed),
            storage_unavailable_total: self.storage_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        data_contract_version: DATA_CONTRACT_VERSION,
        data,
    }
}

/// Caller identity carried on requests that need one.
fn actor_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-actor-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// Best-effort client address from the usual proxy headers.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    for header in ["x-forwarded-for", "x-real-ip", "x-client-ip"] {
        if let Some(value) = headers.get(header).and_then(|value| value.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    None
}

fn parse_experiment_id(state: &ServiceState, raw: &str) -> Result<ExperimentId, ServiceFailure> {
    Ulid::from_string(raw).map(ExperimentId).map_err(|_| {
        state.bad_request("experiment_error", format!("invalid experiment id: {raw}"))
    })
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/experiments", post(experiments_create).get(experiments_list))
        .route(
            "/v1/experiments/allocate",
            post(experiment_allocate)
                .get(allocations_list)
                .delete(allocation_remove),
        )
        .route(
            "/v1/experiments/track",
            post(events_track).put(events_batch).get(experiment_stats),
        )
        .route("/v1/experiments/:experiment_id", get(experiment_show))
        .route("/v1/experiments/:experiment_id/status", patch(experiment_status))
        .route("/v1/experiments/:experiment_id/winner", get(experiment_winner))
        .route("/v1/stats/sample-size", post(stats_sample_size))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut store = SqliteExperimentStore::open(&args.db)?;
    store.migrate()?;
    tracing::info!(db = %args.db.display(), "experiment store ready");

    let state = ServiceState {
        store: Arc::new(Mutex::new(store)),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReadinessResponse>>, ServiceFailure> {
    let schema_status = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "storage_unavailable",
            "schema_status",
            |store| store.schema_status(),
        )
        .await?;

    if schema_status.migrated {
        return Ok(Json(envelope(ReadinessResponse {
            status: "ready",
            current_schema_version: schema_status.current_version,
            target_schema_version: schema_status.target_version,
        })));
    }

    state.telemetry.record_failure("storage_unavailable", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "storage_unavailable",
        "database schema is not ready",
        Some(json!({
            "current_version": schema_status.current_version,
            "target_version": schema_status.target_version,
        })),
    ))
}

async fn experiments_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<ExperimentDefinition>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<CreateExperimentResult>>), ServiceFailure> {
    let Json(mut definition) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;

    if definition.created_by.trim().is_empty() {
        match actor_id(&headers) {
            Some(actor) => definition.created_by = actor,
            None => {
                return Err(state.bad_request(
                    "configuration_error",
                    "created_by or an x-actor-id header MUST be provided",
                ))
            }
        }
    }

    let created = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "create_experiment",
            move |store| store.create_experiment(&definition),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(envelope(created))))
}

async fn experiments_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<ServiceEnvelope<ExperimentPage>>, ServiceFailure> {
    let Some(owner) = actor_id(&headers) else {
        return Err(state.bad_request(
            "configuration_error",
            "an x-actor-id header MUST identify the owner",
        ));
    };

    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(ExperimentStatus::parse(raw).ok_or_else(|| {
            state.bad_request("configuration_error", format!("unknown status: {raw}"))
        })?),
    };
    let experiment_type = match query.experiment_type.as_deref() {
        None => None,
        Some(raw) => Some(ExperimentType::parse(raw).ok_or_else(|| {
            state.bad_request(
                "configuration_error",
                format!("unknown experiment type: {raw}"),
            )
        })?),
    };

    let filter = ExperimentFilter {
        status,
        experiment_type,
        page: query.page,
        limit: query.limit,
    };

    let page = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "list_failed",
            "list_experiments",
            move |store| store.list_experiments(&owner, &filter),
        )
        .await?;
    Ok(Json(envelope(page)))
}

async fn experiment_show(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ExperimentDetail>>, ServiceFailure> {
    let experiment_id = parse_experiment_id(&state, &experiment_id)?;
    let detail = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "lookup_failed",
            "show_experiment",
            move |store| {
                let experiment = store.get_experiment(experiment_id)?;
                let variants = store.list_variants(experiment_id)?;
                Ok(ExperimentDetail {
                    experiment,
                    variants,
                })
            },
        )
        .await?;
    Ok(Json(envelope(detail)))
}

async fn experiment_status(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<String>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Experiment>>, ServiceFailure> {
    let experiment_id = parse_experiment_id(&state, &experiment_id)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;

    let Some(next) = ExperimentStatus::parse(&request.status) else {
        return Err(state.bad_request(
            "experiment_error",
            format!("unknown status: {}", request.status),
        ));
    };

    let experiment = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "set_status",
            move |store| store.set_status(experiment_id, next),
        )
        .await?;
    Ok(Json(envelope(experiment)))
}

async fn experiment_allocate(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<AllocateRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<AllocationOutcome>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let experiment_id = parse_experiment_id(&state, &request.experiment_id)?;

    // Anonymous callers fall back to the proxy-reported client address as a
    // session identity so bucketing stays sticky per device.
    let session_id = match (&request.user_id, request.session_id) {
        (None, None) => client_ip(&headers),
        (_, session_id) => session_id,
    };
    let subject = Subject {
        user_id: request.user_id,
        session_id,
    };

    let outcome = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "allocation_failed",
            "allocate",
            move |store| store.allocate(experiment_id, &subject, request.force_variant.as_deref()),
        )
        .await?;
    Ok(Json(envelope(outcome)))
}

async fn allocations_list(
    State(state): State<ServiceState>,
    Query(query): Query<SubjectQuery>,
) -> Result<Json<ServiceEnvelope<AllocationList>>, ServiceFailure> {
    let subject = Subject {
        user_id: query.user_id,
        session_id: query.session_id,
    };

    let allocations = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "lookup_failed",
            "list_allocations",
            move |store| store.allocations_for_subject(&subject),
        )
        .await?;
    Ok(Json(envelope(AllocationList { allocations })))
}

async fn allocation_remove(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<RemoveQuery>,
) -> Result<Json<ServiceEnvelope<serde_json::Value>>, ServiceFailure> {
    let experiment_id = parse_experiment_id(&state, &query.experiment_id)?;
    let subject = Subject {
        user_id: query.user_id,
        session_id: query.session_id,
    };

    // Without an explicit actor header the caller is taken to be the subject.
    let actor = match actor_id(&headers) {
        Some(actor) => actor,
        None => match subject.identity_key() {
            Ok(key) => key.to_string(),
            Err(err) => return Err(state.bad_request("allocation_error", err.to_string())),
        },
    };

    state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "remove_allocation",
            move |store| store.remove_allocation(experiment_id, &subject, &actor),
        )
        .await?;
    Ok(Json(envelope(json!({"removed": true}))))
}

async fn events_track(
    State(state): State<ServiceState>,
    payload: Result<Json<TrackEventInput>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<serde_json::Value>>, ServiceFailure> {
    let Json(input) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;

    let event = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "track_event",
            move |store| store.track_event(&input),
        )
        .await?;
    Ok(Json(envelope(json!({"success": true, "event": event}))))
}

async fn events_batch(
    State(state): State<ServiceState>,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<BatchTrackReport>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;

    let report = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "track_batch",
            move |store| store.track_batch(&request.events),
        )
        .await?;
    Ok(Json(envelope(report)))
}

async fn experiment_stats(
    State(state): State<ServiceState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<ServiceEnvelope<EventStatistics>>, ServiceFailure> {
    let experiment_id = parse_experiment_id(&state, &query.experiment_id)?;
    let window = EventWindow {
        event_type: query.event_type,
        start: query.start,
        end: query.end,
    };

    let stats = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "lookup_failed",
            "event_statistics",
            move |store| store.event_statistics(experiment_id, &window),
        )
        .await?;
    Ok(Json(envelope(stats)))
}

async fn experiment_winner(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<String>,
) -> Result<Json<ServiceEnvelope<WinnerAnalysis>>, ServiceFailure> {
    let experiment_id = parse_experiment_id(&state, &experiment_id)?;
    let analysis = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "lookup_failed",
            "detect_winner",
            move |store| {
                let experiment = store.get_experiment(experiment_id)?;
                let counts: Vec<VariantCounts> = store
                    .list_variants(experiment_id)?
                    .into_iter()
                    .map(|v| VariantCounts {
                        name: v.name,
                        is_control: v.is_control,
                        participants: v.participants,
                        conversions: v.conversions,
                    })
                    .collect();
                detect_winner(
                    &counts,
                    experiment.confidence_level,
                    experiment.minimum_sample_size,
                    SignificanceTest::default(),
                )
                .map_err(anyhow::Error::new)
            },
        )
        .await?;
    Ok(Json(envelope(analysis)))
}

async fn stats_sample_size(
    State(state): State<ServiceState>,
    payload: Result<Json<SampleSizeRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<SampleSizeAnalysis>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;

    state.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
    match sample_size(
        request.baseline_rate,
        request.minimum_detectable_effect,
        1.0 - request.confidence_level,
        request.statistical_power,
    ) {
        Ok(analysis) => {
            state
                .telemetry
                .requests_success_total
                .fetch_add(1, Ordering::Relaxed);
            Ok(Json(envelope(analysis)))
        }
        Err(err) => {
            let failure = ServiceState::classify_api_error(
                &anyhow::Error::new(err),
                StatusCode::BAD_REQUEST,
                "configuration_error",
            );
            state.telemetry.record_failure(failure.code, false);
            Err(failure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn fixture_state() -> ServiceState {
        let store = match SqliteExperimentStore::open(std::path::Path::new(":memory:")) {
            Ok(store) => store,
            Err(err) => panic!("failed to open store: {err:#}"),
        };
        if let Err(err) = store.migrate() {
            panic!("failed to migrate store: {err:#}");
        }
        ServiceState {
            store: Arc::new(Mutex::new(store)),
            operation_timeout: Duration::from_millis(2500),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(router: Router, request: Request<axum::body::Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn get_request(uri: &str) -> Request<axum::body::Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn json_request(
        method: &str,
        uri: &str,
        payload: &serde_json::Value,
    ) -> Request<axum::body::Body> {
        Request::builder()
            .uri(uri)
            .method(method)
            .header("content-type", "application/json")
            .header("x-actor-id", "svc-owner")
            .body(axum::body::Body::from(payload.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn definition_payload() -> serde_json::Value {
        json!({
            "name": "onboarding-copy",
            "primary_metric": "signup",
            "variants": [
                {"name": "control", "is_control": true},
                {"name": "treatment"}
            ],
            "traffic_split": {"control": 0.5, "treatment": 0.5}
        })
    }

    async fn create_experiment(router: Router) -> String {
        let response = send(
            router,
            json_request("POST", "/v1/experiments", &definition_payload()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let value = response_json(response).await;
        value
            .pointer("/data/experiment/experiment_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing experiment_id in response: {value}"))
            .to_string()
    }

    fn allocate_payload(experiment_id: &str, user_id: &str) -> serde_json::Value {
        json!({"experiment_id": experiment_id, "user_id": user_id})
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(fixture_state());
        let response = send(router, get_request("/v1/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value
                .get("service_contract_version")
                .and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(
            value.pointer("/data/status").and_then(serde_json::Value::as_str),
            Some("ok")
        );
    }

    #[tokio::test]
    async fn ready_endpoint_reports_ready_after_migration() {
        let router = app(fixture_state());
        let response = send(router, get_request("/v1/ready")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.pointer("/data/status").and_then(serde_json::Value::as_str),
            Some("ready")
        );
    }

    #[tokio::test]
    async fn create_returns_created_with_sample_size_analysis() {
        let router = app(fixture_state());
        let response = send(
            router,
            json_request("POST", "/v1/experiments", &definition_payload()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let value = response_json(response).await;
        assert!(
            value
                .pointer("/data/sample_size_analysis/minimum_sample_size_per_variant")
                .and_then(serde_json::Value::as_u64)
                .is_some(),
            "creation response must carry the power analysis: {value}"
        );
    }

    #[tokio::test]
    async fn create_allocate_track_and_stats_round_trip() {
        let state = fixture_state();
        let router = app(state);

        let experiment_id = create_experiment(router.clone()).await;

        let allocate = send(
            router.clone(),
            json_request(
                "POST",
                "/v1/experiments/allocate",
                &allocate_payload(&experiment_id, "user-1"),
            ),
        )
        .await;
        assert_eq!(allocate.status(), StatusCode::OK);
        let allocate_value = response_json(allocate).await;
        assert_eq!(
            allocate_value
                .pointer("/data/newly_allocated")
                .and_then(serde_json::Value::as_bool),
            Some(true)
        );
        let variant_name = allocate_value
            .pointer("/data/variant/name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing variant name: {allocate_value}"))
            .to_string();
        assert!(["control", "treatment"].contains(&variant_name.as_str()));

        let repeat = send(
            router.clone(),
            json_request(
                "POST",
                "/v1/experiments/allocate",
                &allocate_payload(&experiment_id, "user-1"),
            ),
        )
        .await;
        let repeat_value = response_json(repeat).await;
        assert_eq!(
            repeat_value
                .pointer("/data/variant/name")
                .and_then(serde_json::Value::as_str),
            Some(variant_name.as_str())
        );
        assert_eq!(
            repeat_value
                .pointer("/data/newly_allocated")
                .and_then(serde_json::Value::as_bool),
            Some(false)
        );

        let track = send(
            router.clone(),
            json_request(
                "POST",
                "/v1/experiments/track",
                &json!({
                    "experiment_id": experiment_id,
                    "subject": {"user_id": "user-1"},
                    "event_type": "signup"
                }),
            ),
        )
        .await;
        assert_eq!(track.status(), StatusCode::OK);
        let track_value = response_json(track).await;
        assert_eq!(
            track_value
                .pointer("/data/success")
                .and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let stats = send(
            router,
            get_request(&format!(
                "/v1/experiments/track?experiment_id={experiment_id}"
            )),
        )
        .await;
        assert_eq!(stats.status(), StatusCode::OK);
        let stats_value = response_json(stats).await;
        assert_eq!(
            stats_value
                .pointer("/data/total_events")
                .and_then(serde_json::Value::as_u64),
            Some(1)
        );
        assert_eq!(
            stats_value
                .pointer("/data/counts_by_type/signup")
                .and_then(serde_json::Value::as_u64),
            Some(1)
        );
    }

    #[tokio::test]
    async fn anonymous_allocation_falls_back_to_the_client_address() {
        let router = app(fixture_state());
        let experiment_id = create_experiment(router.clone()).await;

        let request = Request::builder()
            .uri("/v1/experiments/allocate")
            .method("POST")
            .header("content-type", "application/json")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.2")
            .body(axum::body::Body::from(
                json!({"experiment_id": experiment_id}).to_string(),
            ))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(router, request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value
                .pointer("/data/allocation/session_id")
                .and_then(serde_json::Value::as_str),
            Some("203.0.113.9")
        );
    }

    #[tokio::test]
    async fn unknown_experiment_maps_to_not_found() {
        let router = app(fixture_state());
        let missing = Ulid::new();
        let response = send(router, get_request(&format!("/v1/experiments/{missing}"))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let value = response_json(response).await;
        assert_eq!(
            value.pointer("/error/code").and_then(serde_json::Value::as_str),
            Some("experiment_not_found")
        );
        assert!(
            value.get("data_contract_version").is_none(),
            "error envelope must not include data_contract_version: {value}"
        );
    }

    #[tokio::test]
    async fn invalid_traffic_split_maps_to_configuration_error() {
        let router = app(fixture_state());
        let mut payload = definition_payload();
        payload["traffic_split"] = json!({"control": 0.5, "treatment": 0.4});

        let response = send(router, json_request("POST", "/v1/experiments", &payload)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(
            value.pointer("/error/code").and_then(serde_json::Value::as_str),
            Some("configuration_error")
        );
        assert!(
            value
                .pointer("/error/message")
                .and_then(serde_json::Value::as_str)
                .is_some_and(|message| message.contains("0.9")),
            "message should report the actual sum: {value}"
        );
    }

    #[tokio::test]
    async fn illegal_transition_maps_to_experiment_error() {
        let router = app(fixture_state());
        let experiment_id = create_experiment(router.clone()).await;

        let response = send(
            router,
            json_request(
                "PATCH",
                &format!("/v1/experiments/{experiment_id}/status"),
                &json!({"status": "paused"}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(
            value.pointer("/error/code").and_then(serde_json::Value::as_str),
            Some("experiment_error")
        );
    }

    #[tokio::test]
    async fn stranger_cannot_remove_an_allocation() {
        let router = app(fixture_state());
        let experiment_id = create_experiment(router.clone()).await;

        let allocate = send(
            router.clone(),
            json_request(
                "POST",
                "/v1/experiments/allocate",
                &allocate_payload(&experiment_id, "user-1"),
            ),
        )
        .await;
        assert_eq!(allocate.status(), StatusCode::OK);

        let request = Request::builder()
            .uri(format!(
                "/v1/experiments/allocate?experiment_id={experiment_id}&user_id=user-1"
            ))
            .method("DELETE")
            .header("x-actor-id", "stranger")
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(router.clone(), request).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // The subject itself may opt out.
        let request = Request::builder()
            .uri(format!(
                "/v1/experiments/allocate?experiment_id={experiment_id}&user_id=user-1"
            ))
            .method("DELETE")
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(router, request).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn batch_endpoint_reports_partial_failures() {
        let router = app(fixture_state());
        let experiment_id = create_experiment(router.clone()).await;

        send(
            router.clone(),
            json_request(
                "POST",
                "/v1/experiments/allocate",
                &allocate_payload(&experiment_id, "user-1"),
            ),
        )
        .await;

        let ghost = Ulid::new().to_string();
        let response = send(
            router,
            json_request(
                "PUT",
                "/v1/experiments/track",
                &json!({
                    "events": [
                        {
                            "experiment_id": experiment_id,
                            "subject": {"user_id": "user-1"},
                            "event_type": "page_view"
                        },
                        {
                            "experiment_id": ghost,
                            "subject": {"user_id": "user-1"},
                            "event_type": "page_view"
                        }
                    ]
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.pointer("/data/processed").and_then(serde_json::Value::as_u64),
            Some(2)
        );
        assert_eq!(
            value.pointer("/data/successful").and_then(serde_json::Value::as_u64),
            Some(1)
        );
        assert_eq!(
            value.pointer("/data/failed").and_then(serde_json::Value::as_u64),
            Some(1)
        );
    }

    #[tokio::test]
    async fn winner_endpoint_guards_against_peeking() {
        let router = app(fixture_state());
        let experiment_id = create_experiment(router.clone()).await;

        send(
            router.clone(),
            json_request(
                "POST",
                "/v1/experiments/allocate",
                &allocate_payload(&experiment_id, "user-1"),
            ),
        )
        .await;

        let response = send(
            router,
            get_request(&format!("/v1/experiments/{experiment_id}/winner")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.pointer("/data/has_winner").and_then(serde_json::Value::as_bool),
            Some(false)
        );
    }

    #[tokio::test]
    async fn sample_size_endpoint_computes_the_classic_figure() {
        let router = app(fixture_state());
        let response = send(
            router,
            json_request(
                "POST",
                "/v1/stats/sample-size",
                &json!({
                    "baseline_rate": 0.1,
                    "minimum_detectable_effect": 1.0,
                    "confidence_level": 0.95,
                    "statistical_power": 0.8
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        let per_variant = value
            .pointer("/data/minimum_sample_size_per_variant")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or_else(|| panic!("missing sample size: {value}"));
        // Two-proportion test at 0.1 vs 0.2, alpha 0.05, power 0.8.
        assert!(
            (190..=210).contains(&per_variant),
            "unexpected sample size: {per_variant}"
        );
    }

    #[tokio::test]
    async fn invalid_json_is_reported_as_such() {
        let router = app(fixture_state());
        let request = Request::builder()
            .uri("/v1/experiments")
            .method("POST")
            .header("content-type", "application/json")
            .header("x-actor-id", "svc-owner")
            .body(axum::body::Body::from("{not json"))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(router, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(
            value.pointer("/error/code").and_then(serde_json::Value::as_str),
            Some("invalid_json")
        );
    }

    #[tokio::test]
    async fn run_blocking_times_out_with_mapped_error_status() {
        let state = fixture_state();
        let short = ServiceState {
            operation_timeout: Duration::from_millis(1),
            ..state
        };

        let result = short
            .run_blocking(
                StatusCode::INTERNAL_SERVER_ERROR,
                "lookup_failed",
                "unit_timeout_operation",
                |_store| {
                    std::thread::sleep(Duration::from_millis(25));
                    Ok::<_, anyhow::Error>(())
                },
            )
            .await;

        match result {
            Ok(()) => panic!("expected timeout for slow blocking operation"),
            Err(err) => {
                assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(err.code, "lookup_failed");
                assert!(err.message.contains("timed out"));
            }
        }
    }

    #[tokio::test]
    async fn telemetry_counters_track_success_and_failure() {
        let state = fixture_state();
        let router = app(state.clone());

        let ok = send(router.clone(), get_request("/v1/ready")).await;
        assert_eq!(ok.status(), StatusCode::OK);

        let missing = Ulid::new();
        let not_found = send(router, get_request(&format!("/v1/experiments/{missing}"))).await;
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let snapshot = state.telemetry.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_success_total, 1);
        assert_eq!(snapshot.requests_failure_total, 1);
        assert_eq!(snapshot.not_found_total, 1);
    }
}
