use crate::telemetry::format_error_chain;
use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use execbandit_config::{AppConfig, WebConfig};
use execbandit_core_types::SettlementEvent;
use execbandit_ope::{EvaluationReport, OfflineEvaluator};
use execbandit_policy::{DecisionEngine, PolicyError, SelectionDecision, SettleOutcome};
use execbandit_storage::{is_retryable_sqlite_anyhow_error, SqliteStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

#[derive(Clone)]
pub struct WebRuntimeHandle {
    inner: Arc<WebRuntimeInner>,
}

struct WebRuntimeInner {
    sqlite_path: String,
    engine: Arc<DecisionEngine>,
    evaluator: OfflineEvaluator,
    default_policy: String,
    default_lookback_hours: u64,
    started_at: DateTime<Utc>,
}

impl WebRuntimeHandle {
    pub fn new(sqlite_path: String, engine: Arc<DecisionEngine>, config: &AppConfig) -> Self {
        Self {
            inner: Arc::new(WebRuntimeInner {
                sqlite_path,
                engine,
                evaluator: OfflineEvaluator::new(config),
                default_policy: config.reward.family.as_str().to_string(),
                default_lookback_hours: config.ope.schedule_lookback_hours,
                started_at: Utc::now(),
            }),
        }
    }

    fn sqlite_path(&self) -> String {
        self.inner.sqlite_path.clone()
    }

    pub async fn run_server(self, web_config: WebConfig) -> Result<()> {
        let app = build_router(self);
        let bind = format!("{}:{}", web_config.host, web_config.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("failed to bind web server on {}", bind))?;
        info!(bind = %bind, "web server started");
        axum::serve(listener, app)
            .await
            .context("axum web server failed")?;
        Ok(())
    }
}

fn build_router(state: WebRuntimeHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/select", post(api_select))
        .route("/api/settle", post(api_settle))
        .route("/api/evaluate", get(api_evaluate))
        .route("/api/ope/latest", get(api_latest_ope_run))
        .route("/api/pending", get(api_pending))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn service_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }

    /// Typed caller faults map to 400, sqlite lock contention that outlasted the
    /// write retries maps to 503, everything else is a server fault.
    fn from_anyhow(error: anyhow::Error) -> Self {
        let caller_error = error.chain().any(|cause| {
            cause
                .downcast_ref::<PolicyError>()
                .is_some_and(PolicyError::is_caller_error)
        });
        let message = format_error_chain(&error);
        if caller_error {
            Self::bad_request(message)
        } else if is_retryable_sqlite_anyhow_error(&error) {
            warn!(error = %message, "api request hit sqlite contention");
            Self::service_unavailable(message)
        } else {
            warn!(error = %message, "api request failed");
            Self::internal(message)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": self.message,
                "status": self.status.as_u16(),
            })),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SelectRequest {
    correlation_id: String,
    instrument_id: String,
    context: Vec<f64>,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct EvaluateQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    policy: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PolicyQuery {
    policy: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct PendingResponse {
    ts: DateTime<Utc>,
    pending: usize,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct OpeRunView {
    run_id: String,
    policy: String,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    pass: bool,
    created_at: DateTime<Utc>,
    report: Value,
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok", "ts": Utc::now()}))
}

async fn api_select(
    State(state): State<WebRuntimeHandle>,
    Json(request): Json<SelectRequest>,
) -> Result<Json<SelectionDecision>, ApiError> {
    let engine = state.inner.engine.clone();
    let decision = read_write_db(state.sqlite_path(), move |store| {
        engine.select_with_metadata(
            &store,
            &request.context,
            &request.instrument_id,
            &request.correlation_id,
            request.metadata,
            Utc::now(),
        )
    })
    .await?;
    Ok(Json(decision))
}

async fn api_settle(
    State(state): State<WebRuntimeHandle>,
    Json(event): Json<SettlementEvent>,
) -> Result<Json<SettleOutcome>, ApiError> {
    let engine = state.inner.engine.clone();
    let outcome = read_write_db(state.sqlite_path(), move |store| {
        engine.settle(&store, &event, Utc::now())
    })
    .await?;
    Ok(Json(outcome))
}

async fn api_evaluate(
    State(state): State<WebRuntimeHandle>,
    Query(query): Query<EvaluateQuery>,
) -> Result<Json<EvaluationReport>, ApiError> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or_else(|| {
        to - Duration::hours(i64::try_from(state.inner.default_lookback_hours).unwrap_or(24))
    });
    if from > to {
        return Err(ApiError::bad_request(format!(
            "from={} must not be after to={}",
            from.to_rfc3339(),
            to.to_rfc3339()
        )));
    }
    let policy = query
        .policy
        .unwrap_or_else(|| state.inner.default_policy.clone());
    let evaluator = state.inner.evaluator.clone();
    let report = read_only_db(state.sqlite_path(), move |store| {
        evaluator.evaluate(&store, from, to, &policy)
    })
    .await?;
    Ok(Json(report))
}

async fn api_latest_ope_run(
    State(state): State<WebRuntimeHandle>,
    Query(query): Query<PolicyQuery>,
) -> Result<Json<Option<OpeRunView>>, ApiError> {
    let policy = query
        .policy
        .unwrap_or_else(|| state.inner.default_policy.clone());
    let run = read_only_db(state.sqlite_path(), move |store| store.latest_ope_run(&policy)).await?;
    Ok(Json(run.map(|run| OpeRunView {
        run_id: run.run_id,
        policy: run.policy,
        from: run.from,
        to: run.to,
        pass: run.pass,
        created_at: run.created_at,
        report: run.report,
    })))
}

async fn api_pending(State(state): State<WebRuntimeHandle>) -> Json<PendingResponse> {
    Json(PendingResponse {
        ts: Utc::now(),
        pending: state.inner.engine.pending_len(),
        started_at: state.inner.started_at,
    })
}

async fn read_only_db<T, F>(sqlite_path: String, action: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(SqliteStore) -> Result<T> + Send + 'static,
{
    run_blocking_db(sqlite_path, true, action).await
}

async fn read_write_db<T, F>(sqlite_path: String, action: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(SqliteStore) -> Result<T> + Send + 'static,
{
    run_blocking_db(sqlite_path, false, action).await
}

async fn run_blocking_db<T, F>(sqlite_path: String, read_only: bool, action: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(SqliteStore) -> Result<T> + Send + 'static,
{
    let join = tokio::task::spawn_blocking(move || {
        let path = Path::new(&sqlite_path);
        let store = if read_only {
            SqliteStore::open_read_only(path)
        } else {
            SqliteStore::open(path)
        }
        .with_context(|| format!("failed opening sqlite: {}", sqlite_path))?;
        action(store)
    })
    .await
    .map_err(|error| ApiError::internal(format!("sqlite task failed: {error}")))?;

    join.map_err(ApiError::from_anyhow)
}
