mod config;
mod graphql;
mod session;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_graphql::http::GraphiQLSource;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use learning_progress_store_sqlite::{is_write_conflict, SchemaStatus, SqliteProgressStore};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use crate::config::{Args, ServiceConfig};
use crate::graphql::{build_schema, ProgressSchema};
use crate::session::RequestSession;

#[derive(Clone)]
struct ServiceState {
    config: Arc<ServiceConfig>,
    schema: ProgressSchema,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
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
struct BannerResponse {
    project: String,
    version: &'static str,
    status: &'static str,
    graphql_path: String,
    playground_path: Option<String>,
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
    checks: SchemaStatus,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    commit_total: AtomicU64,
    rollback_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    write_conflict_total: AtomicU64,
    schema_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    commit_total: u64,
    rollback_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    write_conflict_total: u64,
    schema_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn new(config: ServiceConfig) -> Self {
        Self {
            config: Arc::new(config),
            schema: build_schema(),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

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

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json");
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.config.operation_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Runs a blocking store call outside any request session.
    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> anyhow::Result<T> + Send + 'static,
    {
        let database_path = self.config.database_path.clone();
        let handle = tokio::task::spawn_blocking(move || op(database_path));
        let join_result = tokio::time::timeout(self.config.operation_timeout, handle)
            .await
            .map_err(|_| {
                Self::failure(
                    default_status,
                    default_code,
                    format!("{operation_label} timed out after {} ms", self.timeout_ms()),
                    Some(json!({ "timeout_ms": self.timeout_ms() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        op_result.map_err(|err| {
            if is_write_conflict(&err) {
                Self::failure(StatusCode::CONFLICT, "write_conflict", format!("{err:#}"), None)
            } else {
                Self::failure(default_status, default_code, format!("{err:#}"), None)
            }
        })
    }

    async fn open_session(&self) -> Result<RequestSession, ServiceFailure> {
        let timeout = self.config.operation_timeout;
        let unit = self
            .run_blocking(
                StatusCode::SERVICE_UNAVAILABLE,
                "schema_unavailable",
                "open_session",
                |database_path| SqliteProgressStore::open(&database_path)?.begin(),
            )
            .await?;
        Ok(RequestSession::new(unit, timeout))
    }
}

impl ServiceTelemetry {
    fn record_success(&self) {
        self.requests_success_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one failed request under exactly one per-code counter.
    fn record_failure(&self, code: &str) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        let counter = match code {
            "timeout" => &self.timeout_total,
            "invalid_json" => &self.invalid_json_total,
            "validation_error" => &self.validation_error_total,
            "write_conflict" => &self.write_conflict_total,
            "schema_unavailable" => &self.schema_unavailable_total,
            "internal_error" => &self.internal_error_total,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_finish(&self, committed: bool) {
        if committed {
            self.commit_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rollback_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            commit_total: self.commit_total.load(Ordering::Relaxed),
            rollback_total: self.rollback_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            write_conflict_total: self.write_conflict_total.load(Ordering::Relaxed),
            schema_unavailable_total: self.schema_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn app(state: ServiceState) -> Router {
    let graphql_path = state.config.graphql_path.clone();
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route(&graphql_path, post(graphql_execute).get(graphql_playground))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn migrate_database(database_path: &std::path::Path) -> Result<SchemaStatus> {
    let store = SqliteProgressStore::open(database_path)?;
    store.migrate()?;
    store.schema_status()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = ServiceConfig::try_from(Args::parse())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.default_log_directive())),
        )
        .init();

    let database_path = config.database_path.clone();
    let schema_status =
        tokio::task::spawn_blocking(move || migrate_database(&database_path)).await??;
    tracing::info!(
        database = %config.database_path.display(),
        schema_version = ?schema_status.current_version,
        "database ready"
    );

    let bind = config.bind;
    tracing::info!(
        project = config.project_name.as_str(),
        %bind,
        graphql_path = config.graphql_path.as_str(),
        playground = config.graphql_playground,
        "starting learning progress service"
    );

    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app(ServiceState::new(config)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn banner(State(state): State<ServiceState>) -> Json<BannerResponse> {
    Json(BannerResponse {
        project: state.config.project_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        status: "ok",
        graphql_path: state.config.graphql_path.clone(),
        playground_path: state
            .config
            .graphql_playground
            .then(|| state.config.graphql_path.clone()),
    })
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timeout_ms: state.timeout_ms(),
        telemetry: state.telemetry.snapshot(),
    })
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ReadinessResponse>, ServiceFailure> {
    let schema_status = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "schema_unavailable",
            "schema_status",
            |database_path| SqliteProgressStore::open(&database_path)?.schema_status(),
        )
        .await?;

    if schema_status.ready {
        return Ok(Json(ReadinessResponse {
            status: "ready",
            checks: schema_status,
        }));
    }

    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "schema_unavailable",
        "database schema is not ready; restart the service to migrate",
        Some(json!({
            "current_version": schema_status.current_version,
            "target_version": schema_status.target_version,
        })),
    ))
}

async fn graphql_playground(
    State(state): State<ServiceState>,
) -> Result<Html<String>, ServiceFailure> {
    if !state.config.graphql_playground {
        return Err(ServiceState::failure(
            StatusCode::NOT_FOUND,
            "not_found",
            "GraphQL playground is disabled",
            None,
        ));
    }

    Ok(Html(
        GraphiQLSource::build()
            .endpoint(&state.config.graphql_path)
            .finish(),
    ))
}

/// Executes one GraphQL request inside a single unit of work. The unit commits
/// only when the response carries no errors.
async fn graphql_execute(
    State(state): State<ServiceState>,
    payload: Result<Json<async_graphql::Request>, JsonRejection>,
) -> Result<Json<async_graphql::Response>, ServiceFailure> {
    state.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;

    let session = state.open_session().await.map_err(|failure| {
        state.telemetry.record_failure(failure.code);
        failure
    })?;

    let response = state.schema.execute(request.data(session.clone())).await;
    let commit = response.is_ok();

    if let Err(err) = session.finish(commit).await {
        tracing::error!(error = %format!("{err:#}"), commit, "failed to finish request session");
        state.telemetry.record_failure("internal_error");
        return Err(ServiceState::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("{err:#}"),
            None,
        ));
    }
    state.telemetry.record_finish(commit);

    if commit {
        state.telemetry.record_success();
        tracing::debug!("graphql request committed");
    } else {
        let code = first_error_code(&response).unwrap_or("graphql_error");
        state.telemetry.record_failure(code);
        tracing::debug!(code, errors = response.errors.len(), "graphql request rolled back");
    }

    Ok(Json(response))
}

fn first_error_code(response: &async_graphql::Response) -> Option<&'static str> {
    let error = serde_json::to_value(response.errors.first()?).ok()?;
    match error.get("extensions")?.get("code")?.as_str()? {
        "validation_error" => Some("validation_error"),
        "write_conflict" => Some("write_conflict"),
        "timeout" => Some("timeout"),
        "internal_error" => Some("internal_error"),
        _ => None,
    }
}
