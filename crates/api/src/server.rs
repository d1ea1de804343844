use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use orderproof_auditor::{
    anchor::{AnchorCoordinator, AnchorError, Coverage, ProofBundle},
    audit::{AuditError, AuditRecord, AuditRevision, AuditService},
    config::Config,
    kv::KvError,
    orders::{OrderLookup, OrderSource},
    services::Services,
    storage::AnchorRecord,
    verification::{VerificationAssembler, VerificationResponse},
};
use orderproof_core::{validate_order_id, OrderId, TransactionFacts, MAX_ORDER_ID};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    audits: Arc<AuditService>,
    assembler: VerificationAssembler,
    coordinator: Arc<AnchorCoordinator>,
    orders: Option<Arc<dyn OrderSource>>,
    write_enabled: bool,
}

impl AppState {
    /// Build handler state from its collaborators.
    ///
    /// Without an order source `/v1/verify` answers 503.
    pub fn new(
        audits: Arc<AuditService>,
        coordinator: Arc<AnchorCoordinator>,
        orders: Option<Arc<dyn OrderSource>>,
        write_enabled: bool,
    ) -> Self {
        let assembler = VerificationAssembler::new(audits.clone(), Some(coordinator.clone()));
        Self {
            audits,
            assembler,
            coordinator,
            orders,
            write_enabled,
        }
    }

    /// Reuse the object graph built by [`Services`].
    pub fn from_services(services: &Services, write_enabled: bool) -> Self {
        Self {
            audits: services.audits.clone(),
            assembler: services.assembler.clone(),
            coordinator: services.coordinator.clone(),
            orders: services.orders.clone(),
            write_enabled,
        }
    }
}

/// Routes for `state`, with request tracing but no CORS policy.
pub fn router_for_state(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/verify", get(get_verify))
        .route("/v1/proof", get(get_proof))
        .route("/v1/audits", get(get_audits).post(post_audit))
        .route("/v1/audits/:order_id", get(get_audit))
        .route("/v1/audits/:order_id/history", get(get_audit_history))
        .route("/v1/anchors", get(get_anchors).post(post_anchor))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build an in-process API router from configuration.
pub async fn build_app(config: Config) -> anyhow::Result<Router> {
    let cors_permissive = config.api.cors_permissive;
    let write_enabled = config.api.write_enabled;
    let services = Services::from_config(config).await?;
    Ok(with_cors(
        router_for_state(AppState::from_services(&services, write_enabled)),
        cors_permissive,
    ))
}

fn with_cors(router: Router, permissive: bool) -> Router {
    if permissive {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Run the API server until Ctrl+C or SIGTERM.
pub async fn run_with_config(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("Invalid api.bind '{}'", config.api.bind))?;
    let cors_permissive = config.api.cors_permissive;
    let write_enabled = config.api.write_enabled;

    let services = Services::from_config(config).await?;
    if services.orders.is_none() {
        warn!("No orders.url configured; /v1/verify will answer 503");
    }
    let app = with_cors(
        router_for_state(AppState::from_services(&services, write_enabled)),
        cors_permissive,
    );

    info!("OrderProof API server listening on {}", addr);
    if write_enabled {
        info!("Write endpoints enabled (POST /v1/audits, POST /v1/anchors)");
    }
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    services.shutdown.cancel();
    services.storage.close().await;
    info!("OrderProof API server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

async fn health() -> &'static str {
    "OK"
}

const ERROR_CODE_INVALID_REQUEST: &str = "invalid_request";
const ERROR_CODE_WRITES_DISABLED: &str = "writes_disabled";
const ERROR_CODE_ORDER_NOT_FOUND: &str = "order_not_found";
const ERROR_CODE_ORDER_NOT_COMPLETED: &str = "order_not_completed";
const ERROR_CODE_AUDIT_NOT_FOUND: &str = "audit_not_found";
const ERROR_CODE_AUDIT_CONFLICT: &str = "audit_conflict";
const ERROR_CODE_AUDIT_TAMPERED: &str = "audit_tampered";
const ERROR_CODE_NOT_ANCHORED: &str = "not_anchored";
const ERROR_CODE_ANCHOR_DIVERGED: &str = "anchor_diverged";
const ERROR_CODE_ANCHOR_NOT_CONFIRMED: &str = "anchor_not_confirmed";
const ERROR_CODE_STORE_UNAVAILABLE: &str = "store_unavailable";
const ERROR_CODE_LEDGER_UNAVAILABLE: &str = "ledger_unavailable";
const ERROR_CODE_INTERNAL_ERROR: &str = "internal_error";

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorInfo,
}

#[derive(Debug, Serialize)]
struct ErrorInfo {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorInfo {
                code,
                message: message.into(),
                details: None,
            },
        }),
    )
}

fn api_error_details(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
    details: serde_json::Value,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorInfo {
                code,
                message: message.into(),
                details: Some(details),
            },
        }),
    )
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, ERROR_CODE_INVALID_REQUEST, msg)
}

fn forbidden(msg: impl Into<String>) -> ApiError {
    api_error(StatusCode::FORBIDDEN, ERROR_CODE_WRITES_DISABLED, msg)
}

fn not_found(code: &'static str, msg: impl Into<String>) -> ApiError {
    api_error(StatusCode::NOT_FOUND, code, msg)
}

fn conflict(code: &'static str, msg: impl Into<String>) -> ApiError {
    api_error(StatusCode::CONFLICT, code, msg)
}

fn service_unavailable(code: &'static str, msg: impl Into<String>) -> ApiError {
    api_error(StatusCode::SERVICE_UNAVAILABLE, code, msg)
}

fn internal_error<E: std::fmt::Display>(err: E) -> ApiError {
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        ERROR_CODE_INTERNAL_ERROR,
        format!("Internal error: {}", err),
    )
}

/// Store outages must read as "could not determine", never as a verdict.
fn audit_error(err: AuditError) -> ApiError {
    match err {
        err if err.is_unavailable() => {
            warn!("Audit store unavailable: {}", err);
            service_unavailable(ERROR_CODE_STORE_UNAVAILABLE, err.to_string())
        }
        AuditError::Conflict {
            order_id,
            recorded,
            computed,
        } => api_error_details(
            StatusCode::CONFLICT,
            ERROR_CODE_AUDIT_CONFLICT,
            format!("Order {} already has an audit with different facts", order_id),
            serde_json::json!({ "recordedDigest": recorded, "computedDigest": computed }),
        ),
        AuditError::InvalidFacts(err) => bad_request(err.to_string()),
        AuditError::Store(KvError::Tampered { key, .. }) => {
            error!(key = %key, "Audit store entry failed its integrity check");
            conflict(
                ERROR_CODE_AUDIT_TAMPERED,
                format!("Stored audit under {} failed its integrity check", key),
            )
        }
        other => internal_error(other),
    }
}

fn anchor_error(err: AnchorError) -> ApiError {
    match err {
        AnchorError::Audit(err) => audit_error(err),
        AnchorError::AnchorRootDiverged { .. } => {
            error!("{}", err);
            conflict(ERROR_CODE_ANCHOR_DIVERGED, err.to_string())
        }
        AnchorError::AnchorNotConfirmed { .. } => {
            error!("{}", err);
            conflict(ERROR_CODE_ANCHOR_NOT_CONFIRMED, err.to_string())
        }
        AnchorError::AnchorSubmissionFailed { .. } | AnchorError::Ledger(_) => {
            service_unavailable(ERROR_CODE_LEDGER_UNAVAILABLE, err.to_string())
        }
        AnchorError::Cancelled => service_unavailable(ERROR_CODE_INTERNAL_ERROR, err.to_string()),
        AnchorError::Storage(err) => internal_error(format!("{:#}", err)),
    }
}

fn parse_order_id(raw: &str) -> Result<OrderId, ApiError> {
    match raw.trim().parse::<OrderId>() {
        Ok(id) if validate_order_id(id).is_ok() => Ok(id),
        _ => Err(bad_request(format!(
            "Invalid orderId (expected an integer from 1 to {})",
            MAX_ORDER_ID
        ))),
    }
}

fn require_writes(state: &AppState) -> Result<(), ApiError> {
    if state.write_enabled {
        Ok(())
    } else {
        Err(forbidden("Writes are disabled on this server"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderQuery {
    order_id: Option<String>,
}

impl OrderQuery {
    fn order_id(&self) -> Result<OrderId, ApiError> {
        let raw = self
            .order_id
            .as_deref()
            .ok_or_else(|| bad_request("Missing orderId"))?;
        parse_order_id(raw)
    }
}

async fn get_verify(
    State(state): State<AppState>,
    Query(query): Query<OrderQuery>,
) -> Result<Json<VerificationResponse>, ApiError> {
    let order_id = query.order_id()?;

    let orders = state.orders.as_ref().ok_or_else(|| {
        service_unavailable(
            ERROR_CODE_STORE_UNAVAILABLE,
            "Order database is not configured",
        )
    })?;

    let facts = match orders.lookup(order_id).await {
        Ok(OrderLookup::Completed(facts)) => facts,
        Ok(OrderLookup::Missing) => {
            return Err(not_found(
                ERROR_CODE_ORDER_NOT_FOUND,
                format!("Order {} not found", order_id),
            ))
        }
        Ok(OrderLookup::NotCompleted { status }) => {
            return Err(conflict(
                ERROR_CODE_ORDER_NOT_COMPLETED,
                format!("Order {} is not completed (status: {})", order_id, status),
            ))
        }
        Err(err) => {
            warn!(order_id, "Order lookup failed: {:#}", err);
            return Err(service_unavailable(
                ERROR_CODE_STORE_UNAVAILABLE,
                "Order database unavailable",
            ));
        }
    };

    let response = state
        .assembler
        .assemble(order_id, &facts)
        .await
        .map_err(audit_error)?;
    Ok(Json(response))
}

async fn get_proof(
    State(state): State<AppState>,
    Query(query): Query<OrderQuery>,
) -> Result<Json<ProofBundle>, ApiError> {
    let order_id = query.order_id()?;

    let record = state
        .audits
        .get(order_id)
        .await
        .map_err(audit_error)?
        .ok_or_else(|| {
            not_found(
                ERROR_CODE_AUDIT_NOT_FOUND,
                format!("No audit recorded for order {}", order_id),
            )
        })?;

    match state
        .coordinator
        .get_verification(order_id, &record.digest)
        .await
        .map_err(anchor_error)?
    {
        Coverage::Anchored(bundle) => Ok(Json(bundle)),
        Coverage::NotAnchored => Err(not_found(
            ERROR_CODE_NOT_ANCHORED,
            format!("Order {} is not covered by a confirmed anchor yet", order_id),
        )),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordResponse {
    order_id: OrderId,
    digest: String,
    created: bool,
}

async fn post_audit(
    State(state): State<AppState>,
    Json(facts): Json<TransactionFacts>,
) -> Result<(StatusCode, Json<RecordResponse>), ApiError> {
    require_writes(&state)?;
    facts
        .validate()
        .map_err(|e| bad_request(format!("Invalid order facts: {}", e)))?;

    let recorded = state.audits.record(&facts).await.map_err(audit_error)?;
    let status = if recorded.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        Json(RecordResponse {
            order_id: facts.order_id,
            digest: recorded.digest,
            created: recorded.created,
        }),
    ))
}

async fn get_audits(State(state): State<AppState>) -> Result<Json<Vec<AuditRecord>>, ApiError> {
    Ok(Json(state.audits.list_all().await.map_err(audit_error)?))
}

async fn get_audit(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<AuditRecord>, ApiError> {
    let order_id = parse_order_id(&order_id)?;
    state
        .audits
        .verified_get(order_id)
        .await
        .map_err(audit_error)?
        .map(Json)
        .ok_or_else(|| {
            not_found(
                ERROR_CODE_AUDIT_NOT_FOUND,
                format!("No audit recorded for order {}", order_id),
            )
        })
}

async fn get_audit_history(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<Vec<AuditRevision>>, ApiError> {
    let order_id = parse_order_id(&order_id)?;
    let history = state.audits.history(order_id).await.map_err(audit_error)?;
    if history.is_empty() {
        return Err(not_found(
            ERROR_CODE_AUDIT_NOT_FOUND,
            format!("No audit recorded for order {}", order_id),
        ));
    }
    Ok(Json(history))
}

async fn get_anchors(State(state): State<AppState>) -> Result<Json<Vec<AnchorRecord>>, ApiError> {
    Ok(Json(
        state.coordinator.list_anchors().await.map_err(anchor_error)?,
    ))
}

#[derive(Debug, Serialize)]
struct AnchorAttemptResponse {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    anchor: Option<AnchorRecord>,
}

async fn post_anchor(
    State(state): State<AppState>,
) -> Result<Json<AnchorAttemptResponse>, ApiError> {
    require_writes(&state)?;

    let outcome = state
        .coordinator
        .anchor_current_state()
        .await
        .map_err(anchor_error)?;
    info!("Anchor requested over HTTP: {}", outcome.label());

    Ok(Json(AnchorAttemptResponse {
        outcome: outcome.label(),
        anchor: outcome.anchor().cloned(),
    }))
}
