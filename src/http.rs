//! HTTP surface. One state struct carries the services; one mapping function
//! renders every `LexamError` as `{"error": {"type", "code", "message"}}`.
//!
//! Auth is bearer-token against the configured API keys. The webhook route is
//! gated by a shared secret header instead; signature verification proper is
//! the processor's responsibility upstream of this service.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::billing::{BillingService, ReconcileOutcome, RefundReceipt};
use crate::config::{ApiKeyConfig, PackConfig};
use crate::error::LexamError;
use crate::exam::ExamType;
use crate::limits::{ActionLimitsConfig, RateLimiter, current_minute};
use crate::observability::{Observability, ObservabilitySnapshot};
#[cfg(feature = "store-redis")]
use crate::redis_store::RedisLimitStore;
use crate::session::{ExamService, StartedExam, SubmitResult};
use crate::sqlite_store::SqliteStore;
use crate::store_types::{AuditLogRecord, ContentItemRecord, LedgerEntry};

#[derive(Clone)]
pub struct AppState {
    exams: ExamService,
    billing: BillingService,
    store: SqliteStore,
    api_keys: Arc<Vec<ApiKeyConfig>>,
    webhook_secret: Arc<String>,
    limits: ActionLimitsConfig,
    limiter: Arc<Mutex<RateLimiter>>,
    #[cfg(feature = "store-redis")]
    redis_limits: Option<RedisLimitStore>,
    observability: Arc<Mutex<Observability>>,
}

impl AppState {
    pub fn new(exams: ExamService, billing: BillingService) -> Self {
        let store = exams.store().clone();
        Self {
            exams,
            billing,
            store,
            api_keys: Arc::new(Vec::new()),
            webhook_secret: Arc::new(String::new()),
            limits: ActionLimitsConfig::default(),
            limiter: Arc::new(Mutex::new(RateLimiter::default())),
            #[cfg(feature = "store-redis")]
            redis_limits: None,
            observability: Arc::new(Mutex::new(Observability::default())),
        }
    }

    pub fn with_api_keys(mut self, keys: Vec<ApiKeyConfig>) -> Self {
        self.api_keys = Arc::new(keys);
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Arc::new(secret.into());
        self
    }

    pub fn with_limits(mut self, limits: ActionLimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    #[cfg(feature = "store-redis")]
    pub fn with_redis_limits(mut self, store: RedisLimitStore) -> Self {
        self.redis_limits = Some(store);
        self
    }

    fn api_key(&self, token: &str) -> Option<&ApiKeyConfig> {
        self.api_keys
            .iter()
            .find(|key| key.enabled && key.token == token)
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    r#type: &'static str,
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(
    status: StatusCode,
    r#type: &'static str,
    code: &'static str,
    message: impl Into<String>,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                r#type,
                code,
                message: message.into(),
            },
        }),
    )
}

fn map_error(err: LexamError) -> ApiError {
    let message = err.to_string();
    match err {
        LexamError::Unauthorized => error_response(
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "unauthorized",
            message,
        ),
        LexamError::Forbidden { .. } => error_response(
            StatusCode::FORBIDDEN,
            "permission_error",
            "forbidden",
            message,
        ),
        LexamError::InsufficientFunds { .. } => error_response(
            StatusCode::PAYMENT_REQUIRED,
            "billing_error",
            "insufficient_funds",
            message,
        ),
        LexamError::ContentUnavailable { .. } => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "availability_error",
            "content_unavailable",
            message,
        ),
        LexamError::NotFound { .. } => error_response(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            "not_found",
            message,
        ),
        LexamError::AlreadySubmitted => error_response(
            StatusCode::CONFLICT,
            "conflict_error",
            "already_submitted",
            message,
        ),
        LexamError::AlreadyRefunded => error_response(
            StatusCode::CONFLICT,
            "conflict_error",
            "already_refunded",
            message,
        ),
        LexamError::InvalidState { .. } => error_response(
            StatusCode::CONFLICT,
            "conflict_error",
            "invalid_state",
            message,
        ),
        LexamError::RateLimited { .. } => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            "rate_limited",
            message,
        ),
        LexamError::InvalidRequest { .. } => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "invalid_request",
            message,
        ),
        LexamError::ExternalService { .. } => error_response(
            StatusCode::BAD_GATEWAY,
            "api_error",
            "external_service_error",
            message,
        ),
        LexamError::Internal { .. } | LexamError::Store(_) => {
            tracing::error!(error = %message, "internal error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                "internal_error",
                "internal error",
            )
        }
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("authorization")?.to_str().ok()?;
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

/// Resolves the caller's key and enforces the account-disable gate on every
/// authenticated operation.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<ApiKeyConfig, ApiError> {
    let token =
        extract_bearer(headers).ok_or_else(|| map_error(LexamError::Unauthorized))?;
    let key = state
        .api_key(&token)
        .cloned()
        .ok_or_else(|| map_error(LexamError::Unauthorized))?;

    let user = state
        .store
        .get_user(&key.user_id)
        .await
        .map_err(|err| map_error(err.into()))?;
    if user.map(|user| user.disabled).unwrap_or(false) {
        return Err(map_error(LexamError::Forbidden {
            reason: "account disabled".to_string(),
        }));
    }
    Ok(key)
}

async fn authenticate_admin(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<ApiKeyConfig, ApiError> {
    let key = authenticate(state, headers).await?;
    if !key.admin {
        return Err(map_error(LexamError::Forbidden {
            reason: "admin privilege required".to_string(),
        }));
    }
    Ok(key)
}

async fn check_rate_limit(state: &AppState, user_id: &str, action: &str) -> Result<(), ApiError> {
    let per_minute = state.limits.for_action(action);
    let minute = current_minute();

    #[cfg(feature = "store-redis")]
    if let Some(redis) = state.redis_limits.as_ref() {
        return match redis
            .check_and_consume(user_id, action, per_minute, minute)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                if matches!(err, LexamError::RateLimited { .. }) {
                    state.observability.lock().await.record_rate_limited();
                }
                Err(map_error(err))
            }
        };
    }

    let result = state
        .limiter
        .lock()
        .await
        .check_and_consume(user_id, action, per_minute, minute);
    if let Err(err) = result {
        state.observability.lock().await.record_rate_limited();
        return Err(map_error(err));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/exams", post(start_exam))
        .route("/v1/exams/:id", get(get_exam))
        .route("/v1/exams/:id/submit", post(submit_exam))
        .route("/v1/me/balance", get(me_balance))
        .route("/v1/me/ledger", get(me_ledger))
        .route("/v1/billing/packs", get(list_packs))
        .route("/v1/billing/checkout", post(create_checkout))
        .route("/v1/billing/webhook", post(payment_webhook))
        .route("/v1/admin/refunds", post(admin_refund))
        .route("/v1/admin/grants", post(admin_grant))
        .route("/v1/admin/users/:id/disabled", post(admin_set_disabled))
        .route(
            "/v1/admin/content",
            put(admin_upsert_content).get(admin_list_content),
        )
        .route("/v1/admin/content/:id/published", post(admin_set_published))
        .route(
            "/v1/admin/users/:id/balance-audit",
            get(admin_balance_audit),
        )
        .route("/v1/admin/audit-logs", get(admin_audit_logs))
        .route("/v1/admin/stats", get(admin_stats))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ----- exams -----

#[derive(Debug, Deserialize)]
struct StartExamRequest {
    exam_type: ExamType,
}

async fn start_exam(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<StartExamRequest>,
) -> Result<Json<StartedExam>, ApiError> {
    let key = authenticate(&state, &headers).await?;
    check_rate_limit(&state, &key.user_id, "exam_start").await?;

    match state.exams.start(&key.user_id, payload.exam_type).await {
        Ok(started) => {
            state.observability.lock().await.record_exam_started();
            Ok(Json(started))
        }
        Err(err) => {
            let mut observability = state.observability.lock().await;
            match &err {
                LexamError::InsufficientFunds { .. } => observability.record_insufficient_funds(),
                LexamError::ContentUnavailable { .. } => {
                    observability.record_content_compensation()
                }
                _ => {}
            }
            drop(observability);
            Err(map_error(err))
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitExamRequest {
    answers: Value,
}

async fn submit_exam(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<SubmitExamRequest>,
) -> Result<Json<SubmitResult>, ApiError> {
    let key = authenticate(&state, &headers).await?;
    check_rate_limit(&state, &key.user_id, "submit").await?;

    let result = state
        .exams
        .submit(&key.user_id, &session_id, payload.answers)
        .await
        .map_err(map_error)?;

    let mut observability = state.observability.lock().await;
    observability.record_exam_completed();
    if result.is_provisional() {
        observability.record_grading_fallback();
    }
    drop(observability);
    Ok(Json(result))
}

async fn get_exam(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let key = authenticate(&state, &headers).await?;
    let session = state
        .exams
        .view(&key.user_id, &session_id)
        .await
        .map_err(map_error)?;
    let rendered = serde_json::to_value(&session)
        .map_err(|err| map_error(LexamError::Internal {
            message: format!("session serialization failed: {err}"),
        }))?;
    Ok(Json(rendered))
}

// ----- balance -----

#[derive(Debug, Serialize)]
struct BalanceResponse {
    user_id: String,
    credits: i64,
}

async fn me_balance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BalanceResponse>, ApiError> {
    let key = authenticate(&state, &headers).await?;
    let credits = state
        .store
        .balance_of(&key.user_id)
        .await
        .map_err(|err| map_error(err.into()))?;
    Ok(Json(BalanceResponse {
        user_id: key.user_id,
        credits,
    }))
}

#[derive(Debug, Deserialize)]
struct LedgerQuery {
    #[serde(default = "default_ledger_limit")]
    limit: usize,
}

fn default_ledger_limit() -> usize {
    100
}

#[derive(Debug, Serialize)]
struct LedgerResponse {
    entries: Vec<LedgerEntry>,
}

async fn me_ledger(
    State(state): State<AppState>,
    Query(query): Query<LedgerQuery>,
    headers: HeaderMap,
) -> Result<Json<LedgerResponse>, ApiError> {
    let key = authenticate(&state, &headers).await?;
    let entries = state
        .store
        .ledger_entries_for_user(&key.user_id, query.limit.min(1000))
        .await
        .map_err(|err| map_error(err.into()))?;
    Ok(Json(LedgerResponse { entries }))
}

// ----- billing -----

async fn list_packs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<PackConfig>>, ApiError> {
    authenticate(&state, &headers).await?;
    Ok(Json(state.billing.packs().to_vec()))
}

#[derive(Debug, Deserialize)]
struct CheckoutRequest {
    pack_id: String,
}

#[derive(Debug, Serialize)]
struct CheckoutResponse {
    redirect_url: String,
}

async fn create_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let key = authenticate(&state, &headers).await?;
    check_rate_limit(&state, &key.user_id, "checkout").await?;

    let session = state
        .billing
        .checkout(&key.user_id, &payload.pack_id)
        .await
        .map_err(map_error)?;
    Ok(Json(CheckoutResponse {
        redirect_url: session.redirect_url,
    }))
}

/// Webhook deliveries always answer 200 once the secret checks out, whatever
/// the outcome: a non-2xx would make the processor redeliver events that will
/// never apply.
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<Value>,
) -> Result<Json<ReconcileOutcome>, ApiError> {
    let provided = headers
        .get("x-webhook-secret")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if state.webhook_secret.is_empty() || provided != state.webhook_secret.as_str() {
        return Err(map_error(LexamError::Unauthorized));
    }

    let outcome = state.billing.reconcile(&event).await.map_err(map_error)?;
    let mut observability = state.observability.lock().await;
    match &outcome {
        ReconcileOutcome::Applied { .. } => observability.record_purchase_applied(),
        ReconcileOutcome::Replayed => observability.record_purchase_replay(),
        ReconcileOutcome::Ignored { .. } => {}
    }
    drop(observability);
    Ok(Json(outcome))
}

// ----- admin -----

#[derive(Debug, Deserialize)]
struct RefundRequest {
    entry_id: i64,
}

async fn admin_refund(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RefundRequest>,
) -> Result<Json<RefundReceipt>, ApiError> {
    let key = authenticate_admin(&state, &headers).await?;
    let receipt = state
        .billing
        .refund(&key.user_id, payload.entry_id)
        .await
        .map_err(map_error)?;
    state.observability.lock().await.record_refund();
    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
struct GrantRequest {
    user_id: String,
    credits: i64,
    #[serde(default)]
    reason: String,
}

async fn admin_grant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<GrantRequest>,
) -> Result<Json<LedgerEntry>, ApiError> {
    let key = authenticate_admin(&state, &headers).await?;
    let entry = state
        .billing
        .grant(&key.user_id, &payload.user_id, payload.credits, &payload.reason)
        .await
        .map_err(map_error)?;
    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
struct SetDisabledRequest {
    disabled: bool,
}

#[derive(Debug, Serialize)]
struct SetDisabledResponse {
    user_id: String,
    disabled: bool,
}

async fn admin_set_disabled(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<SetDisabledRequest>,
) -> Result<Json<SetDisabledResponse>, ApiError> {
    authenticate_admin(&state, &headers).await?;
    let changed = state
        .store
        .set_user_disabled(&user_id, payload.disabled)
        .await
        .map_err(|err| map_error(err.into()))?;
    if !changed {
        return Err(map_error(LexamError::NotFound { what: "user" }));
    }
    Ok(Json(SetDisabledResponse {
        user_id,
        disabled: payload.disabled,
    }))
}

#[derive(Debug, Deserialize)]
struct UpsertContentRequest {
    id: String,
    exam_type: ExamType,
    #[serde(default)]
    part: u8,
    #[serde(default)]
    published: bool,
    payload: Value,
}

#[derive(Debug, Serialize)]
struct UpsertContentResponse {
    id: String,
}

async fn admin_upsert_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UpsertContentRequest>,
) -> Result<Json<UpsertContentResponse>, ApiError> {
    authenticate_admin(&state, &headers).await?;
    if payload.part > 3 {
        return Err(map_error(LexamError::InvalidRequest {
            reason: "part must be 0-3".to_string(),
        }));
    }
    state
        .store
        .upsert_content_item(
            &payload.id,
            payload.exam_type,
            payload.part,
            payload.published,
            payload.payload,
        )
        .await
        .map_err(|err| map_error(err.into()))?;
    Ok(Json(UpsertContentResponse { id: payload.id }))
}

#[derive(Debug, Deserialize)]
struct SetPublishedRequest {
    published: bool,
}

async fn admin_set_published(
    State(state): State<AppState>,
    Path(content_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<SetPublishedRequest>,
) -> Result<Json<UpsertContentResponse>, ApiError> {
    authenticate_admin(&state, &headers).await?;
    let changed = state
        .store
        .set_content_published(&content_id, payload.published)
        .await
        .map_err(|err| map_error(err.into()))?;
    if !changed {
        return Err(map_error(LexamError::NotFound { what: "content item" }));
    }
    Ok(Json(UpsertContentResponse { id: content_id }))
}

#[derive(Debug, Deserialize)]
struct ContentQuery {
    #[serde(default)]
    exam_type: Option<ExamType>,
}

async fn admin_list_content(
    State(state): State<AppState>,
    Query(query): Query<ContentQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<ContentItemRecord>>, ApiError> {
    authenticate_admin(&state, &headers).await?;
    let items = state
        .store
        .list_content(query.exam_type)
        .await
        .map_err(|err| map_error(err.into()))?;
    Ok(Json(items))
}

#[derive(Debug, Serialize)]
struct BalanceAuditResponse {
    user_id: String,
    cached: i64,
    recomputed: i64,
    consistent: bool,
}

async fn admin_balance_audit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<BalanceAuditResponse>, ApiError> {
    authenticate_admin(&state, &headers).await?;
    let cached = state
        .store
        .balance_of(&user_id)
        .await
        .map_err(|err| map_error(err.into()))?;
    let recomputed = state
        .store
        .recompute_balance(&user_id)
        .await
        .map_err(|err| map_error(err.into()))?;
    Ok(Json(BalanceAuditResponse {
        user_id,
        cached,
        recomputed,
        consistent: cached == recomputed,
    }))
}

#[derive(Debug, Deserialize)]
struct AuditLogQuery {
    #[serde(default = "default_ledger_limit")]
    limit: usize,
    #[serde(default)]
    since_ts_ms: Option<u64>,
}

async fn admin_audit_logs(
    State(state): State<AppState>,
    Query(query): Query<AuditLogQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<AuditLogRecord>>, ApiError> {
    authenticate_admin(&state, &headers).await?;
    let logs = state
        .store
        .list_audit_logs(query.limit.min(1000), query.since_ts_ms)
        .await
        .map_err(|err| map_error(err.into()))?;
    Ok(Json(logs))
}

async fn admin_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ObservabilitySnapshot>, ApiError> {
    authenticate_admin(&state, &headers).await?;
    let snapshot = state.observability.lock().await.snapshot();
    Ok(Json(snapshot))
}
