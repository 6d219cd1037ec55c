use crate::error::GatewayError;
use crate::AppState;
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap},
    Json,
};
use consent_engine::metrics::METRICS;
use consent_engine::{
    ConsentEvent, ConsentStatus, CreatedConsent, ProductConsentRequest, WaitOutcome,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const BANK_CODE_HEADER: &str = "x-bank-code";
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub db_connected: bool,
    pub live_subscribers: usize,
    pub pending_waiters: usize,
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct WaitResponse {
    pub status: &'static str,
    pub consent_id: String,
    pub event: ConsentEvent,
}

/// Authenticated caller. The upstream auth layer forwards the user id in `X-User-Id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerIdentity(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| GatewayError::Unauthorized("missing caller identity".to_string()))?;

        raw.trim()
            .parse::<i64>()
            .map(CallerIdentity)
            .map_err(|_| GatewayError::Unauthorized("invalid caller identity".to_string()))
    }
}

fn bank_code(headers: &HeaderMap) -> Result<String, GatewayError> {
    headers
        .get(BANK_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("X-Bank-Code header required".to_string()))
}

// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_connected = sqlx::query("SELECT 1")
        .fetch_optional(state.db.pool())
        .await
        .is_ok();

    Json(HealthResponse {
        status: if db_connected { "healthy" } else { "degraded" },
        service: "consent-gateway",
        version: env!("CARGO_PKG_VERSION"),
        db_connected,
        live_subscribers: state.hub.subscriber_count(),
        pending_waiters: state.hub.waiter_count(),
    })
}

// Prometheus metrics endpoint
pub async fn metrics_handler() -> Result<String, GatewayError> {
    METRICS
        .export()
        .map_err(|e| GatewayError::Internal(format!("Failed to export metrics: {}", e)))
}

pub async fn create_account_consent(
    State(state): State<AppState>,
    CallerIdentity(user_id): CallerIdentity,
    headers: HeaderMap,
) -> Result<Json<CreatedConsent>, GatewayError> {
    let bank = bank_code(&headers)?;
    info!("Account consent requested by user {} at {}", user_id, bank);

    let created = state.consents.create_account_consent(user_id, &bank).await?;
    Ok(Json(created))
}

pub async fn create_product_consent(
    State(state): State<AppState>,
    CallerIdentity(user_id): CallerIdentity,
    headers: HeaderMap,
    Json(request): Json<ProductConsentRequest>,
) -> Result<Json<CreatedConsent>, GatewayError> {
    let bank = bank_code(&headers)?;
    info!("Product consent requested by user {} at {}", user_id, bank);

    let created = state
        .consents
        .create_product_consent(user_id, &bank, request)
        .await?;
    Ok(Json(created))
}

/// Block until the consent is approved or the wait times out
pub async fn wait_for_approval(
    State(state): State<AppState>,
    Path(consent_id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<WaitResponse>, GatewayError> {
    let timeout = state.wait.wait_timeout(query.timeout_secs);

    // Registered before the lookup so an approval landing in between is not lost.
    let handle = state.hub.register_wait(consent_id.as_str());
    match state.db.find_consent(&consent_id).await {
        Ok(Some(record)) if record.status == ConsentStatus::Approved => {
            state.hub.cancel_wait(&handle);
            return Ok(Json(WaitResponse {
                status: "approved",
                consent_id: record.consent_id.clone(),
                event: ConsentEvent::approved(&record, None),
            }));
        }
        Ok(_) => {}
        Err(e) => warn!("Stored status lookup for {} failed: {}", consent_id, e),
    }

    match state.hub.wait(handle, timeout).await {
        WaitOutcome::Approved(event) => Ok(Json(WaitResponse {
            status: "approved",
            consent_id: event.current_consent_id().to_string(),
            event,
        })),
        WaitOutcome::TimedOut => {
            warn!("Wait for consent {} timed out after {:?}", consent_id, timeout);
            Err(GatewayError::Timeout(format!(
                "consent {} not approved within {}s",
                consent_id,
                timeout.as_secs()
            )))
        }
    }
}
