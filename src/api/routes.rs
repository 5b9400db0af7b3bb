use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::ConfigHandle;
use crate::game::Direction;
use crate::gateway::PaymentGateway;
use crate::ledger::LedgerDb;
use crate::manager::{ManagerError, SessionManager};
use crate::models::{BetSource, Difficulty, Item, Loadout};
use crate::settlement::{SettlementCoordinator, SettlementError};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub coordinator: Arc<SettlementCoordinator>,
    pub ledger: Arc<LedgerDb>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub config: Arc<ConfigHandle>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/config", get(get_config))
        .route("/api/accounts", post(create_account))
        .route("/api/accounts/:id", get(get_account))
        .route("/api/accounts/:id/transactions", get(get_transactions))
        .route("/api/sessions", post(start_session))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/direction", post(set_direction))
        .route("/api/sessions/:id/cashout", post(cash_out))
        .route("/api/sessions/:id/revive", post(revive))
        .route("/api/sessions/:id/forfeit", post(forfeit))
        .route("/api/sessions/:id/cancel", post(cancel))
        .route("/api/deposits", post(create_deposit))
        .route("/api/deposits/:tx_id/status", get(deposit_status))
        .route("/api/deposits/:tx_id/confirm", post(confirm_deposit))
        .route("/api/withdrawals", post(request_withdrawal))
        .route("/api/webhooks/deposit", post(deposit_webhook))
        .route("/api/webhooks/withdrawal", post(withdrawal_webhook))
        .route("/api/store/items", post(buy_item))
        .route("/api/store/mystery-box", post(open_mystery_box))
        .route("/api/affiliate/:id", get(affiliate_summary))
        .route("/api/affiliate/:id/claim", post(claim_affiliate))
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.manager.active_sessions(),
    })
}

/// Current configuration snapshot (prices and minimums).
async fn get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cfg = state.config.current();
    Json(json!({
        "version": cfg.version,
        "min_deposit": cfg.min_deposit,
        "min_withdrawal": cfg.min_withdrawal,
        "min_bet": cfg.min_bet,
        "mystery_box_price": cfg.mystery_box_price,
        "item_prices": cfg.item_prices
            .iter()
            .map(|(item, price)| (item.as_str().to_string(), *price))
            .collect::<std::collections::HashMap<_, _>>(),
    }))
}

async fn create_account(
    State(state): State<AppState>,
    Json(req): Json<CreateAccountRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account = state
        .ledger
        .get_or_create_account(&req.username)
        .await
        .map_err(SettlementError::from)?;
    if let Some(referrer_id) = req.referrer_id {
        state
            .ledger
            .set_referrer(account.id, referrer_id)
            .await
            .map_err(SettlementError::from)?;
    }
    Ok(Json(json!(account)))
}

async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account = state
        .ledger
        .get_account(id)
        .await
        .map_err(SettlementError::from)?;
    Ok(Json(json!(account)))
}

async fn get_transactions(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state
        .ledger
        .transactions_for_account(id, 50)
        .await
        .map_err(SettlementError::from)?;
    Ok(Json(json!({ "count": records.len(), "transactions": records })))
}

async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let view = state
        .manager
        .start_session(
            req.account_id,
            req.bet,
            req.source,
            req.difficulty,
            req.loadout.unwrap_or_default(),
        )
        .await?;
    Ok(Json(json!(view)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let view = state.manager.view(id).await?;
    Ok(Json(json!(view)))
}

async fn set_direction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<DirectionRequest>,
) -> Result<StatusCode, ApiError> {
    state.manager.set_direction(id, req.direction).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cash_out(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (payout, balance) = state.manager.cash_out(id).await?;
    Ok(Json(json!({ "payout": payout, "balance": balance })))
}

async fn revive(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let view = state.manager.revive(id).await?;
    Ok(Json(json!(view)))
}

async fn forfeit(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.manager.forfeit(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.manager.cancel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_deposit(
    State(state): State<AppState>,
    Json(req): Json<CreateDepositRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let charge = state
        .coordinator
        .create_deposit(req.account_id, req.amount, &req.payer_tax_id)
        .await?;
    Ok(Json(json!(charge)))
}

/// Poll the provider for the normalized transaction status.
async fn deposit_status(
    State(state): State<AppState>,
    Path(tx_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tx = state
        .gateway
        .query_transaction(&tx_id)
        .await
        .map_err(SettlementError::Gateway)?;
    Ok(Json(json!({ "transaction_id": tx.transaction_id, "status": tx.status })))
}

/// Confirm a deposit. The body carries no amount; it is re-derived from
/// the provider.
async fn confirm_deposit(
    State(state): State<AppState>,
    Path(tx_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.coordinator.confirm_deposit(&tx_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn request_withdrawal(
    State(state): State<AppState>,
    Json(req): Json<WithdrawalRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tx_id = state
        .coordinator
        .request_withdrawal(req.account_id, req.amount, &req.payout_key, &req.key_type)
        .await?;
    Ok(Json(json!({ "transaction_id": tx_id, "status": "PENDING" })))
}

/// Provider-pushed deposit callback. Only the transaction id is taken from
/// the payload; everything else is re-verified against the provider.
async fn deposit_webhook(
    State(state): State<AppState>,
    Json(payload): Json<WebhookPayload>,
) -> Result<StatusCode, ApiError> {
    state.coordinator.deposit_webhook(&payload.transaction_id).await?;
    Ok(StatusCode::OK)
}

async fn withdrawal_webhook(
    State(state): State<AppState>,
    Json(payload): Json<WebhookPayload>,
) -> Result<StatusCode, ApiError> {
    state
        .coordinator
        .withdrawal_webhook(&payload.transaction_id)
        .await?;
    Ok(StatusCode::OK)
}

async fn buy_item(
    State(state): State<AppState>,
    Json(req): Json<BuyItemRequest>,
) -> Result<StatusCode, ApiError> {
    state.coordinator.buy_item(req.account_id, req.item).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn open_mystery_box(
    State(state): State<AppState>,
    Json(req): Json<AccountRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let prize = state.coordinator.open_mystery_box(req.account_id).await?;
    Ok(Json(json!({ "prize": prize })))
}

async fn affiliate_summary(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account = state
        .ledger
        .get_account(id)
        .await
        .map_err(SettlementError::from)?;
    Ok(Json(json!({
        "cpa_accrued": account.affiliate_cpa_accrued,
        "revshare_accrued": account.affiliate_revshare_accrued,
        "total": account.affiliate_cpa_accrued + account.affiliate_revshare_accrued,
    })))
}

async fn claim_affiliate(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claimed = state.coordinator.claim_affiliate_earnings(id).await?;
    Ok(Json(json!({ "claimed": claimed })))
}

// ===== Request/Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    active_sessions: usize,
}

#[derive(Deserialize)]
struct CreateAccountRequest {
    username: String,
    referrer_id: Option<i64>,
}

#[derive(Deserialize)]
struct StartSessionRequest {
    account_id: i64,
    bet: f64,
    source: BetSource,
    difficulty: Difficulty,
    loadout: Option<Loadout>,
}

#[derive(Deserialize)]
struct DirectionRequest {
    direction: Direction,
}

#[derive(Deserialize)]
struct CreateDepositRequest {
    account_id: i64,
    amount: f64,
    payer_tax_id: String,
}

#[derive(Deserialize)]
struct WithdrawalRequest {
    account_id: i64,
    amount: f64,
    payout_key: String,
    key_type: String,
}

#[derive(Deserialize)]
struct WebhookPayload {
    #[serde(alias = "id")]
    transaction_id: String,
}

#[derive(Deserialize)]
struct BuyItemRequest {
    account_id: i64,
    item: Item,
}

#[derive(Deserialize)]
struct AccountRequest {
    account_id: i64,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Manager(ManagerError),
    Settlement(SettlementError),
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        ApiError::Manager(err)
    }
}

impl From<SettlementError> for ApiError {
    fn from(err: SettlementError) -> Self {
        ApiError::Settlement(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Short, specific message for user errors; full detail stays in the
        // log and a generic retry-safe message goes out for internal ones.
        let (status, message) = match &self {
            ApiError::Manager(ManagerError::SessionNotFound) => {
                (StatusCode::NOT_FOUND, "session not found".to_string())
            }
            ApiError::Manager(ManagerError::InvalidLoadout) => {
                (StatusCode::BAD_REQUEST, "equipped item not in inventory".to_string())
            }
            ApiError::Manager(ManagerError::Session(err)) => {
                (StatusCode::CONFLICT, err.to_string())
            }
            ApiError::Manager(ManagerError::Settlement(err)) | ApiError::Settlement(err) => {
                settlement_response(err)
            }
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

fn settlement_response(err: &SettlementError) -> (StatusCode, String) {
    match err {
        SettlementError::InsufficientFunds => {
            (StatusCode::PAYMENT_REQUIRED, "insufficient balance".to_string())
        }
        SettlementError::BelowMinimum { .. } => (StatusCode::BAD_REQUEST, err.to_string()),
        SettlementError::NotPaid => {
            (StatusCode::CONFLICT, "transaction is not paid".to_string())
        }
        SettlementError::UnknownTransaction => {
            (StatusCode::NOT_FOUND, "unknown transaction".to_string())
        }
        SettlementError::NoItem(item) => {
            (StatusCode::BAD_REQUEST, format!("no {} item available", item))
        }
        SettlementError::Ledger(inner) => {
            tracing::error!("Ledger error: {}", inner);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error, try again".to_string())
        }
        SettlementError::Gateway(inner) => {
            tracing::error!("Gateway error: {}", inner);
            (StatusCode::BAD_GATEWAY, "payment provider unavailable, try again".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funds_errors_map_to_payment_required() {
        let (status, message) = settlement_response(&SettlementError::InsufficientFunds);
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(message, "insufficient balance");
    }

    #[test]
    fn gateway_errors_hide_detail() {
        let err = SettlementError::Gateway(anyhow::anyhow!("connection reset by peer"));
        let (status, message) = settlement_response(&err);
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(!message.contains("connection reset"));
    }
}
