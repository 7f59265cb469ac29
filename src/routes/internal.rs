//! Routes for the bot processes, authenticated with the RPC signature.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use validator::Validate;

use crate::error::{ApiError, Result};
use crate::integrations::amocrm::{PremiumLookup, PremiumResult};
use crate::rpc::{auth, RpcRequest, RpcResponse};
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyOrder {
    #[validate(length(min = 1, max = 64))]
    pub order_code: String,
    pub tg_id: i64,
}

fn authenticate(s: &AppState, headers: &HeaderMap) -> Result<()> {
    auth::verify(&s.config.bots.rpc_token, headers, Utc::now().timestamp()).map_err(|e| {
        warn!(error = %e, "rejected bot request");
        ApiError::from(e)
    })
}

fn parse<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {}", e)))
}

pub async fn rpc(State(s): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<RpcResponse>> {
    authenticate(&s, &headers)?;
    let request: RpcRequest = parse(&body)?;
    Ok(Json(s.rpc.dispatch(request).await?))
}

/// Checks an external order code for premium redemption. Codes already
/// redeemed answer `used` without asking amoCRM.
pub async fn verify_order(State(s): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<PremiumLookup>> {
    authenticate(&s, &headers)?;
    let request: VerifyOrder = parse(&body)?;
    request.validate()?;
    let code = request.order_code.trim();
    if s.store.used_code(code).await?.is_some() {
        return Ok(Json(PremiumLookup::rejected(PremiumResult::Used)));
    }
    let lookup = s.amocrm.premium_lookup(code).await?;
    info!(tg_id = request.tg_id, order_code = code, result = ?lookup.result, "premium lookup");
    Ok(Json(lookup))
}
