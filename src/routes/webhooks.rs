use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Form, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{ApiError, Result};
use crate::integrations::yookassa::{verify_signature, Notification, SIGNATURE_HEADER};
use crate::orders::ReconcileOutcome;
use crate::state::AppState;

fn ignored(reason: impl Into<String>) -> Json<Value> { Json(json!({ "status": "ignored", "reason": reason.into() })) }

/// Lead ids from `leads[status][N][id]` and `leads[add][N][id]` fields.
pub fn lead_ids(form: &HashMap<String, String>) -> Vec<i64> {
    let mut ids: Vec<i64> = form
        .iter()
        .filter(|(k, _)| (k.starts_with("leads[status][") || k.starts_with("leads[add][")) && k.ends_with("][id]"))
        .filter_map(|(_, v)| v.trim().parse().ok())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Status changes are re-read from amoCRM; the form only names the lead.
pub async fn amocrm(State(s): State<AppState>, Form(form): Form<HashMap<String, String>>) -> Json<Value> {
    let ids = lead_ids(&form);
    if ids.is_empty() {
        return ignored("no lead ids");
    }
    let mut outcomes = Vec::with_capacity(ids.len());
    for lead_id in ids {
        match s.orders.reconcile_lead(lead_id).await {
            Ok(outcome) => outcomes.push(serde_json::to_value(outcome).unwrap_or(Value::Null)),
            Err(e) => {
                warn!(lead_id, error = %e, "amoCRM webhook reconciliation failed");
                let failed = ReconcileOutcome::Ignored { reason: format!("lead {}: {}", lead_id, e) };
                outcomes.push(serde_json::to_value(failed).unwrap_or(Value::Null));
            }
        }
    }
    Json(json!({ "status": "ok", "leads": outcomes }))
}

pub async fn yookassa(State(s): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()).unwrap_or_default();
    if !verify_signature(&s.config.yookassa.secret_key, &body, signature) {
        warn!("YooKassa notification with a bad signature");
        return Err(ApiError::Unauthorized("bad notification signature".into()));
    }
    let notification: Notification = match serde_json::from_slice(&body) {
        Ok(n) => n,
        Err(e) => return Ok(ignored(format!("unreadable notification: {}", e))),
    };
    if !notification.is_payment_succeeded() {
        return Ok(ignored(format!("event {}", notification.event)));
    }
    match s.orders.confirm_payment(&notification.object.id).await {
        Ok(Some(settlement)) => {
            info!(cart_id = settlement.cart_id, newly_paid = settlement.newly_paid, "payment notification applied");
            Ok(Json(json!({ "status": "applied", "settlement": settlement })))
        }
        Ok(None) => Ok(ignored(format!("unknown payment {}", notification.object.id))),
        Err(e) => {
            warn!(payment_id = %notification.object.id, error = %e, "payment notification not applied");
            Ok(ignored(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lead_ids_from_form() {
        let form: HashMap<String, String> = [
            ("leads[status][0][id]", "101"),
            ("leads[status][0][status_id]", "142"),
            ("leads[status][1][id]", "102"),
            ("leads[add][0][id]", "101"),
            ("account[id]", "9"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(lead_ids(&form), vec![101, 102]);
    }
}
