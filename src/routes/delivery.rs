use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ApiError, Result};
use crate::integrations::yandex::{PvzQuery, ReverseGeocode};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CdekAction { Offices, Calculate }

#[derive(Debug, Deserialize)]
pub struct CdekParams { pub action: CdekAction }

#[derive(Debug, Deserialize)]
pub struct Point { pub lat: f64, pub lon: f64 }

pub async fn cdek(State(s): State<AppState>, Query(p): Query<CdekParams>, body: Option<Json<Value>>) -> Result<Json<Value>> {
    let params = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let response = match p.action {
        CdekAction::Offices => s.cdek.offices(&params).await?,
        CdekAction::Calculate => s.cdek.calculate(&params).await?,
    };
    Ok(Json(response))
}

pub async fn reverse_geocode(State(s): State<AppState>, Query(p): Query<Point>) -> Result<Json<ReverseGeocode>> {
    if !(-90.0..=90.0).contains(&p.lat) || !(-180.0..=180.0).contains(&p.lon) {
        return Err(ApiError::validation("lat", "coordinates out of range"));
    }
    Ok(Json(s.yandex.reverse_geocode(p.lat, p.lon).await))
}

async fn points(s: &AppState, query: &PvzQuery, only_pickup: bool) -> Result<Json<Value>> {
    let body = query.body(only_pickup).map_err(|(field, message)| ApiError::validation(field, message))?;
    Ok(Json(s.yandex.pickup_points(&body).await?))
}

pub async fn pickup_points(State(s): State<AppState>, Json(q): Json<PvzQuery>) -> Result<Json<Value>> {
    points(&s, &q, true).await
}

pub async fn all_points(State(s): State<AppState>, Json(q): Json<PvzQuery>) -> Result<Json<Value>> {
    points(&s, &q, false).await
}
