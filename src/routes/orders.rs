use std::str::FromStr;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::db::orders::CartFilter;
use crate::domain::{Cart, Money, PromoCode};
use crate::error::{ApiError, Result};
use crate::orders::report::CartView;
use crate::orders::{BasketPreview, CartCreate, CheckoutRequest, CheckoutResult, LineRequest};
use crate::promo::PriceCalculation;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PreviewBody {
    pub items: Vec<LineRequest>,
    #[serde(default)]
    pub promo_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserParam { pub user_id: i64 }

#[derive(Debug, Deserialize)]
pub struct CodeParam { pub code: String }

#[derive(Debug, Deserialize)]
pub struct PriceParams { pub code: String, pub init_price: String }

pub async fn cart_json(State(s): State<AppState>, Json(b): Json<PreviewBody>) -> Result<Json<BasketPreview>> {
    Ok(Json(s.orders.preview(&b.items, b.promo_code.as_deref()).await?))
}

pub async fn create_cart(State(s): State<AppState>, Json(r): Json<CartCreate>) -> Result<(StatusCode, Json<Cart>)> {
    Ok((StatusCode::CREATED, Json(s.orders.create_cart(&r).await?)))
}

pub async fn user_carts(State(s): State<AppState>, Query(p): Query<UserParam>) -> Result<Json<Vec<CartView>>> {
    let filter = CartFilter { user_id: Some(p.user_id), ..Default::default() };
    Ok(Json(s.store.cart_views(&filter).await?))
}

pub async fn create_payment(State(s): State<AppState>, Json(r): Json<CheckoutRequest>) -> Result<Json<CheckoutResult>> {
    Ok(Json(s.orders.checkout(r).await?))
}

pub async fn promo_codes(State(s): State<AppState>) -> Result<Json<Vec<PromoCode>>> {
    Ok(Json(s.store.promo_codes().await?))
}

pub async fn promo_code(State(s): State<AppState>, Query(p): Query<CodeParam>) -> Result<Json<PromoCode>> {
    let code = p.code.trim();
    s.store.promo_code(code).await?.map(Json).ok_or_else(|| ApiError::not_found("promo code", code))
}

pub async fn calculate_price(State(s): State<AppState>, Query(p): Query<PriceParams>) -> Result<Json<PriceCalculation>> {
    let init_price = Decimal::from_str(p.init_price.trim())
        .map_err(|_| ApiError::validation("init_price", format!("'{}' is not a number", p.init_price)))?;
    Ok(Json(s.store.calculate_price(p.code.trim(), Money::new(init_price)).await?))
}
