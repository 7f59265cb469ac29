//! HTTP surface: storefront routes under the API prefix, plus the
//! payment webhook and the internal bot plane at the root.

mod catalog;
mod delivery;
mod internal;
mod orders;
mod users;
mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::rpc::client::RPC_PATH;
use crate::state::AppState;

pub const SERVICE_NAME: &str = "peptide-shop";

async fn health() -> Json<Value> { Json(json!({ "status": "healthy", "service": SERVICE_NAME })) }

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/search/products", get(catalog::search_products))
        .route("/product/:onec_id/json", get(catalog::product_json))
        .route("/tg-categories", get(catalog::tg_categories))
        .route("/cart/json", post(orders::cart_json))
        .route("/cart/create", post(orders::create_cart))
        .route("/cart", get(orders::user_carts))
        .route("/payments/create", post(orders::create_payment))
        .route("/delivery/cdek", post(delivery::cdek))
        .route("/delivery/yandex/reverse-geocode", get(delivery::reverse_geocode))
        .route("/delivery/yandex/get-pvz", post(delivery::pickup_points))
        .route("/delivery/yandex/get-pvz-all", post(delivery::all_points))
        .route("/promocodes", get(orders::promo_codes))
        .route("/promocodes/", get(orders::promo_code))
        .route("/promocodes/calculate-price", post(orders::calculate_price))
        .route("/users", get(users::users))
        .route("/favourites", post(users::add_favourite).delete(users::remove_favourite))
        .route("/webhooks/amocrm", post(webhooks::amocrm))
        .route("/webhooks/verify-order", post(internal::verify_order));

    let prefix = state.config.api_prefix.trim_end_matches('/');
    let root = Router::new()
        .route("/health", get(health))
        .route(RPC_PATH, post(internal::rpc))
        .route("/yookassa-webhook", post(webhooks::yookassa));
    let app = if prefix.is_empty() { root.merge(api) } else { root.nest(prefix, api) };

    app.layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()).with_state(state)
}
