//! Internal bot RPC: one signed endpoint, a fixed registry of actions.
//!
//! Every action reads its payload into a typed struct, runs against the
//! store and answers `{"result": ...}`. Entities leave through [`wire`],
//! which keeps only the allow-listed fields of each entity; decimals go
//! out as floats, timestamps as RFC 3339 and enums as their string value.

pub mod auth;
pub mod client;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};
use validator::Validate;

use crate::assistant::UserPatch;
use crate::db::orders::CartFilter;
use crate::db::users::{UsageWindow, UserColumn, UserUpsert};
use crate::db::{PgStore, StoreError};
use crate::domain::{BotKind, Money};
use crate::orders::report::{cart_analysis, user_carts_summary, CartView};
use crate::error::ApiError;

pub use auth::RpcAuthError;
pub use client::RpcClient;

pub const USER_FIELDS: &[&str] = &[
    "tg_id", "username", "name", "surname", "photo_url", "tg_phone", "phone", "email", "thread_id", "input_tokens",
    "output_tokens", "premium_until", "premium_requests", "blocked_until", "muted_until", "muted_chat_id", "created_at",
];
pub const PRODUCT_FIELDS: &[&str] = &["onec_id", "name", "code", "description", "usage", "expiration", "category_onec_id"];
pub const FEATURE_FIELDS: &[&str] = &["onec_id", "product_onec_id", "name", "code", "file_id", "price", "balance"];
pub const CART_FIELDS: &[&str] = &[
    "id", "user_id", "name", "phone", "email", "sum", "delivery_sum", "promo_gains", "delivery_string", "commentary",
    "promo_code", "promo_gains_given", "is_active", "is_paid", "is_canceled", "is_shipped",
    "is_completed", "status", "delivery_service",
    "crm_lead_id", "cdek_order_uuid", "created_at", "updated_at",
];
pub const CART_ITEM_FIELDS: &[&str] = &["id", "cart_id", "product_onec_id", "feature_onec_id", "quantity"];
pub const PROMO_FIELDS: &[&str] = &[
    "code", "discount_pct", "owner_name", "owner_pct", "owner_amount_gained", "lvl1_name", "lvl1_pct", "lvl1_amount_gained",
    "lvl2_name", "lvl2_pct", "lvl2_amount_gained", "times_used",
];
pub const USED_CODE_FIELDS: &[&str] = &["id", "code", "user_id", "price", "created_at"];
pub const USAGE_FIELDS: &[&str] =
    &["id", "user_id", "date", "bot", "input_tokens", "output_tokens", "total_requests", "input_cost_usd", "output_cost_usd"];

/// Serializes `value` keeping only `fields` of every object, at the top
/// level or one array deep.
pub fn wire<T: Serialize>(value: &T, fields: &[&str]) -> Value {
    fn keep(value: Value, fields: &[&str]) -> Value {
        match value {
            Value::Object(map) => Value::Object(map.into_iter().filter(|(k, _)| fields.contains(&k.as_str())).collect()),
            other => other,
        }
    }
    match serde_json::to_value(value) {
        Ok(Value::Array(items)) => Value::Array(items.into_iter().map(|v| keep(v, fields)).collect()),
        Ok(other) => keep(other, fields),
        Err(_) => Value::Null,
    }
}

fn cart_wire(view: &CartView) -> Value {
    let mut cart = wire(&view.cart, CART_FIELDS);
    let items: Vec<Value> = view
        .items
        .iter()
        .map(|line| {
            let mut item = wire(&line.item, CART_ITEM_FIELDS);
            item["product"] = line.product.as_ref().map(|p| wire(p, PRODUCT_FIELDS)).unwrap_or(Value::Null);
            item["feature"] = line.feature.as_ref().map(|f| wire(f, FEATURE_FIELDS)).unwrap_or(Value::Null);
            item
        })
        .collect();
    cart["items"] = Value::Array(items);
    cart["promo"] = view.promo.as_ref().map(|p| wire(p, PROMO_FIELDS)).unwrap_or(Value::Null);
    cart
}

fn carts_wire(views: &[CartView]) -> Value { Value::Array(views.iter().map(cart_wire).collect()) }

macro_rules! actions {
    ($($variant:ident => $name:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Action { $($variant),* }

        impl Action {
            pub const ALL: &'static [Action] = &[$(Action::$variant),*];

            pub fn as_str(&self) -> &'static str {
                match self { $(Action::$variant => $name),* }
            }
        }

        impl FromStr for Action {
            type Err = RpcError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s { $($name => Ok(Action::$variant),)* other => Err(RpcError::UnknownAction(other.to_string())) }
            }
        }
    };
}

actions! {
    GetUser => "get_user",
    GetUsers => "get_users",
    UpsertUser => "upsert_user",
    UpdateUser => "update_user",
    UpdateUserName => "update_user_name",
    IncrementTokens => "increment_tokens",
    WriteUsage => "write_usage",
    GetUserTotalRequests => "get_user_total_requests",
    GetUsages => "get_usages",
    GetUserUsageTotals => "get_user_usage_totals",
    GetProductWithFeatures => "get_product_with_features",
    GetUsedCodeByCode => "get_used_code_by_code",
    CreateUsedCode => "create_used_code",
    ListPromos => "list_promos",
    GetCarts => "get_carts",
    GetUserCarts => "get_user_carts",
    GetCartsByDate => "get_carts_by_date",
    GetCartById => "get_cart_by_id",
    SearchUsers => "search_users",
    SearchCarts => "search_carts",
    UserCartsAnalyticsText => "user_carts_analytics_text",
    CartAnalysisText => "cart_analysis_text",
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("invalid payload for '{action}': {message}")]
    BadPayload { action: Action, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RpcError> for ApiError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Store(e) => e.into(),
            other => ApiError::bad_request(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub result: Value,
}

fn payload<T: DeserializeOwned>(action: Action, raw: Value) -> Result<T, RpcError> {
    let raw = if raw.is_null() { json!({}) } else { raw };
    serde_json::from_value(raw).map_err(|e| RpcError::BadPayload { action, message: e.to_string() })
}

fn validated<T: DeserializeOwned + Validate>(action: Action, raw: Value) -> Result<T, RpcError> {
    let value: T = payload(action, raw)?;
    value.validate().map_err(|e| RpcError::BadPayload { action, message: e.to_string() })?;
    Ok(value)
}

#[derive(Deserialize)]
struct ByTgId { tg_id: i64 }

#[derive(Deserialize)]
struct ByUserId { user_id: i64 }

#[derive(Deserialize)]
struct ByCartId { cart_id: i64 }

#[derive(Deserialize)]
struct ByCode { code: String }

#[derive(Deserialize)]
struct ByOnecId { onec_id: String }

#[derive(Deserialize)]
struct UsersQuery {
    column_name: Option<String>,
    value: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

#[derive(Deserialize, Validate)]
struct UpdateUser {
    tg_id: i64,
    #[serde(flatten)]
    #[validate]
    patch: UserPatch,
}

#[derive(Deserialize)]
struct UpdateUserName { tg_id: i64, name: Option<String>, surname: Option<String> }

#[derive(Deserialize)]
struct IncrementTokens {
    tg_id: i64,
    input_tokens: i64,
    output_tokens: i64,
    #[serde(default)]
    bot: Option<BotKind>,
}

#[derive(Deserialize)]
struct WriteUsage {
    tg_id: i64,
    bot: BotKind,
    #[serde(default)]
    date: Option<NaiveDate>,
    input_tokens: i64,
    output_tokens: i64,
}

#[derive(Deserialize)]
struct CreateUsedCode { code: String, tg_id: i64, price: Money }

#[derive(Deserialize)]
struct CartsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

#[derive(Deserialize)]
struct CartsByDate { from: DateTime<Utc>, to: Option<DateTime<Utc>> }

#[derive(Deserialize)]
struct SearchQuery {
    query: String,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 { 100 }

/// Server side of the RPC plane.
#[derive(Clone)]
pub struct RpcService {
    store: PgStore,
    premium_days: i64,
}

impl RpcService {
    pub fn new(store: PgStore, premium_days: i64) -> Self { Self { store, premium_days } }

    pub async fn dispatch(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        let action: Action = request.action.trim().parse()?;
        debug!(action = %action, "rpc call");
        let result = self.run(action, request.payload).await?;
        Ok(RpcResponse { result })
    }

    async fn run(&self, action: Action, raw: Value) -> Result<Value, RpcError> {
        let store = &self.store;
        let value = match action {
            Action::GetUser => {
                let p: ByTgId = payload(action, raw)?;
                store.user(p.tg_id).await?.map(|u| wire(&u, USER_FIELDS)).unwrap_or(Value::Null)
            }
            Action::GetUsers => {
                let p: UsersQuery = payload(action, raw)?;
                let users = match (p.column_name, p.value) {
                    (Some(column), Some(value)) => store.users_by(column.parse::<UserColumn>()?, &value).await?,
                    _ => store.users(p.limit, p.offset).await?,
                };
                wire(&users, USER_FIELDS)
            }
            Action::UpsertUser => {
                let p: UserUpsert = validated(action, raw)?;
                wire(&store.upsert_user(&p).await?, USER_FIELDS)
            }
            Action::UpdateUser => {
                let p: UpdateUser = validated(action, raw)?;
                wire(&store.update_user(p.tg_id, &p.patch).await?, USER_FIELDS)
            }
            Action::UpdateUserName => {
                let p: UpdateUserName = payload(action, raw)?;
                wire(&store.update_user_name(p.tg_id, p.name.as_deref(), p.surname.as_deref()).await?, USER_FIELDS)
            }
            Action::IncrementTokens => {
                let p: IncrementTokens = payload(action, raw)?;
                wire(&store.increment_tokens(p.tg_id, p.input_tokens, p.output_tokens, p.bot).await?, USER_FIELDS)
            }
            Action::WriteUsage => {
                let p: WriteUsage = payload(action, raw)?;
                wire(&store.write_usage(p.tg_id, p.bot, p.date, p.input_tokens, p.output_tokens).await?, USAGE_FIELDS)
            }
            Action::GetUserTotalRequests => {
                let p: ByTgId = payload(action, raw)?;
                json!({ "total": store.total_requests(p.tg_id).await? })
            }
            Action::GetUsages => {
                let window: UsageWindow = payload(action, raw)?;
                wire(&store.usages(&window).await?, USAGE_FIELDS)
            }
            Action::GetUserUsageTotals => {
                let window: UsageWindow = payload(action, raw)?;
                if window.user_id.is_none() {
                    return Err(RpcError::BadPayload { action, message: "user_id is required".into() });
                }
                serde_json::to_value(store.usage_totals(&window).await?).unwrap_or(Value::Null)
            }
            Action::GetProductWithFeatures => {
                let p: ByOnecId = payload(action, raw)?;
                match store.product_with_features(&p.onec_id).await? {
                    Some(pwf) => {
                        let mut product = wire(&pwf.product, PRODUCT_FIELDS);
                        product["features"] = wire(&pwf.features, FEATURE_FIELDS);
                        product
                    }
                    None => Value::Null,
                }
            }
            Action::GetUsedCodeByCode => {
                let p: ByCode = payload(action, raw)?;
                store.used_code(&p.code).await?.map(|c| wire(&c, USED_CODE_FIELDS)).unwrap_or(Value::Null)
            }
            Action::CreateUsedCode => {
                let p: CreateUsedCode = payload(action, raw)?;
                let (used, user) = store.create_used_code(&p.code, p.tg_id, p.price, self.premium_days).await?;
                info!(code = %used.code, tg_id = p.tg_id, premium_until = ?user.premium_until, "order code redeemed");
                json!({ "used_code": wire(&used, USED_CODE_FIELDS), "user": wire(&user, USER_FIELDS) })
            }
            Action::ListPromos => wire(&store.promo_codes().await?, PROMO_FIELDS),
            Action::GetCarts => {
                let p: CartsQuery = payload(action, raw)?;
                carts_wire(&store.cart_views(&CartFilter { limit: Some(p.limit), ..Default::default() }).await?)
            }
            Action::GetUserCarts => {
                let p: ByUserId = payload(action, raw)?;
                carts_wire(&store.cart_views(&CartFilter { user_id: Some(p.user_id), ..Default::default() }).await?)
            }
            Action::GetCartsByDate => {
                let p: CartsByDate = payload(action, raw)?;
                carts_wire(&store.cart_views(&CartFilter { from: Some(p.from), to: p.to, ..Default::default() }).await?)
            }
            Action::GetCartById => {
                let p: ByCartId = payload(action, raw)?;
                store.cart_view(p.cart_id).await?.as_ref().map(cart_wire).unwrap_or(Value::Null)
            }
            Action::SearchUsers => {
                let p: SearchQuery = payload(action, raw)?;
                wire(&store.search_users(&p.query, p.limit).await?, USER_FIELDS)
            }
            Action::SearchCarts => {
                let p: SearchQuery = payload(action, raw)?;
                let filter = CartFilter { query: Some(p.query), limit: Some(p.limit), ..Default::default() };
                carts_wire(&store.cart_views(&filter).await?)
            }
            Action::UserCartsAnalyticsText => {
                let p: ByUserId = payload(action, raw)?;
                let user = store.user(p.user_id).await?;
                let carts = store.cart_views(&CartFilter { user_id: Some(p.user_id), ..Default::default() }).await?;
                json!({ "text": user_carts_summary(p.user_id, user.as_ref(), &carts) })
            }
            Action::CartAnalysisText => {
                let p: ByCartId = payload(action, raw)?;
                let view = store.cart_view(p.cart_id).await?.ok_or_else(|| StoreError::not_found("cart", p.cart_id))?;
                json!({ "text": cart_analysis(&view) })
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Cart, CartItem, Feature, Product, User};
    use rust_decimal_macros::dec;

    #[test]
    fn test_registry_has_every_action() {
        assert_eq!(Action::ALL.len(), 22);
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), *action);
        }
        assert!(matches!("drop_tables".parse::<Action>(), Err(RpcError::UnknownAction(name)) if name == "drop_tables"));
    }

    #[test]
    fn test_unknown_action_is_bad_request() {
        let api: ApiError = RpcError::UnknownAction("nope".into()).into();
        assert_eq!(api.status_code(), axum::http::StatusCode::BAD_REQUEST);
        let api: ApiError = RpcError::BadPayload { action: Action::GetUser, message: "missing field".into() }.into();
        assert_eq!(api.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_wire_allow_lists() {
        let mut cart = Cart::new(7);
        cart.payment_id = Some("pay_1".into());
        cart.delivery_payload = Some(json!({ "secret": true }));
        cart.sum = Money::new(dec!(1195.50));
        let out = wire(&cart, CART_FIELDS);
        assert!(out.get("payment_id").is_none());
        assert!(out.get("delivery_payload").is_none());
        assert_eq!(out["sum"].as_f64(), Some(1195.5));
        assert_eq!(out["user_id"], 7);

        let user = User::new(42);
        let out = wire(&vec![user], USER_FIELDS);
        assert_eq!(out[0]["tg_id"], 42);
        assert!(out[0]["created_at"].as_str().is_some_and(|s| s.contains('T')));
    }

    #[test]
    fn test_cart_wire_nests_lines() {
        let cart = Cart::new(7);
        let view = CartView {
            items: vec![crate::orders::report::CartLineView {
                item: CartItem { id: 1, cart_id: cart.id, product_onec_id: "p1".into(), feature_onec_id: "f1".into(), quantity: 2 },
                product: Some(Product {
                    id: 9, onec_id: "p1".into(), name: "BPC-157".into(), code: "001".into(), description: String::new(),
                    usage: String::new(), expiration: String::new(), category_onec_id: "c1".into(),
                }),
                feature: Some(Feature {
                    onec_id: "f1".into(), product_onec_id: "p1".into(), name: "5 мг".into(), code: "001-1".into(),
                    file_id: None, price: Money::new(dec!(900)), balance: 3,
                }),
            }],
            cart,
            promo: None,
        };
        let out = cart_wire(&view);
        assert_eq!(out["items"][0]["quantity"], 2);
        assert!(out["items"][0]["product"].get("id").is_none());
        assert_eq!(out["items"][0]["feature"]["price"].as_f64(), Some(900.0));
        assert!(out["promo"].is_null());
    }

    #[test]
    fn test_payload_parsing() {
        let p: UpdateUser = validated(Action::UpdateUser, json!({ "tg_id": 5, "premium_requests": 3 })).unwrap();
        assert_eq!(p.patch.premium_requests, Some(3));
        assert!(validated::<UpdateUser>(Action::UpdateUser, json!({ "tg_id": 5, "email": "nope" })).is_err());
        assert!(payload::<ByTgId>(Action::GetUser, Value::Null).is_err());
        let q: CartsQuery = payload(Action::GetCarts, Value::Null).unwrap();
        assert_eq!(q.limit, 100);
    }
}
