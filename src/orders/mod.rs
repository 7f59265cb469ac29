//! Order lifecycle engine
//!
//! Drives a cart from checkout to a paid, shipped and CRM-mirrored order.
//! Every store call is its own transaction and none of them spans an
//! outbound request: the engine prices and persists, then talks to
//! YooKassa, amoCRM and CDEK, then persists the outcome.

pub mod delivery;
pub mod gateways;
pub mod receipt;
pub mod report;
pub mod status;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::{StoreError, StoreResult};
use crate::domain::{
    Accrual, Basket, Cart, CartError, CartItem, CartState, Money, PricedLine, ProductWithFeatures, PromoCode, Quantity, Quote,
};
use crate::integrations::UpstreamError;
use delivery::{DeliverySelection, DeliveryService, Package, Recipient, Shipment, TariffRequest};
use gateways::{CarrierGateway, CrmGateway, LeadDraft, LeadSnapshot, PaymentGateway, PaymentRequest};
use receipt::{Receipt, ReceiptCustomer};
use status::MappedStatus;

#[derive(Debug, Error)]
pub enum OrderError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Cart(#[from] CartError),

    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("delivery booking failed for cart {cart_id}: {source}")]
    DeliveryBookingFailed {
        cart_id: i64,
        #[source]
        source: UpstreamError,
    },
}

impl OrderError {
    fn validation(field: &'static str, message: impl Into<String>) -> Self { Self::Validation { field, message: message.into() } }
}

impl From<validator::ValidationErrors> for OrderError {
    fn from(errs: validator::ValidationErrors) -> Self {
        let field = errs.field_errors().keys().next().copied().unwrap_or("body");
        Self::Validation { field, message: errs.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ContactInfo {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 5, max = 32))]
    pub phone: String,
    #[validate(email)]
    #[serde(default)]
    pub email: Option<String>,
}

/// One basket line as the client sends it. Only ids and quantity are
/// trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct LineRequest {
    pub id: String,
    #[serde(rename = "featureId", alias = "feature_id")]
    pub feature_id: String,
    #[validate(range(min = 1, max = 1000))]
    pub qty: u32,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CartCreate {
    pub user_id: i64,
    #[validate(length(min = 1))]
    pub items: Vec<LineRequest>,
    #[serde(default)]
    pub promo_code: Option<String>,
    #[serde(default)]
    pub commentary: Option<String>,
    /// Ephemeral basket, hidden from listings and analytics.
    #[serde(default)]
    pub starter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CheckoutData {
    pub user_id: i64,
    #[serde(default)]
    pub cart_id: Option<i64>,
    #[validate(length(min = 1))]
    pub items: Vec<LineRequest>,
    #[serde(default)]
    pub promo_code: Option<String>,
    #[serde(default)]
    pub commentary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub checkout_data: CheckoutData,
    pub selected_delivery: DeliverySelection,
    pub selected_delivery_service: DeliveryService,
    pub contact_info: ContactInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutResult { pub confirmation_url: String, pub order_id: i64 }

/// Stored in `carts.delivery_payload`; the booking loop reads it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPayload { pub selection: DeliverySelection, pub recipient: ContactInfo }

#[derive(Debug, Clone, Serialize)]
pub struct BasketPreview { pub lines: Vec<PricedLine>, pub quote: Quote, pub promo_code: Option<String> }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentSettlement { pub cart_id: i64, pub newly_paid: bool, pub accrual: Option<Accrual> }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSettlement {
    pub cart_id: i64,
    pub status: String,
    pub is_active: bool,
    pub state: CartState,
    pub accrual: Option<Accrual>,
    /// The status implied a transition the cart cannot make; only the
    /// status string was mirrored.
    pub flags_rejected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ReconcileOutcome {
    Applied(StatusSettlement),
    Ignored { reason: String },
}

impl ReconcileOutcome {
    fn ignored(reason: impl Into<String>) -> Self { Self::Ignored { reason: reason.into() } }
}

/// Persistence the engine needs. Mutating methods are atomic.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn load_products(&self, onec_ids: &[String]) -> StoreResult<Vec<ProductWithFeatures>>;
    async fn find_promo(&self, code: &str) -> StoreResult<Option<PromoCode>>;
    async fn find_cart(&self, cart_id: i64) -> StoreResult<Option<Cart>>;
    async fn find_cart_by_payment(&self, payment_id: &str) -> StoreResult<Option<Cart>>;
    async fn cart_items(&self, cart_id: i64) -> StoreResult<Vec<CartItem>>;
    /// Inserts a new cart (creating the user row when missing), drawing a
    /// new random id while the current one is taken.
    async fn insert_cart(&self, cart: &mut Cart, lines: &[PricedLine]) -> StoreResult<()>;
    /// Writes checkout columns and replaces the items.
    async fn save_cart(&self, cart: &Cart, lines: &[PricedLine]) -> StoreResult<()>;
    async fn record_payment(&self, cart_id: i64, payment_id: &str, confirmation_url: &str) -> StoreResult<()>;
    async fn set_crm_lead(&self, cart_id: i64, lead_id: i64) -> StoreResult<()>;
    /// Marks the cart paid and, when due, accrues its promo code, all in one
    /// commit. See [`settle_payment`].
    async fn confirm_payment(&self, cart_id: i64) -> StoreResult<PaymentSettlement>;
    /// See [`settle_status`].
    async fn apply_crm_status(&self, cart_id: i64, lead_id: i64, status: &MappedStatus) -> StoreResult<StatusSettlement>;
    /// Paid CDEK carts with no carrier order yet.
    async fn carts_awaiting_booking(&self) -> StoreResult<Vec<Cart>>;
    /// Stores the carrier uuid and moves the cart to shipped. `false` when it
    /// already was.
    async fn record_booking(&self, cart_id: i64, tracking: &str) -> StoreResult<bool>;
}

fn accrue_promo(cart: &mut Cart, promo: Option<&mut PromoCode>) -> StoreResult<Option<Accrual>> {
    let Some(promo) = promo else { return Ok(None) };
    let (accrual, event) = promo.accrue(cart.sum, Some(cart.id))?;
    cart.record_promo_gains(accrual.total());
    event.log();
    Ok(Some(accrual))
}

/// Payment confirmation on a loaded (and locked) cart. `promo` is the
/// cart's promo code row when accrual may be due.
pub fn settle_payment(cart: &mut Cart, promo: Option<&mut PromoCode>) -> StoreResult<PaymentSettlement> {
    let transition = cart.mark_paid()?;
    let newly_paid = matches!(transition, crate::domain::PaidTransition::Entered { .. });
    let accrual = if transition.accrue_promo() { accrue_promo(cart, promo)? } else { None };
    cart.check_invariants()?;
    Ok(PaymentSettlement { cart_id: cart.id, newly_paid, accrual })
}

/// Applies a CRM status to a loaded (and locked) cart: forward flag moves
/// implied by the status, promo accrual on a first payment, then the
/// mirrored `status`/`is_active`.
pub fn settle_status(cart: &mut Cart, promo: Option<&mut PromoCode>, status: &MappedStatus) -> StoreResult<StatusSettlement> {
    let snapshot = cart.clone();
    let (paid, flags_rejected) = match cart.apply_status_effect(status.effect) {
        Ok(paid) => (paid, false),
        Err(err @ CartError::InvalidTransition { .. }) => {
            warn!(cart_id = cart.id, status = %status.label, error = %err, "CRM status conflicts with cart state");
            *cart = snapshot;
            (None, true)
        }
        Err(err) => return Err(err.into()),
    };
    let accrual = match paid {
        Some(t) if t.accrue_promo() => accrue_promo(cart, promo)?,
        _ => None,
    };
    cart.mirror_status(status.label.clone(), status.is_active);
    cart.check_invariants()?;
    Ok(StatusSettlement {
        cart_id: cart.id,
        status: cart.status.clone(),
        is_active: cart.is_active,
        state: cart.state(),
        accrual,
        flags_rejected,
    })
}

fn lead_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"№\s*(\d+)").ok()).as_ref()
}

/// Cart id carried in a lead name (`Заказ №1234567 с Приложения ТГ`).
pub fn cart_id_from_lead_name(name: &str) -> Option<i64> {
    lead_name_pattern()?.captures(name).and_then(|c| c.get(1)).and_then(|m| m.as_str().parse().ok())
}

/// Full breakdown attached to the CRM lead as a note.
pub fn order_note(cart: &Cart, basket: &Basket, quote: &Quote, delivery: &str, contact: &ContactInfo) -> String {
    let mut note = String::new();
    let _ = writeln!(note, "{}", Cart::order_name(cart.id));
    let _ = writeln!(note, "Товары:");
    for line in basket.lines() {
        let _ = writeln!(note, "- {} {} × {} = {}", line.product_name, line.feature_name, line.quantity.value(), line.line_total());
    }
    let _ = writeln!(note, "Сумма товаров: {}", quote.subtotal);
    if let Some(code) = &cart.promo_code {
        let _ = writeln!(note, "Промокод: {} (-{}%)", code, quote.discount_pct.value().normalize());
        let _ = writeln!(note, "Итого по товарам: {}", quote.items_total);
    }
    let _ = writeln!(note, "Доставка ({}): {}", delivery, quote.delivery);
    let _ = writeln!(note, "Итого к оплате: {}", quote.total);
    let _ = writeln!(note, "Получатель: {}, {}{}", contact.name, contact.phone, contact.email.as_deref().map(|e| format!(", {}", e)).unwrap_or_default());
    if !cart.commentary.trim().is_empty() {
        let _ = writeln!(note, "Комментарий: {}", cart.commentary.trim());
    }
    note
}

#[derive(Debug, Clone)]
pub struct OrderSettings { pub return_url: String }

pub struct OrderEngine {
    store: Arc<dyn OrderStore>,
    payments: Arc<dyn PaymentGateway>,
    crm: Arc<dyn CrmGateway>,
    carrier: Arc<dyn CarrierGateway>,
    settings: OrderSettings,
}

impl OrderEngine {
    pub fn new(
        store: Arc<dyn OrderStore>,
        payments: Arc<dyn PaymentGateway>,
        crm: Arc<dyn CrmGateway>,
        carrier: Arc<dyn CarrierGateway>,
        settings: OrderSettings,
    ) -> Self {
        Self { store, payments, crm, carrier, settings }
    }

    /// Builds a basket from catalog rows; client prices are ignored.
    pub async fn price_items(&self, items: &[LineRequest]) -> Result<Basket, OrderError> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).filter(|id| seen.insert(id.clone())).collect();
        let products = self.store.load_products(&ids).await?;

        let mut basket = Basket::new();
        for item in items {
            let product = products
                .iter()
                .find(|p| p.product.onec_id == item.id)
                .ok_or_else(|| OrderError::validation("items", format!("unknown product {}", item.id)))?;
            let feature = product
                .feature(&item.feature_id)
                .ok_or_else(|| OrderError::validation("items", format!("unknown feature {}", item.feature_id)))?;
            let qty = Quantity::new(item.qty).map_err(|e| OrderError::validation("qty", e.to_string()))?;
            basket.add_item(PricedLine::from_catalog(product, feature, qty));
        }
        Ok(basket)
    }

    async fn resolve_promo(&self, code: Option<&str>) -> Result<Option<PromoCode>, OrderError> {
        let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) else { return Ok(None) };
        let promo = self.store.find_promo(code).await?;
        promo.map(Some).ok_or_else(|| OrderError::validation("promo_code", format!("unknown promo code {}", code)))
    }

    /// Server-side pricing of a client basket, without delivery.
    pub async fn preview(&self, items: &[LineRequest], promo_code: Option<&str>) -> Result<BasketPreview, OrderError> {
        let basket = self.price_items(items).await?;
        let promo = self.resolve_promo(promo_code).await?;
        let quote = basket.quote(promo.as_ref().map(|p| p.discount_pct), Money::ZERO);
        Ok(BasketPreview { lines: basket.lines().to_vec(), quote, promo_code: promo.map(|p| p.code) })
    }

    pub async fn create_cart(&self, request: &CartCreate) -> Result<Cart, OrderError> {
        request.validate()?;
        let basket = self.price_items(&request.items).await?;
        let promo = self.resolve_promo(request.promo_code.as_deref()).await?;
        let quote = basket.quote(promo.as_ref().map(|p| p.discount_pct), Money::ZERO);

        let mut cart = Cart::new(request.user_id);
        if request.starter {
            cart.name = Cart::starter_name(cart.id);
        }
        cart.commentary = request.commentary.clone().unwrap_or_default();
        cart.apply_quote(&quote, promo.map(|p| p.code))?;
        self.store.insert_cart(&mut cart, basket.lines()).await?;
        Ok(cart)
    }

    /// Prices, persists and submits a checkout; returns the payment page.
    ///
    /// A payment failure aborts with the cart left in `created`. A CRM
    /// failure is logged and left to the webhook reconciliation.
    pub async fn checkout(&self, request: CheckoutRequest) -> Result<CheckoutResult, OrderError> {
        let CheckoutRequest { checkout_data: data, selected_delivery: selection, selected_delivery_service: service, contact_info: contact } = request;
        data.validate()?;
        contact.validate()?;
        selection.check(service).map_err(|(field, message)| OrderError::validation(field, message))?;

        let basket = self.price_items(&data.items).await?;
        if let Some(short) = basket.lines().iter().find(|l| l.quantity.value() as i64 > l.balance as i64) {
            return Err(OrderError::validation("items", format!("only {} left of {} {}", short.balance.max(0), short.product_name, short.feature_name)));
        }
        let promo = self.resolve_promo(data.promo_code.as_deref()).await?;
        let package = Package::for_items(basket.item_count());

        let delivery = match service {
            DeliveryService::Cdek => {
                let tariff_code = selection.tariff_code.ok_or_else(|| OrderError::validation("tariff_code", "CDEK tariff is required"))?;
                self.carrier.quote(&TariffRequest { tariff_code, selection: selection.clone(), package }).await?
            }
            DeliveryService::Yandex => Money::new(selection.price.unwrap_or_default()),
        };
        let quote = basket.quote(promo.as_ref().map(|p| p.discount_pct), delivery);

        let (mut cart, is_new) = match data.cart_id {
            Some(id) => {
                let cart = self.store.find_cart(id).await?.ok_or_else(|| StoreError::not_found("cart", id))?;
                if cart.user_id != data.user_id {
                    return Err(StoreError::not_found("cart", id).into());
                }
                (cart, false)
            }
            None => (Cart::new(data.user_id), true),
        };
        if cart.is_starter() {
            cart.name = Cart::order_name(cart.id);
        }
        cart.apply_quote(&quote, promo.as_ref().map(|p| p.code.clone()))?;
        cart.phone = Some(contact.phone.clone());
        cart.email = contact.email.clone();
        cart.commentary = data.commentary.clone().unwrap_or_default();
        cart.delivery_string = selection.describe(service);
        cart.delivery_service = Some(service.as_str().to_string());
        let payload = DeliveryPayload { selection: selection.clone(), recipient: contact.clone() };
        cart.delivery_payload = Some(serde_json::to_value(&payload).map_err(|e| OrderError::validation("selected_delivery", e.to_string()))?);

        if is_new {
            self.store.insert_cart(&mut cart, basket.lines()).await?;
        } else {
            self.store.save_cart(&cart, basket.lines()).await?;
        }

        let receipt = Receipt::build(&basket, &quote, ReceiptCustomer {
            full_name: Some(contact.name.clone()),
            email: contact.email.clone(),
            phone: Some(contact.phone.clone()),
        });
        let payment = self
            .payments
            .create_payment(&PaymentRequest {
                idempotence_key: Uuid::new_v4(),
                cart_id: cart.id,
                amount: quote.total,
                description: cart.name.clone(),
                return_url: self.settings.return_url.clone(),
                receipt,
            })
            .await?;
        cart.submit_checkout(payment.id.clone(), payment.confirmation_url.clone())?;
        self.store.record_payment(cart.id, &payment.id, &payment.confirmation_url).await?;

        let draft = LeadDraft {
            cart_id: cart.id,
            name: LeadDraft::lead_name(cart.id),
            price: quote.total.whole_rubles(),
            status_id: status::CREATED,
            contact: contact.clone(),
            address: cart.delivery_string.clone(),
            delivery_service: service.label().to_string(),
            tracking_number: None,
            promo_code: cart.promo_code.clone(),
            delivery_sum: quote.delivery,
            payment_method: "ЮKassa".to_string(),
            note: order_note(&cart, &basket, &quote, &cart.delivery_string, &contact),
        };
        match self.crm.create_order_lead(&draft).await {
            Ok(lead_id) => {
                if let Err(e) = self.store.set_crm_lead(cart.id, lead_id).await {
                    warn!(cart_id = cart.id, lead_id, error = %e, "failed to store CRM lead id");
                }
            }
            Err(e) => warn!(cart_id = cart.id, error = %e, "CRM lead creation failed, left to reconciliation"),
        }

        cart.take_events().iter().for_each(|e| e.log());
        info!(cart_id = cart.id, total = %quote.total, service = service.as_str(), "checkout submitted");
        Ok(CheckoutResult { confirmation_url: payment.confirmation_url, order_id: cart.id })
    }

    /// Handles a confirmed payment. `None` when no cart carries the payment.
    pub async fn confirm_payment(&self, payment_id: &str) -> Result<Option<PaymentSettlement>, OrderError> {
        let Some(cart) = self.store.find_cart_by_payment(payment_id).await? else {
            warn!(payment_id, "payment confirmation for unknown payment");
            return Ok(None);
        };
        let settlement = self.store.confirm_payment(cart.id).await?;
        if settlement.newly_paid {
            info!(cart_id = cart.id, accrued = settlement.accrual.is_some(), "payment confirmed");
            self.try_book(cart.id).await;
        }
        Ok(Some(settlement))
    }

    /// Mirrors a lead's current CRM status onto its cart. The lead is
    /// re-fetched; webhook bodies are not trusted.
    pub async fn reconcile_lead(&self, lead_id: i64) -> Result<ReconcileOutcome, OrderError> {
        let Some(lead) = self.crm.lead(lead_id).await? else {
            return Ok(ReconcileOutcome::ignored(format!("lead {} not found", lead_id)));
        };
        let Some(cart_id) = cart_id_from_lead_name(&lead.name) else {
            return Ok(ReconcileOutcome::ignored(format!("lead {} carries no order number", lead_id)));
        };
        self.apply_lead(cart_id, &lead).await
    }

    /// Looks the cart's lead up by order number and mirrors its status.
    pub async fn reconcile_cart(&self, cart_id: i64) -> Result<ReconcileOutcome, OrderError> {
        match self.crm.find_order_lead(cart_id).await? {
            Some(lead) => self.apply_lead(cart_id, &lead).await,
            None => Ok(ReconcileOutcome::ignored(format!("no lead for order {}", cart_id))),
        }
    }

    async fn apply_lead(&self, cart_id: i64, lead: &LeadSnapshot) -> Result<ReconcileOutcome, OrderError> {
        let mapped = status::map_status(lead.status_id);
        if !mapped.known {
            warn!(cart_id, lead_id = lead.id, status_id = lead.status_id, "unknown CRM status");
        }
        match self.store.apply_crm_status(cart_id, lead.id, &mapped).await {
            Ok(settlement) => Ok(ReconcileOutcome::Applied(settlement)),
            Err(StoreError::NotFound { .. }) => Ok(ReconcileOutcome::ignored(format!("cart {} not found", cart_id))),
            Err(e) => Err(e.into()),
        }
    }

    /// Books the CDEK shipment of a paid cart. `None` when there is nothing
    /// to book.
    pub async fn book_delivery(&self, cart_id: i64) -> Result<Option<String>, OrderError> {
        let cart = self.store.find_cart(cart_id).await?.ok_or_else(|| StoreError::not_found("cart", cart_id))?;
        if cart.delivery_service.as_deref() != Some(DeliveryService::Cdek.as_str())
            || cart.cdek_order_uuid.is_some()
            || cart.state() != CartState::Paid
        {
            return Ok(None);
        }
        let payload: DeliveryPayload = cart
            .delivery_payload
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| OrderError::validation("delivery_payload", format!("cart {} has no delivery details", cart_id)))?;
        let tariff_code = payload.selection.tariff_code.ok_or_else(|| OrderError::validation("tariff_code", "CDEK tariff is required"))?;

        let items = self.store.cart_items(cart_id).await?;
        let lines: Vec<LineRequest> = items
            .iter()
            .map(|i| LineRequest { id: i.product_onec_id.clone(), feature_id: i.feature_onec_id.clone(), qty: i.quantity.max(1) as u32, name: None })
            .collect();
        let basket = self.price_items(&lines).await?;

        let shipment = Shipment {
            cart_id,
            order_name: cart.name.clone(),
            tariff_code,
            selection: payload.selection,
            recipient: Recipient { name: payload.recipient.name, phone: payload.recipient.phone, email: payload.recipient.email },
            package: Package::for_items(basket.item_count()),
            items: Shipment::items_from(&basket),
        };
        let uuid = self.carrier.book(&shipment).await.map_err(|source| OrderError::DeliveryBookingFailed { cart_id, source })?;
        self.store.record_booking(cart_id, &uuid).await?;
        info!(cart_id, cdek_uuid = %uuid, "delivery booked");

        if let Some(lead_id) = cart.crm_lead_id {
            if let Err(e) = self.crm.set_tracking(lead_id, &uuid).await {
                warn!(cart_id, lead_id, error = %e, "failed to push tracking number to CRM");
            }
        }
        Ok(Some(uuid))
    }

    async fn try_book(&self, cart_id: i64) {
        if let Err(e) = self.book_delivery(cart_id).await {
            warn!(cart_id, error = %e, "delivery booking deferred");
        }
    }

    /// One pass of the booking retry loop. Returns how many carts got booked.
    pub async fn retry_pending_bookings(&self) -> Result<usize, OrderError> {
        let mut booked = 0;
        for cart in self.store.carts_awaiting_booking().await? {
            match self.book_delivery(cart.id).await {
                Ok(Some(_)) => booked += 1,
                Ok(None) => {}
                Err(e) => warn!(cart_id = cart.id, error = %e, "delivery booking retry failed"),
            }
        }
        Ok(booked)
    }
}
