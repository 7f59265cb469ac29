//! Cart Aggregate
//!
//! A cart is the order aggregate. Only the lifecycle flags
//! `(is_paid, is_shipped, is_completed, is_canceled)`, `is_active`, the CRM
//! `status` string and the payment handle are persisted; the lifecycle
//! state is derived from the flags and the payment handle:
//!
//! ```text
//! created ─checkout─▶ awaiting_payment ─paid─▶ paid ─shipment─▶ shipped ─delivered─▶ completed
//!    └──────────────────────┴─────────── cancel ───▶ canceled
//! ```

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use crate::domain::events::{CartEvent, DomainEvent};
use crate::domain::value_objects::{Money, Percent, Quantity};
use super::product::{Feature, ProductWithFeatures};

pub const STARTER_MARKER: &str = "начальная";

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct Cart {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub sum: Money,
    pub delivery_sum: Money,
    pub promo_gains: Money,
    pub delivery_string: String,
    pub commentary: String,
    pub promo_code: Option<String>,
    pub promo_gains_given: bool,
    pub is_active: bool,
    pub is_paid: bool,
    pub is_canceled: bool,
    pub is_shipped: bool,
    /// Set by [`Cart::complete`] only. `is_active` mirrors the CRM and says
    /// nothing about completion.
    pub is_completed: bool,
    pub status: String,
    pub delivery_service: Option<String>,
    pub delivery_payload: Option<serde_json::Value>,
    pub payment_id: Option<String>,
    pub confirmation_url: Option<String>,
    pub crm_lead_id: Option<i64>,
    pub cdek_order_uuid: Option<String>,
    pub yandex_request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(skip)]
    #[serde(skip)]
    events: Vec<DomainEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CartItem {
    pub id: i64,
    pub cart_id: i64,
    pub product_onec_id: String,
    pub feature_onec_id: String,
    pub quantity: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartState { Created, AwaitingPayment, Paid, Shipped, Completed, Canceled }

/// Target flags a CRM status maps to. Applied through the regular
/// transitions so exclusivity is enforced the same way.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusEffect { pub paid: bool, pub shipped: bool, pub canceled: bool, pub completes: bool }

/// Outcome of a payment confirmation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaidTransition {
    /// First transition into `paid`; promo accrual is due when `accrue_promo`.
    Entered { accrue_promo: bool },
    /// The cart was already paid.
    AlreadyPaid { accrue_promo: bool },
}

impl PaidTransition {
    pub fn accrue_promo(&self) -> bool {
        match self { Self::Entered { accrue_promo } | Self::AlreadyPaid { accrue_promo } => *accrue_promo }
    }
}

impl Cart {
    /// Fresh cart with a random 7-digit id. The name is assigned once the
    /// id is known to be free.
    pub fn new(user_id: i64) -> Self {
        let now = Utc::now();
        let id = Self::random_id();
        Self {
            id, user_id, name: Self::order_name(id), phone: None, email: None,
            sum: Money::ZERO, delivery_sum: Money::ZERO, promo_gains: Money::ZERO,
            delivery_string: String::new(), commentary: String::new(), promo_code: None, promo_gains_given: false,
            is_active: true, is_paid: false, is_canceled: false, is_shipped: false, is_completed: false, status: String::new(),
            delivery_service: None, delivery_payload: None, payment_id: None, confirmation_url: None,
            crm_lead_id: None, cdek_order_uuid: None, yandex_request_id: None,
            created_at: now, updated_at: now, events: vec![],
        }
    }

    pub fn random_id() -> i64 { rand::thread_rng().gen_range(1_000_000..=9_999_999) }
    pub fn order_name(id: i64) -> String { format!("Заказ #{}", id) }
    pub fn starter_name(id: i64) -> String { format!("{} корзина #{}", STARTER_MARKER, id) }
    pub fn is_starter_name(name: &str) -> bool { name.to_lowercase().contains(STARTER_MARKER) }
    pub fn is_starter(&self) -> bool { Self::is_starter_name(&self.name) }

    pub fn reassign_id(&mut self, id: i64) {
        let starter = self.is_starter();
        self.id = id;
        self.name = if starter { Self::starter_name(id) } else { Self::order_name(id) };
    }

    pub fn total(&self) -> Money { self.sum + self.delivery_sum }

    pub fn state(&self) -> CartState {
        if self.is_canceled { CartState::Canceled }
        else if self.is_completed { CartState::Completed }
        else if self.is_shipped { CartState::Shipped }
        else if self.is_paid { CartState::Paid }
        else if self.payment_id.is_some() { CartState::AwaitingPayment }
        else { CartState::Created }
    }

    /// Checks the flag invariants: canceled excludes paid and shipped,
    /// completed implies shipped, shipped implies paid.
    pub fn check_invariants(&self) -> Result<(), CartError> {
        if self.is_canceled && (self.is_paid || self.is_shipped || self.is_completed) { return Err(CartError::FlagConflict); }
        if self.is_completed && !self.is_shipped { return Err(CartError::FlagConflict); }
        if self.is_shipped && !self.is_paid { return Err(CartError::FlagConflict); }
        if self.sum.is_negative() || self.delivery_sum.is_negative() { return Err(CartError::NegativeAmount); }
        Ok(())
    }

    /// Records the priced checkout on a cart that has not been submitted yet.
    pub fn apply_quote(&mut self, quote: &Quote, promo_code: Option<String>) -> Result<(), CartError> {
        self.ensure(CartState::Created, "checkout")?;
        self.sum = quote.items_total;
        self.delivery_sum = quote.delivery;
        self.promo_code = promo_code;
        self.touch();
        Ok(())
    }

    pub fn submit_checkout(&mut self, payment_id: impl Into<String>, confirmation_url: impl Into<String>) -> Result<(), CartError> {
        self.ensure(CartState::Created, "submit checkout")?;
        self.payment_id = Some(payment_id.into());
        self.confirmation_url = Some(confirmation_url.into());
        self.touch();
        self.raise_event(DomainEvent::Cart(CartEvent::CheckoutSubmitted { cart_id: self.id, total: self.total() }));
        Ok(())
    }

    pub fn mark_paid(&mut self) -> Result<PaidTransition, CartError> {
        let accrue_promo = self.promo_code.is_some() && !self.promo_gains_given;
        match self.state() {
            CartState::Canceled => Err(self.invalid("pay")),
            CartState::Paid | CartState::Shipped | CartState::Completed => Ok(PaidTransition::AlreadyPaid { accrue_promo }),
            CartState::Created | CartState::AwaitingPayment => {
                self.is_paid = true;
                self.touch();
                self.raise_event(DomainEvent::Cart(CartEvent::Paid { cart_id: self.id }));
                Ok(PaidTransition::Entered { accrue_promo })
            }
        }
    }

    /// Marks promo payouts as credited. Returns `false` when they already were.
    pub fn record_promo_gains(&mut self, gains: Money) -> bool {
        if self.promo_gains_given { return false; }
        self.promo_gains = gains;
        self.promo_gains_given = true;
        self.touch();
        true
    }

    pub fn mark_shipped(&mut self, tracking: Option<String>) -> Result<bool, CartError> {
        match self.state() {
            CartState::Paid => {
                self.is_shipped = true;
                if let Some(t) = &tracking { self.cdek_order_uuid.get_or_insert_with(|| t.clone()); }
                self.touch();
                self.raise_event(DomainEvent::Cart(CartEvent::Shipped { cart_id: self.id, tracking }));
                Ok(true)
            }
            CartState::Shipped | CartState::Completed => Ok(false),
            _ => Err(self.invalid("ship")),
        }
    }

    pub fn complete(&mut self) -> Result<bool, CartError> {
        match self.state() {
            CartState::Shipped => {
                self.is_completed = true;
                self.is_active = false;
                self.touch();
                self.raise_event(DomainEvent::Cart(CartEvent::Completed { cart_id: self.id }));
                Ok(true)
            }
            CartState::Completed => Ok(false),
            _ => Err(self.invalid("complete")),
        }
    }

    /// Cancels the cart. A paid or shipped cart can only be canceled by an
    /// admin (manager in the CRM); that clears the payment flags.
    pub fn cancel(&mut self, by_admin: bool) -> Result<bool, CartError> {
        match self.state() {
            CartState::Canceled => return Ok(false),
            CartState::Completed => return Err(self.invalid("cancel")),
            CartState::Paid | CartState::Shipped if !by_admin => return Err(self.invalid("cancel")),
            _ => {}
        }
        self.is_paid = false;
        self.is_shipped = false;
        self.is_canceled = true;
        self.is_active = false;
        self.touch();
        self.raise_event(DomainEvent::Cart(CartEvent::Canceled { cart_id: self.id }));
        Ok(true)
    }

    pub fn mirror_status(&mut self, status: impl Into<String>, is_active: bool) {
        self.status = status.into();
        self.is_active = is_active;
        self.touch();
        self.raise_event(DomainEvent::Cart(CartEvent::StatusMirrored { cart_id: self.id, status: self.status.clone(), is_active }));
    }

    /// Diff-applies the flags a CRM status implies. Only forward moves are
    /// applied; a status that does not imply a flag never clears it.
    /// Returns the payment transition when the cart newly became paid.
    pub fn apply_status_effect(&mut self, effect: StatusEffect) -> Result<Option<PaidTransition>, CartError> {
        if effect.canceled {
            self.cancel(true)?;
            return Ok(None);
        }
        let mut paid = None;
        if (effect.paid || effect.shipped || effect.completes) && !self.is_paid {
            paid = Some(self.mark_paid()?);
        }
        if (effect.shipped || effect.completes) && !self.is_shipped {
            self.mark_shipped(None)?;
        }
        if effect.completes {
            self.complete()?;
        }
        Ok(paid)
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }
    fn raise_event(&mut self, e: DomainEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }

    fn ensure(&self, expected: CartState, action: &'static str) -> Result<(), CartError> {
        if self.state() != expected { return Err(self.invalid(action)); }
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> CartError {
        CartError::InvalidTransition { cart_id: self.id, action, state: self.state() }
    }
}

/// One basket line priced from the current feature row.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PricedLine {
    pub product_onec_id: String,
    pub feature_onec_id: String,
    pub product_name: String,
    pub feature_name: String,
    pub unit_price: Money,
    pub quantity: Quantity,
    pub balance: i32,
}

impl PricedLine {
    pub fn from_catalog(product: &ProductWithFeatures, feature: &Feature, quantity: Quantity) -> Self {
        Self {
            product_onec_id: product.product.onec_id.clone(),
            feature_onec_id: feature.onec_id.clone(),
            product_name: product.product.name.clone(),
            feature_name: feature.name.clone(),
            unit_price: feature.price,
            quantity,
            balance: feature.balance,
        }
    }

    pub fn line_total(&self) -> Money { self.unit_price.multiply(self.quantity.value()) }
}

/// Server-side basket: lines are merged by (product, feature) and priced
/// from catalog rows, never from client totals.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Basket { lines: Vec<PricedLine> }

impl Basket {
    pub fn new() -> Self { Self::default() }
    pub fn lines(&self) -> &[PricedLine] { &self.lines }
    pub fn is_empty(&self) -> bool { self.lines.is_empty() }
    pub fn item_count(&self) -> u32 { self.lines.iter().map(|l| l.quantity.value()).sum() }

    pub fn add_item(&mut self, line: PricedLine) {
        if let Some(existing) = self.lines.iter_mut().find(|l| l.product_onec_id == line.product_onec_id && l.feature_onec_id == line.feature_onec_id) {
            existing.quantity = existing.quantity.add(line.quantity);
        } else {
            self.lines.push(line);
        }
    }

    pub fn subtotal(&self) -> Money { self.lines.iter().map(PricedLine::line_total).sum() }

    pub fn quote(&self, discount: Option<Percent>, delivery: Money) -> Quote {
        let subtotal = self.subtotal();
        let discount_pct = discount.unwrap_or(Percent::ZERO);
        let items_total = subtotal.discounted(discount_pct);
        Quote { subtotal, discount_pct, items_total, delivery, total: items_total + delivery }
    }
}

/// Priced checkout. `items_total` is what promo payouts are computed from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Quote {
    pub subtotal: Money,
    pub discount_pct: Percent,
    pub items_total: Money,
    pub delivery: Money,
    pub total: Money,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CartError {
    InvalidTransition { cart_id: i64, action: &'static str, state: CartState },
    FlagConflict,
    NegativeAmount,
}
impl std::error::Error for CartError {}
impl std::fmt::Display for CartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTransition { cart_id, action, state } => write!(f, "cannot {} cart {} in state {:?}", action, cart_id, state),
            Self::FlagConflict => write!(f, "lifecycle flags conflict"),
            Self::NegativeAmount => write!(f, "negative amount"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::product::fixtures;
    use rust_decimal_macros::dec;

    fn paid_cart(promo: bool) -> Cart {
        let mut cart = Cart::new(100);
        if promo { cart.promo_code = Some("SAVE10".into()); }
        cart.submit_checkout("pay-1", "https://pay").unwrap();
        cart.mark_paid().unwrap();
        cart
    }

    #[test]
    fn test_basket_merges_lines() {
        let product = ProductWithFeatures { product: fixtures::product("P1"), features: vec![fixtures::feature("P1", "F1", dec!(10), 5)] };
        let mut basket = Basket::new();
        let f = &product.features[0];
        basket.add_item(PricedLine::from_catalog(&product, f, Quantity::new(2).unwrap()));
        basket.add_item(PricedLine::from_catalog(&product, f, Quantity::new(1).unwrap()));
        assert_eq!(basket.lines().len(), 1);
        assert_eq!(basket.lines()[0].quantity.value(), 3); // Merged
        assert_eq!(basket.subtotal(), Money::new(dec!(30)));
    }

    #[test]
    fn test_quote_with_promo_and_delivery() {
        let product = ProductWithFeatures { product: fixtures::product("P1"), features: vec![fixtures::feature("P1", "F1", dec!(1000), 1)] };
        let mut basket = Basket::new();
        basket.add_item(PricedLine::from_catalog(&product, &product.features[0], Quantity::new(1).unwrap()));
        let quote = basket.quote(Some(Percent::new(dec!(10)).unwrap()), Money::new(dec!(295)));
        assert_eq!(quote.items_total, Money::new(dec!(900)));
        assert_eq!(quote.total, Money::new(dec!(1195)));
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let mut cart = Cart::new(100);
        assert_eq!(cart.state(), CartState::Created);
        cart.submit_checkout("pay-1", "https://pay").unwrap();
        assert_eq!(cart.state(), CartState::AwaitingPayment);
        assert_eq!(cart.mark_paid().unwrap(), PaidTransition::Entered { accrue_promo: false });
        assert!(cart.mark_shipped(Some("cdek-uuid".into())).unwrap());
        assert_eq!(cart.cdek_order_uuid.as_deref(), Some("cdek-uuid"));
        assert!(cart.complete().unwrap());
        assert_eq!(cart.state(), CartState::Completed);
        assert!(cart.check_invariants().is_ok());
        assert_eq!(cart.take_events().len(), 4);
    }

    #[test]
    fn test_repeat_payment_is_idempotent() {
        let mut cart = paid_cart(true);
        assert!(cart.record_promo_gains(Money::new(dec!(45))));
        assert_eq!(cart.mark_paid().unwrap(), PaidTransition::AlreadyPaid { accrue_promo: false });
        assert!(!cart.record_promo_gains(Money::new(dec!(45))));
    }

    #[test]
    fn test_paid_cart_cancel_requires_admin() {
        let mut cart = paid_cart(false);
        assert!(matches!(cart.cancel(false), Err(CartError::InvalidTransition { .. })));
        assert!(cart.cancel(true).unwrap());
        assert!(!cart.is_paid && cart.is_canceled);
        assert!(cart.check_invariants().is_ok());
    }

    #[test]
    fn test_inactive_shipped_cart_is_not_completed() {
        let mut cart = Cart::new(100);
        cart.submit_checkout("pay-1", "https://pay").unwrap();
        cart.mark_paid().unwrap();
        cart.mark_shipped(None).unwrap();
        cart.mirror_status("UNKNOWN(999999)", false);
        assert_eq!(cart.state(), CartState::Shipped);
        assert!(!cart.is_completed);

        // Still open for an admin cancel and for completion.
        let mut canceled = cart.clone();
        assert!(canceled.cancel(true).unwrap());
        assert_eq!(canceled.state(), CartState::Canceled);
        assert!(canceled.check_invariants().is_ok());

        assert!(cart.complete().unwrap());
        assert_eq!(cart.state(), CartState::Completed);
        assert!(matches!(cart.cancel(true), Err(CartError::InvalidTransition { .. })));
    }

    #[test]
    fn test_canceled_cart_cannot_be_paid() {
        let mut cart = Cart::new(1);
        cart.cancel(false).unwrap();
        assert!(matches!(cart.mark_paid(), Err(CartError::InvalidTransition { .. })));
        assert!(cart.mark_shipped(None).is_err());
    }

    #[test]
    fn test_status_effect_walks_forward() {
        let mut cart = Cart::new(1);
        cart.promo_code = Some("X".into());
        let paid = cart.apply_status_effect(StatusEffect { shipped: true, ..Default::default() }).unwrap();
        assert_eq!(paid, Some(PaidTransition::Entered { accrue_promo: true }));
        assert_eq!(cart.state(), CartState::Shipped);
        assert_eq!(cart.apply_status_effect(StatusEffect { paid: true, ..Default::default() }).unwrap(), None);
        assert_eq!(cart.state(), CartState::Shipped);
    }

    #[test]
    fn test_starter_names() {
        let mut cart = Cart::new(1);
        cart.name = Cart::starter_name(cart.id);
        assert!(cart.is_starter());
        cart.reassign_id(1234567);
        assert_eq!(cart.name, "начальная корзина #1234567");
        assert!(!Cart::is_starter_name("Заказ #1234567"));
        assert!((1_000_000..=9_999_999).contains(&Cart::random_id()));
    }
}
