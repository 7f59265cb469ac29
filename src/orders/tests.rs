use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use rust_decimal_macros::dec;

use super::delivery::DeliveryMode;
use super::gateways::CreatedPayment;
use super::*;
use crate::domain::aggregates::product::fixtures;
use crate::domain::aggregates::promo::fixtures::promo;

#[derive(Default)]
struct MemoryState {
    products: Vec<ProductWithFeatures>,
    promos: HashMap<String, PromoCode>,
    carts: HashMap<i64, Cart>,
    items: HashMap<i64, Vec<CartItem>>,
}

#[derive(Default)]
struct MemoryStore { state: Mutex<MemoryState> }

impl MemoryStore {
    fn cart(&self, id: i64) -> Cart { self.state.lock().unwrap().carts[&id].clone() }
    fn promo(&self, code: &str) -> PromoCode { self.state.lock().unwrap().promos[code].clone() }
}

fn items_for(cart_id: i64, lines: &[PricedLine]) -> Vec<CartItem> {
    lines
        .iter()
        .enumerate()
        .map(|(i, l)| CartItem {
            id: i as i64 + 1,
            cart_id,
            product_onec_id: l.product_onec_id.clone(),
            feature_onec_id: l.feature_onec_id.clone(),
            quantity: l.quantity.value() as i32,
        })
        .collect()
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn load_products(&self, onec_ids: &[String]) -> StoreResult<Vec<ProductWithFeatures>> {
        let st = self.state.lock().unwrap();
        Ok(st.products.iter().filter(|p| onec_ids.contains(&p.product.onec_id)).cloned().collect())
    }

    async fn find_promo(&self, code: &str) -> StoreResult<Option<PromoCode>> { Ok(self.state.lock().unwrap().promos.get(code).cloned()) }

    async fn find_cart(&self, cart_id: i64) -> StoreResult<Option<Cart>> { Ok(self.state.lock().unwrap().carts.get(&cart_id).cloned()) }

    async fn find_cart_by_payment(&self, payment_id: &str) -> StoreResult<Option<Cart>> {
        let st = self.state.lock().unwrap();
        Ok(st.carts.values().find(|c| c.payment_id.as_deref() == Some(payment_id)).cloned())
    }

    async fn cart_items(&self, cart_id: i64) -> StoreResult<Vec<CartItem>> {
        Ok(self.state.lock().unwrap().items.get(&cart_id).cloned().unwrap_or_default())
    }

    async fn insert_cart(&self, cart: &mut Cart, lines: &[PricedLine]) -> StoreResult<()> {
        let mut st = self.state.lock().unwrap();
        while st.carts.contains_key(&cart.id) {
            cart.reassign_id(Cart::random_id());
        }
        st.items.insert(cart.id, items_for(cart.id, lines));
        st.carts.insert(cart.id, cart.clone());
        Ok(())
    }

    async fn save_cart(&self, cart: &Cart, lines: &[PricedLine]) -> StoreResult<()> {
        let mut st = self.state.lock().unwrap();
        st.items.insert(cart.id, items_for(cart.id, lines));
        st.carts.insert(cart.id, cart.clone());
        Ok(())
    }

    async fn record_payment(&self, cart_id: i64, payment_id: &str, confirmation_url: &str) -> StoreResult<()> {
        let mut st = self.state.lock().unwrap();
        let cart = st.carts.get_mut(&cart_id).ok_or_else(|| StoreError::not_found("cart", cart_id))?;
        cart.submit_checkout(payment_id, confirmation_url)?;
        Ok(())
    }

    async fn set_crm_lead(&self, cart_id: i64, lead_id: i64) -> StoreResult<()> {
        let mut st = self.state.lock().unwrap();
        st.carts.get_mut(&cart_id).ok_or_else(|| StoreError::not_found("cart", cart_id))?.crm_lead_id = Some(lead_id);
        Ok(())
    }

    async fn confirm_payment(&self, cart_id: i64) -> StoreResult<PaymentSettlement> {
        let mut st = self.state.lock().unwrap();
        let mut cart = st.carts.get(&cart_id).cloned().ok_or_else(|| StoreError::not_found("cart", cart_id))?;
        let mut promo = cart.promo_code.as_ref().and_then(|c| st.promos.get(c).cloned());
        let settlement = settle_payment(&mut cart, promo.as_mut())?;
        if let Some(p) = promo {
            st.promos.insert(p.code.clone(), p);
        }
        st.carts.insert(cart_id, cart);
        Ok(settlement)
    }

    async fn apply_crm_status(&self, cart_id: i64, lead_id: i64, status: &MappedStatus) -> StoreResult<StatusSettlement> {
        let mut st = self.state.lock().unwrap();
        let mut cart = st.carts.get(&cart_id).cloned().ok_or_else(|| StoreError::not_found("cart", cart_id))?;
        let mut promo = cart.promo_code.as_ref().and_then(|c| st.promos.get(c).cloned());
        let settlement = settle_status(&mut cart, promo.as_mut(), status)?;
        cart.crm_lead_id.get_or_insert(lead_id);
        if let Some(p) = promo {
            st.promos.insert(p.code.clone(), p);
        }
        st.carts.insert(cart_id, cart);
        Ok(settlement)
    }

    async fn carts_awaiting_booking(&self) -> StoreResult<Vec<Cart>> {
        let st = self.state.lock().unwrap();
        Ok(st
            .carts
            .values()
            .filter(|c| c.state() == CartState::Paid && c.cdek_order_uuid.is_none() && c.delivery_service.as_deref() == Some("cdek"))
            .cloned()
            .collect())
    }

    async fn record_booking(&self, cart_id: i64, tracking: &str) -> StoreResult<bool> {
        let mut st = self.state.lock().unwrap();
        let cart = st.carts.get_mut(&cart_id).ok_or_else(|| StoreError::not_found("cart", cart_id))?;
        Ok(cart.mark_shipped(Some(tracking.to_string()))?)
    }
}

#[derive(Default)]
struct FakePayments { requests: Mutex<Vec<PaymentRequest>>, fail: AtomicBool }

#[async_trait]
impl PaymentGateway for FakePayments {
    async fn create_payment(&self, request: &PaymentRequest) -> Result<CreatedPayment, UpstreamError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(UpstreamError::Status { service: "yookassa", stage: "create_payment", status: 503, body: "busy".into() });
        }
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        let id = format!("pay-{}", requests.len());
        Ok(CreatedPayment { confirmation_url: format!("https://yoomoney.ru/checkout/{}", id), id, status: "pending".into() })
    }
}

#[derive(Default)]
struct FakeCrm {
    leads: Mutex<HashMap<i64, LeadSnapshot>>,
    drafts: Mutex<Vec<LeadDraft>>,
    tracking: Mutex<Vec<(i64, String)>>,
    fail_create: AtomicBool,
}

impl FakeCrm {
    fn set_status(&self, lead_id: i64, status_id: i64) { self.leads.lock().unwrap().get_mut(&lead_id).unwrap().status_id = status_id; }
}

#[async_trait]
impl CrmGateway for FakeCrm {
    async fn create_order_lead(&self, draft: &LeadDraft) -> Result<i64, UpstreamError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(UpstreamError::Status { service: "amocrm", stage: "create_lead", status: 500, body: String::new() });
        }
        let mut leads = self.leads.lock().unwrap();
        let id = 30_000 + leads.len() as i64;
        leads.insert(id, LeadSnapshot { id, name: draft.name.clone(), status_id: draft.status_id, price: draft.price, created_at: Utc::now() });
        self.drafts.lock().unwrap().push(draft.clone());
        Ok(id)
    }

    async fn lead(&self, lead_id: i64) -> Result<Option<LeadSnapshot>, UpstreamError> { Ok(self.leads.lock().unwrap().get(&lead_id).cloned()) }

    async fn find_order_lead(&self, cart_id: i64) -> Result<Option<LeadSnapshot>, UpstreamError> {
        Ok(self.leads.lock().unwrap().values().find(|l| cart_id_from_lead_name(&l.name) == Some(cart_id)).cloned())
    }

    async fn set_tracking(&self, lead_id: i64, tracking: &str) -> Result<(), UpstreamError> {
        self.tracking.lock().unwrap().push((lead_id, tracking.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct FakeCarrier { booked: Mutex<Vec<Shipment>>, fail_book: AtomicBool }

#[async_trait]
impl CarrierGateway for FakeCarrier {
    async fn quote(&self, _request: &TariffRequest) -> Result<Money, UpstreamError> { Ok(Money::new(dec!(295))) }

    async fn book(&self, shipment: &Shipment) -> Result<String, UpstreamError> {
        if self.fail_book.load(Ordering::SeqCst) {
            return Err(UpstreamError::Status { service: "cdek", stage: "orders", status: 502, body: String::new() });
        }
        self.booked.lock().unwrap().push(shipment.clone());
        Ok(format!("cdek-{}", shipment.cart_id))
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    payments: Arc<FakePayments>,
    crm: Arc<FakeCrm>,
    carrier: Arc<FakeCarrier>,
    engine: OrderEngine,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::default());
    {
        let mut st = store.state.lock().unwrap();
        st.products.push(ProductWithFeatures { product: fixtures::product("P1"), features: vec![fixtures::feature("P1", "F1", dec!(1000), 3)] });
        st.promos.insert("SAVE10".into(), promo("SAVE10", dec!(10), dec!(5)));
    }
    let payments = Arc::new(FakePayments::default());
    let crm = Arc::new(FakeCrm::default());
    let carrier = Arc::new(FakeCarrier::default());
    let engine = OrderEngine::new(
        store.clone(),
        payments.clone(),
        crm.clone(),
        carrier.clone(),
        OrderSettings { return_url: "https://t.me/shop_bot".into() },
    );
    Harness { store, payments, crm, carrier, engine }
}

fn line(qty: u32) -> LineRequest { LineRequest { id: "P1".into(), feature_id: "F1".into(), qty, name: None } }

fn request(qty: u32, promo_code: Option<&str>) -> CheckoutRequest {
    CheckoutRequest {
        checkout_data: CheckoutData { user_id: 100, cart_id: None, items: vec![line(qty)], promo_code: promo_code.map(Into::into), commentary: None },
        selected_delivery: DeliverySelection {
            mode: DeliveryMode::Door,
            tariff_code: Some(137),
            price: None,
            office_code: None,
            address: "ул. Ленина, 1, кв. 5".into(),
            city: Some("Москва".into()),
            city_code: Some(44),
            postal_code: Some("101000".into()),
        },
        selected_delivery_service: DeliveryService::Cdek,
        contact_info: ContactInfo { name: "Иван Петров".into(), phone: "+79990000000".into(), email: Some("ivan@example.com".into()) },
    }
}

#[tokio::test]
async fn test_happy_path_order() {
    let h = harness();
    let result = h.engine.checkout(request(1, Some("SAVE10"))).await.unwrap();
    assert!(result.confirmation_url.starts_with("https://"));

    let payment = h.payments.requests.lock().unwrap()[0].clone();
    assert_eq!(payment.amount, Money::new(dec!(1195)));
    assert_eq!(payment.receipt.total(), Money::new(dec!(1195)));

    let cart = h.store.cart(result.order_id);
    assert_eq!(cart.state(), CartState::AwaitingPayment);
    assert_eq!(cart.sum, Money::new(dec!(900)));
    assert_eq!(cart.delivery_sum, Money::new(dec!(295)));

    let draft = h.crm.drafts.lock().unwrap()[0].clone();
    assert_eq!(draft.name, format!("Заказ №{} с Приложения ТГ", result.order_id));
    assert_eq!(draft.status_id, status::CREATED);
    assert_eq!(draft.price, 1195);
    assert!(draft.note.contains("Итого к оплате: 1195.00 ₽"));
    assert!(cart.crm_lead_id.is_some());

    let settlement = h.engine.confirm_payment("pay-1").await.unwrap().unwrap();
    assert!(settlement.newly_paid);
    assert_eq!(settlement.accrual.unwrap().owner, Money::new(dec!(45)));

    let promo = h.store.promo("SAVE10");
    assert_eq!(promo.owner_amount_gained, Money::new(dec!(45)));
    assert_eq!(promo.times_used, 1);
    let cart = h.store.cart(result.order_id);
    assert!(cart.is_paid && cart.promo_gains_given);

    // Booked right after payment.
    assert_eq!(cart.state(), CartState::Shipped);
    assert_eq!(cart.cdek_order_uuid, Some(format!("cdek-{}", result.order_id)));
    assert_eq!(h.crm.tracking.lock().unwrap().len(), 1);

    let repeat = h.engine.confirm_payment("pay-1").await.unwrap().unwrap();
    assert!(!repeat.newly_paid);
    assert!(repeat.accrual.is_none());
    let promo = h.store.promo("SAVE10");
    assert_eq!(promo.owner_amount_gained, Money::new(dec!(45)));
    assert_eq!(promo.times_used, 1);
}

#[tokio::test]
async fn test_unknown_crm_status_deactivates_cart() {
    let h = harness();
    let result = h.engine.checkout(request(1, None)).await.unwrap();
    let lead_id = h.store.cart(result.order_id).crm_lead_id.unwrap();

    h.crm.set_status(lead_id, 999_999);
    let outcome = h.engine.reconcile_lead(lead_id).await.unwrap();
    let settlement = match outcome {
        ReconcileOutcome::Applied(s) => s,
        other => panic!("expected applied, got {:?}", other),
    };
    assert_eq!(settlement.status, "UNKNOWN(999999)");
    assert!(!settlement.is_active);

    let cart = h.store.cart(result.order_id);
    assert_eq!(cart.status, "UNKNOWN(999999)");
    assert!(!cart.is_active);
    assert!(!cart.is_paid);
}

#[tokio::test]
async fn test_unknown_crm_status_keeps_shipped_cart_open() {
    let h = harness();
    let result = h.engine.checkout(request(1, None)).await.unwrap();
    let lead_id = h.store.cart(result.order_id).crm_lead_id.unwrap();

    h.crm.set_status(lead_id, status::IN_DELIVERY);
    let ReconcileOutcome::Applied(s) = h.engine.reconcile_lead(lead_id).await.unwrap() else { panic!() };
    assert_eq!(s.state, CartState::Shipped);

    h.crm.set_status(lead_id, 999_999);
    let ReconcileOutcome::Applied(s) = h.engine.reconcile_lead(lead_id).await.unwrap() else { panic!() };
    assert_eq!(s.state, CartState::Shipped);
    assert!(!s.is_active);
    let cart = h.store.cart(result.order_id);
    assert!(cart.is_shipped && !cart.is_completed);

    // A manager closing the lead as lost still cancels it.
    h.crm.set_status(lead_id, status::LOST);
    let ReconcileOutcome::Applied(s) = h.engine.reconcile_lead(lead_id).await.unwrap() else { panic!() };
    assert_eq!(s.state, CartState::Canceled);
    assert!(!s.flags_rejected);
    let cart = h.store.cart(result.order_id);
    assert!(cart.is_canceled && !cart.is_paid && !cart.is_shipped);
}

#[tokio::test]
async fn test_crm_status_walks_flags_and_accrues_once() {
    let h = harness();
    let result = h.engine.checkout(request(1, Some("SAVE10"))).await.unwrap();
    let lead_id = h.store.cart(result.order_id).crm_lead_id.unwrap();

    h.crm.set_status(lead_id, status::IN_DELIVERY);
    let ReconcileOutcome::Applied(s) = h.engine.reconcile_cart(result.order_id).await.unwrap() else { panic!() };
    assert_eq!(s.state, CartState::Shipped);
    assert!(s.accrual.is_some());
    assert!(s.is_active);

    // Payment webhook arriving late does not accrue again.
    let late = h.engine.confirm_payment("pay-1").await.unwrap().unwrap();
    assert!(late.accrual.is_none());

    h.crm.set_status(lead_id, status::WON);
    let ReconcileOutcome::Applied(s) = h.engine.reconcile_lead(lead_id).await.unwrap() else { panic!() };
    assert_eq!(s.state, CartState::Completed);
    assert!(!s.is_active);
    assert_eq!(h.store.promo("SAVE10").times_used, 1);
}

#[tokio::test]
async fn test_conflicting_status_only_mirrors_label() {
    let h = harness();
    let result = h.engine.checkout(request(1, None)).await.unwrap();
    let lead_id = h.store.cart(result.order_id).crm_lead_id.unwrap();
    h.crm.set_status(lead_id, status::LOST);
    h.engine.reconcile_lead(lead_id).await.unwrap();
    assert_eq!(h.store.cart(result.order_id).state(), CartState::Canceled);

    h.crm.set_status(lead_id, status::PAID);
    let ReconcileOutcome::Applied(s) = h.engine.reconcile_lead(lead_id).await.unwrap() else { panic!() };
    assert!(s.flags_rejected);
    assert_eq!(s.state, CartState::Canceled);
    assert_eq!(s.status, "Оплачен");
    assert!(h.store.cart(result.order_id).check_invariants().is_ok());
}

#[tokio::test]
async fn test_payment_failure_aborts_checkout() {
    let h = harness();
    h.payments.fail.store(true, Ordering::SeqCst);
    let err = h.engine.checkout(request(1, None)).await.unwrap_err();
    assert!(matches!(err, OrderError::Upstream(ref e) if e.is_transient()));
    assert!(h.crm.drafts.lock().unwrap().is_empty());
    let st = h.store.state.lock().unwrap();
    assert!(st.carts.values().all(|c| c.state() == CartState::Created));
}

#[tokio::test]
async fn test_crm_failure_keeps_payment() {
    let h = harness();
    h.crm.fail_create.store(true, Ordering::SeqCst);
    let result = h.engine.checkout(request(1, None)).await.unwrap();
    let cart = h.store.cart(result.order_id);
    assert_eq!(cart.state(), CartState::AwaitingPayment);
    assert!(cart.crm_lead_id.is_none());
}

#[tokio::test]
async fn test_failed_booking_is_retried() {
    let h = harness();
    h.carrier.fail_book.store(true, Ordering::SeqCst);
    let result = h.engine.checkout(request(2, None)).await.unwrap();
    h.engine.confirm_payment("pay-1").await.unwrap();
    assert_eq!(h.store.cart(result.order_id).state(), CartState::Paid);

    h.carrier.fail_book.store(false, Ordering::SeqCst);
    assert_eq!(h.engine.retry_pending_bookings().await.unwrap(), 1);
    assert_eq!(h.store.cart(result.order_id).state(), CartState::Shipped);
    let shipment = h.carrier.booked.lock().unwrap()[0].clone();
    assert_eq!(shipment.package.weight, 358);
    assert_eq!(shipment.recipient.name, "Иван Петров");
    assert_eq!(h.engine.retry_pending_bookings().await.unwrap(), 0);
}

#[tokio::test]
async fn test_checkout_rejects_short_stock_and_unknown_promo() {
    let h = harness();
    let err = h.engine.checkout(request(4, None)).await.unwrap_err();
    assert!(matches!(err, OrderError::Validation { field: "items", .. }));
    let err = h.engine.checkout(request(1, Some("NOPE"))).await.unwrap_err();
    assert!(matches!(err, OrderError::Validation { field: "promo_code", .. }));
}

#[tokio::test]
async fn test_preview_prices_server_side() {
    let h = harness();
    let preview = h.engine.preview(&[line(1), line(1)], Some("SAVE10")).await.unwrap();
    assert_eq!(preview.lines.len(), 1);
    assert_eq!(preview.quote.subtotal, Money::new(dec!(2000)));
    assert_eq!(preview.quote.items_total, Money::new(dec!(1800)));
}

#[tokio::test]
async fn test_starter_cart_becomes_order_at_checkout() {
    let h = harness();
    let cart = h.engine.create_cart(&CartCreate { user_id: 100, items: vec![line(1)], promo_code: None, commentary: None, starter: true }).await.unwrap();
    assert!(cart.is_starter());

    let mut req = request(1, None);
    req.checkout_data.cart_id = Some(cart.id);
    let result = h.engine.checkout(req).await.unwrap();
    assert_eq!(result.order_id, cart.id);
    assert_eq!(h.store.cart(cart.id).name, Cart::order_name(cart.id));
}

#[test]
fn test_cart_id_from_lead_name() {
    assert_eq!(cart_id_from_lead_name("Заказ №1234567 с Приложения ТГ"), Some(1_234_567));
    assert_eq!(cart_id_from_lead_name("Заказ № 42"), Some(42));
    assert_eq!(cart_id_from_lead_name("Сделка без номера"), None);
}
