//! Carts, cart items and promo codes.
//!
//! Lifecycle writes lock the cart row (`FOR UPDATE`) and, when an accrual
//! may be due, the promo row, then run the pure settlement functions from
//! `orders` inside the same transaction.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::Postgres;
use sqlx::{QueryBuilder, Transaction};

use super::{PgStore, StoreError, StoreResult};
use crate::domain::{Cart, CartItem, Feature, Money, PricedLine, Product, ProductWithFeatures, PromoCode, PromoDescriptor};
use crate::orders::report::{CartLineView, CartView};
use crate::orders::status::MappedStatus;
use crate::orders::{settle_payment, settle_status, OrderStore, PaymentSettlement, StatusSettlement};
use crate::promo::{PriceCalculation, PromoSink};

const CART_COLUMNS: &str = "id, user_id, name, phone, email, sum, delivery_sum, promo_gains, delivery_string, commentary, \
    promo_code, promo_gains_given, is_active, is_paid, is_canceled, is_shipped, is_completed, status, delivery_service, delivery_payload, \
    payment_id, confirmation_url, crm_lead_id, cdek_order_uuid, yandex_request_id, created_at, updated_at";

const PROMO_COLUMNS: &str = "code, discount_pct, owner_name, owner_pct, owner_amount_gained, lvl1_name, lvl1_pct, \
    lvl1_amount_gained, lvl2_name, lvl2_pct, lvl2_amount_gained, times_used";

const STARTER_FILTER: &str = "position('начальная' in lower(name)) = 0";

const ID_ATTEMPTS: usize = 8;
const LIST_LIMIT: i64 = 500;

/// Filters for the cart listings. Starter carts are always excluded.
#[derive(Debug, Clone, Default)]
pub struct CartFilter {
    pub user_id: Option<i64>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Matches the cart id, phone, email or status.
    pub query: Option<String>,
    pub limit: Option<i64>,
}

fn push_cart_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &CartFilter) {
    qb.push(" WHERE ");
    qb.push(STARTER_FILTER);
    if let Some(user_id) = filter.user_id {
        qb.push(" AND user_id = ");
        qb.push_bind(user_id);
    }
    if let Some(from) = filter.from {
        qb.push(" AND created_at >= ");
        qb.push_bind(from);
    }
    if let Some(to) = filter.to {
        qb.push(" AND created_at < ");
        qb.push_bind(to);
    }
    if let Some(q) = filter.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        let pattern = format!("%{}%", q.to_lowercase());
        qb.push(" AND (id::TEXT LIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR lower(coalesce(phone, '')) LIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR lower(coalesce(email, '')) LIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR lower(status) LIKE ");
        qb.push_bind(pattern);
        qb.push(")");
    }
}

async fn lock_cart(tx: &mut Transaction<'_, Postgres>, cart_id: i64) -> StoreResult<Cart> {
    sqlx::query_as::<_, Cart>(&format!("SELECT {} FROM carts WHERE id = $1 FOR UPDATE", CART_COLUMNS))
        .bind(cart_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::not_found("cart", cart_id))
}

/// The cart's promo row, locked, when an accrual may still be due.
async fn lock_promo_for(tx: &mut Transaction<'_, Postgres>, cart: &Cart) -> StoreResult<Option<PromoCode>> {
    let Some(code) = cart.promo_code.as_deref().filter(|_| !cart.promo_gains_given) else { return Ok(None) };
    let promo = sqlx::query_as::<_, PromoCode>(&format!("SELECT {} FROM promo_codes WHERE code = $1 FOR UPDATE", PROMO_COLUMNS))
        .bind(code)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(promo)
}

async fn save_lifecycle(tx: &mut Transaction<'_, Postgres>, cart: &Cart) -> StoreResult<()> {
    sqlx::query(
        "UPDATE carts SET promo_gains = $2, promo_gains_given = $3, is_active = $4, is_paid = $5, is_canceled = $6,
            is_shipped = $7, is_completed = $8, status = $9, crm_lead_id = $10, cdek_order_uuid = $11, updated_at = NOW()
         WHERE id = $1",
    )
    .bind(cart.id)
    .bind(cart.promo_gains)
    .bind(cart.promo_gains_given)
    .bind(cart.is_active)
    .bind(cart.is_paid)
    .bind(cart.is_canceled)
    .bind(cart.is_shipped)
    .bind(cart.is_completed)
    .bind(&cart.status)
    .bind(cart.crm_lead_id)
    .bind(&cart.cdek_order_uuid)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn save_counters(tx: &mut Transaction<'_, Postgres>, promo: &PromoCode) -> StoreResult<()> {
    sqlx::query(
        "UPDATE promo_codes SET owner_amount_gained = $2, lvl1_amount_gained = $3, lvl2_amount_gained = $4, times_used = $5
         WHERE code = $1",
    )
    .bind(&promo.code)
    .bind(promo.owner_amount_gained)
    .bind(promo.lvl1_amount_gained)
    .bind(promo.lvl2_amount_gained)
    .bind(promo.times_used)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Adds lines; a line already present gets its quantity incremented.
async fn write_items(tx: &mut Transaction<'_, Postgres>, cart_id: i64, lines: &[PricedLine]) -> StoreResult<()> {
    if lines.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO cart_items (cart_id, product_onec_id, feature_onec_id, quantity) ");
    qb.push_values(lines, |mut b, line| {
        b.push_bind(cart_id)
            .push_bind(&line.product_onec_id)
            .push_bind(&line.feature_onec_id)
            .push_bind(line.quantity.value() as i32);
    });
    qb.push(
        " ON CONFLICT (cart_id, product_onec_id, feature_onec_id)
          DO UPDATE SET quantity = cart_items.quantity + EXCLUDED.quantity",
    );
    qb.build().execute(&mut **tx).await?;
    Ok(())
}

impl PgStore {
    pub async fn cart(&self, cart_id: i64) -> StoreResult<Option<Cart>> {
        let cart = sqlx::query_as::<_, Cart>(&format!("SELECT {} FROM carts WHERE id = $1", CART_COLUMNS))
            .bind(cart_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(cart)
    }

    /// Non-starter carts, newest first.
    pub async fn carts(&self, filter: &CartFilter) -> StoreResult<Vec<Cart>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM carts", CART_COLUMNS));
        push_cart_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id LIMIT ");
        qb.push_bind(filter.limit.unwrap_or(LIST_LIMIT).clamp(1, LIST_LIMIT));
        let carts = qb.build_query_as::<Cart>().fetch_all(&self.pool).await?;
        Ok(carts)
    }

    pub async fn cart_views(&self, filter: &CartFilter) -> StoreResult<Vec<CartView>> {
        let carts = self.carts(filter).await?;
        self.attach_lines(carts).await
    }

    pub async fn cart_view(&self, cart_id: i64) -> StoreResult<Option<CartView>> {
        let Some(cart) = self.cart(cart_id).await? else { return Ok(None) };
        Ok(self.attach_lines(vec![cart]).await?.pop())
    }

    /// Loads items with their product, feature and promo rows in four
    /// queries for any number of carts.
    async fn attach_lines(&self, carts: Vec<Cart>) -> StoreResult<Vec<CartView>> {
        if carts.is_empty() {
            return Ok(vec![]);
        }
        let ids: Vec<i64> = carts.iter().map(|c| c.id).collect();
        let items = sqlx::query_as::<_, CartItem>(
            "SELECT id, cart_id, product_onec_id, feature_onec_id, quantity FROM cart_items WHERE cart_id = ANY($1) ORDER BY id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let product_ids: Vec<String> = items.iter().map(|i| i.product_onec_id.clone()).collect::<HashSet<_>>().into_iter().collect();
        let feature_ids: Vec<String> = items.iter().map(|i| i.feature_onec_id.clone()).collect::<HashSet<_>>().into_iter().collect();
        let promo_codes: Vec<String> = carts.iter().filter_map(|c| c.promo_code.clone()).collect::<HashSet<_>>().into_iter().collect();

        let products: HashMap<String, Product> = sqlx::query_as::<_, Product>(
            "SELECT id, onec_id, name, code, description, usage, expiration, category_onec_id FROM products WHERE onec_id = ANY($1)",
        )
        .bind(&product_ids)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|p| (p.onec_id.clone(), p))
        .collect();
        let features: HashMap<String, Feature> = sqlx::query_as::<_, Feature>(
            "SELECT onec_id, product_onec_id, name, code, file_id, price, balance FROM features WHERE onec_id = ANY($1)",
        )
        .bind(&feature_ids)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|f| (f.onec_id.clone(), f))
        .collect();
        let promos: HashMap<String, PromoCode> =
            sqlx::query_as::<_, PromoCode>(&format!("SELECT {} FROM promo_codes WHERE code = ANY($1)", PROMO_COLUMNS))
                .bind(&promo_codes)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|p| (p.code.clone(), p))
                .collect();

        let mut lines: HashMap<i64, Vec<CartLineView>> = HashMap::new();
        for item in items {
            let line = CartLineView {
                product: products.get(&item.product_onec_id).cloned(),
                feature: features.get(&item.feature_onec_id).cloned(),
                item,
            };
            lines.entry(line.item.cart_id).or_default().push(line);
        }
        Ok(carts
            .into_iter()
            .map(|cart| CartView {
                items: lines.remove(&cart.id).unwrap_or_default(),
                promo: cart.promo_code.as_ref().and_then(|c| promos.get(c).cloned()),
                cart,
            })
            .collect())
    }

    pub async fn promo_code(&self, code: &str) -> StoreResult<Option<PromoCode>> {
        let promo = sqlx::query_as::<_, PromoCode>(&format!("SELECT {} FROM promo_codes WHERE code = $1", PROMO_COLUMNS))
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(promo)
    }

    pub async fn promo_codes(&self) -> StoreResult<Vec<PromoCode>> {
        let promos = sqlx::query_as::<_, PromoCode>(&format!("SELECT {} FROM promo_codes ORDER BY code", PROMO_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        Ok(promos)
    }

    /// Discounted price for `init_price`; the payouts on the result and one
    /// use are credited in the same transaction.
    pub async fn calculate_price(&self, code: &str, init_price: Money) -> StoreResult<PriceCalculation> {
        if init_price.is_negative() {
            return Err(StoreError::Invalid { field: "init_price", message: "must not be negative".into() });
        }
        let mut tx = self.pool.begin().await?;
        let mut promo = sqlx::query_as::<_, PromoCode>(&format!("SELECT {} FROM promo_codes WHERE code = $1 FOR UPDATE", PROMO_COLUMNS))
            .bind(code)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("promo code", code))?;
        let result_price = promo.apply_discount(init_price);
        let (accrual, event) = promo.accrue(result_price, None)?;
        save_counters(&mut tx, &promo).await?;
        tx.commit().await?;
        event.log();
        Ok(PriceCalculation {
            code: promo.code,
            init_price,
            discount_pct: promo.discount_pct,
            result_price,
            accrual,
            times_used: promo.times_used,
        })
    }
}

#[async_trait]
impl PromoSink for PgStore {
    async fn replace_promos(&self, descriptors: &[PromoDescriptor]) -> StoreResult<(u64, u64)> {
        let mut tx = self.pool.begin().await?;
        let mut upserted = 0;
        for chunk in descriptors.chunks(500) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO promo_codes (code, discount_pct, owner_name, owner_pct, lvl1_name, lvl1_pct, lvl2_name, lvl2_pct) ",
            );
            qb.push_values(chunk, |mut b, d| {
                b.push_bind(&d.code)
                    .push_bind(d.discount_pct)
                    .push_bind(&d.owner_name)
                    .push_bind(d.owner_pct)
                    .push_bind(&d.lvl1_name)
                    .push_bind(d.lvl1_pct)
                    .push_bind(&d.lvl2_name)
                    .push_bind(d.lvl2_pct);
            });
            qb.push(
                " ON CONFLICT (code) DO UPDATE SET
                    discount_pct = EXCLUDED.discount_pct, owner_name = EXCLUDED.owner_name, owner_pct = EXCLUDED.owner_pct,
                    lvl1_name = EXCLUDED.lvl1_name, lvl1_pct = EXCLUDED.lvl1_pct,
                    lvl2_name = EXCLUDED.lvl2_name, lvl2_pct = EXCLUDED.lvl2_pct",
            );
            upserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        let codes: Vec<String> = descriptors.iter().map(|d| d.code.clone()).collect();
        let deleted = sqlx::query("DELETE FROM promo_codes WHERE NOT (code = ANY($1))")
            .bind(&codes)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok((upserted, deleted))
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn load_products(&self, onec_ids: &[String]) -> StoreResult<Vec<ProductWithFeatures>> { self.products_with_features(onec_ids).await }

    async fn find_promo(&self, code: &str) -> StoreResult<Option<PromoCode>> { self.promo_code(code).await }

    async fn find_cart(&self, cart_id: i64) -> StoreResult<Option<Cart>> { self.cart(cart_id).await }

    async fn find_cart_by_payment(&self, payment_id: &str) -> StoreResult<Option<Cart>> {
        let cart = sqlx::query_as::<_, Cart>(&format!("SELECT {} FROM carts WHERE payment_id = $1", CART_COLUMNS))
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(cart)
    }

    async fn cart_items(&self, cart_id: i64) -> StoreResult<Vec<CartItem>> {
        let items = sqlx::query_as::<_, CartItem>(
            "SELECT id, cart_id, product_onec_id, feature_onec_id, quantity FROM cart_items WHERE cart_id = $1 ORDER BY id",
        )
        .bind(cart_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn insert_cart(&self, cart: &mut Cart, lines: &[PricedLine]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO users (tg_id) VALUES ($1) ON CONFLICT (tg_id) DO NOTHING")
            .bind(cart.user_id)
            .execute(&mut *tx)
            .await?;

        for _ in 0..ID_ATTEMPTS {
            let done = sqlx::query(
                "INSERT INTO carts (id, user_id, name, phone, email, sum, delivery_sum, promo_gains, delivery_string, commentary,
                    promo_code, is_active, status, delivery_service, delivery_payload, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $16)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(cart.id)
            .bind(cart.user_id)
            .bind(&cart.name)
            .bind(&cart.phone)
            .bind(&cart.email)
            .bind(cart.sum)
            .bind(cart.delivery_sum)
            .bind(cart.promo_gains)
            .bind(&cart.delivery_string)
            .bind(&cart.commentary)
            .bind(&cart.promo_code)
            .bind(cart.is_active)
            .bind(&cart.status)
            .bind(&cart.delivery_service)
            .bind(&cart.delivery_payload)
            .bind(cart.created_at)
            .execute(&mut *tx)
            .await?;
            if done.rows_affected() == 1 {
                write_items(&mut tx, cart.id, lines).await?;
                tx.commit().await?;
                return Ok(());
            }
            cart.reassign_id(Cart::random_id());
        }
        Err(StoreError::Conflict("no free cart id".into()))
    }

    async fn save_cart(&self, cart: &Cart, lines: &[PricedLine]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let done = sqlx::query(
            "UPDATE carts SET name = $2, phone = $3, email = $4, sum = $5, delivery_sum = $6, delivery_string = $7,
                commentary = $8, promo_code = $9, delivery_service = $10, delivery_payload = $11, updated_at = NOW()
             WHERE id = $1 AND payment_id IS NULL AND NOT is_paid AND NOT is_canceled",
        )
        .bind(cart.id)
        .bind(&cart.name)
        .bind(&cart.phone)
        .bind(&cart.email)
        .bind(cart.sum)
        .bind(cart.delivery_sum)
        .bind(&cart.delivery_string)
        .bind(&cart.commentary)
        .bind(&cart.promo_code)
        .bind(&cart.delivery_service)
        .bind(&cart.delivery_payload)
        .execute(&mut *tx)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("cart {} can no longer be edited", cart.id)));
        }
        sqlx::query("DELETE FROM cart_items WHERE cart_id = $1").bind(cart.id).execute(&mut *tx).await?;
        write_items(&mut tx, cart.id, lines).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_payment(&self, cart_id: i64, payment_id: &str, confirmation_url: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let mut cart = lock_cart(&mut tx, cart_id).await?;
        cart.submit_checkout(payment_id, confirmation_url)?;
        sqlx::query("UPDATE carts SET payment_id = $2, confirmation_url = $3, updated_at = NOW() WHERE id = $1")
            .bind(cart_id)
            .bind(payment_id)
            .bind(confirmation_url)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_crm_lead(&self, cart_id: i64, lead_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE carts SET crm_lead_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(cart_id)
            .bind(lead_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn confirm_payment(&self, cart_id: i64) -> StoreResult<PaymentSettlement> {
        let mut tx = self.pool.begin().await?;
        let mut cart = lock_cart(&mut tx, cart_id).await?;
        let mut promo = lock_promo_for(&mut tx, &cart).await?;
        let settlement = settle_payment(&mut cart, promo.as_mut())?;
        save_lifecycle(&mut tx, &cart).await?;
        if let (Some(_), Some(promo)) = (&settlement.accrual, &promo) {
            save_counters(&mut tx, promo).await?;
        }
        tx.commit().await?;
        cart.take_events().iter().for_each(|e| e.log());
        Ok(settlement)
    }

    async fn apply_crm_status(&self, cart_id: i64, lead_id: i64, status: &MappedStatus) -> StoreResult<StatusSettlement> {
        let mut tx = self.pool.begin().await?;
        let mut cart = lock_cart(&mut tx, cart_id).await?;
        let mut promo = lock_promo_for(&mut tx, &cart).await?;
        let settlement = settle_status(&mut cart, promo.as_mut(), status)?;
        cart.crm_lead_id.get_or_insert(lead_id);
        save_lifecycle(&mut tx, &cart).await?;
        if let (Some(_), Some(promo)) = (&settlement.accrual, &promo) {
            save_counters(&mut tx, promo).await?;
        }
        tx.commit().await?;
        cart.take_events().iter().for_each(|e| e.log());
        Ok(settlement)
    }

    async fn carts_awaiting_booking(&self) -> StoreResult<Vec<Cart>> {
        let carts = sqlx::query_as::<_, Cart>(&format!(
            "SELECT {} FROM carts
             WHERE is_paid AND NOT is_shipped AND NOT is_canceled AND delivery_service = 'cdek' AND cdek_order_uuid IS NULL
             ORDER BY updated_at LIMIT 100",
            CART_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(carts)
    }

    async fn record_booking(&self, cart_id: i64, tracking: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let mut cart = lock_cart(&mut tx, cart_id).await?;
        let shipped = cart.mark_shipped(Some(tracking.to_string()))?;
        if shipped {
            save_lifecycle(&mut tx, &cart).await?;
        }
        tx.commit().await?;
        cart.take_events().iter().for_each(|e| e.log());
        Ok(shipped)
    }
}
