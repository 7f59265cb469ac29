//! Cart read model and the plain-text summaries admins get from the bots.

use std::fmt::Write as _;

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;

use crate::domain::{Cart, CartItem, CartState, Feature, Money, Product, PromoCode, User};

const MSK_OFFSET_SECS: i32 = 3 * 3600;

/// Cart with its lines, their product and feature rows and the promo code
/// eagerly loaded.
#[derive(Debug, Clone, Serialize)]
pub struct CartView {
    #[serde(flatten)]
    pub cart: Cart,
    pub items: Vec<CartLineView>,
    pub promo: Option<PromoCode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartLineView {
    #[serde(flatten)]
    pub item: CartItem,
    pub product: Option<Product>,
    pub feature: Option<Feature>,
}

/// Moscow wall-clock time (UTC+3, no DST).
pub fn moscow_time(ts: DateTime<Utc>) -> String {
    match FixedOffset::east_opt(MSK_OFFSET_SECS) {
        Some(msk) => ts.with_timezone(&msk).format("%d.%m.%Y %H:%M").to_string(),
        None => ts.format("%d.%m.%Y %H:%M UTC").to_string(),
    }
}

fn state_label(state: CartState) -> &'static str {
    match state {
        CartState::Created => "создан",
        CartState::AwaitingPayment => "ожидает оплаты",
        CartState::Paid => "оплачен",
        CartState::Shipped => "передан в доставку",
        CartState::Completed => "завершён",
        CartState::Canceled => "отменён",
    }
}

pub fn user_carts_summary(user_id: i64, user: Option<&User>, carts: &[CartView]) -> String {
    let mut out = String::new();
    let who = user.map(User::display_name).unwrap_or_else(|| user_id.to_string());
    let _ = writeln!(out, "Пользователь: {} (tg_id {})", who, user_id);
    if carts.is_empty() {
        let _ = writeln!(out, "Заказов нет");
        return out;
    }

    let paid: Vec<&CartView> = carts.iter().filter(|c| c.cart.is_paid).collect();
    let canceled = carts.iter().filter(|c| c.cart.is_canceled).count();
    let spend: Money = paid.iter().map(|c| c.cart.total()).sum();
    let _ = writeln!(
        out,
        "Заказов: {} (оплачено {}, отменено {}, прочие {})",
        carts.len(),
        paid.len(),
        canceled,
        carts.len() - paid.len() - canceled
    );
    let _ = writeln!(out, "Сумма оплаченных: {}", spend);
    if let Some(promo) = carts.iter().rev().find_map(|c| c.cart.promo_code.as_deref()) {
        let _ = writeln!(out, "Последний промокод: {}", promo);
    }
    if let Some(last) = carts.iter().max_by_key(|c| c.cart.created_at) {
        let _ = writeln!(
            out,
            "Последний заказ: #{} от {} (МСК), {}, {}",
            last.cart.id,
            moscow_time(last.cart.created_at),
            state_label(last.cart.state()),
            last.cart.total()
        );
    }
    out
}

pub fn cart_analysis(view: &CartView) -> String {
    let cart = &view.cart;
    let mut out = String::new();
    let _ = writeln!(out, "{} от {} (МСК)", Cart::order_name(cart.id), moscow_time(cart.created_at));
    let _ = writeln!(out, "Пользователь: {}", cart.user_id);
    let status = if cart.status.is_empty() { "-" } else { cart.status.as_str() };
    let _ = writeln!(out, "Статус: {} ({})", status, state_label(cart.state()));

    let _ = writeln!(out, "Товары:");
    for line in &view.items {
        let product = line.product.as_ref().map(|p| p.name.as_str()).unwrap_or(line.item.product_onec_id.as_str());
        let feature = line.feature.as_ref().map(|f| f.name.as_str()).unwrap_or(line.item.feature_onec_id.as_str());
        match &line.feature {
            Some(f) => {
                let _ = writeln!(out, "- {} {} × {} по {}", product, feature, line.item.quantity, f.price);
            }
            None => {
                let _ = writeln!(out, "- {} {} × {}", product, feature, line.item.quantity);
            }
        }
    }

    let _ = writeln!(out, "Сумма товаров: {}", cart.sum);
    match (&cart.promo_code, &view.promo) {
        (Some(code), Some(p)) => {
            let _ = writeln!(out, "Промокод: {} (-{}%), начислено {}", code, p.discount_pct.value().normalize(), cart.promo_gains);
        }
        (Some(code), None) => {
            let _ = writeln!(out, "Промокод: {}", code);
        }
        _ => {}
    }
    let delivery = if cart.delivery_string.is_empty() { "-" } else { cart.delivery_string.as_str() };
    let _ = writeln!(out, "Доставка: {}, {}", delivery, cart.delivery_sum);
    if let Some(uuid) = &cart.cdek_order_uuid {
        let _ = writeln!(out, "Трек СДЭК: {}", uuid);
    }
    let _ = writeln!(out, "Итого: {}", cart.total());
    let contacts: Vec<&str> = [cart.phone.as_deref(), cart.email.as_deref()].into_iter().flatten().collect();
    if !contacts.is_empty() {
        let _ = writeln!(out, "Контакты: {}", contacts.join(", "));
    }
    if !cart.commentary.trim().is_empty() {
        let _ = writeln!(out, "Комментарий: {}", cart.commentary.trim());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn view(id: i64, paid: bool, created_at: DateTime<Utc>) -> CartView {
        let mut cart = Cart::new(100);
        cart.reassign_id(id);
        cart.sum = Money::new(dec!(900));
        cart.delivery_sum = Money::new(dec!(295));
        cart.created_at = created_at;
        if paid {
            cart.submit_checkout("pay", "https://pay").unwrap();
            cart.mark_paid().unwrap();
        }
        CartView { cart, items: vec![], promo: None }
    }

    #[test]
    fn test_moscow_projection() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 21, 30, 0).unwrap();
        assert_eq!(moscow_time(ts), "02.03.2024 00:30");
    }

    #[test]
    fn test_user_summary_counts() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let carts = vec![view(1_000_001, true, t), view(1_000_002, false, t + chrono::Duration::days(1))];
        let text = user_carts_summary(100, None, &carts);
        assert!(text.contains("Заказов: 2 (оплачено 1, отменено 0, прочие 1)"));
        assert!(text.contains("Сумма оплаченных: 1195.00 ₽"));
        assert!(text.contains("Последний заказ: #1000002 от 02.03.2024 12:00 (МСК)"));
    }

    #[test]
    fn test_cart_analysis_lines() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut v = view(1_234_567, true, t);
        v.cart.promo_code = Some("SAVE10".into());
        v.items.push(CartLineView {
            item: CartItem { id: 1, cart_id: 1_234_567, product_onec_id: "P1".into(), feature_onec_id: "F1".into(), quantity: 2 },
            product: None,
            feature: None,
        });
        let text = cart_analysis(&v);
        assert!(text.starts_with("Заказ #1234567 от 01.03.2024 12:00 (МСК)"));
        assert!(text.contains("- P1 F1 × 2"));
        assert!(text.contains("Промокод: SAVE10"));
        assert!(text.contains("Итого: 1195.00 ₽"));
    }
}
