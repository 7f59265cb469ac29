//! Domain events
use crate::domain::value_objects::Money;

#[derive(Clone, Debug, PartialEq)]
pub enum DomainEvent {
    Cart(CartEvent),
    Promo(PromoEvent),
}

#[derive(Clone, Debug, PartialEq)]
pub enum CartEvent {
    CheckoutSubmitted { cart_id: i64, total: Money },
    Paid { cart_id: i64 },
    Shipped { cart_id: i64, tracking: Option<String> },
    Completed { cart_id: i64 },
    Canceled { cart_id: i64 },
    StatusMirrored { cart_id: i64, status: String, is_active: bool },
}

#[derive(Clone, Debug, PartialEq)]
pub enum PromoEvent {
    Accrued { code: String, cart_id: Option<i64>, owner: Money, lvl1: Money, lvl2: Money },
}

impl DomainEvent {
    /// Emits the event to the log; the engines drain aggregates through this.
    pub fn log(&self) {
        match self {
            DomainEvent::Cart(CartEvent::CheckoutSubmitted { cart_id, total }) => {
                tracing::info!(cart_id, total = %total, "checkout submitted")
            }
            DomainEvent::Cart(CartEvent::Paid { cart_id }) => tracing::info!(cart_id, "cart paid"),
            DomainEvent::Cart(CartEvent::Shipped { cart_id, tracking }) => {
                tracing::info!(cart_id, tracking = tracking.as_deref().unwrap_or("-"), "cart shipped")
            }
            DomainEvent::Cart(CartEvent::Completed { cart_id }) => tracing::info!(cart_id, "cart completed"),
            DomainEvent::Cart(CartEvent::Canceled { cart_id }) => tracing::info!(cart_id, "cart canceled"),
            DomainEvent::Cart(CartEvent::StatusMirrored { cart_id, status, is_active }) => {
                tracing::debug!(cart_id, status = %status, is_active, "crm status mirrored")
            }
            DomainEvent::Promo(PromoEvent::Accrued { code, cart_id, owner, lvl1, lvl2 }) => tracing::info!(
                code = %code,
                cart_id = ?cart_id,
                owner = %owner,
                lvl1 = %lvl1,
                lvl2 = %lvl2,
                "promo accrued"
            ),
        }
    }
}
