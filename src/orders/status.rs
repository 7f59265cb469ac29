//! amoCRM pipeline statuses and what each implies for a cart.
//!
//! 142 and 143 are amoCRM's fixed "won" and "lost" stages; together they
//! form the completion set. Any other id outside this table is reported
//! as `UNKNOWN(<id>)` and treated as inactive.

use serde::Serialize;

use crate::domain::StatusEffect;

pub const CREATED: i64 = 71_552_190;
pub const PAID: i64 = 71_552_194;
pub const ASSEMBLING: i64 = 71_552_198;
pub const HANDED_TO_CARRIER: i64 = 71_552_202;
pub const IN_DELIVERY: i64 = 71_552_206;
pub const WON: i64 = 142;
pub const LOST: i64 = 143;

pub const COMPLETION_SET: [i64; 2] = [WON, LOST];

const NONE: StatusEffect = StatusEffect { paid: false, shipped: false, canceled: false, completes: false };
const PAID_EFFECT: StatusEffect = StatusEffect { paid: true, shipped: false, canceled: false, completes: false };
const SHIPPED_EFFECT: StatusEffect = StatusEffect { paid: true, shipped: true, canceled: false, completes: false };
const COMPLETED_EFFECT: StatusEffect = StatusEffect { paid: true, shipped: true, canceled: false, completes: true };
const CANCELED_EFFECT: StatusEffect = StatusEffect { paid: false, shipped: false, canceled: true, completes: false };

pub struct CrmStatus { pub id: i64, pub label: &'static str, pub effect: StatusEffect }

pub const STATUSES: [CrmStatus; 7] = [
    CrmStatus { id: CREATED, label: "Создан", effect: NONE },
    CrmStatus { id: PAID, label: "Оплачен", effect: PAID_EFFECT },
    CrmStatus { id: ASSEMBLING, label: "Собирается", effect: PAID_EFFECT },
    CrmStatus { id: HANDED_TO_CARRIER, label: "Передан в доставку", effect: SHIPPED_EFFECT },
    CrmStatus { id: IN_DELIVERY, label: "Доставляется", effect: SHIPPED_EFFECT },
    CrmStatus { id: WON, label: "Успешно реализовано", effect: COMPLETED_EFFECT },
    CrmStatus { id: LOST, label: "Закрыто и не реализовано", effect: CANCELED_EFFECT },
];

/// Statuses a lead counts as "paid" in for premium redemption.
pub const PAID_SET: [i64; 5] = [PAID, ASSEMBLING, HANDED_TO_CARRIER, IN_DELIVERY, WON];

pub fn lookup(status_id: i64) -> Option<&'static CrmStatus> { STATUSES.iter().find(|s| s.id == status_id) }

pub fn is_complete(status_id: i64) -> bool { COMPLETION_SET.contains(&status_id) }

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedStatus {
    pub status_id: i64,
    pub label: String,
    pub is_active: bool,
    pub known: bool,
    #[serde(skip)]
    pub effect: StatusEffect,
}

/// `is_active` is true only for a known status outside the completion set;
/// unknown statuses are inactive.
pub fn map_status(status_id: i64) -> MappedStatus {
    match lookup(status_id) {
        Some(s) => MappedStatus {
            status_id,
            label: s.label.to_string(),
            is_active: !is_complete(status_id),
            known: true,
            effect: s.effect,
        },
        None => MappedStatus {
            status_id,
            label: format!("UNKNOWN({})", status_id),
            is_active: false,
            known: false,
            effect: StatusEffect::default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_status_is_inactive() {
        let s = map_status(999_999);
        assert_eq!(s.label, "UNKNOWN(999999)");
        assert!(!s.is_active);
        assert!(!s.known);
        assert_eq!(s.effect, StatusEffect::default());
    }

    #[test]
    fn test_completion_set() {
        assert!(!map_status(WON).is_active);
        assert!(!map_status(LOST).is_active);
        assert!(map_status(CREATED).is_active);
        assert!(map_status(IN_DELIVERY).effect.shipped);
        assert_eq!(map_status(CREATED).label, "Создан");
    }
}
