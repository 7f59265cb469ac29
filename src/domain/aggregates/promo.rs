//! Promo code aggregate: discount plus a three-tier referral payout.

use serde::{Deserialize, Serialize};
use crate::domain::events::{DomainEvent, PromoEvent};
use crate::domain::value_objects::{Money, Percent};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PromoCode {
    pub code: String,
    pub discount_pct: Percent,
    pub owner_name: String,
    pub owner_pct: Percent,
    pub owner_amount_gained: Money,
    pub lvl1_name: String,
    pub lvl1_pct: Percent,
    pub lvl1_amount_gained: Money,
    pub lvl2_name: String,
    pub lvl2_pct: Percent,
    pub lvl2_amount_gained: Money,
    pub times_used: i32,
}

/// Descriptor columns only. Imports write these and never touch counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromoDescriptor {
    pub code: String,
    pub discount_pct: Percent,
    pub owner_name: String,
    pub owner_pct: Percent,
    pub lvl1_name: String,
    pub lvl1_pct: Percent,
    pub lvl2_name: String,
    pub lvl2_pct: Percent,
}

/// Payouts credited for one paid amount.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Accrual { pub owner: Money, pub lvl1: Money, pub lvl2: Money }

impl Accrual {
    pub fn total(&self) -> Money { self.owner + self.lvl1 + self.lvl2 }
}

impl PromoCode {
    pub fn from_descriptor(d: PromoDescriptor) -> Self {
        Self {
            code: d.code, discount_pct: d.discount_pct,
            owner_name: d.owner_name, owner_pct: d.owner_pct, owner_amount_gained: Money::ZERO,
            lvl1_name: d.lvl1_name, lvl1_pct: d.lvl1_pct, lvl1_amount_gained: Money::ZERO,
            lvl2_name: d.lvl2_name, lvl2_pct: d.lvl2_pct, lvl2_amount_gained: Money::ZERO,
            times_used: 0,
        }
    }

    /// `init_price · (100 − discount_pct) / 100`, half-up to kopecks.
    pub fn apply_discount(&self, init_price: Money) -> Money { init_price.discounted(self.discount_pct) }

    pub fn accrual_for(&self, paid: Money) -> Accrual {
        Accrual { owner: paid.percent(self.owner_pct), lvl1: paid.percent(self.lvl1_pct), lvl2: paid.percent(self.lvl2_pct) }
    }

    /// Credits the three tiers for `paid` and counts one use.
    pub fn accrue(&mut self, paid: Money, cart_id: Option<i64>) -> Result<(Accrual, DomainEvent), PromoError> {
        if paid.is_negative() { return Err(PromoError::NegativeAmount); }
        let accrual = self.accrual_for(paid);
        self.owner_amount_gained += accrual.owner;
        self.lvl1_amount_gained += accrual.lvl1;
        self.lvl2_amount_gained += accrual.lvl2;
        self.times_used = self.times_used.checked_add(1).ok_or(PromoError::CounterOverflow)?;
        let event = DomainEvent::Promo(PromoEvent::Accrued {
            code: self.code.clone(), cart_id, owner: accrual.owner, lvl1: accrual.lvl1, lvl2: accrual.lvl2,
        });
        Ok((accrual, event))
    }

    pub fn update_descriptor(&mut self, d: &PromoDescriptor) {
        self.discount_pct = d.discount_pct;
        self.owner_name = d.owner_name.clone();
        self.owner_pct = d.owner_pct;
        self.lvl1_name = d.lvl1_name.clone();
        self.lvl1_pct = d.lvl1_pct;
        self.lvl2_name = d.lvl2_name.clone();
        self.lvl2_pct = d.lvl2_pct;
    }
}

const TRAILING_QUOTES: &[char] = &['\'', '"', '`', '«', '»', '“', '”', '‘', '’', '„'];

/// Expands `Base (Alias1, Alias2)` into `[Base, Alias1, Alias2]`.
///
/// Parentheses are stripped, quote-like punctuation trimmed from the ends
/// of every entry, empty entries dropped, duplicates collapsed keeping the
/// first occurrence.
pub fn expand_codes(raw: &str) -> Vec<String> {
    let (base, aliases) = match raw.find('(') {
        Some(open) => {
            let rest = &raw[open + 1..];
            let inner = rest.find(')').map(|close| &rest[..close]).unwrap_or(rest);
            (&raw[..open], inner)
        }
        None => (raw, ""),
    };
    let mut out: Vec<String> = Vec::new();
    for part in std::iter::once(base).chain(aliases.split(',')) {
        let cleaned = part.trim().trim_matches(|c: char| TRAILING_QUOTES.contains(&c) || c == '(' || c == ')').trim();
        if !cleaned.is_empty() && !out.iter().any(|c| c == cleaned) {
            out.push(cleaned.to_string());
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)] pub enum PromoError { NegativeAmount, CounterOverflow }
impl std::error::Error for PromoError {}
impl std::fmt::Display for PromoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self { Self::NegativeAmount => write!(f, "Negative amount"), Self::CounterOverflow => write!(f, "Usage counter overflow") }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use rust_decimal::Decimal;

    pub fn promo(code: &str, discount: Decimal, owner: Decimal) -> PromoCode {
        PromoCode::from_descriptor(PromoDescriptor {
            code: code.into(),
            discount_pct: Percent::new(discount).unwrap(),
            owner_name: "Owner".into(),
            owner_pct: Percent::new(owner).unwrap(),
            lvl1_name: String::new(),
            lvl1_pct: Percent::ZERO,
            lvl2_name: String::new(),
            lvl2_pct: Percent::ZERO,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::fixtures::promo;
    use rust_decimal_macros::dec;

    #[test]
    fn test_expand_aliases() {
        assert_eq!(expand_codes("Alice (Al, ALI)"), vec!["Alice", "Al", "ALI"]);
        assert_eq!(expand_codes("Bob'"), vec!["Bob"]);
        assert_eq!(expand_codes("«Eve» (Eve, EVE2\")"), vec!["Eve", "EVE2"]);
        assert!(expand_codes("  ").is_empty());
    }

    #[test]
    fn test_calculate_price() {
        let p = promo("SAVE10", dec!(10), dec!(5));
        assert_eq!(p.apply_discount(Money::new(dec!(1234.56))), Money::new(dec!(1111.10)));
    }

    #[test]
    fn test_accrue_tiers() {
        let mut p = promo("SAVE10", dec!(10), dec!(5));
        p.lvl1_pct = Percent::new(dec!(2)).unwrap();
        let (accrual, _) = p.accrue(Money::new(dec!(900)), Some(1)).unwrap();
        assert_eq!(accrual.owner, Money::new(dec!(45)));
        assert_eq!(accrual.lvl1, Money::new(dec!(18)));
        assert_eq!(accrual.total(), Money::new(dec!(63)));
        assert_eq!(p.times_used, 1);
        assert_eq!(p.owner_amount_gained, Money::new(dec!(45)));
    }

    #[test]
    fn test_descriptor_update_keeps_counters() {
        let mut p = promo("A", dec!(10), dec!(5));
        p.accrue(Money::new(dec!(100)), None).unwrap();
        let mut d = PromoDescriptor {
            code: "A".into(), discount_pct: Percent::new(dec!(20)).unwrap(), owner_name: "New".into(),
            owner_pct: Percent::ZERO, lvl1_name: String::new(), lvl1_pct: Percent::ZERO, lvl2_name: String::new(), lvl2_pct: Percent::ZERO,
        };
        p.update_descriptor(&d);
        assert_eq!(p.times_used, 1);
        assert_eq!(p.owner_amount_gained, Money::new(dec!(5)));
        d.owner_name.clear();
        assert_eq!(p.owner_name, "New");
    }
}
