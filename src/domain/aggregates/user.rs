//! Users, redeemed order codes, favourites and per-bot token usage.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cut-off used when a moderation block has no end.
pub fn blocked_forever() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 0, 0, 0).single().unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub tg_id: i64,
    pub username: Option<String>,
    pub name: Option<String>,
    pub surname: Option<String>,
    pub photo_url: Option<String>,
    pub tg_phone: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub thread_id: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub premium_until: Option<DateTime<Utc>>,
    pub premium_requests: i32,
    pub blocked_until: Option<DateTime<Utc>>,
    pub muted_until: Option<DateTime<Utc>>,
    pub muted_chat_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(tg_id: i64) -> Self {
        Self {
            tg_id, username: None, name: None, surname: None, photo_url: None, tg_phone: None, phone: None,
            email: None, thread_id: None, input_tokens: 0, output_tokens: 0, premium_until: None,
            premium_requests: 0, blocked_until: None, muted_until: None, muted_chat_id: None, created_at: Utc::now(),
        }
    }

    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool { self.blocked_until.is_some_and(|b| b > now) }
    pub fn has_premium_window(&self, now: DateTime<Utc>) -> bool { self.premium_until.is_some_and(|p| p > now) }
    pub fn has_verified_phone(&self) -> bool { self.tg_phone.as_deref().is_some_and(|p| !p.trim().is_empty()) }

    pub fn display_name(&self) -> String {
        let full = [self.name.as_deref(), self.surname.as_deref()].into_iter().flatten().collect::<Vec<_>>().join(" ");
        if !full.trim().is_empty() { return full; }
        self.username.clone().map(|u| format!("@{}", u)).unwrap_or_else(|| self.tg_id.to_string())
    }

    /// Extends the premium window by `days` starting from the later of now
    /// and the current end.
    pub fn extend_premium(&mut self, days: i64, now: DateTime<Utc>) {
        let start = self.premium_until.filter(|p| *p > now).unwrap_or(now);
        self.premium_until = Some(start + Duration::days(days));
    }

    /// `days == 0` blocks forever.
    pub fn block_for_days(&mut self, days: u32, now: DateTime<Utc>) {
        self.blocked_until = Some(if days == 0 { blocked_forever() } else { now + Duration::days(i64::from(days)) });
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsedCode {
    pub id: i64,
    pub code: String,
    pub user_id: i64,
    pub price: crate::domain::value_objects::Money,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Favourite { pub user_id: i64, pub product_onec_id: String, pub created_at: DateTime<Utc> }

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "bot_enum", rename_all = "lowercase")]
pub enum BotKind { Dose, Professor, New }

impl BotKind {
    pub const ALL: [BotKind; 3] = [BotKind::Dose, BotKind::Professor, BotKind::New];

    pub fn as_str(&self) -> &'static str {
        match self { Self::Dose => "dose", Self::Professor => "professor", Self::New => "new" }
    }

    /// Bots that run on the cheap model and share the free quota.
    pub fn is_free_tier(&self) -> bool { matches!(self, Self::Dose | Self::Professor) }

    pub fn rates(&self) -> TokenRates {
        match self {
            Self::New => TokenRates { input_per_million: Decimal::new(2, 0), output_per_million: Decimal::new(8, 0) },
            Self::Dose | Self::Professor => TokenRates { input_per_million: Decimal::new(40, 2), output_per_million: Decimal::new(160, 2) },
        }
    }
}

impl fmt::Display for BotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for BotKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dose" => Ok(Self::Dose),
            "professor" => Ok(Self::Professor),
            "new" => Ok(Self::New),
            other => Err(format!("unknown bot '{}'", other)),
        }
    }
}

/// USD per million tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenRates { pub input_per_million: Decimal, pub output_per_million: Decimal }

impl TokenRates {
    pub fn input_cost(&self, tokens: i64) -> Decimal { cost(tokens, self.input_per_million) }
    pub fn output_cost(&self, tokens: i64) -> Decimal { cost(tokens, self.output_per_million) }
}

fn cost(tokens: i64, per_million: Decimal) -> Decimal {
    (Decimal::from(tokens) * per_million / Decimal::from(1_000_000)).round_dp(6)
}

/// Daily (user, date, bot) rollup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserTokenUsage {
    pub id: i64,
    pub user_id: i64,
    pub date: NaiveDate,
    pub bot: BotKind,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_requests: i32,
    pub input_cost_usd: Decimal,
    pub output_cost_usd: Decimal,
}

impl UserTokenUsage {
    pub fn empty(user_id: i64, date: NaiveDate, bot: BotKind) -> Self {
        Self { id: 0, user_id, date, bot, input_tokens: 0, output_tokens: 0, total_requests: 0, input_cost_usd: Decimal::ZERO, output_cost_usd: Decimal::ZERO }
    }

    /// Adds one request worth of tokens and recomputes costs.
    pub fn add_turn(&mut self, input_tokens: i64, output_tokens: i64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.total_requests += 1;
        self.recompute_costs();
    }

    pub fn recompute_costs(&mut self) {
        let rates = self.bot.rates();
        self.input_cost_usd = rates.input_cost(self.input_tokens);
        self.output_cost_usd = rates.output_cost(self.output_tokens);
    }

    pub fn total_cost_usd(&self) -> Decimal { self.input_cost_usd + self.output_cost_usd }
}

/// Aggregated usage over any window.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageTotals {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_requests: i64,
    pub input_cost_usd: Decimal,
    pub output_cost_usd: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rates() {
        assert_eq!(BotKind::New.rates().input_cost(1_000_000), dec!(2));
        assert_eq!(BotKind::New.rates().output_cost(500_000), dec!(4));
        assert_eq!(BotKind::Professor.rates().input_cost(250_000), dec!(0.1));
        assert_eq!(BotKind::Dose.rates().output_cost(1_000), dec!(0.0016));
    }

    #[test]
    fn test_usage_add_turn_recomputes() {
        let mut u = UserTokenUsage::empty(1, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), BotKind::New);
        u.add_turn(1_000_000, 1_000_000);
        u.add_turn(0, 0);
        assert_eq!(u.total_requests, 2);
        assert_eq!(u.total_cost_usd(), dec!(10));
    }

    #[test]
    fn test_block_and_premium() {
        let now = Utc::now();
        let mut user = User::new(5);
        assert!(!user.is_blocked(now));
        user.block_for_days(3, now);
        assert!(user.is_blocked(now + Duration::days(2)));
        assert!(!user.is_blocked(now + Duration::days(4)));
        user.block_for_days(0, now);
        assert_eq!(user.blocked_until, Some(blocked_forever()));

        user.extend_premium(30, now);
        user.extend_premium(30, now);
        assert_eq!(user.premium_until, Some(now + Duration::days(60)));
        assert!(user.has_premium_window(now));
    }

    #[test]
    fn test_bot_kind_parse() {
        assert_eq!("professor".parse::<BotKind>().unwrap(), BotKind::Professor);
        assert!("other".parse::<BotKind>().is_err());
        assert_eq!(serde_json::to_string(&BotKind::New).unwrap(), "\"new\"");
    }

    #[test]
    fn test_display_name() {
        let mut user = User::new(7);
        assert_eq!(user.display_name(), "7");
        user.username = Some("peter".into());
        assert_eq!(user.display_name(), "@peter");
        user.name = Some("Пётр".into());
        assert_eq!(user.display_name(), "Пётр");
    }
}
