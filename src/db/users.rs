//! Users, token metering, redeemed order codes, favourites and mutes.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use sqlx::postgres::Postgres;
use sqlx::{QueryBuilder, Transaction};
use validator::Validate;

use super::{PgStore, StoreError, StoreResult};
use crate::assistant::{MeteringError, MeteringStore, UserPatch};
use crate::domain::{BotKind, Money, UsageTotals, UsedCode, User, UserTokenUsage};

const USER_COLUMNS: &str = "tg_id, username, name, surname, photo_url, tg_phone, phone, email, thread_id, input_tokens, \
    output_tokens, premium_until, premium_requests, blocked_until, muted_until, muted_chat_id, created_at";

const USAGE_COLUMNS: &str =
    "id, user_id, date, bot, input_tokens, output_tokens, total_requests, input_cost_usd, output_cost_usd";

/// Columns a user lookup may filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserColumn { TgId, Username, Phone, TgPhone, Email, ThreadId }

impl UserColumn {
    fn sql(&self) -> &'static str {
        match self {
            Self::TgId => "tg_id",
            Self::Username => "username",
            Self::Phone => "phone",
            Self::TgPhone => "tg_phone",
            Self::Email => "email",
            Self::ThreadId => "thread_id",
        }
    }
}

impl std::str::FromStr for UserColumn {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| StoreError::Invalid { field: "column_name", message: format!("cannot filter users by '{}'", s) })
    }
}

/// Profile fields sent by a bot on every contact.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UserUpsert {
    pub tg_id: i64,
    pub username: Option<String>,
    pub name: Option<String>,
    pub surname: Option<String>,
    pub photo_url: Option<String>,
    pub tg_phone: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
}

/// Usage window; both ends optional, `to` inclusive.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UsageWindow {
    pub user_id: Option<i64>,
    pub bot: Option<BotKind>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

fn push_usage_filter(qb: &mut QueryBuilder<'_, Postgres>, window: &UsageWindow) {
    qb.push(" WHERE TRUE");
    if let Some(user_id) = window.user_id {
        qb.push(" AND user_id = ");
        qb.push_bind(user_id);
    }
    if let Some(bot) = window.bot {
        qb.push(" AND bot = ");
        qb.push_bind(bot);
    }
    if let Some(from) = window.from {
        qb.push(" AND date >= ");
        qb.push_bind(from);
    }
    if let Some(to) = window.to {
        qb.push(" AND date <= ");
        qb.push_bind(to);
    }
}

/// Adds one turn to the `(user, date, bot)` rollup, recomputing costs
/// from the summed token counts.
async fn write_usage(
    tx: &mut Transaction<'_, Postgres>,
    tg_id: i64,
    bot: BotKind,
    date: NaiveDate,
    input_tokens: i64,
    output_tokens: i64,
) -> StoreResult<UserTokenUsage> {
    let mut first = UserTokenUsage::empty(tg_id, date, bot);
    first.add_turn(input_tokens, output_tokens);
    let rates = bot.rates();
    let usage = sqlx::query_as::<_, UserTokenUsage>(&format!(
        "INSERT INTO user_token_usage (user_id, date, bot, input_tokens, output_tokens, total_requests, input_cost_usd, output_cost_usd)
         VALUES ($1, $2, $3, $4, $5, 1, $6, $7)
         ON CONFLICT (user_id, date, bot) DO UPDATE SET
            input_tokens = user_token_usage.input_tokens + EXCLUDED.input_tokens,
            output_tokens = user_token_usage.output_tokens + EXCLUDED.output_tokens,
            total_requests = user_token_usage.total_requests + 1,
            input_cost_usd = ROUND((user_token_usage.input_tokens + EXCLUDED.input_tokens) * $8 / 1000000, 6),
            output_cost_usd = ROUND((user_token_usage.output_tokens + EXCLUDED.output_tokens) * $9 / 1000000, 6)
         RETURNING {}",
        USAGE_COLUMNS
    ))
    .bind(tg_id)
    .bind(date)
    .bind(bot)
    .bind(input_tokens)
    .bind(output_tokens)
    .bind(first.input_cost_usd)
    .bind(first.output_cost_usd)
    .bind(rates.input_per_million)
    .bind(rates.output_per_million)
    .fetch_one(&mut **tx)
    .await?;
    Ok(usage)
}

async fn ensure_user_row(tx: &mut Transaction<'_, Postgres>, tg_id: i64) -> StoreResult<()> {
    sqlx::query("INSERT INTO users (tg_id) VALUES ($1) ON CONFLICT (tg_id) DO NOTHING")
        .bind(tg_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

impl PgStore {
    pub async fn user(&self, tg_id: i64) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE tg_id = $1", USER_COLUMNS))
            .bind(tg_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Users whose `column` equals `value`.
    pub async fn users_by(&self, column: UserColumn, value: &str) -> StoreResult<Vec<User>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM users WHERE ", USER_COLUMNS));
        qb.push(column.sql());
        qb.push(" = ");
        match column {
            UserColumn::TgId => {
                let tg_id: i64 = value.trim().parse().map_err(|_| StoreError::Invalid {
                    field: "value",
                    message: format!("'{}' is not a telegram id", value),
                })?;
                qb.push_bind(tg_id);
            }
            _ => {
                qb.push_bind(value.to_string());
            }
        }
        qb.push(" ORDER BY tg_id");
        let users = qb.build_query_as::<User>().fetch_all(&self.pool).await?;
        Ok(users)
    }

    pub async fn users(&self, limit: i64, offset: i64) -> StoreResult<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users ORDER BY created_at DESC, tg_id LIMIT $1 OFFSET $2",
            USER_COLUMNS
        ))
        .bind(limit.clamp(1, 1000))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    /// Case-insensitive match on id, username, names, phones and email.
    pub async fn search_users(&self, query: &str, limit: i64) -> StoreResult<Vec<User>> {
        let pattern = format!("%{}%", query.trim().to_lowercase());
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users
             WHERE tg_id::TEXT LIKE $1 OR lower(coalesce(username, '')) LIKE $1 OR lower(coalesce(name, '')) LIKE $1
                OR lower(coalesce(surname, '')) LIKE $1 OR coalesce(phone, '') LIKE $1 OR coalesce(tg_phone, '') LIKE $1
                OR lower(coalesce(email, '')) LIKE $1
             ORDER BY tg_id LIMIT $2",
            USER_COLUMNS
        ))
        .bind(pattern)
        .bind(limit.clamp(1, 200))
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    /// Inserts the user or refreshes the profile fields that were sent.
    pub async fn upsert_user(&self, profile: &UserUpsert) -> StoreResult<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (tg_id, username, name, surname, photo_url, tg_phone, email)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (tg_id) DO UPDATE SET
                username = COALESCE(EXCLUDED.username, users.username),
                name = COALESCE(EXCLUDED.name, users.name),
                surname = COALESCE(EXCLUDED.surname, users.surname),
                photo_url = COALESCE(EXCLUDED.photo_url, users.photo_url),
                tg_phone = COALESCE(EXCLUDED.tg_phone, users.tg_phone),
                email = COALESCE(EXCLUDED.email, users.email)
             RETURNING {}",
            USER_COLUMNS
        ))
        .bind(profile.tg_id)
        .bind(&profile.username)
        .bind(&profile.name)
        .bind(&profile.surname)
        .bind(&profile.photo_url)
        .bind(&profile.tg_phone)
        .bind(&profile.email)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)
        .map_err(unique_as_conflict)?;
        Ok(user)
    }

    pub async fn update_user(&self, tg_id: i64, patch: &UserPatch) -> StoreResult<User> {
        if patch.is_empty() {
            return self.user(tg_id).await?.ok_or_else(|| StoreError::not_found("user", tg_id));
        }
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE users SET ");
        let mut set = qb.separated(", ");
        macro_rules! set_field {
            ($($field:ident),*) => {
                $( if let Some(v) = &patch.$field {
                    set.push(concat!(stringify!($field), " = "));
                    set.push_bind_unseparated(v.clone());
                } )*
            };
        }
        set_field!(
            username, name, surname, photo_url, tg_phone, phone, email, thread_id, premium_until, premium_requests,
            blocked_until, muted_until, muted_chat_id
        );
        qb.push(" WHERE tg_id = ");
        qb.push_bind(tg_id);
        qb.push(format!(" RETURNING {}", USER_COLUMNS));
        qb.build_query_as::<User>()
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)
            .map_err(unique_as_conflict)?
            .ok_or_else(|| StoreError::not_found("user", tg_id))
    }

    pub async fn update_user_name(&self, tg_id: i64, name: Option<&str>, surname: Option<&str>) -> StoreResult<User> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET name = $2, surname = $3 WHERE tg_id = $1 RETURNING {}",
            USER_COLUMNS
        ))
        .bind(tg_id)
        .bind(name)
        .bind(surname)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("user", tg_id))
    }

    /// Adds tokens to the user's lifetime counters and, when `bot` is given,
    /// to today's rollup in the same transaction.
    pub async fn increment_tokens(
        &self,
        tg_id: i64,
        input_tokens: i64,
        output_tokens: i64,
        bot: Option<BotKind>,
    ) -> StoreResult<User> {
        if input_tokens < 0 || output_tokens < 0 {
            return Err(StoreError::Invalid { field: "tokens", message: "must not be negative".into() });
        }
        let mut tx = self.pool.begin().await?;
        ensure_user_row(&mut tx, tg_id).await?;
        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET input_tokens = input_tokens + $2, output_tokens = output_tokens + $3
             WHERE tg_id = $1 RETURNING {}",
            USER_COLUMNS
        ))
        .bind(tg_id)
        .bind(input_tokens)
        .bind(output_tokens)
        .fetch_one(&mut *tx)
        .await?;
        if let Some(bot) = bot {
            write_usage(&mut tx, tg_id, bot, Utc::now().date_naive(), input_tokens, output_tokens).await?;
        }
        tx.commit().await?;
        Ok(user)
    }

    /// Adds one request to the rollup without touching the user counters.
    pub async fn write_usage(
        &self,
        tg_id: i64,
        bot: BotKind,
        date: Option<NaiveDate>,
        input_tokens: i64,
        output_tokens: i64,
    ) -> StoreResult<UserTokenUsage> {
        let mut tx = self.pool.begin().await?;
        ensure_user_row(&mut tx, tg_id).await?;
        let usage = write_usage(&mut tx, tg_id, bot, date.unwrap_or_else(|| Utc::now().date_naive()), input_tokens, output_tokens).await?;
        tx.commit().await?;
        Ok(usage)
    }

    /// Lifetime requests across the free-tier bots.
    pub async fn total_requests(&self, tg_id: i64) -> StoreResult<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(total_requests), 0)::BIGINT FROM user_token_usage
             WHERE user_id = $1 AND bot IN ('dose', 'professor')",
        )
        .bind(tg_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    pub async fn usages(&self, window: &UsageWindow) -> StoreResult<Vec<UserTokenUsage>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM user_token_usage", USAGE_COLUMNS));
        push_usage_filter(&mut qb, window);
        qb.push(" ORDER BY date DESC, user_id, bot LIMIT 5000");
        let rows = qb.build_query_as::<UserTokenUsage>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    pub async fn usage_totals(&self, window: &UsageWindow) -> StoreResult<UsageTotals> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT COALESCE(SUM(input_tokens), 0)::BIGINT AS input_tokens,
                    COALESCE(SUM(output_tokens), 0)::BIGINT AS output_tokens,
                    COALESCE(SUM(total_requests), 0)::BIGINT AS total_requests,
                    COALESCE(SUM(input_cost_usd), 0) AS input_cost_usd,
                    COALESCE(SUM(output_cost_usd), 0) AS output_cost_usd
             FROM user_token_usage",
        );
        push_usage_filter(&mut qb, window);
        let totals = qb.build_query_as::<UsageTotals>().fetch_one(&self.pool).await?;
        Ok(totals)
    }

    /// Takes one premium request if any are left.
    pub async fn consume_premium_request(&self, tg_id: i64) -> StoreResult<bool> {
        let done = sqlx::query("UPDATE users SET premium_requests = premium_requests - 1 WHERE tg_id = $1 AND premium_requests > 0")
            .bind(tg_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn refund_premium_request(&self, tg_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE users SET premium_requests = premium_requests + 1 WHERE tg_id = $1")
            .bind(tg_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn used_code(&self, code: &str) -> StoreResult<Option<UsedCode>> {
        let used = sqlx::query_as::<_, UsedCode>("SELECT id, code, user_id, price, created_at FROM used_codes WHERE code = $1")
            .bind(code.trim())
            .fetch_optional(&self.pool)
            .await?;
        Ok(used)
    }

    /// Records a redeemed order code and extends the user's premium window
    /// by `premium_days` from the later of now and its current end.
    pub async fn create_used_code(&self, code: &str, tg_id: i64, price: Money, premium_days: i64) -> StoreResult<(UsedCode, User)> {
        let code = code.trim();
        if code.is_empty() {
            return Err(StoreError::Invalid { field: "code", message: "must not be empty".into() });
        }
        let mut tx = self.pool.begin().await?;
        ensure_user_row(&mut tx, tg_id).await?;
        let used = sqlx::query_as::<_, UsedCode>(
            "INSERT INTO used_codes (code, user_id, price) VALUES ($1, $2, $3)
             ON CONFLICT (code) DO NOTHING
             RETURNING id, code, user_id, price, created_at",
        )
        .bind(code)
        .bind(tg_id)
        .bind(price)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::Conflict(format!("order code '{}' was already redeemed", code)))?;

        let mut user = sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE tg_id = $1 FOR UPDATE", USER_COLUMNS))
            .bind(tg_id)
            .fetch_one(&mut *tx)
            .await?;
        user.extend_premium(premium_days, Utc::now());
        sqlx::query("UPDATE users SET premium_until = $2 WHERE tg_id = $1")
            .bind(tg_id)
            .bind(user.premium_until)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((used, user))
    }

    /// Returns whether a row was inserted.
    pub async fn add_favourite(&self, tg_id: i64, product_onec_id: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        ensure_user_row(&mut tx, tg_id).await?;
        let done = sqlx::query(
            "INSERT INTO favourites (user_id, product_onec_id) VALUES ($1, $2)
             ON CONFLICT (user_id, product_onec_id) DO NOTHING",
        )
        .bind(tg_id)
        .bind(product_onec_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)
        .map_err(|e| match e {
            e if e.is_row_conflict() => StoreError::not_found("product", product_onec_id),
            e => e,
        })?;
        tx.commit().await?;
        Ok(done.rows_affected() == 1)
    }

    /// Returns whether a row was deleted.
    pub async fn remove_favourite(&self, tg_id: i64, product_onec_id: &str) -> StoreResult<bool> {
        let done = sqlx::query("DELETE FROM favourites WHERE user_id = $1 AND product_onec_id = $2")
            .bind(tg_id)
            .bind(product_onec_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Users still muted at `now`, soonest expiry first.
    pub async fn active_mutes(&self, now: DateTime<Utc>) -> StoreResult<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE muted_until > $1 AND muted_chat_id IS NOT NULL ORDER BY muted_until",
            USER_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    /// Clears the mute unless it was replaced by a later one.
    pub async fn clear_mute(&self, tg_id: i64, expected_until: DateTime<Utc>) -> StoreResult<bool> {
        let done = sqlx::query(
            "UPDATE users SET muted_until = NULL, muted_chat_id = NULL WHERE tg_id = $1 AND muted_until <= $2",
        )
        .bind(tg_id)
        .bind(expected_until)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }
}

fn unique_as_conflict(e: StoreError) -> StoreError {
    match e {
        StoreError::Database(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
            StoreError::Conflict(db.message().to_string())
        }
        e => e,
    }
}

#[async_trait]
impl MeteringStore for PgStore {
    async fn ensure_user(&self, tg_id: i64) -> Result<User, MeteringError> {
        let user = self.upsert_user(&UserUpsert { tg_id, ..Default::default() }).await?;
        Ok(user)
    }

    async fn update_user(&self, tg_id: i64, patch: &UserPatch) -> Result<User, MeteringError> {
        Ok(PgStore::update_user(self, tg_id, patch).await?)
    }

    async fn total_requests(&self, tg_id: i64) -> Result<i64, MeteringError> { Ok(PgStore::total_requests(self, tg_id).await?) }

    async fn consume_premium_request(&self, user: &User) -> Result<bool, MeteringError> {
        Ok(PgStore::consume_premium_request(self, user.tg_id).await?)
    }

    async fn refund_premium_request(&self, tg_id: i64) -> Result<(), MeteringError> {
        Ok(PgStore::refund_premium_request(self, tg_id).await?)
    }

    async fn record_turn(&self, tg_id: i64, bot: BotKind, input_tokens: i64, output_tokens: i64) -> Result<(), MeteringError> {
        self.increment_tokens(tg_id, input_tokens, output_tokens, Some(bot)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_column_whitelist() {
        assert_eq!("tg_phone".parse::<UserColumn>().unwrap(), UserColumn::TgPhone);
        assert!(matches!("premium_until; DROP".parse::<UserColumn>(), Err(StoreError::Invalid { field: "column_name", .. })));
    }

    #[test]
    fn test_usage_filter_binds() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM user_token_usage");
        let window = UsageWindow { user_id: Some(1), bot: Some(BotKind::New), from: None, to: NaiveDate::from_ymd_opt(2024, 5, 1) };
        push_usage_filter(&mut qb, &window);
        assert_eq!(qb.sql(), "SELECT 1 FROM user_token_usage WHERE TRUE AND user_id = $1 AND bot = $2 AND date <= $3");
    }
}
