//! Admission control and metering for AI assistant turns.
//!
//! A turn passes, in order: the moderation block, the phone gate for the
//! free-tier bots, and the premium quota. Accepted turns are forwarded to
//! the assistant backend and their tokens are accrued in one commit.
//! Persistence goes through `MeteringStore`, implemented both by
//! `PgStore` and by the signed RPC client, so a bot process can run the
//! gate without a database handle.

pub mod response;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use validator::Validate;

use crate::config::BotsConfig;
use crate::db::StoreError;
use crate::domain::{BotKind, User};
use crate::integrations::openai::OpenAiAssistants;
use crate::integrations::UpstreamError;
use crate::rpc::RpcClient;
use response::{parse_reply, ParsedReply};

/// Free-tier turns a user gets before sharing a phone contact.
pub const UNVERIFIED_REQUEST_LIMIT: i64 = 5;

#[derive(Debug, Error)]
pub enum MeteringError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("rpc rejected '{action}': {message}")]
    Rpc { action: String, message: String },
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("user is blocked until {until}")]
    Blocked { until: DateTime<Utc> },

    #[error("phone verification required")]
    PhoneRequired,

    #[error("premium requests exhausted")]
    PremiumExhausted,

    #[error(transparent)]
    Metering(#[from] MeteringError),

    #[error("assistant backend failed: {0}")]
    Backend(#[from] UpstreamError),
}

impl GateError {
    /// Text shown to the user instead of an answer, when there is one.
    pub fn notice(&self) -> Option<String> {
        match self {
            Self::Blocked { until } if *until >= crate::domain::aggregates::user::blocked_forever() => {
                Some("Доступ к консультанту закрыт.".to_string())
            }
            Self::Blocked { until } => Some(format!(
                "Доступ к консультанту ограничен до {} (МСК).",
                crate::orders::report::moscow_time(*until)
            )),
            Self::PhoneRequired => {
                Some("Чтобы продолжить, поделитесь номером телефона кнопкой ниже.".to_string())
            }
            Self::PremiumExhausted => Some(
                "Запросы к расширенной модели закончились. Их можно получить за заказ в магазине.".to_string(),
            ),
            Self::Metering(_) | Self::Backend(_) => None,
        }
    }
}

impl From<StoreError> for GateError {
    fn from(e: StoreError) -> Self { Self::Metering(e.into()) }
}

/// Partial user update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct UserPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tg_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[validate(email)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premium_until: Option<DateTime<Utc>>,
    #[validate(range(min = 0))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premium_requests: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted_chat_id: Option<i64>,
}

impl UserPatch {
    pub fn is_empty(&self) -> bool { self == &Self::default() }

    pub fn apply(&self, user: &mut User) {
        macro_rules! set {
            ($($field:ident),*) => { $( if let Some(v) = &self.$field { user.$field = Some(v.clone()); } )* };
        }
        set!(username, name, surname, photo_url, tg_phone, phone, email, thread_id, premium_until, blocked_until, muted_until, muted_chat_id);
        if let Some(n) = self.premium_requests {
            user.premium_requests = n;
        }
    }
}

#[async_trait]
pub trait MeteringStore: Send + Sync {
    /// Loads the user, creating an empty row on first contact.
    async fn ensure_user(&self, tg_id: i64) -> Result<User, MeteringError>;
    async fn update_user(&self, tg_id: i64, patch: &UserPatch) -> Result<User, MeteringError>;
    /// Lifetime requests across the free-tier bots.
    async fn total_requests(&self, tg_id: i64) -> Result<i64, MeteringError>;
    /// Takes one premium request; `false` when none are left.
    async fn consume_premium_request(&self, user: &User) -> Result<bool, MeteringError>;
    /// Gives back a request taken for a turn that got no answer.
    async fn refund_premium_request(&self, tg_id: i64) -> Result<(), MeteringError>;
    /// Adds tokens to the user counters and today's rollup in one commit.
    async fn record_turn(&self, tg_id: i64, bot: BotKind, input_tokens: i64, output_tokens: i64) -> Result<(), MeteringError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier { Cheap, Premium }

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub tg_id: i64,
    pub bot: BotKind,
    pub text: String,
    /// A free-tier bot user explicitly asking for the premium model.
    pub wants_premium: bool,
}

impl TurnRequest {
    pub fn tier(&self) -> ModelTier {
        if self.bot == BotKind::New || self.wants_premium { ModelTier::Premium } else { ModelTier::Cheap }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReply {
    pub thread_id: String,
    pub text: String,
    pub files: Vec<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// AI backend holding one conversation thread per user.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    async fn reply(&self, tier: ModelTier, thread_id: Option<&str>, text: &str) -> Result<BackendReply, UpstreamError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnOutcome {
    /// Message chunks ready to send, each at most 4096 characters.
    pub messages: Vec<String>,
    pub files: Vec<String>,
    pub blocked_until: Option<DateTime<Utc>>,
}

pub struct AssistantGate {
    store: Arc<dyn MeteringStore>,
    backend: Arc<dyn AssistantBackend>,
}

impl AssistantGate {
    pub fn new(store: Arc<dyn MeteringStore>, backend: Arc<dyn AssistantBackend>) -> Self { Self { store, backend } }

    /// Gate for a bot process: metering over the signed RPC, replies from the
    /// bot's OpenAI assistant. `None` when the bot has no assistant configured.
    pub fn for_bot(bots: &BotsConfig, bot: BotKind) -> Result<Option<Self>, UpstreamError> {
        let Some(credentials) = bots.assistants.get(&bot) else { return Ok(None) };
        let store = Arc::new(RpcClient::new(&bots.rpc_base_url, bots.rpc_token.clone())?);
        let backend = Arc::new(OpenAiAssistants::new(credentials)?);
        Ok(Some(Self::new(store, backend)))
    }

    /// Runs the admission rules, returning the (possibly updated) user.
    pub async fn admit(&self, request: &TurnRequest, now: DateTime<Utc>) -> Result<User, GateError> {
        Ok(self.check_in(request, now).await?.0)
    }

    /// Admission plus whether a premium request was taken for the turn.
    async fn check_in(&self, request: &TurnRequest, now: DateTime<Utc>) -> Result<(User, bool), GateError> {
        let user = self.store.ensure_user(request.tg_id).await?;
        if let Some(until) = user.blocked_until.filter(|_| user.is_blocked(now)) {
            return Err(GateError::Blocked { until });
        }

        let tier = request.tier();
        if request.bot.is_free_tier() && !user.has_verified_phone() {
            let total = self.store.total_requests(user.tg_id).await?;
            if total >= UNVERIFIED_REQUEST_LIMIT || tier == ModelTier::Premium {
                info!(tg_id = user.tg_id, total, "phone contact requested");
                return Err(GateError::PhoneRequired);
            }
        }

        let metered = tier == ModelTier::Premium && !user.has_premium_window(now);
        if metered && (user.premium_requests <= 0 || !self.store.consume_premium_request(&user).await?) {
            return Err(GateError::PremiumExhausted);
        }
        Ok((user, metered))
    }

    pub async fn handle_turn(&self, request: &TurnRequest) -> Result<TurnOutcome, GateError> {
        let now = Utc::now();
        let (user, metered) = self.check_in(request, now).await?;

        let reply = match self.backend.reply(request.tier(), user.thread_id.as_deref(), &request.text).await {
            Ok(reply) => reply,
            Err(err) => {
                if metered {
                    if let Err(refund) = self.store.refund_premium_request(user.tg_id).await {
                        warn!(tg_id = user.tg_id, error = %refund, "premium request not refunded");
                    }
                }
                return Err(err.into());
            }
        };
        if user.thread_id.as_deref() != Some(reply.thread_id.as_str()) {
            let patch = UserPatch { thread_id: Some(reply.thread_id.clone()), ..Default::default() };
            self.store.update_user(user.tg_id, &patch).await?;
        }
        self.store.record_turn(user.tg_id, request.bot, reply.input_tokens, reply.output_tokens).await?;

        let ParsedReply { messages, block_days } = parse_reply(&reply.text);
        let mut blocked_until = None;
        if let Some(days) = block_days {
            let mut blocked = user.clone();
            blocked.block_for_days(days, now);
            let patch = UserPatch { blocked_until: blocked.blocked_until, ..Default::default() };
            self.store.update_user(user.tg_id, &patch).await?;
            warn!(tg_id = user.tg_id, days, "user blocked by assistant");
            blocked_until = blocked.blocked_until;
        }
        Ok(TurnOutcome { messages, files: reply.files, blocked_until })
    }

    /// Stores the phone from a shared contact, lifting the phone gate.
    pub async fn share_contact(&self, tg_id: i64, phone: &str) -> Result<User, GateError> {
        let phone = phone.trim();
        let patch = UserPatch { tg_phone: Some(phone.to_string()), ..Default::default() };
        Ok(self.store.update_user(tg_id, &patch).await?)
    }
}
