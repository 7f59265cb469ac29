//! Narrow interfaces to processes this service does not own: the
//! headless-browser OAuth login, the SMTP verification sender and Telegram
//! chat moderation.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use super::{http_client, read_json, UpstreamError, REQUEST_TIMEOUT};
use crate::config::Secret;

/// Performs the amoCRM login and returns the authorization code from the
/// redirect.
#[async_trait]
pub trait AuthCodeProvider: Send + Sync {
    async fn authorization_code(&self) -> Result<String, UpstreamError>;
}

/// Sends the 6-digit premium verification code.
#[async_trait]
pub trait VerificationMailer: Send + Sync {
    async fn send_code(&self, email: &str, code: &str) -> Result<(), UpstreamError>;
}

#[async_trait]
pub trait ChatModerator: Send + Sync {
    /// Restores every chat permission for the user.
    async fn unmute(&self, chat_id: i64, user_id: i64) -> Result<(), UpstreamError>;
}

/// Stand-in used when a collaborator is not wired into this process.
pub struct Unavailable(pub &'static str);

#[async_trait]
impl AuthCodeProvider for Unavailable {
    async fn authorization_code(&self) -> Result<String, UpstreamError> {
        Err(UpstreamError::NotConfigured { service: self.0 })
    }
}

#[async_trait]
impl VerificationMailer for Unavailable {
    async fn send_code(&self, _email: &str, _code: &str) -> Result<(), UpstreamError> {
        Err(UpstreamError::NotConfigured { service: self.0 })
    }
}

#[async_trait]
impl ChatModerator for Unavailable {
    async fn unmute(&self, _chat_id: i64, _user_id: i64) -> Result<(), UpstreamError> {
        Err(UpstreamError::NotConfigured { service: self.0 })
    }
}

/// Bot API `restrictChatMember` with the antispam bot's token.
pub struct TelegramModerator {
    client: Client,
    api_url: String,
    token: Secret,
}

impl TelegramModerator {
    pub fn new(token: Secret) -> Result<Self, UpstreamError> {
        let client = http_client(REQUEST_TIMEOUT).map_err(UpstreamError::transport("telegram", "client"))?;
        Ok(Self { client, api_url: "https://api.telegram.org".into(), token })
    }
}

#[async_trait]
impl ChatModerator for TelegramModerator {
    async fn unmute(&self, chat_id: i64, user_id: i64) -> Result<(), UpstreamError> {
        if self.token.is_empty() {
            return Err(UpstreamError::NotConfigured { service: "telegram" });
        }
        let body = json!({
            "chat_id": chat_id,
            "user_id": user_id,
            "permissions": {
                "can_send_messages": true,
                "can_send_audios": true,
                "can_send_documents": true,
                "can_send_photos": true,
                "can_send_videos": true,
                "can_send_video_notes": true,
                "can_send_voice_notes": true,
                "can_send_polls": true,
                "can_send_other_messages": true,
                "can_add_web_page_previews": true,
                "can_invite_users": true,
            },
        });
        let response = self
            .client
            .post(format!("{}/bot{}/restrictChatMember", self.api_url, self.token.expose()))
            .json(&body)
            .send()
            .await
            .map_err(UpstreamError::transport("telegram", "restrictChatMember"))?;
        let _: serde_json::Value = read_json("telegram", "restrictChatMember", response).await?;
        debug!(chat_id, user_id, "chat permissions restored");
        Ok(())
    }
}
