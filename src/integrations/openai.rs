//! OpenAI Assistants API backend, one instance per bot.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{http_client, read_json, UpstreamError, HEAVY_REQUEST_TIMEOUT};
use crate::assistant::{AssistantBackend, BackendReply, ModelTier};
use crate::config::{AssistantCredentials, Secret};

const SERVICE: &str = "openai";
const API_URL: &str = "https://api.openai.com/v1";

pub const CHEAP_MODEL: &str = "gpt-4o-mini";
pub const PREMIUM_MODEL: &str = "gpt-4o";

const POLL_INTERVAL: Duration = Duration::from_millis(800);
const POLL_ATTEMPTS: usize = 150;

#[derive(Debug, Deserialize)]
struct Created { id: String }

#[derive(Debug, Deserialize)]
struct Run {
    id: String,
    status: String,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    last_error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    data: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    role: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    content: Vec<Value>,
}

#[derive(Debug, Default, PartialEq)]
struct MessageText { text: String, files: Vec<String> }

/// Text blocks joined with blank lines; image and annotation file ids
/// collected in order.
fn collect_content(messages: &[Message], run_id: &str) -> MessageText {
    let mut out = MessageText::default();
    let own = messages.iter().filter(|m| m.role == "assistant" && m.run_id.as_deref().map_or(true, |r| r == run_id));
    // the list is newest first
    for message in own.collect::<Vec<_>>().into_iter().rev() {
        for block in &message.content {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(value) = block["text"]["value"].as_str() {
                        if !out.text.is_empty() {
                            out.text.push_str("\n\n");
                        }
                        out.text.push_str(value);
                    }
                    let annotations = block["text"]["annotations"].as_array().into_iter().flatten();
                    out.files.extend(annotations.filter_map(|a| a["file_path"]["file_id"].as_str()).map(str::to_string));
                }
                Some("image_file") => {
                    if let Some(id) = block["image_file"]["file_id"].as_str() {
                        out.files.push(id.to_string());
                    }
                }
                _ => {}
            }
        }
    }
    out
}

fn model_for(tier: ModelTier) -> &'static str {
    match tier {
        ModelTier::Cheap => CHEAP_MODEL,
        ModelTier::Premium => PREMIUM_MODEL,
    }
}

pub struct OpenAiAssistants {
    client: Client,
    api_url: String,
    api_key: Secret,
    assistant_id: String,
}

impl OpenAiAssistants {
    pub fn new(credentials: &AssistantCredentials) -> Result<Self, UpstreamError> {
        let client = http_client(HEAVY_REQUEST_TIMEOUT).map_err(UpstreamError::transport(SERVICE, "client"))?;
        Ok(Self {
            client,
            api_url: API_URL.to_string(),
            api_key: credentials.openai_api_key.clone(),
            assistant_id: credentials.assistant_id.clone(),
        })
    }

    fn backoff() -> ConstantBuilder { ConstantBuilder::default().with_delay(Duration::from_secs(2)).with_max_times(2) }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.api_key.expose()).header("OpenAI-Beta", "assistants=v2")
    }

    async fn post<T: DeserializeOwned>(&self, stage: &'static str, path: &str, body: &Value) -> Result<T, UpstreamError> {
        let url = format!("{}/{}", self.api_url, path);
        let call = || async {
            let response = self
                .authorized(self.client.post(&url))
                .json(body)
                .send()
                .await
                .map_err(UpstreamError::transport(SERVICE, stage))?;
            read_json(SERVICE, stage, response).await
        };
        call.retry(Self::backoff()).when(UpstreamError::is_transient).await
    }

    async fn get<T: DeserializeOwned>(&self, stage: &'static str, path: &str) -> Result<T, UpstreamError> {
        let url = format!("{}/{}", self.api_url, path);
        let call = || async {
            let response = self.authorized(self.client.get(&url)).send().await.map_err(UpstreamError::transport(SERVICE, stage))?;
            read_json(SERVICE, stage, response).await
        };
        call.retry(Self::backoff()).when(UpstreamError::is_transient).await
    }

    async fn wait_for(&self, thread_id: &str, run_id: &str) -> Result<Run, UpstreamError> {
        for _ in 0..POLL_ATTEMPTS {
            let run: Run = self.get("run", &format!("threads/{}/runs/{}", thread_id, run_id)).await?;
            match run.status.as_str() {
                "queued" | "in_progress" | "cancelling" => tokio::time::sleep(POLL_INTERVAL).await,
                "completed" => return Ok(run),
                other => {
                    warn!(thread_id, run_id, status = other, error = ?run.last_error, "assistant run did not complete");
                    return Err(UpstreamError::Decode { service: SERVICE, stage: "run", message: format!("run ended as {}", other) });
                }
            }
        }
        Err(UpstreamError::Decode { service: SERVICE, stage: "run", message: "run did not finish in time".into() })
    }
}

#[async_trait]
impl AssistantBackend for OpenAiAssistants {
    async fn reply(&self, tier: ModelTier, thread_id: Option<&str>, text: &str) -> Result<BackendReply, UpstreamError> {
        if self.api_key.is_empty() || self.assistant_id.is_empty() {
            return Err(UpstreamError::NotConfigured { service: SERVICE });
        }
        let thread_id = match thread_id.filter(|t| !t.is_empty()) {
            Some(id) => id.to_string(),
            None => self.post::<Created>("thread", "threads", &json!({})).await?.id,
        };
        let _: Created = self
            .post("message", &format!("threads/{}/messages", thread_id), &json!({ "role": "user", "content": text }))
            .await?;
        let run: Run = self
            .post("run", &format!("threads/{}/runs", thread_id), &json!({ "assistant_id": self.assistant_id, "model": model_for(tier) }))
            .await?;
        let run = self.wait_for(&thread_id, &run.id).await?;
        let messages: MessageList = self.get("messages", &format!("threads/{}/messages?order=desc&limit=20", thread_id)).await?;
        let content = collect_content(&messages.data, &run.id);
        let usage = run.usage.unwrap_or_default();
        debug!(thread_id = %thread_id, ?tier, input = usage.prompt_tokens, output = usage.completion_tokens, "assistant replied");
        Ok(BackendReply {
            thread_id,
            text: content.text,
            files: content.files,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_content_keeps_run_messages_in_order() {
        let raw = json!({ "data": [
            { "role": "assistant", "run_id": "run_2", "content": [
                { "type": "text", "text": { "value": "второй", "annotations": [{ "file_path": { "file_id": "file-9" } }] } }
            ]},
            { "role": "assistant", "run_id": "run_2", "content": [
                { "type": "text", "text": { "value": "первый", "annotations": [] } },
                { "type": "image_file", "image_file": { "file_id": "file-1" } }
            ]},
            { "role": "user", "run_id": null, "content": [{ "type": "text", "text": { "value": "вопрос" } }] },
            { "role": "assistant", "run_id": "run_1", "content": [{ "type": "text", "text": { "value": "старый" } }] }
        ]});
        let list: MessageList = serde_json::from_value(raw).unwrap();
        let out = collect_content(&list.data, "run_2");
        assert_eq!(out.text, "первый\n\nвторой");
        assert_eq!(out.files, vec!["file-1".to_string(), "file-9".to_string()]);
    }

    #[test]
    fn test_tier_models() {
        assert_eq!(model_for(ModelTier::Cheap), CHEAP_MODEL);
        assert_eq!(model_for(ModelTier::Premium), PREMIUM_MODEL);
    }
}
