use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Seam between the security pipeline and the model provider. Every LLM
/// dependency in the pipeline (classifier, rule engine, agent turns) goes
/// through this trait so decision paths are testable with scripted models.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// JSON-mode chat completion: the reply is expected to be a single JSON
    /// object matching whatever schema the prompt asked for.
    async fn chat_json(&self, model: &str, messages: &[ChatMessage]) -> Result<String>;
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl LlmClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn chat_json(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let total_len: usize = messages.iter().map(|m| m.content.len()).sum();
        tracing::debug!(
            "LLM request (JSON): model={}, messages={}, total_chars={}",
            model,
            messages.len(),
            total_len
        );

        let url = format!("{}/chat/completions", self.base_url);
        let req = OaiRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            stream: false,
            response_format: Some(OaiResponseFormat {
                r#type: "json_object".to_string(),
            }),
        };

        let mut rb = self.http.post(url).json(&req);
        if let Some(key) = &self.api_key {
            rb = rb.header("Authorization", format!("Bearer {}", key));
        }
        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("llm error ({}): {}", status, text);
        }

        let payload: OaiChatResponse = resp.json().await?;
        let content = payload
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        Ok(content)
    }
}

/// Scan a model reply for the first parseable JSON object of type `T`.
/// Models sometimes wrap the object in prose even in JSON mode.
pub fn parse_json_reply<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Ok(value);
    }
    for (idx, _) in trimmed.match_indices('{') {
        let candidate = &trimmed[idx..];
        let stream =
            serde_json::de::Deserializer::from_str(candidate).into_iter::<serde_json::Value>();
        for value in stream.flatten() {
            if let Ok(parsed) = serde_json::from_value::<T>(value) {
                return Ok(parsed);
            }
        }
    }
    anyhow::bail!("no valid JSON object found in model reply")
}

// --- Wire types ---

#[derive(Debug, Serialize)]
struct OaiRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OaiResponseFormat>,
}

#[derive(Debug, Serialize)]
struct OaiResponseFormat {
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    choices: Vec<OaiChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OaiChoiceMessage {
    content: String,
}
