//! The language model that plans browser actions.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::error::{AgentError, Result};
use crate::types::{ConversationTurn, Role};

pub const SYSTEM_PROMPT: &str = r#"You are a browser automation agent. You control a real Chrome browser by planning actions as JSON.

Each turn you receive the current page state: url, title, and a numbered list of the interactive elements currently visible, like `[3] button "Search"`. You also receive the results of the actions from the previous step.

Reply with a JSON object of the form {"actions": [ ... ]} holding one or more of:
- {"type":"click","index":3}
- {"type":"input","index":5,"text":"search query"}
- {"type":"navigate","url":"https://..."}
- {"type":"scroll","direction":"down"}            (up, down, left or right; optional "amount" in pixels)
- {"type":"extract","selector":"main"}            (reads the text of every element matching a CSS selector)
- {"type":"done","text":"what was achieved","success":true}

Rules:
1. Return ONLY the JSON object. No markdown, no explanation.
2. Element indices are only valid for the page state you were just shown. After a navigate, stop and wait for the next state before using indices.
3. "click" and "input" also accept a CSS "selector" instead of an "index".
4. When the task is accomplished, finish with "done" and success true. If it cannot be accomplished, finish with "done" and success false, explaining why.
5. If an action fails, try an alternative approach. Keep plans short."#;

#[async_trait]
pub trait Model: Send + Sync {
    /// Produce the next reply for the given conversation.
    async fn complete(&self, turns: &[ConversationTurn]) -> Result<String>;
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiModel {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl OpenAiModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AgentError::Model("OPENAI_API_KEY not set in environment".into()))?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AgentError::Model(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            endpoint: format!("{}/chat/completions", config.base_url),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }
}

/// Map conversation turns onto chat messages. State turns go out as user messages.
pub fn to_messages(turns: &[ConversationTurn]) -> Vec<Value> {
    turns
        .iter()
        .map(|t| match t.role {
            Role::System => json!({"role": "system", "content": t.content}),
            Role::State => json!({
                "role": "user",
                "content": format!("Current page state:\n{}", t.content),
            }),
            Role::User => json!({"role": "user", "content": t.content}),
            Role::Assistant => json!({"role": "assistant", "content": t.content}),
        })
        .collect()
}

#[async_trait]
impl Model for OpenAiModel {
    async fn complete(&self, turns: &[ConversationTurn]) -> Result<String> {
        let messages = to_messages(turns);
        debug!(model = %self.model, messages = messages.len(), "querying model");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": self.temperature,
            }))
            .send()
            .await
            .map_err(|e| AgentError::Model(format!("request failed: {}", e)))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| AgentError::Model(format!("unreadable response ({}): {}", status, e)))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            warn!(%status, "model API error: {}", message);
            return Err(AgentError::Model(format!(
                "API error ({}): {}",
                status, message
            )));
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AgentError::Model(format!("no content in response: {}", body)))?;
        debug!("model says: {}", content);
        Ok(content.to_string())
    }
}
