//! Capability-typed adapter for the external reasoning service.
//!
//! The engine only ever sees [`Reasoner::complete`]: a system prompt and a
//! user prompt in, free-form text out. Everything downstream of that text
//! passes through a schema parse with a deterministic fallback, so a
//! misbehaving model can degrade quality but never corrupt typed state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{HydraErr, Result};

pub const ENV_REASONER_URL: &str = "HYDRA_REASONER_URL";
pub const ENV_REASONER_TOKEN: &str = "HYDRA_REASONER_TOKEN";
pub const ENV_REASONER_MODEL: &str = "HYDRA_REASONER_MODEL";

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

/// Chat-completions style HTTP reasoner. Token, URL, and model are opaque to
/// the rest of the engine.
pub struct HttpReasoner {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    model: String,
}

impl HttpReasoner {
    pub fn new(base_url: String, token: Option<String>, model: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| HydraErr::Reasoner(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token,
            model,
        })
    }

    /// Build a reasoner from the environment, or `None` when no endpoint is
    /// configured. Scans without a reasoner run the deterministic agents only.
    pub fn from_env() -> Result<Option<Arc<dyn Reasoner>>> {
        let Ok(base_url) = std::env::var(ENV_REASONER_URL) else {
            return Ok(None);
        };
        let token = std::env::var(ENV_REASONER_TOKEN).ok();
        let model =
            std::env::var(ENV_REASONER_MODEL).unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Some(Arc::new(Self::new(base_url, token, model)?)))
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl Reasoner for HttpReasoner {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
        });

        let mut http_request = self.client.post(&url).json(&body);
        if let Some(token) = &self.token {
            http_request = http_request.bearer_auth(token);
        }

        let response = http_request
            .send()
            .await
            .map_err(|e| HydraErr::Reasoner(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HydraErr::Reasoner(format!(
                "reasoner returned {status}: {text}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| HydraErr::Reasoner(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| HydraErr::Reasoner("reasoner returned no choices".to_string()))?;
        debug!(chars = content.len(), "reasoner completion received");
        Ok(content)
    }
}

/// Extract the first JSON object or array from model output, tolerating
/// markdown code fences and surrounding prose.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str(text.trim()) {
        return Some(value);
    }
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```")
            && let Ok(value) = serde_json::from_str(after[..end].trim())
        {
            return Some(value);
        }
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(start) = text.find(open)
            && let Some(end) = text.rfind(close)
            && end > start
            && let Ok(value) = serde_json::from_str(text[start..=end].trim())
        {
            return Some(value);
        }
    }
    None
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extracts_bare_json() {
        let value = extract_json(r#"{"exploitable": true}"#).unwrap();
        assert_eq!(value["exploitable"], true);
    }

    #[test]
    fn extracts_fenced_json() {
        let text = "Here is my analysis:\n```json\n{\"verdict\": \"likely\"}\n```\nDone.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["verdict"], "likely");
    }

    #[test]
    fn extracts_embedded_object_from_prose() {
        let text = "I believe the answer is {\"confidence\": 70} based on the code.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["confidence"], 70);
    }

    #[test]
    fn garbage_yields_none() {
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("{truncated"), None);
    }
}
