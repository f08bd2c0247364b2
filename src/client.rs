// Structured chat-completion client
//
// The chat/completions route doesn't forward raw bytes - it goes through a
// structured client that accepts an OpenAI-compatible payload and returns the
// backend's fully-formed response object, hiding the wire format. The trait
// keeps the handler testable with a stub client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Placeholder credential - Ollama's OpenAI-compatible endpoint ignores the
/// token but some SDK-shaped backends reject an empty one.
const API_KEY: &str = "ollama";

/// Connect/write timeout; establishing a connection to a local backend is fast.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall timeout; token-by-token generation can legitimately take minutes.
const READ_TIMEOUT: Duration = Duration::from_secs(600);

/// A client that turns one chat-completion request payload into the backend's
/// structured response object.
#[async_trait]
pub trait ChatCompletions: Send + Sync {
    async fn create(&self, payload: &Value) -> Result<Value>;
}

/// HTTP implementation targeting the backend's OpenAI-compatible endpoint.
/// Re-adds the /v1 suffix that config normalization strips from the base URL.
pub struct HttpChatClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpChatClient {
    pub fn new(backend_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .context("failed to create chat completion client")?;

        Ok(Self {
            client,
            endpoint: format!("{backend_url}/v1/chat/completions"),
        })
    }
}

#[async_trait]
impl ChatCompletions for HttpChatClient {
    async fn create(&self, payload: &Value) -> Result<Value> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(API_KEY)
            .json(payload)
            .send()
            .await
            .context("chat completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("backend returned {status}: {body}");
        }

        response
            .json::<Value>()
            .await
            .context("failed to decode chat completion response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_readds_v1_suffix() {
        let client = HttpChatClient::new("http://127.0.0.1:11434").unwrap();
        assert_eq!(client.endpoint, "http://127.0.0.1:11434/v1/chat/completions");
    }
}
