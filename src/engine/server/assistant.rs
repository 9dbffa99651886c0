// Reply source for POST /chat.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::ChatReply;
use crate::engine::chat::preview;
use crate::engine::http::CircuitBreaker;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

#[async_trait]
pub trait Assistant: Send + Sync {
    async fn reply(&self, message: &str) -> EngineResult<String>;
}

/// Development stand-in: answers with the message it was given.
pub struct EchoAssistant;

#[async_trait]
impl Assistant for EchoAssistant {
    async fn reply(&self, message: &str) -> EngineResult<String> {
        debug!("[server] Echoing \"{}\"", preview(message));
        Ok(format!("You said: {}", message))
    }
}

/// Forwards `{message}` to an upstream service answering `{reply}`.
pub struct UpstreamAssistant {
    client: Client,
    url: String,
    breaker: CircuitBreaker,
}

impl UpstreamAssistant {
    pub fn new(url: &str) -> EngineResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(UpstreamAssistant { client, url: url.to_string(), breaker: CircuitBreaker::new("assistant", 5, 30) })
    }

    async fn ask(&self, message: &str) -> EngineResult<String> {
        let resp = self.client.post(&self.url).json(&json!({ "message": message })).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::transport("assistant", format!("HTTP {}", resp.status().as_u16())));
        }
        Ok(resp.json::<ChatReply>().await?.reply)
    }
}

#[async_trait]
impl Assistant for UpstreamAssistant {
    async fn reply(&self, message: &str) -> EngineResult<String> {
        self.breaker.check().map_err(|m| EngineError::transport("assistant", m))?;
        match self.ask(message).await {
            Ok(reply) => {
                self.breaker.record_success();
                Ok(reply)
            }
            Err(e) => {
                warn!("[server] Upstream assistant failed: {}", e);
                self.breaker.record_failure();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_repeats_the_message() {
        assert_eq!(EchoAssistant.reply("hello").await.unwrap(), "You said: hello");
    }
}
