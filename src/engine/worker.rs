// Cojoin Engine — Worker Client
//
// reqwest client for the edge-worker contracts:
//   POST {worker}/chat            {message, nonce?, recaptchaToken?, h-captcha-response?} → {reply}
//   POST {worker}/nonce           {nonce} → 200 {ok} | 409 {error:"nonce-reused"}
//   POST {worker}/end-session     fire-and-forget
//   POST {worker}/honeypot-trip   {reason, ts, ua}
//   POST {relay}                  {nonce, recaptchaToken, csrfToken?, ...fields}
//   GET  {site}/api/csrf-token    {token}
//
// One client value implements every transport trait the controller needs.
// Its cookie jar keeps the site session that CSRF tokens are bound to.

use crate::atoms::constants::{CSRF_HEADER, CSRF_REFUSED_ERROR};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ChatReply, ChatRequest, HoneypotTrip, NonceClaim, WidgetId};
use crate::engine::chat::{ChatTransport, SessionEndpoint};
use crate::engine::form::{CsrfSource, FormOutcome, FormTransport};
use crate::engine::gate::{NonceRegistrar, TripReporter};
use crate::engine::http::CircuitBreaker;
use async_trait::async_trait;
use log::{info, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

pub struct WorkerClient {
    client: Client,
    base_url: String,
    relay_url: String,
    csrf_url: Option<String>,
    user_agent: String,
    chat_breaker: CircuitBreaker,
}

#[derive(Deserialize)]
struct CsrfBody {
    token: String,
}

impl WorkerClient {
    pub fn new(base_url: &str, relay_url: &str, user_agent: &str) -> EngineResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .cookie_store(true)
            .build()?;
        Ok(WorkerClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            relay_url: relay_url.to_string(),
            csrf_url: None,
            user_agent: user_agent.to_string(),
            chat_breaker: CircuitBreaker::new("chat", 5, 30),
        })
    }

    /// Where session CSRF tokens are issued.
    pub fn with_csrf_url(mut self, url: &str) -> Self {
        self.csrf_url = Some(url.to_string());
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    async fn post_chat(&self, request: &ChatRequest) -> EngineResult<ChatReply> {
        let resp = self.client.post(self.endpoint("chat")).json(request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::transport("chat", format!("HTTP {}", status.as_u16())));
        }
        Ok(resp.json::<ChatReply>().await?)
    }
}

#[async_trait]
impl ChatTransport for WorkerClient {
    async fn send(&self, request: &ChatRequest) -> EngineResult<ChatReply> {
        self.chat_breaker
            .check()
            .map_err(|m| EngineError::transport("chat", m))?;
        let result = self.post_chat(request).await;
        match &result {
            Ok(_) => self.chat_breaker.record_success(),
            Err(e) => {
                warn!("[chat] Worker request failed: {}", e);
                self.chat_breaker.record_failure();
            }
        }
        result
    }
}

#[async_trait]
impl NonceRegistrar for WorkerClient {
    async fn register(&self, nonce: &str) -> EngineResult<NonceClaim> {
        let resp = self
            .client
            .post(self.endpoint("nonce"))
            .json(&json!({ "nonce": nonce }))
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(NonceClaim::Claimed),
            StatusCode::CONFLICT => Ok(NonceClaim::Reused),
            s => Err(EngineError::transport("nonce", format!("HTTP {}", s.as_u16()))),
        }
    }
}

#[async_trait]
impl TripReporter for WorkerClient {
    async fn report(&self, trip: &HoneypotTrip) -> EngineResult<()> {
        self.client
            .post(self.endpoint("honeypot-trip"))
            .json(trip)
            .send()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionEndpoint for WorkerClient {
    async fn end_session(&self) -> EngineResult<()> {
        self.client.post(self.endpoint("end-session")).send().await?;
        info!("[chat] End-session beacon sent");
        Ok(())
    }
}

#[async_trait]
impl FormTransport for WorkerClient {
    async fn submit(&self, widget: WidgetId, fields: &BTreeMap<String, String>) -> EngineResult<FormOutcome> {
        let resp = self.client.post(&self.relay_url).json(fields).send().await?;
        let status = resp.status().as_u16();
        info!("[relay] {} form answered HTTP {}", widget, status);
        let rotated = resp
            .headers()
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let csrf_refused = status == 403 && resp.text().await.map(|b| b.contains(CSRF_REFUSED_ERROR)).unwrap_or(false);
        Ok(classify_form_status(status, rotated, csrf_refused, fields))
    }
}

#[async_trait]
impl CsrfSource for WorkerClient {
    async fn fetch(&self) -> EngineResult<String> {
        let url = self
            .csrf_url
            .as_deref()
            .ok_or_else(|| EngineError::Config("no CSRF token endpoint configured".into()))?;
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::transport("csrf", format!("HTTP {}", status.as_u16())));
        }
        Ok(resp.json::<CsrfBody>().await?.token)
    }
}

fn classify_form_status(
    status: u16,
    rotated: Option<String>,
    csrf_refused: bool,
    fields: &BTreeMap<String, String>,
) -> FormOutcome {
    match status {
        200..=299 => FormOutcome::Accepted { rotated },
        401 if fields.contains_key("nonce") => FormOutcome::NonceRejected,
        403 if csrf_refused => FormOutcome::CsrfRejected,
        other => FormOutcome::Rejected(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_cleanly() {
        let c = WorkerClient::new("https://w.test/", "https://w.test/submit", "ua").unwrap();
        assert_eq!(c.endpoint("/chat"), "https://w.test/chat");
        assert_eq!(c.endpoint("honeypot-trip"), "https://w.test/honeypot-trip");
        assert_eq!(c.user_agent(), "ua");
    }

    #[test]
    fn form_statuses_map_to_outcomes() {
        let with = |keys: &[&str]| keys.iter().map(|k| (k.to_string(), "v".to_string())).collect::<BTreeMap<_, _>>();
        let full = with(&["nonce", "csrfToken"]);
        assert_eq!(
            classify_form_status(200, Some("next".into()), false, &full),
            FormOutcome::Accepted { rotated: Some("next".into()) }
        );
        assert_eq!(classify_form_status(401, None, false, &full), FormOutcome::NonceRejected);
        assert_eq!(classify_form_status(403, None, true, &full), FormOutcome::CsrfRejected);
        // suspicious-content refusal from the relay
        assert_eq!(classify_form_status(403, None, false, &full), FormOutcome::Rejected(403));
        assert_eq!(classify_form_status(401, None, false, &with(&[])), FormOutcome::Rejected(401));
    }

    #[tokio::test]
    async fn csrf_fetch_needs_an_endpoint() {
        let c = WorkerClient::new("https://w.test", "https://w.test/submit", "ua").unwrap();
        assert!(c.fetch().await.is_err());
    }
}
