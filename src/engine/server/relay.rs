// Cojoin Engine — Form Relay
//
// POST /submit {nonce, recaptchaToken, ...fields}
//
//   1. both proofs present            else 400
//   2. nonce claimed in the registry  else 401
//   3. no markup or script URLs       else 403 (attempt logged)
//   4. CAPTCHA verifies               else 401
//   5. fields encrypt                 else 500
//   6. downstream accepts             else 502
//   → 200 {"status":"ok"}
//
// The downstream receives {nonce, payload}; payload is
// base64(iv ‖ AES-256-GCM(fields as JSON)).

use super::nonces::{is_valid_nonce, NonceRegistry};
use super::request::HttpResponse;
use crate::atoms::constants::CSRF_FIELD;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CaptchaProviderKind, NonceClaim};
use crate::engine::crypto;
use crate::engine::http::{is_retryable_status, retry_delay, MAX_RETRIES};
use async_trait::async_trait;
use log::{error, info, warn};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

static SUSPICIOUS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)<[^>]*>|javascript:|data:").ok());

/// True when any string anywhere in `value` looks like markup or a script URL.
pub fn is_suspicious(value: &Value) -> bool {
    match value {
        Value::String(s) => SUSPICIOUS.as_ref().map(|re| re.is_match(s)).unwrap_or(true),
        Value::Array(items) => items.iter().any(is_suspicious),
        Value::Object(map) => map.values().any(is_suspicious),
        _ => false,
    }
}

// ── CAPTCHA verification ───────────────────────────────────────────────

#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    /// Any failure to reach the provider counts as a failed check.
    async fn verify(&self, token: &str, remote_ip: Option<&str>) -> bool;
}

#[derive(Deserialize)]
struct SiteVerifyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// Form-posts `secret` and `response` to the provider's siteverify URL.
pub struct SiteVerifyClient {
    client: Client,
    provider: CaptchaProviderKind,
    secret: Option<String>,
}

impl SiteVerifyClient {
    pub fn new(provider: CaptchaProviderKind, secret: Option<String>) -> EngineResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(SiteVerifyClient { client, provider, secret })
    }

    async fn siteverify(&self, secret: &str, token: &str, remote_ip: Option<&str>) -> EngineResult<SiteVerifyResponse> {
        let mut params = vec![("secret", secret), ("response", token)];
        if let Some(ip) = remote_ip {
            params.push(("remoteip", ip));
        }
        let resp = self.client.post(self.provider.verify_url()).form(&params).send().await?;
        Ok(resp.json::<SiteVerifyResponse>().await?)
    }
}

#[async_trait]
impl CaptchaVerifier for SiteVerifyClient {
    async fn verify(&self, token: &str, remote_ip: Option<&str>) -> bool {
        let Some(secret) = self.secret.as_deref() else {
            error!("[relay] No CAPTCHA secret configured; verification fails");
            return false;
        };
        if token.is_empty() {
            return false;
        }
        match self.siteverify(secret, token, remote_ip).await {
            Ok(r) if r.success => true,
            Ok(r) => {
                warn!("[relay] CAPTCHA rejected: {:?}", r.error_codes);
                false
            }
            Err(e) => {
                warn!("[relay] CAPTCHA verification error: {}", e);
                false
            }
        }
    }
}

// ── Downstream ─────────────────────────────────────────────────────────

#[async_trait]
pub trait Downstream: Send + Sync {
    /// Forward the encrypted envelope. Err means the downstream rejected it.
    async fn deliver(&self, envelope: &Value) -> EngineResult<()>;
    /// Best-effort record of a rejected suspicious attempt.
    async fn log_suspicious(&self, attempt: &Value);
}

pub struct HttpDownstream {
    client: Client,
    url: Option<String>,
    log_url: Option<String>,
}

impl HttpDownstream {
    pub fn new(url: Option<String>, log_url: Option<String>) -> EngineResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(HttpDownstream { client, url, log_url })
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn deliver(&self, envelope: &Value) -> EngineResult<()> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| EngineError::Config("no relay downstream configured".into()))?;
        let mut attempt = 0;
        loop {
            let resp = self.client.post(url).json(envelope).send().await?;
            let status = resp.status().as_u16();
            if resp.status().is_success() {
                return Ok(());
            }
            if attempt >= MAX_RETRIES || !is_retryable_status(status) {
                return Err(EngineError::transport("downstream", format!("HTTP {}", status)));
            }
            let delay = retry_delay(attempt).await;
            warn!("[relay] Downstream HTTP {}, retried after {}ms", status, delay.as_millis());
            attempt += 1;
        }
    }

    async fn log_suspicious(&self, attempt: &Value) {
        let Some(url) = self.log_url.as_deref() else { return };
        if let Err(e) = self.client.post(url).json(attempt).send().await {
            warn!("[relay] Failed to log suspicious attempt: {}", e);
        }
    }
}

// ── Relay ──────────────────────────────────────────────────────────────

pub struct FormRelay {
    captcha: Arc<dyn CaptchaVerifier>,
    downstream: Arc<dyn Downstream>,
    key: Option<[u8; 32]>,
}

impl FormRelay {
    pub fn new(captcha: Arc<dyn CaptchaVerifier>, downstream: Arc<dyn Downstream>, key: Option<[u8; 32]>) -> Self {
        FormRelay { captcha, downstream, key }
    }

    pub async fn submit(&self, body: &Value, nonces: &NonceRegistry, remote_ip: Option<&str>) -> HttpResponse {
        let Some(obj) = body.as_object() else {
            return HttpResponse::error(400, "Bad Request");
        };
        let mut fields: Map<String, Value> = obj.clone();
        let nonce = fields.remove("nonce");
        let token = fields.remove("recaptchaToken");
        // Site-session token; meaningless downstream.
        fields.remove(CSRF_FIELD);
        let (Some(Value::String(nonce)), Some(Value::String(token))) = (nonce, token) else {
            return HttpResponse::error(400, "Bad Request");
        };
        if !is_valid_nonce(&nonce) || token.is_empty() {
            return HttpResponse::error(400, "Bad Request");
        }

        if nonces.claim(&nonce) == NonceClaim::Reused {
            return HttpResponse::error(401, "Unauthorized");
        }

        let data = Value::Object(fields);
        if is_suspicious(&data) {
            warn!("[relay] Suspicious submission rejected");
            self.downstream.log_suspicious(&json!({ "nonce": nonce, "data": data })).await;
            return HttpResponse::error(403, "Forbidden");
        }

        if !self.captcha.verify(&token, remote_ip).await {
            return HttpResponse::error(401, "Unauthorized");
        }

        let payload = match self.encrypt(&data) {
            Ok(p) => p,
            Err(e) => {
                error!("[relay] Encryption failed: {}", e);
                return HttpResponse::error(500, "Internal Error");
            }
        };

        if let Err(e) = self.downstream.deliver(&json!({ "nonce": nonce, "payload": payload })).await {
            warn!("[relay] Downstream rejected submission: {}", e);
            return HttpResponse::error(502, "Upstream Error");
        }
        info!("[relay] Submission forwarded");
        HttpResponse::json(200, &json!({ "status": "ok" }))
    }

    fn encrypt(&self, data: &Value) -> EngineResult<String> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| EngineError::Config("no relay key configured".into()))?;
        crypto::encrypt_payload(&serde_json::to_vec(data)?, key)
    }
}
