// Cojoin Engine — Configuration
//
// One TOML file with a [client] and a [server] table, overlaid with
// environment variables. Every field has a default, so an empty file (or no
// file) yields a working development setup.
//
// Environment overrides:
//   PORT             server.port
//   SESSION_SECRET   server.session_secret
//   COJOIN_ENV       "production" sets server.production
//   CAPTCHA_SECRET   server.captcha_secret
//   RELAY_KEY        server.relay_key
//
// Production refuses to start with the development session secret.

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CaptchaProviderKind, DismissAction, ProofMode};
use crate::engine::crypto;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEV_SESSION_SECRET: &str = "dev-secret";

// ── Client ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

/// Launcher placement: offsets of `.fab-container` and size of `.fab-main`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FabGeometry {
    pub bottom: f64,
    pub right: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for FabGeometry {
    fn default() -> Self {
        FabGeometry { bottom: 24.0, right: 24.0, width: 56.0, height: 56.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Document origin; fragments must come from here.
    #[serde(default = "default_origin")]
    pub origin: String,
    /// Base URL of the worker endpoints (/chat, /nonce, /end-session, /honeypot-trip).
    #[serde(default = "default_origin")]
    pub worker_url: String,
    /// Form relay endpoint.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_inactivity")]
    pub inactivity_open_ms: u64,
    #[serde(default = "default_inactivity")]
    pub inactivity_minimized_ms: u64,
    #[serde(default = "default_drag_min_width")]
    pub drag_min_width: f64,
    #[serde(default = "default_proof_mode")]
    pub proof_mode: ProofMode,
    #[serde(default = "default_nonce_attempts")]
    pub nonce_attempts: u32,
    #[serde(default = "default_dismiss")]
    pub escape_action: DismissAction,
    #[serde(default = "default_dismiss")]
    pub outside_click_action: DismissAction,
    #[serde(default = "default_conversation_ttl")]
    pub conversation_ttl_secs: u64,
    #[serde(default = "default_captcha_provider")]
    pub captcha_provider: CaptchaProviderKind,
    #[serde(default = "default_widget_size")]
    pub widget_size: Size,
    #[serde(default)]
    pub fab: FabGeometry,
    #[serde(default = "default_reopen_width")]
    pub reopen_width: f64,
}

fn default_origin() -> String { "http://127.0.0.1:3000".into() }
fn default_relay_url() -> String { "http://127.0.0.1:3000/submit".into() }
fn default_user_agent() -> String { format!("cojoin/{}", env!("CARGO_PKG_VERSION")) }
fn default_inactivity() -> u64 { DEFAULT_INACTIVITY_OPEN_MS }
fn default_drag_min_width() -> f64 { DEFAULT_DRAG_MIN_WIDTH }
fn default_proof_mode() -> ProofMode { ProofMode::CaptchaAndNonce }
fn default_nonce_attempts() -> u32 { DEFAULT_NONCE_ATTEMPTS }
fn default_dismiss() -> DismissAction { DismissAction::Close }
fn default_conversation_ttl() -> u64 { CONVERSATION_TTL_SECS }
fn default_captcha_provider() -> CaptchaProviderKind { CaptchaProviderKind::Recaptcha }
fn default_widget_size() -> Size { Size { width: 360.0, height: 520.0 } }
fn default_reopen_width() -> f64 { 48.0 }

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            origin: default_origin(),
            worker_url: default_origin(),
            relay_url: default_relay_url(),
            user_agent: default_user_agent(),
            inactivity_open_ms: DEFAULT_INACTIVITY_OPEN_MS,
            inactivity_minimized_ms: DEFAULT_INACTIVITY_MINIMIZED_MS,
            drag_min_width: DEFAULT_DRAG_MIN_WIDTH,
            proof_mode: default_proof_mode(),
            nonce_attempts: DEFAULT_NONCE_ATTEMPTS,
            escape_action: DismissAction::Close,
            outside_click_action: DismissAction::Close,
            conversation_ttl_secs: CONVERSATION_TTL_SECS,
            captcha_provider: default_captcha_provider(),
            widget_size: default_widget_size(),
            fab: FabGeometry::default(),
            reopen_width: default_reopen_width(),
        }
    }
}

// ── Server ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Max requests per IP per minute (0 = unlimited)
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_session_secret", skip_serializing)]
    pub session_secret: String,
    #[serde(default)]
    pub production: bool,
    /// Directory holding the widget fragments served at /fabs/{id}.html.
    #[serde(default = "default_fragments_dir")]
    pub fragments_dir: String,
    #[serde(default = "default_captcha_provider")]
    pub captcha_provider: CaptchaProviderKind,
    /// Without a secret, CAPTCHA verification always fails.
    #[serde(default, skip_serializing)]
    pub captcha_secret: Option<String>,
    /// Downstream receiving encrypted form payloads.
    #[serde(default)]
    pub relay_downstream_url: Option<String>,
    /// 32-byte AES key, hex or base64.
    #[serde(default, skip_serializing)]
    pub relay_key: Option<String>,
    /// Where suspicious relay attempts are reported.
    #[serde(default)]
    pub relay_log_url: Option<String>,
    /// Upstream assistant for /chat. Unset echoes the message back.
    #[serde(default)]
    pub upstream_chat_url: Option<String>,
}

fn default_bind() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 3000 }
fn default_rate_limit() -> u32 { 60 }
fn default_session_secret() -> String { DEV_SESSION_SECRET.into() }
fn default_fragments_dir() -> String { "fabs".into() }

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: default_bind(),
            port: default_port(),
            rate_limit_per_minute: default_rate_limit(),
            session_secret: default_session_secret(),
            production: false,
            fragments_dir: default_fragments_dir(),
            captcha_provider: default_captcha_provider(),
            captcha_secret: None,
            relay_downstream_url: None,
            relay_key: None,
            relay_log_url: None,
            upstream_chat_url: None,
        }
    }
}

impl ServerConfig {
    pub fn relay_key_bytes(&self) -> EngineResult<Option<[u8; 32]>> {
        self.relay_key.as_deref().map(crypto::parse_key).transpose()
    }
}

// ── Site ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl SiteConfig {
    pub fn from_toml(src: &str) -> EngineResult<Self> {
        Ok(toml::from_str(src)?)
    }

    /// File (optional) + process environment, validated.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_toml(&std::fs::read_to_string(p)?)?,
            None => Self::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, var: F) {
        if let Some(port) = var("PORT").and_then(|p| p.trim().parse().ok()) {
            self.server.port = port;
        }
        if let Some(secret) = var("SESSION_SECRET").filter(|s| !s.is_empty()) {
            self.server.session_secret = secret;
        }
        if var("COJOIN_ENV").as_deref() == Some("production") {
            self.server.production = true;
        }
        if let Some(secret) = var("CAPTCHA_SECRET").filter(|s| !s.is_empty()) {
            self.server.captcha_secret = Some(secret);
        }
        if let Some(key) = var("RELAY_KEY").filter(|s| !s.is_empty()) {
            self.server.relay_key = Some(key);
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let secret = self.server.session_secret.trim();
        if self.server.production && (secret.is_empty() || secret == DEV_SESSION_SECRET) {
            return Err(EngineError::Config("SESSION_SECRET must be set in production".into()));
        }
        if self.client.nonce_attempts == 0 {
            return Err(EngineError::Config("client.nonce_attempts must be at least 1".into()));
        }
        self.server.relay_key_bytes()?;
        url::Url::parse(&self.client.origin)
            .map_err(|e| EngineError::Config(format!("client.origin: {}", e)))?;
        Ok(())
    }
}
