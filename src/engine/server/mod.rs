// Cojoin Engine — Site Server
//
// Raw `tokio::net::TcpListener`, no framework dependency. Routes:
//   GET  /api/csrf-token     issue a session CSRF token
//   POST /api/contact        CSRF-checked contact endpoint, rotates the token
//   POST /nonce              claim a nonce (200 | 409 | 400 | 405)
//   POST /chat               assistant reply; needs a claimed nonce
//   POST /end-session        drop the cookie session
//   POST /honeypot-trip      record a trip
//   POST /submit             form relay (see relay.rs)
//   GET  /fabs/{id}.html     widget fragments
//   GET  /health             liveness probe
//
// Rate limiting: fixed one-minute window per source IP.
// Every response carries the security headers in request::SECURITY_HEADERS.

pub mod assistant;
pub mod nonces;
pub mod relay;
pub mod request;
pub mod session;

use crate::atoms::constants::CSRF_REFUSED_ERROR;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ChatReply, ChatRequest, HoneypotTrip, NonceClaim, WidgetId};
use crate::engine::chat::preview;
use crate::engine::config::ServerConfig;
use assistant::{Assistant, EchoAssistant, UpstreamAssistant};
use log::{debug, error, info, warn};
use nonces::{is_valid_nonce, NonceRegistry};
use relay::{CaptchaVerifier, Downstream, FormRelay, HttpDownstream, SiteVerifyClient};
use request::{read_request, HttpResponse, RawRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use session::SessionBook;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

// ── Rate Limiter ───────────────────────────────────────────────────────

pub struct RateLimiter {
    /// IP → (count, window_start)
    buckets: parking_lot::Mutex<HashMap<String, (u32, Instant)>>,
    limit: u32,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        RateLimiter { buckets: parking_lot::Mutex::new(HashMap::new()), limit }
    }

    /// Returns true if the request is allowed, false if rate-limited.
    pub fn check(&self, ip: &str) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut map = self.buckets.lock();
        let now = Instant::now();
        let entry = map.entry(ip.to_string()).or_insert((0, now));
        if now.duration_since(entry.1).as_secs() >= 60 {
            *entry = (0, now);
        }
        if entry.0 >= self.limit {
            false
        } else {
            entry.0 += 1;
            true
        }
    }

    fn prune(&self) {
        self.buckets.lock().retain(|_, (_, start)| start.elapsed().as_secs() < 60);
    }
}

// ── Server ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct NonceBody {
    nonce: Option<Value>,
}

#[derive(Deserialize)]
struct ContactBody {
    #[serde(default, rename = "csrfToken")]
    csrf_token: Option<String>,
}

pub struct SiteServer {
    config: ServerConfig,
    rate_limiter: RateLimiter,
    sessions: SessionBook,
    nonces: Arc<NonceRegistry>,
    relay: FormRelay,
    assistant: Arc<dyn Assistant>,
    captcha: Arc<dyn CaptchaVerifier>,
    requests: AtomicU64,
}

impl SiteServer {
    /// Wire the production backends from `config`.
    pub fn new(config: ServerConfig) -> EngineResult<Self> {
        let captcha: Arc<dyn CaptchaVerifier> =
            Arc::new(SiteVerifyClient::new(config.captcha_provider, config.captcha_secret.clone())?);
        let downstream: Arc<dyn Downstream> =
            Arc::new(HttpDownstream::new(config.relay_downstream_url.clone(), config.relay_log_url.clone())?);
        let assistant: Arc<dyn Assistant> = match config.upstream_chat_url.as_deref() {
            Some(url) => Arc::new(UpstreamAssistant::new(url)?),
            None => {
                warn!("[server] No upstream chat URL; /chat echoes messages");
                Arc::new(EchoAssistant)
            }
        };
        Self::with_parts(config, captcha, downstream, assistant)
    }

    pub fn with_parts(
        config: ServerConfig,
        captcha: Arc<dyn CaptchaVerifier>,
        downstream: Arc<dyn Downstream>,
        assistant: Arc<dyn Assistant>,
    ) -> EngineResult<Self> {
        let key = config.relay_key_bytes()?;
        if key.is_none() {
            warn!("[server] No relay key; /submit will answer 500");
        }
        Ok(SiteServer {
            rate_limiter: RateLimiter::new(config.rate_limit_per_minute),
            sessions: SessionBook::new(&config.session_secret, config.production),
            nonces: Arc::new(NonceRegistry::default()),
            relay: FormRelay::new(captcha.clone(), downstream, key),
            assistant,
            captcha,
            requests: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn nonces(&self) -> Arc<NonceRegistry> {
        self.nonces.clone()
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Route one request. Never fails: errors become JSON error bodies.
    pub async fn handle(&self, req: &RawRequest, peer_ip: &str) -> HttpResponse {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.route(req, peer_ip).await.secured()
    }

    async fn route(&self, req: &RawRequest, peer_ip: &str) -> HttpResponse {
        let method = req.method.as_str();
        let path = req.path.as_str();
        debug!("[server] {} {} from {}", method, path, peer_ip);

        if method == "GET" && path == "/health" {
            return HttpResponse::json(200, &json!({ "ok": true, "requests": self.request_count() }));
        }
        if method == "OPTIONS" {
            return HttpResponse::no_content()
                .with_header("Allow", "GET, POST, OPTIONS")
                .with_header("Access-Control-Allow-Headers", "Content-Type, X-CSRF-Token");
        }
        if !self.rate_limiter.check(peer_ip) {
            warn!("[server] Rate limited {}", peer_ip);
            return HttpResponse::error(429, "Too many requests");
        }

        match (method, path) {
            ("GET", "/api/csrf-token") => self.csrf_token(req),
            ("POST", "/api/contact") => self.contact(req),
            (_, "/nonce") => self.nonce(req),
            ("POST", "/chat") => self.chat(req, peer_ip).await,
            ("POST", "/end-session") => self.end_session(req),
            ("POST", "/honeypot-trip") => self.honeypot_trip(req, peer_ip),
            ("POST", "/submit") => match req.json::<Value>() {
                Ok(body) => self.relay.submit(&body, &self.nonces, Some(peer_ip)).await,
                Err(_) => HttpResponse::error(400, "Bad Request"),
            },
            ("GET", p) if p.starts_with("/fabs/") => self.fragment(p).await,
            _ => HttpResponse::error(404, "Not found"),
        }
    }

    fn csrf_token(&self, req: &RawRequest) -> HttpResponse {
        let issued = self.sessions.resolve(req).and_then(|s| {
            let token = self.sessions.issue_csrf(&s.id)?;
            Ok((s, token))
        });
        match issued {
            Ok((session, token)) => with_cookie(HttpResponse::json(200, &json!({ "token": token })), session.set_cookie),
            Err(e) => internal_error(e),
        }
    }

    fn contact(&self, req: &RawRequest) -> HttpResponse {
        let presented = req.json::<ContactBody>().ok().and_then(|b| b.csrf_token);
        let session = match self.sessions.resolve(req) {
            Ok(s) => s,
            Err(e) => return internal_error(e),
        };
        match self.sessions.rotate_csrf(&session.id, presented.as_deref()) {
            Ok(Some(next)) => {
                info!("[server] Contact request accepted");
                with_cookie(HttpResponse::json(200, &json!({ "ok": true })), session.set_cookie)
                    .with_header("X-CSRF-Token", &next)
            }
            Ok(None) => with_cookie(HttpResponse::error(403, CSRF_REFUSED_ERROR), session.set_cookie),
            Err(e) => internal_error(e),
        }
    }

    fn nonce(&self, req: &RawRequest) -> HttpResponse {
        if req.method != "POST" {
            return HttpResponse::text(405, "Method Not Allowed");
        }
        let nonce = match req.json::<NonceBody>() {
            Ok(NonceBody { nonce: Some(Value::String(n)) }) if is_valid_nonce(&n) => n,
            _ => return HttpResponse::text(400, "Bad Request"),
        };
        match self.nonces.claim(&nonce) {
            NonceClaim::Claimed => HttpResponse::json(200, &json!({ "ok": true })),
            NonceClaim::Reused => HttpResponse::error(409, "nonce-reused"),
        }
    }

    async fn chat(&self, req: &RawRequest, peer_ip: &str) -> HttpResponse {
        let Ok(body) = req.json::<ChatRequest>() else {
            return HttpResponse::error(400, "Bad Request");
        };
        if body.message.trim().is_empty() {
            return HttpResponse::error(400, "Bad Request");
        }
        match body.nonce.as_deref() {
            Some(n) if self.nonces.is_claimed(n) => {}
            _ => return HttpResponse::error(401, "Unauthorized"),
        }
        if self.config.captcha_secret.is_some() {
            let token = body.recaptcha_token.as_deref().or(body.hcaptcha_response.as_deref()).unwrap_or("");
            if !self.captcha.verify(token, Some(peer_ip)).await {
                return HttpResponse::error(401, "Unauthorized");
            }
        }
        info!("[server] Chat \"{}\"", preview(&body.message));
        match self.assistant.reply(&body.message).await {
            Ok(reply) => match serde_json::to_value(ChatReply { reply }) {
                Ok(v) => HttpResponse::json(200, &v),
                Err(e) => internal_error(e.into()),
            },
            Err(e) => {
                warn!("[server] Assistant unavailable: {}", e);
                HttpResponse::error(502, "Upstream Error")
            }
        }
    }

    fn end_session(&self, req: &RawRequest) -> HttpResponse {
        if let Some(id) = req
            .cookie(session::SESSION_COOKIE)
            .and_then(|c| crate::engine::crypto::unsign(self.config.session_secret.as_bytes(), c))
        {
            self.sessions.end(&id);
            debug!("[server] Session ended");
        }
        HttpResponse::no_content()
    }

    fn honeypot_trip(&self, req: &RawRequest, peer_ip: &str) -> HttpResponse {
        match req.json::<HoneypotTrip>() {
            Ok(trip) => {
                warn!("[server] Honeypot trip from {}: {} ({})", peer_ip, trip.reason, preview(&trip.ua));
                HttpResponse::no_content()
            }
            Err(_) => HttpResponse::error(400, "Bad Request"),
        }
    }

    /// Only names from the widget enumeration resolve to a file.
    async fn fragment(&self, path: &str) -> HttpResponse {
        let Some(id) = WidgetId::ALL.into_iter().find(|w| w.fragment_path() == path) else {
            return HttpResponse::error(404, "Not found");
        };
        let file = PathBuf::from(&self.config.fragments_dir).join(format!("{}.html", id.as_str()));
        match tokio::fs::read_to_string(&file).await {
            Ok(html) => HttpResponse::html(html),
            Err(e) => {
                warn!("[server] Fragment {} unreadable: {}", file.display(), e);
                HttpResponse::error(404, "Not found")
            }
        }
    }

    fn prune(&self) {
        self.nonces.prune();
        self.rate_limiter.prune();
    }
}

fn with_cookie(resp: HttpResponse, cookie: Option<String>) -> HttpResponse {
    match cookie {
        Some(c) => resp.with_header("Set-Cookie", &c),
        None => resp,
    }
}

fn internal_error(e: EngineError) -> HttpResponse {
    error!("[server] Internal error: {}", e);
    HttpResponse::error(500, "Internal Error")
}

// ── HTTP Server ────────────────────────────────────────────────────────

/// Accept connections until `stop` is set. The flag is polled once a second.
pub async fn run_server(server: Arc<SiteServer>, stop: Arc<AtomicBool>) -> EngineResult<()> {
    let addr = format!("{}:{}", server.config.bind_address, server.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::Config(format!("Bind {} failed: {}", addr, e)))?;

    if server.config.bind_address != "127.0.0.1" && server.config.bind_address != "localhost" {
        warn!("[server] Binding to {}; terminate TLS in front of it", server.config.bind_address);
    }
    info!("[server] Listening on http://{}", addr);

    let mut last_prune = Instant::now();
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if last_prune.elapsed() >= PRUNE_INTERVAL {
            server.prune();
            last_prune = Instant::now();
        }

        let accept = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        match accept {
            Ok(Ok((stream, peer))) => {
                let srv = server.clone();
                tokio::spawn(async move {
                    let peer_ip = peer.ip().to_string();
                    if let Err(e) = handle_connection(stream, &peer_ip, &srv).await {
                        warn!("[server] Request error from {}: {}", peer_ip, e);
                    }
                });
            }
            Ok(Err(e)) => warn!("[server] Accept error: {}", e),
            Err(_) => {}
        }
    }

    info!("[server] Server stopped after {} requests", server.request_count());
    Ok(())
}

/// One request, one response, then the connection closes.
pub async fn handle_connection<S>(mut stream: S, peer_ip: &str, server: &SiteServer) -> EngineResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let resp = match read_request(&mut stream).await {
        Ok(Some(req)) => server.handle(&req, peer_ip).await,
        Ok(None) => return Ok(()),
        Err(EngineError::Http(msg)) => {
            debug!("[server] Malformed request from {}: {}", peer_ip, msg);
            let status = if msg.starts_with("request exceeds") { 413 } else { 400 };
            HttpResponse::error(status, "Malformed request").secured()
        }
        Err(e) => return Err(e),
    };
    stream.write_all(&resp.to_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;

    struct AcceptAll;

    #[async_trait]
    impl CaptchaVerifier for AcceptAll {
        async fn verify(&self, token: &str, _remote_ip: Option<&str>) -> bool {
            token == "good"
        }
    }

    struct NullDownstream;

    #[async_trait]
    impl Downstream for NullDownstream {
        async fn deliver(&self, _envelope: &Value) -> EngineResult<()> {
            Ok(())
        }
        async fn log_suspicious(&self, _attempt: &Value) {}
    }

    fn server(config: ServerConfig) -> SiteServer {
        SiteServer::with_parts(config, Arc::new(AcceptAll), Arc::new(NullDownstream), Arc::new(EchoAssistant)).unwrap()
    }

    fn post(path: &str, body: Value) -> RawRequest {
        RawRequest::new("POST", path).with_json(&body)
    }

    #[test]
    fn rate_limiter_allows_within_limit() {
        let rl = RateLimiter::new(3);
        assert!(rl.check("1.2.3.4"));
        assert!(rl.check("1.2.3.4"));
        assert!(rl.check("1.2.3.4"));
        assert!(!rl.check("1.2.3.4"));
        assert!(rl.check("5.6.7.8"));
    }

    #[test]
    fn rate_limiter_unlimited() {
        let rl = RateLimiter::new(0);
        for _ in 0..1000 {
            assert!(rl.check("1.2.3.4"));
        }
    }

    #[tokio::test]
    async fn nonce_endpoint_contract() {
        let srv = server(ServerConfig::default());
        let ok = srv.handle(&post("/nonce", json!({ "nonce": "abc123" })), "ip").await;
        assert_eq!(ok.status, 200);
        assert_eq!(ok.json_body().unwrap(), json!({ "ok": true }));
        let again = srv.handle(&post("/nonce", json!({ "nonce": "abc123" })), "ip").await;
        assert_eq!(again.status, 409);
        assert_eq!(again.json_body().unwrap(), json!({ "error": "nonce-reused" }));
        assert_eq!(srv.handle(&post("/nonce", json!({})), "ip").await.status, 400);
        assert_eq!(srv.handle(&post("/nonce", json!({ "nonce": 5 })), "ip").await.status, 400);
        assert_eq!(srv.handle(&RawRequest::new("GET", "/nonce"), "ip").await.status, 405);
    }

    #[tokio::test]
    async fn csrf_issue_and_rotate() {
        let srv = server(ServerConfig::default());
        let issued = srv.handle(&RawRequest::new("GET", "/api/csrf-token"), "ip").await;
        let cookie = issued.header("Set-Cookie").unwrap().split(';').next().unwrap().to_string();
        let token = issued.json_body().unwrap()["token"].as_str().unwrap().to_string();
        assert_eq!(token.len(), 64);

        let contact = |t: &str| post("/api/contact", json!({ "csrfToken": t })).with_header("Cookie", &cookie);
        let accepted = srv.handle(&contact(&token), "ip").await;
        assert_eq!(accepted.status, 200);
        let next = accepted.header("X-CSRF-Token").unwrap().to_string();
        assert_ne!(next, token);

        let replay = srv.handle(&contact(&token), "ip").await;
        assert_eq!(replay.status, 403);
        assert_eq!(replay.json_body().unwrap(), json!({ "error": "Invalid CSRF token" }));
        assert_eq!(srv.handle(&contact(&next), "ip").await.status, 200);
    }

    #[tokio::test]
    async fn contact_without_session_is_forbidden() {
        let srv = server(ServerConfig::default());
        let resp = srv.handle(&post("/api/contact", json!({ "csrfToken": "x" })), "ip").await;
        assert_eq!(resp.status, 403);
    }

    #[tokio::test]
    async fn chat_requires_a_claimed_nonce() {
        let srv = server(ServerConfig::default());
        let msg = |n: &str| post("/chat", json!({ "message": "hi", "nonce": n }));
        assert_eq!(srv.handle(&msg("n1"), "ip").await.status, 401);
        srv.handle(&post("/nonce", json!({ "nonce": "n1" })), "ip").await;
        let resp = srv.handle(&msg("n1"), "ip").await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.json_body().unwrap()["reply"], "You said: hi");
    }

    #[tokio::test]
    async fn chat_verifies_captcha_when_a_secret_is_set() {
        let config = ServerConfig { captcha_secret: Some("secret".into()), ..Default::default() };
        let srv = server(config);
        srv.handle(&post("/nonce", json!({ "nonce": "n1" })), "ip").await;
        let bad = post("/chat", json!({ "message": "hi", "nonce": "n1", "recaptchaToken": "bad" }));
        assert_eq!(srv.handle(&bad, "ip").await.status, 401);
        let good = post("/chat", json!({ "message": "hi", "nonce": "n1", "h-captcha-response": "good" }));
        assert_eq!(srv.handle(&good, "ip").await.status, 200);
    }

    #[tokio::test]
    async fn rate_limit_and_security_headers() {
        let srv = server(ServerConfig { rate_limit_per_minute: 1, ..Default::default() });
        let first = srv.handle(&RawRequest::new("GET", "/nope"), "9.9.9.9").await;
        assert_eq!(first.status, 404);
        assert_eq!(first.header("X-Content-Type-Options"), Some("nosniff"));
        let second = srv.handle(&RawRequest::new("GET", "/nope"), "9.9.9.9").await;
        assert_eq!(second.status, 429);
        assert!(second.header("Strict-Transport-Security").is_some());
    }

    #[tokio::test]
    async fn fragments_come_from_the_widget_set() {
        let dir = std::env::temp_dir().join(format!("cojoin-fabs-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("join.html"), "<div class=\"modal-container\"></div>").unwrap();
        let srv = server(ServerConfig { fragments_dir: dir.display().to_string(), ..Default::default() });

        let ok = srv.handle(&RawRequest::new("GET", "/fabs/join.html"), "ip").await;
        assert_eq!(ok.status, 200);
        assert_eq!(ok.header("Content-Type"), Some("text/html; charset=utf-8"));
        assert_eq!(srv.handle(&RawRequest::new("GET", "/fabs/../secret.html"), "ip").await.status, 404);
        assert_eq!(srv.handle(&RawRequest::new("GET", "/fabs/contact.html"), "ip").await.status, 404);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn sinks_answer_no_content() {
        let srv = server(ServerConfig::default());
        let trip = post("/honeypot-trip", json!({ "reason": "hp_text_touched", "ts": 1, "ua": "bot" }));
        assert_eq!(srv.handle(&trip, "ip").await.status, 204);
        assert_eq!(srv.handle(&post("/honeypot-trip", json!({})), "ip").await.status, 400);
        assert_eq!(srv.handle(&RawRequest::new("POST", "/end-session"), "ip").await.status, 204);
    }

    #[tokio::test]
    async fn connection_round_trip() {
        let srv = server(ServerConfig::default());
        let (mut client, server_side) = tokio::io::duplex(8192);
        let body = r#"{"nonce":"wire-1"}"#;
        let raw = format!("POST /nonce HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
        client.write_all(raw.as_bytes()).await.unwrap();

        handle_connection(server_side, "ip", &srv).await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Connection: close"));
        assert!(out.ends_with("{\"ok\":true}"));
        assert!(srv.nonces().is_claimed("wire-1"));
    }
}
