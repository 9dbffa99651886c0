// Minimal HTTP/1.1 framing for the site server: one request per
// connection, `Connection: close` on every response.

use crate::atoms::constants::MAX_REQUEST_BYTES;
use crate::atoms::error::{EngineError, EngineResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Headers added to every response the server writes.
pub const SECURITY_HEADERS: [(&str, &str); 3] = [
    ("Strict-Transport-Security", "max-age=31536000; includeSubDomains; preload"),
    ("Referrer-Policy", "strict-origin-when-cross-origin"),
    ("X-Content-Type-Options", "nosniff"),
];

// ── Request ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawRequest {
    pub fn new(method: &str, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (target.to_string(), None),
        };
        RawRequest { method: method.to_ascii_uppercase(), path, query, ..Default::default() }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_json(mut self, body: &Value) -> Self {
        self.body = body.to_string().into_bytes();
        self.with_header("Content-Type", "application/json")
    }

    /// Parse a complete request (head and body) as read off the socket.
    pub fn parse(raw: &[u8]) -> EngineResult<Self> {
        let split = find_head_end(raw).ok_or_else(|| EngineError::Http("incomplete request head".into()))?;
        let head = std::str::from_utf8(&raw[..split]).map_err(|_| EngineError::Http("request head is not UTF-8".into()))?;
        let mut lines = head.split("\r\n");
        let first = lines.next().unwrap_or("");
        let mut parts = first.split_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            return Err(EngineError::Http(format!("malformed request line: {:?}", first)));
        };
        let mut req = RawRequest::new(method, target);
        for line in lines.filter(|l| !l.is_empty()) {
            if let Some((name, value)) = line.split_once(':') {
                req.headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
        let body = &raw[split + 4..];
        let len = req.content_length().unwrap_or(body.len()).min(body.len());
        req.body = body[..len].to_vec();
        Ok(req)
    }

    /// Case-insensitive header lookup; first occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("Cookie")?
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    pub fn json<T: DeserializeOwned>(&self) -> EngineResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

fn find_head_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Read one request: the head, then as much body as Content-Length
/// announces. Oversized requests are refused.
pub async fn read_request<R: AsyncRead + Unpin>(stream: &mut R) -> EngineResult<Option<RawRequest>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let mut expected: Option<usize> = None;
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(EngineError::Http(format!("request exceeds {} bytes", MAX_REQUEST_BYTES)));
        }
        if expected.is_none() {
            if let Some(end) = find_head_end(&buf) {
                let head = String::from_utf8_lossy(&buf[..end]);
                let length = head
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                expected = Some(end + 4 + length);
            }
        }
        if let Some(total) = expected {
            if buf.len() >= total {
                break;
            }
        }
    }
    RawRequest::parse(&buf).map(Some)
}

// ── Response ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json(status: u16, body: &Value) -> Self {
        HttpResponse { status, headers: Vec::new(), body: body.to_string().into_bytes() }
            .with_header("Content-Type", "application/json")
    }

    /// `{"error": message}` with a fixed, non-revealing message.
    pub fn error(status: u16, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }

    pub fn text(status: u16, body: &str) -> Self {
        HttpResponse { status, headers: Vec::new(), body: body.as_bytes().to_vec() }
            .with_header("Content-Type", "text/plain; charset=utf-8")
    }

    pub fn html(body: String) -> Self {
        HttpResponse { status: 200, headers: Vec::new(), body: body.into_bytes() }
            .with_header("Content-Type", "text/html; charset=utf-8")
    }

    pub fn no_content() -> Self {
        HttpResponse { status: 204, headers: Vec::new(), body: Vec::new() }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json_body(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Add the security headers unless a handler already set them.
    pub fn secured(mut self) -> Self {
        for (name, value) in SECURITY_HEADERS {
            if self.header(name).is_none() {
                self = self.with_header(name, value);
            }
        }
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, status_text(self.status));
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", self.body.len()));
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "Unknown",
    }
}
