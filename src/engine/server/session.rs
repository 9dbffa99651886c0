// Signed-cookie sessions carrying one CSRF token each.
//
// The cookie holds `session_id.hmac`. A token is valid for CSRF_TTL_SECS,
// only the latest one counts, and a successful check replaces it.

use super::request::RawRequest;
use crate::atoms::constants::{CSRF_TTL_SECS, SESSION_MAX_AGE_SECS};
use crate::atoms::error::EngineResult;
use crate::engine::crypto;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const SESSION_COOKIE: &str = "cojoin_session";

struct CsrfToken {
    value: String,
    expires: Instant,
}

struct Session {
    csrf: Option<CsrfToken>,
    touched: Instant,
}

/// Session id for a request, plus the `Set-Cookie` value when it is new.
pub struct SessionHandle {
    pub id: String,
    pub set_cookie: Option<String>,
}

pub struct SessionBook {
    secret: Vec<u8>,
    secure_cookie: bool,
    csrf_ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionBook {
    pub fn new(secret: &str, secure_cookie: bool) -> Self {
        SessionBook {
            secret: secret.as_bytes().to_vec(),
            secure_cookie,
            csrf_ttl: Duration::from_secs(CSRF_TTL_SECS),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_csrf_ttl(mut self, ttl: Duration) -> Self {
        self.csrf_ttl = ttl;
        self
    }

    /// Reuse the session named by a correctly signed cookie, else start one.
    pub fn resolve(&self, req: &RawRequest) -> EngineResult<SessionHandle> {
        self.prune();
        let now = Instant::now();
        if let Some(id) = req.cookie(SESSION_COOKIE).and_then(|c| crypto::unsign(&self.secret, c)) {
            self.sessions
                .lock()
                .entry(id.clone())
                .and_modify(|s| s.touched = now)
                .or_insert(Session { csrf: None, touched: now });
            return Ok(SessionHandle { id, set_cookie: None });
        }
        let id = crypto::random_hex(16)?;
        let signed = crypto::sign(&self.secret, &id)?;
        self.sessions.lock().insert(id.clone(), Session { csrf: None, touched: now });
        debug!("[server] New session");
        Ok(SessionHandle { id, set_cookie: Some(self.cookie_header(&signed)) })
    }

    /// Issue a fresh token, replacing any previous one.
    pub fn issue_csrf(&self, session: &str) -> EngineResult<String> {
        let token = crypto::random_hex(32)?;
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .entry(session.to_string())
            .or_insert(Session { csrf: None, touched: Instant::now() });
        entry.csrf = Some(CsrfToken { value: token.clone(), expires: Instant::now() + self.csrf_ttl });
        Ok(token)
    }

    /// Check `presented` against the session's token. On success the token
    /// rotates and the replacement is returned.
    pub fn rotate_csrf(&self, session: &str, presented: Option<&str>) -> EngineResult<Option<String>> {
        let valid = {
            let sessions = self.sessions.lock();
            match (sessions.get(session).and_then(|s| s.csrf.as_ref()), presented) {
                (Some(token), Some(p)) => Instant::now() <= token.expires && crypto::constant_time_eq(&token.value, p),
                _ => false,
            }
        };
        if !valid {
            info!("[server] CSRF check failed");
            return Ok(None);
        }
        self.issue_csrf(session).map(Some)
    }

    pub fn end(&self, session: &str) {
        self.sessions.lock().remove(session);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self) {
        let max_age = Duration::from_secs(SESSION_MAX_AGE_SECS);
        self.sessions.lock().retain(|_, s| s.touched.elapsed() < max_age);
    }

    fn cookie_header(&self, signed: &str) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Strict",
            SESSION_COOKIE, signed, SESSION_MAX_AGE_SECS
        );
        if self.secure_cookie {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_cookie(set_cookie: &str) -> RawRequest {
        let pair = set_cookie.split(';').next().unwrap();
        RawRequest::new("POST", "/api/contact").with_header("Cookie", pair)
    }

    #[test]
    fn signed_cookie_resumes_the_session() {
        let book = SessionBook::new("secret", false);
        let first = book.resolve(&RawRequest::new("GET", "/api/csrf-token")).unwrap();
        let cookie = first.set_cookie.unwrap();
        assert!(cookie.contains("HttpOnly") && cookie.contains("SameSite=Strict"));
        assert!(!cookie.contains("Secure"));
        let again = book.resolve(&with_cookie(&cookie)).unwrap();
        assert_eq!(again.id, first.id);
        assert!(again.set_cookie.is_none());
    }

    #[test]
    fn forged_cookie_starts_a_new_session() {
        let book = SessionBook::new("secret", true);
        let req = RawRequest::new("GET", "/").with_header("Cookie", "cojoin_session=abc.forged");
        let handle = book.resolve(&req).unwrap();
        assert_ne!(handle.id, "abc");
        assert!(handle.set_cookie.unwrap().ends_with("; Secure"));
    }

    #[test]
    fn token_rotates_on_use() {
        let book = SessionBook::new("secret", false);
        let token = book.issue_csrf("s1").unwrap();
        let next = book.rotate_csrf("s1", Some(&token)).unwrap().unwrap();
        assert_ne!(next, token);
        assert!(book.rotate_csrf("s1", Some(&token)).unwrap().is_none());
        assert!(book.rotate_csrf("s1", None).unwrap().is_none());
        assert!(book.rotate_csrf("s1", Some(&next)).unwrap().is_some());
    }

    #[test]
    fn expired_token_is_rejected() {
        let book = SessionBook::new("secret", false).with_csrf_ttl(Duration::ZERO);
        let token = book.issue_csrf("s1").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(book.rotate_csrf("s1", Some(&token)).unwrap().is_none());
    }
}
