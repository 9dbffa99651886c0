// Cojoin Engine — Modal Forms
//
// Contact and join modals post their fields, plus the gate's proof and the
// session CSRF token, to the form relay. This module reads fields out of the
// document and reports the outcome in the form's `.form-status` element.
//
// CSRF tokens are single use: the site answers an accepted post with the
// next token in `X-CSRF-Token`, and a refused one with 403.

use crate::atoms::constants::{CSRF_FIELD, FORM_STATUS_CLASS};
use crate::atoms::error::EngineResult;
use crate::atoms::types::WidgetId;
use crate::engine::dom::{Document, NodeId};
use crate::engine::gate::Honeypot;
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormOutcome {
    /// `rotated` carries the next CSRF token when the site issued one.
    Accepted { rotated: Option<String> },
    /// The relay refused the nonce claim. A fresh nonce may succeed.
    NonceRejected,
    /// The CSRF token was missing, stale or already used.
    CsrfRejected,
    Rejected(u16),
}

#[async_trait]
pub trait FormTransport: Send + Sync {
    async fn submit(&self, widget: WidgetId, fields: &BTreeMap<String, String>) -> EngineResult<FormOutcome>;
}

/// Issues a fresh CSRF token for the visitor's session.
#[async_trait]
pub trait CsrfSource: Send + Sync {
    async fn fetch(&self) -> EngineResult<String>;
}

/// The page's current CSRF token. Fetched on first use, replaced by each
/// rotation, dropped after a refusal so the next submit fetches again.
pub struct CsrfTokens {
    source: Option<Arc<dyn CsrfSource>>,
    current: Mutex<Option<String>>,
}

impl CsrfTokens {
    pub fn new(source: Arc<dyn CsrfSource>) -> Self {
        CsrfTokens { source: Some(source), current: Mutex::new(None) }
    }

    /// No token endpoint; forms post without one.
    pub fn disabled() -> Self {
        CsrfTokens { source: None, current: Mutex::new(None) }
    }

    /// Cached token, or a freshly fetched one. A failed fetch is logged and
    /// the form goes out without a token.
    pub async fn token(&self) -> Option<String> {
        if let Some(t) = self.current.lock().clone() {
            return Some(t);
        }
        let source = self.source.as_ref()?;
        match source.fetch().await {
            Ok(t) => {
                debug!("[relay] CSRF token fetched");
                *self.current.lock() = Some(t.clone());
                Some(t)
            }
            Err(e) => {
                warn!("[relay] Failed to retrieve CSRF token: {}", e);
                None
            }
        }
    }

    /// Adopt the site's rotated token. Without one the used token is spent.
    pub fn rotate(&self, next: Option<String>) {
        *self.current.lock() = next;
    }

    pub fn invalidate(&self) {
        self.current.lock().take();
    }

    pub fn current(&self) -> Option<String> {
        self.current.lock().clone()
    }
}

/// Put the CSRF token into an outgoing payload.
pub fn attach_csrf(fields: &mut BTreeMap<String, String>, token: Option<&str>) {
    match token {
        Some(t) => {
            fields.insert(CSRF_FIELD.to_string(), t.to_string());
        }
        None => {
            fields.remove(CSRF_FIELD);
        }
    }
}

/// Named fields of `form`, honeypot excluded. Checkboxes report "on" when checked.
pub fn collect_fields(doc: &Document, form: NodeId, honeypot: Option<&Honeypot>) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for node in doc.query_all(form, "input, textarea, select") {
        if honeypot.map(|h| h.contains(doc, node)).unwrap_or(false) {
            continue;
        }
        let Some(el) = doc.element(node) else { continue };
        let Some(name) = el.attr("name").or(el.id.as_deref()) else { continue };
        match el.attr("type") {
            Some("checkbox") | Some("radio") => {
                if el.checked {
                    let v = if el.value.is_empty() { "on" } else { el.value.as_str() };
                    fields.insert(name.to_string(), v.to_string());
                }
            }
            Some("submit") | Some("button") => {}
            _ => {
                fields.insert(name.to_string(), el.value.trim().to_string());
            }
        }
    }
    fields
}

/// Write `message` into the form's status line, creating it if the fragment has none.
pub fn set_status(doc: &mut Document, form: NodeId, message: &str) -> NodeId {
    let status = match doc.query(form, &format!(".{}", FORM_STATUS_CLASS)) {
        Some(n) => n,
        None => {
            let n = doc.create_element("p");
            if let Some(el) = doc.element_mut(n) {
                el.add_class(FORM_STATUS_CLASS);
                el.set_attr("role", "status");
            }
            doc.append_child(form, n);
            n
        }
    };
    doc.set_text(status, message);
    status
}

pub fn status_text(doc: &Document, form: NodeId) -> Option<String> {
    doc.query(form, &format!(".{}", FORM_STATUS_CLASS)).map(|n| doc.text(n).to_string())
}

/// Empty the form's fields after a successful send.
pub fn reset(doc: &mut Document, form: NodeId, honeypot: Option<&Honeypot>) {
    for node in doc.query_all(form, "input, textarea, select") {
        if honeypot.map(|h| h.contains(doc, node)).unwrap_or(false) {
            continue;
        }
        doc.set_value(node, "");
        doc.set_checked(node, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dom::Viewport;
    use crate::engine::gate::inject_honeypot;

    #[test]
    fn collects_named_fields_without_decoys() {
        let mut doc = Document::new("https://site.test", Viewport::new(1024.0, 768.0));
        let form = doc.create_element("form");
        doc.append_child(doc.body(), form);
        let name = doc.create_element("input");
        let msg = doc.create_element("textarea");
        let agree = doc.create_element("input");
        doc.element_mut(name).unwrap().set_attr("name", "name");
        doc.element_mut(msg).unwrap().id = Some("message".into());
        {
            let el = doc.element_mut(agree).unwrap();
            el.set_attr("name", "agree");
            el.set_attr("type", "checkbox");
            el.checked = true;
        }
        for n in [name, msg, agree] {
            doc.append_child(form, n);
        }
        doc.set_value(name, "  Ana ");
        doc.set_value(msg, "Hola");
        let hp = inject_honeypot(&mut doc, form).unwrap();
        doc.set_value(hp.text, "bot");

        let fields = collect_fields(&doc, form, Some(&hp));
        assert_eq!(fields.get("name").map(String::as_str), Some("Ana"));
        assert_eq!(fields.get("message").map(String::as_str), Some("Hola"));
        assert_eq!(fields.get("agree").map(String::as_str), Some("on"));
        assert!(!fields.contains_key("hp_text"));
    }

    struct Issuer {
        issued: Mutex<u32>,
        fail: bool,
    }

    #[async_trait]
    impl CsrfSource for Issuer {
        async fn fetch(&self) -> EngineResult<String> {
            if self.fail {
                return Err(crate::atoms::error::EngineError::transport("csrf", "HTTP 500"));
            }
            let mut n = self.issued.lock();
            *n += 1;
            Ok(format!("t{}", n))
        }
    }

    #[tokio::test]
    async fn csrf_token_is_cached_until_rotated_or_refused() {
        let issuer = Arc::new(Issuer { issued: Mutex::new(0), fail: false });
        let tokens = CsrfTokens::new(issuer.clone());
        assert_eq!(tokens.token().await.as_deref(), Some("t1"));
        assert_eq!(tokens.token().await.as_deref(), Some("t1"));
        tokens.rotate(Some("server-next".into()));
        assert_eq!(tokens.token().await.as_deref(), Some("server-next"));
        tokens.invalidate();
        assert_eq!(tokens.token().await.as_deref(), Some("t2"));
        assert_eq!(*issuer.issued.lock(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_sends_without_a_token() {
        let tokens = CsrfTokens::new(Arc::new(Issuer { issued: Mutex::new(0), fail: true }));
        assert!(tokens.token().await.is_none());
        assert!(CsrfTokens::disabled().token().await.is_none());

        let mut fields = BTreeMap::from([(CSRF_FIELD.to_string(), "stale".to_string())]);
        attach_csrf(&mut fields, None);
        assert!(!fields.contains_key(CSRF_FIELD));
        attach_csrf(&mut fields, Some("t9"));
        assert_eq!(fields.get(CSRF_FIELD).map(String::as_str), Some("t9"));
    }

    #[test]
    fn status_line_is_created_on_demand() {
        let mut doc = Document::new("https://site.test", Viewport::new(1024.0, 768.0));
        let form = doc.create_element("form");
        doc.append_child(doc.body(), form);
        assert!(status_text(&doc, form).is_none());
        let a = set_status(&mut doc, form, "Sending");
        let b = set_status(&mut doc, form, "Done");
        assert_eq!(a, b);
        assert_eq!(status_text(&doc, form).as_deref(), Some("Done"));
    }
}
