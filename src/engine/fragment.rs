// Cojoin Engine — Fragment Loader
//
// Fetches a widget's HTML fragment from the site origin, validates it,
// sanitizes it, parses it in a detached context and hands back a plain tree
// the controller can materialize into the document exactly once.
//
// Rejections (all logged, none fatal to the page):
//   • status outside 2xx
//   • response origin different from the document origin
//   • content type other than text/html (absent counts as other)
//   • no root node matching the widget's fixed selector
//
// Sanitizing is mandatory. A loader built without a sanitizer refuses to
// load anything.
//
// The loader never starts timers or registers listeners.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{RootSelector, WidgetId};
use crate::engine::dom::{Document, NodeId};
use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use scraper::{ElementRef, Html, Node};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

// ── Source ─────────────────────────────────────────────────────────────

/// Raw response for one fragment request.
#[derive(Debug, Clone)]
pub struct FetchedFragment {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

#[async_trait]
pub trait FragmentSource: Send + Sync {
    async fn fetch(&self, url: &str) -> EngineResult<FetchedFragment>;
}

/// Same-origin fetch with cookies, as a browser `fetch(..., {credentials: "same-origin"})`.
pub struct HttpFragmentSource {
    client: Client,
}

impl HttpFragmentSource {
    pub fn new() -> EngineResult<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(HttpFragmentSource { client })
    }
}

#[async_trait]
impl FragmentSource for HttpFragmentSource {
    async fn fetch(&self, url: &str) -> EngineResult<FetchedFragment> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await?;
        Ok(FetchedFragment { url: final_url, status, content_type, body })
    }
}

// ── Sanitizer ──────────────────────────────────────────────────────────

pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, markup: &str) -> EngineResult<String>;
}

const BLOCKED_TAGS: &[&str] = &[
    "script", "iframe", "object", "embed", "base", "meta", "link", "frame", "frameset", "noscript",
];
const URL_ATTRS: &[&str] = &["href", "src", "action", "formaction", "xlink:href", "poster", "srcset"];
const BLOCKED_SCHEMES: &[&str] = &["javascript:", "vbscript:", "data:"];
const VOID_TAGS: &[&str] = &["area", "br", "col", "hr", "img", "input", "source", "track", "wbr"];

/// Drops script-executing constructs and re-serializes what remains.
#[derive(Debug, Default, Clone)]
pub struct StrictSanitizer;

impl StrictSanitizer {
    fn allowed_attr(name: &str, value: &str) -> bool {
        let name = name.to_ascii_lowercase();
        if name.starts_with("on") || (name == "style" && value.to_ascii_lowercase().contains("expression(")) {
            return false;
        }
        if URL_ATTRS.contains(&name.as_str()) {
            // Browsers ignore embedded whitespace and control chars in schemes.
            let compact: String = value
                .chars()
                .filter(|c| !c.is_whitespace() && !c.is_control())
                .collect::<String>()
                .to_ascii_lowercase();
            return !BLOCKED_SCHEMES.iter().any(|s| compact.starts_with(s));
        }
        true
    }

    fn write_children(el: ElementRef<'_>, out: &mut String) {
        for child in el.children() {
            match child.value() {
                Node::Text(text) => out.push_str(&escape_text(text)),
                Node::Element(_) => {
                    if let Some(child_el) = ElementRef::wrap(child) {
                        Self::write_element(child_el, out);
                    }
                }
                _ => {}
            }
        }
    }

    fn write_element(el: ElementRef<'_>, out: &mut String) {
        let tag = el.value().name().to_ascii_lowercase();
        if BLOCKED_TAGS.contains(&tag.as_str()) {
            return;
        }
        out.push('<');
        out.push_str(&tag);
        for (name, value) in el.value().attrs() {
            if Self::allowed_attr(name, value) {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                out.push_str(&escape_attr(value));
                out.push('"');
            }
        }
        out.push('>');
        if VOID_TAGS.contains(&tag.as_str()) {
            return;
        }
        Self::write_children(el, out);
        out.push_str("</");
        out.push_str(&tag);
        out.push('>');
    }
}

impl Sanitizer for StrictSanitizer {
    fn sanitize(&self, markup: &str) -> EngineResult<String> {
        let html = Html::parse_fragment(markup);
        let mut out = String::with_capacity(markup.len());
        Self::write_children(html.root_element(), &mut out);
        Ok(out)
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;")
}

// ── Parsed fragment ────────────────────────────────────────────────────

/// Detached parse result, independent of any document.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentNode {
    Element { tag: String, attrs: Vec<(String, String)>, children: Vec<FragmentNode> },
    Text(String),
}

impl FragmentNode {
    fn attr(&self, name: &str) -> Option<&str> {
        match self {
            FragmentNode::Element { attrs, .. } => {
                attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
            }
            FragmentNode::Text(_) => None,
        }
    }

    fn matches(&self, selector: RootSelector) -> bool {
        match selector {
            RootSelector::Id(id) => self.attr("id") == Some(id),
            RootSelector::Class(class) => self
                .attr("class")
                .map(|c| c.split_whitespace().any(|x| x == class))
                .unwrap_or(false),
        }
    }

    fn find(&self, selector: RootSelector) -> Option<&FragmentNode> {
        if self.matches(selector) {
            return Some(self);
        }
        match self {
            FragmentNode::Element { children, .. } => children.iter().find_map(|c| c.find(selector)),
            FragmentNode::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFragment {
    pub nodes: Vec<FragmentNode>,
}

impl ParsedFragment {
    pub fn parse(markup: &str) -> Self {
        let html = Html::parse_fragment(markup);
        ParsedFragment { nodes: convert_children(html.root_element()) }
    }

    /// Root for `widget`, located by its fixed selector.
    pub fn root_for(&self, widget: WidgetId) -> Option<&FragmentNode> {
        let selector = widget.root_selector();
        self.nodes.iter().find_map(|n| n.find(selector))
    }
}

fn convert_children(el: ElementRef<'_>) -> Vec<FragmentNode> {
    let mut out = Vec::new();
    for child in el.children() {
        match child.value() {
            Node::Text(text) => {
                let s: &str = text;
                if !s.trim().is_empty() {
                    out.push(FragmentNode::Text(s.trim().to_string()));
                }
            }
            Node::Element(e) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    out.push(FragmentNode::Element {
                        tag: e.name().to_ascii_lowercase(),
                        attrs: e.attrs().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                        children: convert_children(child_el),
                    });
                }
            }
            _ => {}
        }
    }
    out
}

/// Build document elements for `node` and its subtree. The result is detached.
pub fn materialize(doc: &mut Document, node: &FragmentNode) -> Option<NodeId> {
    let FragmentNode::Element { tag, attrs, children } = node else { return None };
    let id = doc.create_element(tag);
    if let Some(el) = doc.element_mut(id) {
        for (name, value) in attrs {
            match name.as_str() {
                "id" => el.id = Some(value.clone()),
                "class" => el.classes = value.split_whitespace().map(str::to_string).collect(),
                "hidden" => el.hidden = true,
                "disabled" => el.disabled = true,
                "checked" => el.checked = true,
                "value" => el.value = value.clone(),
                _ => el.set_attr(name, value),
            }
        }
    }
    for child in children {
        match child {
            FragmentNode::Text(t) => {
                if let Some(el) = doc.element_mut(id) {
                    if !el.text.is_empty() {
                        el.text.push(' ');
                    }
                    el.text.push_str(t);
                }
            }
            FragmentNode::Element { .. } => {
                if let Some(c) = materialize(doc, child) {
                    doc.append_child(id, c);
                }
            }
        }
    }
    Some(id)
}

// ── Loader ─────────────────────────────────────────────────────────────

pub struct FragmentLoader {
    origin: Url,
    source: Arc<dyn FragmentSource>,
    sanitizer: Option<Arc<dyn Sanitizer>>,
}

impl FragmentLoader {
    pub fn new(
        origin: &str,
        source: Arc<dyn FragmentSource>,
        sanitizer: Option<Arc<dyn Sanitizer>>,
    ) -> EngineResult<Self> {
        let origin = Url::parse(origin).map_err(|e| EngineError::Config(format!("origin: {}", e)))?;
        Ok(FragmentLoader { origin, source, sanitizer })
    }

    pub fn fragment_url(&self, widget: WidgetId) -> EngineResult<Url> {
        self.origin
            .join(widget.fragment_path())
            .map_err(|e| EngineError::Config(format!("fragment url: {}", e)))
    }

    /// Fetch, validate, sanitize and parse. No document mutation.
    pub async fn fetch(&self, widget: WidgetId) -> EngineResult<ParsedFragment> {
        let sanitizer = self.sanitizer.clone().ok_or_else(|| {
            EngineError::Security("no HTML sanitizer configured; refusing to load fragments".into())
        })?;
        let url = self.fragment_url(widget)?;
        let fetched = self.source.fetch(url.as_str()).await?;

        if !(200..300).contains(&fetched.status) {
            warn!("[fragment] {} returned HTTP {}", widget, fetched.status);
            return Err(EngineError::Policy(format!("{}: HTTP {}", widget, fetched.status)));
        }

        let same_origin = Url::parse(&fetched.url)
            .map(|u| u.origin() == self.origin.origin())
            .unwrap_or(false);
        if !same_origin {
            warn!("[fragment] {} served from foreign origin {}", widget, fetched.url);
            return Err(EngineError::Policy(format!("{}: cross-origin response", widget)));
        }

        let is_html = fetched
            .content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
            .unwrap_or(false);
        if !is_html {
            warn!(
                "[fragment] {} rejected, content type {:?}",
                widget, fetched.content_type
            );
            return Err(EngineError::Policy(format!("{}: content type is not text/html", widget)));
        }

        let clean = sanitizer.sanitize(&fetched.body)?;
        let parsed = ParsedFragment::parse(&clean);
        if parsed.root_for(widget).is_none() {
            warn!("[fragment] {} fragment has no root node", widget);
            return Err(EngineError::Policy(format!("{}: root node missing", widget)));
        }
        info!("[fragment] {} fetched ({} bytes)", widget, clean.len());
        Ok(parsed)
    }
}

/// Materialize the widget root into the body. Returns the existing root
/// when one with the widget's identity is already present.
pub fn insert_fragment(doc: &mut Document, widget: WidgetId, parsed: &ParsedFragment) -> EngineResult<NodeId> {
    if let Some(existing) = doc.get_element_by_id(widget.root_dom_id()) {
        return Ok(existing);
    }
    let root_node = parsed
        .root_for(widget)
        .ok_or_else(|| EngineError::Policy(format!("{}: root node missing", widget)))?;
    let root = materialize(doc, root_node)
        .ok_or_else(|| EngineError::Policy(format!("{}: root is not an element", widget)))?;
    if let Some(el) = doc.element_mut(root) {
        el.id = Some(widget.root_dom_id().to_string());
    }
    let body = doc.body();
    doc.append_child(body, root);
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dom::Viewport;

    struct Fixed(FetchedFragment);

    #[async_trait]
    impl FragmentSource for Fixed {
        async fn fetch(&self, _url: &str) -> EngineResult<FetchedFragment> {
            Ok(self.0.clone())
        }
    }

    fn fetched(url: &str, ct: Option<&str>, status: u16, body: &str) -> FetchedFragment {
        FetchedFragment {
            url: url.into(),
            status,
            content_type: ct.map(str::to_string),
            body: body.into(),
        }
    }

    fn loader(f: FetchedFragment) -> FragmentLoader {
        FragmentLoader::new(
            "https://site.test",
            Arc::new(Fixed(f)),
            Some(Arc::new(StrictSanitizer)),
        )
        .unwrap()
    }

    const MODAL: &str = r#"<div class="modal-container"><h2>Contact</h2><form><input id="name"></form></div>"#;

    #[test]
    fn sanitizer_strips_executable_constructs() {
        let dirty = r#"<div onclick="x()"><script>alert(1)</script><a href=" javascript:go()">a</a><a href="/ok">b</a><img src="data:image/png;base64,AA"><iframe src="/x"></iframe></div>"#;
        let clean = StrictSanitizer.sanitize(dirty).unwrap();
        assert!(!clean.contains("script"));
        assert!(!clean.contains("onclick"));
        assert!(!clean.contains("javascript"));
        assert!(!clean.contains("data:"));
        assert!(!clean.contains("iframe"));
        assert!(clean.contains(r#"href="/ok""#));
    }

    #[tokio::test]
    async fn accepts_html_with_charset() {
        let l = loader(fetched("https://site.test/fabs/contact.html", Some("text/html; charset=utf-8"), 200, MODAL));
        let parsed = l.fetch(WidgetId::Contact).await.unwrap();
        assert!(parsed.root_for(WidgetId::Contact).is_some());
    }

    #[tokio::test]
    async fn rejects_wrong_content_type() {
        let l = loader(fetched("https://site.test/fabs/contact.html", Some("application/json"), 200, MODAL));
        assert!(matches!(l.fetch(WidgetId::Contact).await, Err(EngineError::Policy(_))));
        let l = loader(fetched("https://site.test/fabs/contact.html", None, 200, MODAL));
        assert!(matches!(l.fetch(WidgetId::Contact).await, Err(EngineError::Policy(_))));
    }

    #[tokio::test]
    async fn rejects_cross_origin_and_bad_status() {
        let l = loader(fetched("https://evil.test/fabs/contact.html", Some("text/html"), 200, MODAL));
        assert!(matches!(l.fetch(WidgetId::Contact).await, Err(EngineError::Policy(_))));
        let l = loader(fetched("https://site.test/fabs/contact.html", Some("text/html"), 404, MODAL));
        assert!(matches!(l.fetch(WidgetId::Contact).await, Err(EngineError::Policy(_))));
    }

    #[tokio::test]
    async fn missing_sanitizer_is_a_security_error() {
        let l = FragmentLoader::new(
            "https://site.test",
            Arc::new(Fixed(fetched("https://site.test/fabs/contact.html", Some("text/html"), 200, MODAL))),
            None,
        )
        .unwrap();
        assert!(matches!(l.fetch(WidgetId::Contact).await, Err(EngineError::Security(_))));
    }

    #[tokio::test]
    async fn missing_root_is_rejected() {
        let l = loader(fetched("https://site.test/fabs/chatbot.html", Some("text/html"), 200, "<div>no root</div>"));
        assert!(matches!(l.fetch(WidgetId::Chatbot).await, Err(EngineError::Policy(_))));
    }

    #[test]
    fn insert_is_idempotent_and_assigns_modal_id() {
        let mut doc = Document::new("https://site.test", Viewport::new(1024.0, 768.0));
        let parsed = ParsedFragment::parse(MODAL);
        let a = insert_fragment(&mut doc, WidgetId::Join, &parsed).unwrap();
        let b = insert_fragment(&mut doc, WidgetId::Join, &parsed).unwrap();
        assert_eq!(a, b);
        assert_eq!(doc.query_all(doc.html(), "#join-modal").len(), 1);
        assert!(doc.find_by_id(a, "name").is_some());
    }
}
