// ── Cojoin Atoms: Pure Data Types ─────────────────────────────────────────────
// Plain struct/enum definitions shared by the engine and the site server.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::constants::{CHATBOT_ROOT_ID, MODAL_ROOT_CLASS};

// ── Widgets ────────────────────────────────────────────────────────────────

/// The closed set of widgets a FAB can open. Fragment paths and DOM
/// identities derive from this enumeration only, never from caller input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetId {
    Contact,
    Join,
    Chatbot,
}

impl WidgetId {
    pub const ALL: [WidgetId; 3] = [WidgetId::Contact, WidgetId::Join, WidgetId::Chatbot];

    pub fn as_str(&self) -> &'static str {
        match self {
            WidgetId::Contact => "contact",
            WidgetId::Join => "join",
            WidgetId::Chatbot => "chatbot",
        }
    }

    /// Same-origin path of the widget's HTML fragment.
    pub fn fragment_path(&self) -> &'static str {
        match self {
            WidgetId::Contact => "/fabs/contact.html",
            WidgetId::Join => "/fabs/join.html",
            WidgetId::Chatbot => "/fabs/chatbot.html",
        }
    }

    /// Element id the root carries once it is in the document.
    pub fn root_dom_id(&self) -> &'static str {
        match self {
            WidgetId::Contact => "contact-modal",
            WidgetId::Join => "join-modal",
            WidgetId::Chatbot => CHATBOT_ROOT_ID,
        }
    }

    /// How the root is located inside a freshly parsed fragment.
    pub fn root_selector(&self) -> RootSelector {
        match self {
            WidgetId::Chatbot => RootSelector::Id(CHATBOT_ROOT_ID),
            _ => RootSelector::Class(MODAL_ROOT_CLASS),
        }
    }

    /// Id of the FAB option that opens this widget.
    pub fn fab_option_id(&self) -> String {
        format!("fab-{}", self.as_str())
    }

    pub fn is_modal(&self) -> bool {
        !matches!(self, WidgetId::Chatbot)
    }
}

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootSelector {
    Id(&'static str),
    Class(&'static str),
}

/// Lifecycle state of one widget instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetState {
    Unloaded,
    Hidden,
    Open,
    Minimized,
    Closed,
}

// ── Policies ───────────────────────────────────────────────────────────────

/// What Escape and outside clicks do to an open widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DismissAction {
    Close,
    Minimize,
}

/// Which proof-of-humanity artifacts every outbound send must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofMode {
    #[serde(rename = "captcha")]
    Captcha,
    #[serde(rename = "nonce")]
    Nonce,
    #[serde(rename = "captcha+nonce")]
    CaptchaAndNonce,
}

impl ProofMode {
    pub fn needs_captcha(&self) -> bool {
        matches!(self, ProofMode::Captcha | ProofMode::CaptchaAndNonce)
    }

    pub fn needs_nonce(&self) -> bool {
        matches!(self, ProofMode::Nonce | ProofMode::CaptchaAndNonce)
    }
}

/// Server-side CAPTCHA verification backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptchaProviderKind {
    Recaptcha,
    Hcaptcha,
}

impl CaptchaProviderKind {
    pub fn verify_url(&self) -> &'static str {
        match self {
            CaptchaProviderKind::Recaptcha => "https://www.google.com/recaptcha/api/siteverify",
            CaptchaProviderKind::Hcaptcha => "https://api.hcaptcha.com/siteverify",
        }
    }
}

// ── Chat wire types ────────────────────────────────────────────────────────

/// Who wrote a transcript line. Serialized as the CSS class the line renders with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    User,
    Bot,
}

impl Origin {
    pub fn as_class(&self) -> &'static str {
        match self {
            Origin::User => "user",
            Origin::Bot => "bot",
        }
    }
}

/// One persisted transcript line: `{cls, txt}` in `chatHistory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
    pub cls: Origin,
    pub txt: String,
}

/// `POST /chat` request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, rename = "recaptchaToken", skip_serializing_if = "Option::is_none")]
    pub recaptcha_token: Option<String>,
    #[serde(default, rename = "h-captcha-response", skip_serializing_if = "Option::is_none")]
    pub hcaptcha_response: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatReply {
    #[serde(default)]
    pub reply: String,
}

/// `POST /honeypot-trip` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoneypotTrip {
    pub reason: String,
    pub ts: i64,
    pub ua: String,
}

/// Result of a nonce claim against the uniqueness registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceClaim {
    Claimed,
    Reused,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widget_paths_come_from_the_enumeration() {
        assert_eq!(WidgetId::Chatbot.fragment_path(), "/fabs/chatbot.html");
        assert_eq!(WidgetId::Contact.root_dom_id(), "contact-modal");
        assert_eq!(WidgetId::Join.fab_option_id(), "fab-join");
        assert_eq!(WidgetId::Chatbot.root_selector(), RootSelector::Id("chatbot-container"));
        assert!(WidgetId::Join.is_modal());
        assert!(!WidgetId::Chatbot.is_modal());
    }

    #[test]
    fn proof_mode_wire_names() {
        let m: ProofMode = serde_json::from_str("\"captcha+nonce\"").unwrap();
        assert_eq!(m, ProofMode::CaptchaAndNonce);
        assert!(m.needs_captcha() && m.needs_nonce());
        assert!(!ProofMode::Nonce.needs_captcha());
    }

    #[test]
    fn chat_request_uses_worker_field_names() {
        let req = ChatRequest {
            message: "hi".into(),
            nonce: Some("n1".into()),
            recaptcha_token: Some("t".into()),
            hcaptcha_response: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"recaptchaToken\":\"t\""));
        assert!(!json.contains("h-captcha-response"));
    }

    #[test]
    fn chat_line_serializes_as_cls_txt() {
        let line = ChatLine { cls: Origin::User, txt: "hi".into() };
        assert_eq!(serde_json::to_string(&line).unwrap(), r#"{"cls":"user","txt":"hi"}"#);
    }
}
