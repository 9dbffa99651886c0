// Cojoin Engine — Chatbot Conversation
//
// Conversation state (transcript, nonce, expiry), its persistence in session
// storage, and the chatbot's DOM surface: transcript lines, send-enable
// logic, language and theme toggles.
//
// The send pipeline itself lives in the controller because it crosses the
// gate, the transport and the lifecycle epoch.

use crate::atoms::constants::*;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{ChatLine, ChatReply, ChatRequest, Origin, WidgetState};
use crate::engine::dom::{Document, NodeId};
use crate::engine::storage::{load_json, save_json, SessionStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

// ── Transport ──────────────────────────────────────────────────────────

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> EngineResult<ChatReply>;
}

/// Fire-and-forget notice that the visitor ended the conversation.
#[async_trait]
pub trait SessionEndpoint: Send + Sync {
    async fn end_session(&self) -> EngineResult<()>;
}

// ── Conversation session ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct StoredNonce {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationSession {
    pub log: Vec<ChatLine>,
    nonce: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    ttl_secs: u64,
}

impl ConversationSession {
    pub fn new(ttl_secs: u64) -> Self {
        ConversationSession { ttl_secs, ..Default::default() }
    }

    /// Restore transcript and a still-valid nonce from storage.
    pub fn load(store: &dyn SessionStore, ttl_secs: u64, now: DateTime<Utc>) -> Self {
        let log: Vec<ChatLine> = load_json(store, STORAGE_CHAT_HISTORY).unwrap_or_default();
        let stored: Option<StoredNonce> = load_json(store, STORAGE_CHAT_NONCE);
        let (nonce, expires_at) = match stored {
            Some(s) if s.expires_at > now => (Some(s.value), Some(s.expires_at)),
            _ => (None, None),
        };
        ConversationSession { log, nonce, expires_at, ttl_secs }
    }

    /// Nonce for the next send, if one is claimed and unexpired.
    pub fn current_nonce(&self, now: DateTime<Utc>) -> Option<&str> {
        match (&self.nonce, self.expires_at) {
            (Some(n), Some(exp)) if exp > now => Some(n.as_str()),
            _ => None,
        }
    }

    pub fn set_nonce(&mut self, nonce: String, now: DateTime<Utc>) {
        self.nonce = Some(nonce);
        self.touch(now);
    }

    /// Push the expiry out by one TTL from `now`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.expires_at = Some(now + Duration::seconds(self.ttl_secs as i64));
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn push(&mut self, cls: Origin, txt: &str) {
        self.log.push(ChatLine { cls, txt: txt.to_string() });
    }

    /// Record a user message. A live conversation counts it as activity and
    /// its nonce stays valid for another TTL.
    pub fn push_outbound(&mut self, txt: &str, now: DateTime<Utc>) {
        self.push(Origin::User, txt);
        if self.current_nonce(now).is_some() {
            self.touch(now);
        }
    }

    /// Replace the most recent pending placeholder. Returns false when there is none.
    pub fn resolve_pending(&mut self, txt: &str) -> bool {
        match self.log.iter_mut().rev().find(|l| l.cls == Origin::Bot && l.txt == MSG_PENDING) {
            Some(line) => {
                line.txt = txt.to_string();
                true
            }
            None => false,
        }
    }

    pub fn persist(&self, store: &dyn SessionStore) {
        save_json(store, STORAGE_CHAT_HISTORY, &self.log);
        if let (Some(value), Some(expires_at)) = (&self.nonce, self.expires_at) {
            save_json(store, STORAGE_CHAT_NONCE, &StoredNonce { value: value.clone(), expires_at });
        }
    }

    /// Forget everything, in memory and in storage.
    pub fn wipe(&mut self, store: &dyn SessionStore) {
        self.log.clear();
        self.nonce = None;
        self.expires_at = None;
        for key in [STORAGE_CHAT_HISTORY, STORAGE_CHAT_STATE, STORAGE_CHAT_NONCE] {
            store.remove(key);
        }
        info!("[chat] Conversation wiped");
    }
}

pub fn save_chat_state(store: &dyn SessionStore, state: WidgetState) {
    let value = match state {
        WidgetState::Open => "open",
        WidgetState::Minimized => "minimized",
        _ => {
            store.remove(STORAGE_CHAT_STATE);
            return;
        }
    };
    if let Err(e) = store.set(STORAGE_CHAT_STATE, value) {
        log::warn!("[chat] Could not persist chat state: {}", e);
    }
}

pub fn load_chat_state(store: &dyn SessionStore) -> Option<WidgetState> {
    match store.get(STORAGE_CHAT_STATE)?.as_str() {
        "open" => Some(WidgetState::Open),
        "minimized" => Some(WidgetState::Minimized),
        _ => {
            store.remove(STORAGE_CHAT_STATE);
            None
        }
    }
}

// ── DOM surface ────────────────────────────────────────────────────────

/// Fixed element handles inside the chatbot root.
#[derive(Debug, Clone, Copy)]
pub struct ChatUi {
    pub log: NodeId,
    pub form: NodeId,
    pub input: NodeId,
    pub send: NodeId,
    pub close: Option<NodeId>,
    pub minimize: Option<NodeId>,
    pub lang: Option<NodeId>,
    pub theme: Option<NodeId>,
}

impl ChatUi {
    /// `None` when a required element is missing from the fragment.
    pub fn locate(doc: &Document, root: NodeId) -> Option<Self> {
        Some(ChatUi {
            log: doc.find_by_id(root, CHAT_LOG_ID)?,
            form: doc.find_by_id(root, CHAT_FORM_ID)?,
            input: doc.find_by_id(root, CHAT_INPUT_ID)?,
            send: doc.find_by_id(root, CHAT_SEND_ID)?,
            close: doc.find_by_id(root, CHAT_CLOSE_ID),
            minimize: doc.find_by_id(root, CHAT_MINIMIZE_ID),
            lang: doc.find_by_id(root, LANG_CTRL_ID),
            theme: doc.find_by_id(root, THEME_CTRL_ID),
        })
    }

    /// Append one transcript line as `div.chat-msg.{cls}`.
    pub fn append(&self, doc: &mut Document, cls: Origin, txt: &str) -> NodeId {
        let line = doc.create_element("div");
        if let Some(el) = doc.element_mut(line) {
            el.add_class("chat-msg");
            el.add_class(cls.as_class());
            el.text = txt.to_string();
        }
        doc.append_child(self.log, line);
        line
    }

    pub fn render(&self, doc: &mut Document, lines: &[ChatLine]) {
        self.clear(doc);
        for line in lines {
            self.append(doc, line.cls, &line.txt);
        }
    }

    pub fn clear(&self, doc: &mut Document) {
        for child in doc.children(self.log).to_vec() {
            doc.remove(child);
        }
    }

    /// Last pending bot line in the transcript.
    pub fn pending_line(&self, doc: &Document) -> Option<NodeId> {
        doc.children(self.log).iter().rev().copied().find(|n| {
            doc.element(*n)
                .map(|e| e.has_class(Origin::Bot.as_class()) && e.text == MSG_PENDING)
                .unwrap_or(false)
        })
    }

    /// Send is enabled only for non-blank input on an unlocked, idle session.
    pub fn update_send_enabled(&self, doc: &mut Document, blocked: bool) {
        let has_text = !doc.value(self.input).trim().is_empty();
        let input_disabled = doc.is_disabled(self.input);
        doc.set_disabled(self.send, !has_text || input_disabled || blocked);
    }

    pub fn lock(&self, doc: &mut Document) {
        doc.set_disabled(self.send, true);
        doc.set_disabled(self.input, true);
    }

    /// EN ⇄ ES. Swaps `data-en`/`data-es` text and `data-en-ph`/`data-es-ph` placeholders.
    pub fn toggle_language(&self, doc: &mut Document, root: NodeId) {
        let Some(ctrl) = self.lang else { return };
        let to_spanish = doc.text(ctrl) != "EN";
        doc.lang = if to_spanish { "es" } else { "en" }.to_string();
        doc.set_text(ctrl, if to_spanish { "EN" } else { "ES" });

        let (text_attr, ph_attr) = if to_spanish { ("data-es", "data-es-ph") } else { ("data-en", "data-en-ph") };
        for node in doc.query_all(root, "[data-en]") {
            if let Some(el) = doc.element_mut(node) {
                if let Some(t) = el.attr(text_attr).map(str::to_string) {
                    el.text = t;
                }
            }
        }
        for node in doc.query_all(root, "[data-en-ph]") {
            if let Some(el) = doc.element_mut(node) {
                if let Some(p) = el.attr(ph_attr).map(str::to_string) {
                    el.set_attr("placeholder", &p);
                }
            }
        }
        debug!("[chat] Language set to {}", doc.lang);
    }

    /// Dark ⇄ Light via the `dark` class on body.
    pub fn toggle_theme(&self, doc: &mut Document) {
        let Some(ctrl) = self.theme else { return };
        let to_dark = doc.text(ctrl) != "Light";
        let body = doc.body();
        if let Some(el) = doc.element_mut(body) {
            el.toggle_class(DARK_THEME_CLASS, Some(to_dark));
        }
        doc.set_text(ctrl, if to_dark { "Light" } else { "Dark" });
    }

    /// Initial control labels.
    pub fn prepare(&self, doc: &mut Document) {
        if let Some(lang) = self.lang {
            doc.set_text(lang, if doc.lang == "es" { "EN" } else { "ES" });
        }
        if let Some(theme) = self.theme {
            let dark = doc.element(doc.body()).map(|e| e.has_class(DARK_THEME_CLASS)).unwrap_or(false);
            doc.set_text(theme, if dark { "Light" } else { "Dark" });
        }
    }
}

/// Log-safe preview of a message.
pub fn preview(text: &str) -> String {
    if text.chars().count() > 80 {
        format!("{}…", text.chars().take(80).collect::<String>())
    } else {
        text.to_string()
    }
}
