// Chatbot send pipeline and page-reload restoration.
//
// A send appends the user line and a pending placeholder, then runs the
// proof + transport exchange on a task. The reply replaces the placeholder
// unless the instance was closed (or replaced) in the meantime.

use super::{ControllerState, Slot, WidgetController};
use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ChatReply, ChatRequest, Origin, WidgetId, WidgetState};
use crate::engine::chat::{load_chat_state, preview, ChatUi};
use crate::engine::dom::{Document, NodeId};
use crate::engine::gate::NonceUse;
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;

impl WidgetController {
    /// Send the chat input. Ignored while a send is in flight, after a
    /// honeypot trip or a security rejection, and for blank input.
    pub fn send_chat(&self) {
        let id = WidgetId::Chatbot;
        let mut guard = self.shared.state.lock();
        let ControllerState { doc, slots, .. } = &mut *guard;
        let Some(Slot::Loaded(inst)) = slots.get_mut(&id) else { return };
        match inst.chat.as_ref() {
            Some(chat) if chat.sending.is_some() => {
                debug!("[chat] Send rejected: previous message still in flight");
                return;
            }
            Some(chat) if chat.locked => return,
            Some(_) => {}
            None => return,
        }

        if let Some(gate) = inst.gate.as_mut() {
            if gate.is_tripped() {
                return;
            }
            if let Some(trip) = gate.inspect(doc, "honeypot_on_submit", &self.config().user_agent) {
                Self::show_blocked(doc, inst);
                drop(guard);
                self.report_trip(trip);
                return;
            }
        }

        let epoch = inst.epoch;
        let Some(chat) = inst.chat.as_mut() else { return };
        let text = doc.value(chat.ui.input).trim().to_string();
        if text.is_empty() {
            return;
        }
        let now = Utc::now();
        chat.ui.append(doc, Origin::User, &text);
        chat.session.push_outbound(&text, now);
        chat.ui.append(doc, Origin::Bot, MSG_PENDING);
        chat.session.push(Origin::Bot, MSG_PENDING);
        doc.set_value(chat.ui.input, "");
        chat.session.persist(self.shared.deps.store.as_ref());
        doc.set_disabled(chat.ui.send, true);

        let current = chat.session.current_nonce(now).map(str::to_string);
        info!("[chat] Sending \"{}\"", preview(&text));

        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!("[chat] No async runtime; message not sent");
            drop(guard);
            self.finish_chat(epoch, Err(EngineError::transport("chat", "no runtime")));
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        chat.sending = Some(rt.spawn(async move {
            let Some(shared) = weak.upgrade() else { return };
            let controller = WidgetController { shared };
            let result = controller.exchange(text, current).await;
            controller.finish_chat(epoch, result);
        }));
    }

    /// Proof, then transport. Returns the reply and the nonce it was sent with.
    async fn exchange(&self, message: String, current: Option<String>) -> EngineResult<(ChatReply, Option<String>)> {
        let deps = &self.shared.deps;
        let proof = deps.gate.prove("chat", current.as_deref(), NonceUse::Register).await?;
        let mut request = ChatRequest { message, ..Default::default() };
        proof.apply_to(&mut request);
        let reply = deps.chat.send(&request).await?;
        Ok((reply, proof.nonce))
    }

    fn finish_chat(&self, epoch: u64, result: EngineResult<(ChatReply, Option<String>)>) {
        let mut guard = self.shared.state.lock();
        let ControllerState { doc, slots, .. } = &mut *guard;
        let Some(Slot::Loaded(inst)) = slots.get_mut(&WidgetId::Chatbot) else {
            debug!("[chat] Late reply discarded: chatbot closed");
            return;
        };
        if inst.epoch != epoch {
            debug!("[chat] Late reply discarded: stale instance");
            return;
        }
        let Some(chat) = inst.chat.as_mut() else { return };
        chat.sending = None;

        let now = Utc::now();
        let text = match result {
            Ok((reply, nonce)) => {
                match nonce {
                    Some(n) => chat.session.set_nonce(n, now),
                    None => chat.session.touch(now),
                }
                if reply.reply.trim().is_empty() {
                    MSG_NO_REPLY.to_string()
                } else {
                    reply.reply
                }
            }
            Err(e) if e.is_security() => {
                warn!("[chat] Security rejection, chat locked: {}", e);
                chat.locked = true;
                chat.ui.lock(doc);
                MSG_SECURITY_FAILED.to_string()
            }
            Err(EngineError::Transport { endpoint, message }) if endpoint == "nonce" => {
                warn!("[chat] Nonce registry unavailable: {}", message);
                MSG_SECURITY_UNAVAILABLE.to_string()
            }
            Err(e) => {
                warn!("[chat] Send failed: {}", e);
                MSG_CANT_REACH.to_string()
            }
        };

        match chat.ui.pending_line(doc) {
            Some(line) => doc.set_text(line, &text),
            None => {
                chat.ui.append(doc, Origin::Bot, &text);
            }
        }
        if !chat.session.resolve_pending(&text) {
            chat.session.push(Origin::Bot, &text);
        }
        chat.session.persist(self.shared.deps.store.as_ref());
        let blocked = chat.blocked(inst.gate.as_ref());
        chat.ui.update_send_enabled(doc, blocked);
        self.touch(inst);
    }

    pub(super) fn refresh_send_enabled(&self) {
        let mut guard = self.shared.state.lock();
        let ControllerState { doc, slots, .. } = &mut *guard;
        if let Some(Slot::Loaded(inst)) = slots.get(&WidgetId::Chatbot) {
            if let Some(chat) = inst.chat.as_ref() {
                chat.ui.update_send_enabled(doc, chat.blocked(inst.gate.as_ref()));
            }
        }
    }

    pub(super) fn with_chat_ui(&self, f: impl FnOnce(&mut Document, &ChatUi, NodeId)) {
        let mut guard = self.shared.state.lock();
        let ControllerState { doc, slots, .. } = &mut *guard;
        if let Some(Slot::Loaded(inst)) = slots.get(&WidgetId::Chatbot) {
            if let Some(chat) = inst.chat.as_ref() {
                f(doc, &chat.ui, inst.root);
            }
        }
    }

    /// Transcript lines as rendered, oldest first.
    pub fn chat_transcript(&self) -> Vec<(Origin, String)> {
        let st = self.shared.state.lock();
        let Some(chat) = st.instance(WidgetId::Chatbot).and_then(|i| i.chat.as_ref()) else {
            return Vec::new();
        };
        st.doc
            .children(chat.ui.log)
            .iter()
            .filter_map(|n| st.doc.element(*n))
            .map(|el| {
                let cls = if el.has_class(Origin::User.as_class()) { Origin::User } else { Origin::Bot };
                (cls, el.text.clone())
            })
            .collect()
    }

    pub fn chat_ui(&self) -> Option<ChatUi> {
        self.shared.state.lock().instance(WidgetId::Chatbot).and_then(|i| i.chat.as_ref()).map(|c| c.ui)
    }

    /// Bring the chatbot back the way the previous page left it.
    pub async fn restore_chatbot(&self) -> Option<WidgetState> {
        let saved = load_chat_state(self.shared.deps.store.as_ref())?;
        info!("[chat] Restoring {:?} chatbot", saved);
        match saved {
            WidgetState::Open => {
                self.open(WidgetId::Chatbot).await;
            }
            WidgetState::Minimized => {
                self.load_fragment(WidgetId::Chatbot).await?;
                let mut st = self.shared.state.lock();
                if st.instance(WidgetId::Chatbot).map(|i| i.state) == Some(WidgetState::Hidden) {
                    self.minimize_locked(&mut st, WidgetId::Chatbot);
                }
                drop(st);
            }
            _ => {}
        }
        Some(self.state(WidgetId::Chatbot))
    }
}
