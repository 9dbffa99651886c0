// Contact and join form submission, plus the honeypot trip path shared
// with the chatbot.

use super::{ControllerState, Slot, WidgetController, WidgetInstance};
use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{HoneypotTrip, Origin, WidgetId};
use crate::engine::dom::{Document, NodeId};
use crate::engine::form::{self, FormOutcome};
use crate::engine::gate::NonceUse;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

impl WidgetController {
    pub(super) fn submit_form(&self, id: WidgetId) {
        let mut guard = self.shared.state.lock();
        let ControllerState { doc, slots, .. } = &mut *guard;
        let Some(Slot::Loaded(inst)) = slots.get_mut(&id) else { return };
        match inst.modal.as_ref() {
            Some(m) if m.locked || m.submitting.is_some() => {
                debug!("[relay] {} submit ignored", id);
                return;
            }
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

        let honeypot = inst.gate.as_ref().map(|g| g.honeypot);
        let epoch = inst.epoch;
        let Some(modal) = inst.modal.as_mut() else { return };
        let fields = form::collect_fields(doc, modal.form, honeypot.as_ref());
        form::set_status(doc, modal.form, MSG_FORM_SENDING);
        info!("[relay] Submitting {} form ({} fields)", id, fields.len());

        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!("[relay] No async runtime; form not sent");
            form::set_status(doc, modal.form, MSG_FORM_FAILED);
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        modal.submitting = Some(rt.spawn(async move {
            let Some(shared) = weak.upgrade() else { return };
            let controller = WidgetController { shared };
            let result = controller.relay(id, fields).await;
            controller.finish_form(id, epoch, result);
        }));
    }

    /// Each attempt carries a fresh nonce; the relay claims it and answers
    /// 401 on a collision. A refused CSRF token is refetched once.
    async fn relay(&self, id: WidgetId, fields: BTreeMap<String, String>) -> EngineResult<()> {
        let deps = &self.shared.deps;
        let attempts = deps.config.nonce_attempts.max(1);
        let mut csrf_retried = false;
        let mut attempt = 0;
        while attempt < attempts {
            attempt += 1;
            let proof = deps.gate.prove("submit", None, NonceUse::Relay).await?;
            let mut payload = fields.clone();
            proof.apply_to_fields(&mut payload);
            form::attach_csrf(&mut payload, deps.csrf.token().await.as_deref());
            match deps.forms.submit(id, &payload).await? {
                FormOutcome::Accepted { rotated } => {
                    deps.csrf.rotate(rotated);
                    return Ok(());
                }
                FormOutcome::NonceRejected => {
                    warn!("[relay] Nonce rejected on attempt {}/{}", attempt, attempts);
                }
                FormOutcome::CsrfRejected if !csrf_retried => {
                    warn!("[relay] CSRF token refused, fetching a new one");
                    deps.csrf.invalidate();
                    csrf_retried = true;
                    attempt -= 1;
                }
                FormOutcome::CsrfRejected => {
                    deps.csrf.invalidate();
                    return Err(EngineError::transport("relay", "HTTP 403"));
                }
                FormOutcome::Rejected(status) => {
                    return Err(EngineError::transport("relay", format!("HTTP {}", status)));
                }
            }
        }
        Err(EngineError::transport("nonce", format!("rejected {} times", attempts)))
    }

    fn finish_form(&self, id: WidgetId, epoch: u64, result: EngineResult<()>) {
        let mut guard = self.shared.state.lock();
        let ControllerState { doc, slots, .. } = &mut *guard;
        let Some(Slot::Loaded(inst)) = slots.get_mut(&id) else { return };
        if inst.epoch != epoch {
            return;
        }
        let honeypot = inst.gate.as_ref().map(|g| g.honeypot);
        let Some(modal) = inst.modal.as_mut() else { return };
        modal.submitting = None;

        let message = match result {
            Ok(()) => {
                info!("[relay] {} form accepted", id);
                form::reset(doc, modal.form, honeypot.as_ref());
                MSG_FORM_SENT
            }
            Err(e) if e.is_security() => {
                warn!("[relay] {} form locked: {}", id, e);
                modal.locked = true;
                disable_controls(doc, modal.form);
                MSG_SECURITY_FAILED
            }
            Err(EngineError::Transport { endpoint, .. }) if endpoint == "nonce" => MSG_SECURITY_UNAVAILABLE,
            Err(e) => {
                warn!("[relay] {} form failed: {}", id, e);
                MSG_FORM_FAILED
            }
        };
        form::set_status(doc, modal.form, message);
        self.touch(inst);
    }

    /// Interaction with a decoy field. Trips regardless of content.
    pub(super) fn honeypot_touched(&self, id: WidgetId, target: NodeId) {
        let mut guard = self.shared.state.lock();
        let ControllerState { doc, slots, .. } = &mut *guard;
        let Some(Slot::Loaded(inst)) = slots.get_mut(&id) else { return };
        let Some(gate) = inst.gate.as_mut() else { return };
        if gate.is_tripped() {
            return;
        }
        let reason = if gate.honeypot.text == target { "hp_text_touched" } else { "hp_check_ticked" };
        let trip = gate.trip(doc, reason, &self.config().user_agent);
        Self::show_blocked(doc, inst);
        drop(guard);
        self.report_trip(trip);
    }

    /// Lock the widget's send path and tell the visitor, vaguely.
    pub(super) fn show_blocked(doc: &mut Document, inst: &mut WidgetInstance) {
        if let Some(chat) = inst.chat.as_mut() {
            chat.locked = true;
            chat.ui.lock(doc);
            chat.ui.append(doc, Origin::Bot, MSG_BLOCKED);
        }
        if let Some(modal) = inst.modal.as_mut() {
            modal.locked = true;
            disable_controls(doc, modal.form);
            form::set_status(doc, modal.form, MSG_BLOCKED);
        }
        doc.alert(MSG_ALERT_BLOCKED);
    }

    pub(super) fn report_trip(&self, trip: HoneypotTrip) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else { return };
        let reporter = self.shared.deps.reporter.clone();
        rt.spawn(async move {
            if let Err(e) = reporter.report(&trip).await {
                debug!("[gate] Trip report not delivered: {}", e);
            }
        });
    }

    pub fn form_status(&self, id: WidgetId) -> Option<String> {
        let st = self.shared.state.lock();
        let form = st.instance(id)?.modal.as_ref()?.form;
        form::status_text(&st.doc, form)
    }

    pub fn form(&self, id: WidgetId) -> Option<NodeId> {
        let st = self.shared.state.lock();
        let inst = st.instance(id)?;
        inst.modal.as_ref().map(|m| m.form).or(inst.chat.as_ref().map(|c| c.ui.form))
    }
}

fn disable_controls(doc: &mut Document, form: NodeId) {
    for node in doc.query_all(form, "input, textarea, select, button") {
        doc.set_disabled(node, true);
    }
}
