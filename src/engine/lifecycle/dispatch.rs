// Event routing. Every listener the controller registers carries a
// `Binding`; `dispatch` resolves the matching bindings for an event, then
// handles them one by one without holding the state lock across awaits.

use super::{ControllerState, Guard, Slot, WidgetController, WidgetInstance};
use crate::atoms::types::{DismissAction, WidgetId, WidgetState};
use crate::engine::dom::{Document, DomEvent, EventKind, ListenerRegistry, NodeId, Scope, Viewport};
use crate::engine::drag::{self, Drag};
use crate::atoms::constants::{FAB_CONTAINER_CLASS, MODAL_CLOSE_CLASS};
use log::debug;

/// What a registered listener does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    FabToggle,
    FabOption(WidgetId),
    Escape(WidgetId),
    OutsideClick(WidgetId),
    OverlayClick(WidgetId),
    ExitControl(WidgetId),
    MinimizeControl(WidgetId),
    Reopen(WidgetId),
    Activity(WidgetId),
    HoneypotTouched(WidgetId),
    Submit(WidgetId),
    ChatInput(WidgetId),
    ChatEnter(WidgetId),
    LangToggle,
    ThemeToggle,
    DragStart(WidgetId),
    DragMove(WidgetId),
    DragEnd(WidgetId),
    Resize(WidgetId),
    Visibility(WidgetId),
}

/// Listeners that live as long as the instance.
pub(super) fn instance_bindings(doc: &Document, listeners: &ListenerRegistry<Binding>, inst: &WidgetInstance) -> Vec<Guard> {
    let id = inst.id;
    let mut guards = Vec::new();
    let mut on = |node: NodeId, kind: EventKind, binding: Binding| {
        guards.push(listeners.listen(Scope::Node(node), kind, binding));
    };

    for kind in [EventKind::Click, EventKind::KeyDown, EventKind::Input, EventKind::PointerDown, EventKind::Touch] {
        on(inst.root, kind, Binding::Activity(id));
    }
    if let Some(gate) = inst.gate.as_ref() {
        for field in [gate.honeypot.text, gate.honeypot.check] {
            for kind in [EventKind::Input, EventKind::Change, EventKind::Click] {
                on(field, kind, Binding::HoneypotTouched(id));
            }
        }
        on(gate.form, EventKind::Submit, Binding::Submit(id));
    }
    if let Some(overlay) = inst.overlay {
        on(overlay, EventKind::Click, Binding::OverlayClick(id));
    }
    if let Some(close) = doc.query(inst.root, &format!(".{}", MODAL_CLOSE_CLASS)) {
        on(close, EventKind::Click, Binding::ExitControl(id));
    }
    if let Some(chat) = inst.chat.as_ref() {
        let ui = chat.ui;
        if let Some(close) = ui.close {
            on(close, EventKind::Click, Binding::ExitControl(id));
        }
        if let Some(min) = ui.minimize {
            on(min, EventKind::Click, Binding::MinimizeControl(id));
        }
        on(ui.input, EventKind::Input, Binding::ChatInput(id));
        on(ui.input, EventKind::KeyDown, Binding::ChatEnter(id));
        if let Some(lang) = ui.lang {
            on(lang, EventKind::Click, Binding::LangToggle);
        }
        if let Some(theme) = ui.theme {
            on(theme, EventKind::Click, Binding::ThemeToggle);
        }
    }
    guards.push(listeners.listen(Scope::Document, EventKind::Resize, Binding::Resize(id)));
    guards.push(listeners.listen(Scope::Document, EventKind::Visibility, Binding::Visibility(id)));
    guards
}

impl WidgetController {
    /// Deliver one DOM event. Window-level state (viewport, visibility) is
    /// applied to the document before any listener runs.
    pub async fn dispatch(&self, event: DomEvent) {
        let matched = {
            let mut guard = self.shared.state.lock();
            let st = &mut *guard;
            match &event {
                DomEvent::Resize { width, height, visual_height } => {
                    st.doc.viewport = Viewport { width: *width, height: *height, visual_height: *visual_height };
                }
                DomEvent::Visibility { visible } => st.doc.visible = *visible,
                _ => {}
            }
            st.listeners.matching(&st.doc, &event)
        };

        for (listener, binding) in matched {
            if !self.shared.state.lock().listeners.is_live(listener) {
                continue;
            }
            self.handle(binding, &event).await;
        }
    }

    async fn handle(&self, binding: Binding, event: &DomEvent) {
        match binding {
            Binding::FabToggle => self.toggle_fab_menu(),
            Binding::FabOption(id) => {
                self.set_fab_menu(false);
                self.open(id).await;
            }
            Binding::Escape(id) => {
                if matches!(event, DomEvent::KeyDown { key, .. } if key == "Escape") {
                    self.dismiss(id, self.config().escape_action);
                }
            }
            Binding::OutsideClick(id) => {
                if let Some(target) = event.target() {
                    if self.is_outside(id, target) {
                        self.dismiss(id, self.config().outside_click_action);
                    }
                }
            }
            Binding::OverlayClick(id) => self.dismiss(id, self.config().outside_click_action),
            Binding::ExitControl(id) => {
                self.close(id);
            }
            Binding::MinimizeControl(id) => {
                self.minimize(id);
            }
            Binding::Reopen(id) => {
                self.open(id).await;
            }
            Binding::Activity(id) => {
                let mut st = self.shared.state.lock();
                if let Some(inst) = st.instance_mut(id) {
                    self.touch(inst);
                }
            }
            Binding::HoneypotTouched(id) => {
                if let Some(target) = event.target() {
                    self.honeypot_touched(id, target);
                }
            }
            Binding::Submit(WidgetId::Chatbot) => self.send_chat(),
            Binding::Submit(id) => self.submit_form(id),
            Binding::ChatInput(_) => self.refresh_send_enabled(),
            Binding::ChatEnter(_) => {
                if matches!(event, DomEvent::KeyDown { key, shift: false, .. } if key == "Enter") {
                    self.send_chat();
                }
            }
            Binding::LangToggle => self.with_chat_ui(|doc, ui, root| ui.toggle_language(doc, root)),
            Binding::ThemeToggle => self.with_chat_ui(|doc, ui, _| ui.toggle_theme(doc)),
            Binding::DragStart(id) => {
                if let DomEvent::PointerDown { target, x, y } = event {
                    self.drag_start(id, *target, *x, *y);
                }
            }
            Binding::DragMove(id) => {
                if let DomEvent::PointerMove { x, y } = event {
                    let mut guard = self.shared.state.lock();
                    let ControllerState { doc, slots, .. } = &mut *guard;
                    if let Some(Slot::Loaded(inst)) = slots.get(&id) {
                        if let Some(active) = inst.drag.active {
                            active.move_to(doc, inst.root, *x, *y);
                        }
                    }
                }
            }
            Binding::DragEnd(id) => {
                let mut st = self.shared.state.lock();
                if let Some(inst) = st.instance_mut(id) {
                    Self::end_drag(inst);
                }
            }
            Binding::Resize(id) => {
                let mut guard = self.shared.state.lock();
                let ControllerState { doc, listeners, slots, .. } = &mut *guard;
                if let Some(Slot::Loaded(inst)) = slots.get_mut(&id) {
                    Self::rebind_drag(doc, listeners, inst, self.config().drag_min_width);
                }
            }
            Binding::Visibility(id) => self.visibility_changed(id),
        }
    }

    /// Escape and outside clicks only act on the open widget.
    fn dismiss(&self, id: WidgetId, action: DismissAction) {
        if self.state(id) != WidgetState::Open {
            return;
        }
        debug!("[lifecycle] Dismissing {} ({:?})", id, action);
        match action {
            DismissAction::Close => {
                self.close(id);
            }
            DismissAction::Minimize => {
                self.minimize(id);
            }
        }
    }

    /// A click counts as outside when it lands in the document but not in
    /// the widget, its overlay, its re-open control or the launcher.
    fn is_outside(&self, id: WidgetId, target: NodeId) -> bool {
        let st = self.shared.state.lock();
        let Some(inst) = st.instance(id) else { return false };
        let doc = &st.doc;
        if !doc.is_attached(target) || doc.contains(inst.root, target) {
            return false;
        }
        let within = |node: Option<NodeId>| node.map(|n| doc.contains(n, target)).unwrap_or(false);
        if within(inst.overlay) || within(inst.reopen) {
            return false;
        }
        doc.closest(target, &format!(".{}", FAB_CONTAINER_CLASS)).is_none()
    }

    fn drag_start(&self, id: WidgetId, target: NodeId, x: f64, y: f64) {
        let mut guard = self.shared.state.lock();
        let ControllerState { doc, listeners, slots, .. } = &mut *guard;
        let Some(Slot::Loaded(inst)) = slots.get_mut(&id) else { return };
        let Some(header) = inst.drag.header else { return };
        if !inst.drag.enabled || inst.state != WidgetState::Open || !drag::starts_drag(doc, header, target) {
            return;
        }
        inst.drag.active = Some(Drag::begin(doc, inst.root, x, y));
        inst.drag.motion = vec![
            listeners.listen(Scope::Document, EventKind::PointerMove, Binding::DragMove(id)),
            listeners.listen(Scope::Document, EventKind::PointerUp, Binding::DragEnd(id)),
        ];
        debug!("[drag] {} drag started", id);
    }

    /// Hidden page: stop the countdown. Visible again: restart it for a
    /// widget that is still on screen or minimized.
    fn visibility_changed(&self, id: WidgetId) {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        let visible = st.doc.visible;
        let Some(inst) = st.instance_mut(id) else { return };
        if visible {
            self.touch(inst);
        } else {
            inst.timer.cancel();
            debug!("[timer] {} paused while page hidden", id);
        }
    }
}
