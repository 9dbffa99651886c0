// Cojoin Engine — Widget Lifecycle Controller
//
// Owns every widget instance and the document they live in. Each widget
// walks one state machine:
//
//   Unloaded ──load──▶ Hidden ──open──▶ Open ⇄ Minimized
//                        ▲               │         │
//                        └──(other open)─┘         │
//   any loaded state ──close──▶ Closed (instance dropped, back to Unloaded)
//
// Invariants:
//   • at most one instance per widget id, at most one widget Open
//   • an instance's listeners, timer and gate die with it (RAII guards)
//   • the state lock is never held across an await
//
// Module layout:
//   mod.rs       — controller, load/open/minimize/close
//   dispatch.rs  — event routing to bindings
//   chatbot.rs   — chat send pipeline, restore after reload
//   modal.rs     — contact/join form submission
//   fab.rs       — launcher buttons

mod chatbot;
mod dispatch;
mod fab;
mod modal;

pub use dispatch::Binding;

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{WidgetId, WidgetState};
use crate::engine::chat::{save_chat_state, ChatTransport, ChatUi, ConversationSession, SessionEndpoint};
use crate::engine::config::ClientConfig;
use crate::engine::dom::{Document, EventKind, Inset, ListenerGuard, ListenerRegistry, NodeId, Rect, Scope};
use crate::engine::drag::{self, Drag};
use crate::engine::form::{CsrfSource, CsrfTokens, FormTransport};
use crate::engine::fragment::{
    insert_fragment, FragmentLoader, FragmentSource, HttpFragmentSource, ParsedFragment, Sanitizer, StrictSanitizer,
};
use crate::engine::gate::{default_nonce_generator, CaptchaProvider, GateHandle, NonceRegistrar, ProofGate, TripReporter};
use crate::engine::storage::{MemoryStore, SessionStore};
use crate::engine::worker::WorkerClient;
use crate::engine::timer::InactivityTimer;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub(crate) type Guard = ListenerGuard<Binding>;

type LoadResult = Result<Arc<ParsedFragment>, Arc<EngineError>>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

// ── Dependencies ───────────────────────────────────────────────────────

/// Everything the controller talks to. Tests swap in doubles.
pub struct ControllerDeps {
    pub config: ClientConfig,
    pub loader: FragmentLoader,
    pub gate: ProofGate,
    pub chat: Arc<dyn ChatTransport>,
    pub forms: Arc<dyn FormTransport>,
    pub csrf: CsrfTokens,
    pub reporter: Arc<dyn TripReporter>,
    pub sessions: Arc<dyn SessionEndpoint>,
    pub store: Arc<dyn SessionStore>,
}

impl ControllerDeps {
    /// Live wiring: fragments over HTTP through the strict sanitizer, the
    /// worker client for every endpoint, in-memory session storage capped
    /// like a browser tab's.
    pub fn from_config(config: ClientConfig, captcha: Option<Arc<dyn CaptchaProvider>>) -> EngineResult<Self> {
        let worker = Arc::new(
            WorkerClient::new(&config.worker_url, &config.relay_url, &config.user_agent)?
                .with_csrf_url(&format!("{}{}", config.origin.trim_end_matches('/'), CSRF_TOKEN_PATH)),
        );
        let csrf_source: Arc<dyn CsrfSource> = worker.clone();
        let source: Arc<dyn FragmentSource> = Arc::new(HttpFragmentSource::new()?);
        let sanitizer: Arc<dyn Sanitizer> = Arc::new(StrictSanitizer);
        let loader = FragmentLoader::new(&config.origin, source, Some(sanitizer))?;
        let registrar: Arc<dyn NonceRegistrar> = worker.clone();
        let gate = ProofGate::new(
            config.proof_mode,
            captcha,
            Some(registrar),
            default_nonce_generator(),
            config.nonce_attempts,
        );
        Ok(ControllerDeps {
            loader,
            gate,
            chat: worker.clone(),
            forms: worker.clone(),
            csrf: CsrfTokens::new(csrf_source),
            reporter: worker.clone(),
            sessions: worker,
            store: Arc::new(MemoryStore::with_quota(SESSION_STORE_QUOTA_BYTES)),
            config,
        })
    }
}

// ── Instances ──────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct DragSlot {
    header: Option<NodeId>,
    enabled: bool,
    start: Option<Guard>,
    motion: Vec<Guard>,
    active: Option<Drag>,
}

pub(crate) struct ChatInstance {
    ui: ChatUi,
    session: ConversationSession,
    sending: Option<JoinHandle<()>>,
    /// Set by a security rejection; sending stays off for the session.
    locked: bool,
}

impl ChatInstance {
    fn blocked(&self, gate: Option<&GateHandle>) -> bool {
        self.locked || self.sending.is_some() || gate.map(|g| g.is_tripped()).unwrap_or(false)
    }
}

pub(crate) struct ModalInstance {
    form: NodeId,
    submitting: Option<JoinHandle<()>>,
    locked: bool,
}

pub(crate) struct WidgetInstance {
    id: WidgetId,
    root: NodeId,
    state: WidgetState,
    epoch: u64,
    last_focused: Option<NodeId>,
    overlay: Option<NodeId>,
    reopen: Option<NodeId>,
    reopen_guard: Option<Guard>,
    /// Live for the instance's whole life.
    guards: Vec<Guard>,
    /// Live only while Open (Escape, outside click).
    open_guards: Vec<Guard>,
    timer: InactivityTimer,
    drag: DragSlot,
    gate: Option<GateHandle>,
    chat: Option<ChatInstance>,
    modal: Option<ModalInstance>,
}

impl WidgetInstance {
    fn abort_tasks(&mut self) {
        if let Some(task) = self.chat.as_mut().and_then(|c| c.sending.take()) {
            task.abort();
            debug!("[chat] In-flight send aborted");
        }
        if let Some(task) = self.modal.as_mut().and_then(|m| m.submitting.take()) {
            task.abort();
        }
    }
}

pub(crate) enum Slot {
    Unloaded,
    Loading { load: SharedLoad, epoch: u64 },
    Loaded(Box<WidgetInstance>),
}

pub(crate) struct FabLauncher {
    container: NodeId,
    main: NodeId,
    options: Vec<(WidgetId, NodeId)>,
    _guards: Vec<Guard>,
}

pub struct ControllerState {
    pub doc: Document,
    listeners: ListenerRegistry<Binding>,
    slots: HashMap<WidgetId, Slot>,
    open: Option<WidgetId>,
    fab: Option<FabLauncher>,
    next_epoch: u64,
}

impl ControllerState {
    fn instance(&self, id: WidgetId) -> Option<&WidgetInstance> {
        match self.slots.get(&id) {
            Some(Slot::Loaded(inst)) => Some(inst),
            _ => None,
        }
    }

    fn instance_mut(&mut self, id: WidgetId) -> Option<&mut WidgetInstance> {
        match self.slots.get_mut(&id) {
            Some(Slot::Loaded(inst)) => Some(inst),
            _ => None,
        }
    }
}

pub(crate) struct ControllerShared {
    state: Mutex<ControllerState>,
    deps: ControllerDeps,
}

// ── Controller ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WidgetController {
    shared: Arc<ControllerShared>,
}

impl WidgetController {
    pub fn new(doc: Document, deps: ControllerDeps) -> Self {
        let slots = WidgetId::ALL.iter().map(|id| (*id, Slot::Unloaded)).collect();
        WidgetController {
            shared: Arc::new(ControllerShared {
                state: Mutex::new(ControllerState {
                    doc,
                    listeners: ListenerRegistry::new(),
                    slots,
                    open: None,
                    fab: None,
                    next_epoch: 1,
                }),
                deps,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.deps.config
    }

    // ── Inspection ─────────────────────────────────────────────────────

    pub fn state(&self, id: WidgetId) -> WidgetState {
        match self.shared.state.lock().slots.get(&id) {
            Some(Slot::Loaded(inst)) => inst.state,
            _ => WidgetState::Unloaded,
        }
    }

    pub fn is_loading(&self, id: WidgetId) -> bool {
        matches!(self.shared.state.lock().slots.get(&id), Some(Slot::Loading { .. }))
    }

    pub fn root(&self, id: WidgetId) -> Option<NodeId> {
        self.shared.state.lock().instance(id).map(|i| i.root)
    }

    pub fn open_widget(&self) -> Option<WidgetId> {
        self.shared.state.lock().open
    }

    pub fn reopen_button(&self, id: WidgetId) -> Option<NodeId> {
        self.shared.state.lock().instance(id).and_then(|i| i.reopen)
    }

    pub fn overlay(&self, id: WidgetId) -> Option<NodeId> {
        self.shared.state.lock().instance(id).and_then(|i| i.overlay)
    }

    pub fn is_timer_armed(&self, id: WidgetId) -> bool {
        self.shared.state.lock().instance(id).map(|i| i.timer.is_armed()).unwrap_or(false)
    }

    pub fn is_sending(&self, id: WidgetId) -> bool {
        let st = self.shared.state.lock();
        let Some(inst) = st.instance(id) else { return false };
        inst.chat.as_ref().map(|c| c.sending.is_some()).unwrap_or(false)
            || inst.modal.as_ref().map(|m| m.submitting.is_some()).unwrap_or(false)
    }

    pub fn is_tripped(&self, id: WidgetId) -> bool {
        self.shared
            .state
            .lock()
            .instance(id)
            .and_then(|i| i.gate.as_ref())
            .map(|g| g.is_tripped())
            .unwrap_or(false)
    }

    pub fn honeypot(&self, id: WidgetId) -> Option<crate::engine::gate::Honeypot> {
        self.shared.state.lock().instance(id).and_then(|i| i.gate.as_ref()).map(|g| g.honeypot)
    }

    pub fn is_drag_enabled(&self, id: WidgetId) -> bool {
        self.shared.state.lock().instance(id).map(|i| i.drag.enabled).unwrap_or(false)
    }

    pub fn listener_count(&self) -> usize {
        self.shared.state.lock().listeners.len()
    }

    pub fn document_listener_count(&self) -> usize {
        self.shared.state.lock().listeners.document_scoped()
    }

    pub fn listener_census(&self) -> HashMap<EventKind, usize> {
        self.shared.state.lock().listeners.census()
    }

    /// Read the document under the state lock.
    pub fn with_doc<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.shared.state.lock().doc)
    }

    /// Mutate the document directly, as a user typing into fields would.
    /// Listeners are not notified; dispatch an event for that.
    pub fn with_doc_mut<R>(&self, f: impl FnOnce(&mut Document) -> R) -> R {
        f(&mut self.shared.state.lock().doc)
    }

    // ── Loading ────────────────────────────────────────────────────────

    /// Fetch and insert the widget fragment once. Concurrent callers share
    /// one in-flight load; a close during the load discards its result.
    pub async fn load_fragment(&self, id: WidgetId) -> Option<NodeId> {
        let (load, epoch) = {
            let mut guard = self.shared.state.lock();
            let st = &mut *guard;
            let pending = match st.slots.get(&id) {
                Some(Slot::Loaded(inst)) => return Some(inst.root),
                Some(Slot::Loading { load, epoch }) => Some((load.clone(), *epoch)),
                _ => None,
            };
            match pending {
                Some(p) => p,
                None => {
                    let shared = self.shared.clone();
                    let load: SharedLoad = async move {
                        shared.deps.loader.fetch(id).await.map(Arc::new).map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    let epoch = st.next_epoch;
                    st.next_epoch += 1;
                    st.slots.insert(id, Slot::Loading { load: load.clone(), epoch });
                    info!("[lifecycle] Loading {}", id);
                    (load, epoch)
                }
            }
        };

        let result = load.await;

        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        match st.slots.get(&id) {
            Some(Slot::Loading { epoch: current, .. }) if *current == epoch => {}
            Some(Slot::Loaded(inst)) if inst.epoch == epoch => return Some(inst.root),
            _ => {
                info!("[lifecycle] Discarding stale load of {}", id);
                return None;
            }
        }
        let installed = match result {
            Ok(parsed) => self.install(st, id, &parsed, epoch),
            Err(e) => Err(EngineError::Policy(e.to_string())),
        };
        match installed {
            Ok(root) => Some(root),
            Err(e) => {
                warn!("[lifecycle] {} failed to load: {}", id, e);
                st.slots.insert(id, Slot::Unloaded);
                None
            }
        }
    }

    fn install(&self, st: &mut ControllerState, id: WidgetId, parsed: &ParsedFragment, epoch: u64) -> EngineResult<NodeId> {
        let cfg = &self.shared.deps.config;
        let root = insert_fragment(&mut st.doc, id, parsed)?;

        let chat = if id == WidgetId::Chatbot {
            let Some(ui) = ChatUi::locate(&st.doc, root) else {
                st.doc.remove(root);
                return Err(EngineError::Policy("chatbot fragment lacks its controls".into()));
            };
            let session = ConversationSession::load(
                self.shared.deps.store.as_ref(),
                cfg.conversation_ttl_secs,
                chrono::Utc::now(),
            );
            ui.prepare(&mut st.doc);
            ui.render(&mut st.doc, &session.log);
            Some(ChatInstance { ui, session, sending: None, locked: false })
        } else {
            None
        };
        let modal = if id.is_modal() {
            st.doc.query(root, "form").map(|form| ModalInstance { form, submitting: None, locked: false })
        } else {
            None
        };

        let form = chat.as_ref().map(|c| c.ui.form).or(modal.as_ref().map(|m| m.form));
        let gate = form.and_then(|f| GateHandle::attach(&mut st.doc, f));

        let overlay = if id.is_modal() {
            let overlay = st.doc.create_element("div");
            if let Some(el) = st.doc.element_mut(overlay) {
                el.add_class(OVERLAY_CLASS);
            }
            st.doc.set_hidden(overlay, true);
            let body = st.doc.body();
            st.doc.insert_before(body, overlay, root);
            Some(overlay)
        } else {
            None
        };

        let viewport = st.doc.viewport;
        let size = cfg.widget_size;
        let start = drag::pinned(Rect::new(0.0, 0.0, size.width, size.height), &viewport);
        st.doc.set_rect(root, start);
        st.doc.set_hidden(root, true);

        let mut inst = WidgetInstance {
            id,
            root,
            state: WidgetState::Hidden,
            epoch,
            last_focused: None,
            overlay,
            reopen: None,
            reopen_guard: None,
            guards: Vec::new(),
            open_guards: Vec::new(),
            timer: InactivityTimer::new(),
            drag: DragSlot::default(),
            gate,
            chat,
            modal,
        };
        if let Some(c) = inst.chat.as_ref() {
            let blocked = c.blocked(inst.gate.as_ref());
            c.ui.update_send_enabled(&mut st.doc, blocked);
        }
        inst.guards = dispatch::instance_bindings(&st.doc, &st.listeners, &inst);
        Self::rebind_drag(&mut st.doc, &st.listeners, &mut inst, cfg.drag_min_width);

        st.slots.insert(id, Slot::Loaded(Box::new(inst)));
        info!("[lifecycle] {} loaded (hidden)", id);
        Ok(root)
    }

    // ── Transitions ────────────────────────────────────────────────────

    /// Load if needed, then show. Another open widget moves to Hidden.
    pub async fn open(&self, id: WidgetId) -> bool {
        if self.load_fragment(id).await.is_none() {
            return false;
        }
        let mut st = self.shared.state.lock();
        self.open_locked(&mut st, id)
    }

    fn open_locked(&self, st: &mut ControllerState, id: WidgetId) -> bool {
        match st.instance(id).map(|i| i.state) {
            Some(WidgetState::Open) => return true,
            Some(WidgetState::Hidden) | Some(WidgetState::Minimized) => {}
            other => {
                debug!("[lifecycle] open({}) ignored in state {:?}", id, other);
                return false;
            }
        }
        if let Some(other) = st.open.filter(|o| *o != id) {
            self.hide_locked(st, other);
        }

        let cfg = &self.shared.deps.config;
        let ControllerState { doc, listeners, slots, .. } = st;
        let Some(Slot::Loaded(inst)) = slots.get_mut(&id) else { return false };

        let active = doc.active_element();
        if !doc.contains(inst.root, active) && inst.last_focused.is_none() {
            inst.last_focused = Some(active);
        }
        doc.set_hidden(inst.root, false);
        if let Some(overlay) = inst.overlay {
            doc.set_hidden(overlay, false);
        }
        Self::drop_reopen(doc, inst);

        inst.open_guards = vec![
            listeners.listen(Scope::Document, EventKind::KeyDown, Binding::Escape(id)),
            listeners.listen(Scope::Document, EventKind::Click, Binding::OutsideClick(id)),
        ];
        Self::rebind_drag(doc, listeners, inst, cfg.drag_min_width);
        let target = inst.chat.as_ref().map(|c| c.ui.input).or_else(|| doc.first_focusable(inst.root));
        if let Some(target) = target {
            doc.focus(target);
        }
        inst.state = WidgetState::Open;
        self.arm_timer(inst, cfg.inactivity_open_ms);
        if id == WidgetId::Chatbot {
            save_chat_state(self.shared.deps.store.as_ref(), WidgetState::Open);
        }
        st.open = Some(id);
        info!("[lifecycle] {} open", id);
        true
    }

    /// Open → Minimized, leaving a re-open affordance above the launcher.
    pub fn minimize(&self, id: WidgetId) -> bool {
        let mut st = self.shared.state.lock();
        if st.instance(id).map(|i| i.state) != Some(WidgetState::Open) {
            debug!("[lifecycle] minimize({}) ignored: not open", id);
            return false;
        }
        self.minimize_locked(&mut st, id);
        true
    }

    fn minimize_locked(&self, st: &mut ControllerState, id: WidgetId) {
        let cfg = &self.shared.deps.config;
        let ControllerState { doc, listeners, slots, open, .. } = st;
        let Some(Slot::Loaded(inst)) = slots.get_mut(&id) else { return };

        doc.set_hidden(inst.root, true);
        if let Some(overlay) = inst.overlay {
            doc.set_hidden(overlay, true);
        }
        inst.open_guards.clear();
        Self::end_drag(inst);

        let reopen = Self::make_reopen(doc, id, cfg);
        inst.reopen_guard = Some(listeners.listen(Scope::Node(reopen), EventKind::Click, Binding::Reopen(id)));
        inst.reopen = Some(reopen);

        Self::restore_focus(doc, inst);
        inst.state = WidgetState::Minimized;
        self.arm_timer(inst, cfg.inactivity_minimized_ms);

        if let Some(chat) = inst.chat.as_ref() {
            chat.session.persist(self.shared.deps.store.as_ref());
            save_chat_state(self.shared.deps.store.as_ref(), WidgetState::Minimized);
        }
        if *open == Some(id) {
            *open = None;
        }
        info!("[lifecycle] {} minimized", id);
    }

    /// Open → Hidden when another widget takes over.
    fn hide_locked(&self, st: &mut ControllerState, id: WidgetId) {
        let ControllerState { doc, slots, open, .. } = st;
        let Some(Slot::Loaded(inst)) = slots.get_mut(&id) else { return };
        doc.set_hidden(inst.root, true);
        if let Some(overlay) = inst.overlay {
            doc.set_hidden(overlay, true);
        }
        inst.open_guards.clear();
        Self::end_drag(inst);
        inst.timer.cancel();
        inst.state = WidgetState::Hidden;
        if let Some(chat) = inst.chat.as_ref() {
            chat.session.persist(self.shared.deps.store.as_ref());
        }
        if *open == Some(id) {
            *open = None;
        }
        info!("[lifecycle] {} hidden", id);
    }

    /// Tear the widget down from any loaded state, or cancel its load.
    pub fn close(&self, id: WidgetId) -> bool {
        let mut st = self.shared.state.lock();
        self.close_locked(&mut st, id)
    }

    fn close_locked(&self, st: &mut ControllerState, id: WidgetId) -> bool {
        let slot = st.slots.insert(id, Slot::Unloaded).unwrap_or(Slot::Unloaded);
        let mut inst = match slot {
            Slot::Loaded(inst) => inst,
            Slot::Loading { .. } => {
                info!("[lifecycle] {} load cancelled by close", id);
                return true;
            }
            Slot::Unloaded => {
                debug!("[lifecycle] close({}) ignored: not loaded", id);
                return false;
            }
        };

        inst.timer.cancel();
        inst.abort_tasks();
        inst.state = WidgetState::Closed;
        inst.open_guards.clear();
        inst.guards.clear();
        inst.reopen_guard = None;
        inst.drag = DragSlot::default();

        let doc = &mut st.doc;
        if let Some(reopen) = inst.reopen.take() {
            doc.remove(reopen);
        }
        if let Some(overlay) = inst.overlay.take() {
            doc.remove(overlay);
        }
        doc.remove(inst.root);
        Self::restore_focus(doc, &mut inst);

        if let Some(mut chat) = inst.chat.take() {
            chat.session.wipe(self.shared.deps.store.as_ref());
            self.spawn_end_session();
        }
        if st.open == Some(id) {
            st.open = None;
        }
        info!("[lifecycle] {} closed", id);
        debug!("[lifecycle] listeners after close: {:?}", st.listeners.census());
        true
    }

    /// Timer callback. Ignores a generation that was reset or cancelled.
    fn expire(&self, id: WidgetId, generation: u64) {
        let mut st = self.shared.state.lock();
        let live = st.instance_mut(id).map(|i| i.timer.take_expired(generation)).unwrap_or(false);
        if live {
            info!("[timer] {} idle, closing", id);
            self.close_locked(&mut st, id);
        }
    }

    // ── Shared helpers ─────────────────────────────────────────────────

    fn arm_timer(&self, inst: &mut WidgetInstance, ms: u64) {
        let weak = Arc::downgrade(&self.shared);
        let id = inst.id;
        inst.timer.arm(Duration::from_millis(ms), move |generation| {
            if let Some(shared) = weak.upgrade() {
                WidgetController { shared }.expire(id, generation);
            }
        });
    }

    /// Restart the countdown for the widget's current state.
    fn touch(&self, inst: &mut WidgetInstance) {
        let cfg = &self.shared.deps.config;
        match inst.state {
            WidgetState::Open => self.arm_timer(inst, cfg.inactivity_open_ms),
            WidgetState::Minimized => self.arm_timer(inst, cfg.inactivity_minimized_ms),
            _ => {}
        }
    }

    fn restore_focus(doc: &mut Document, inst: &mut WidgetInstance) {
        if let Some(prev) = inst.last_focused.take() {
            if doc.is_attached(prev) && !doc.contains(inst.root, prev) {
                doc.focus(prev);
            }
        }
    }

    fn make_reopen(doc: &mut Document, id: WidgetId, cfg: &ClientConfig) -> NodeId {
        let btn = doc.create_element("button");
        let fab = cfg.fab;
        if let Some(el) = doc.element_mut(btn) {
            if id == WidgetId::Chatbot {
                el.id = Some(CHAT_OPEN_BTN_ID.to_string());
                el.add_class(CHAT_REOPEN_CLASS);
                el.text = "CHAT".into();
            } else {
                el.add_class(MODAL_REOPEN_CLASS);
                el.text = id.as_str().to_uppercase();
            }
            el.set_attr("aria-expanded", "false");
            el.rect = Rect::new(0.0, 0.0, cfg.reopen_width, cfg.reopen_width);
            el.inset = Some(Inset {
                bottom: fab.bottom + fab.height + REOPEN_GAP,
                right: fab.right + (fab.width - cfg.reopen_width) / 2.0,
            });
        }
        let body = doc.body();
        doc.append_child(body, btn);
        btn
    }

    fn drop_reopen(doc: &mut Document, inst: &mut WidgetInstance) {
        inst.reopen_guard = None;
        if let Some(btn) = inst.reopen.take() {
            doc.remove(btn);
        }
    }

    fn end_drag(inst: &mut WidgetInstance) {
        inst.drag.active = None;
        inst.drag.motion.clear();
    }

    /// Drop any previous drag binding, re-apply layout for the viewport and
    /// bind pointer-down on the header when dragging is allowed.
    fn rebind_drag(doc: &mut Document, listeners: &ListenerRegistry<Binding>, inst: &mut WidgetInstance, min_width: f64) {
        inst.drag.start = None;
        Self::end_drag(inst);
        inst.drag.enabled = drag::apply_layout(doc, inst.root, min_width);
        inst.drag.header = drag::header_for(doc, inst.root);
        if let (true, Some(header)) = (inst.drag.enabled, inst.drag.header) {
            inst.drag.start = Some(listeners.listen(Scope::Node(header), EventKind::PointerDown, Binding::DragStart(inst.id)));
        }
        debug!("[drag] {} rebound (enabled={})", inst.id, inst.drag.enabled);
    }

    fn spawn_end_session(&self) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else { return };
        let sessions = self.shared.deps.sessions.clone();
        rt.spawn(async move {
            if let Err(e) = sessions.end_session().await {
                debug!("[chat] End-session beacon failed: {}", e);
            }
        });
    }
}
