// Cojoin Engine — In-Memory Document
//
// An owned document arena standing in for the browser DOM. Widgets, the
// gate, the timer and the drag positioner operate on `NodeId`s into this
// arena, so the whole lifecycle runs headless and deterministic.
//
// Listeners are declarative: a registration pairs a scope (whole document or
// a node subtree) and an event kind with an opaque binding value. The
// registration lives exactly as long as its `ListenerGuard`; dropping the
// guard unregisters it. There is no add/remove pairing to get wrong.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

// ── Geometry ───────────────────────────────────────────────────────────────

/// Arena handle. The generation makes a handle to a removed node stay dead
/// after its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Rect { left, top, width, height }
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }
}

/// Offsets from the bottom-right corner for fixed-position elements.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Inset {
    pub bottom: f64,
    pub right: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    /// Visual viewport height when it differs from the layout viewport
    /// (on-screen keyboard).
    pub visual_height: Option<f64>,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Viewport { width, height, visual_height: None }
    }

    /// Height actually visible to the user.
    pub fn usable_height(&self) -> f64 {
        match self.visual_height {
            Some(h) => h.min(self.height),
            None => self.height,
        }
    }
}

// ── Elements ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Element {
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
    pub value: String,
    pub checked: bool,
    pub disabled: bool,
    pub hidden: bool,
    pub rect: Rect,
    pub inset: Option<Inset>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Element { tag: tag.to_ascii_lowercase(), ..Default::default() }
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    pub fn add_class(&mut self, class: &str) {
        if !self.has_class(class) {
            self.classes.push(class.to_string());
        }
    }

    pub fn remove_class(&mut self, class: &str) {
        self.classes.retain(|c| c != class);
    }

    /// Toggle a class, returning whether it is now present.
    pub fn toggle_class(&mut self, class: &str, force: Option<bool>) -> bool {
        let add = force.unwrap_or(!self.has_class(class));
        if add {
            self.add_class(class);
        } else {
            self.remove_class(class);
        }
        add
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        self.attrs.insert(name.to_string(), value.to_string());
    }

    /// Interactive controls that must stay clickable inside a drag header.
    pub fn is_control(&self) -> bool {
        matches!(self.tag.as_str(), "button" | "a" | "input" | "select" | "textarea")
            || self.has_class("ctrl")
    }

    /// Matches `button, [href], input, select, textarea, [tabindex]:not([tabindex="-1"])`.
    pub fn is_focusable(&self) -> bool {
        if self.attr("tabindex") == Some("-1") {
            return false;
        }
        matches!(self.tag.as_str(), "button" | "input" | "select" | "textarea")
            || self.attrs.contains_key("href")
            || self.attrs.contains_key("tabindex")
    }
}

// ── Selectors ──────────────────────────────────────────────────────────────
// Compound selectors only (`tag#id.class[attr]`, `[attr=value]`),
// comma-separated lists. Enough for fixed widget identities; no combinators.
// Anything else fails to parse and matches nothing.

#[derive(Debug, Default)]
struct SimpleSelector {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

impl SimpleSelector {
    fn parse(src: &str) -> Option<Self> {
        let src = src.trim();
        if src.is_empty() {
            return None;
        }
        let mut sel = SimpleSelector::default();
        let mut rest = src;
        let tag_end = rest.find(['#', '.', '[']).unwrap_or(rest.len());
        if tag_end > 0 {
            sel.tag = Some(rest[..tag_end].to_ascii_lowercase());
        }
        rest = &rest[tag_end..];
        while !rest.is_empty() {
            let marker = rest.chars().next()?;
            rest = &rest[1..];
            if marker == '[' {
                let close = rest.find(']')?;
                sel.attrs.push(parse_attr_test(&rest[..close])?);
                rest = &rest[close + 1..];
                continue;
            }
            let end = rest.find(['#', '.', '[']).unwrap_or(rest.len());
            let part = rest[..end].to_string();
            if part.is_empty() {
                return None;
            }
            match marker {
                '#' => sel.id = Some(part),
                '.' => sel.classes.push(part),
                _ => return None,
            }
            rest = &rest[end..];
        }
        Some(sel)
    }

    fn matches(&self, el: &Element) -> bool {
        if let Some(tag) = &self.tag {
            if &el.tag != tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if el.id.as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        self.classes.iter().all(|c| el.has_class(c))
            && self.attrs.iter().all(|(name, want)| {
                let have = if name == "id" { el.id.as_deref() } else { el.attr(name) };
                match want {
                    Some(v) => have == Some(v.as_str()),
                    None => have.is_some(),
                }
            })
    }
}

/// `name`, `name=value`, `name="value"` or `name='value'`.
fn parse_attr_test(body: &str) -> Option<(String, Option<String>)> {
    let (name, value) = match body.split_once('=') {
        Some((n, v)) => (n.trim(), Some(v.trim())),
        None => (body.trim(), None),
    };
    let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if name.is_empty() || !name.chars().all(valid) {
        return None;
    }
    let value = match value {
        None => None,
        Some(v) => {
            let unquoted = ['"', '\'']
                .iter()
                .find_map(|q| v.strip_prefix(*q).and_then(|r| r.strip_suffix(*q)));
            match unquoted {
                Some(inner) => Some(inner.to_string()),
                None if !v.is_empty() && v.chars().all(valid) => Some(v.to_string()),
                None => return None,
            }
        }
    };
    Some((name.to_ascii_lowercase(), value))
}

fn parse_selector_list(selector: &str) -> Vec<SimpleSelector> {
    selector.split(',').filter_map(SimpleSelector::parse).collect()
}

// ── Document ───────────────────────────────────────────────────────────────

struct NodeSlot {
    generation: u32,
    element: Option<Element>,
}

pub struct Document {
    nodes: Vec<NodeSlot>,
    free: Vec<u32>,
    html: NodeId,
    body: NodeId,
    active: NodeId,
    origin: String,
    pub viewport: Viewport,
    pub visible: bool,
    pub lang: String,
    alerts: Vec<String>,
}

impl Document {
    pub fn new(origin: &str, viewport: Viewport) -> Self {
        let root = NodeId { index: 0, generation: 0 };
        let mut doc = Document {
            nodes: Vec::new(),
            free: Vec::new(),
            html: root,
            body: root,
            active: root,
            origin: origin.trim_end_matches('/').to_string(),
            viewport,
            visible: true,
            lang: "en".into(),
            alerts: Vec::new(),
        };
        let html = doc.create_element("html");
        let body = doc.create_element("body");
        doc.html = html;
        doc.body = body;
        doc.append_child(html, body);
        doc.active = body;
        doc
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    pub fn html(&self) -> NodeId {
        self.html
    }

    /// New detached element. Reuses a freed slot when one is available.
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.nodes[index as usize];
            slot.element = Some(Element::new(tag));
            return NodeId { index, generation: slot.generation };
        }
        self.nodes.push(NodeSlot { generation: 0, element: Some(Element::new(tag)) });
        NodeId { index: (self.nodes.len() - 1) as u32, generation: 0 }
    }

    fn slot(&self, node: NodeId) -> Option<&NodeSlot> {
        self.nodes.get(node.index as usize).filter(|s| s.generation == node.generation)
    }

    pub fn element(&self, node: NodeId) -> Option<&Element> {
        self.slot(node).and_then(|s| s.element.as_ref())
    }

    pub fn element_mut(&mut self, node: NodeId) -> Option<&mut Element> {
        self.nodes
            .get_mut(node.index as usize)
            .filter(|s| s.generation == node.generation)
            .and_then(|s| s.element.as_mut())
    }

    /// Slots in the arena, live or free.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn exists(&self, node: NodeId) -> bool {
        self.element(node).is_some()
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.element(node).and_then(|e| e.parent)
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.element(node).map(|e| e.children.as_slice()).unwrap_or(&[])
    }

    fn detach(&mut self, child: NodeId) {
        if let Some(parent) = self.parent(child) {
            if let Some(p) = self.element_mut(parent) {
                p.children.retain(|c| *c != child);
            }
        }
        if let Some(c) = self.element_mut(child) {
            c.parent = None;
        }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        if !self.exists(parent) || !self.exists(child) || parent == child || self.contains(child, parent) {
            return;
        }
        self.detach(child);
        if let Some(p) = self.element_mut(parent) {
            p.children.push(child);
        }
        if let Some(c) = self.element_mut(child) {
            c.parent = Some(parent);
        }
    }

    /// Insert `child` before `reference`; appends when `reference` is not a child of `parent`.
    pub fn insert_before(&mut self, parent: NodeId, child: NodeId, reference: NodeId) {
        if !self.exists(parent) || !self.exists(child) || self.contains(child, parent) {
            return;
        }
        self.detach(child);
        let Some(p) = self.element_mut(parent) else { return };
        match p.children.iter().position(|c| *c == reference) {
            Some(idx) => p.children.insert(idx, child),
            None => p.children.push(child),
        }
        if let Some(c) = self.element_mut(child) {
            c.parent = Some(parent);
        }
    }

    /// Remove a node and free its whole subtree. Focus inside it falls back to body.
    pub fn remove(&mut self, node: NodeId) {
        if node == self.html || node == self.body || !self.exists(node) {
            return;
        }
        if self.contains(node, self.active) {
            self.active = self.body;
        }
        self.detach(node);
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            let Some(slot) = self.nodes.get_mut(n.index as usize).filter(|s| s.generation == n.generation) else {
                continue;
            };
            if let Some(el) = slot.element.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(n.index);
                stack.extend(el.children);
            }
        }
    }

    /// True when `node` is `ancestor` or lies inside it.
    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = Some(node);
        while let Some(n) = cur {
            if n == ancestor {
                return true;
            }
            cur = self.parent(n);
        }
        false
    }

    pub fn is_attached(&self, node: NodeId) -> bool {
        self.exists(node) && self.contains(self.html, node)
    }

    /// Attached and not inside any hidden element.
    pub fn is_rendered(&self, node: NodeId) -> bool {
        if !self.is_attached(node) {
            return false;
        }
        let mut cur = Some(node);
        while let Some(n) = cur {
            if self.element(n).map(|e| e.hidden).unwrap_or(true) {
                return false;
            }
            cur = self.parent(n);
        }
        true
    }

    /// Pre-order descendants, excluding `root` itself.
    pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(root).iter().rev().copied().collect();
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.children(n).iter().rev().copied());
        }
        out
    }

    pub fn query_all(&self, root: NodeId, selector: &str) -> Vec<NodeId> {
        let list = parse_selector_list(selector);
        self.descendants(root)
            .into_iter()
            .filter(|n| {
                self.element(*n)
                    .map(|el| list.iter().any(|s| s.matches(el)))
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn query(&self, root: NodeId, selector: &str) -> Option<NodeId> {
        self.query_all(root, selector).into_iter().next()
    }

    /// Nearest inclusive ancestor matching `selector`.
    pub fn closest(&self, node: NodeId, selector: &str) -> Option<NodeId> {
        let list = parse_selector_list(selector);
        let mut cur = Some(node);
        while let Some(n) = cur {
            if let Some(el) = self.element(n) {
                if list.iter().any(|s| s.matches(el)) {
                    return Some(n);
                }
            }
            cur = self.parent(n);
        }
        None
    }

    /// Attached element with the given id.
    pub fn get_element_by_id(&self, id: &str) -> Option<NodeId> {
        self.find_by_id(self.html, id)
    }

    pub fn find_by_id(&self, root: NodeId, id: &str) -> Option<NodeId> {
        self.descendants(root)
            .into_iter()
            .find(|n| self.element(*n).and_then(|e| e.id.as_deref()) == Some(id))
    }

    pub fn first_focusable(&self, root: NodeId) -> Option<NodeId> {
        self.descendants(root).into_iter().find(|n| {
            self.element(*n).map(|e| e.is_focusable() && !e.disabled).unwrap_or(false)
                && self.is_rendered(*n)
        })
    }

    // ── Focus ──────────────────────────────────────────────────────────

    pub fn active_element(&self) -> NodeId {
        self.active
    }

    /// Move focus; refused for detached nodes.
    pub fn focus(&mut self, node: NodeId) -> bool {
        if self.is_attached(node) {
            self.active = node;
            true
        } else {
            false
        }
    }

    // ── Field helpers ──────────────────────────────────────────────────

    pub fn value(&self, node: NodeId) -> &str {
        self.element(node).map(|e| e.value.as_str()).unwrap_or("")
    }

    pub fn set_value(&mut self, node: NodeId, value: &str) {
        if let Some(el) = self.element_mut(node) {
            el.value = value.to_string();
        }
    }

    pub fn set_checked(&mut self, node: NodeId, checked: bool) {
        if let Some(el) = self.element_mut(node) {
            el.checked = checked;
        }
    }

    pub fn text(&self, node: NodeId) -> &str {
        self.element(node).map(|e| e.text.as_str()).unwrap_or("")
    }

    pub fn set_text(&mut self, node: NodeId, text: &str) {
        if let Some(el) = self.element_mut(node) {
            el.text = text.to_string();
        }
    }

    pub fn set_hidden(&mut self, node: NodeId, hidden: bool) {
        if let Some(el) = self.element_mut(node) {
            el.hidden = hidden;
            if hidden {
                el.set_attr("aria-hidden", "true");
            } else {
                el.attrs.remove("aria-hidden");
            }
        }
    }

    pub fn set_disabled(&mut self, node: NodeId, disabled: bool) {
        if let Some(el) = self.element_mut(node) {
            el.disabled = disabled;
        }
    }

    pub fn is_disabled(&self, node: NodeId) -> bool {
        self.element(node).map(|e| e.disabled).unwrap_or(true)
    }

    pub fn rect(&self, node: NodeId) -> Rect {
        self.element(node).map(|e| e.rect).unwrap_or_default()
    }

    pub fn set_rect(&mut self, node: NodeId, rect: Rect) {
        if let Some(el) = self.element_mut(node) {
            el.rect = rect;
        }
    }

    // ── Window surface ─────────────────────────────────────────────────

    /// Blocking alert dialog. Recorded so callers can observe it.
    pub fn alert(&mut self, message: &str) {
        self.alerts.push(message.to_string());
    }

    pub fn alerts(&self) -> &[String] {
        &self.alerts
    }
}

// ── Events ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Click,
    KeyDown,
    Input,
    Change,
    Submit,
    PointerDown,
    PointerMove,
    PointerUp,
    Touch,
    Resize,
    Visibility,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomEvent {
    Click { target: NodeId },
    KeyDown { target: NodeId, key: String, shift: bool },
    Input { target: NodeId },
    Change { target: NodeId },
    Submit { form: NodeId },
    PointerDown { target: NodeId, x: f64, y: f64 },
    PointerMove { x: f64, y: f64 },
    PointerUp,
    Touch { target: NodeId },
    Resize { width: f64, height: f64, visual_height: Option<f64> },
    Visibility { visible: bool },
}

impl DomEvent {
    pub fn key_down(target: NodeId, key: &str) -> Self {
        DomEvent::KeyDown { target, key: key.to_string(), shift: false }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            DomEvent::Click { .. } => EventKind::Click,
            DomEvent::KeyDown { .. } => EventKind::KeyDown,
            DomEvent::Input { .. } => EventKind::Input,
            DomEvent::Change { .. } => EventKind::Change,
            DomEvent::Submit { .. } => EventKind::Submit,
            DomEvent::PointerDown { .. } => EventKind::PointerDown,
            DomEvent::PointerMove { .. } => EventKind::PointerMove,
            DomEvent::PointerUp => EventKind::PointerUp,
            DomEvent::Touch { .. } => EventKind::Touch,
            DomEvent::Resize { .. } => EventKind::Resize,
            DomEvent::Visibility { .. } => EventKind::Visibility,
        }
    }

    pub fn target(&self) -> Option<NodeId> {
        match self {
            DomEvent::Click { target }
            | DomEvent::KeyDown { target, .. }
            | DomEvent::Input { target }
            | DomEvent::Change { target }
            | DomEvent::PointerDown { target, .. }
            | DomEvent::Touch { target } => Some(*target),
            DomEvent::Submit { form } => Some(*form),
            _ => None,
        }
    }
}

// ── Listener registry ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every event of the kind, wherever it lands.
    Document,
    /// Events whose target is the node or lies inside it.
    Node(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener<B> {
    scope: Scope,
    kind: EventKind,
    binding: B,
}

type Slots<B> = Mutex<BTreeMap<u64, Listener<B>>>;

pub struct ListenerRegistry<B> {
    slots: Arc<Slots<B>>,
    next: AtomicU64,
}

impl<B: Clone> Default for ListenerRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Clone> ListenerRegistry<B> {
    pub fn new() -> Self {
        ListenerRegistry { slots: Arc::new(Mutex::new(BTreeMap::new())), next: AtomicU64::new(1) }
    }

    /// Register a listener. It stays active until the returned guard drops.
    #[must_use = "dropping the guard unregisters the listener immediately"]
    pub fn listen(&self, scope: Scope, kind: EventKind, binding: B) -> ListenerGuard<B> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().insert(id, Listener { scope, kind, binding });
        ListenerGuard { id, slots: Arc::downgrade(&self.slots) }
    }

    /// Listeners that should fire for `event`: node-scoped first, then
    /// document-scoped, each in registration order.
    pub fn matching(&self, doc: &Document, event: &DomEvent) -> Vec<(ListenerId, B)> {
        let kind = event.kind();
        let target = event.target();
        let slots = self.slots.lock();
        let mut node_scoped = Vec::new();
        let mut doc_scoped = Vec::new();
        for (id, l) in slots.iter().filter(|(_, l)| l.kind == kind) {
            match l.scope {
                Scope::Document => doc_scoped.push((ListenerId(*id), l.binding.clone())),
                Scope::Node(node) => {
                    if target.map(|t| doc.contains(node, t)).unwrap_or(false) {
                        node_scoped.push((ListenerId(*id), l.binding.clone()));
                    }
                }
            }
        }
        node_scoped.extend(doc_scoped);
        node_scoped
    }

    /// Whether a registration is still held. Listeners removed while an
    /// event is being delivered must not fire for it.
    pub fn is_live(&self, id: ListenerId) -> bool {
        self.slots.lock().contains_key(&id.0)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Listeners registered at document scope.
    pub fn document_scoped(&self) -> usize {
        self.slots.lock().values().filter(|l| l.scope == Scope::Document).count()
    }

    /// Count per event kind, for diagnostics.
    pub fn census(&self) -> HashMap<EventKind, usize> {
        let mut out = HashMap::new();
        for l in self.slots.lock().values() {
            *out.entry(l.kind).or_insert(0) += 1;
        }
        out
    }
}

/// Owned registration handle. Unregisters on drop.
pub struct ListenerGuard<B> {
    id: u64,
    slots: Weak<Slots<B>>,
}

impl<B> Drop for ListenerGuard<B> {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            slots.lock().remove(&self.id);
        }
    }
}

impl<B> std::fmt::Debug for ListenerGuard<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard").field("id", &self.id).finish()
    }
}
