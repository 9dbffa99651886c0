// Cojoin Engine — Drag Positioner
//
// Pointer-driven repositioning of a widget by its header. Dragging only
// exists on wide viewports; narrow viewports pin the widget to a safe-area
// corner instead. All motion is clamped so the widget stays fully visible,
// using the visual viewport height when an on-screen keyboard shrinks it.
//
// This module is geometry only. The controller owns the listener guards and
// decides when to call in here.

use crate::atoms::constants::{CHAT_HEADER_ID, DRAG_ENABLED_CLASS, MODAL_HEADER_CLASS, SAFE_AREA_INSET};
use crate::engine::dom::{Document, Inset, NodeId, Rect, Viewport};
use log::debug;

/// Header element that acts as the drag handle.
pub fn header_for(doc: &Document, root: NodeId) -> Option<NodeId> {
    doc.query(root, &format!(".{}", MODAL_HEADER_CLASS))
        .or_else(|| doc.find_by_id(root, CHAT_HEADER_ID))
}

pub fn drag_enabled(viewport: &Viewport, min_width: f64) -> bool {
    viewport.width >= min_width
}

/// Keep `rect` inside the viewport. Oversized widgets stick to the top-left.
pub fn clamp(rect: Rect, viewport: &Viewport) -> Rect {
    let max_left = (viewport.width - rect.width).max(0.0);
    let max_top = (viewport.usable_height() - rect.height).max(0.0);
    Rect {
        left: rect.left.clamp(0.0, max_left),
        top: rect.top.clamp(0.0, max_top),
        ..rect
    }
}

/// Fixed bottom-right position used when dragging is off.
pub fn pinned(rect: Rect, viewport: &Viewport) -> Rect {
    let left = (viewport.width - rect.width - SAFE_AREA_INSET).max(0.0);
    let top = (viewport.usable_height() - rect.height - SAFE_AREA_INSET).max(0.0);
    Rect { left, top, ..rect }
}

/// Apply the layout mode for the current viewport. Returns whether drag is on.
pub fn apply_layout(doc: &mut Document, root: NodeId, min_width: f64) -> bool {
    let viewport = doc.viewport;
    let enabled = drag_enabled(&viewport, min_width);
    let rect = doc.rect(root);
    let placed = if enabled { clamp(rect, &viewport) } else { pinned(rect, &viewport) };
    if let Some(el) = doc.element_mut(root) {
        el.rect = placed;
        el.toggle_class(DRAG_ENABLED_CLASS, Some(enabled));
        el.inset = if enabled {
            None
        } else {
            Some(Inset { bottom: SAFE_AREA_INSET, right: SAFE_AREA_INSET })
        };
    }
    enabled
}

/// Whether a pointer-down on `target` should begin a drag of the widget
/// whose handle is `header`.
pub fn starts_drag(doc: &Document, header: NodeId, target: NodeId) -> bool {
    if !doc.contains(header, target) {
        return false;
    }
    let mut cur = Some(target);
    while let Some(n) = cur {
        if doc.element(n).map(|e| e.is_control()).unwrap_or(false) {
            return false;
        }
        if n == header {
            break;
        }
        cur = doc.parent(n);
    }
    true
}

/// An active drag gesture: pointer offset from the widget's top-left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drag {
    offset_x: f64,
    offset_y: f64,
}

impl Drag {
    pub fn begin(doc: &Document, root: NodeId, x: f64, y: f64) -> Self {
        let rect = doc.rect(root);
        Drag { offset_x: x - rect.left, offset_y: y - rect.top }
    }

    pub fn move_to(&self, doc: &mut Document, root: NodeId, x: f64, y: f64) {
        let viewport = doc.viewport;
        let rect = doc.rect(root);
        let next = clamp(Rect { left: x - self.offset_x, top: y - self.offset_y, ..rect }, &viewport);
        debug!("[drag] move to ({:.0}, {:.0})", next.left, next.top);
        doc.set_rect(root, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(width: f64) -> (Document, NodeId, NodeId, NodeId) {
        let mut doc = Document::new("https://site.test", Viewport::new(width, 600.0));
        let root = doc.create_element("div");
        let header = doc.create_element("div");
        let ctrl = doc.create_element("span");
        doc.element_mut(header).unwrap().add_class("modal-header");
        doc.element_mut(ctrl).unwrap().add_class("ctrl");
        doc.append_child(doc.body(), root);
        doc.append_child(root, header);
        doc.append_child(header, ctrl);
        doc.set_rect(root, Rect::new(100.0, 100.0, 300.0, 200.0));
        (doc, root, header, ctrl)
    }

    #[test]
    fn clamps_to_viewport() {
        let (mut doc, root, ..) = setup(1024.0);
        let d = Drag::begin(&doc, root, 110.0, 110.0);
        d.move_to(&mut doc, root, 5000.0, 5000.0);
        assert_eq!(doc.rect(root), Rect::new(724.0, 400.0, 300.0, 200.0));
        d.move_to(&mut doc, root, -50.0, -50.0);
        assert_eq!(doc.rect(root).left, 0.0);
        assert_eq!(doc.rect(root).top, 0.0);
    }

    #[test]
    fn keyboard_shrinks_vertical_range() {
        let (mut doc, root, ..) = setup(1024.0);
        doc.viewport.visual_height = Some(300.0);
        let d = Drag::begin(&doc, root, 100.0, 100.0);
        d.move_to(&mut doc, root, 100.0, 500.0);
        assert_eq!(doc.rect(root).top, 100.0);
    }

    #[test]
    fn controls_do_not_start_a_drag() {
        let (doc, _, header, ctrl) = setup(1024.0);
        assert!(starts_drag(&doc, header, header));
        assert!(!starts_drag(&doc, header, ctrl));
    }

    #[test]
    fn narrow_viewport_pins_to_safe_area() {
        let (mut doc, root, ..) = setup(500.0);
        assert!(!apply_layout(&mut doc, root, 768.0));
        assert_eq!(doc.rect(root), Rect::new(184.0, 384.0, 300.0, 200.0));
        assert!(!doc.element(root).unwrap().has_class("drag-enabled"));
        doc.viewport.width = 1024.0;
        assert!(apply_layout(&mut doc, root, 768.0));
        assert!(doc.element(root).unwrap().has_class("drag-enabled"));
    }
}
