// Launcher: one main button that fans out an option per widget.

use super::{Binding, ControllerState, FabLauncher, WidgetController};
use crate::atoms::constants::{FAB_CONTAINER_CLASS, FAB_MAIN_CLASS, FAB_OPTION_CLASS};
use crate::atoms::types::WidgetId;
use crate::engine::dom::{EventKind, Inset, NodeId, Rect, Scope};
use log::{debug, info};

const OPEN_CLASS: &str = "open";

fn option_title(id: WidgetId) -> &'static str {
    match id {
        WidgetId::Contact => "Contact Us",
        WidgetId::Join => "Join Us",
        WidgetId::Chatbot => "Chatbot",
    }
}

impl WidgetController {
    /// Create the launcher once and return its container.
    pub fn mount_fab(&self) -> NodeId {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        if let Some(fab) = st.fab.as_ref() {
            return fab.container;
        }
        let geometry = self.config().fab;
        let doc = &mut st.doc;

        let container = doc.create_element("div");
        if let Some(el) = doc.element_mut(container) {
            el.add_class(FAB_CONTAINER_CLASS);
            el.inset = Some(Inset { bottom: geometry.bottom, right: geometry.right });
        }
        let body = doc.body();
        doc.append_child(body, container);

        let main = doc.create_element("button");
        if let Some(el) = doc.element_mut(main) {
            el.add_class(FAB_MAIN_CLASS);
            el.set_attr("aria-label", "Open menu");
            el.set_attr("aria-expanded", "false");
            el.rect = Rect::new(0.0, 0.0, geometry.width, geometry.height);
        }
        doc.append_child(container, main);

        let list = doc.create_element("div");
        if let Some(el) = doc.element_mut(list) {
            el.add_class("fab-options");
        }
        doc.append_child(container, list);

        let mut guards = vec![st.listeners.listen(Scope::Node(main), EventKind::Click, Binding::FabToggle)];
        let mut options = Vec::new();
        for id in WidgetId::ALL {
            let button = doc.create_element("button");
            if let Some(el) = doc.element_mut(button) {
                el.id = Some(id.fab_option_id());
                el.add_class(FAB_OPTION_CLASS);
                el.set_attr("title", option_title(id));
                el.set_attr("aria-label", option_title(id));
            }
            doc.append_child(list, button);
            guards.push(st.listeners.listen(Scope::Node(button), EventKind::Click, Binding::FabOption(id)));
            options.push((id, button));
        }

        st.fab = Some(FabLauncher { container, main, options, _guards: guards });
        info!("[lifecycle] Launcher mounted");
        container
    }

    pub fn fab_menu_open(&self) -> bool {
        Self::menu_flag(&self.shared.state.lock())
    }

    pub fn fab_option(&self, id: WidgetId) -> Option<NodeId> {
        let st = self.shared.state.lock();
        st.fab.as_ref()?.options.iter().find(|(w, _)| *w == id).map(|(_, n)| *n)
    }

    pub fn fab_main(&self) -> Option<NodeId> {
        self.shared.state.lock().fab.as_ref().map(|f| f.main)
    }

    /// Collapsing the menu by hand also closes whatever widget is open.
    pub(super) fn toggle_fab_menu(&self) {
        let mut guard = self.shared.state.lock();
        let open = !Self::menu_flag(&guard);
        Self::set_menu_flag(&mut guard, open);
        if !open {
            if let Some(current) = guard.open {
                debug!("[lifecycle] Launcher collapsed, closing {}", current);
                self.close_locked(&mut guard, current);
            }
        }
    }

    pub(super) fn set_fab_menu(&self, open: bool) {
        Self::set_menu_flag(&mut self.shared.state.lock(), open);
    }

    fn menu_flag(st: &ControllerState) -> bool {
        st.fab
            .as_ref()
            .and_then(|f| st.doc.element(f.container))
            .map(|el| el.has_class(OPEN_CLASS))
            .unwrap_or(false)
    }

    fn set_menu_flag(st: &mut ControllerState, open: bool) {
        let Some(fab) = st.fab.as_ref() else { return };
        let (container, main) = (fab.container, fab.main);
        if let Some(el) = st.doc.element_mut(container) {
            el.toggle_class(OPEN_CLASS, Some(open));
        }
        if let Some(el) = st.doc.element_mut(main) {
            el.set_attr("aria-expanded", if open { "true" } else { "false" });
        }
    }
}
