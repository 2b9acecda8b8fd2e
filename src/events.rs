//! X event dispatch.
//!
//! Every notification maps onto a registry or state-machine operation;
//! anything heavier (painting, fading) happens later in the frame. Handlers
//! never block on X beyond the property reads they need.

use tracing::{debug, trace, warn};
use x11rb::connection::Connection;
use x11rb::protocol::damage::{self, ConnectionExt as _};
use x11rb::protocol::shape;
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xproto::{
    ChangeWindowAttributesAux, CirculateNotifyEvent, ConfigureNotifyEvent, ConnectionExt as _,
    EventMask, Place, PropertyNotifyEvent,
};
use x11rb::protocol::Event;
use x11rb::protocol::shape::ConnectionExt as _;

use crate::props;
use crate::region::{Rect, Region};
use crate::session::Session;
use crate::stack::WinKey;
use crate::win::{Geometry, WinFlags};

impl Session {
    pub(crate) fn handle_event(&mut self, event: Event) {
        match event {
            Event::CreateNotify(e) => {
                if e.parent == self.root {
                    self.add_window(e.window, 0);
                }
            }

            Event::ConfigureNotify(e) => self.handle_configure(e),

            Event::MapNotify(e) => {
                if Some(e.window) == self.overlay {
                    return;
                }
                if let Some(key) = self.core.stack.find(e.window) {
                    self.map_win_x(key);
                }
            }

            Event::UnmapNotify(e) => {
                if let Some(key) = self.core.stack.find(e.window) {
                    self.win_ev_stop(key);
                    let Session { core, backend, .. } = self;
                    core.unmap_win(key, false, backend.as_mut());
                }
            }

            Event::DestroyNotify(e) => {
                if let Some(key) = self.core.stack.find(e.window) {
                    self.win_ev_stop(key);
                    let Session { core, backend, .. } = self;
                    core.unmap_win(key, true, backend.as_mut());
                }
            }

            Event::ReparentNotify(e) => {
                trace!("Reparent of {:#010x} to {:#010x}", e.window, e.parent);
                if e.parent == self.root {
                    self.add_window(e.window, 0);
                } else if let Some(key) = self.core.stack.find(e.window) {
                    // Gone from the top level; treat like destruction.
                    self.win_ev_stop(key);
                    let Session { core, backend, .. } = self;
                    core.unmap_win(key, true, backend.as_mut());
                } else {
                    // The window may have become (or stopped being) the
                    // client of some frame.
                    if let Some(k) = self.core.stack.find_toplevel(e.window) {
                        let frame = self.core.stack.get(k).map(|w| w.id);
                        if let Some(frame) = frame {
                            let found =
                                props::find_client_win(self.conn.as_ref(), &self.atoms, frame)
                                    .unwrap_or(frame);
                            self.mark_client(k, found);
                        }
                    }
                }
            }

            Event::CirculateNotify(e) => self.handle_circulate(e),

            Event::Expose(e) => {
                if e.window == self.root || Some(e.window) == self.overlay {
                    self.core.add_damage(&Region::from_rect(Rect::new(
                        e.x as i32,
                        e.y as i32,
                        e.width as i32,
                        e.height as i32,
                    )));
                }
            }

            Event::PropertyNotify(e) => self.handle_property(e),

            Event::DamageNotify(e) => self.handle_damage(e),

            Event::ShapeNotify(e) => self.handle_shape(e),

            Event::RandrScreenChangeNotify(_) => {
                debug!("Screen change notification");
                self.update_xinerama_screens();
            }

            Event::SelectionClear(e) => {
                if e.selection == self.atoms.cm_selection {
                    self.fatal =
                        Some("Lost the composite manager selection, exiting".to_string());
                    self.quit = true;
                }
            }

            Event::FocusIn(_) | Event::FocusOut(_) => {
                if !self.core.config.general.use_ewmh_active_win {
                    self.recheck_focus();
                }
            }

            Event::Error(e) => self.errors.handle(&e),

            other => {
                trace!("Unhandled event: {:?}", other);
            }
        }
    }

    fn handle_configure(&mut self, e: ConfigureNotifyEvent) {
        if e.window == self.root {
            debug!("Root resized to {}x{}", e.width, e.height);
            self.core.set_root_size(e.width, e.height);
            if let Err(err) = self.backend.root_change(e.width, e.height) {
                warn!("Backend failed to follow root change: {}", err);
            }
            self.core.damage.clear();
            self.core.force_repaint();
            return;
        }

        let Some(key) = self.core.stack.find(e.window) else { return };
        self.core.stack.restack(key, e.above_sibling);

        let new_geom = Geometry::new(
            e.x as i32,
            e.y as i32,
            e.width,
            e.height,
            e.border_width,
        );
        let (old_geom, shaped) = {
            let w = self.core.stack.get(key).unwrap();
            (w.geom, w.bounding_shaped)
        };
        if old_geom != new_geom {
            let size_changed = old_geom.width != new_geom.width
                || old_geom.height != new_geom.height
                || old_geom.border_width != new_geom.border_width;
            self.core.apply_geometry(key, new_geom);
            self.core.update_win_screen(key);
            if size_changed {
                if shaped {
                    self.refresh_bounding_shape(key);
                }
                self.factor_change(key);
            }
        }
        if let Some(w) = self.core.stack.get_mut(key) {
            w.override_redirect = e.override_redirect;
        }
    }

    fn handle_circulate(&mut self, e: CirculateNotifyEvent) {
        let Some(key) = self.core.stack.find(e.window) else { return };
        let new_above = if e.place == Place::ON_TOP {
            let top = self.core.stack.top_id();
            if top == e.window {
                return;
            }
            top
        } else {
            0
        };
        self.core.stack.restack(key, new_above);
    }

    fn handle_property(&mut self, e: PropertyNotifyEvent) {
        let atoms = &self.atoms;
        if e.window == self.root {
            if e.atom == atoms.xrootpmap_id
                || e.atom == atoms.esetroot_pmap_id
                || e.atom == atoms.xsetroot_id
            {
                debug!("Root background changed");
                self.refresh_root_tile();
            } else if e.atom == atoms.net_active_window
                && self.core.config.general.use_ewmh_active_win
            {
                self.recheck_focus();
            }
            return;
        }

        if e.atom == atoms.net_wm_window_opacity {
            // Lives on the frame or the client; check both routes.
            let key = self
                .core
                .stack
                .find(e.window)
                .or_else(|| self.core.stack.find_toplevel(e.window));
            if let Some(key) = key {
                let (id, client) = {
                    let w = self.core.stack.get(key).unwrap();
                    (w.id, w.client_win)
                };
                let conn = self.conn.as_ref();
                let opacity = props::get_opacity_prop(conn, &self.atoms, id)
                    .or_else(|| props::get_opacity_prop(conn, &self.atoms, client));
                if let Some(w) = self.core.stack.get_mut(key) {
                    w.has_opacity_prop = opacity.is_some();
                    w.opacity_prop = opacity.unwrap_or(u32::MAX);
                    w.flags |= WinFlags::OPACITY_STALE;
                }
            }
            return;
        }

        if e.atom == atoms.net_frame_extents {
            if let Some(key) = self.core.stack.find_toplevel(e.window) {
                let margins =
                    props::get_frame_extents(self.conn.as_ref(), &self.atoms, e.window);
                let changed = self
                    .core
                    .stack
                    .get(key)
                    .is_some_and(|w| w.frame_extents != margins);
                if changed {
                    if let Some(w) = self.core.stack.get_mut(key) {
                        w.frame_extents = margins;
                        w.flags |= WinFlags::OPACITY_STALE;
                    }
                    self.core.add_damage_from_win(key);
                }
            }
            return;
        }

        if self.atoms.is_wintype_atom(e.atom) {
            if let Some(key) = self.core.stack.find_toplevel(e.window) {
                self.update_wintype(key);
            }
            return;
        }

        if e.atom == atoms.wm_name || e.atom == atoms.net_wm_name {
            if let Some(key) = self.toplevel_of_client(e.window) {
                let name = props::get_name(self.conn.as_ref(), &self.atoms, e.window);
                if let Some(w) = self.core.stack.get_mut(key) {
                    if w.name != name {
                        w.name = name;
                        self.factor_change(key);
                    }
                }
            }
            return;
        }

        if e.atom == atoms.wm_class {
            if let Some(key) = self.toplevel_of_client(e.window) {
                let (instance, general) =
                    props::get_class(self.conn.as_ref(), &self.atoms, e.window);
                if let Some(w) = self.core.stack.get_mut(key) {
                    w.class_instance = instance;
                    w.class_general = general;
                }
                self.factor_change(key);
            }
            return;
        }

        if e.atom == atoms.wm_window_role {
            if let Some(key) = self.toplevel_of_client(e.window) {
                let role = props::get_role(self.conn.as_ref(), &self.atoms, e.window);
                if let Some(w) = self.core.stack.get_mut(key) {
                    w.role = role;
                }
                self.factor_change(key);
            }
            return;
        }

        if e.atom == atoms.wm_client_leader {
            if let Some(key) = self.toplevel_of_client(e.window) {
                let leader = props::get_leader(self.conn.as_ref(), &self.atoms, e.window);
                let changed = self.core.stack.get(key).is_some_and(|w| w.leader != leader);
                if changed {
                    if let Some(w) = self.core.stack.get_mut(key) {
                        w.leader = leader;
                    }
                    self.core.clear_leader_caches();
                    self.core.win_update_focused(key);
                    self.factor_change(key);
                }
            }
            return;
        }

        if e.atom == atoms.wm_state {
            // A WM_STATE change can move the client window under a frame.
            if self.core.stack.find(e.window).is_none() {
                if let Some(key) = self.find_toplevel_for(e.window) {
                    let stale = self
                        .core
                        .stack
                        .get(key)
                        .is_some_and(|w| w.client_win != e.window);
                    if stale {
                        self.mark_client(key, e.window);
                    }
                }
            }
            return;
        }

        if e.atom == atoms.compton_shadow {
            if let Some(key) = self.core.stack.find(e.window) {
                let val = props::get_cardinal(self.conn.as_ref(), e.window, atoms.compton_shadow)
                    .ok()
                    .flatten();
                let changed = self.core.stack.get(key).is_some_and(|w| w.prop_shadow != val);
                if changed {
                    if let Some(w) = self.core.stack.get_mut(key) {
                        w.prop_shadow = val;
                    }
                    self.core.win_determine_shadow(key);
                }
            }
        }
    }

    fn handle_damage(&mut self, e: damage::NotifyEvent) {
        let Some(key) = self.core.stack.find(e.drawable) else { return };
        let Some(w) = self.core.stack.get(key) else { return };
        if !w.viewable() {
            return;
        }
        let Some(damage_obj) = w.damage else { return };
        let first = !w.ever_damaged;
        let (x, y, bw) = (w.geom.x, w.geom.y, w.geom.border_width as i32);
        let extents = w.extents();

        let parts = if first {
            // First damage after a map covers the entire window.
            if let Ok(cookie) = self.conn.damage_subtract(damage_obj, x11rb::NONE, x11rb::NONE) {
                self.errors.ignore(cookie.sequence_number());
            }
            extents
        } else {
            let Ok(xreg) = self.conn.generate_id() else { return };
            if self.conn.xfixes_create_region(xreg, &[]).is_err() {
                return;
            }
            if let Ok(cookie) = self.conn.damage_subtract(damage_obj, x11rb::NONE, xreg) {
                self.errors.ignore(cookie.sequence_number());
            }
            let fetched = self
                .conn
                .xfixes_fetch_region(xreg)
                .ok()
                .and_then(|c| c.reply().ok());
            let _ = self.conn.xfixes_destroy_region(xreg);
            let Some(fetched) = fetched else { return };
            let mut region = Region::from_rects(fetched.rectangles.iter().map(|r| {
                Rect::new(r.x as i32, r.y as i32, r.width as i32, r.height as i32)
            }));
            region.translate(x + bw, y + bw);
            region
        };

        if let Some(w) = self.core.stack.get_mut(key) {
            w.ever_damaged = true;
        }
        self.core.add_damage(&parts);
    }

    fn handle_shape(&mut self, e: shape::NotifyEvent) {
        if e.shape_kind != shape::SK::BOUNDING {
            return;
        }
        let Some(key) = self.core.stack.find(e.affected_window) else { return };
        self.core.add_damage_from_win(key);
        self.refresh_bounding_shape(key);
        if let Some(w) = self.core.stack.get_mut(key) {
            if w.viewable() {
                w.flags |= WinFlags::STALE_IMAGE;
            }
            w.reg_ignore_valid = false;
        }
        self.core.add_damage_from_win(key);
    }

    /// Refresh the window type and everything hanging off it.
    fn update_wintype(&mut self, key: WinKey) {
        let Some(w) = self.core.stack.get(key) else { return };
        let client = if w.client_win != 0 { w.client_win } else { w.id };
        let override_redirect = w.override_redirect;
        let old = w.wintype;

        let conn = self.conn.as_ref();
        let wintype = props::get_wintype_prop(conn, &self.atoms, client);
        let has_transient = props::has_prop(conn, client, self.atoms.wm_transient_for);
        let new = wintype.unwrap_or(if override_redirect || !has_transient {
            crate::win::WinType::Normal
        } else {
            crate::win::WinType::Dialog
        });

        if new != old {
            debug!("Window {:#010x} type changed to {:?}", client, new);
            if let Some(w) = self.core.stack.get_mut(key) {
                w.wintype = new;
                w.flags |= WinFlags::OPACITY_STALE;
            }
            self.factor_change(key);
        }
    }

    /// Map a client window id to its toplevel; accepts the toplevel id too.
    fn toplevel_of_client(&self, wid: crate::win::Xid) -> Option<WinKey> {
        self.core
            .stack
            .find_toplevel(wid)
            .or_else(|| self.core.stack.find(wid))
    }

    /// Stop listening on a window that is going away.
    fn win_ev_stop(&mut self, key: WinKey) {
        let Some(w) = self.core.stack.get(key) else { return };
        let (id, client) = (w.id, w.client_win);
        let _ = self.conn.change_window_attributes(
            id,
            &ChangeWindowAttributesAux::new().event_mask(EventMask::NO_EVENT),
        );
        if client != 0 && client != id {
            let _ = self.conn.change_window_attributes(
                client,
                &ChangeWindowAttributesAux::new().event_mask(EventMask::NO_EVENT),
            );
        }
        if self.shape_exists {
            let _ = self.conn.shape_select_input(id, false);
        }
    }
}
