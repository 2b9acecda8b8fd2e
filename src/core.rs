//! Compositor core state.
//!
//! `Core` owns everything the frame pipeline touches: the window stack, the
//! damage ring, the screen region and the effect configuration. It is kept
//! free of X traffic so the whole lifecycle -- map, fade, restack, destroy --
//! can be driven in tests; the session layer feeds it events and a backend.

use std::rc::Rc;

use tracing::warn;

use crate::backend::{Backend, Image};
use crate::config::Config;
use crate::damage::DamageRing;
use crate::kernel::ShadowContext;
use crate::region::{RcRegion, Region};
use crate::stack::{WinKey, WindowStack};
use crate::win::{FadeClock, FadeDone, Switch, WinState, Window, Xid};

/// Maximum leader-chain length we are willing to walk.
const LEADER_MAX_RECURSION: usize = 20;

pub struct Core {
    pub config: Config,
    pub stack: WindowStack,
    pub damage: DamageRing,
    pub root_width: u16,
    pub root_height: u16,
    pub screen_reg: Region,
    /// Regions shadows are never painted into.
    pub shadow_exclude_reg: Region,
    /// Per-monitor regions from Xinerama, used for shadow cropping.
    pub xinerama_regs: Vec<Region>,
    pub redirected: bool,
    pub fade_clock: FadeClock,
    pub shadow_ctx: Option<ShadowContext>,
    /// Desktop background, tiled to the root geometry.
    pub root_image: Option<Image>,
    pub active_win: Option<WinKey>,
    pub active_leader: Xid,
    /// Presented frames, for benchmark mode.
    pub paint_count: u32,
}

impl Core {
    pub fn new(config: Config, root_width: u16, root_height: u16) -> Self {
        let shadow_ctx = if config.shadow.enabled {
            Some(ShadowContext::new(config.shadow.radius))
        } else {
            None
        };
        let mut core = Self {
            config,
            stack: WindowStack::new(),
            damage: DamageRing::new(1),
            root_width,
            root_height,
            screen_reg: Region::empty(),
            shadow_exclude_reg: Region::empty(),
            xinerama_regs: Vec::new(),
            redirected: false,
            fade_clock: FadeClock::default(),
            shadow_ctx,
            root_image: None,
            active_win: None,
            active_leader: 0,
            paint_count: 0,
        };
        core.rebuild_screen_reg();
        core
    }

    pub fn rebuild_screen_reg(&mut self) {
        self.screen_reg = Region::rect(0, 0, self.root_width as i32, self.root_height as i32);
    }

    pub fn set_root_size(&mut self, width: u16, height: u16) {
        self.root_width = width;
        self.root_height = height;
        self.rebuild_screen_reg();
    }

    /// Union damage into the current ring slot. Ignored while unredirected;
    /// redirection restart forces a full repaint anyway.
    pub fn add_damage(&mut self, damage: &Region) {
        if !self.redirected {
            return;
        }
        let clipped = damage.intersect(&self.screen_reg);
        if !clipped.is_empty() {
            self.damage.add(&clipped);
        }
    }

    pub fn add_damage_from_win(&mut self, key: WinKey) {
        let Some(w) = self.stack.get(key) else { return };
        let ext = w.extents();
        self.add_damage(&ext);
    }

    pub fn force_repaint(&mut self) {
        let screen = self.screen_reg.clone();
        self.add_damage(&screen);
    }

    /// Whether the window is the one the server says is focused, and
    /// viewable.
    pub fn is_focused_real(&self, key: WinKey, w: &Window) -> bool {
        self.active_win == Some(key) && w.viewable()
    }

    // === Focus and leaders ===

    /// Leader of a window, walking WM_CLIENT_LEADER / transient chains with
    /// a recursion cap. Updates `cache_leader`.
    pub fn win_get_leader(&mut self, key: WinKey) -> Xid {
        self.win_get_leader_raw(key, 0)
    }

    fn win_get_leader_raw(&mut self, key: WinKey, recursion: usize) -> Xid {
        let Some(w) = self.stack.get(key) else { return 0 };
        if w.cache_leader != 0 {
            return w.cache_leader;
        }
        let base = if w.leader != 0 { w.leader } else { w.client_win };
        let client_win = w.client_win;
        let mut leader = base;
        if base != 0 && base != client_win {
            if let Some(pk) = self.stack.find_toplevel(base) {
                if pk != key {
                    if recursion >= LEADER_MAX_RECURSION {
                        return 0;
                    }
                    leader = self.win_get_leader_raw(pk, recursion + 1);
                }
            }
        }
        if let Some(w) = self.stack.get_mut(key) {
            w.cache_leader = leader;
        }
        leader
    }

    pub fn clear_leader_caches(&mut self) {
        for key in self.stack.order_snapshot() {
            if let Some(w) = self.stack.get_mut(key) {
                w.cache_leader = 0;
            }
        }
    }

    fn group_update_focused(&mut self, leader: Xid) {
        if leader == 0 {
            return;
        }
        for key in self.stack.order_snapshot() {
            let is_member = self
                .stack
                .get(key)
                .map(|w| w.state != WinState::Destroying)
                .unwrap_or(false)
                && self.win_get_leader(key) == leader;
            if is_member {
                self.win_update_focused(key);
            }
        }
    }

    /// Point focus at a new window (or nothing), updating groups.
    pub fn set_active_win(&mut self, key: Option<WinKey>) {
        if self.active_win == key {
            return;
        }
        let old = self.active_win;
        self.active_win = key;

        if self.config.general.detect_client_leader {
            let new_leader = key.map_or(0, |k| self.win_get_leader(k));
            if self.active_leader != new_leader {
                let old_leader = self.active_leader;
                self.active_leader = new_leader;
                self.group_update_focused(old_leader);
                self.group_update_focused(new_leader);
            }
        }
        if let Some(k) = old {
            self.win_update_focused(k);
        }
        if let Some(k) = key {
            self.win_update_focused(k);
        }
    }

    /// Recompute the focused flag and, through it, the opacity target.
    pub fn win_update_focused(&mut self, key: WinKey) {
        let Some(w) = self.stack.get(key) else { return };
        let focused_real = self.is_focused_real(key, w);
        let leader_focused = self.config.general.detect_client_leader
            && self.active_leader != 0
            && self.win_get_leader(key) == self.active_leader;

        let Some(w) = self.stack.get_mut(key) else { return };
        w.focused = match w.focused_force {
            Switch::On => true,
            Switch::Off => false,
            Switch::Unset => {
                focused_real
                    || self.config.wintype(w.wintype).focus
                    || (self.config.general.mark_wmwin_focused && w.wmwin)
                    || (self.config.general.mark_ovredir_focused
                        && w.id == w.client_win
                        && !w.wmwin)
                    || leader_focused
            }
        };
        self.refresh_opacity_target(key);
    }

    /// Recompute the opacity target; a target change on a settled window
    /// starts a fade.
    pub fn refresh_opacity_target(&mut self, key: WinKey) {
        let active = self.active_win;
        let Self { stack, config, .. } = self;
        let Some(w) = stack.get_mut(key) else { return };
        let focused_real = active == Some(key) && w.viewable();
        let tgt = w.calc_opacity_target(config, focused_real);
        if w.opacity_tgt != tgt {
            w.opacity_tgt = tgt;
            if w.state == WinState::Mapped {
                w.state = WinState::Fading;
            }
        }
    }

    // === Effect rule caches ===

    /// Re-evaluate everything that depends on window identity: rule caches,
    /// effect flags, focus. Called when a matching-relevant property
    /// changes. Returns an opacity-rule change for the caller to mirror
    /// into the window's property.
    pub fn win_on_factor_change(&mut self, key: WinKey) -> Option<Option<f64>> {
        self.win_determine_shadow(key);
        self.win_determine_invert_color(key);
        self.win_determine_blur_background(key);
        let rule_change = self.win_update_opacity_rule(key);
        let Self { stack, config, .. } = self;
        if let Some(w) = stack.get_mut(key) {
            let viewable = w.viewable();
            w.paint_excluded = viewable && config.opacity.paint_exclude.matches(w);
            w.unredir_excluded = viewable && config.unredir.exclude.matches(w);
            w.reg_ignore_valid = false;
        }
        self.win_update_focused(key);
        rule_change
    }

    pub fn win_determine_shadow(&mut self, key: WinKey) {
        let Self { stack, config, .. } = self;
        let Some(w) = stack.get_mut(key) else { return };
        let shadow_new = match w.shadow_force {
            Switch::On => true,
            Switch::Off => false,
            Switch::Unset => {
                config.shadow.enabled
                    && config.wintype(w.wintype).shadow
                    && !config.shadow.exclude.matches(w)
                    && w.prop_shadow != Some(0)
            }
        };
        if shadow_new != w.shadow {
            w.shadow = shadow_new;
            self.add_damage_from_win(key);
        }
    }

    pub fn win_determine_invert_color(&mut self, key: WinKey) {
        let Self { stack, config, .. } = self;
        let Some(w) = stack.get_mut(key) else { return };
        let val = match w.invert_color_force {
            Switch::On => true,
            Switch::Off => false,
            Switch::Unset => config.invert.include.matches(w),
        };
        if val != w.invert_color {
            w.invert_color = val;
            self.add_damage_from_win(key);
        }
    }

    pub fn win_determine_blur_background(&mut self, key: WinKey) {
        let Self { stack, config, .. } = self;
        let Some(w) = stack.get_mut(key) else { return };
        let val = config.blur.background && !config.blur.exclude.matches(w);
        if val != w.blur_background {
            w.blur_background = val;
            self.add_damage_from_win(key);
        }
    }

    /// Returns the new rule value when it changed, so the caller can mirror
    /// it into the opacity property.
    pub fn win_update_opacity_rule(&mut self, key: WinKey) -> Option<Option<f64>> {
        let Self { stack, config, .. } = self;
        let w = stack.get_mut(key)?;
        let val = config.opacity.rules.match_value(w);
        if val != w.opacity_rule {
            w.opacity_rule = val;
            Some(val)
        } else {
            None
        }
    }

    // === Lifecycle ===

    /// Register a freshly created window, immediately above `prev` (zero
    /// for the bottom of the stack).
    pub fn add_win(&mut self, mut w: Window, prev: Xid) -> Option<WinKey> {
        w.update_shadow_geometry(
            self.config.shadow.offset_x,
            self.config.shadow.offset_y,
            self.config.shadow.radius,
        );
        self.stack.insert(w, prev)
    }

    /// Map transition; the session has already refreshed window properties.
    pub fn map_win(&mut self, key: WinKey, backend: &mut dyn Backend) {
        let Some(w) = self.stack.get_mut(key) else { return };
        if w.input_only {
            return;
        }
        if w.state == WinState::Destroying {
            warn!("Mapping a window in DESTROYING state {:#010x}", w.id);
            return;
        }
        if !matches!(w.state, WinState::Unmapped | WinState::Unmapping) {
            warn!("Mapping an already mapped window {:#010x}", w.id);
            return;
        }
        if w.state == WinState::Unmapping {
            w.skip_fading();
            self.finish_fade(key, backend);
            self.add_damage_from_win(key);
        }

        let Some(w) = self.stack.get_mut(key) else { return };
        w.state = WinState::Mapping;
        w.in_openclose = true;
        w.ever_damaged = false;
        w.flags |= crate::win::WinFlags::OPACITY_STALE;
        if self.redirected {
            w.flags |= crate::win::WinFlags::STALE_IMAGE;
        }
        w.flags.remove(crate::win::WinFlags::IMAGE_ERROR);

        self.win_update_focused(key);
        self.refresh_opacity_target(key);
        if !self.redirected {
            if let Some(w) = self.stack.get_mut(key) {
                w.skip_fading();
            }
            self.finish_fade(key, backend);
        }
    }

    /// Unmap or destroy transition. With `destroy`, the id index entry is
    /// dropped immediately while the window keeps fading in the stack.
    pub fn unmap_win(&mut self, key: WinKey, destroy: bool, backend: &mut dyn Backend) {
        let Some(w) = self.stack.get_mut(key) else { return };
        let target = if destroy { WinState::Destroying } else { WinState::Unmapping };

        if !destroy && w.input_only {
            return;
        }
        if w.state == WinState::Destroying && !destroy {
            warn!("Unmapping a window in DESTROYING state {:#010x}", w.id);
            return;
        }
        if w.state == target {
            warn!(
                "{} window {:#010x} twice",
                if destroy { "Destroying" } else { "Unmapping" },
                w.id
            );
            return;
        }

        if destroy {
            self.stack.detach_index(key);
        }

        let Some(w) = self.stack.get_mut(key) else { return };
        if w.state == WinState::Unmapped || w.input_only {
            if destroy {
                self.finish_destroy(key, backend);
            }
            return;
        }

        w.state = target;
        w.in_openclose = destroy;
        w.flags |= crate::win::WinFlags::OPACITY_STALE;
        self.refresh_opacity_target(key);
        if self.active_win == Some(key) {
            self.set_active_win(None);
        }

        if !self.redirected {
            if let Some(w) = self.stack.get_mut(key) {
                w.skip_fading();
            }
            self.finish_fade(key, backend);
        }
    }

    /// Apply whatever a completed fade means. Returns the transition that
    /// fired; on `Destroyed` the key is dead.
    pub fn finish_fade(&mut self, key: WinKey, backend: &mut dyn Backend) -> FadeDone {
        let Some(w) = self.stack.get(key) else { return FadeDone::None };
        let done = w.fade_done();
        match done {
            FadeDone::None => {}
            FadeDone::Mapped => {
                let w = self.stack.get_mut(key).unwrap();
                w.in_openclose = false;
                w.state = WinState::Mapped;
            }
            FadeDone::Unmapped => self.finish_unmap(key, backend),
            FadeDone::Destroyed => self.finish_destroy(key, backend),
        }
        done
    }

    fn finish_unmap(&mut self, key: WinKey, backend: &mut dyn Backend) {
        let Some(w) = self.stack.get_mut(key) else { return };
        w.ever_damaged = false;
        w.reg_ignore_valid = false;
        w.state = WinState::Unmapped;
        w.flags = crate::win::WinFlags::empty();
        w.in_openclose = false;
        let ext = w.extents();
        Self::release_win_images(w, backend);
        self.add_damage(&ext);
    }

    fn finish_destroy(&mut self, key: WinKey, backend: &mut dyn Backend) {
        if let Some(w) = self.stack.get(key) {
            if w.state != WinState::Unmapped {
                self.finish_unmap(key, backend);
            }
        }
        if self.active_win == Some(key) {
            self.active_win = None;
        }
        if let Some(mut w) = self.stack.remove(key) {
            Self::release_win_images(&mut w, backend);
        }
    }

    pub fn release_win_images(w: &mut Window, backend: &mut dyn Backend) {
        if let Some(img) = w.image.take() {
            backend.release_image(img);
        }
        if let Some(img) = w.shadow_image.take() {
            backend.release_image(img);
        }
    }

    /// Apply new geometry, reporting damage and staleness as needed.
    pub fn apply_geometry(&mut self, key: WinKey, geom: crate::win::Geometry) {
        let Self { stack, config, .. } = self;
        let Some(w) = stack.get_mut(key) else { return };
        if w.geom == geom {
            return;
        }
        let old_extents = w.extents();
        let size_changed = w.geom.width != geom.width
            || w.geom.height != geom.height
            || w.geom.border_width != geom.border_width;
        w.geom = geom;
        if size_changed {
            w.update_shadow_geometry(
                config.shadow.offset_x,
                config.shadow.offset_y,
                config.shadow.radius,
            );
            if !w.bounding_shaped {
                w.reset_bounding_shape();
            }
            if w.viewable() {
                // The image refresh also drops the now misshapen shadow.
                w.flags |= crate::win::WinFlags::STALE_IMAGE;
            }
        }
        let damage = old_extents.union(&w.extents());
        w.reg_ignore_valid = false;
        self.add_damage(&damage);
    }

    /// Re-resolve which Xinerama screen a window sits on.
    pub fn update_win_screen(&mut self, key: WinKey) {
        let Self { stack, xinerama_regs, .. } = self;
        let Some(w) = stack.get_mut(key) else { return };
        let rect = w.body_rect();
        w.xinerama_scr = xinerama_regs.iter().position(|r| {
            let e = r.extents();
            e.x1 <= rect.x1 && e.y1 <= rect.y1 && e.x2 >= rect.x2 && e.y2 >= rect.y2
        });
    }

    /// Shared empty region for reg_ignore chains.
    pub fn empty_rc() -> RcRegion {
        Rc::new(Region::empty())
    }
}
