//! Per-window state: geometry, lifecycle, opacity, effects.
//!
//! Everything here is pure bookkeeping; X traffic happens in `props`,
//! `events` and `session`. The lifecycle is a proper state machine -- every
//! transition in `WinState` is driven by map/unmap/destroy events plus fade
//! completion, and `Core` is the only caller that advances it.

use bitflags::bitflags;

use crate::backend::Image;
use crate::config::Config;
use crate::region::{RcRegion, Rect, Region};

pub type Xid = u32;

/// Window geometry as reported by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u16,
    pub height: u16,
    pub border_width: u16,
}

impl Geometry {
    pub fn new(x: i32, y: i32, width: u16, height: u16, border_width: u16) -> Self {
        Self { x, y, width, height, border_width }
    }
}

/// Frame extents from `_NET_FRAME_EXTENTS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Margins {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl Margins {
    pub fn is_zero(&self) -> bool {
        self.top == 0 && self.right == 0 && self.bottom == 0 && self.left == 0
    }
}

/// Window lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinState {
    Unmapped,
    Mapping,
    Mapped,
    Fading,
    Unmapping,
    Destroying,
}

/// What a finished fade means for the window, decided by its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeDone {
    /// Nothing to finish.
    None,
    /// MAPPING or FADING reached target: now plain MAPPED.
    Mapped,
    /// UNMAPPING reached zero: release images, back to UNMAPPED.
    Unmapped,
    /// DESTROYING reached zero: free the window.
    Destroyed,
}

/// Paint mode, recomputed each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinMode {
    Solid,
    FrameTrans,
    Trans,
}

/// The fifteen EWMH window types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WinType {
    Unknown,
    Desktop,
    Dock,
    Toolbar,
    Menu,
    Utility,
    Splash,
    Dialog,
    Normal,
    DropdownMenu,
    PopupMenu,
    Tooltip,
    Notification,
    Combo,
    Dnd,
}

impl WinType {
    pub const ALL: [WinType; 15] = [
        WinType::Unknown,
        WinType::Desktop,
        WinType::Dock,
        WinType::Toolbar,
        WinType::Menu,
        WinType::Utility,
        WinType::Splash,
        WinType::Dialog,
        WinType::Normal,
        WinType::DropdownMenu,
        WinType::PopupMenu,
        WinType::Tooltip,
        WinType::Notification,
        WinType::Combo,
        WinType::Dnd,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            WinType::Unknown => "unknown",
            WinType::Desktop => "desktop",
            WinType::Dock => "dock",
            WinType::Toolbar => "toolbar",
            WinType::Menu => "menu",
            WinType::Utility => "utility",
            WinType::Splash => "splash",
            WinType::Dialog => "dialog",
            WinType::Normal => "normal",
            WinType::DropdownMenu => "dropdown_menu",
            WinType::PopupMenu => "popup_menu",
            WinType::Tooltip => "tooltip",
            WinType::Notification => "notification",
            WinType::Combo => "combo",
            WinType::Dnd => "dnd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        WinType::ALL.iter().copied().find(|t| t.name() == name)
    }

    /// The atom name suffix under `_NET_WM_WINDOW_TYPE_`.
    pub fn atom_suffix(&self) -> &'static str {
        match self {
            WinType::Unknown => "",
            WinType::Desktop => "DESKTOP",
            WinType::Dock => "DOCK",
            WinType::Toolbar => "TOOLBAR",
            WinType::Menu => "MENU",
            WinType::Utility => "UTILITY",
            WinType::Splash => "SPLASH",
            WinType::Dialog => "DIALOG",
            WinType::Normal => "NORMAL",
            WinType::DropdownMenu => "DROPDOWN_MENU",
            WinType::PopupMenu => "POPUP_MENU",
            WinType::Tooltip => "TOOLTIP",
            WinType::Notification => "NOTIFICATION",
            WinType::Combo => "COMBO",
            WinType::Dnd => "DND",
        }
    }
}

/// Tri-state override knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Switch {
    #[default]
    Unset,
    On,
    Off,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WinFlags: u32 {
        /// The bound pixmap no longer matches the window content and must be
        /// renamed and rebound before the next paint.
        const STALE_IMAGE = 1 << 0;
        /// Binding failed; the window is skipped until the next map.
        const IMAGE_ERROR = 1 << 1;
        /// Opacity target must be recomputed before the next fade step.
        const OPACITY_STALE = 1 << 2;
    }
}

#[derive(Debug)]
pub struct Window {
    pub id: Xid,
    /// The inner window carrying WM_STATE; equals `id` for unreparented
    /// windows.
    pub client_win: Xid,
    pub geom: Geometry,
    pub state: WinState,
    pub input_only: bool,
    pub override_redirect: bool,
    pub wintype: WinType,
    /// True if the WM reparented a client under this window.
    pub wmwin: bool,

    pub opacity: f64,
    pub opacity_tgt: f64,
    pub has_opacity_prop: bool,
    pub opacity_prop: u32,
    /// Opacity forced by a rule; mirrored back into the property.
    pub opacity_rule: Option<f64>,
    pub frame_opacity: f64,
    pub frame_extents: Margins,

    pub focused: bool,
    pub focused_force: Switch,
    pub shadow: bool,
    pub shadow_force: Switch,
    /// Value of the shadow override property, if present.
    pub prop_shadow: Option<u32>,
    pub fade_force: Switch,
    pub invert_color: bool,
    pub invert_color_force: Switch,
    pub blur_background: bool,
    pub dim: bool,
    pub in_openclose: bool,

    pub mode: WinMode,
    pub has_alpha: bool,
    pub depth: u8,
    pub visual: u32,

    pub ever_damaged: bool,
    pub to_paint: bool,
    /// Whether the previous frame treated this window as painted-and-solid;
    /// flipping it invalidates every ignore region below.
    pub was_painted_solid: bool,
    pub flags: WinFlags,
    pub paint_excluded: bool,
    pub unredir_excluded: bool,

    /// Bounding shape in window-local coordinates, border included.
    pub bounding_shape: Region,
    pub bounding_shaped: bool,
    /// Union of opaque regions of every window strictly above this one.
    pub reg_ignore: Option<RcRegion>,
    pub reg_ignore_valid: bool,

    pub leader: Xid,
    pub cache_leader: Xid,
    pub name: String,
    pub class_instance: String,
    pub class_general: String,
    pub role: String,

    /// X damage object tracking this window.
    pub damage: Option<u32>,
    pub image: Option<Image>,
    pub shadow_image: Option<Image>,
    pub shadow_dx: i32,
    pub shadow_dy: i32,
    pub shadow_width: i32,
    pub shadow_height: i32,
    pub shadow_opacity: f64,
    /// Index into the Xinerama screen regions, when known.
    pub xinerama_scr: Option<usize>,
}

impl Window {
    pub fn new(id: Xid, geom: Geometry) -> Self {
        let mut w = Self {
            id,
            client_win: 0,
            geom,
            state: WinState::Unmapped,
            input_only: false,
            override_redirect: false,
            wintype: WinType::Unknown,
            wmwin: false,
            opacity: 0.0,
            opacity_tgt: 0.0,
            has_opacity_prop: false,
            opacity_prop: u32::MAX,
            opacity_rule: None,
            frame_opacity: 1.0,
            frame_extents: Margins::default(),
            focused: false,
            focused_force: Switch::Unset,
            shadow: false,
            shadow_force: Switch::Unset,
            prop_shadow: None,
            fade_force: Switch::Unset,
            invert_color: false,
            invert_color_force: Switch::Unset,
            blur_background: false,
            dim: false,
            in_openclose: true,
            mode: WinMode::Trans,
            has_alpha: false,
            depth: 24,
            visual: 0,
            ever_damaged: false,
            to_paint: false,
            was_painted_solid: false,
            flags: WinFlags::empty(),
            paint_excluded: false,
            unredir_excluded: false,
            bounding_shape: Region::empty(),
            bounding_shaped: false,
            reg_ignore: None,
            reg_ignore_valid: false,
            leader: 0,
            cache_leader: 0,
            name: String::new(),
            class_instance: String::new(),
            class_general: String::new(),
            role: String::new(),
            damage: None,
            image: None,
            shadow_image: None,
            shadow_dx: 0,
            shadow_dy: 0,
            shadow_width: 0,
            shadow_height: 0,
            shadow_opacity: 0.0,
            xinerama_scr: None,
        };
        w.reset_bounding_shape();
        w
    }

    /// Width and height with the X border included.
    pub fn widthb(&self) -> i32 {
        self.geom.width as i32 + self.geom.border_width as i32 * 2
    }

    pub fn heightb(&self) -> i32 {
        self.geom.height as i32 + self.geom.border_width as i32 * 2
    }

    pub fn viewable(&self) -> bool {
        matches!(self.state, WinState::Mapping | WinState::Mapped | WinState::Fading)
    }

    /// Recompute shadow geometry from config after a size or config change.
    pub fn update_shadow_geometry(&mut self, offset_x: i32, offset_y: i32, radius: f64) {
        self.shadow_dx = offset_x;
        self.shadow_dy = offset_y;
        self.shadow_width = self.widthb() + (radius * 2.0) as i32;
        self.shadow_height = self.heightb() + (radius * 2.0) as i32;
    }

    /// The default, unshaped bounding region.
    pub fn reset_bounding_shape(&mut self) {
        self.bounding_shape = Region::rect(0, 0, self.widthb(), self.heightb());
        self.bounding_shaped = false;
    }

    /// Bounding shape in root coordinates.
    pub fn bounding_shape_global(&self) -> Region {
        self.bounding_shape.translated(self.geom.x, self.geom.y)
    }

    /// Rectangular extent of the window body, border included.
    pub fn body_rect(&self) -> Rect {
        Rect::new(self.geom.x, self.geom.y, self.widthb(), self.heightb())
    }

    fn shadow_rect(&self) -> Rect {
        Rect::new(
            self.geom.x + self.shadow_dx,
            self.geom.y + self.shadow_dy,
            self.shadow_width,
            self.shadow_height,
        )
    }

    /// Everything the window occupies on screen, shadow included.
    pub fn extents(&self) -> Region {
        let mut r = Region::from_rect(self.body_rect());
        if self.shadow {
            r.union_with(&Region::from_rect(self.shadow_rect()));
        }
        r
    }

    pub fn has_frame(&self) -> bool {
        !self.frame_extents.is_zero()
    }

    /// The frame band in window-local coordinates. Extents are clamped to
    /// the window size, so a WM reporting top + bottom > height still
    /// produces a valid (fully-frame) region.
    pub fn frame_region_local(&self) -> Region {
        let w = self.widthb();
        let h = self.heightb();
        let top = self.frame_extents.top.clamp(0, h);
        let bottom = self.frame_extents.bottom.clamp(0, h - top);
        let left = self.frame_extents.left.clamp(0, w);
        let right = self.frame_extents.right.clamp(0, w - left);

        let center = Rect::new(left, top, w - left - right, h - top - bottom);
        Region::rect(0, 0, w, h).subtract(&Region::from_rect(center))
    }

    pub fn is_fullscreen(&self, root_width: u16, root_height: u16) -> bool {
        self.geom.x <= 0
            && self.geom.y <= 0
            && self.geom.x + self.widthb() >= root_width as i32
            && self.geom.y + self.heightb() >= root_height as i32
            && !self.bounding_shaped
    }

    pub fn calc_mode(&self) -> WinMode {
        if self.has_alpha || self.opacity < 1.0 {
            return WinMode::Trans;
        }
        if self.frame_opacity != 1.0 {
            return WinMode::FrameTrans;
        }
        WinMode::Solid
    }

    pub fn is_solid(&self) -> bool {
        self.mode == WinMode::Solid
    }

    /// Target opacity, first match wins:
    /// inactive override, opacity property / rule, wintype default, focused,
    /// unfocused, fully opaque. Windows on the way out always target zero.
    pub fn calc_opacity_target(&self, config: &Config, focused_real: bool) -> f64 {
        match self.state {
            WinState::Unmapped | WinState::Unmapping | WinState::Destroying => return 0.0,
            _ => {}
        }

        if config.opacity.inactive_override && !self.focused {
            return config.opacity.inactive;
        }
        if let Some(v) = self.opacity_rule {
            return v;
        }
        if self.has_opacity_prop {
            return self.opacity_prop as f64 / u32::MAX as f64;
        }
        if let Some(v) = config.wintype(self.wintype).opacity {
            return v;
        }
        if focused_real {
            return config.opacity.active;
        }
        if !self.focused {
            return config.opacity.inactive;
        }
        1.0
    }

    pub fn should_dim(&self, config: &Config) -> bool {
        if self.state == WinState::Unmapped {
            return false;
        }
        config.opacity.inactive_dim > 0.0 && !self.focused
    }

    pub fn should_fade(&self, config: &Config) -> bool {
        match self.fade_force {
            Switch::On => return true,
            Switch::Off => return false,
            Switch::Unset => {}
        }
        if config.fading.no_fading_openclose && self.in_openclose {
            return false;
        }
        if config.fading.exclude.matches(self) {
            return false;
        }
        config.wintype(self.wintype).fade
    }

    /// Advance opacity toward the target by `steps` fade steps, clamped so
    /// the target is never overshot. Non-fading windows snap.
    pub fn run_fade(&mut self, config: &Config, steps: u32) {
        if self.opacity == self.opacity_tgt {
            return;
        }
        if !self.should_fade(config) {
            self.opacity = self.opacity_tgt;
        } else if steps > 0 {
            if self.opacity < self.opacity_tgt {
                self.opacity = (self.opacity + config.fading.fade_in_step * steps as f64)
                    .clamp(0.0, self.opacity_tgt);
            } else {
                self.opacity = (self.opacity - config.fading.fade_out_step * steps as f64)
                    .clamp(self.opacity_tgt, 1.0);
            }
        }
    }

    /// Snap straight to the target opacity.
    pub fn skip_fading(&mut self) {
        self.opacity = self.opacity_tgt;
    }

    /// What reaching the target opacity means in the current state.
    pub fn fade_done(&self) -> FadeDone {
        if self.opacity != self.opacity_tgt {
            return FadeDone::None;
        }
        match self.state {
            WinState::Mapping | WinState::Fading => FadeDone::Mapped,
            WinState::Unmapping => FadeDone::Unmapped,
            WinState::Destroying => FadeDone::Destroyed,
            WinState::Mapped | WinState::Unmapped => FadeDone::None,
        }
    }

    /// Whether the stored image can still be painted. Windows fading out
    /// keep painting their last image; UNMAPPED windows never have one.
    pub fn has_valid_image(&self) -> bool {
        self.image.is_some() && !self.flags.contains(WinFlags::IMAGE_ERROR)
    }
}

/// Global fade clock: converts wall-clock ticks into whole fade steps,
/// carrying the remainder forward.
#[derive(Debug, Default)]
pub struct FadeClock {
    last_ms: Option<u64>,
}

impl FadeClock {
    pub fn steps(&mut self, now_ms: u64, delta_ms: u64) -> u32 {
        let delta = delta_ms.max(1);
        match self.last_ms {
            None => {
                self.last_ms = Some(now_ms);
                0
            }
            Some(last) if now_ms < last => {
                // Clock went backwards; restart.
                self.last_ms = Some(now_ms);
                0
            }
            Some(last) => {
                let steps = (now_ms - last) / delta;
                self.last_ms = Some(last + steps * delta);
                steps as u32
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut c = Config::default();
        c.fading.fade_in_step = 0.1;
        c.fading.fade_out_step = 0.1;
        c.fading.fade_delta_ms = 10;
        c
    }

    fn mapped_win() -> Window {
        let mut w = Window::new(0x10, Geometry::new(0, 0, 100, 100, 0));
        w.state = WinState::Mapped;
        w.opacity = 1.0;
        w.opacity_tgt = 1.0;
        w
    }

    #[test]
    fn opacity_target_priority_order() {
        let mut c = test_config();
        c.opacity.active = 0.9;
        c.opacity.inactive = 0.6;
        let mut w = mapped_win();

        // Unfocused without any override: inactive opacity.
        assert_eq!(w.calc_opacity_target(&c, false), 0.6);

        // Focused-for-real: active opacity.
        assert_eq!(w.calc_opacity_target(&c, true), 0.9);

        // Wintype default beats focus.
        w.wintype = WinType::Tooltip;
        c.wintypes
            .insert("tooltip".into(), crate::config::WintypeConfig {
                opacity: Some(0.5),
                ..Default::default()
            });
        assert_eq!(w.calc_opacity_target(&c, true), 0.5);

        // Property beats wintype.
        w.has_opacity_prop = true;
        w.opacity_prop = u32::MAX / 2;
        let v = w.calc_opacity_target(&c, true);
        assert!((v - 0.5).abs() < 1e-6);
        w.opacity_prop = u32::MAX;
        assert_eq!(w.calc_opacity_target(&c, true), 1.0);

        // Rule beats property.
        w.opacity_rule = Some(0.85);
        assert_eq!(w.calc_opacity_target(&c, true), 0.85);

        // Inactive override beats everything when unfocused.
        c.opacity.inactive_override = true;
        w.focused = false;
        assert_eq!(w.calc_opacity_target(&c, false), 0.6);

        // A focused flag without real focus falls through to opaque.
        let mut w2 = mapped_win();
        w2.focused = true;
        let mut c2 = test_config();
        c2.opacity.inactive = 0.6;
        assert_eq!(w2.calc_opacity_target(&c2, false), 1.0);
    }

    #[test]
    fn outgoing_windows_target_zero() {
        let c = test_config();
        let mut w = mapped_win();
        w.state = WinState::Unmapping;
        assert_eq!(w.calc_opacity_target(&c, true), 0.0);
        w.state = WinState::Destroying;
        assert_eq!(w.calc_opacity_target(&c, true), 0.0);
        w.state = WinState::Unmapped;
        assert_eq!(w.calc_opacity_target(&c, false), 0.0);
    }

    #[test]
    fn mode_from_alpha_opacity_and_frame() {
        let mut w = mapped_win();
        assert_eq!(w.calc_mode(), WinMode::Solid);
        w.frame_opacity = 0.8;
        assert_eq!(w.calc_mode(), WinMode::FrameTrans);
        w.opacity = 0.9;
        assert_eq!(w.calc_mode(), WinMode::Trans);
        w.opacity = 1.0;
        w.frame_opacity = 1.0;
        w.has_alpha = true;
        assert_eq!(w.calc_mode(), WinMode::Trans);
    }

    #[test]
    fn fade_never_overshoots_the_target() {
        let c = test_config();
        let mut w = mapped_win();
        w.state = WinState::Mapping;
        w.opacity = 0.0;
        w.opacity_tgt = 1.0;

        let before = w.opacity;
        w.run_fade(&c, 3);
        assert!((w.opacity - 0.3).abs() < 1e-9);
        assert!(w.opacity - before <= 0.1 * 3.0 + 1e-9);

        w.opacity = 0.95;
        w.run_fade(&c, 4);
        assert_eq!(w.opacity, 1.0);

        // Fading out clamps at the target from above.
        w.opacity_tgt = 0.5;
        w.state = WinState::Fading;
        w.run_fade(&c, 100);
        assert_eq!(w.opacity, 0.5);
    }

    #[test]
    fn fade_excluded_windows_snap() {
        let mut c = test_config();
        c.fading.exclude = crate::rules::RuleList::new(vec!["class=NoFade".into()]);
        let mut w = mapped_win();
        w.class_general = "NoFade".into();
        w.state = WinState::Mapping;
        w.opacity = 0.0;
        w.opacity_tgt = 1.0;
        w.run_fade(&c, 0);
        assert_eq!(w.opacity, 1.0);
    }

    #[test]
    fn fade_clock_floors_and_carries_remainder() {
        let mut clock = FadeClock::default();
        assert_eq!(clock.steps(5, 10), 0); // first tick only arms the clock
        assert_eq!(clock.steps(15, 10), 1);
        assert_eq!(clock.steps(19, 10), 0); // 4ms leftover carried
        assert_eq!(clock.steps(95, 10), 8);
        assert_eq!(clock.steps(3, 10), 0); // time disorder restarts
    }

    #[test]
    fn fade_done_follows_state() {
        let mut w = mapped_win();
        w.state = WinState::Mapping;
        w.opacity = 0.4;
        w.opacity_tgt = 1.0;
        assert_eq!(w.fade_done(), FadeDone::None);
        w.opacity = 1.0;
        assert_eq!(w.fade_done(), FadeDone::Mapped);
        w.state = WinState::Unmapping;
        w.opacity = 0.0;
        w.opacity_tgt = 0.0;
        assert_eq!(w.fade_done(), FadeDone::Unmapped);
        w.state = WinState::Destroying;
        assert_eq!(w.fade_done(), FadeDone::Destroyed);
    }

    #[test]
    fn frame_region_survives_broken_extents() {
        let mut w = mapped_win();
        w.frame_extents = Margins { top: 80, bottom: 40, left: 2, right: 2 };
        // top + bottom exceeds the height; the whole window becomes frame.
        let mut short = w;
        short.geom.height = 100;
        let frame = short.frame_region_local();
        assert_eq!(frame.area(), 100 * 100);

        let mut sane = mapped_win();
        sane.frame_extents = Margins { top: 20, bottom: 10, left: 2, right: 2 };
        let frame = sane.frame_region_local();
        // window minus the 96x70 center
        assert_eq!(frame.area(), 100 * 100 - 96 * 70);
        assert!(frame.contains(0, 0));
        assert!(!frame.contains(50, 50));
    }

    #[test]
    fn fullscreen_requires_unshaped_coverage() {
        let mut w = Window::new(1, Geometry::new(0, 0, 1920, 1080, 0));
        assert!(w.is_fullscreen(1920, 1080));
        w.bounding_shaped = true;
        assert!(!w.is_fullscreen(1920, 1080));
        let w = Window::new(1, Geometry::new(10, 0, 1920, 1080, 0));
        assert!(!w.is_fullscreen(1920, 1080));
    }

    #[test]
    fn extents_include_shadow() {
        let mut w = mapped_win();
        w.update_shadow_geometry(-15, -15, 12.0);
        assert!(!w.shadow);
        assert_eq!(w.extents().area(), 100 * 100);
        w.shadow = true;
        let ext = w.extents();
        assert!(ext.contains(-10, -10));
        assert!(ext.contains(99, 99));
    }
}
