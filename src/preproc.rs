//! The per-frame preprocess pass.
//!
//! One top-to-bottom stack traversal that advances fades, finishes lifecycle
//! transitions, culls invisible windows, recomputes paint modes, rebuilds the
//! shared ignore-region chain and produces the frame's paint list together
//! with the unredirection verdict.

use std::rc::Rc;

use crate::backend::Backend;
use crate::core::Core;
use crate::region::RcRegion;
use crate::stack::WinKey;
use crate::win::{FadeDone, WinFlags, Window};

/// What a preprocess run decided for the frame.
#[derive(Debug, Default)]
pub struct FrameDecision {
    /// Windows to draw, bottom of stack first.
    pub paint: Vec<WinKey>,
    /// Some window has not reached its target opacity yet.
    pub fade_running: bool,
    /// The topmost painted window makes redirection pointless.
    pub unredir_possible: bool,
}

/// Visibility cull. Input-Only windows take part in stacking but are never
/// painted; windows that never produced damage, sit entirely off screen, are
/// effectively invisible, were excluded by rule, or lost their image do not
/// paint either.
fn should_paint(w: &Window, root_width: u16, root_height: u16) -> bool {
    if w.input_only || !w.ever_damaged {
        return false;
    }
    if w.geom.x + w.widthb() < 1
        || w.geom.y + w.heightb() < 1
        || w.geom.x >= root_width as i32
        || w.geom.y >= root_height as i32
    {
        return false;
    }
    if !w.viewable() && w.image.is_none() {
        return false;
    }
    if w.opacity * 255.0 < 1.0 {
        return false;
    }
    if w.paint_excluded || w.flags.contains(WinFlags::IMAGE_ERROR) {
        return false;
    }
    true
}

impl Core {
    /// Run the preprocess pass at time `now_ms`.
    ///
    /// `rebind` refreshes the backend resources of one window: bind a fresh
    /// pixmap for the current window contents and drop any stale shadow
    /// image. It reports failure so the window can be put into image-error
    /// quarantine.
    pub fn paint_preprocess(
        &mut self,
        now_ms: u64,
        backend: &mut dyn Backend,
        rebind: &mut dyn FnMut(&mut Window, &mut dyn Backend) -> bool,
    ) -> FrameDecision {
        let steps = self.fade_clock.steps(now_ms, self.config.fading.fade_delta_ms);

        let mut paint_top_down: Vec<WinKey> = Vec::new();
        let mut fade_running = false;
        let mut unredir_possible = false;
        let mut is_highest = true;
        let mut acc: RcRegion = Core::empty_rc();
        let mut rebuild_below = false;

        for key in self.stack.order_snapshot() {
            // Deferred opacity-target recomputation.
            let stale_opacity = self
                .stack
                .get(key)
                .is_some_and(|w| w.flags.contains(WinFlags::OPACITY_STALE));
            if stale_opacity {
                self.refresh_opacity_target(key);
                if let Some(w) = self.stack.get_mut(key) {
                    w.flags.remove(WinFlags::OPACITY_STALE);
                }
            }

            // Dim follows focus.
            let dim_flipped = {
                let Self { stack, config, .. } = self;
                let Some(w) = stack.get_mut(key) else { continue };
                let dim_new = w.should_dim(config);
                let flipped = dim_new != w.dim;
                w.dim = dim_new;
                flipped
            };
            if dim_flipped {
                self.add_damage_from_win(key);
            }

            // Fade step; with redirection off every transition snaps.
            let opacity_old = {
                let redirected = self.redirected;
                let Self { stack, config, .. } = self;
                let Some(w) = stack.get_mut(key) else { continue };
                let opacity_old = w.opacity;
                w.run_fade(config, steps);
                if !redirected {
                    w.skip_fading();
                }
                opacity_old
            };

            // A finished fade can free the window right here.
            if self.finish_fade(key, backend) == FadeDone::Destroyed {
                rebuild_below = true;
                continue;
            }

            let (mut to_paint, opacity) = {
                let Some(w) = self.stack.get(key) else { continue };
                if w.opacity != w.opacity_tgt {
                    fade_running = true;
                }
                (should_paint(w, self.root_width, self.root_height), w.opacity)
            };

            // Mode, frame opacity and shadow opacity for painted windows.
            {
                let Self { stack, config, .. } = self;
                let Some(w) = stack.get_mut(key) else { continue };
                if to_paint {
                    w.frame_opacity = if w.has_frame() { config.opacity.frame } else { 1.0 };
                    if !w.to_paint || opacity != opacity_old {
                        w.mode = w.calc_mode();
                    }
                    w.shadow_opacity = config.shadow.opacity * w.opacity * w.frame_opacity;
                }
            }

            // Refresh the window image while we still can back out of
            // painting it. Windows on their way out keep the last image
            // they had; only viewable ones can be renamed.
            if to_paint {
                let needs_rebind = self
                    .stack
                    .get(key)
                    .is_some_and(|w| w.flags.contains(WinFlags::STALE_IMAGE));
                if needs_rebind {
                    let w = self.stack.get_mut(key).unwrap();
                    w.flags.remove(WinFlags::STALE_IMAGE);
                    if !w.viewable() {
                        // Keep fading out with the stale content.
                    } else if rebind(w, backend) {
                        w.flags.remove(WinFlags::IMAGE_ERROR);
                    } else {
                        w.flags.insert(WinFlags::IMAGE_ERROR);
                        to_paint = false;
                    }
                }
                if to_paint && !self.stack.get(key).unwrap().has_valid_image() {
                    to_paint = false;
                }
            }

            // Visibility or opacity changes damage the window's extents.
            let paint_flipped = self.stack.get(key).is_some_and(|w| w.to_paint != to_paint);
            if paint_flipped || opacity != opacity_old {
                self.add_damage_from_win(key);
            }

            // Rebuild the ignore-region chain lazily from the topmost
            // invalid entry downward.
            {
                let screen = self.screen_reg.clone();
                let w = self.stack.get_mut(key).unwrap();
                if !w.reg_ignore_valid {
                    rebuild_below = true;
                }
                if rebuild_below {
                    w.reg_ignore = Some(acc.clone());
                    w.reg_ignore_valid = true;
                }
                let painted_solid = to_paint && w.is_solid();
                if painted_solid != w.was_painted_solid {
                    rebuild_below = true;
                }
                w.was_painted_solid = painted_solid;
                if painted_solid {
                    let opaque = w.bounding_shape_global().intersect(&screen);
                    acc = Rc::new(acc.union(&opaque));
                }
            }

            if to_paint {
                if is_highest {
                    is_highest = false;
                    let w = self.stack.get(key).unwrap();
                    if self.config.unredir.enabled
                        && w.is_solid()
                        && (!w.has_frame() || w.frame_opacity == 1.0)
                        && w.is_fullscreen(self.root_width, self.root_height)
                        && !w.unredir_excluded
                    {
                        unredir_possible = true;
                    }
                }
                paint_top_down.push(key);
            }
            self.stack.get_mut(key).unwrap().to_paint = to_paint;
        }

        // With nothing on screen and redirection already off, stay off.
        if self.config.unredir.enabled && is_highest && !self.redirected {
            unredir_possible = true;
        }

        paint_top_down.reverse();
        FrameDecision {
            paint: paint_top_down,
            fade_running,
            unredir_possible,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::test_backend::TestBackend;
    use crate::backend::VisualInfo;
    use crate::config::Config;
    use crate::region::Region;
    use crate::win::{Geometry, WinState, Xid};

    pub(crate) fn test_config() -> Config {
        let mut c = Config::default();
        c.fading.fade_in_step = 0.1;
        c.fading.fade_out_step = 0.1;
        c.fading.fade_delta_ms = 10;
        c
    }

    pub(crate) fn test_core(config: Config) -> (Core, TestBackend) {
        let mut core = Core::new(config, 1920, 1080);
        core.redirected = true;
        core.damage.reset(3);
        (core, TestBackend::new(3))
    }

    /// The standard rebind hook: binds a fresh image, drops the old one and
    /// any stale shadow.
    pub(crate) fn rebind(w: &mut Window, be: &mut dyn Backend) -> bool {
        match be.bind_pixmap(w.id, visual_info(), true) {
            Ok(img) => {
                if let Some(old) = w.image.take() {
                    be.release_image(old);
                }
                if let Some(old) = w.shadow_image.take() {
                    be.release_image(old);
                }
                w.image = Some(img);
                true
            }
            Err(_) => false,
        }
    }

    fn visual_info() -> VisualInfo {
        VisualInfo { visual: 0x21, depth: 24, has_alpha: false }
    }

    pub(crate) fn add_window(
        core: &mut Core,
        be: &mut TestBackend,
        id: Xid,
        geom: Geometry,
    ) -> WinKey {
        let mut w = Window::new(id, geom);
        w.client_win = id;
        let key = core.add_win(w, 0).unwrap();
        core.map_win(key, be);
        // First damage arrives right after mapping.
        core.stack.get_mut(key).unwrap().ever_damaged = true;
        core.add_damage_from_win(key);
        key
    }

    pub(crate) fn tick(core: &mut Core, be: &mut TestBackend, now_ms: u64) -> FrameDecision {
        core.paint_preprocess(now_ms, be, &mut rebind)
    }

    fn full_geom() -> Geometry {
        Geometry::new(0, 0, 1920, 1080, 0)
    }

    #[test]
    fn fade_in_trajectory() {
        let (mut core, mut be) = test_core(test_config());
        let key = add_window(&mut core, &mut be, 0x10, Geometry::new(0, 0, 100, 100, 0));

        let expected = [(5, 0.0), (15, 0.1), (25, 0.2), (35, 0.3), (45, 0.4), (95, 0.9)];
        for (t, opacity) in expected {
            let d = tick(&mut core, &mut be, t);
            let w = core.stack.get(key).unwrap();
            assert!(
                (w.opacity - opacity).abs() < 1e-9,
                "at t={} expected opacity {}, got {}",
                t,
                opacity,
                w.opacity
            );
            assert!(d.fade_running, "fade must still be running at t={}", t);
            assert_eq!(w.state, WinState::Mapping);
        }

        let d = tick(&mut core, &mut be, 105);
        let w = core.stack.get(key).unwrap();
        assert_eq!(w.opacity, 1.0);
        assert_eq!(w.state, WinState::Mapped);
        assert!(!d.fade_running);
    }

    #[test]
    fn destroy_mid_fade_keeps_stack_node_until_done() {
        let (mut core, mut be) = test_core(test_config());
        let key = add_window(&mut core, &mut be, 0x10, Geometry::new(0, 0, 100, 100, 0));

        tick(&mut core, &mut be, 0);
        for t in [10, 20, 30, 40, 50] {
            tick(&mut core, &mut be, t);
        }
        let opacity = core.stack.get(key).unwrap().opacity;
        assert!(opacity > 0.0 && opacity < 1.0);

        core.unmap_win(key, true, &mut be);
        assert_eq!(core.stack.find(0x10), None);
        assert_eq!(core.stack.len(), 1);
        assert_eq!(core.stack.get(key).unwrap().state, WinState::Destroying);
        assert_eq!(core.stack.get(key).unwrap().opacity_tgt, 0.0);

        // A newcomer can take the id while the ghost fades.
        let fresh = add_window(&mut core, &mut be, 0x10, Geometry::new(5, 5, 50, 50, 0));
        assert_ne!(fresh, key);

        // Fade the ghost all the way out.
        let mut t = 50;
        while core.stack.get(key).is_some() {
            t += 10;
            tick(&mut core, &mut be, t);
            assert!(t < 500, "destroy fade never finished");
        }
        // Its backend images were released with it.
        assert_eq!(be.live.len(), 1); // only the newcomer's image remains
        assert!(core.stack.get(fresh).is_some());
    }

    #[test]
    fn reg_ignore_matches_opaque_windows_above() {
        let (mut core, mut be) = test_core(test_config());
        // Insert bottom-up: C at the bottom, then B, then A on top.
        let c = add_window(&mut core, &mut be, 3, Geometry::new(200, 200, 300, 300, 0));
        let b = add_window(&mut core, &mut be, 2, Geometry::new(100, 100, 200, 200, 0));
        let a = add_window(&mut core, &mut be, 1, Geometry::new(0, 0, 100, 100, 0));
        // Restacking happens above C, which was inserted first.
        core.stack.restack(b, 3);
        core.stack.restack(a, 2);

        // Settle all fades so the windows go solid.
        let mut t = 0;
        loop {
            t += 10;
            let d = tick(&mut core, &mut be, t);
            if !d.fade_running {
                break;
            }
        }

        fn reg(core: &Core, k: WinKey) -> std::rc::Rc<Region> {
            core.stack.get(k).unwrap().reg_ignore.clone().unwrap()
        }
        fn ext(core: &Core, k: WinKey) -> Region {
            Region::from_rect(core.stack.get(k).unwrap().body_rect())
        }
        assert!(reg(&core, a).is_empty());
        assert_eq!(*reg(&core, b), ext(&core, a));
        assert_eq!(*reg(&core, c), ext(&core, a).union(&ext(&core, b)));
        for k in [a, b, c] {
            assert!(core.stack.get(k).unwrap().reg_ignore_valid);
        }

        // Move C above A; every cache below the move point is rebuilt.
        core.stack.restack(c, 1);
        tick(&mut core, &mut be, t + 10);
        assert!(reg(&core, c).is_empty());
        assert_eq!(*reg(&core, a), ext(&core, c));
        assert_eq!(*reg(&core, b), ext(&core, c).union(&ext(&core, a)));
        for k in [a, b, c] {
            assert!(core.stack.get(k).unwrap().reg_ignore_valid);
        }
    }

    #[test]
    fn contiguous_non_solid_windows_share_the_ignore_region() {
        let mut config = test_config();
        config.opacity.inactive = 0.5; // everyone stays translucent
        let (mut core, mut be) = test_core(config);
        let bottom = add_window(&mut core, &mut be, 1, Geometry::new(0, 0, 50, 50, 0));
        let top = add_window(&mut core, &mut be, 2, Geometry::new(50, 0, 50, 50, 0));
        let mut t = 0;
        loop {
            t += 10;
            if !tick(&mut core, &mut be, t).fade_running {
                break;
            }
        }
        let r1 = core.stack.get(top).unwrap().reg_ignore.clone().unwrap();
        let r2 = core.stack.get(bottom).unwrap().reg_ignore.clone().unwrap();
        assert!(Rc::ptr_eq(&r1, &r2));
    }

    #[test]
    fn offscreen_window_is_never_painted() {
        let (mut core, mut be) = test_core(test_config());
        let key = add_window(&mut core, &mut be, 0x30, Geometry::new(-500, -500, 100, 100, 0));
        let mut t = 0;
        for _ in 0..30 {
            t += 10;
            let d = tick(&mut core, &mut be, t);
            assert!(!d.paint.contains(&key));
        }
        assert!(!core.stack.get(key).unwrap().to_paint);
    }

    #[test]
    fn nearly_transparent_window_is_not_painted() {
        let mut config = test_config();
        config.opacity.inactive = 1.0 / 512.0;
        let (mut core, mut be) = test_core(config);
        let key = add_window(&mut core, &mut be, 0x31, Geometry::new(0, 0, 100, 100, 0));
        let mut t = 0;
        for _ in 0..30 {
            t += 10;
            tick(&mut core, &mut be, t);
        }
        let w = core.stack.get(key).unwrap();
        assert!(w.opacity * 255.0 < 1.0);
        assert!(!w.to_paint);
    }

    #[test]
    fn bind_failure_quarantines_the_window() {
        let (mut core, mut be) = test_core(test_config());
        let key = add_window(&mut core, &mut be, 0x40, Geometry::new(0, 0, 100, 100, 0));
        let other = add_window(&mut core, &mut be, 0x41, Geometry::new(200, 0, 100, 100, 0));
        be.fail_bind_ids.insert(0x40);
        let d = tick(&mut core, &mut be, 5);
        assert!(!d.paint.contains(&key));
        assert!(core.stack.get(key).unwrap().flags.contains(WinFlags::IMAGE_ERROR));

        // Only the broken window is quarantined; painting continues for the
        // rest.
        let mut t = 5;
        let mut painted_other = false;
        for _ in 0..30 {
            t += 10;
            let d = tick(&mut core, &mut be, t);
            assert!(!d.paint.contains(&key));
            painted_other |= d.paint.contains(&other);
        }
        // The quarantined window stays excluded until it is remapped, even
        // though binding would succeed now.
        be.fail_bind_ids.clear();
        assert!(core.stack.get(key).unwrap().flags.contains(WinFlags::IMAGE_ERROR));

        core.unmap_win(key, false, &mut be);
        let mut t2 = t;
        while core.stack.get(key).unwrap().state != WinState::Unmapped {
            t2 += 10;
            tick(&mut core, &mut be, t2);
        }
        core.map_win(key, &mut be);
        assert!(!core.stack.get(key).unwrap().flags.contains(WinFlags::IMAGE_ERROR));
        core.stack.get_mut(key).unwrap().ever_damaged = true;
        let mut rebound = false;
        for _ in 0..30 {
            t2 += 10;
            let d = tick(&mut core, &mut be, t2);
            rebound |= d.paint.contains(&key);
        }
        assert!(rebound, "remapped window must paint again");
        assert!(painted_other);
    }

    #[test]
    fn unredirect_verdict_needs_solid_fullscreen_top() {
        let mut config = test_config();
        config.unredir.enabled = true;
        let (mut core, mut be) = test_core(config);
        let key = add_window(&mut core, &mut be, 0x20, full_geom());

        // Still fading in: translucent, so no verdict yet.
        let d = tick(&mut core, &mut be, 5);
        assert!(!d.unredir_possible);

        let mut t = 5;
        let mut d = FrameDecision::default();
        for _ in 0..200 {
            t += 10;
            d = tick(&mut core, &mut be, t);
            if !d.fade_running {
                break;
            }
        }
        assert!(d.unredir_possible);

        // A smaller window on top breaks the verdict.
        let small = add_window(&mut core, &mut be, 0x21, Geometry::new(0, 0, 400, 300, 0));
        core.stack.restack(small, core.stack.get(key).unwrap().id);
        for _ in 0..200 {
            t += 10;
            d = tick(&mut core, &mut be, t);
            if !d.fade_running {
                break;
            }
        }
        assert!(!d.unredir_possible);

        // Excluding the fullscreen window by rule also blocks it.
        core.unmap_win(small, true, &mut be);
        for _ in 0..200 {
            t += 10;
            d = tick(&mut core, &mut be, t);
            if !d.fade_running {
                break;
            }
        }
        assert!(d.unredir_possible);
        core.stack.get_mut(key).unwrap().unredir_excluded = true;
        d = tick(&mut core, &mut be, t + 10);
        assert!(!d.unredir_possible);
    }

    #[test]
    fn paint_list_runs_bottom_to_top() {
        let (mut core, mut be) = test_core(test_config());
        let bottom = add_window(&mut core, &mut be, 1, Geometry::new(0, 0, 100, 100, 0));
        let top = add_window(&mut core, &mut be, 2, Geometry::new(50, 50, 100, 100, 0));
        core.stack.restack(top, 1);
        let mut t = 0;
        let mut d = FrameDecision::default();
        for _ in 0..200 {
            t += 10;
            d = tick(&mut core, &mut be, t);
            if !d.fade_running {
                break;
            }
        }
        assert_eq!(d.paint, vec![bottom, top]);
    }
}
