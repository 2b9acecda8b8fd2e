//! The per-frame paint pass.
//!
//! Consumes the preprocess paint list bottom-to-top: root tile, then per
//! window shadow, blur, body and dim, all through the backend. Clipping is
//! driven by the frame damage and each window's ignore region, so pixels
//! known to be covered by opaque windows above are skipped.

use tracing::warn;

use crate::backend::{Backend, Color, ImageOp};
use crate::core::Core;
use crate::region::Region;
use crate::stack::WinKey;

impl Core {
    /// Paint one frame. Returns false when there was nothing to draw (and
    /// nothing was presented).
    pub fn paint_frame(
        &mut self,
        paint: &[WinKey],
        backend: &mut dyn Backend,
        force_full: bool,
    ) -> bool {
        if !self.redirected {
            return false;
        }
        let age = if force_full { -1 } else { backend.buffer_age() };
        let region = self.damage.collect(age, &self.screen_reg);
        if region.is_empty() {
            return false;
        }

        // The wallpaper goes below everything; pixels hidden from the
        // bottom window are hidden from the root as well.
        let reg_paint_root = match paint
            .first()
            .and_then(|k| self.stack.get(*k))
            .and_then(|w| w.reg_ignore.clone())
        {
            Some(ri) if !ri.is_empty() => region.subtract(&ri),
            _ => region.clone(),
        };
        if !reg_paint_root.is_empty() {
            match self.root_image {
                Some(img) => backend.compose(img, 0, 0, &reg_paint_root, &self.screen_reg),
                None => backend.fill(
                    Color { red: 0.25, green: 0.25, blue: 0.25, alpha: 1.0 },
                    &reg_paint_root,
                ),
            }
        }

        for &key in paint {
            self.build_shadow_if_missing(key, backend);

            let Some(w) = self.stack.get(key) else { continue };
            let reg_ignore = w.reg_ignore.clone().unwrap_or_else(Core::empty_rc);
            let reg_visible = self.screen_reg.subtract(&reg_ignore);
            let bound = w.bounding_shape_global();

            // Shadow first, body over it.
            if w.shadow && w.shadow_opacity > 0.0 {
                if let Some(shadow_img) = w.shadow_image {
                    let shadow_rect = Region::rect(
                        w.geom.x + w.shadow_dx,
                        w.geom.y + w.shadow_dy,
                        w.shadow_width,
                        w.shadow_height,
                    );
                    let mut reg_shadow = region.intersect(&shadow_rect);
                    reg_shadow.subtract_with(&reg_ignore);
                    if !self.shadow_exclude_reg.is_empty() {
                        reg_shadow.subtract_with(&self.shadow_exclude_reg);
                    }
                    if self.config.shadow.crop_to_monitor {
                        if let Some(scr) = w.xinerama_scr.and_then(|i| self.xinerama_regs.get(i)) {
                            reg_shadow.intersect_with(scr);
                        }
                    }
                    if !self.config.wintype(w.wintype).full_shadow {
                        reg_shadow.subtract_with(&bound);
                    }

                    if !reg_shadow.is_empty() {
                        let alpha = w.opacity * w.frame_opacity;
                        let dst_x = w.geom.x + w.shadow_dx;
                        let dst_y = w.geom.y + w.shadow_dy;
                        if alpha == 1.0 {
                            backend.compose(shadow_img, dst_x, dst_y, &reg_shadow, &reg_visible);
                        } else {
                            match backend.clone_image(shadow_img, &reg_visible) {
                                Ok(tmp) => {
                                    backend.image_op(
                                        ImageOp::ApplyAlphaAll(alpha),
                                        tmp,
                                        &reg_visible,
                                    );
                                    backend.compose(tmp, dst_x, dst_y, &reg_shadow, &reg_visible);
                                    backend.release_image(tmp);
                                }
                                Err(e) => warn!("Failed to clone shadow image: {}", e),
                            }
                        }
                    }
                }
            }

            let mut reg_paint_body = region.subtract(&reg_ignore);
            reg_paint_body.intersect_with(&bound);
            if reg_paint_body.is_empty() {
                continue;
            }

            // Blur what will sit behind translucent parts.
            if w.blur_background
                && (!w.is_solid()
                    || (self.config.blur.background_frame && w.frame_opacity != 1.0))
            {
                if !w.is_solid() {
                    backend.blur(w.opacity, &reg_paint_body, &reg_visible);
                } else {
                    let mut reg_blur = w.frame_region_local();
                    reg_blur.translate(w.geom.x, w.geom.y);
                    reg_blur.intersect_with(&region);
                    if !reg_blur.is_empty() {
                        backend.blur(w.opacity, &reg_blur, &reg_visible);
                    }
                }
            }

            let Some(img) = w.image else { continue };
            let plain = !w.invert_color
                && !w.dim
                && w.frame_opacity == 1.0
                && w.opacity == 1.0;
            if plain {
                backend.compose(img, w.geom.x, w.geom.y, &reg_paint_body, &reg_visible);
                continue;
            }

            // Effects run on a scratch copy so the cached image survives.
            let tmp = match backend.clone_image(img, &reg_visible) {
                Ok(tmp) => tmp,
                Err(e) => {
                    warn!("Failed to clone image of {:#010x}: {}", w.id, e);
                    backend.compose(img, w.geom.x, w.geom.y, &reg_paint_body, &reg_visible);
                    continue;
                }
            };
            if w.invert_color {
                backend.image_op(ImageOp::InvertColorAll, tmp, &reg_visible);
            }
            if w.dim {
                let dim_alpha = self.config.opacity.inactive_dim
                    * if self.config.opacity.inactive_dim_fixed { 1.0 } else { w.opacity };
                backend.image_op(ImageOp::DimAll(dim_alpha), tmp, &reg_visible);
            }
            if w.frame_opacity != 1.0 {
                let frame = w.frame_region_local();
                backend.image_op(
                    ImageOp::ApplyAlpha(&frame, w.frame_opacity),
                    tmp,
                    &reg_visible,
                );
            }
            if w.opacity != 1.0 {
                backend.image_op(ImageOp::ApplyAlphaAll(w.opacity), tmp, &reg_visible);
            }
            backend.compose(tmp, w.geom.x, w.geom.y, &reg_paint_body, &reg_visible);
            backend.release_image(tmp);
        }

        if self.config.general.monitor_repaint {
            backend.fill(Color { red: 0.5, green: 0.0, blue: 0.0, alpha: 0.5 }, &region);
        }

        self.damage.advance();
        backend.present();
        self.paint_count += 1;
        true
    }

    fn build_shadow_if_missing(&mut self, key: WinKey, backend: &mut dyn Backend) {
        let needs_build = self
            .stack
            .get(key)
            .is_some_and(|w| w.shadow && w.shadow_image.is_none());
        if !needs_build {
            return;
        }
        let Some(ctx) = &self.shadow_ctx else { return };
        let (wb, hb) = {
            let w = self.stack.get(key).unwrap();
            (w.widthb(), w.heightb())
        };
        let color = Color {
            red: self.config.shadow.red,
            green: self.config.shadow.green,
            blue: self.config.shadow.blue,
            alpha: self.config.shadow.opacity,
        };
        match backend.render_shadow(wb, hb, ctx, color) {
            Ok(img) => self.stack.get_mut(key).unwrap().shadow_image = Some(img),
            Err(e) => {
                let id = self.stack.get(key).map_or(0, |w| w.id);
                warn!("Failed to build shadow for {:#010x}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_backend::{Call, TestBackend};
    use crate::preproc::tests::{add_window, test_config, test_core, tick};
    use crate::win::Geometry;

    /// Run preprocess ticks until all fades settle, then return the last
    /// paint list.
    fn settle(core: &mut Core, be: &mut TestBackend) -> Vec<WinKey> {
        let mut t = 0;
        loop {
            t += 10;
            let d = tick(core, be, t);
            if !d.fade_running {
                return d.paint;
            }
            assert!(t < 10_000);
        }
    }

    #[test]
    fn nothing_to_draw_presents_nothing() {
        let (mut core, mut be) = test_core(test_config());
        core.damage.clear();
        be.age = 1;
        assert!(!core.paint_frame(&[], &mut be, false));
        assert_eq!(be.present_count(), 0);
    }

    #[test]
    fn no_painting_while_unredirected() {
        let (mut core, mut be) = test_core(test_config());
        let key = add_window(&mut core, &mut be, 1, Geometry::new(0, 0, 100, 100, 0));
        let paint = settle(&mut core, &mut be);
        core.redirected = false;
        be.calls.clear();
        assert!(!core.paint_frame(&paint, &mut be, true));
        assert!(be.calls.is_empty());
        let _ = key;
    }

    #[test]
    fn bodies_are_clipped_by_opaque_windows_above() {
        let (mut core, mut be) = test_core(test_config());
        let bottom = add_window(&mut core, &mut be, 1, Geometry::new(0, 0, 200, 200, 0));
        let top = add_window(&mut core, &mut be, 2, Geometry::new(0, 0, 100, 100, 0));
        core.stack.restack(top, 1);
        let paint = settle(&mut core, &mut be);
        assert_eq!(paint, vec![bottom, top]);

        core.damage.clear();
        core.force_repaint();
        be.age = 1;
        be.calls.clear();
        assert!(core.paint_frame(&paint, &mut be, false));

        let bottom_img = core.stack.get(bottom).unwrap().image.unwrap();
        let top_img = core.stack.get(top).unwrap().image.unwrap();
        let regions: Vec<(crate::backend::Image, Region)> = be
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Compose { image, reg_paint, .. } => Some((*image, reg_paint.clone())),
                _ => None,
            })
            .collect();
        // The top window's rectangle is carved out of the bottom window's
        // paint region.
        let top_rect = Region::rect(0, 0, 100, 100);
        let bottom_reg = &regions.iter().find(|(i, _)| *i == bottom_img).unwrap().1;
        assert!(bottom_reg.intersect(&top_rect).is_empty());
        assert!(bottom_reg.contains(150, 150));
        let top_reg = &regions.iter().find(|(i, _)| *i == top_img).unwrap().1;
        assert!(top_reg.contains(50, 50));
        assert_eq!(be.present_count(), 1);
        assert_eq!(core.paint_count, 1);
    }

    #[test]
    fn root_paint_subtracts_the_bottom_windows_ignore_chain() {
        let (mut core, mut be) = test_core(test_config());
        let bottom = add_window(&mut core, &mut be, 1, Geometry::new(0, 0, 200, 200, 0));
        let top = add_window(&mut core, &mut be, 2, Geometry::new(300, 300, 100, 100, 0));
        core.stack.restack(top, 1);
        let paint = settle(&mut core, &mut be);
        assert_eq!(paint, vec![bottom, top]);

        core.damage.clear();
        core.force_repaint();
        be.age = 1;
        be.calls.clear();
        core.paint_frame(&paint, &mut be, false);

        // No root image is bound, so the wallpaper falls back to a fill.
        // Pixels hidden by opaque windows above the bottom one are skipped;
        // the bottom window's own area is still filled and painted over.
        let fill = be
            .calls
            .iter()
            .find_map(|c| match c {
                Call::Fill { reg } => Some(reg.clone()),
                _ => None,
            })
            .expect("root fallback fill must happen");
        assert!(fill.contains(1000, 1000));
        assert!(fill.contains(100, 100));
        assert!(fill.intersect(&Region::rect(300, 300, 100, 100)).is_empty());
    }

    #[test]
    fn damage_clips_all_painting() {
        let (mut core, mut be) = test_core(test_config());
        let key = add_window(&mut core, &mut be, 1, Geometry::new(0, 0, 500, 500, 0));
        let paint = settle(&mut core, &mut be);

        core.damage.clear();
        core.add_damage(&Region::rect(10, 10, 20, 20));
        be.age = 1;
        be.calls.clear();
        core.paint_frame(&paint, &mut be, false);

        let outside = Region::rect(100, 100, 1000, 1000);
        for call in &be.calls {
            if let Call::Compose { reg_paint, .. } = call {
                assert!(reg_paint.intersect(&outside).is_empty());
            }
        }
        let _ = key;
    }

    #[test]
    fn shadow_is_built_lazily_and_carved_from_the_body() {
        let mut config = test_config();
        config.shadow.enabled = true;
        config.shadow.offset_x = -8;
        config.shadow.offset_y = -8;
        let (mut core, mut be) = test_core(config);
        let key = add_window(&mut core, &mut be, 1, Geometry::new(300, 300, 100, 100, 0));
        core.win_determine_shadow(key);
        assert!(core.stack.get(key).unwrap().shadow);
        let paint = settle(&mut core, &mut be);

        core.damage.clear();
        core.force_repaint();
        be.age = 1;
        be.calls.clear();
        core.paint_frame(&paint, &mut be, false);
        let builds = be
            .calls
            .iter()
            .filter(|c| matches!(c, Call::RenderShadow { .. }))
            .count();
        assert_eq!(builds, 1);

        let shadow_img = core.stack.get(key).unwrap().shadow_image.unwrap();
        let shadow_reg = be
            .calls
            .iter()
            .find_map(|c| match c {
                Call::Compose { image, reg_paint, .. } if *image == shadow_img => {
                    Some(reg_paint.clone())
                }
                _ => None,
            })
            .expect("shadow must be composed");
        // Not painted under the window body itself.
        assert!(shadow_reg.intersect(&Region::rect(300, 300, 100, 100)).is_empty());
        assert!(!shadow_reg.is_empty());

        // Second frame reuses the built shadow.
        core.damage.clear();
        core.force_repaint();
        be.calls.clear();
        core.paint_frame(&paint, &mut be, false);
        assert!(!be.calls.iter().any(|c| matches!(c, Call::RenderShadow { .. })));
    }

    #[test]
    fn effects_run_on_a_scratch_copy() {
        let mut config = test_config();
        config.opacity.inactive_dim = 0.2;
        let (mut core, mut be) = test_core(config);
        let key = add_window(&mut core, &mut be, 1, Geometry::new(0, 0, 100, 100, 0));
        core.stack.get_mut(key).unwrap().invert_color = true;
        let paint = settle(&mut core, &mut be);

        core.damage.clear();
        core.force_repaint();
        be.age = 1;
        be.calls.clear();
        core.paint_frame(&paint, &mut be, false);

        let img = core.stack.get(key).unwrap().image.unwrap();
        let cloned = be.calls.iter().any(|c| matches!(c, Call::Clone(i) if *i == img));
        assert!(cloned);
        assert!(be.calls.iter().any(|c| matches!(c, Call::InvertColorAll(_))));
        assert!(be.calls.iter().any(|c| matches!(c, Call::DimAll(_, a) if (a - 0.2).abs() < 1e-9)));
        // The scratch copy is released; the cached image is not composed.
        let released: Vec<_> = be
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Release(i) => Some(*i),
                _ => None,
            })
            .collect();
        assert!(!released.contains(&img));
        assert_eq!(released.len(), 1);
        assert!(!be.composed_images().contains(&img));
    }

    #[test]
    fn monitor_repaint_fills_the_damage_region() {
        let mut config = test_config();
        config.general.monitor_repaint = true;
        let (mut core, mut be) = test_core(config);
        let key = add_window(&mut core, &mut be, 1, Geometry::new(0, 0, 100, 100, 0));
        let paint = settle(&mut core, &mut be);
        core.damage.clear();
        core.add_damage(&Region::rect(0, 0, 64, 64));
        be.age = 1;
        be.calls.clear();
        core.paint_frame(&paint, &mut be, false);
        let fills = be
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Fill { .. }))
            .count();
        assert!(fills >= 1);
        let _ = key;
    }
}
