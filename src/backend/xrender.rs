//! X Render backend.
//!
//! Paints into a root-sized back buffer pixmap and pushes it to the target
//! (overlay or root) picture on present. Window images are Render pictures
//! over the redirected pixmaps; opacity rides on the image and is applied as
//! a solid alpha mask at compose time.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};
use x11rb::connection::Connection;
use x11rb::protocol::render::{self, ConnectionExt as _, PictOp, Pictformat, Repeat};
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xproto::{ConnectionExt as _, CreateGCAux, ImageFormat, Rectangle};
use x11rb::rust_connection::RustConnection;

use super::{Backend, Color, Image, ImageOp, VisualInfo};
use crate::config::BlurConfig;
use crate::kernel::{BlurKernel, ShadowContext};
use crate::region::Region;
use crate::win::Xid;

fn to_fixed(v: f64) -> render::Fixed {
    (v * 65536.0) as render::Fixed
}

fn clamp_rect(r: &crate::region::Rect) -> Rectangle {
    Rectangle {
        x: r.x1.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
        y: r.y1.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
        width: r.width().clamp(0, u16::MAX as i32) as u16,
        height: r.height().clamp(0, u16::MAX as i32) as u16,
    }
}

fn color16(c: Color) -> render::Color {
    render::Color {
        red: (c.red * c.alpha * 65535.0) as u16,
        green: (c.green * c.alpha * 65535.0) as u16,
        blue: (c.blue * c.alpha * 65535.0) as u16,
        alpha: (c.alpha * 65535.0) as u16,
    }
}

struct XrImage {
    pixmap: Xid,
    pict: render::Picture,
    width: u16,
    height: u16,
    /// Effective size; differs from the backing size for tiled images.
    ewidth: i32,
    eheight: i32,
    has_alpha: bool,
    opacity: f64,
    visual: u32,
    depth: u8,
    owned: bool,
}

pub struct XRenderBackend {
    conn: Arc<RustConnection>,
    root: Xid,
    target_win: Xid,
    target: render::Picture,
    back_pixmap: Xid,
    back: render::Picture,
    back_age: i32,
    target_width: u16,
    target_height: u16,
    /// Pictures of solid alpha values 0..=255, used as compose masks.
    alpha_picts: Vec<render::Picture>,
    white_pixel: render::Picture,
    /// Per-visual Render formats.
    visual_formats: HashMap<u32, Pictformat>,
    argb32_format: Pictformat,
    a8_format: Pictformat,
    default_format: Pictformat,
    default_depth: u8,
    blur_kernel: BlurKernel,
    blur_passes: usize,
    blur_fixed: bool,
    images: HashMap<u64, XrImage>,
    next_image: u64,
}

impl XRenderBackend {
    /// Bind to the overlay (or root) and build the static resources.
    pub fn new(
        conn: Arc<RustConnection>,
        root: Xid,
        default_visual: u32,
        root_width: u16,
        root_height: u16,
        overlay: Option<Xid>,
        blur: &BlurConfig,
    ) -> Result<Self> {
        let formats = conn.render_query_pict_formats()?.reply()?;

        let mut visual_formats = HashMap::new();
        for screen in &formats.screens {
            for depth in &screen.depths {
                for pv in &depth.visuals {
                    visual_formats.insert(pv.visual, pv.format);
                }
            }
        }

        let pick = |depth: u8, want_alpha: bool| -> Result<Pictformat> {
            formats
                .formats
                .iter()
                .find(|f| {
                    f.depth == depth
                        && f.type_ == render::PictType::DIRECT
                        && (f.direct.alpha_mask != 0) == want_alpha
                })
                .map(|f| f.id)
                .with_context(|| format!("No Render format of depth {}", depth))
        };
        let argb32_format = pick(32, true)?;
        let a8_format = pick(8, true)?;
        let default_format = *visual_formats
            .get(&default_visual)
            .context("Default visual has no Render format")?;
        let default_depth = formats
            .formats
            .iter()
            .find(|f| f.id == default_format)
            .map(|f| f.depth)
            .unwrap_or(24);

        let target_win = overlay.unwrap_or(root);
        let target = conn.generate_id()?;
        let aux = if overlay.is_some() {
            render::CreatePictureAux::new()
        } else {
            render::CreatePictureAux::new()
                .subwindowmode(x11rb::protocol::xproto::SubwindowMode::INCLUDE_INFERIORS)
        };
        conn.render_create_picture(target, target_win, default_format, &aux)?;

        let mut backend = Self {
            conn,
            root,
            target_win,
            target,
            back_pixmap: 0,
            back: 0,
            back_age: -1,
            target_width: root_width,
            target_height: root_height,
            alpha_picts: Vec::new(),
            white_pixel: 0,
            visual_formats,
            argb32_format,
            a8_format,
            default_format,
            default_depth,
            blur_kernel: BlurKernel::default_3x3(),
            blur_passes: blur.passes,
            blur_fixed: blur.background_fixed,
            images: HashMap::new(),
            next_image: 0,
        };

        backend.white_pixel = backend.solid_picture(true, 1.0, 1.0, 1.0, 1.0)?;
        for i in 0..=255u32 {
            let pict = backend.solid_picture(false, i as f64 / 255.0, 0.0, 0.0, 0.0)?;
            backend.alpha_picts.push(pict);
        }
        backend.create_back_buffer()?;
        backend.conn.flush()?;
        debug!("X Render backend bound to window {:#010x}", target_win);
        Ok(backend)
    }

    fn create_back_buffer(&mut self) -> Result<()> {
        let pixmap = self.conn.generate_id()?;
        self.conn.create_pixmap(
            self.default_depth,
            pixmap,
            self.root,
            self.target_width,
            self.target_height,
        )?;
        let pict = self.conn.generate_id()?;
        self.conn.render_create_picture(
            pict,
            pixmap,
            self.default_format,
            &render::CreatePictureAux::new(),
        )?;
        self.back_pixmap = pixmap;
        self.back = pict;
        self.back_age = -1;
        Ok(())
    }

    fn solid_picture(&self, argb: bool, a: f64, r: f64, g: f64, b: f64) -> Result<render::Picture> {
        let depth = if argb { 32 } else { 8 };
        let format = if argb { self.argb32_format } else { self.a8_format };
        let pixmap = self.conn.generate_id()?;
        self.conn.create_pixmap(depth, pixmap, self.root, 1, 1)?;
        let pict = self.conn.generate_id()?;
        self.conn.render_create_picture(
            pict,
            pixmap,
            format,
            &render::CreatePictureAux::new().repeat(Repeat::NORMAL),
        )?;
        self.conn.render_fill_rectangles(
            PictOp::SRC,
            pict,
            color16(Color { red: r, green: g, blue: b, alpha: a }),
            &[Rectangle { x: 0, y: 0, width: 1, height: 1 }],
        )?;
        self.conn.free_pixmap(pixmap)?;
        Ok(pict)
    }

    fn alpha_pict(&self, opacity: f64) -> Option<render::Picture> {
        let idx = (opacity.clamp(0.0, 1.0) * 255.0) as usize;
        if idx >= 255 {
            None
        } else {
            Some(self.alpha_picts[idx])
        }
    }

    /// Clip a picture to a region; an empty region clips everything away.
    fn set_clip(&self, pict: render::Picture, reg: &Region) -> Result<()> {
        let rects: Vec<Rectangle> = reg.rects().iter().map(clamp_rect).collect();
        let xreg = self.conn.generate_id()?;
        self.conn.xfixes_create_region(xreg, &rects)?;
        self.conn.xfixes_set_picture_clip_region(pict, xreg, 0, 0)?;
        self.conn.xfixes_destroy_region(xreg)?;
        Ok(())
    }

    fn clear_clip(&self, pict: render::Picture) -> Result<()> {
        self.conn
            .xfixes_set_picture_clip_region(pict, x11rb::NONE, 0, 0)?;
        Ok(())
    }

    fn register(&mut self, img: XrImage) -> Image {
        self.next_image += 1;
        self.images.insert(self.next_image, img);
        Image(self.next_image)
    }

    fn take(&mut self, image: Image) -> Option<XrImage> {
        self.images.remove(&image.0)
    }

    fn get(&self, image: Image) -> Option<&XrImage> {
        self.images.get(&image.0)
    }
}

impl Backend for XRenderBackend {
    fn bind_pixmap(&mut self, pixmap: Xid, fmt: VisualInfo, owned: bool) -> Result<Image> {
        let geom = self
            .conn
            .get_geometry(pixmap)?
            .reply()
            .with_context(|| format!("Invalid pixmap {:#010x}", pixmap))?;
        let format = *self
            .visual_formats
            .get(&fmt.visual)
            .with_context(|| format!("No Render format for visual {:#x}", fmt.visual))?;
        let pict = self.conn.generate_id()?;
        self.conn.render_create_picture(
            pict,
            pixmap,
            format,
            &render::CreatePictureAux::new().repeat(Repeat::NORMAL),
        )?;
        Ok(self.register(XrImage {
            pixmap,
            pict,
            width: geom.width,
            height: geom.height,
            ewidth: geom.width as i32,
            eheight: geom.height as i32,
            has_alpha: fmt.has_alpha,
            opacity: 1.0,
            visual: fmt.visual,
            depth: fmt.depth,
            owned,
        }))
    }

    fn release_image(&mut self, image: Image) {
        if let Some(img) = self.take(image) {
            let _ = self.conn.render_free_picture(img.pict);
            if img.owned {
                let _ = self.conn.free_pixmap(img.pixmap);
            }
        }
    }

    fn clone_image(&mut self, image: Image, reg_visible: &Region) -> Result<Image> {
        let src = self.get(image).context("Cloning an unbound image")?;
        let (src_pict, w, h, depth, visual, has_alpha, opacity, ewidth, eheight) = (
            src.pict, src.width, src.height, src.depth, src.visual, src.has_alpha, src.opacity,
            src.ewidth, src.eheight,
        );
        let format = if depth == 32 {
            self.argb32_format
        } else {
            *self
                .visual_formats
                .get(&visual)
                .context("No Render format for visual")?
        };

        let pixmap = self.conn.generate_id()?;
        self.conn.create_pixmap(depth, pixmap, self.root, w, h)?;
        let pict = self.conn.generate_id()?;
        self.conn.render_create_picture(
            pict,
            pixmap,
            format,
            &render::CreatePictureAux::new().repeat(Repeat::NORMAL),
        )?;

        self.set_clip(src_pict, reg_visible)?;
        let mask = self.alpha_pict(opacity).filter(|_| opacity != 1.0);
        self.conn.render_composite(
            PictOp::SRC,
            src_pict,
            mask.unwrap_or(x11rb::NONE),
            pict,
            0,
            0,
            0,
            0,
            0,
            0,
            w,
            h,
        )?;
        self.clear_clip(src_pict)?;

        Ok(self.register(XrImage {
            pixmap,
            pict,
            width: w,
            height: h,
            ewidth,
            eheight,
            has_alpha,
            opacity: 1.0,
            visual,
            depth,
            owned: true,
        }))
    }

    fn compose(
        &mut self,
        image: Image,
        dst_x: i32,
        dst_y: i32,
        reg_paint: &Region,
        reg_visible: &Region,
    ) {
        let Some(img) = self.images.get(&image.0) else {
            warn!("Composing an unbound image");
            return;
        };
        let op = if img.has_alpha || img.opacity != 1.0 {
            PictOp::OVER
        } else {
            PictOp::SRC
        };
        let reg = reg_paint.intersect(reg_visible);
        if reg.is_empty() {
            return;
        }
        let mask = if img.opacity != 1.0 {
            self.alpha_pict(img.opacity).unwrap_or(x11rb::NONE)
        } else {
            x11rb::NONE
        };
        let (pict, ew, eh) = (img.pict, img.ewidth, img.eheight);
        let _ = self.clear_clip(pict);
        if self.set_clip(self.back, &reg).is_err() {
            return;
        }
        let _ = self.conn.render_composite(
            op,
            pict,
            mask,
            self.back,
            0,
            0,
            0,
            0,
            dst_x.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            dst_y.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            ew.clamp(0, u16::MAX as i32) as u16,
            eh.clamp(0, u16::MAX as i32) as u16,
        );
    }

    fn render_shadow(
        &mut self,
        width: i32,
        height: i32,
        kernel: &ShadowContext,
        color: Color,
    ) -> Result<Image> {
        let tile = kernel.make_tile(color.alpha, width, height);
        let (sw, sh) = (tile.width as u16, tile.height as u16);

        // Upload the A8 alpha tile.
        let alpha_pixmap = self.conn.generate_id()?;
        self.conn.create_pixmap(8, alpha_pixmap, self.root, sw, sh)?;
        let gc = self.conn.generate_id()?;
        self.conn.create_gc(gc, alpha_pixmap, &CreateGCAux::new())?;
        let stride = (tile.width + 3) & !3;
        let mut padded = vec![0u8; stride * tile.height];
        for row in 0..tile.height {
            padded[row * stride..row * stride + tile.width]
                .copy_from_slice(&tile.data[row * tile.width..(row + 1) * tile.width]);
        }
        self.conn.put_image(
            ImageFormat::Z_PIXMAP,
            alpha_pixmap,
            gc,
            sw,
            sh,
            0,
            0,
            0,
            8,
            &padded,
        )?;
        self.conn.free_gc(gc)?;
        let alpha_pict = self.conn.generate_id()?;
        self.conn.render_create_picture(
            alpha_pict,
            alpha_pixmap,
            self.a8_format,
            &render::CreatePictureAux::new(),
        )?;

        // Tint it with the shadow color into an ARGB image.
        let shadow_pixmap = self.conn.generate_id()?;
        self.conn.create_pixmap(32, shadow_pixmap, self.root, sw, sh)?;
        let shadow_pict = self.conn.generate_id()?;
        self.conn.render_create_picture(
            shadow_pict,
            shadow_pixmap,
            self.argb32_format,
            &render::CreatePictureAux::new(),
        )?;
        let solid = self.solid_picture(true, 1.0, color.red, color.green, color.blue)?;
        self.conn
            .render_composite(PictOp::SRC, solid, alpha_pict, shadow_pict, 0, 0, 0, 0, 0, 0, sw, sh)?;

        self.conn.render_free_picture(solid)?;
        self.conn.render_free_picture(alpha_pict)?;
        self.conn.free_pixmap(alpha_pixmap)?;

        Ok(self.register(XrImage {
            pixmap: shadow_pixmap,
            pict: shadow_pict,
            width: sw,
            height: sh,
            ewidth: sw as i32,
            eheight: sh as i32,
            has_alpha: true,
            opacity: 1.0,
            visual: 0,
            depth: 32,
            owned: true,
        }))
    }

    fn blur(&mut self, opacity: f64, reg_blur: &Region, reg_visible: &Region) -> bool {
        let reg = reg_blur.intersect(reg_visible);
        if reg.is_empty() {
            return true;
        }
        let extent = reg.extents();
        let (width, height) = (
            extent.width().clamp(1, u16::MAX as i32) as u16,
            extent.height().clamp(1, u16::MAX as i32) as u16,
        );
        let (src_x, src_y) = (extent.x1 as i16, extent.y1 as i16);

        let mut tmp = [0 as render::Picture; 2];
        for slot in &mut tmp {
            let Ok(pixmap) = self.conn.generate_id() else { return false };
            if self
                .conn
                .create_pixmap(self.default_depth, pixmap, self.root, width, height)
                .is_err()
            {
                return false;
            }
            let Ok(pict) = self.conn.generate_id() else { return false };
            if self
                .conn
                .render_create_picture(
                    pict,
                    pixmap,
                    self.default_format,
                    &render::CreatePictureAux::new(),
                )
                .is_err()
            {
                return false;
            }
            let _ = self.conn.free_pixmap(pixmap);
            *slot = pict;
        }

        let local = reg.translated(-(src_x as i32), -(src_y as i32));
        let _ = self.set_clip(tmp[0], &local);
        let _ = self.set_clip(tmp[1], &local);

        let filter: Vec<render::Fixed> = self
            .blur_kernel
            .to_x_filter(opacity, self.blur_fixed)
            .into_iter()
            .map(to_fixed)
            .collect();
        let alpha_mask = self.alpha_pict(opacity).unwrap_or(x11rb::NONE);

        // back -> tmp0 -> tmp1 -> ... -> back, filtering on the source each
        // pass so pixels outside the window contribute.
        let mut src = self.back;
        let mut cur = 0usize;
        let _ = self.set_clip(self.back, &reg);
        for pass in 0..self.blur_passes.max(1) {
            let last = pass + 1 == self.blur_passes.max(1);
            let _ = self
                .conn
                .render_set_picture_filter(src, b"convolution", &filter);
            if !last || pass == 0 {
                let (sx, sy) = if src == self.back { (src_x, src_y) } else { (0, 0) };
                let _ = self.conn.render_composite(
                    PictOp::SRC,
                    src,
                    x11rb::NONE,
                    tmp[cur],
                    sx,
                    sy,
                    0,
                    0,
                    0,
                    0,
                    width,
                    height,
                );
            } else {
                let _ = self.conn.render_composite(
                    PictOp::OVER,
                    src,
                    alpha_mask,
                    self.back,
                    0,
                    0,
                    0,
                    0,
                    src_x,
                    src_y,
                    width,
                    height,
                );
            }
            let _ = self.conn.render_set_picture_filter(src, b"Nearest", &[]);
            src = tmp[cur];
            cur = 1 - cur;
        }

        // A single pass never went back; copy the filtered buffer in.
        if self.blur_passes.max(1) == 1 {
            let _ = self.conn.render_composite(
                PictOp::OVER,
                src,
                alpha_mask,
                self.back,
                0,
                0,
                0,
                0,
                src_x,
                src_y,
                width,
                height,
            );
        }

        let _ = self.conn.render_free_picture(tmp[0]);
        let _ = self.conn.render_free_picture(tmp[1]);
        true
    }

    fn fill(&mut self, color: Color, reg: &Region) {
        if reg.is_empty() {
            return;
        }
        if self.set_clip(self.back, reg).is_err() {
            return;
        }
        let _ = self.conn.render_fill_rectangles(
            PictOp::OVER,
            self.back,
            color16(color),
            &[clamp_rect(&reg.extents())],
        );
    }

    fn image_op(&mut self, op: ImageOp, image: Image, reg_visible: &Region) -> bool {
        let Some(img) = self.images.get(&image.0) else { return false };
        let (pict, w, h, has_alpha) = (img.pict, img.width, img.height, img.has_alpha);
        match op {
            ImageOp::ApplyAlphaAll(alpha) => {
                if let Some(img) = self.images.get_mut(&image.0) {
                    img.opacity *= alpha;
                    img.has_alpha = true;
                }
                true
            }
            ImageOp::InvertColorAll => {
                let _ = self.set_clip(pict, reg_visible);
                if has_alpha {
                    // Keep per-pixel alpha intact by inverting a copy and
                    // multiplying it back in.
                    let Ok(tmp_pixmap) = self.conn.generate_id() else { return false };
                    let Ok(tmp_pict) = self.conn.generate_id() else { return false };
                    let format = self.argb32_format;
                    if self.conn.create_pixmap(32, tmp_pixmap, self.root, w, h).is_err() {
                        return false;
                    }
                    if self
                        .conn
                        .render_create_picture(
                            tmp_pict,
                            tmp_pixmap,
                            format,
                            &render::CreatePictureAux::new(),
                        )
                        .is_err()
                    {
                        return false;
                    }
                    let _ = self
                        .conn
                        .render_composite(PictOp::SRC, pict, x11rb::NONE, tmp_pict, 0, 0, 0, 0, 0, 0, w, h);
                    let _ = self.conn.render_composite(
                        PictOp::DIFFERENCE,
                        self.white_pixel,
                        x11rb::NONE,
                        tmp_pict,
                        0, 0, 0, 0, 0, 0, w, h,
                    );
                    let _ = self.conn.render_composite(
                        PictOp::IN_REVERSE,
                        tmp_pict,
                        x11rb::NONE,
                        pict,
                        0, 0, 0, 0, 0, 0, w, h,
                    );
                    let _ = self.conn.render_free_picture(tmp_pict);
                    let _ = self.conn.free_pixmap(tmp_pixmap);
                } else {
                    let _ = self.conn.render_composite(
                        PictOp::DIFFERENCE,
                        self.white_pixel,
                        x11rb::NONE,
                        pict,
                        0, 0, 0, 0, 0, 0, w, h,
                    );
                }
                let _ = self.clear_clip(pict);
                true
            }
            ImageOp::DimAll(strength) => {
                let _ = self.set_clip(pict, reg_visible);
                let _ = self.conn.render_fill_rectangles(
                    PictOp::OVER,
                    pict,
                    color16(Color { red: 0.0, green: 0.0, blue: 0.0, alpha: strength }),
                    &[Rectangle { x: 0, y: 0, width: w, height: h }],
                );
                let _ = self.clear_clip(pict);
                true
            }
            ImageOp::ApplyAlpha(reg, alpha) => {
                if alpha == 1.0 || reg.is_empty() {
                    return true;
                }
                let idx = ((1.0 - alpha).clamp(0.0, 1.0) * 255.0) as usize;
                let mask = self.alpha_picts[idx.min(255)];
                let clip = reg.intersect(reg_visible);
                if clip.is_empty() {
                    return true;
                }
                if self.set_clip(pict, &clip).is_err() {
                    return false;
                }
                // Knock the complement of alpha out of the clipped area.
                let _ = self.conn.render_composite(
                    PictOp::OUT_REVERSE,
                    mask,
                    x11rb::NONE,
                    pict,
                    0, 0, 0, 0, 0, 0, w, h,
                );
                let _ = self.clear_clip(pict);
                if let Some(img) = self.images.get_mut(&image.0) {
                    img.has_alpha = true;
                }
                true
            }
            ImageOp::ResizeTile(ew, eh) => {
                if let Some(img) = self.images.get_mut(&image.0) {
                    img.ewidth = ew;
                    img.eheight = eh;
                }
                true
            }
        }
    }

    fn is_image_transparent(&self, image: Image) -> bool {
        self.get(image).map(|i| i.has_alpha).unwrap_or(false)
    }

    fn buffer_age(&self) -> i32 {
        self.back_age
    }

    fn max_buffer_age(&self) -> usize {
        1
    }

    fn present(&mut self) {
        let _ = self.clear_clip(self.back);
        let _ = self.conn.render_composite(
            PictOp::SRC,
            self.back,
            x11rb::NONE,
            self.target,
            0,
            0,
            0,
            0,
            0,
            0,
            self.target_width,
            self.target_height,
        );
        // The single back buffer keeps everything we ever painted.
        self.back_age = 1;
        let _ = self.conn.flush();
    }

    fn root_change(&mut self, width: u16, height: u16) -> Result<()> {
        self.target_width = width;
        self.target_height = height;
        let _ = self.conn.render_free_picture(self.back);
        let _ = self.conn.free_pixmap(self.back_pixmap);
        self.create_back_buffer()?;
        Ok(())
    }
}

impl Drop for XRenderBackend {
    fn drop(&mut self) {
        let ids: Vec<u64> = self.images.keys().copied().collect();
        if !ids.is_empty() {
            warn!("Backend dropped with {} images still bound", ids.len());
        }
        for id in ids {
            self.release_image(Image(id));
        }
        for pict in self.alpha_picts.drain(..) {
            let _ = self.conn.render_free_picture(pict);
        }
        let _ = self.conn.render_free_picture(self.white_pixel);
        let _ = self.conn.render_free_picture(self.back);
        let _ = self.conn.free_pixmap(self.back_pixmap);
        let _ = self.conn.render_free_picture(self.target);
        let _ = self.conn.flush();
    }
}

/// Construct the backend selected by name.
pub fn init_backend(
    name: &str,
    conn: Arc<RustConnection>,
    root: Xid,
    default_visual: u32,
    root_width: u16,
    root_height: u16,
    overlay: Option<Xid>,
    blur: &BlurConfig,
) -> Result<Box<dyn Backend>> {
    match name {
        "xrender" => Ok(Box::new(XRenderBackend::new(
            conn,
            root,
            default_visual,
            root_width,
            root_height,
            overlay,
            blur,
        )?)),
        other => bail!("Unknown backend {:?}", other),
    }
}
