//! Rendering backend abstraction.
//!
//! The compositor core drives everything through [`Backend`]; the only thing
//! it ever holds onto is the opaque [`Image`] handle. `reg_paint` style
//! arguments are authoritative clip regions; `reg_visible` is an
//! optimization hint a backend may ignore without affecting correctness.

pub mod xrender;

use anyhow::Result;

use crate::kernel::ShadowContext;
use crate::region::Region;
use crate::win::Xid;

/// Upper bound on blur convolution passes.
pub const MAX_BLUR_PASS: usize = 4;

/// Opaque handle to a backend-owned image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Image(pub(crate) u64);

/// Visual information needed to bind a pixmap.
#[derive(Debug, Clone, Copy)]
pub struct VisualInfo {
    pub visual: u32,
    pub depth: u8,
    pub has_alpha: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Color {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    pub alpha: f64,
}

/// Backend-side image manipulation. The clip region and arguments ride along
/// with the operation.
#[derive(Debug, Clone)]
pub enum ImageOp<'a> {
    /// Invert colors of the whole image.
    InvertColorAll,
    /// Dim the whole image by the given fraction.
    DimAll(f64),
    /// Multiply alpha inside the clip region.
    ApplyAlpha(&'a Region, f64),
    /// Multiply alpha of the whole image.
    ApplyAlphaAll(f64),
    /// Change the effective (tiled) size without touching the backing image.
    ResizeTile(i32, i32),
}

pub trait Backend {
    /// Bind an X pixmap. `owned` transfers responsibility for freeing it.
    fn bind_pixmap(&mut self, pixmap: Xid, fmt: VisualInfo, owned: bool) -> Result<Image>;

    fn release_image(&mut self, image: Image);

    /// Duplicate an image so destructive ops can run on the copy.
    fn clone_image(&mut self, image: Image, reg_visible: &Region) -> Result<Image>;

    /// Paint `image` onto the back buffer with its top-left corner at
    /// `(dst_x, dst_y)`, clipped to `reg_paint`.
    fn compose(
        &mut self,
        image: Image,
        dst_x: i32,
        dst_y: i32,
        reg_paint: &Region,
        reg_visible: &Region,
    );

    /// Build a shadow image for a window of the given size.
    fn render_shadow(
        &mut self,
        width: i32,
        height: i32,
        kernel: &ShadowContext,
        color: Color,
    ) -> Result<Image>;

    /// Blur the back buffer inside `reg_blur`. Returns false if the backend
    /// cannot blur.
    fn blur(&mut self, opacity: f64, reg_blur: &Region, reg_visible: &Region) -> bool;

    /// Fill a region with a solid color; used by the debug overlay and the
    /// root fallback.
    fn fill(&mut self, color: Color, reg: &Region);

    fn image_op(&mut self, op: ImageOp, image: Image, reg_visible: &Region) -> bool;

    fn is_image_transparent(&self, image: Image) -> bool;

    /// Age of the buffer being rendered onto: -1 when its contents are
    /// undefined, 1 for the most recently presented buffer.
    fn buffer_age(&self) -> i32;

    /// The largest value `buffer_age` can return; sizes the damage ring.
    fn max_buffer_age(&self) -> usize;

    /// Push the back buffer to the screen.
    fn present(&mut self);

    /// The root window changed geometry; resize render targets. Existing
    /// images stay valid.
    fn root_change(&mut self, width: u16, height: u16) -> Result<()>;

    /// Drain backend-specific X events (e.g. Present completions).
    fn handle_events(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub mod test_backend {
    //! A recording backend for exercising the frame pipeline without X.

    use std::collections::HashSet;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Bind { pixmap: Xid, owned: bool },
        Release(Image),
        Clone(Image),
        Compose { image: Image, dst_x: i32, dst_y: i32, reg_paint: Region },
        RenderShadow { width: i32, height: i32 },
        Blur { opacity: f64, reg_blur: Region },
        Fill { reg: Region },
        InvertColorAll(Image),
        DimAll(Image, f64),
        ApplyAlpha(Image, f64),
        ApplyAlphaAll(Image, f64),
        ResizeTile(Image, i32, i32),
        Present,
    }

    #[derive(Debug, Default)]
    pub struct TestBackend {
        next: u64,
        pub calls: Vec<Call>,
        pub live: HashSet<Image>,
        pub transparent: HashSet<Image>,
        /// When set, every bind fails.
        pub fail_bind: bool,
        /// Pixmaps whose bind fails.
        pub fail_bind_ids: HashSet<Xid>,
        pub age: i32,
        pub max_age: usize,
    }

    impl TestBackend {
        pub fn new(max_age: usize) -> Self {
            Self {
                age: -1,
                max_age,
                ..Default::default()
            }
        }

        fn fresh(&mut self) -> Image {
            self.next += 1;
            let img = Image(self.next);
            self.live.insert(img);
            img
        }

        pub fn composed_images(&self) -> Vec<Image> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Compose { image, .. } => Some(*image),
                    _ => None,
                })
                .collect()
        }

        pub fn present_count(&self) -> usize {
            self.calls.iter().filter(|c| matches!(c, Call::Present)).count()
        }
    }

    impl Backend for TestBackend {
        fn bind_pixmap(&mut self, pixmap: Xid, _fmt: VisualInfo, owned: bool) -> Result<Image> {
            self.calls.push(Call::Bind { pixmap, owned });
            if self.fail_bind || self.fail_bind_ids.contains(&pixmap) {
                anyhow::bail!("bind refused");
            }
            Ok(self.fresh())
        }

        fn release_image(&mut self, image: Image) {
            self.calls.push(Call::Release(image));
            self.live.remove(&image);
        }

        fn clone_image(&mut self, image: Image, _reg_visible: &Region) -> Result<Image> {
            self.calls.push(Call::Clone(image));
            Ok(self.fresh())
        }

        fn compose(
            &mut self,
            image: Image,
            dst_x: i32,
            dst_y: i32,
            reg_paint: &Region,
            _reg_visible: &Region,
        ) {
            self.calls.push(Call::Compose {
                image,
                dst_x,
                dst_y,
                reg_paint: reg_paint.clone(),
            });
        }

        fn render_shadow(
            &mut self,
            width: i32,
            height: i32,
            _kernel: &ShadowContext,
            _color: Color,
        ) -> Result<Image> {
            self.calls.push(Call::RenderShadow { width, height });
            Ok(self.fresh())
        }

        fn blur(&mut self, opacity: f64, reg_blur: &Region, _reg_visible: &Region) -> bool {
            self.calls.push(Call::Blur { opacity, reg_blur: reg_blur.clone() });
            true
        }

        fn fill(&mut self, _color: Color, reg: &Region) {
            self.calls.push(Call::Fill { reg: reg.clone() });
        }

        fn image_op(&mut self, op: ImageOp, image: Image, _reg_visible: &Region) -> bool {
            self.calls.push(match op {
                ImageOp::InvertColorAll => Call::InvertColorAll(image),
                ImageOp::DimAll(v) => Call::DimAll(image, v),
                ImageOp::ApplyAlpha(_, v) => Call::ApplyAlpha(image, v),
                ImageOp::ApplyAlphaAll(v) => Call::ApplyAlphaAll(image, v),
                ImageOp::ResizeTile(w, h) => Call::ResizeTile(image, w, h),
            });
            true
        }

        fn is_image_transparent(&self, image: Image) -> bool {
            self.transparent.contains(&image)
        }

        fn buffer_age(&self) -> i32 {
            self.age
        }

        fn max_buffer_age(&self) -> usize {
            self.max_age
        }

        fn present(&mut self) {
            self.calls.push(Call::Present);
        }

        fn root_change(&mut self, _width: u16, _height: u16) -> Result<()> {
            Ok(())
        }
    }
}
