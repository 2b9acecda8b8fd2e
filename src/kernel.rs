//! Shadow and blur convolution kernels.
//!
//! The shadow path precomputes a normalized gaussian map plus summed corner
//! and edge tables, so building the A8 alpha tile for a window is a handful
//! of table lookups instead of a per-pixel convolution.

/// Normalized 2-D gaussian, `size` by `size`.
#[derive(Debug, Clone)]
pub struct GaussianMap {
    pub size: usize,
    data: Vec<f64>,
}

fn gaussian(r: f64, x: f64, y: f64) -> f64 {
    (1.0 / (2.0 * std::f64::consts::PI * r).sqrt()) * (-(x * x + y * y) / (2.0 * r * r)).exp()
}

impl GaussianMap {
    pub fn new(radius: f64) -> Self {
        let radius = radius.clamp(0.1, 100.0);
        let size = (((((radius * 3.0).ceil() as usize) + 1) & !1).max(2)).min(512);
        let center = (size / 2) as f64;
        let mut data = vec![0.0; size * size];
        let mut total = 0.0;
        for y in 0..size {
            for x in 0..size {
                let g = gaussian(radius, x as f64 - center, y as f64 - center);
                total += g;
                data[y * size + x] = g;
            }
        }
        for v in &mut data {
            *v /= total;
        }
        Self { size, data }
    }

    /// Sum the kernel weights that land inside a `width` x `height` window
    /// when the kernel is centered at `(x, y)` in window coordinates.
    fn sum_at(&self, opacity: f64, x: i32, y: i32, width: i32, height: i32) -> u8 {
        let size = self.size as i32;
        let center = size / 2;

        let fx_start = (center - x).clamp(0, size);
        let fx_end = (width + center - x).clamp(0, size);
        let fy_start = (center - y).clamp(0, size);
        let fy_end = (height + center - y).clamp(0, size);

        let mut v = 0.0;
        for fy in fy_start..fy_end {
            for fx in fx_start..fx_end {
                v += self.data[(fy * size + fx) as usize];
            }
        }
        if v > 1.0 {
            v = 1.0;
        }
        (v * opacity * 255.0) as u8
    }
}

/// Shadow renderer state: the gaussian map plus presummed corner/edge tables
/// for 26 opacity steps.
#[derive(Debug, Clone)]
pub struct ShadowContext {
    map: GaussianMap,
    cgsize: usize,
    corner: Vec<u8>,
    top: Vec<u8>,
}

/// An 8-bit alpha tile holding one window's drop shadow.
#[derive(Debug, Clone)]
pub struct ShadowTile {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl ShadowContext {
    pub fn new(radius: f64) -> Self {
        let map = GaussianMap::new(radius);
        let cgsize = map.size;
        let stride = cgsize + 1;

        let mut corner = vec![0u8; 26 * stride * stride];
        let mut top = vec![0u8; 26 * stride];

        let center = (cgsize / 2) as i32;
        let big = (cgsize * 2) as i32;

        for x in 0..=cgsize {
            let full = map.sum_at(1.0, x as i32 - center, center, big, big);
            top[25 * stride + x] = full;
            for opacity in 0..25 {
                top[opacity * stride + x] = (full as u32 * opacity as u32 / 25) as u8;
            }

            for y in 0..=x {
                let d = map.sum_at(1.0, x as i32 - center, y as i32 - center, big, big);
                corner[25 * stride * stride + y * stride + x] = d;
                corner[25 * stride * stride + x * stride + y] = d;
                for opacity in 0..25 {
                    let scaled = (d as u32 * opacity as u32 / 25) as u8;
                    corner[opacity * stride * stride + y * stride + x] = scaled;
                    corner[opacity * stride * stride + x * stride + y] = scaled;
                }
            }
        }

        Self { map, cgsize, corner, top }
    }

    pub fn kernel_size(&self) -> usize {
        self.cgsize
    }

    /// Build the alpha tile for a `width` x `height` window. The tile is
    /// `width + cgsize` by `height + cgsize`; the caller offsets it by the
    /// configured shadow offset when composing.
    pub fn make_tile(&self, opacity: f64, width: i32, height: i32) -> ShadowTile {
        // The presummed tables only cover 26 opacity steps.
        let opacity = opacity.clamp(0.0, 1.0);
        let cgsize = self.cgsize as i32;
        let swidth = (width + cgsize).max(1) as usize;
        let sheight = (height + cgsize).max(1) as usize;
        let center = cgsize / 2;
        let opacity_int = (opacity * 25.0) as usize;
        let stride = self.cgsize + 1;

        let mut data = vec![0u8; swidth * sheight];

        // Fill with the saturated center value first.
        let d = if self.cgsize > 0 {
            self.top[opacity_int * stride + self.cgsize]
        } else {
            self.map.sum_at(opacity, center, center, width, height)
        };
        data.fill(d);

        let mut ylimit = self.cgsize;
        if ylimit > sheight / 2 {
            ylimit = (sheight + 1) / 2;
        }
        let mut xlimit = self.cgsize;
        if xlimit > swidth / 2 {
            xlimit = (swidth + 1) / 2;
        }

        // Corners, mirrored four ways.
        for y in 0..ylimit {
            for x in 0..xlimit {
                let d = if xlimit == self.cgsize && ylimit == self.cgsize {
                    self.corner[opacity_int * stride * stride + y * stride + x]
                } else {
                    self.map
                        .sum_at(opacity, x as i32 - center, y as i32 - center, width, height)
                };
                data[y * swidth + x] = d;
                data[(sheight - y - 1) * swidth + x] = d;
                data[(sheight - y - 1) * swidth + (swidth - x - 1)] = d;
                data[y * swidth + (swidth - x - 1)] = d;
            }
        }

        // Top and bottom edges.
        let x_diff = swidth as i32 - cgsize * 2;
        if x_diff > 0 && ylimit > 0 {
            for y in 0..ylimit {
                let d = if ylimit == self.cgsize {
                    self.top[opacity_int * stride + y]
                } else {
                    self.map.sum_at(opacity, center, y as i32 - center, width, height)
                };
                let start = y * swidth + self.cgsize;
                data[start..start + x_diff as usize].fill(d);
                let start = (sheight - y - 1) * swidth + self.cgsize;
                data[start..start + x_diff as usize].fill(d);
            }
        }

        // Left and right edges.
        for x in 0..xlimit {
            let d = if xlimit == self.cgsize {
                self.top[opacity_int * stride + x]
            } else {
                self.map.sum_at(opacity, x as i32 - center, center, width, height)
            };
            for y in self.cgsize..sheight.saturating_sub(self.cgsize) {
                data[y * swidth + x] = d;
                data[y * swidth + (swidth - x - 1)] = d;
            }
        }

        ShadowTile { width: swidth, height: sheight, data }
    }
}

/// A square convolution kernel for background blur, stored row-major with an
/// adjustable center weight.
#[derive(Debug, Clone)]
pub struct BlurKernel {
    pub size: usize,
    pub weights: Vec<f64>,
}

impl BlurKernel {
    /// The stock 3x3 gaussian box used when the config does not override it.
    pub fn default_3x3() -> Self {
        let w = 1.0 / 9.0;
        Self { size: 3, weights: vec![w; 9] }
    }

    /// Center weight compensating for window opacity, so blurred content
    /// behind translucent windows does not darken. `fixed` keeps the factor
    /// independent of opacity.
    pub fn center_weight(&self, opacity: f64, fixed: bool) -> f64 {
        let p = if fixed {
            1.0 / 9.0
        } else {
            1.0 - opacity * (1.0 - 1.0 / 9.0)
        };
        8.0 * p / (1.1 - p)
    }

    /// Render protocol form: width, height, then weights with the center
    /// replaced, all as fractions that X Render expects to sum freely.
    pub fn to_x_filter(&self, opacity: f64, fixed: bool) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.weights.len() + 2);
        out.push(self.size as f64);
        out.push(self.size as f64);
        let center_idx = (self.size / 2) * self.size + self.size / 2;
        for (i, w) in self.weights.iter().enumerate() {
            if i == center_idx {
                out.push(self.center_weight(opacity, fixed));
            } else {
                out.push(*w);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaussian_map_is_normalized() {
        let map = GaussianMap::new(12.0);
        let sum: f64 = map.data.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(map.size % 2, 0);
    }

    #[test]
    fn shadow_tile_dimensions_include_kernel() {
        let ctx = ShadowContext::new(12.0);
        let tile = ctx.make_tile(0.75, 200, 100);
        assert_eq!(tile.width, 200 + ctx.kernel_size());
        assert_eq!(tile.height, 100 + ctx.kernel_size());
        assert_eq!(tile.data.len(), tile.width * tile.height);
    }

    #[test]
    fn shadow_is_darkest_in_the_middle() {
        let ctx = ShadowContext::new(8.0);
        let tile = ctx.make_tile(1.0, 120, 120);
        let mid = tile.data[(tile.height / 2) * tile.width + tile.width / 2];
        let corner = tile.data[0];
        assert!(mid > corner);
        // Opacity scales the whole tile down.
        let dim = ctx.make_tile(0.4, 120, 120);
        let dim_mid = dim.data[(dim.height / 2) * dim.width + dim.width / 2];
        assert!(dim_mid < mid);
    }

    #[test]
    fn tiny_windows_do_not_overrun_the_tile() {
        let ctx = ShadowContext::new(12.0);
        let tile = ctx.make_tile(1.0, 4, 4);
        assert_eq!(tile.data.len(), tile.width * tile.height);
    }

    #[test]
    fn out_of_range_opacity_is_clamped() {
        let ctx = ShadowContext::new(12.0);
        let over = ctx.make_tile(1.5, 64, 64);
        let full = ctx.make_tile(1.0, 64, 64);
        assert_eq!(over.data, full.data);
        let under = ctx.make_tile(-0.5, 64, 64);
        assert!(under.data.iter().all(|&d| d == 0));
    }

    #[test]
    fn blur_center_weight_matches_formula() {
        let k = BlurKernel::default_3x3();
        let p: f64 = 1.0 - 0.5 * (1.0 - 1.0 / 9.0);
        assert!((k.center_weight(0.5, false) - 8.0 * p / (1.1 - p)).abs() < 1e-12);
        // Fixed mode ignores opacity.
        assert_eq!(k.center_weight(0.1, true), k.center_weight(0.9, true));
        let filt = k.to_x_filter(1.0, false);
        assert_eq!(filt.len(), 11);
        assert_eq!(filt[0], 3.0);
    }
}
