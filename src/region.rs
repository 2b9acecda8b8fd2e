//! Rectangular region algebra.
//!
//! A `Region` is a set of disjoint, axis-aligned rectangles in screen
//! coordinates. Ops never assume non-empty operands. Regions shared between
//! windows (`reg_ignore`) are handed out as `Rc<Region>` and treated as
//! immutable once shared.

use std::rc::Rc;

/// A shared, immutable region.
pub type RcRegion = Rc<Region>;

/// Half-open rectangle: `x1 <= x < x2`, `y1 <= y < y2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Rect {
    /// Build from origin and size. Non-positive sizes yield an empty rect.
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x1: x,
            y1: y,
            x2: x + width.max(0),
            y2: y + height.max(0),
        }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn is_empty(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    fn intersection(&self, other: &Rect) -> Option<Rect> {
        let r = Rect {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        };
        if r.is_empty() {
            None
        } else {
            Some(r)
        }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x1 && x < self.x2 && y >= self.y1 && y < self.y2
    }
}

/// `a - b`, split into at most four bands.
fn rect_minus(a: Rect, b: Rect) -> Vec<Rect> {
    let Some(i) = a.intersection(&b) else {
        return vec![a];
    };
    let mut out = Vec::with_capacity(4);
    if a.y1 < i.y1 {
        out.push(Rect { x1: a.x1, y1: a.y1, x2: a.x2, y2: i.y1 });
    }
    if i.y2 < a.y2 {
        out.push(Rect { x1: a.x1, y1: i.y2, x2: a.x2, y2: a.y2 });
    }
    if a.x1 < i.x1 {
        out.push(Rect { x1: a.x1, y1: i.y1, x2: i.x1, y2: i.y2 });
    }
    if i.x2 < a.x2 {
        out.push(Rect { x1: i.x2, y1: i.y1, x2: a.x2, y2: i.y2 });
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn empty() -> Self {
        Self { rects: Vec::new() }
    }

    pub fn from_rect(rect: Rect) -> Self {
        if rect.is_empty() {
            Self::empty()
        } else {
            Self { rects: vec![rect] }
        }
    }

    pub fn rect(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self::from_rect(Rect::new(x, y, width, height))
    }

    pub fn from_rects<I: IntoIterator<Item = Rect>>(rects: I) -> Self {
        let mut r = Self::empty();
        for rect in rects {
            r.union_rect(rect);
        }
        r
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Bounding box of the region; the empty rect at the origin if empty.
    pub fn extents(&self) -> Rect {
        let mut it = self.rects.iter();
        let Some(first) = it.next() else {
            return Rect { x1: 0, y1: 0, x2: 0, y2: 0 };
        };
        let mut e = *first;
        for r in it {
            e.x1 = e.x1.min(r.x1);
            e.y1 = e.y1.min(r.y1);
            e.x2 = e.x2.max(r.x2);
            e.y2 = e.y2.max(r.y2);
        }
        e
    }

    pub fn area(&self) -> u64 {
        self.rects
            .iter()
            .map(|r| r.width() as u64 * r.height() as u64)
            .sum()
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.rects.iter().any(|r| r.contains(x, y))
    }

    pub fn translate(&mut self, dx: i32, dy: i32) {
        for r in &mut self.rects {
            r.x1 += dx;
            r.x2 += dx;
            r.y1 += dy;
            r.y2 += dy;
        }
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Region {
        let mut r = self.clone();
        r.translate(dx, dy);
        r
    }

    fn union_rect(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        // Keep only the parts of `rect` we do not already cover, so the set
        // stays disjoint.
        let mut pieces = vec![rect];
        for existing in &self.rects {
            pieces = pieces
                .into_iter()
                .flat_map(|p| rect_minus(p, *existing))
                .collect();
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);
    }

    pub fn union_with(&mut self, other: &Region) {
        for r in &other.rects {
            self.union_rect(*r);
        }
    }

    pub fn union(&self, other: &Region) -> Region {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    pub fn intersect(&self, other: &Region) -> Region {
        let mut rects = Vec::new();
        for a in &self.rects {
            for b in &other.rects {
                if let Some(i) = a.intersection(b) {
                    rects.push(i);
                }
            }
        }
        Region { rects }
    }

    pub fn intersect_with(&mut self, other: &Region) {
        *self = self.intersect(other);
    }

    pub fn subtract(&self, other: &Region) -> Region {
        if other.is_empty() || self.is_empty() {
            return self.clone();
        }
        let mut rects = Vec::new();
        for a in &self.rects {
            let mut pieces = vec![*a];
            for b in &other.rects {
                pieces = pieces
                    .into_iter()
                    .flat_map(|p| rect_minus(p, *b))
                    .collect();
                if pieces.is_empty() {
                    break;
                }
            }
            rects.extend(pieces);
        }
        Region { rects }
    }

    pub fn subtract_with(&mut self, other: &Region) {
        *self = self.subtract(other);
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }
}

impl PartialEq for Region {
    /// Set equality over covered points, independent of rect decomposition.
    fn eq(&self, other: &Region) -> bool {
        self.subtract(other).is_empty() && other.subtract(self).is_empty()
    }
}

impl Eq for Region {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_operands_are_fine() {
        let e = Region::empty();
        let r = Region::rect(0, 0, 10, 10);
        assert!(e.union(&e).is_empty());
        assert!(e.intersect(&r).is_empty());
        assert!(e.subtract(&r).is_empty());
        assert_eq!(r.subtract(&e), r);
        assert_eq!(r.union(&e), r);
        assert!(Region::rect(5, 5, 0, 7).is_empty());
    }

    #[test]
    fn union_is_disjoint_and_counts_area_once() {
        let a = Region::rect(0, 0, 10, 10);
        let b = Region::rect(5, 5, 10, 10);
        let u = a.union(&b);
        assert_eq!(u.area(), 100 + 100 - 25);
        assert!(u.contains(12, 12));
        assert!(u.contains(0, 0));
        assert!(!u.contains(12, 0));
    }

    #[test]
    fn subtract_punches_holes() {
        let a = Region::rect(0, 0, 10, 10);
        let hole = Region::rect(2, 2, 4, 4);
        let d = a.subtract(&hole);
        assert_eq!(d.area(), 100 - 16);
        assert!(!d.contains(3, 3));
        assert!(d.contains(1, 1));
        assert!(d.contains(7, 7));
        // Punching the hole again changes nothing.
        assert_eq!(d.subtract(&hole), d);
    }

    #[test]
    fn intersect_of_disjoint_is_empty() {
        let a = Region::rect(0, 0, 5, 5);
        let b = Region::rect(5, 0, 5, 5);
        assert!(a.intersect(&b).is_empty());
    }

    #[test]
    fn translate_moves_all_rects() {
        let mut r = Region::from_rects([Rect::new(0, 0, 2, 2), Rect::new(4, 4, 2, 2)]);
        r.translate(10, -1);
        assert!(r.contains(10, -1));
        assert!(r.contains(15, 4));
        assert_eq!(r.area(), 8);
    }

    #[test]
    fn set_equality_ignores_decomposition() {
        let a = Region::from_rects([Rect::new(0, 0, 10, 5), Rect::new(0, 5, 10, 5)]);
        let b = Region::rect(0, 0, 10, 10);
        assert_eq!(a, b);
        assert_ne!(a, Region::rect(0, 0, 10, 9));
    }

    #[test]
    fn extents_cover_everything() {
        let r = Region::from_rects([Rect::new(-3, 2, 1, 1), Rect::new(7, -5, 2, 2)]);
        let e = r.extents();
        assert_eq!((e.x1, e.y1, e.x2, e.y2), (-3, -5, 9, 3));
    }
}
