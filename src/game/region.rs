//! Map-space geometry
//!
//! - `Vector2` positions and velocities in map-local units
//! - `Rect` bodies and walls for collision checks
//! - `SpawnRegion` rectangles that bound where a spawner may place NPCs

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::game::ids::MapId;

/// A 2D position or direction in map units
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector2 {
    pub x: f32,
    pub y: f32,
}

impl Vector2 {
    pub const ZERO: Vector2 = Vector2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Unit vector in the same direction, or zero for a zero vector
    pub fn normalized(&self) -> Vector2 {
        let len = self.length();
        if len <= f32::EPSILON {
            Vector2::ZERO
        } else {
            Vector2::new(self.x / len, self.y / len)
        }
    }

    pub fn scale(&self, factor: f32) -> Vector2 {
        Vector2::new(self.x * factor, self.y * factor)
    }

    pub fn add(&self, other: Vector2) -> Vector2 {
        Vector2::new(self.x + other.x, self.y + other.y)
    }

    pub fn distance_to(&self, other: &Vector2) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl fmt::Display for Vector2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Axis-aligned rectangle with its origin at the top-left corner
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle of `size` placed at `position`
    pub fn at(position: Vector2, size: Vector2) -> Self {
        Self::new(position.x, position.y, size.x, size.y)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Whether the interiors overlap. Touching edges do not count.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Whether `other` lies entirely inside this rectangle
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// Rectangular area of a map in which a spawner places its NPCs.
///
/// Coordinates are whole map units. Random positions are drawn uniformly
/// from `[left, left + width] x [top, top + height]`, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRegion {
    /// Map this region was declared for
    pub map: MapId,
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl SpawnRegion {
    pub fn new(map: MapId, left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            map,
            left,
            top,
            width,
            height,
        }
    }

    /// Right edge, inclusive. Computed in `i64` so no width can wrap it.
    pub fn right(&self) -> i64 {
        i64::from(self.left) + i64::from(self.width)
    }

    /// Bottom edge, inclusive
    pub fn bottom(&self) -> i64 {
        i64::from(self.top) + i64::from(self.height)
    }

    /// Whether every edge fits in map coordinates
    pub fn is_valid(&self) -> bool {
        self.right() <= i64::from(i32::MAX) && self.bottom() <= i64::from(i32::MAX)
    }

    /// Whether `position` is inside the region, edges included
    pub fn contains(&self, position: Vector2) -> bool {
        position.x >= self.left as f32
            && position.x <= self.right() as f32
            && position.y >= self.top as f32
            && position.y <= self.bottom() as f32
    }

    /// Draw a uniformly distributed whole-unit position inside the region
    pub fn random_position<R: Rng + ?Sized>(&self, rng: &mut R) -> Vector2 {
        let x = rng.gen_range(i64::from(self.left)..=self.right());
        let y = rng.gen_range(i64::from(self.top)..=self.bottom());
        Vector2::new(x as f32, y as f32)
    }
}

impl fmt::Display for SpawnRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "map {} [{}, {}, {}x{}]",
            self.map, self.left, self.top, self.width, self.height
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_rect_intersects() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(5.0, 5.0, 10.0, 10.0);
        let c = Rect::new(10.0, 0.0, 10.0, 10.0);

        assert!(a.intersects(&b));
        assert!(!a.intersects(&c), "touching edges should not intersect");
    }

    #[test]
    fn test_rect_contains() {
        let outer = Rect::new(0.0, 0.0, 100.0, 100.0);
        assert!(outer.contains_rect(&Rect::new(90.0, 90.0, 10.0, 10.0)));
        assert!(!outer.contains_rect(&Rect::new(95.0, 90.0, 10.0, 10.0)));
    }

    #[test]
    fn test_random_position_within_bounds() {
        let region = SpawnRegion::new(MapId::new(1), 10, 20, 5, 3);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..500 {
            let pos = region.random_position(&mut rng);
            assert!(region.contains(pos), "{} outside {}", pos, region);
            assert_eq!(pos.x.fract(), 0.0);
            assert_eq!(pos.y.fract(), 0.0);
        }
    }

    #[test]
    fn test_random_position_reaches_edges() {
        let region = SpawnRegion::new(MapId::new(1), 0, 0, 2, 2);
        let mut rng = StdRng::seed_from_u64(11);
        let mut seen_right = false;
        let mut seen_left = false;

        for _ in 0..200 {
            let pos = region.random_position(&mut rng);
            seen_left |= pos.x == 0.0;
            seen_right |= pos.x == 2.0;
        }

        assert!(seen_left && seen_right, "both inclusive edges should be drawn");
    }

    #[test]
    fn test_zero_sized_region() {
        let region = SpawnRegion::new(MapId::new(1), 4, 9, 0, 0);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(region.random_position(&mut rng), Vector2::new(4.0, 9.0));
    }

    #[test]
    fn test_region_edges_do_not_wrap() {
        let wide = SpawnRegion::new(MapId::new(1), 0, 0, 3_000_000_000, 10);
        assert_eq!(wide.right(), 3_000_000_000);
        assert!(!wide.is_valid());

        // Still draws inside the region instead of panicking on an empty range
        let mut rng = StdRng::seed_from_u64(3);
        let pos = wide.random_position(&mut rng);
        assert!(pos.x >= 0.0 && pos.y <= 10.0);

        let edge = SpawnRegion::new(MapId::new(1), i32::MAX - 5, 0, 5, 5);
        assert!(edge.is_valid());
        assert_eq!(edge.right(), i64::from(i32::MAX));
        assert!(!SpawnRegion::new(MapId::new(1), i32::MAX - 5, 0, 6, 5).is_valid());
    }

    #[test]
    fn test_vector_normalized() {
        let v = Vector2::new(3.0, 4.0).normalized();
        assert!((v.length() - 1.0).abs() < 1e-6);
        assert_eq!(Vector2::ZERO.normalized(), Vector2::ZERO);
    }
}
