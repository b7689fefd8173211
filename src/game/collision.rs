//! Map collision layout
//!
//! A placement is legal when the character's body rectangle lies fully inside
//! the map bounds and overlaps no wall.

use serde::{Deserialize, Serialize};

use crate::game::ids::MapId;
use crate::game::region::{Rect, Vector2};

/// Static geometry of a map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapLayout {
    pub id: MapId,
    #[serde(default)]
    pub name: String,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub walls: Vec<Rect>,
}

impl MapLayout {
    /// Empty map of the given size
    pub fn new(id: MapId, width: f32, height: f32) -> Self {
        Self {
            id,
            name: format!("Map {}", id),
            width,
            height,
            walls: Vec::new(),
        }
    }

    pub fn with_wall(mut self, wall: Rect) -> Self {
        self.walls.push(wall);
        self
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0.0, 0.0, self.width, self.height)
    }

    /// Whether a body of `size` may stand at `position`
    pub fn is_legal_position(&self, position: Vector2, size: Vector2) -> bool {
        if !position.is_finite() {
            return false;
        }

        let body = Rect::at(position, size);
        self.bounds().contains_rect(&body) && !self.walls.iter().any(|w| w.intersects(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> MapLayout {
        MapLayout::new(MapId::new(1), 200.0, 200.0).with_wall(Rect::new(50.0, 50.0, 20.0, 20.0))
    }

    #[test]
    fn test_open_position_is_legal() {
        assert!(layout().is_legal_position(Vector2::new(0.0, 0.0), Vector2::new(16.0, 16.0)));
    }

    #[test]
    fn test_wall_blocks_position() {
        assert!(!layout().is_legal_position(Vector2::new(45.0, 45.0), Vector2::new(16.0, 16.0)));
    }

    #[test]
    fn test_out_of_bounds_is_illegal() {
        let map = layout();
        assert!(!map.is_legal_position(Vector2::new(190.0, 10.0), Vector2::new(16.0, 16.0)));
        assert!(!map.is_legal_position(Vector2::new(-1.0, 10.0), Vector2::new(16.0, 16.0)));
        assert!(!map.is_legal_position(Vector2::new(f32::NAN, 10.0), Vector2::new(16.0, 16.0)));
    }
}
