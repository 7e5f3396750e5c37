//! Math types.
//!
//! This module intentionally stays small and deterministic.
//! The simulation is planar, so everything here is 2D.

use serde::{Deserialize, Serialize};

/// World units per tile.
pub const TILE_SIZE: f32 = 8.0;

/// 2D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn len(self) -> f32 {
        self.len_sq().sqrt()
    }

    pub fn dst(self, other: Self) -> f32 {
        (self - other).len()
    }

    /// Clamps the magnitude to `max`, keeping direction.
    pub fn limit(self, max: f32) -> Self {
        let len_sq = self.len_sq();
        if len_sq > max * max && len_sq > 0.0 {
            let scale = max / len_sq.sqrt();
            Self::new(self.x * scale, self.y * scale)
        } else {
            self
        }
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(self.x + (to.x - self.x) * t, self.y + (to.y - self.y) * t)
    }
}

impl std::ops::Add for Vec2 {
    type Output = Vec2;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Axis-aligned rectangle, stored as its bottom-left corner and size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    /// Builds a rectangle of the given size centered on `(cx, cy)`.
    pub fn centered(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self {
            x: cx - width / 2.0,
            y: cy - height / 2.0,
            width,
            height,
        }
    }

    pub fn contains(&self, p: Vec2) -> bool {
        p.x >= self.x && p.x <= self.x + self.width && p.y >= self.y && p.y <= self.y + self.height
    }
}

/// Packs tile coordinates into a single position key.
pub fn pack_pos(x: u16, y: u16) -> u32 {
    ((x as u32) << 16) | y as u32
}

/// Inverse of [`pack_pos`].
pub fn unpack_pos(pos: u32) -> (u16, u16) {
    ((pos >> 16) as u16, (pos & 0xFFFF) as u16)
}
