use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Stable handle to a layer slot. The generation changes every time the slot
/// is reused, so a handle to a freed layer never aliases a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerId {
    index: u32,
    generation: u32,
}

impl LayerId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the layer arena
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Handle to a pending (begun, not yet committed) undo entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle(pub(crate) u64);

/// Axis-aligned texel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Region covering a whole `width` x `height` texture
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exclusive right edge (saturating)
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge (saturating)
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// Whether the region lies entirely inside a `width` x `height` texture
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        let right = self.x.checked_add(self.width);
        let bottom = self.y.checked_add(self.height);
        matches!((right, bottom), (Some(r), Some(b)) if r <= width && b <= height)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Overlap of two regions, `None` when disjoint
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        (right > x && bottom > y).then(|| Region::new(x, y, right - x, bottom - y))
    }

    /// Smallest region covering both
    pub fn union(&self, other: &Region) -> Region {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Region::new(x, y, right - x, bottom - y)
    }

    pub fn texel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Byte size of the region's pixels at `texel_size` bytes per texel
    pub fn byte_len(&self, texel_size: u32) -> u64 {
        self.texel_count() * texel_size as u64
    }

    /// Split into the cells of a `tile_size` grid it touches, each clipped to the region
    pub fn tiles(&self, tile_size: u32) -> impl Iterator<Item = (TileCoord, Region)> + '_ {
        let tile_size = tile_size.max(1);
        let (tx0, ty0) = (self.x / tile_size, self.y / tile_size);
        let (tx1, ty1) = if self.is_empty() {
            (tx0, ty0)
        } else {
            (
                (self.right() - 1) / tile_size + 1,
                (self.bottom() - 1) / tile_size + 1,
            )
        };
        (ty0..ty1).flat_map(move |ty| {
            (tx0..tx1).filter_map(move |tx| {
                let cell = Region::new(tx * tile_size, ty * tile_size, tile_size, tile_size);
                cell.intersect(self).map(|clipped| (TileCoord { x: tx, y: ty }, clipped))
            })
        })
    }
}

/// Coordinates of a tile in a fixed grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
}

/// Blend modes shared by the brush and the layer compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum BlendMode {
    #[default]
    Over = 0,
    Replace = 1,
    Erase = 2,
    Add = 3,
    Multiply = 4,
}

/// Newtype over `u8` with named flag constants and set operations
macro_rules! dirty_mask {
    ($(#[$meta:meta])* $name:ident { $($(#[$bit_meta:meta])* $bit:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(u8);

        impl $name {
            $($(#[$bit_meta])* pub const $bit: Self = Self($value);)+
            pub const ALL: Self = Self(0 $(| $value)+);

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(self) -> u8 {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

dirty_mask! {
    /// Paint-side changes since the last frame
    SceneDirty {
        VIEW = 1 << 0,
        PROJECTION = 1 << 1,
        BRUSH = 1 << 2,
        /// Layer contents, order, visibility or blending changed
        LAYERS = 1 << 3,
    }
}

dirty_mask! {
    /// Render-side changes since the last frame
    RenderDirty {
        VIEW = 1 << 0,
        PROJECTION = 1 << 1,
        EXTENT = 1 << 2,
        MESH = 1 << 3,
        /// Raised by the paint engine after the paint texture was rewritten
        TEXTURE = 1 << 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_fits_within() {
        assert!(Region::new(0, 0, 16, 16).fits_within(16, 16));
        assert!(!Region::new(1, 0, 16, 16).fits_within(16, 16));
        assert!(!Region::new(u32::MAX, 0, 2, 1).fits_within(16, 16));
    }

    #[test]
    fn test_region_intersect() {
        let a = Region::new(0, 0, 10, 10);
        let b = Region::new(5, 8, 10, 10);
        assert_eq!(a.intersect(&b), Some(Region::new(5, 8, 5, 2)));
        assert_eq!(a.intersect(&Region::new(10, 0, 4, 4)), None);
    }

    #[test]
    fn test_region_union_ignores_empty() {
        let a = Region::new(2, 2, 2, 2);
        assert_eq!(a.union(&Region::default()), a);
        assert_eq!(a.union(&Region::new(6, 0, 1, 1)), Region::new(2, 0, 5, 4));
    }

    #[test]
    fn test_region_tiles() {
        let tiles: Vec<_> = Region::new(60, 0, 10, 4).tiles(64).collect();
        assert_eq!(tiles.len(), 2);
        assert_eq!(tiles[0], (TileCoord { x: 0, y: 0 }, Region::new(60, 0, 4, 4)));
        assert_eq!(tiles[1], (TileCoord { x: 1, y: 0 }, Region::new(64, 0, 6, 4)));
        assert_eq!(Region::new(3, 3, 0, 5).tiles(64).count(), 0);
    }

    #[test]
    fn test_dirty_mask() {
        let mut dirty = SceneDirty::empty();
        assert!(dirty.is_empty());
        dirty |= SceneDirty::BRUSH | SceneDirty::VIEW;
        assert!(dirty.contains(SceneDirty::BRUSH));
        assert!(!dirty.contains(SceneDirty::LAYERS));
        dirty.remove(SceneDirty::BRUSH);
        assert_eq!(dirty, SceneDirty::VIEW);
        assert_eq!(RenderDirty::ALL.bits(), 0b1_1111);
    }
}
