use std::fmt;

use serde::{Deserialize, Serialize};

/// World-space chunk position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub cx: i32,
    pub cy: i32,
    pub cz: i32,
}

impl ChunkCoord {
    #[inline]
    pub const fn new(cx: i32, cy: i32, cz: i32) -> Self {
        Self { cx, cy, cz }
    }

    /// Chunk containing the given voxel, for a power-of-two chunk size
    /// given as its bit width. Arithmetic shift keeps negative voxel
    /// coordinates in the right chunk.
    #[inline]
    pub const fn of_voxel(wx: i32, wy: i32, wz: i32, chunk_bit: u32) -> Self {
        Self {
            cx: wx >> chunk_bit,
            cy: wy >> chunk_bit,
            cz: wz >> chunk_bit,
        }
    }

    #[inline]
    pub fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self {
            cx: self.cx + dx,
            cy: self.cy + dy,
            cz: self.cz + dz,
        }
    }

    #[inline]
    pub fn distance_sq(self, other: ChunkCoord) -> i64 {
        let dx = i64::from(self.cx - other.cx);
        let dy = i64::from(self.cy - other.cy);
        let dz = i64::from(self.cz - other.cz);
        dx * dx + dy * dy + dz * dz
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.cx, self.cy, self.cz)
    }
}

impl From<(i32, i32, i32)> for ChunkCoord {
    fn from(value: (i32, i32, i32)) -> Self {
        Self::new(value.0, value.1, value.2)
    }
}

/// Position of a region: a cube of chunks sharing one on-disk file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionCoord {
    pub rx: i32,
    pub ry: i32,
    pub rz: i32,
}

impl RegionCoord {
    /// Region containing the given chunk, for a power-of-two region size
    /// given as its bit width.
    #[inline]
    pub const fn of_chunk(pos: ChunkCoord, region_bit: u32) -> Self {
        Self {
            rx: pos.cx >> region_bit,
            ry: pos.cy >> region_bit,
            rz: pos.cz >> region_bit,
        }
    }
}

impl fmt::Display for RegionCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.rx, self.ry, self.rz)
    }
}
