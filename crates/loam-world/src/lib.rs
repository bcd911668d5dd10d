//! World identity, persisted properties, and terrain generation.
#![forbid(unsafe_code)]

mod coord;
mod generator;
mod props;
mod world;

pub use coord::{ChunkCoord, RegionCoord};
pub use generator::{Generator, NoiseGenerator};
pub use props::{TerrainKind, WorldProps};
pub use world::World;
