use fastnoise_lite::{FastNoiseLite, NoiseType};
use loam_blocks::{AIR, BlockId, BlockRegistry};

use crate::coord::ChunkCoord;
use crate::props::{TerrainKind, WorldProps};

/// Pluggable terrain fill. Writes one byte per voxel into `out`
/// (layout `(y + z*size)*size + x`) and reports whether any non-air
/// voxel was produced.
pub trait Generator {
    fn fill(
        &self,
        props: &WorldProps,
        coord: ChunkCoord,
        size: usize,
        reg: &BlockRegistry,
        out: &mut [u8],
    ) -> bool;
}

/// Stock generator: layered-soil flat worlds and simplex-noise normal
/// terrain with rock intrusions and cave carving.
#[derive(Debug, Default)]
pub struct NoiseGenerator;

/// Ground level both terrain kinds are centered on.
const BASE_HEIGHT: i32 = 256;

struct SoilIds {
    grass: BlockId,
    dirt: BlockId,
    tough_dirt: BlockId,
    rocky_dirt: BlockId,
    stone: BlockId,
    slate: BlockId,
}

impl SoilIds {
    fn resolve(reg: &BlockRegistry) -> Self {
        Self {
            grass: reg.id_or_air("grass"),
            dirt: reg.id_or_air("dirt"),
            tough_dirt: reg.id_or_air("tough_dirt"),
            rocky_dirt: reg.id_or_air("rocky_dirt"),
            stone: reg.id_or_air("stone"),
            slate: reg.id_or_air("slate"),
        }
    }

    /// Soil column by depth below the surface.
    #[inline]
    fn at(&self, gy: i32, height: i32) -> BlockId {
        if gy > height {
            AIR
        } else if gy == height {
            self.grass
        } else if gy < height - 64 {
            self.slate
        } else if gy < height - 32 {
            self.stone
        } else if gy < height - 16 {
            self.rocky_dirt
        } else if gy < height - 8 {
            self.tough_dirt
        } else {
            self.dirt
        }
    }
}

impl NoiseGenerator {
    fn noise(seed: i32) -> FastNoiseLite {
        let mut n = FastNoiseLite::with_seed(seed);
        n.set_noise_type(Some(NoiseType::OpenSimplex2));
        // Octave scaling is applied to the coordinates directly.
        n.set_frequency(Some(1.0));
        n
    }
}

impl Generator for NoiseGenerator {
    fn fill(
        &self,
        props: &WorldProps,
        coord: ChunkCoord,
        size: usize,
        reg: &BlockRegistry,
        out: &mut [u8],
    ) -> bool {
        debug_assert_eq!(out.len(), size * size * size);
        let soils = SoilIds::resolve(reg);
        let noise = Self::noise(props.seed);
        let base_x = coord.cx * size as i32;
        let base_y = coord.cy * size as i32;
        let base_z = coord.cz * size as i32;
        let mut populated = false;

        for x in 0..size {
            let gx = (base_x + x as i32) as f32;
            for z in 0..size {
                let gz = (base_z + z as i32) as f32;

                let (height, rock) = match props.kind {
                    TerrainKind::Flat => (BASE_HEIGHT, 0.0),
                    TerrainKind::Normal => {
                        let h = BASE_HEIGHT
                            + (noise.get_noise_2d(gx / 1000.0, gz / 1000.0) * 50.0
                                - noise.get_noise_2d(gx / 500.0, gz / 500.0) * 30.0
                                + noise.get_noise_2d(gx / 250.0, gz / 250.0) * 20.0
                                - noise.get_noise_2d(gx / 75.0, gz / 75.0) * 10.0
                                + noise.get_noise_2d(gx / 25.0, gz / 25.0) * 5.0)
                                .floor() as i32;
                        let r = noise.get_noise_2d(gx / 15.0, gz / 15.0) * 5.0
                            - noise.get_noise_2d(gx / 45.0, gz / 45.0).abs() * 10.0
                            - noise.get_noise_2d(gx / 25.0, gz / 25.0).abs() * 15.0;
                        (h, r)
                    }
                };

                for y in 0..size {
                    let gy = base_y + y as i32;
                    let mut val = soils.at(gy, height);

                    if props.kind == TerrainKind::Normal {
                        // Rock outcrops just above the soil line.
                        if gy > height - 2 && gy as f32 <= height as f32 + rock {
                            val = soils.stone;
                        }
                        // Cave carving.
                        if val != AIR {
                            let cave = noise
                                .get_noise_3d(gx / 45.0, gy as f32 / 45.0, gz / 45.0)
                                .abs();
                            if cave > 0.7 {
                                val = AIR;
                            }
                        }
                    }

                    if val != AIR {
                        out[(y + z * size) * size + x] = val;
                        populated = true;
                    }
                }
            }
        }
        populated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = 32;

    fn registry() -> BlockRegistry {
        BlockRegistry::from_toml_str(
            r#"
            [[blocks]]
            name = "air"
            solid = false
            [[blocks]]
            name = "grass"
            [[blocks]]
            name = "dirt"
            [[blocks]]
            name = "tough_dirt"
            [[blocks]]
            name = "rocky_dirt"
            [[blocks]]
            name = "stone"
            [[blocks]]
            name = "slate"
            "#,
        )
        .unwrap()
    }

    fn flat_props() -> WorldProps {
        WorldProps::flatland()
    }

    fn fill(props: &WorldProps, coord: ChunkCoord, reg: &BlockRegistry) -> (Vec<u8>, bool) {
        let mut out = vec![0u8; SIZE * SIZE * SIZE];
        let populated = NoiseGenerator.fill(props, coord, SIZE, reg, &mut out);
        (out, populated)
    }

    #[test]
    fn flat_surface_is_grass_at_ground_level() {
        let reg = registry();
        // Chunk row cy=8 spans world y 256..287: surface sits at its floor.
        let (out, populated) = fill(&flat_props(), ChunkCoord::new(0, 8, 0), &reg);
        assert!(populated);
        let grass = reg.id_by_name("grass").unwrap();
        let at = |x: usize, y: usize, z: usize| out[(y + z * SIZE) * SIZE + x];
        assert_eq!(at(0, 0, 0), grass);
        assert_eq!(at(17, 0, 9), grass);
        for y in 1..SIZE {
            assert_eq!(at(0, y, 0), AIR);
        }
    }

    #[test]
    fn flat_deep_chunk_is_solid_slate() {
        let reg = registry();
        let (out, populated) = fill(&flat_props(), ChunkCoord::new(0, 0, 0), &reg);
        assert!(populated);
        let slate = reg.id_by_name("slate").unwrap();
        assert!(out.iter().all(|&v| v == slate));
    }

    #[test]
    fn flat_sky_chunk_is_empty() {
        let reg = registry();
        let (out, populated) = fill(&flat_props(), ChunkCoord::new(0, 9, 0), &reg);
        assert!(!populated);
        assert!(out.iter().all(|&v| v == AIR));
    }

    #[test]
    fn normal_terrain_is_deterministic_per_seed() {
        let reg = registry();
        let props = WorldProps::default();
        let (a, pa) = fill(&props, ChunkCoord::new(0, 8, 0), &reg);
        let (b, pb) = fill(&props, ChunkCoord::new(0, 8, 0), &reg);
        assert_eq!(pa, pb);
        assert_eq!(a, b);

        let other = WorldProps {
            seed: 1,
            ..WorldProps::default()
        };
        let (c, _) = fill(&other, ChunkCoord::new(0, 8, 0), &reg);
        assert_ne!(a, c);
    }

    #[test]
    fn normal_high_altitude_is_empty() {
        let reg = registry();
        let (_, populated) = fill(&WorldProps::default(), ChunkCoord::new(0, 100, 0), &reg);
        assert!(!populated);
    }
}
