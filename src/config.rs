use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use loam_region::RegionParams;
use loam_sched::{TICK_MINUTE, TICK_SECOND, Tick};
use serde::{Deserialize, Serialize};

/// Engine tuning, loadable from TOML. Defaults match the stock server:
/// 50 ms ticks, 4 KiB sectors, 16-chunk regions, 32-voxel chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    /// Wall-clock tick period, used only by the outer loop.
    pub tick_ms: u64,
    pub sector_size: usize,
    pub region_size: usize,
    pub chunk_size: usize,
    /// Active chunks idle this long become demotion candidates.
    pub demote_idle_ticks: Tick,
    /// Cached chunks idle this long become unload candidates.
    pub unload_idle_ticks: Tick,
    /// Chunk-distance radius inside which connected clients pin chunks
    /// in memory.
    pub unload_proximity: i64,
    pub demote_batch: usize,
    pub unload_batch: usize,
    pub demote_interval: Tick,
    pub unload_interval: Tick,
    /// Idle ticks before a cached region file handle is closed.
    pub region_open_ticks: Tick,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            tick_ms: 50,
            sector_size: 4096,
            region_size: 16,
            chunk_size: 32,
            demote_idle_ticks: TICK_MINUTE,
            unload_idle_ticks: TICK_MINUTE * 10,
            unload_proximity: 12,
            demote_batch: 100,
            unload_batch: 50,
            demote_interval: TICK_SECOND * 5,
            unload_interval: TICK_SECOND * 30,
            region_open_ticks: TICK_MINUTE * 10,
        }
    }
}

impl ServerConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, Box<dyn Error>> {
        let text = fs::read_to_string(path)?;
        let cfg: ServerConfig = toml::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.region_params().validate()?;
        if !self.chunk_size.is_power_of_two() || self.chunk_size < 2 {
            return Err(format!(
                "chunk_size {} must be a power of two >= 2",
                self.chunk_size
            ));
        }
        if self.tick_ms == 0 {
            return Err("tick_ms must be nonzero".to_string());
        }
        if self.demote_batch == 0 || self.unload_batch == 0 {
            return Err("sweep batch sizes must be nonzero".to_string());
        }
        Ok(())
    }

    #[inline]
    pub fn chunk_bit(&self) -> u32 {
        self.chunk_size.trailing_zeros()
    }

    #[inline]
    pub fn chunk_volume(&self) -> usize {
        self.chunk_size * self.chunk_size * self.chunk_size
    }

    pub fn region_params(&self) -> RegionParams {
        RegionParams {
            sector_size: self.sector_size,
            region_size: self.region_size,
            open_ticks: self.region_open_ticks,
        }
    }
}
