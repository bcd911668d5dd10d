//! Sector-addressed region files: the on-disk home of a cube of chunks.
//!
//! Layout per file: a zero-initialized header of `region_size^3` 16-bit
//! big-endian slots (rounded up to whole sectors), then one sector per
//! stored chunk payload. A slot holds 0 (absent), 1 (chunk known empty,
//! no payload), or `n >= 2` meaning the payload lives at data sector
//! `n - 2`. Payloads are a 4-byte big-endian length prefix plus the
//! compressed blob, zero-padded to exactly one sector. Files only ever
//! grow; sectors are never reclaimed or compacted.
#![forbid(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use loam_world::{ChunkCoord, RegionCoord};
use thiserror::Error;

/// Header slot marker for a chunk known to be entirely empty.
const SLOT_EMPTY: u16 = 1;
/// First slot value that addresses a stored payload.
const SLOT_DATA_BASE: u16 = 2;

#[derive(Debug, Error)]
pub enum RegionError {
    /// Creating a region that is already on disk. Programmer error.
    #[error("region {path} already exists")]
    AlreadyExists { path: PathBuf },
    /// Querying a region that was never created. Programmer error.
    #[error("region {path} does not exist")]
    Missing { path: PathBuf },
    /// Pulling a chunk whose slot stores no payload. Programmer error.
    #[error("chunk {pos} slot holds {slot}, no payload stored")]
    NoPayload { pos: ChunkCoord, slot: u16 },
    /// Payload too large for the single-sector framing.
    #[error("payload of {len} bytes exceeds sector capacity of {cap}")]
    Capacity { len: usize, cap: usize },
    /// Length prefix on disk is impossible for this format.
    #[error("corrupt payload length {len} in {path}")]
    Corrupt { path: PathBuf, len: u32 },
    /// All 65534 addressable data sectors in use.
    #[error("region {path} is out of addressable sectors")]
    Full { path: PathBuf },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RegionError {
    /// True for errors that indicate a broken state machine rather than
    /// a runtime condition; callers should treat these as fatal.
    pub fn is_invariant(&self) -> bool {
        matches!(
            self,
            RegionError::AlreadyExists { .. }
                | RegionError::Missing { .. }
                | RegionError::NoPayload { .. }
        )
    }
}

/// Geometry and handle-cache tuning for region files.
#[derive(Debug, Clone, Copy)]
pub struct RegionParams {
    /// Allocation unit within a file, bytes.
    pub sector_size: usize,
    /// Chunks per region edge; a region holds `region_size^3` slots.
    pub region_size: usize,
    /// Idle ticks before a cached file handle is closed.
    pub open_ticks: u64,
}

impl Default for RegionParams {
    fn default() -> Self {
        Self {
            sector_size: 4096,
            region_size: 16,
            open_ticks: 12_000,
        }
    }
}

impl RegionParams {
    pub fn validate(&self) -> Result<(), String> {
        if !self.sector_size.is_power_of_two() || self.sector_size < 16 {
            return Err(format!("sector_size {} must be a power of two >= 16", self.sector_size));
        }
        if !self.region_size.is_power_of_two() || self.region_size < 2 {
            return Err(format!("region_size {} must be a power of two >= 2", self.region_size));
        }
        Ok(())
    }

    #[inline]
    pub fn header_size(&self) -> usize {
        self.region_size * self.region_size * self.region_size * 2
    }

    /// Sectors reserved for the header, rounding up.
    #[inline]
    pub fn header_sectors(&self) -> usize {
        self.header_size().div_ceil(self.sector_size)
    }

    #[inline]
    pub fn region_bit(&self) -> u32 {
        self.region_size.trailing_zeros()
    }

    /// Largest payload the single-sector framing can hold.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.sector_size - 4
    }

    /// Byte offset of the header slot for the chunk's region-local
    /// position.
    #[inline]
    fn slot_offset(&self, pos: ChunkCoord) -> u64 {
        let clip = (self.region_size - 1) as i32;
        let rs = self.region_size as u64;
        let lx = (pos.cx & clip) as u64;
        let ly = (pos.cy & clip) as u64;
        let lz = (pos.cz & clip) as u64;
        2 * ((ly + lz * rs) * rs + lx)
    }

    /// Byte offset of the data sector a slot value addresses.
    #[inline]
    fn sector_offset(&self, slot: u16) -> u64 {
        ((slot - SLOT_DATA_BASE) as u64 + self.header_sectors() as u64) * self.sector_size as u64
    }
}

struct RegionHandle {
    file: File,
    /// Data sectors present (excludes the header), tracked to avoid a
    /// stat on every append.
    sectors: u32,
    /// Tick past which the handle is closed by `close_idle`.
    deadline: u64,
}

/// Open-file table plus the sector-level read/write operations. No
/// standalone per-region object exists; everything is keyed by path.
pub struct RegionFiles {
    params: RegionParams,
    handles: HashMap<PathBuf, RegionHandle>,
}

impl RegionFiles {
    pub fn new(params: RegionParams) -> Self {
        Self {
            params,
            handles: HashMap::new(),
        }
    }

    #[inline]
    pub fn params(&self) -> &RegionParams {
        &self.params
    }

    /// Path of the region file covering a chunk position.
    pub fn path(&self, regions_dir: &Path, pos: ChunkCoord) -> PathBuf {
        let rc = RegionCoord::of_chunk(pos, self.params.region_bit());
        regions_dir.join(format!("r_{rc}"))
    }

    pub fn exists(&self, regions_dir: &Path, pos: ChunkCoord) -> bool {
        let path = self.path(regions_dir, pos);
        self.handles.contains_key(&path) || path.is_file()
    }

    /// Create the region file covering `pos` with a zeroed header.
    /// Creating a region twice is a state-machine violation.
    pub fn create(&mut self, regions_dir: &Path, pos: ChunkCoord) -> Result<(), RegionError> {
        let path = self.path(regions_dir, pos);
        if self.exists(regions_dir, pos) {
            return Err(RegionError::AlreadyExists { path });
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&vec![0u8; self.params.header_size()])?;
        file.sync_data()?;
        Ok(())
    }

    /// Header slot value for `pos`. The region file must exist.
    pub fn query(
        &mut self,
        regions_dir: &Path,
        pos: ChunkCoord,
        now: u64,
    ) -> Result<u16, RegionError> {
        let offset = self.params.slot_offset(pos);
        let handle = self.handle(regions_dir, pos, now)?;
        handle.file.seek(SeekFrom::Start(offset))?;
        let mut slot = [0u8; 2];
        handle.file.read_exact(&mut slot)?;
        Ok(u16::from_be_bytes(slot))
    }

    /// Read the raw compressed payload stored for `pos`. The slot must
    /// address a data sector.
    pub fn pull(
        &mut self,
        regions_dir: &Path,
        pos: ChunkCoord,
        now: u64,
    ) -> Result<Vec<u8>, RegionError> {
        let slot = self.query(regions_dir, pos, now)?;
        if slot < SLOT_DATA_BASE {
            return Err(RegionError::NoPayload { pos, slot });
        }
        let offset = self.params.sector_offset(slot);
        let max = self.params.max_payload();
        let path = self.path(regions_dir, pos);
        let handle = self.handle(regions_dir, pos, now)?;
        handle.file.seek(SeekFrom::Start(offset))?;
        let mut len_buf = [0u8; 4];
        handle.file.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf);
        if len as usize > max {
            return Err(RegionError::Corrupt { path, len });
        }
        let mut payload = vec![0u8; len as usize];
        handle.file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Store a chunk at `pos`: `None` records the empty marker in the
    /// header alone; `Some` writes a payload sector, appending on first
    /// store and overwriting in place thereafter.
    pub fn push(
        &mut self,
        regions_dir: &Path,
        pos: ChunkCoord,
        payload: Option<&[u8]>,
        now: u64,
    ) -> Result<(), RegionError> {
        let slot = self.query(regions_dir, pos, now)?;
        let slot_offset = self.params.slot_offset(pos);

        let Some(bytes) = payload else {
            // Chunk is empty: the header marker is the whole record. A
            // previously written sector stays orphaned; the file never
            // shrinks.
            let handle = self.handle(regions_dir, pos, now)?;
            handle.file.seek(SeekFrom::Start(slot_offset))?;
            handle.file.write_all(&SLOT_EMPTY.to_be_bytes())?;
            return Ok(());
        };

        if bytes.len() > self.params.max_payload() {
            return Err(RegionError::Capacity {
                len: bytes.len(),
                cap: self.params.max_payload(),
            });
        }
        let sector = self.prepare_sector(bytes);

        if slot >= SLOT_DATA_BASE {
            // Overwrite the existing sector in place.
            let offset = self.params.sector_offset(slot);
            let handle = self.handle(regions_dir, pos, now)?;
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.write_all(&sector)?;
            return Ok(());
        }

        // First store: append a fresh sector and record it.
        let path = self.path(regions_dir, pos);
        let handle = self.handle(regions_dir, pos, now)?;
        let new_slot = u64::from(SLOT_DATA_BASE) + u64::from(handle.sectors);
        if new_slot > u64::from(u16::MAX) {
            return Err(RegionError::Full { path });
        }
        handle.file.seek(SeekFrom::End(0))?;
        handle.file.write_all(&sector)?;
        handle.sectors += 1;
        handle.file.seek(SeekFrom::Start(slot_offset))?;
        handle.file.write_all(&(new_slot as u16).to_be_bytes())?;
        Ok(())
    }

    /// Data sectors currently stored for the region covering `pos`.
    pub fn data_sectors(
        &mut self,
        regions_dir: &Path,
        pos: ChunkCoord,
        now: u64,
    ) -> Result<u32, RegionError> {
        Ok(self.handle(regions_dir, pos, now)?.sectors)
    }

    /// Close handles whose idle deadline has passed. Run once per tick.
    pub fn close_idle(&mut self, now: u64) {
        self.handles.retain(|path, handle| {
            let keep = handle.deadline > now;
            if !keep {
                log::debug!("closing idle region file {}", path.display());
            }
            keep
        });
    }

    /// Drop every cached handle (shutdown).
    pub fn close_all(&mut self) {
        self.handles.clear();
    }

    #[inline]
    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    /// Fetch or open the cached handle, pushing out its idle deadline.
    fn handle(
        &mut self,
        regions_dir: &Path,
        pos: ChunkCoord,
        now: u64,
    ) -> Result<&mut RegionHandle, RegionError> {
        let path = self.path(regions_dir, pos);
        if !self.handles.contains_key(&path) {
            let file = match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(RegionError::Missing { path });
                }
                Err(e) => return Err(e.into()),
            };
            let len = fs::metadata(&path)?.len();
            let total = (len / self.params.sector_size as u64) as u32;
            let sectors = total.saturating_sub(self.params.header_sectors() as u32);
            self.handles.insert(
                path.clone(),
                RegionHandle {
                    file,
                    sectors,
                    deadline: 0,
                },
            );
        }
        let handle = self.handles.get_mut(&path).expect("just inserted");
        handle.deadline = now + self.params.open_ticks;
        Ok(handle)
    }

    /// One full sector: length prefix, payload, zero padding.
    fn prepare_sector(&self, payload: &[u8]) -> Vec<u8> {
        let mut sector = vec![0u8; self.params.sector_size];
        sector[..4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        sector[4..4 + payload.len()].copy_from_slice(payload);
        sector
    }
}
