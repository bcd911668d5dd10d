//! Chunk voxel storage and lifecycle state machine.
#![forbid(unsafe_code)]

mod codec;

use std::io;

use bitflags::bitflags;
use loam_world::ChunkCoord;

pub use codec::{Codec, ZlibCodec};

bitflags! {
    /// Chunk content flags, shared with the wire payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChunkFlags: u32 {
        /// No non-air voxel anywhere in the chunk.
        const EMPTY = 1;
        /// No air voxel anywhere in the chunk.
        const FULL = 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Voxel buffer resident and mutable.
    Active = 1,
    /// Buffer discarded; only the compressed cache is retained.
    Cached = 2,
    /// Queued for removal from the world map.
    Unloading = 3,
}

/// The unit of world data: a dense `size^3` voxel buffer plus its
/// compressed cache and lifecycle bookkeeping.
///
/// The chunk does not know its owning world; callers resolve that
/// through the server's world registry by name.
#[derive(Debug)]
pub struct Chunk {
    pub coord: ChunkCoord,
    size: usize,
    voxels: Option<Vec<u8>>,
    packed: Option<Vec<u8>>,
    pub flags: ChunkFlags,
    /// Mutation counter; the pack cache is valid only while `cache_run`
    /// agrees with it.
    pub run: u32,
    cache_run: Option<u32>,
    /// Tick of the last status change or edit.
    pub time: u64,
    /// Set while a save for this chunk sits in a queue, deduplicating
    /// repeated save requests.
    pub awaiting_save: bool,
    status: ChunkStatus,
}

impl Chunk {
    /// Fresh chunk with a zeroed buffer, flagged empty until a fill or
    /// edit says otherwise.
    pub fn new(coord: ChunkCoord, size: usize, now: u64) -> Self {
        Self {
            coord,
            size,
            voxels: Some(vec![0u8; size * size * size]),
            packed: None,
            flags: ChunkFlags::EMPTY,
            run: 0,
            cache_run: None,
            time: now,
            awaiting_save: false,
            status: ChunkStatus::Active,
        }
    }

    /// Chunk rebuilt from a region file's compressed payload. The blob
    /// is kept as the pack cache so the first demotion needs no
    /// recompression.
    pub fn from_packed(
        coord: ChunkCoord,
        size: usize,
        blob: Vec<u8>,
        codec: &dyn Codec,
        now: u64,
    ) -> io::Result<Self> {
        let mut voxels = Vec::new();
        codec.decompress(&blob, &mut voxels)?;
        if voxels.len() != size * size * size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "chunk {} payload decodes to {} bytes, expected {}",
                    coord,
                    voxels.len(),
                    size * size * size
                ),
            ));
        }
        Ok(Self {
            coord,
            size,
            voxels: Some(voxels),
            packed: Some(blob),
            flags: ChunkFlags::empty(),
            run: 0,
            cache_run: Some(0),
            time: now,
            awaiting_save: false,
            status: ChunkStatus::Active,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.flags.contains(ChunkFlags::EMPTY)
    }

    #[inline]
    pub fn packed(&self) -> Option<&[u8]> {
        self.packed.as_deref()
    }

    #[inline]
    fn idx(&self, x: usize, y: usize, z: usize) -> usize {
        (y + z * self.size) * self.size + x
    }

    /// Voxel value at local coordinates; `None` while demoted.
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<u8> {
        self.voxels.as_ref().map(|v| v[self.idx(x, y, z)])
    }

    /// Mutable view of the voxel buffer for the generator fill.
    #[inline]
    pub fn voxels_mut(&mut self) -> Option<&mut [u8]> {
        self.voxels.as_deref_mut()
    }

    /// Record the outcome of a generator fill.
    pub fn mark_generated(&mut self, populated: bool) {
        if populated {
            self.flags.remove(ChunkFlags::EMPTY);
        } else {
            self.flags.insert(ChunkFlags::EMPTY);
        }
    }

    /// Refresh the compressed cache from the buffer. No-op (`false`)
    /// when the chunk is flagged empty, the cache already reflects the
    /// current run, or no buffer is resident.
    pub fn pack(&mut self, codec: &dyn Codec) -> io::Result<bool> {
        if self.is_empty() || self.cache_run == Some(self.run) {
            return Ok(false);
        }
        let Some(voxels) = self.voxels.as_ref() else {
            return Ok(false);
        };
        let mut out = self.packed.take().unwrap_or_default();
        codec.compress(voxels, &mut out)?;
        self.packed = Some(out);
        self.cache_run = Some(self.run);
        Ok(true)
    }

    /// Rebuild the voxel buffer from the cache (or zeroes when flagged
    /// empty). A non-empty chunk with no cache is a state-machine
    /// violation, not a recoverable condition.
    pub fn unpack(&mut self, codec: &dyn Codec) -> io::Result<()> {
        assert!(
            self.packed.is_some() || self.is_empty(),
            "chunk {} has no cache to unpack (flags={:?} run={} cache_run={:?})",
            self.coord,
            self.flags,
            self.run,
            self.cache_run,
        );
        if self.is_empty() {
            let volume = self.size * self.size * self.size;
            match self.voxels.as_mut() {
                Some(v) => {
                    v.clear();
                    v.resize(volume, 0);
                }
                None => self.voxels = Some(vec![0u8; volume]),
            }
            return Ok(());
        }
        let blob = self.packed.as_ref().expect("checked above");
        let mut out = self.voxels.take().unwrap_or_default();
        codec.decompress(blob, &mut out)?;
        self.voxels = Some(out);
        Ok(())
    }

    /// Promote back to Active, rebuilding the buffer if it was
    /// discarded. Returns true when a transition happened.
    pub fn activate(&mut self, now: u64, codec: &dyn Codec) -> io::Result<bool> {
        match self.status {
            ChunkStatus::Active => Ok(false),
            ChunkStatus::Cached | ChunkStatus::Unloading => {
                if self.voxels.is_none() {
                    self.unpack(codec)?;
                }
                self.status = ChunkStatus::Active;
                self.time = now;
                Ok(true)
            }
        }
    }

    /// Demote to Cached, dropping the voxel buffer. The pack step runs
    /// first to refresh a stale cache; demotion is skipped when packing
    /// errors out or the chunk would have nothing to resurrect from.
    pub fn demote(&mut self, now: u64, codec: &dyn Codec) -> io::Result<bool> {
        if self.status != ChunkStatus::Active {
            return Ok(false);
        }
        self.pack(codec)?;
        if self.packed.is_none() && !self.is_empty() {
            return Ok(false);
        }
        self.voxels = None;
        self.status = ChunkStatus::Cached;
        self.time = now;
        Ok(true)
    }

    /// Flag for deferred removal.
    pub fn mark_unloading(&mut self) {
        self.status = ChunkStatus::Unloading;
    }

    /// Mutate one voxel. Forces the chunk Active, clears the content
    /// flags, and invalidates the pack cache by bumping `run`.
    pub fn edit(
        &mut self,
        x: usize,
        y: usize,
        z: usize,
        value: u8,
        now: u64,
        codec: &dyn Codec,
    ) -> io::Result<()> {
        self.activate(now, codec)?;
        self.flags = ChunkFlags::empty();
        self.run = self.run.wrapping_add(1);
        self.time = now;
        let idx = self.idx(x, y, z);
        let voxels = self.voxels.as_mut().expect("active chunk has a buffer");
        voxels[idx] = value;
        Ok(())
    }
}
