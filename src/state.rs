use hashbrown::HashMap;
use loam_chunk::{Chunk, ChunkStatus};
use loam_sched::{Tick, Timer};
use loam_world::{ChunkCoord, World};

/// A world plus its resident chunk map and sweep bookkeeping. The
/// counters track how many chunks sit on each side of the
/// active/cached divide without walking the map.
pub struct WorldState {
    pub world: World,
    pub chunks: HashMap<ChunkCoord, Chunk>,
    active_chunks: usize,
    cached_chunks: usize,
    /// Resume points so successive sweep firings cover the whole map
    /// over time instead of rescanning the same prefix.
    pub demote_cursor: usize,
    pub unload_cursor: usize,
    pub demote_timer: Timer,
    pub unload_timer: Timer,
}

impl WorldState {
    pub fn new(world: World, demote_interval: Tick, unload_interval: Tick) -> Self {
        Self {
            world,
            chunks: HashMap::new(),
            active_chunks: 0,
            cached_chunks: 0,
            demote_cursor: 0,
            unload_cursor: 0,
            demote_timer: Timer::new(demote_interval, true),
            unload_timer: Timer::new(unload_interval, true),
        }
    }

    #[inline]
    pub fn active_chunks(&self) -> usize {
        self.active_chunks
    }

    #[inline]
    pub fn cached_chunks(&self) -> usize {
        self.cached_chunks
    }

    /// Insert a freshly created or loaded chunk. Double insertion would
    /// corrupt the counters and means the request pipeline broke.
    pub fn insert_chunk(&mut self, chunk: Chunk) {
        assert_eq!(chunk.status(), ChunkStatus::Active, "insert of a non-active chunk");
        let prev = self.chunks.insert(chunk.coord, chunk);
        assert!(
            prev.is_none(),
            "chunk already resident at inserted position"
        );
        self.active_chunks += 1;
    }

    /// Remove a chunk from the map, fixing up whichever counter it was
    /// under.
    pub fn remove_chunk(&mut self, pos: ChunkCoord) -> Option<Chunk> {
        let chunk = self.chunks.remove(&pos)?;
        match chunk.status() {
            ChunkStatus::Active => self.active_chunks -= 1,
            ChunkStatus::Cached | ChunkStatus::Unloading => self.cached_chunks -= 1,
        }
        Some(chunk)
    }

    /// Record an Active -> Cached transition.
    #[inline]
    pub fn note_demoted(&mut self) {
        self.active_chunks -= 1;
        self.cached_chunks += 1;
    }

    /// Record a Cached/Unloading -> Active transition.
    #[inline]
    pub fn note_promoted(&mut self) {
        self.cached_chunks -= 1;
        self.active_chunks += 1;
    }
}
