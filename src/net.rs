use loam_chunk::{Chunk, Codec};
use loam_world::ChunkCoord;

/// Connection identity handed in by the transport layer.
pub type ClientId = u32;

/// Chunk-distance radius a client is interested in; the delivery layer
/// uses it to scope edit broadcasts.
pub const CHUNK_MAXDIST: i64 = 8;

/// What the engine knows about a connected client: which world it is
/// in and where, for proximity checks against unload candidates.
#[derive(Debug, Clone)]
pub struct ClientState {
    pub world: String,
    pub pos: [f32; 3],
}

impl ClientState {
    /// Chunk containing the client's position.
    pub fn chunk_pos(&self, chunk_bit: u32) -> ChunkCoord {
        ChunkCoord::of_voxel(
            self.pos[0].floor() as i32,
            self.pos[1].floor() as i32,
            self.pos[2].floor() as i32,
            chunk_bit,
        )
    }
}

/// Wire form of a chunk: content flags, the mutation counter for
/// staleness checks, and the compressed voxel blob (a single marker
/// byte for empty chunks, which need no payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    pub flags: u32,
    pub run: u32,
    pub voxels: Vec<u8>,
}

impl ChunkPayload {
    /// Build the outgoing payload for a chunk; the caller has already
    /// refreshed the pack cache.
    pub fn of_chunk(chunk: &Chunk) -> Self {
        let voxels = if chunk.is_empty() {
            vec![0]
        } else {
            chunk
                .packed()
                .expect("non-empty chunk delivered without a pack cache")
                .to_vec()
        };
        Self {
            flags: chunk.flags.bits(),
            run: chunk.run,
            voxels,
        }
    }

    /// Decode the voxel blob back into a dense buffer (client side).
    pub fn decode(&self, chunk_size: usize, codec: &dyn Codec) -> std::io::Result<Vec<u8>> {
        let volume = chunk_size * chunk_size * chunk_size;
        if self.flags & loam_chunk::ChunkFlags::EMPTY.bits() != 0 {
            return Ok(vec![0u8; volume]);
        }
        let mut out = Vec::new();
        codec.decompress(&self.voxels, &mut out)?;
        Ok(out)
    }
}

/// Outbound half of the network collaborator: the engine hands finished
/// chunks to it and never hears back.
pub trait ChunkSink {
    fn deliver_chunk(&mut self, client: ClientId, pos: ChunkCoord, payload: ChunkPayload);
}
