//! Chunk storage and streaming core: region persistence, the chunk
//! lifecycle state machine, and the tick-synchronized queue scheduler.
#![forbid(unsafe_code)]

pub mod config;
pub mod net;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use net::{ChunkPayload, ChunkSink, ClientId, ClientState};
pub use server::{Server, ServerStats, WorldStats};
pub use state::WorldState;
