use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use loam::{ChunkPayload, ChunkSink, ClientId, Server, ServerConfig};
use loam_blocks::BlockRegistry;
use loam_world::{ChunkCoord, WorldProps};

#[derive(Parser, Debug)]
#[command(name = "loam", about = "Voxel world storage and streaming server core")]
struct Args {
    /// Directory holding worlds and their region files.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    /// Server config TOML; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Block table TOML.
    #[arg(long, default_value = "assets/blocks.toml")]
    blocks: PathBuf,
    /// Run a fixed number of ticks, flush, and exit.
    #[arg(long)]
    ticks: Option<u64>,
}

/// Stand-in delivery target until a transport is wired up.
struct LogSink;

impl ChunkSink for LogSink {
    fn deliver_chunk(&mut self, client: ClientId, pos: ChunkCoord, payload: ChunkPayload) {
        log::debug!(
            "chunk {pos} -> client {client} ({} bytes, run {})",
            payload.voxels.len(),
            payload.run
        );
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut cfg = match &args.config {
        Some(path) => ServerConfig::load_from_path(path)?,
        None => ServerConfig::default(),
    };
    cfg.data_dir = args.data_dir;

    let registry = BlockRegistry::load_from_path(&args.blocks)?;
    let period = Duration::from_millis(cfg.tick_ms);
    let mut server = Server::new(cfg, registry)?;
    server.add_world(WorldProps::default())?;
    server.add_world(WorldProps::flatland())?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))?;
    }

    let mut sink = LogSink;
    log::info!("ticking every {} ms", period.as_millis());
    run_loop(&mut server, &mut sink, period, args.ticks, &stop);
    Ok(())
}

/// Tick until the budget runs out or an interrupt asks for a stop,
/// then flush pending saves and persist world properties.
fn run_loop(
    server: &mut Server,
    sink: &mut dyn ChunkSink,
    period: Duration,
    ticks: Option<u64>,
    stop: &AtomicBool,
) {
    let mut remaining = ticks;
    loop {
        if stop.load(Ordering::SeqCst) {
            log::info!("interrupt received, shutting down");
            break;
        }
        if let Some(n) = remaining.as_mut() {
            if *n == 0 {
                break;
            }
            *n -= 1;
        }
        server.tick(sink);
        thread::sleep(period);
    }
    server.shutdown();
}
