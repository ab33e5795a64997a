use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use clap::Parser;
use conduit::context::default_dir;
use conduit::{DriverContext, IdleStrategy, MediaDriver, ThreadingMode};

#[derive(Parser)]
#[command(name = "conduit-driver")]
#[command(about = "Run a standalone media driver for the ipc media")]
struct Cli {
    /// Driver directory (default: $CONDUIT_DIR or /dev/shm/conduit-<user>)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Default term length in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    term_length: usize,

    /// Default MTU for ipc publications
    #[arg(long, default_value_t = 1408)]
    mtu: usize,

    /// Publisher window ahead of the slowest subscriber (default: half a term)
    #[arg(long)]
    term_window: Option<usize>,

    /// Number of counter slots
    #[arg(long, default_value_t = 1024)]
    counters: usize,

    /// Client liveness timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    client_timeout_ms: u64,

    /// Busy-spin instead of backing off when idle
    #[arg(long)]
    busy_spin: bool,

    /// Delete the directory before starting
    #[arg(long)]
    delete_on_start: bool,

    /// Stop after this many seconds (default: run until killed)
    #[arg(long)]
    run_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let ctx = DriverContext {
        dir: cli.dir.unwrap_or_else(default_dir),
        term_length: cli.term_length,
        mtu: cli.mtu,
        term_window: cli.term_window,
        counters_capacity: cli.counters,
        client_liveness_timeout: Duration::from_millis(cli.client_timeout_ms),
        threading_mode: ThreadingMode::Dedicated,
        idle_strategy: if cli.busy_spin {
            IdleStrategy::BusySpin
        } else {
            IdleStrategy::default()
        },
        dir_delete_on_start: cli.delete_on_start,
        ..DriverContext::default()
    };
    let dir = ctx.dir.clone();
    let mut driver = MediaDriver::launch(ctx)
        .with_context(|| format!("failed to launch driver in {}", dir.display()))?;
    log::info!("conduit-driver running in {}", driver.dir().display());

    let started = Instant::now();
    loop {
        if let Some(secs) = cli.run_secs {
            if started.elapsed() >= Duration::from_secs(secs) {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    driver.close();
    Ok(())
}
