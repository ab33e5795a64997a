use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use conduit::clock::{Clock, SystemClock};
use conduit::cnc::{CncFile, CNC_FILE};
use conduit::context::default_dir;
use conduit::{Client, Context, Error};

#[derive(Parser)]
#[command(name = "conduit-cli", version, about = "Conduit driver tooling")]
struct Cli {
    /// Driver directory (default: $CONDUIT_DIR or /dev/shm/conduit-<user>)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the CnC header and every allocated counter
    Stat,
    /// Offer messages to a channel
    Publish {
        #[arg(long, default_value = "aeron:ipc")]
        channel: String,
        #[arg(long, default_value_t = 10_000)]
        stream_id: i32,
        #[arg(long, default_value_t = 10)]
        messages: u64,
        /// Message text; the sequence number is appended
        #[arg(long, default_value = "Hello World!")]
        text: String,
        /// Pause between messages in milliseconds
        #[arg(long, default_value_t = 0)]
        linger_ms: u64,
    },
    /// Poll a channel and print what arrives
    Subscribe {
        #[arg(long, default_value = "aeron:ipc")]
        channel: String,
        #[arg(long, default_value_t = 10_000)]
        stream_id: i32,
        /// Stop after this many messages
        #[arg(long)]
        limit: Option<u64>,
        /// Stop after this many seconds
        #[arg(long)]
        run_secs: Option<u64>,
    },
}

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let dir = cli.dir.unwrap_or_else(default_dir);
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Stat => cmd_stat(&dir, &mut out)?,
        Commands::Publish {
            channel,
            stream_id,
            messages,
            text,
            linger_ms,
        } => cmd_publish(&dir, &channel, stream_id, messages, &text, linger_ms, &mut out)?,
        Commands::Subscribe {
            channel,
            stream_id,
            limit,
            run_secs,
        } => cmd_subscribe(&dir, &channel, stream_id, limit, run_secs, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn cmd_stat(dir: &Path, out: &mut dyn Write) -> Result<()> {
    let path = dir.join(CNC_FILE);
    let cnc = CncFile::open(&path).with_context(|| format!("open {}", path.display()))?;
    if !cnc.check_ready()? {
        bail!("{} is not initialised", path.display());
    }
    let now_ms = SystemClock.now_ms();
    let layout = cnc.layout();
    writeln!(out, "cnc={}", path.display())?;
    writeln!(
        out,
        "pid={} alive={} start_ms={}",
        cnc.pid(),
        cnc.is_driver_process_alive(),
        cnc.start_timestamp_ms()
    )?;
    match cnc.driver_heartbeat_ms() {
        Some(heartbeat) => writeln!(out, "driver_heartbeat_age_ms={}", now_ms - heartbeat)?,
        None => writeln!(out, "driver_heartbeat_age_ms=none")?,
    }
    writeln!(
        out,
        "to_driver={} to_clients={} counters_metadata={} counters_values={}",
        layout.to_driver_buffer_length,
        layout.to_clients_buffer_length,
        layout.counters_metadata_length,
        layout.counters_values_length
    )?;
    writeln!(out, "client_liveness_timeout={:?}", cnc.client_liveness_timeout())?;

    let counters = cnc.counters_reader();
    let mut rows = Vec::new();
    counters.for_each(|id, type_id, _key, label| {
        rows.push((id, type_id, counters.counter_value(id), label.to_string()));
    });
    for (id, type_id, value, label) in rows {
        writeln!(out, "{id:>4} type={type_id:<4} {value:>20} {label}")?;
    }
    Ok(())
}

fn connect(dir: &Path) -> Result<Client> {
    let ctx = Context {
        dir: dir.to_path_buf(),
        error_handler: Arc::new(|err: &Error| log::error!("{err}")),
        ..Context::default()
    };
    Client::connect(ctx).with_context(|| format!("connect to driver in {}", dir.display()))
}

/// Polls `find` until the registration resolves.
fn await_registration<T>(mut find: impl FnMut() -> conduit::Result<Option<T>>) -> Result<T> {
    let deadline = Instant::now() + REGISTRATION_TIMEOUT;
    loop {
        if let Some(handle) = find()? {
            return Ok(handle);
        }
        if Instant::now() >= deadline {
            bail!("registration not answered within {REGISTRATION_TIMEOUT:?}");
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn cmd_publish(
    dir: &Path,
    channel: &str,
    stream_id: i32,
    messages: u64,
    text: &str,
    linger_ms: u64,
    out: &mut dyn Write,
) -> Result<()> {
    let client = connect(dir)?;
    let id = client.add_publication(channel, stream_id)?;
    let publication = await_registration(|| client.find_publication(id))?;
    writeln!(
        out,
        "publishing to {channel} stream {stream_id} session {}",
        publication.session_id()
    )?;

    for seq in 0..messages {
        let message = format!("{text} {seq}");
        loop {
            match publication.offer(message.as_bytes()) {
                Ok(position) => {
                    writeln!(out, "sent {seq} position={position}")?;
                    break;
                }
                Err(err) if err.is_transient() => std::thread::sleep(Duration::from_millis(1)),
                Err(err) => return Err(err.into()),
            }
        }
        if linger_ms > 0 {
            std::thread::sleep(Duration::from_millis(linger_ms));
        }
    }
    publication.close()?;
    client.close();
    Ok(())
}

fn cmd_subscribe(
    dir: &Path,
    channel: &str,
    stream_id: i32,
    limit: Option<u64>,
    run_secs: Option<u64>,
    out: &mut dyn Write,
) -> Result<()> {
    let client = connect(dir)?;
    let id = client.add_subscription(channel, stream_id)?;
    let subscription = await_registration(|| client.find_subscription(id))?;
    writeln!(out, "subscribed to {channel} stream {stream_id}")?;

    let started = Instant::now();
    let mut received = 0u64;
    let mut lines = Vec::new();
    loop {
        let fragments = subscription.poll(
            |payload, header| {
                lines.push(format!(
                    "session={} position={} {}",
                    header.session_id(),
                    header.position(),
                    String::from_utf8_lossy(payload)
                ));
            },
            10,
        )?;
        for line in lines.drain(..) {
            writeln!(out, "{line}")?;
            received += 1;
        }
        if limit.is_some_and(|limit| received >= limit) {
            break;
        }
        if run_secs.is_some_and(|secs| started.elapsed() >= Duration::from_secs(secs)) {
            break;
        }
        if !client.is_driver_active() {
            bail!("driver went away");
        }
        if fragments == 0 {
            out.flush()?;
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    subscription.close()?;
    client.close();
    Ok(())
}
