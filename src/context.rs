//! Client and driver configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::client::image::Image;
use crate::clock::{Clock, SystemClock};
use crate::concurrent::idle::IdleStrategy;
use crate::error::{default_error_handler, ErrorHandler};

pub const DIR_ENV_VAR: &str = "CONDUIT_DIR";

/// Invoked from the conductor duty cycle, under the client lock. Must not
/// call back into the client.
pub type ImageHandler = Arc<dyn Fn(&Image) + Send + Sync + 'static>;

/// `$CONDUIT_DIR`, else `/dev/shm/conduit-<user>` on Linux, else
/// `<tmp>/conduit-<user>`.
pub fn default_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DIR_ENV_VAR) {
        return PathBuf::from(dir);
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
    let base = if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir()
    };
    base.join(format!("conduit-{user}"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadingMode {
    /// The driver conductor runs on its own thread.
    Dedicated,
    /// The application drives the driver through its agent invoker.
    Invoker,
}

/// Configuration for an embedded or standalone media driver.
#[derive(Clone)]
pub struct DriverContext {
    /// Directory holding `cnc.dat` and the `publications/` log buffers.
    /// Default: [`default_dir`]
    pub dir: PathBuf,

    /// Default term length for new publications; channels may override it.
    /// Default: 1 MiB
    pub term_length: usize,

    /// Default MTU for IPC publications.
    /// Default: 1408
    pub mtu: usize,

    /// How far a publisher may run ahead of the slowest subscriber. Capped
    /// at half a term. `None` means half a term.
    /// Default: None
    pub term_window: Option<usize>,

    /// Capacity of the to-driver ring buffer (power of two).
    /// Default: 1 MiB
    pub to_driver_buffer_capacity: usize,

    /// Capacity of the to-clients broadcast buffer (power of two).
    /// Default: 1 MiB
    pub to_clients_buffer_capacity: usize,

    /// Number of counter slots.
    /// Default: 1024
    pub counters_capacity: usize,

    /// A client silent for longer than this is timed out.
    /// Default: 10 s
    pub client_liveness_timeout: Duration,

    /// How long a freed counter id stays unused.
    /// Default: 1 s
    pub counter_free_to_reuse_timeout: Duration,

    /// How long a draining publication waits for slow subscribers before
    /// its log is deleted.
    /// Default: 5 s
    pub publication_linger_timeout: Duration,

    /// Default: Dedicated
    pub threading_mode: ThreadingMode,

    /// Default: Backoff
    pub idle_strategy: IdleStrategy,

    /// Remove an existing (inactive) directory before starting.
    /// Default: false
    pub dir_delete_on_start: bool,

    /// Remove the directory on shutdown.
    /// Default: false
    pub dir_delete_on_shutdown: bool,

    /// Default: SystemClock
    pub clock: Arc<dyn Clock>,

    /// Default: logs via `log::error!`
    pub error_handler: ErrorHandler,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            term_length: 1024 * 1024,
            mtu: 1408,
            term_window: None,
            to_driver_buffer_capacity: 1024 * 1024,
            to_clients_buffer_capacity: 1024 * 1024,
            counters_capacity: 1024,
            client_liveness_timeout: Duration::from_secs(10),
            counter_free_to_reuse_timeout: Duration::from_secs(1),
            publication_linger_timeout: Duration::from_secs(5),
            threading_mode: ThreadingMode::Dedicated,
            idle_strategy: IdleStrategy::default(),
            dir_delete_on_start: false,
            dir_delete_on_shutdown: false,
            clock: Arc::new(SystemClock),
            error_handler: default_error_handler(),
        }
    }
}

impl fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("dir", &self.dir)
            .field("term_length", &self.term_length)
            .field("mtu", &self.mtu)
            .field("term_window", &self.term_window)
            .field("counters_capacity", &self.counters_capacity)
            .field("client_liveness_timeout", &self.client_liveness_timeout)
            .field("threading_mode", &self.threading_mode)
            .finish_non_exhaustive()
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Clone)]
pub struct Context {
    /// Directory of the driver to connect to.
    /// Default: [`default_dir`]
    pub dir: PathBuf,

    /// A driver whose heartbeat is older than this is considered dead; also
    /// bounds how long a registration may stay unanswered and how long
    /// `connect` waits for the CnC file.
    /// Default: 10 s
    pub driver_timeout: Duration,

    /// How often the client heartbeat is refreshed.
    /// Default: 500 ms
    pub keepalive_interval: Duration,

    /// Drive the conductor through `Client::conductor_agent_invoker`
    /// instead of a dedicated thread.
    /// Default: false
    pub use_conductor_agent_invoker: bool,

    /// Idle strategy of the conductor thread.
    /// Default: Sleeping(1 ms)
    pub idle_strategy: IdleStrategy,

    /// Default: SystemClock
    pub clock: Arc<dyn Clock>,

    /// Default: logs via `log::error!`
    pub error_handler: ErrorHandler,

    pub on_available_image: Option<ImageHandler>,
    pub on_unavailable_image: Option<ImageHandler>,

    /// Launch a media driver in-process on `dir` when connecting. The
    /// driver's own `dir` is overridden.
    /// Default: None
    pub embedded_driver: Option<DriverContext>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            driver_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_millis(500),
            use_conductor_agent_invoker: false,
            idle_strategy: IdleStrategy::Sleeping(Duration::from_millis(1)),
            clock: Arc::new(SystemClock),
            error_handler: default_error_handler(),
            on_available_image: None,
            on_unavailable_image: None,
            embedded_driver: None,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("dir", &self.dir)
            .field("driver_timeout", &self.driver_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("use_conductor_agent_invoker", &self.use_conductor_agent_invoker)
            .field("idle_strategy", &self.idle_strategy)
            .field("embedded_driver", &self.embedded_driver)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{Context, DriverContext};
    use std::time::Duration;

    #[test]
    fn defaults_match_documented_values() {
        let ctx = Context::default();
        assert_eq!(ctx.driver_timeout, Duration::from_secs(10));
        assert_eq!(ctx.keepalive_interval, Duration::from_millis(500));
        assert!(!ctx.use_conductor_agent_invoker);

        let driver = DriverContext::default();
        assert_eq!(driver.term_length, 1024 * 1024);
        assert_eq!(driver.mtu, 1408);
        assert_eq!(driver.client_liveness_timeout, Duration::from_secs(10));
    }
}
