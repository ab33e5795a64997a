//! The client: connects to a driver through its CnC file and hands out
//! publications, subscriptions and counters.

pub mod buffer_claim;
pub mod conductor;
pub mod counter;
pub mod driver_proxy;
pub mod image;
pub mod publication;
pub mod subscription;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::client::conductor::{ClientConductor, ConductorAgent, ConductorConfig};
use crate::client::counter::Counter;
use crate::client::driver_proxy::DriverProxy;
use crate::client::publication::Publication;
use crate::client::subscription::Subscription;
use crate::cnc::{CncFile, CNC_FILE};
use crate::concurrent::agent::{AgentInvoker, AgentRunner};
use crate::concurrent::broadcast::{BroadcastReceiver, CopyBroadcastReceiver};
use crate::concurrent::counters::CountersReader;
use crate::concurrent::ring_buffer::ManyToOneRingBuffer;
use crate::context::Context;
use crate::driver::MediaDriver;
use crate::{Error, Result};

/// Liveness flags shared between the conductor and every handle.
#[derive(Debug)]
pub(crate) struct ClientStatus {
    driver_active: AtomicBool,
    closed: AtomicBool,
    timed_out: AtomicBool,
}

impl ClientStatus {
    pub(crate) fn new() -> Self {
        Self {
            driver_active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_driver_active(&self) -> bool {
        self.driver_active.load(Ordering::Acquire)
    }

    pub(crate) fn set_driver_inactive(&self) {
        self.driver_active.store(false, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub(crate) fn set_timed_out(&self) {
        self.timed_out.store(true, Ordering::Release);
    }
}

/// Waits until `ctx.dir` holds a ready CnC file with a fresh driver
/// heartbeat, for at most `ctx.driver_timeout`.
fn await_driver(ctx: &Context) -> Result<CncFile> {
    let path = ctx.dir.join(CNC_FILE);
    let deadline = Instant::now() + ctx.driver_timeout;
    let timeout_ms = ctx.driver_timeout.as_millis() as i64;
    loop {
        if path.exists() {
            match CncFile::open(&path) {
                Ok(cnc) => {
                    if cnc.check_ready()? {
                        let fresh = cnc
                            .driver_heartbeat_ms()
                            .is_some_and(|heartbeat| ctx.clock.now_ms() - heartbeat <= timeout_ms);
                        if fresh {
                            return Ok(cnc);
                        }
                    }
                }
                Err(Error::CorruptMetadata(_)) | Err(Error::Io(_)) => {}
                Err(err) => return Err(err),
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::DriverTimeout(format!(
                "no active driver in {} after {:?}",
                ctx.dir.display(),
                ctx.driver_timeout
            )));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A connection to a media driver.
///
/// `Client` is `Send + Sync`; every method may be called from any thread.
/// Handles returned by `find_*` stay usable until closed, the client is
/// closed, or the driver goes away.
pub struct Client {
    conductor: Arc<Mutex<ClientConductor>>,
    status: Arc<ClientStatus>,
    runner: Mutex<Option<AgentRunner>>,
    invoker: Option<Arc<AgentInvoker<ConductorAgent>>>,
    cnc: Arc<CncFile>,
    counters: CountersReader,
    client_id: i64,
    embedded_driver: Mutex<Option<MediaDriver>>,
}

impl Client {
    /// Connects to the driver in `ctx.dir`, launching one first when
    /// `ctx.embedded_driver` is set. Blocks for at most `ctx.driver_timeout`.
    pub fn connect(mut ctx: Context) -> Result<Self> {
        let embedded_driver = match ctx.embedded_driver.take() {
            Some(mut driver_ctx) => {
                driver_ctx.dir = ctx.dir.clone();
                Some(MediaDriver::launch(driver_ctx)?)
            }
            None => None,
        };

        let cnc = Arc::new(await_driver(&ctx)?);
        let to_driver = ManyToOneRingBuffer::new(cnc.to_driver_buffer())?;
        let client_id = to_driver.next_correlation_id();
        let receiver = CopyBroadcastReceiver::new(BroadcastReceiver::new(cnc.to_clients_buffer())?);
        let status = Arc::new(ClientStatus::new());

        let config = ConductorConfig {
            driver_timeout_ms: ctx.driver_timeout.as_millis() as i64,
            keepalive_interval_ms: ctx.keepalive_interval.as_millis() as i64,
            clock: Arc::clone(&ctx.clock),
            error_handler: Arc::clone(&ctx.error_handler),
            on_available_image: ctx.on_available_image.clone(),
            on_unavailable_image: ctx.on_unavailable_image.clone(),
        };
        let conductor = Arc::new_cyclic(|weak| {
            Mutex::new(ClientConductor::new(
                config,
                weak.clone(),
                Arc::clone(&cnc),
                Arc::clone(&status),
                DriverProxy::new(to_driver, client_id),
                receiver,
            ))
        });

        let agent = ConductorAgent::new(Arc::clone(&conductor));
        let (runner, invoker) = if ctx.use_conductor_agent_invoker {
            let invoker = Arc::new(AgentInvoker::new(agent, Arc::clone(&ctx.error_handler)));
            invoker.start();
            (None, Some(invoker))
        } else {
            let runner = AgentRunner::start(agent, ctx.idle_strategy, Arc::clone(&ctx.error_handler))?;
            (Some(runner), None)
        };
        log::info!("client {client_id} connected to {}", ctx.dir.display());

        Ok(Self {
            conductor,
            status,
            runner: Mutex::new(runner),
            invoker,
            counters: cnc.counters_reader(),
            cnc,
            client_id,
            embedded_driver: Mutex::new(embedded_driver),
        })
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    /// False once the driver heartbeat has gone stale. Sticky.
    pub fn is_driver_active(&self) -> bool {
        self.status.is_driver_active()
    }

    pub fn counters_reader(&self) -> &CountersReader {
        &self.counters
    }

    pub fn cnc(&self) -> &CncFile {
        &self.cnc
    }

    /// Present when `Context::use_conductor_agent_invoker` was set; the
    /// application must then call `invoke` to make progress.
    pub fn conductor_agent_invoker(&self) -> Option<&Arc<AgentInvoker<ConductorAgent>>> {
        self.invoker.as_ref()
    }

    /// Runs one duty cycle of the embedded driver if it was launched in
    /// invoker mode.
    pub fn invoke_embedded_driver(&self) -> usize {
        self.embedded_driver
            .lock()
            .as_ref()
            .map_or(0, MediaDriver::invoke)
    }

    pub fn add_publication(&self, channel: &str, stream_id: i32) -> Result<i64> {
        self.conductor.lock().add_publication(channel, stream_id)
    }

    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Result<i64> {
        self.conductor.lock().add_subscription(channel, stream_id)
    }

    pub fn add_counter(&self, type_id: i32, key: &[u8], label: &str) -> Result<i64> {
        self.conductor.lock().add_counter(type_id, key, label)
    }

    pub fn find_publication(&self, correlation_id: i64) -> Result<Option<Arc<Publication>>> {
        self.conductor.lock().find_publication(correlation_id)
    }

    pub fn find_subscription(&self, correlation_id: i64) -> Result<Option<Arc<Subscription>>> {
        self.conductor.lock().find_subscription(correlation_id)
    }

    pub fn find_counter(&self, correlation_id: i64) -> Result<Option<Arc<Counter>>> {
        self.conductor.lock().find_counter(correlation_id)
    }

    pub fn close_publication(&self, correlation_id: i64) -> Result<()> {
        self.conductor.lock().release_publication(correlation_id)
    }

    pub fn close_subscription(&self, correlation_id: i64) -> Result<()> {
        self.conductor.lock().release_subscription(correlation_id)
    }

    pub fn close_counter(&self, correlation_id: i64) -> Result<()> {
        self.conductor.lock().release_counter(correlation_id)
    }

    /// Closes every handle, tells the driver, and stops the conductor.
    /// Idempotent.
    pub fn close(&self) {
        self.conductor.lock().close_client();
        if let Some(mut runner) = self.runner.lock().take() {
            runner.close();
        }
        if let Some(invoker) = &self.invoker {
            invoker.close();
        }
        if let Some(mut driver) = self.embedded_driver.lock().take() {
            driver.close();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.client_id)
            .field("cnc", &self.cnc.path())
            .field("closed", &self.is_closed())
            .finish()
    }
}
