#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit::{
    Client, Clock, Context, DriverContext, Error, MediaDriver, Publication, Subscription,
    SystemClock, ThreadingMode,
};
use tempfile::TempDir;

pub const IPC: &str = "aeron:ipc";
pub const STREAM_ID: i32 = 10_000;
pub const TERM_LENGTH: usize = 64 * 1024;

const AWAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A driver and a client, both in invoker mode, sharing a temp directory.
///
/// Fields drop in declaration order: clients first, then the driver, then
/// the directory.
pub struct Harness {
    pub client: Client,
    pub driver: MediaDriver,
    pub dir: TempDir,
    clock: Arc<dyn Clock>,
}

pub fn driver_context(dir: &TempDir, clock: Arc<dyn Clock>) -> DriverContext {
    DriverContext {
        dir: dir.path().join("driver"),
        term_length: TERM_LENGTH,
        mtu: 1408,
        to_driver_buffer_capacity: 64 * 1024,
        to_clients_buffer_capacity: 64 * 1024,
        counters_capacity: 128,
        threading_mode: ThreadingMode::Invoker,
        clock,
        ..DriverContext::default()
    }
}

pub fn client_context(dir: &TempDir, clock: Arc<dyn Clock>) -> Context {
    Context {
        dir: dir.path().join("driver"),
        use_conductor_agent_invoker: true,
        clock,
        ..Context::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Arc::new(SystemClock), |_| {}, |_| {})
    }

    pub fn with(
        clock: Arc<dyn Clock>,
        driver_cfg: impl FnOnce(&mut DriverContext),
        client_cfg: impl FnOnce(&mut Context),
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut driver_ctx = driver_context(&dir, Arc::clone(&clock));
        driver_cfg(&mut driver_ctx);
        let driver = MediaDriver::launch(driver_ctx).expect("launch driver");
        let mut client_ctx = client_context(&dir, Arc::clone(&clock));
        client_cfg(&mut client_ctx);
        let client = Client::connect(client_ctx).expect("connect client");
        Self {
            client,
            driver,
            dir,
            clock,
        }
    }

    pub fn connect_another(&self) -> Client {
        Client::connect(client_context(&self.dir, Arc::clone(&self.clock))).expect("connect")
    }

    /// One duty cycle of the driver and of the main client.
    pub fn work(&self) -> usize {
        let mut work_count = self.driver.invoke();
        if let Some(invoker) = self.client.conductor_agent_invoker() {
            work_count += invoker.invoke();
        }
        work_count
    }

    /// Runs duty cycles of the driver and of `clients` until `done` holds.
    pub fn work_until(&self, clients: &[&Client], mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + AWAIT_TIMEOUT;
        while !done() {
            self.driver.invoke();
            for client in clients {
                if let Some(invoker) = client.conductor_agent_invoker() {
                    invoker.invoke();
                }
            }
            assert!(Instant::now() < deadline, "condition not met in time");
        }
    }

    pub fn await_publication(&self, client: &Client, correlation_id: i64) -> Arc<Publication> {
        let mut found = None;
        self.work_until(&[client], || {
            found = client
                .find_publication(correlation_id)
                .expect("find publication");
            found.is_some()
        });
        found.expect("publication")
    }

    pub fn await_subscription(&self, client: &Client, correlation_id: i64) -> Arc<Subscription> {
        let mut found = None;
        self.work_until(&[client], || {
            found = client
                .find_subscription(correlation_id)
                .expect("find subscription");
            found.is_some()
        });
        found.expect("subscription")
    }

    pub fn publication(&self, channel: &str, stream_id: i32) -> Arc<Publication> {
        let id = self
            .client
            .add_publication(channel, stream_id)
            .expect("add publication");
        self.await_publication(&self.client, id)
    }

    pub fn subscription(&self, channel: &str, stream_id: i32) -> Arc<Subscription> {
        let id = self
            .client
            .add_subscription(channel, stream_id)
            .expect("add subscription");
        self.await_subscription(&self.client, id)
    }

    /// Subscription and publication on the same ipc stream, with the image
    /// connected and the publication allowed to send.
    pub fn connected_pair(&self) -> (Arc<Publication>, Arc<Subscription>) {
        let subscription = self.subscription(IPC, STREAM_ID);
        let publication = self.publication(IPC, STREAM_ID);
        self.work_until(&[&self.client], || {
            subscription.image_count() == 1 && publication.is_connected()
        });
        (publication, subscription)
    }

    /// Offers until accepted, running duty cycles between transient failures.
    pub fn offer(&self, publication: &Publication, message: &[u8]) -> i64 {
        let deadline = Instant::now() + AWAIT_TIMEOUT;
        loop {
            match publication.offer(message) {
                Ok(position) => return position,
                Err(err) if err.is_transient() => {
                    assert!(Instant::now() < deadline, "offer stuck on {err}");
                    self.work();
                }
                Err(err) => panic!("offer failed: {err}"),
            }
        }
    }

    /// Polls until `count` messages arrived.
    pub fn receive(&self, subscription: &Subscription, count: usize) -> Vec<Vec<u8>> {
        let mut received = Vec::new();
        self.work_until(&[&self.client], || {
            subscription
                .poll(|payload, _| received.push(payload.to_vec()), 16)
                .expect("poll");
            received.len() >= count
        });
        received
    }
}

pub fn is_driver_timeout(err: &Error) -> bool {
    matches!(err, Error::DriverTimeout(_))
}
