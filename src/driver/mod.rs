//! A media driver serving the `ipc` media, embeddable in a client process or
//! run standalone by `conduit-driver`.

pub mod conductor;
pub mod ipc_publication;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cnc::{CncFile, CncLayout, CNC_FILE};
use crate::concurrent::agent::{AgentInvoker, AgentRunner};
use crate::concurrent::counters::{COUNTER_LENGTH, METADATA_LENGTH};
use crate::concurrent::{broadcast, ring_buffer};
use crate::context::{DriverContext, ThreadingMode};
use crate::logbuffer::descriptor::check_term_length;
use crate::logbuffer::frame::{FRAME_ALIGNMENT, HEADER_LENGTH};
use crate::{Error, Result};

pub use conductor::DriverConductor;

pub const PUBLICATIONS_DIR: &str = "publications";

pub struct MediaDriver {
    dir: PathBuf,
    cnc: Arc<CncFile>,
    runner: Option<AgentRunner>,
    invoker: Option<Arc<AgentInvoker<DriverConductor>>>,
    delete_dir_on_shutdown: bool,
    closed: bool,
}

fn validate(ctx: &DriverContext) -> Result<()> {
    check_term_length(ctx.term_length)?;
    if ctx.mtu <= HEADER_LENGTH || ctx.mtu % FRAME_ALIGNMENT != 0 || ctx.mtu > ctx.term_length {
        return Err(Error::InvalidConfig(format!(
            "mtu {} must be a multiple of {FRAME_ALIGNMENT} above {HEADER_LENGTH}",
            ctx.mtu
        )));
    }
    for (name, capacity) in [
        ("to_driver_buffer_capacity", ctx.to_driver_buffer_capacity),
        ("to_clients_buffer_capacity", ctx.to_clients_buffer_capacity),
    ] {
        if !capacity.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "{name} {capacity} is not a power of two"
            )));
        }
    }
    if ctx.counters_capacity < 2 {
        return Err(Error::InvalidConfig("counters_capacity must be at least 2".into()));
    }
    Ok(())
}

fn prepare_dir(ctx: &DriverContext) -> Result<()> {
    if ctx.dir.exists() {
        if ctx.dir_delete_on_start {
            std::fs::remove_dir_all(&ctx.dir)?;
        } else {
            let stale_cnc = ctx.dir.join(CNC_FILE);
            if stale_cnc.exists() {
                log::warn!("removing stale {}", stale_cnc.display());
                std::fs::remove_file(&stale_cnc)?;
            }
            let stale_logs = ctx.dir.join(PUBLICATIONS_DIR);
            if stale_logs.exists() {
                std::fs::remove_dir_all(&stale_logs)?;
            }
        }
    }
    std::fs::create_dir_all(ctx.dir.join(PUBLICATIONS_DIR))?;
    Ok(())
}

impl MediaDriver {
    /// Creates the driver directory and CnC file and starts the conductor.
    ///
    /// Fails with `Administration` if another driver is still heartbeating
    /// in the same directory.
    pub fn launch(ctx: DriverContext) -> Result<Self> {
        validate(&ctx)?;
        let now_ms = ctx.clock.now_ms();
        if CncFile::is_driver_active(&ctx.dir, ctx.client_liveness_timeout, now_ms)? {
            return Err(Error::Administration(format!(
                "active driver detected in {}",
                ctx.dir.display()
            )));
        }
        prepare_dir(&ctx)?;

        let layout = CncLayout {
            to_driver_buffer_length: ctx.to_driver_buffer_capacity + ring_buffer::TRAILER_LENGTH,
            to_clients_buffer_length: ctx.to_clients_buffer_capacity + broadcast::TRAILER_LENGTH,
            counters_metadata_length: ctx.counters_capacity * METADATA_LENGTH,
            counters_values_length: ctx.counters_capacity * COUNTER_LENGTH,
        };
        let cnc = Arc::new(CncFile::create(
            &ctx.dir.join(CNC_FILE),
            layout,
            ctx.client_liveness_timeout,
            now_ms,
        )?);

        let config = conductor::DriverConfig {
            publications_dir: ctx.dir.join(PUBLICATIONS_DIR),
            term_length: ctx.term_length,
            mtu: ctx.mtu,
            term_window: ctx.term_window.unwrap_or(ctx.term_length / 2),
            client_liveness_timeout_ms: ctx.client_liveness_timeout.as_millis() as i64,
            publication_linger_ms: ctx.publication_linger_timeout.as_millis() as i64,
            counter_free_to_reuse_ms: ctx.counter_free_to_reuse_timeout.as_millis() as i64,
        };
        let conductor = DriverConductor::new(
            config,
            Arc::clone(&cnc),
            Arc::clone(&ctx.clock),
            Arc::clone(&ctx.error_handler),
        )?;

        let (runner, invoker) = match ctx.threading_mode {
            ThreadingMode::Dedicated => (
                Some(AgentRunner::start(
                    conductor,
                    ctx.idle_strategy,
                    Arc::clone(&ctx.error_handler),
                )?),
                None,
            ),
            ThreadingMode::Invoker => {
                let invoker = Arc::new(AgentInvoker::new(conductor, Arc::clone(&ctx.error_handler)));
                invoker.start();
                (None, Some(invoker))
            }
        };
        log::info!(
            "media driver started in {} ({:?})",
            ctx.dir.display(),
            ctx.threading_mode
        );

        Ok(Self {
            dir: ctx.dir,
            cnc,
            runner,
            invoker,
            delete_dir_on_shutdown: ctx.dir_delete_on_shutdown,
            closed: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cnc(&self) -> &CncFile {
        &self.cnc
    }

    /// Present when launched with [`ThreadingMode::Invoker`].
    pub fn conductor_agent_invoker(&self) -> Option<&Arc<AgentInvoker<DriverConductor>>> {
        self.invoker.as_ref()
    }

    /// Runs one duty cycle in invoker mode; zero otherwise.
    pub fn invoke(&self) -> usize {
        self.invoker.as_ref().map_or(0, |invoker| invoker.invoke())
    }

    /// Stops the conductor and deletes every log. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut runner) = self.runner.take() {
            runner.close();
        }
        if let Some(invoker) = self.invoker.take() {
            invoker.close();
        }
        if self.delete_dir_on_shutdown {
            if let Err(err) = std::fs::remove_dir_all(&self.dir) {
                log::warn!("failed to delete {}: {err}", self.dir.display());
            }
        }
        log::info!("media driver in {} stopped", self.dir.display());
    }
}

impl Drop for MediaDriver {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MediaDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaDriver")
            .field("dir", &self.dir)
            .field("invoker", &self.invoker.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::MediaDriver;
    use crate::context::{DriverContext, ThreadingMode};
    use crate::Error;
    use tempfile::tempdir;

    fn ctx(dir: &std::path::Path) -> DriverContext {
        DriverContext {
            dir: dir.to_path_buf(),
            threading_mode: ThreadingMode::Invoker,
            to_driver_buffer_capacity: 64 * 1024,
            to_clients_buffer_capacity: 64 * 1024,
            counters_capacity: 64,
            ..DriverContext::default()
        }
    }

    #[test]
    fn second_driver_on_live_dir_is_refused() {
        let dir = tempdir().expect("tempdir");
        let driver = MediaDriver::launch(ctx(dir.path())).expect("first driver");
        assert!(driver.cnc().driver_heartbeat_ms().is_some());

        match MediaDriver::launch(ctx(dir.path())) {
            Err(Error::Administration(message)) => assert!(message.contains("active driver")),
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_mtu() {
        let dir = tempdir().expect("tempdir");
        let mut bad = ctx(dir.path());
        bad.mtu = 1000;
        assert!(matches!(
            MediaDriver::launch(bad),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn delete_on_shutdown_removes_dir() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("driver");
        let mut driver_ctx = ctx(&path);
        driver_ctx.dir_delete_on_shutdown = true;
        let mut driver = MediaDriver::launch(driver_ctx).expect("launch");
        assert!(path.join("cnc.dat").exists());
        driver.invoke();
        driver.close();
        assert!(!path.exists());
    }
}
