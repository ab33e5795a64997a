//! Duty-cycle agents and the two ways to drive them: a dedicated thread
//! ([`AgentRunner`]) or explicit invocation from a caller's thread
//! ([`AgentInvoker`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::concurrent::idle::IdleStrategy;
use crate::error::ErrorHandler;
use crate::Result;

pub trait Agent: Send {
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Performs one unit of work. Returns how much work was done; zero lets
    /// the runner idle.
    fn do_work(&mut self) -> Result<usize>;

    fn on_close(&mut self) -> Result<()> {
        Ok(())
    }

    fn role_name(&self) -> &str;
}

/// Runs an agent on its own named thread until closed or until the agent
/// returns a terminal error.
pub struct AgentRunner {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AgentRunner {
    pub fn start<A>(mut agent: A, idle: IdleStrategy, error_handler: ErrorHandler) -> Result<Self>
    where
        A: Agent + 'static,
    {
        let name = agent.role_name().to_string();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            if let Err(err) = agent.on_start() {
                error_handler(&err);
                thread_running.store(false, Ordering::Release);
                return;
            }
            let mut idler = idle.idler();
            while thread_running.load(Ordering::Acquire) {
                match agent.do_work() {
                    Ok(work_count) => idler.idle(work_count),
                    Err(err) => {
                        error_handler(&err);
                        if err.is_terminal() {
                            thread_running.store(false, Ordering::Release);
                            break;
                        }
                        idler.idle(0);
                    }
                }
            }
            if let Err(err) = agent.on_close() {
                error_handler(&err);
            }
        })?;
        log::debug!("agent runner started: {name}");
        Ok(Self {
            name,
            running,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signals the agent thread to stop and joins it.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("agent thread {} panicked", self.name);
            }
        }
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drives an agent from the caller's thread.
///
/// `invoke` does nothing until `start` has been called, and nothing again
/// once the invoker is closed.
pub struct AgentInvoker<A: Agent> {
    agent: Mutex<A>,
    started: AtomicBool,
    running: AtomicBool,
    closed: AtomicBool,
    error_handler: ErrorHandler,
}

impl<A: Agent> AgentInvoker<A> {
    pub fn new(agent: A, error_handler: ErrorHandler) -> Self {
        Self {
            agent: Mutex::new(agent),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            error_handler,
        }
    }

    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let result = self.agent.lock().on_start();
        match result {
            Ok(()) => self.running.store(true, Ordering::Release),
            Err(err) => {
                (self.error_handler)(&err);
                self.close();
            }
        }
    }

    /// Runs one duty cycle. Returns the work count, zero when not running.
    pub fn invoke(&self) -> usize {
        if !self.running.load(Ordering::Acquire) {
            return 0;
        }
        let result = self.agent.lock().do_work();
        match result {
            Ok(work_count) => work_count,
            Err(err) => {
                (self.error_handler)(&err);
                if err.is_terminal() {
                    self.close();
                }
                0
            }
        }
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);
        let result = self.agent.lock().on_close();
        if let Err(err) = result {
            (self.error_handler)(&err);
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn role_name(&self) -> String {
        self.agent.lock().role_name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{Agent, AgentInvoker, AgentRunner};
    use crate::concurrent::idle::IdleStrategy;
    use crate::error::ErrorHandler;
    use crate::{Error, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    struct Counting {
        cycles: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail_at: Option<usize>,
    }

    impl Agent for Counting {
        fn do_work(&mut self) -> Result<usize> {
            let n = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(n) == self.fail_at {
                return Err(Error::ClientClosed);
            }
            Ok(1)
        }

        fn on_close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn role_name(&self) -> &str {
            "counting"
        }
    }

    fn counting(fail_at: Option<usize>) -> (Counting, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let cycles = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Counting {
                cycles: Arc::clone(&cycles),
                closes: Arc::clone(&closes),
                fail_at,
            },
            cycles,
            closes,
        )
    }

    fn recording_handler() -> (ErrorHandler, Arc<AtomicUsize>) {
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        let handler: ErrorHandler = Arc::new(move |_err: &Error| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (handler, errors)
    }

    #[test]
    fn invoke_before_start_does_nothing() {
        let (agent, cycles, closes) = counting(None);
        let (handler, _) = recording_handler();
        let invoker = AgentInvoker::new(agent, handler);
        assert_eq!(invoker.invoke(), 0);
        assert_eq!(cycles.load(Ordering::SeqCst), 0);

        invoker.start();
        assert_eq!(invoker.invoke(), 1);
        invoker.close();
        invoker.close();
        assert_eq!(invoker.invoke(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn terminal_error_closes_the_invoker() {
        let (agent, _, closes) = counting(Some(2));
        let (handler, errors) = recording_handler();
        let invoker = AgentInvoker::new(agent, handler);
        invoker.start();
        invoker.invoke();
        invoker.invoke();
        assert!(invoker.is_closed());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn runner_spins_until_closed() {
        let (agent, cycles, closes) = counting(None);
        let (handler, _) = recording_handler();
        let mut runner = AgentRunner::start(agent, IdleStrategy::Yielding, handler).expect("start");
        let deadline = Instant::now() + Duration::from_secs(5);
        while cycles.load(Ordering::SeqCst) < 10 && Instant::now() < deadline {
            std::thread::yield_now();
        }
        runner.close();
        assert!(!runner.is_running());
        assert!(cycles.load(Ordering::SeqCst) >= 10);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
