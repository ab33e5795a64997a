use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::client::conductor::ClientConductor;
use crate::cnc::CncFile;
use crate::concurrent::counters::AtomicCounter;
use crate::{Error, Result};

/// A counter allocated by the driver on behalf of this client.
pub struct Counter {
    conductor: Weak<Mutex<ClientConductor>>,
    _cnc: Arc<CncFile>,
    counter: AtomicCounter,
    registration_id: i64,
    closed: AtomicBool,
}

impl Counter {
    pub(crate) fn new(
        conductor: Weak<Mutex<ClientConductor>>,
        cnc: Arc<CncFile>,
        counter: AtomicCounter,
        registration_id: i64,
    ) -> Self {
        Self {
            conductor,
            _cnc: cnc,
            counter,
            registration_id,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> i32 {
        self.counter.id()
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedResource("counter"));
        }
        Ok(())
    }

    pub fn get(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.counter.get())
    }

    pub fn set(&self, value: i64) -> Result<()> {
        self.ensure_open()?;
        self.counter.set(value);
        Ok(())
    }

    /// Returns the value before the increment.
    pub fn increment(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.counter.increment())
    }

    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match self.conductor.upgrade() {
            Some(conductor) => conductor.lock().release_counter(self.registration_id),
            None => {
                self.mark_closed();
                Ok(())
            }
        }
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("id", &self.id())
            .field("registration_id", &self.registration_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
