use std::hint;
use std::thread;
use std::time::Duration;

/// How an agent thread waits when a duty cycle found no work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleStrategy {
    /// True busy-spinning. Burns a full core for the lowest wake-up latency.
    BusySpin,
    /// Gives up the time slice on every idle cycle.
    Yielding,
    /// Parks the thread for a fixed period.
    Sleeping(Duration),
    /// Spins, then yields, then parks with an exponentially growing period.
    Backoff {
        max_spins: u32,
        max_yields: u32,
        min_park: Duration,
        max_park: Duration,
    },
}

impl Default for IdleStrategy {
    fn default() -> Self {
        IdleStrategy::Backoff {
            max_spins: 10,
            max_yields: 5,
            min_park: Duration::from_micros(1),
            max_park: Duration::from_millis(1),
        }
    }
}

impl IdleStrategy {
    pub fn idler(self) -> Idler {
        Idler {
            strategy: self,
            spins: 0,
            yields: 0,
            park: Duration::ZERO,
        }
    }
}

/// Per-thread state for an [`IdleStrategy`].
#[derive(Debug)]
pub struct Idler {
    strategy: IdleStrategy,
    spins: u32,
    yields: u32,
    park: Duration,
}

impl Idler {
    /// Called after every duty cycle with the amount of work it did.
    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }
        match self.strategy {
            IdleStrategy::BusySpin => hint::spin_loop(),
            IdleStrategy::Yielding => thread::yield_now(),
            IdleStrategy::Sleeping(period) => thread::sleep(period),
            IdleStrategy::Backoff {
                max_spins,
                max_yields,
                min_park,
                max_park,
            } => {
                if self.spins < max_spins {
                    self.spins += 1;
                    hint::spin_loop();
                } else if self.yields < max_yields {
                    self.yields += 1;
                    thread::yield_now();
                } else {
                    self.park = if self.park.is_zero() {
                        min_park
                    } else {
                        (self.park * 2).min(max_park)
                    };
                    thread::sleep(self.park);
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park = Duration::ZERO;
    }
}
