use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::trace;

/// A time based signal source. Once started, an interval sends a tick on its channel
/// every time the delay returned by `get_delay` elapses, picking a new delay for each
/// period. Intervals can be stopped, and interrupted to throw away the pending delay and
/// schedule a fresh one.
///
/// Ticks are delivered on a channel with capacity 1: if the previous tick has not been
/// consumed yet the new one is dropped.
///
/// Intervals must be started from within a tokio runtime.
pub trait Interval {
    /// Starts ticking; false if already running or the interval was never initialized.
    fn start(&mut self) -> bool;
    /// Stops ticking; false if not running.
    fn stop(&mut self) -> bool;
    /// Resets the current period; false if not running.
    fn interrupt(&mut self) -> bool;
    fn running(&self) -> bool;
    /// The delay to use for the next period.
    fn get_delay(&self) -> Duration;
}

#[derive(Debug, Clone, Copy)]
enum Schedule {
    Fixed(Duration),
    Random { min: Duration, max: Duration },
    Jitter { base: Duration, jitter: Duration },
}

impl Schedule {
    fn delay(&self) -> Duration {
        match *self {
            Schedule::Fixed(delay) => delay,
            Schedule::Random { min, max } => {
                if max <= min {
                    return min;
                }
                rand::thread_rng().gen_range(min..max)
            }
            Schedule::Jitter { base, jitter } => {
                let lo = base.saturating_sub(jitter);
                let hi = base + jitter;
                rand::thread_rng().gen_range(lo..=hi)
            }
        }
    }
}

/// Owns the background task that dispatches ticks for all interval flavours.
#[derive(Debug, Default)]
struct Ticker {
    schedule: Option<Schedule>,
    tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Ticker {
    fn new(schedule: Schedule) -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let ticker = Self {
            schedule: Some(schedule),
            tx: Some(tx),
            task: None,
        };
        (ticker, rx)
    }

    fn delay(&self) -> Duration {
        self.schedule.map(|s| s.delay()).unwrap_or_default()
    }

    fn start(&mut self) -> bool {
        if self.running() {
            return false;
        }
        let (Some(schedule), Some(tx)) = (self.schedule, self.tx.clone()) else {
            return false;
        };

        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(schedule.delay()).await;
                match tx.try_send(()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(())) => trace!("previous tick not yet consumed, dropping tick"),
                    Err(TrySendError::Closed(())) => break,
                }
            }
        }));
        true
    }

    fn stop(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn interrupt(&mut self) -> bool {
        if !self.stop() {
            return false;
        }
        self.start()
    }

    fn running(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

macro_rules! delegate_interval {
    ($name:ident) => {
        impl Interval for $name {
            fn start(&mut self) -> bool {
                self.ticker.start()
            }

            fn stop(&mut self) -> bool {
                self.ticker.stop()
            }

            fn interrupt(&mut self) -> bool {
                self.ticker.interrupt()
            }

            fn running(&self) -> bool {
                self.ticker.running()
            }

            fn get_delay(&self) -> Duration {
                self.ticker.delay()
            }
        }
    };
}

/// Ticks on a constant period.
#[derive(Debug, Default)]
pub struct FixedInterval {
    ticker: Ticker,
}

impl FixedInterval {
    pub fn new(delay: Duration) -> (Self, mpsc::Receiver<()>) {
        let (ticker, rx) = Ticker::new(Schedule::Fixed(delay));
        (Self { ticker }, rx)
    }
}

delegate_interval!(FixedInterval);

/// Ticks after a delay drawn uniformly from `[min, max)` for every period, so that
/// replicas sharing a configuration do not time out together.
#[derive(Debug, Default)]
pub struct RandomInterval {
    ticker: Ticker,
}

impl RandomInterval {
    pub fn new(min: Duration, max: Duration) -> (Self, mpsc::Receiver<()>) {
        let (ticker, rx) = Ticker::new(Schedule::Random { min, max });
        (Self { ticker }, rx)
    }
}

delegate_interval!(RandomInterval);

/// Ticks every `base ± jitter`.
#[derive(Debug, Default)]
pub struct JitterInterval {
    ticker: Ticker,
}

impl JitterInterval {
    pub fn new(base: Duration, jitter: Duration) -> (Self, mpsc::Receiver<()>) {
        let (ticker, rx) = Ticker::new(Schedule::Jitter { base, jitter });
        (Self { ticker }, rx)
    }
}

delegate_interval!(JitterInterval);
