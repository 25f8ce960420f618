//! [EdgeSource] implementation on top of the Linux GPIO character device, using the gpiod library.
//!
//! A single worker thread samples every watched line, so glitch filtering and the idle watchdog
//! are done in software and behave the same on every chip.
use crate::{Edge, EdgeEvent, EdgeHandler, EdgeSource, GpioBias, GpioError, GpioResult, Level, PinConfig, Subscription};
use bitvec::vec::BitVec;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

impl From<GpioBias> for gpiod::Bias {
    fn from(bias: GpioBias) -> Self {
        match bias {
            GpioBias::None => gpiod::Bias::Disable,
            GpioBias::PullUp => gpiod::Bias::PullUp,
            GpioBias::PullDown => gpiod::Bias::PullDown,
        }
    }
}

/// Suppresses level changes that don't last for the filter width.
#[derive(Debug, Clone)]
pub struct GlitchFilter {
    width: Duration,
    stable: bool,
    candidate: Option<(bool, Instant)>,
}

impl GlitchFilter {
    pub fn new(width: Duration, initial: bool) -> Self {
        GlitchFilter {
            width,
            stable: initial,
            candidate: None,
        }
    }

    /// The last level that made it through the filter.
    pub fn stable(&self) -> bool {
        self.stable
    }

    /// Feeds a raw sample taken at `now`.
    ///
    /// Returns the new level once a change has been stable for the filter width.
    pub fn update(&mut self, level: bool, now: Instant) -> Option<bool> {
        if level == self.stable {
            self.candidate = None;
            return None;
        }

        let since = match self.candidate {
            Some((candidate, since)) if candidate == level => since,
            _ => {
                self.candidate = Some((level, now));
                now
            }
        };

        if now.saturating_duration_since(since) >= self.width {
            self.candidate = None;
            self.stable = level;
            Some(level)
        } else {
            None
        }
    }
}

/// Software idle watchdog. Re-arms itself every time it fires or is fed.
#[derive(Debug, Clone)]
pub struct IdleWatchdog {
    timeout: Option<Duration>,
    last_activity: Instant,
}

impl IdleWatchdog {
    pub fn new(now: Instant) -> Self {
        IdleWatchdog {
            timeout: None,
            last_activity: now,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn arm(&mut self, timeout: Option<Duration>, now: Instant) {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self.last_activity = now;
    }

    pub fn feed(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Whether the watchdog expired by `now`. Expiring restarts the period.
    pub fn check(&mut self, now: Instant) -> bool {
        let Some(timeout) = self.timeout else {
            return false;
        };
        if now.saturating_duration_since(self.last_activity) >= timeout {
            self.last_activity = now;
            true
        } else {
            false
        }
    }
}

struct WatchedLine {
    line: gpiod::Lines<gpiod::Input>,
    filter: GlitchFilter,
    watchdog: IdleWatchdog,
    subscribers: Vec<(u64, Edge, EdgeHandler)>,
}

impl WatchedLine {
    fn read(&self) -> GpioResult<bool> {
        let values = self.line.get_values([false])?;
        Ok(values[0])
    }

    fn handlers_for(&self, level: Level) -> Vec<EdgeHandler> {
        self.subscribers
            .iter()
            .filter(|(_, edge, _)| edge.accepts(level))
            .map(|(_, _, handler)| handler.clone())
            .collect()
    }
}

struct Inner {
    chip: gpiod::Chip,
    used_pins: BitVec<AtomicU8>,
    poll_interval: Duration,
    opened: Instant,
    running: AtomicBool,
    lines: Mutex<HashMap<u32, WatchedLine>>,
    next_id: Mutex<u64>,
}

impl Inner {
    fn lines(&self) -> MutexGuard<'_, HashMap<u32, WatchedLine>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.opened).as_micros() as u64
    }

    /// Samples every watched line once and collects the notifications to deliver.
    fn poll(&self) -> Vec<(EdgeEvent, Vec<EdgeHandler>)> {
        let mut pending = Vec::new();
        let mut lines = self.lines();
        let now = Instant::now();
        let tick = self.tick(now);

        for (&pin, watched) in lines.iter_mut() {
            if watched.subscribers.is_empty() {
                continue;
            }

            let raw = match watched.read() {
                Ok(raw) => raw,
                Err(err) => {
                    warn!("Failed to sample pin {}: {}", pin, err);
                    continue;
                }
            };

            let level = if let Some(level) = watched.filter.update(raw, now) {
                watched.watchdog.feed(now);
                Level::from_bool(level)
            } else if watched.watchdog.check(now) {
                Level::WatchdogTimeout
            } else {
                continue;
            };

            let event = EdgeEvent { pin, level, tick };
            let handlers = watched.handlers_for(level);
            if !handlers.is_empty() {
                pending.push((event, handlers));
            }
        }

        pending
    }

    fn run(self: Arc<Self>) {
        debug!("Edge worker started, polling every {:?}", self.poll_interval);
        while self.running.load(Ordering::Acquire) {
            for (event, handlers) in self.poll() {
                trace!("Edge {:?}", event);
                for handler in handlers {
                    handler(event);
                }
            }
            thread::sleep(self.poll_interval);
        }
        debug!("Edge worker stopped");
    }

    fn unsubscribe(inner: &Weak<Inner>, pin: u32, id: u64) {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut lines = inner.lines();
        let removed = lines.get_mut(&pin).and_then(|watched| {
            let index = watched.subscribers.iter().position(|(sid, _, _)| *sid == id)?;
            Some(watched.subscribers.remove(index))
        });
        drop(lines);
        drop(removed);
    }
}

/// GpiodEdgeSource watches lines of a GPIO chip and reports their edges.
pub struct GpiodEdgeSource {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GpiodEdgeSource {
    /// Matches the default glitch filter width, so a filtered edge is seen within one extra period.
    ///
    /// The worker wakes up every interval whether or not anything changed: 100 µs is about
    /// 10k wakeups per second, a noticeable share of one core on a Pi Zero. A longer interval
    /// is cheaper but can miss pulses shorter than itself.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(100);

    /// Opens the chip at the given path, e.g. `/dev/gpiochip0`.
    pub fn open(path: impl AsRef<Path>, poll_interval: Duration) -> GpioResult<Self> {
        let chip = gpiod::Chip::new(path.as_ref())?;
        Self::new(chip, poll_interval)
    }

    pub fn new(chip: gpiod::Chip, poll_interval: Duration) -> GpioResult<Self> {
        if poll_interval.is_zero() {
            return Err(GpioError::InvalidArgument);
        }

        let n = chip.num_lines() as usize;
        let inner = Arc::new(Inner {
            chip,
            used_pins: BitVec::repeat(false, n),
            poll_interval,
            opened: Instant::now(),
            running: AtomicBool::new(true),
            lines: Mutex::default(),
            next_id: Mutex::new(0),
        });

        let worker_inner = inner.clone();
        let worker = thread::Builder::new()
            .name(concat!(env!("CARGO_PKG_NAME"), "-edges").to_string())
            .spawn(move || worker_inner.run())?;

        Ok(GpiodEdgeSource {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }
}

impl Debug for GpiodEdgeSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GpiodEdgeSource({})", self.inner.chip.name())
    }
}

impl EdgeSource for GpiodEdgeSource {
    fn configure_pin(&self, pin: u32, config: PinConfig) -> GpioResult<()> {
        let index = pin as usize;
        if index >= self.inner.used_pins.len() {
            return Err(GpioError::InvalidArgument);
        }

        // claim check and insertion happen under one lock
        let mut lines = self.inner.lines();
        if self.inner.used_pins[index] {
            return Err(GpioError::AlreadyInUse);
        }

        let line = self.inner.chip.request_lines(
            gpiod::Options::input([pin])
                .consumer(env!("CARGO_PKG_NAME"))
                .bias(config.bias.into()),
        )?;
        let initial = line.get_values([false])?[0];

        self.inner.used_pins.set_aliased(index, true);

        let now = Instant::now();
        lines.insert(pin, WatchedLine {
            line,
            filter: GlitchFilter::new(config.glitch_filter, initial),
            watchdog: IdleWatchdog::new(now),
            subscribers: Vec::new(),
        });
        drop(lines);
        debug!("{:?} configured pin {} with {:?}", self, pin, config);
        Ok(())
    }

    fn set_watchdog(&self, pin: u32, timeout: Option<Duration>) -> GpioResult<()> {
        let mut lines = self.inner.lines();
        let watched = lines.get_mut(&pin).ok_or(GpioError::UnknownPin(pin))?;
        watched.watchdog.arm(timeout, Instant::now());
        Ok(())
    }

    fn read_level(&self, pin: u32) -> GpioResult<bool> {
        let lines = self.inner.lines();
        lines.get(&pin).ok_or(GpioError::UnknownPin(pin))?.read()
    }

    fn subscribe(&self, pin: u32, edge: Edge, handler: EdgeHandler) -> GpioResult<Subscription> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(GpioError::NotConnected);
        }

        let id = {
            let mut next_id = self.inner.next_id.lock().unwrap_or_else(PoisonError::into_inner);
            *next_id += 1;
            *next_id
        };

        let mut lines = self.inner.lines();
        let watched = lines.get_mut(&pin).ok_or(GpioError::UnknownPin(pin))?;
        watched.subscribers.push((id, edge, handler));

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(pin, move || Inner::unsubscribe(&inner, pin, id)))
    }

    fn release_pin(&self, pin: u32) -> GpioResult<()> {
        let mut lines = self.inner.lines();
        let watched = lines.remove(&pin).ok_or(GpioError::UnknownPin(pin))?;
        self.inner.used_pins.set_aliased(pin as usize, false);
        drop(lines);

        if !watched.subscribers.is_empty() {
            warn!("Pin {} released with {} handler(s) still subscribed", pin, watched.subscribers.len());
        }
        // dropping the request gives the line back to the kernel
        drop(watched);
        debug!("{:?} released pin {}", self, pin);
        Ok(())
    }
}

impl Drop for GpiodEdgeSource {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            // the last handle can be dropped by a handler running on the worker itself
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                warn!("Edge worker panicked");
            }
        }
    }
}
