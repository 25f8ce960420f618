//! An in-memory [EdgeSource] for tests and bring-up without hardware.
//!
//! Levels are changed by hand and edges are delivered synchronously on the calling thread.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use log::trace;
use crate::{Edge, EdgeEvent, EdgeHandler, EdgeSource, GpioBias, GpioError, GpioResult, Level, PinConfig, Subscription};

#[derive(Default)]
struct SimPin {
    config: PinConfig,
    level: bool,
    watchdog: Option<Duration>,
    subscribers: Vec<(u64, Edge, EdgeHandler)>,
}

#[derive(Default)]
struct SimState {
    pins: HashMap<u32, SimPin>,
    tick: u64,
    next_id: u64,
    cancelled: usize,
}

#[derive(Default)]
struct Inner {
    connected: bool,
    state: Mutex<SimState>,
}

/// Simulated GPIO lines.
///
/// Pins must be configured before they can be read or subscribed to, like real hardware.
/// A pull-up configures the line high, anything else low.
pub struct SimEdgeSource {
    inner: Arc<Inner>,
}

impl SimEdgeSource {
    pub fn new() -> Self {
        SimEdgeSource {
            inner: Arc::new(Inner {
                connected: true,
                state: Mutex::default(),
            }),
        }
    }

    /// A source whose every operation fails with [GpioError::NotConnected].
    pub fn disconnected() -> Self {
        SimEdgeSource {
            inner: Arc::new(Inner::default()),
        }
    }

    fn lock(&self) -> GpioResult<MutexGuard<'_, SimState>> {
        if !self.inner.connected {
            return Err(GpioError::NotConnected);
        }
        Ok(self.inner.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Advances the simulated clock.
    pub fn advance(&self, duration: Duration) -> GpioResult<()> {
        let mut state = self.lock()?;
        state.tick += duration.as_micros() as u64;
        Ok(())
    }

    /// Changes the level of a pin, notifying subscribers if it actually changed.
    pub fn set_level(&self, pin: u32, level: bool) -> GpioResult<()> {
        let (event, handlers) = {
            let mut state = self.lock()?;
            let tick = state.tick;
            let sim_pin = state.pins.get_mut(&pin).ok_or(GpioError::UnknownPin(pin))?;
            if sim_pin.level == level {
                return Ok(());
            }
            sim_pin.level = level;

            let event = EdgeEvent {
                pin,
                level: Level::from_bool(level),
                tick,
            };
            (event, Self::handlers_for(sim_pin, event.level))
        };

        trace!("Sim edge {:?} -> {} handler(s)", event, handlers.len());
        for handler in handlers {
            handler(event);
        }
        Ok(())
    }

    /// Changes several pins at once, as if they switched within a single sampling instant.
    ///
    /// Subscribers are notified afterwards, in the order the pins were given,
    /// so every handler already sees all of the new levels.
    pub fn set_levels(&self, levels: &[(u32, bool)]) -> GpioResult<()> {
        let notifications = {
            let mut state = self.lock()?;
            let tick = state.tick;
            if let Some(&(pin, _)) = levels.iter().find(|(pin, _)| !state.pins.contains_key(pin)) {
                return Err(GpioError::UnknownPin(pin));
            }

            let mut notifications = Vec::new();
            for &(pin, level) in levels {
                let Some(sim_pin) = state.pins.get_mut(&pin) else {
                    continue;
                };
                if sim_pin.level == level {
                    continue;
                }
                sim_pin.level = level;
                let event = EdgeEvent {
                    pin,
                    level: Level::from_bool(level),
                    tick,
                };
                notifications.push((event, Self::handlers_for(sim_pin, event.level)));
            }
            notifications
        };

        for (event, handlers) in notifications {
            for handler in handlers {
                handler(event);
            }
        }
        Ok(())
    }

    /// Drives the two lines of an encoder through a sequence of packed `A << 1 | B` states,
    /// changing one line at a time and advancing the clock by `step` after each state.
    pub fn drive_sequence(&self, pin_a: u32, pin_b: u32, states: &[u8], step: Duration) -> GpioResult<()> {
        for &bits in states {
            if bits > 0b11 {
                return Err(GpioError::InvalidArgument);
            }
            self.set_level(pin_a, bits & 0b10 != 0)?;
            self.set_level(pin_b, bits & 0b01 != 0)?;
            self.advance(step)?;
        }
        Ok(())
    }

    /// Delivers a watchdog timeout to the subscribers of the pin, if its watchdog is armed.
    ///
    /// Returns whether the watchdog was armed.
    pub fn fire_watchdog(&self, pin: u32) -> GpioResult<bool> {
        let (event, handlers) = {
            let state = self.lock()?;
            let tick = state.tick;
            let sim_pin = state.pins.get(&pin).ok_or(GpioError::UnknownPin(pin))?;
            if sim_pin.watchdog.is_none() {
                return Ok(false);
            }
            let event = EdgeEvent {
                pin,
                level: Level::WatchdogTimeout,
                tick,
            };
            (event, Self::handlers_for(sim_pin, event.level))
        };

        for handler in handlers {
            handler(event);
        }
        Ok(true)
    }

    pub fn pin_config(&self, pin: u32) -> Option<PinConfig> {
        self.lock().ok()?.pins.get(&pin).map(|p| p.config)
    }

    pub fn watchdog(&self, pin: u32) -> Option<Duration> {
        self.lock().ok()?.pins.get(&pin).and_then(|p| p.watchdog)
    }

    pub fn subscriber_count(&self, pin: u32) -> usize {
        self.lock()
            .map(|state| state.pins.get(&pin).map_or(0, |p| p.subscribers.len()))
            .unwrap_or(0)
    }

    /// How many subscriptions have been cancelled over the lifetime of the source.
    pub fn cancelled_count(&self) -> usize {
        self.lock().map(|state| state.cancelled).unwrap_or(0)
    }

    fn handlers_for(pin: &SimPin, level: Level) -> Vec<EdgeHandler> {
        pin.subscribers
            .iter()
            .filter(|(_, edge, _)| edge.accepts(level))
            .map(|(_, _, handler)| handler.clone())
            .collect()
    }

    fn unsubscribe(inner: &Weak<Inner>, pin: u32, id: u64) {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = state.pins.get_mut(&pin).and_then(|p| {
            let index = p.subscribers.iter().position(|(sid, _, _)| *sid == id)?;
            Some(p.subscribers.remove(index))
        });
        if removed.is_some() {
            state.cancelled += 1;
        }
        // the handler is dropped after the lock is released
        drop(state);
        drop(removed);
    }
}

impl Default for SimEdgeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for SimEdgeSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimEdgeSource({})", if self.inner.connected { "connected" } else { "disconnected" })
    }
}

impl EdgeSource for SimEdgeSource {
    fn configure_pin(&self, pin: u32, config: PinConfig) -> GpioResult<()> {
        let mut state = self.lock()?;
        if state.pins.contains_key(&pin) {
            return Err(GpioError::AlreadyInUse);
        }
        state.pins.insert(pin, SimPin {
            config,
            level: config.bias == GpioBias::PullUp,
            ..SimPin::default()
        });
        Ok(())
    }

    fn set_watchdog(&self, pin: u32, timeout: Option<Duration>) -> GpioResult<()> {
        let mut state = self.lock()?;
        let sim_pin = state.pins.get_mut(&pin).ok_or(GpioError::UnknownPin(pin))?;
        sim_pin.watchdog = timeout.filter(|t| !t.is_zero());
        Ok(())
    }

    fn read_level(&self, pin: u32) -> GpioResult<bool> {
        let state = self.lock()?;
        state.pins.get(&pin).map(|p| p.level).ok_or(GpioError::UnknownPin(pin))
    }

    fn subscribe(&self, pin: u32, edge: Edge, handler: EdgeHandler) -> GpioResult<Subscription> {
        let mut state = self.lock()?;
        let id = state.next_id;
        state.next_id += 1;
        let sim_pin = state.pins.get_mut(&pin).ok_or(GpioError::UnknownPin(pin))?;
        sim_pin.subscribers.push((id, edge, handler));

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(pin, move || Self::unsubscribe(&inner, pin, id)))
    }

    fn release_pin(&self, pin: u32) -> GpioResult<()> {
        let removed = self.lock()?.pins.remove(&pin).ok_or(GpioError::UnknownPin(pin))?;
        drop(removed);
        Ok(())
    }
}
