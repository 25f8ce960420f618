//! A rotary encoder with an integrated push button, driven entirely by edge notifications.

use std::fmt::{Debug, Formatter};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use log::{debug, info, warn};
use crate::button::ButtonEvent;
use crate::dispatch::EventDispatcher;
use crate::rotenc::{ChannelSampler, QuadratureDecoder, RotationEvent, split_angle};
use crate::{Edge, EdgeEvent, EdgeSource, GpioError, GpioResult, PinConfig, Subscription};

/// Static configuration of a [RotaryKnob].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KnobConfig {
    pub button_pin: u32,
    pub pin_a: u32,
    pub pin_b: u32,
    /// Idle period after which the button reports a watchdog timeout. `None` disables it.
    pub watchdog: Option<Duration>,
    pub glitch_filter: Duration,
    pub pulses_per_rotation: NonZeroU32,
    /// How many channel states are kept while waiting for the idle detent.
    pub buffer_limit: usize,
}

impl KnobConfig {
    pub const DEFAULT_PULSES_PER_ROTATION: NonZeroU32 = match NonZeroU32::new(80) {
        Some(n) => n,
        None => unreachable!(),
    };
    pub const MAX_GLITCH_FILTER: Duration = Duration::from_millis(300);
    pub const MAX_WATCHDOG: Duration = Duration::from_secs(60);

    pub fn new(button_pin: u32, pin_a: u32, pin_b: u32) -> Self {
        KnobConfig {
            button_pin,
            pin_a,
            pin_b,
            ..Self::default()
        }
    }

    pub fn with_watchdog(mut self, watchdog: Option<Duration>) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn with_glitch_filter(mut self, glitch_filter: Duration) -> Self {
        self.glitch_filter = glitch_filter;
        self
    }

    pub fn with_pulses_per_rotation(mut self, pulses_per_rotation: NonZeroU32) -> Self {
        self.pulses_per_rotation = pulses_per_rotation;
        self
    }

    pub fn with_buffer_limit(mut self, buffer_limit: usize) -> Self {
        self.buffer_limit = buffer_limit;
        self
    }

    pub fn validate(&self) -> GpioResult<()> {
        let pins = [self.button_pin, self.pin_a, self.pin_b];
        if pins[0] == pins[1] || pins[0] == pins[2] || pins[1] == pins[2] {
            return Err(GpioError::InvalidConfig(format!("pins must be distinct, got {:?}", pins)));
        }
        if self.buffer_limit < 2 {
            return Err(GpioError::InvalidConfig(format!(
                "buffer limit must be at least 2, got {}",
                self.buffer_limit
            )));
        }
        if self.glitch_filter > Self::MAX_GLITCH_FILTER {
            return Err(GpioError::InvalidConfig(format!(
                "glitch filter {:?} exceeds {:?}",
                self.glitch_filter,
                Self::MAX_GLITCH_FILTER
            )));
        }
        if self.watchdog.is_some_and(|w| w > Self::MAX_WATCHDOG) {
            return Err(GpioError::InvalidConfig(format!(
                "watchdog {:?} exceeds {:?}",
                self.watchdog,
                Self::MAX_WATCHDOG
            )));
        }
        Ok(())
    }
}

impl Default for KnobConfig {
    fn default() -> Self {
        KnobConfig {
            button_pin: 23,
            pin_a: 27,
            pin_b: 22,
            watchdog: Some(Duration::from_millis(1000)),
            glitch_filter: Duration::from_micros(100),
            pulses_per_rotation: Self::DEFAULT_PULSES_PER_ROTATION,
            buffer_limit: QuadratureDecoder::DEFAULT_BUFFER_LIMIT,
        }
    }
}

/// State shared between the knob and its edge handlers.
struct Shared {
    config: KnobConfig,
    sampler: ChannelSampler,
    decoder: Mutex<QuadratureDecoder>,
    dispatcher: EventDispatcher,
}

impl Shared {
    fn decoder(&self) -> MutexGuard<'_, QuadratureDecoder> {
        self.decoder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_channel_edge(&self, edge: EdgeEvent) {
        let step = {
            // sampling happens under the lock so edges from A and B can't interleave
            let mut decoder = self.decoder();
            let state = match self.sampler.sample() {
                Ok(state) => state,
                Err(err) => {
                    warn!("Failed to sample encoder after edge on pin {}: {}", edge.pin, err);
                    return;
                }
            };
            decoder.push(state)
        };

        if let Some(step) = step {
            let event = RotationEvent::new(step.direction, step.position, self.config.pulses_per_rotation);
            self.dispatcher.dispatch_rotation(&event);
        }
    }

    fn on_button_edge(&self, edge: EdgeEvent) {
        let event = ButtonEvent::classify(&edge);
        debug!("Button {:?} at {}", event.kind, event.tick);
        self.dispatcher.dispatch_button(&event);
    }
}

/// Resources held on the edge source, released by [RotaryKnob::shutdown].
struct Resources {
    source: Option<Arc<dyn EdgeSource>>,
    pins: Vec<u32>,
    subscriptions: Vec<Subscription>,
    watchdog_pin: Option<u32>,
}

impl Resources {
    fn release(&mut self) {
        for subscription in &mut self.subscriptions {
            subscription.cancel();
        }
        self.subscriptions.clear();

        if let Some(source) = self.source.take() {
            if let Some(pin) = self.watchdog_pin.take() {
                if let Err(err) = source.set_watchdog(pin, None) {
                    warn!("Failed to disarm watchdog on pin {}: {}", pin, err);
                }
            }
            for pin in self.pins.drain(..).rev() {
                if let Err(err) = source.release_pin(pin) {
                    warn!("Failed to release pin {}: {}", pin, err);
                }
            }
        }
    }
}

impl Drop for Resources {
    fn drop(&mut self) {
        self.release();
    }
}

/// A rotary encoder with a push button.
///
/// Rotation is decoded from edges on the two channel pins; the button reports presses,
/// releases and watchdog timeouts. Events are delivered to at most one callback of each kind,
/// synchronously on the thread the edge source notifies from.
pub struct RotaryKnob {
    shared: Arc<Shared>,
    resources: Mutex<Resources>,
    shut_down: AtomicBool,
}

impl RotaryKnob {
    /// Sets up the pins on the source and starts decoding.
    ///
    /// # Errors
    /// - `GpioError::InvalidConfig` if the configuration is invalid.
    /// - Any error of the source. Whatever was set up before the failure is released again.
    pub fn new(source: Arc<dyn EdgeSource>, config: KnobConfig) -> GpioResult<Self> {
        config.validate()?;

        let mut resources = Resources {
            source: Some(source.clone()),
            pins: Vec::with_capacity(3),
            subscriptions: Vec::with_capacity(3),
            watchdog_pin: None,
        };

        let pin_config = PinConfig::pull_up(config.glitch_filter);
        for pin in [config.button_pin, config.pin_a, config.pin_b] {
            source.configure_pin(pin, pin_config)?;
            resources.pins.push(pin);
        }

        if let Some(watchdog) = config.watchdog {
            resources.watchdog_pin = Some(config.button_pin);
            source.set_watchdog(config.button_pin, Some(watchdog))?;
        }

        let sampler = ChannelSampler::new(source.clone(), config.pin_a, config.pin_b);
        let baseline = sampler.sample()?;
        debug!("Encoder baseline state {:?}", baseline);

        let shared = Arc::new(Shared {
            config,
            sampler,
            decoder: Mutex::new(QuadratureDecoder::new(baseline, config.buffer_limit)),
            dispatcher: EventDispatcher::new(),
        });

        let handler_shared = shared.clone();
        resources.subscriptions.push(source.subscribe(
            config.button_pin,
            Edge::Either,
            Arc::new(move |edge: EdgeEvent| handler_shared.on_button_edge(edge)),
        )?);
        for pin in [config.pin_a, config.pin_b] {
            let handler_shared = shared.clone();
            resources.subscriptions.push(source.subscribe(
                pin,
                Edge::Either,
                Arc::new(move |edge: EdgeEvent| handler_shared.on_channel_edge(edge)),
            )?);
        }

        info!(
            "Rotary knob ready on {:?} (button {}, A {}, B {})",
            source, config.button_pin, config.pin_a, config.pin_b
        );

        Ok(RotaryKnob {
            shared,
            resources: Mutex::new(resources),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &KnobConfig {
        &self.shared.config
    }

    pub fn register_rotation_callback(&self, callback: impl Fn(&RotationEvent) + Send + Sync + 'static) {
        self.shared.dispatcher.set_rotation_callback(Some(Arc::new(callback)));
    }

    pub fn register_button_callback(&self, callback: impl Fn(&ButtonEvent) + Send + Sync + 'static) {
        self.shared.dispatcher.set_button_callback(Some(Arc::new(callback)));
    }

    pub fn clear_rotation_callback(&self) {
        self.shared.dispatcher.set_rotation_callback(None);
    }

    pub fn clear_button_callback(&self) {
        self.shared.dispatcher.set_button_callback(None);
    }

    /// How many callback invocations have panicked.
    pub fn callback_failures(&self) -> usize {
        self.shared.dispatcher.failures()
    }

    pub fn get_position(&self) -> i64 {
        self.shared.decoder().position()
    }

    pub fn reset_position(&self) {
        self.shared.decoder().reset_position();
    }

    /// Gets the current position as whole rotations and the angle within the rotation.
    pub fn angle(&self) -> (i64, f64) {
        split_angle(self.get_position(), self.shared.config.pulses_per_rotation)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Cancels all edge subscriptions, disarms the button watchdog and releases the pins.
    ///
    /// Calling this more than once does nothing. Also done on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.resources.lock().unwrap_or_else(PoisonError::into_inner).release();
        info!("Rotary knob shut down at position {}", self.get_position());
    }
}

impl Debug for RotaryKnob {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RotaryKnob(button {}, A {}, B {})",
            self.shared.config.button_pin, self.shared.config.pin_a, self.shared.config.pin_b
        )
    }
}

impl Drop for RotaryKnob {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = KnobConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.pulses_per_rotation, KnobConfig::DEFAULT_PULSES_PER_ROTATION);
        assert_eq!(config.pulses_per_rotation.get(), 80);
        assert_eq!(config.buffer_limit, 10);
    }

    #[test]
    fn rejects_shared_pins() {
        let config = KnobConfig::new(5, 6, 5);
        assert!(matches!(config.validate(), Err(GpioError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_tiny_buffer() {
        let config = KnobConfig::default().with_buffer_limit(1);
        assert!(matches!(config.validate(), Err(GpioError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_out_of_range_timings() {
        let config = KnobConfig::default().with_glitch_filter(Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(GpioError::InvalidConfig(_))));

        let config = KnobConfig::default().with_watchdog(Some(Duration::from_secs(61)));
        assert!(matches!(config.validate(), Err(GpioError::InvalidConfig(_))));

        let config = KnobConfig::default().with_watchdog(None);
        assert_eq!(config.validate(), Ok(()));
    }
}
