pub mod gpiod;
pub mod sim;
pub mod rotenc;
pub mod button;
pub mod dispatch;
pub mod knob;

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use button::{ButtonEvent, ButtonEventKind};
pub use dispatch::EventDispatcher;
pub use knob::{KnobConfig, RotaryKnob};
pub use rotenc::{ChannelState, Direction, QuadratureDecoder, RotationEvent, TransitionCode};

#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum GpioError {
    #[error("pin already in use")]
    AlreadyInUse,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("edge source is not connected")]
    NotConnected,
    #[error("pin {0} was not configured")]
    UnknownPin(u32),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("IO error: {0}")]
    Io(std::io::ErrorKind),
}

impl From<std::io::Error> for GpioError {
    fn from(err: std::io::Error) -> Self {
        GpioError::Io(err.kind())
    }
}

pub type GpioResult<T> = Result<T, GpioError>;

/// Specifies the bias of the GPIO pin.
///
/// You can use this to enable pull-up or pull-down resistors.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum GpioBias {
    #[default] None,
    PullUp,
    PullDown,
}

/// Input settings applied to a pin before subscribing to it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PinConfig {
    pub bias: GpioBias,
    /// Pulses shorter than this are not reported.
    ///
    /// A new level is only reported once it has been stable for this long.
    pub glitch_filter: Duration,
}

impl PinConfig {
    pub fn pull_up(glitch_filter: Duration) -> Self {
        PinConfig {
            bias: GpioBias::PullUp,
            glitch_filter,
        }
    }
}

/// Which transitions a subscription wants to hear about.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Edge {
    Rising,
    Falling,
    #[default] Either,
}

impl Edge {
    /// Whether an observed level should be delivered to a subscription with this filter.
    ///
    /// Watchdog timeouts are always delivered.
    pub fn accepts(&self, level: Level) -> bool {
        match (self, level) {
            (_, Level::WatchdogTimeout) => true,
            (Edge::Either, _) => true,
            (Edge::Rising, Level::High) => true,
            (Edge::Falling, Level::Low) => true,
            _ => false,
        }
    }
}

/// The level reported with an edge notification.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Level {
    /// The line went low (falling edge).
    Low,
    /// The line went high (rising edge).
    High,
    /// No edge was seen on the line for the armed watchdog period.
    WatchdogTimeout,
}

impl Level {
    pub fn from_bool(value: bool) -> Self {
        if value { Level::High } else { Level::Low }
    }

    /// The raw level number: 0 for low, 1 for high, 2 for a watchdog timeout.
    pub fn raw(&self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
            Level::WatchdogTimeout => 2,
        }
    }
}

impl TryFrom<u8> for Level {
    type Error = GpioError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Level::Low),
            1 => Ok(Level::High),
            2 => Ok(Level::WatchdogTimeout),
            _ => Err(GpioError::InvalidArgument),
        }
    }
}

/// A single notification delivered by an [EdgeSource].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EdgeEvent {
    pub pin: u32,
    pub level: Level,
    /// Microseconds since the edge source was opened.
    pub tick: u64,
}

pub type EdgeHandler = Arc<dyn Fn(EdgeEvent) + Send + Sync>;

/// Handle to a registered edge handler.
///
/// The handler stays registered until [Subscription::cancel] is called or the handle is dropped.
pub struct Subscription {
    pin: u32,
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(pin: u32, canceller: impl FnOnce() + Send + 'static) -> Self {
        Subscription {
            pin,
            canceller: Some(Box::new(canceller)),
        }
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn is_active(&self) -> bool {
        self.canceller.is_some()
    }

    /// Unregisters the handler. Calling this more than once does nothing.
    pub fn cancel(&mut self) {
        if let Some(canceller) = self.canceller.take() {
            canceller();
        }
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subscription({}{})", self.pin, if self.is_active() { "" } else { ", cancelled" })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A provider of edge notifications for input pins.
///
/// Handlers may be invoked from any thread, including concurrently for different pins,
/// and must not be invoked while the source holds its own internal locks,
/// so calling back into the source from a handler is allowed.
pub trait EdgeSource: Debug + Send + Sync {
    /// Sets the pin up as an input with the given bias and glitch filter.
    fn configure_pin(&self, pin: u32, config: PinConfig) -> GpioResult<()>;

    /// Arms (`Some`) or disarms (`None`) the idle watchdog of the pin.
    ///
    /// An armed watchdog delivers a [Level::WatchdogTimeout] event whenever no edge
    /// was seen for the given period.
    fn set_watchdog(&self, pin: u32, timeout: Option<Duration>) -> GpioResult<()>;

    /// Reads the current logical level of the pin.
    fn read_level(&self, pin: u32) -> GpioResult<bool>;

    /// Registers a handler for edges on the pin.
    fn subscribe(&self, pin: u32, edge: Edge, handler: EdgeHandler) -> GpioResult<Subscription>;

    /// Gives the pin back, dropping its watchdog and any remaining handlers.
    ///
    /// The pin can be configured again afterwards.
    fn release_pin(&self, pin: u32) -> GpioResult<()>;
}
