use std::env::var_os;
use std::ffi::OsStr;
use std::num::NonZeroU32;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use serde::Deserialize;
use thiserror::Error;
use piknob_gpio::KnobConfig;
use piknob_gpio::gpiod::GpiodEdgeSource;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("pulses per rotation must not be zero")]
    ZeroPulses,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub gpio_chip: String,
    pub poll_interval_us: u64,
    pub button_pin: u32,
    pub pin_a: u32,
    pub pin_b: u32,
    /// 0 disables the button watchdog.
    pub watchdog_ms: u64,
    pub glitch_us: u64,
    pub pulses_per_rotation: u32,
    pub buffer_limit: usize,
    /// Stop after this many seconds. Runs until interrupted if unset.
    pub run_seconds: Option<u64>,
}

impl Config {
    pub fn try_load() -> Option<Self> {
        let config_str = var_os("CONFIG_FILE");
        let config_str: &OsStr = config_str.as_deref().unwrap_or(OsStr::new("piknob.json"));
        let config_path = Path::new(config_str);
        if config_path.exists() {
            let file = std::fs::File::open(config_path).ok()?;
            let reader = std::io::BufReader::new(file);
            serde_json::from_reader(reader).ok()
        } else {
            None
        }
    }

    /// Overrides fields from `PIKNOB_*` variables, looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn parse<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue { key, value })
        }

        if let Some(value) = lookup("PIKNOB_GPIO_CHIP") {
            self.gpio_chip = value;
        }
        if let Some(value) = lookup("PIKNOB_POLL_US") {
            self.poll_interval_us = parse("PIKNOB_POLL_US", value)?;
        }
        if let Some(value) = lookup("PIKNOB_PIN_BUTTON") {
            self.button_pin = parse("PIKNOB_PIN_BUTTON", value)?;
        }
        if let Some(value) = lookup("PIKNOB_PIN_A") {
            self.pin_a = parse("PIKNOB_PIN_A", value)?;
        }
        if let Some(value) = lookup("PIKNOB_PIN_B") {
            self.pin_b = parse("PIKNOB_PIN_B", value)?;
        }
        if let Some(value) = lookup("PIKNOB_WATCHDOG_MS") {
            self.watchdog_ms = parse("PIKNOB_WATCHDOG_MS", value)?;
        }
        if let Some(value) = lookup("PIKNOB_GLITCH_US") {
            self.glitch_us = parse("PIKNOB_GLITCH_US", value)?;
        }
        if let Some(value) = lookup("PIKNOB_PULSES_PER_ROTATION") {
            self.pulses_per_rotation = parse("PIKNOB_PULSES_PER_ROTATION", value)?;
        }
        if let Some(value) = lookup("PIKNOB_BUFFER_LIMIT") {
            self.buffer_limit = parse("PIKNOB_BUFFER_LIMIT", value)?;
        }
        if let Some(value) = lookup("PIKNOB_RUN_SECONDS") {
            self.run_seconds = Some(parse("PIKNOB_RUN_SECONDS", value)?);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn knob_config(&self) -> Result<KnobConfig, ConfigError> {
        let pulses_per_rotation = NonZeroU32::new(self.pulses_per_rotation).ok_or(ConfigError::ZeroPulses)?;
        let watchdog = (self.watchdog_ms > 0).then(|| Duration::from_millis(self.watchdog_ms));

        Ok(KnobConfig::new(self.button_pin, self.pin_a, self.pin_b)
            .with_watchdog(watchdog)
            .with_glitch_filter(Duration::from_micros(self.glitch_us))
            .with_pulses_per_rotation(pulses_per_rotation)
            .with_buffer_limit(self.buffer_limit))
    }
}

impl Default for Config {
    fn default() -> Self {
        let knob = KnobConfig::default();
        Config {
            gpio_chip: "/dev/gpiochip0".to_string(),
            poll_interval_us: GpiodEdgeSource::DEFAULT_POLL_INTERVAL.as_micros() as u64,
            button_pin: knob.button_pin,
            pin_a: knob.pin_a,
            pin_b: knob.pin_b,
            watchdog_ms: 1000,
            glitch_us: 100,
            pulses_per_rotation: knob.pulses_per_rotation.get(),
            buffer_limit: knob.buffer_limit,
            run_seconds: None,
        }
    }
}
