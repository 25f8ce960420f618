mod config;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use dotenv::dotenv;
use eyre::WrapErr;
use log::{debug, info};
use sysinfo::System;
use piknob_gpio::gpiod::GpiodEdgeSource;
use piknob_gpio::{ButtonEventKind, RotaryKnob};
use crate::config::Config;

/// Sleeps in `tick` steps until `stop` is set or the deadline passes.
fn wait_until_stopped(stop: &AtomicBool, deadline: Option<Instant>, tick: Duration) {
    while !stop.load(Ordering::Relaxed) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        thread::sleep(tick);
    }
}

fn main() -> eyre::Result<()> {
    // Initialize environment and logger
    dotenv().ok();
    pretty_env_logger::init();

    const UNKNOWN_STR: &str = "???";

    info!(
        "PiKnob v{} starting on {}",
        env!("CARGO_PKG_VERSION"),
        System::host_name().as_deref().unwrap_or(UNKNOWN_STR)
    );
    info!(
        "System ver {} kernel ver {} ({})",
        System::long_os_version().as_deref().unwrap_or(UNKNOWN_STR),
        System::kernel_version().as_deref().unwrap_or(UNKNOWN_STR),
        System::cpu_arch(),
    );

    debug!("Trying to load config...");
    let mut config = if let Some(config) = Config::try_load() {
        info!("Config loaded.");
        config
    } else {
        info!("Config not found. Using default");
        Config::default()
    };
    config.apply_overrides(|key| dotenv::var(key).ok())?;
    let knob_config = config.knob_config()?;

    info!(
        "Knob @ Button: {}, A: {}, B: {}, {} pulses per rotation",
        knob_config.button_pin, knob_config.pin_a, knob_config.pin_b, knob_config.pulses_per_rotation
    );

    debug!("Initializing edge source on {}...", config.gpio_chip);
    let source = Arc::new(GpiodEdgeSource::open(&config.gpio_chip, config.poll_interval())?);
    debug!("{:?} initialized.", source);

    let knob = RotaryKnob::new(source, knob_config)?;

    knob.register_rotation_callback(|event| {
        info!(
            "{} -> position {} ({} rotations + {:.1}°)",
            event.direction, event.position, event.whole_rotations, event.angle_remainder_degrees
        );
    });
    knob.register_button_callback(|event| match event.kind {
        ButtonEventKind::Pressed => info!("Button pressed at {}", event.tick),
        ButtonEventKind::Released => info!("Button released at {}", event.tick),
        ButtonEventKind::WatchdogTimeout => debug!("Button idle at {}", event.tick),
    });

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
            .wrap_err("failed to install signal handler")?;
    }

    info!("PiKnob initialized.");

    let deadline = config.run_seconds.map(|s| Instant::now() + Duration::from_secs(s));
    wait_until_stopped(&stop, deadline, Duration::from_millis(100));
    if stop.load(Ordering::Relaxed) {
        info!("Interrupted, shutting down...");
    }

    knob.shutdown();
    let (rotations, degrees) = knob.angle();
    info!("Final position {} ({} rotations + {:.1}°)", knob.get_position(), rotations, degrees);

    Ok(())
}
