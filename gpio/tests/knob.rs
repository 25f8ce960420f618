use piknob_gpio::sim::SimEdgeSource;
use piknob_gpio::*;
use std::fmt::{Debug, Formatter};
use std::num::NonZeroU32;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

const BUTTON: u32 = 23;
const PIN_A: u32 = 27;
const PIN_B: u32 = 22;
const STEP: Duration = Duration::from_micros(500);

// A leads B clockwise: 11 -> 01 -> 00 -> 10 -> 11
const CW: [u8; 4] = [0b01, 0b00, 0b10, 0b11];
const CCW: [u8; 4] = [0b10, 0b00, 0b01, 0b11];

fn setup() -> (Arc<SimEdgeSource>, RotaryKnob) {
    let sim = Arc::new(SimEdgeSource::new());
    let knob = RotaryKnob::new(sim.clone(), KnobConfig::default()).unwrap();
    (sim, knob)
}

fn record_rotations(knob: &RotaryKnob) -> Arc<Mutex<Vec<RotationEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    knob.register_rotation_callback(move |e: &RotationEvent| sink.lock().unwrap().push(*e));
    events
}

fn record_buttons(knob: &RotaryKnob) -> Arc<Mutex<Vec<ButtonEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    knob.register_button_callback(move |e: &ButtonEvent| sink.lock().unwrap().push(*e));
    events
}

#[test]
fn configures_pins() {
    let (sim, knob) = setup();
    let expected = PinConfig::pull_up(Duration::from_micros(100));
    for pin in [BUTTON, PIN_A, PIN_B] {
        assert_eq!(sim.pin_config(pin), Some(expected));
        assert_eq!(sim.subscriber_count(pin), 1);
    }
    assert_eq!(sim.watchdog(BUTTON), Some(Duration::from_millis(1000)));
    assert_eq!(knob.get_position(), 0);
}

#[test]
fn sequence_through_a_first_is_clockwise() {
    let (sim, knob) = setup();
    let events = record_rotations(&knob);

    sim.drive_sequence(PIN_A, PIN_B, &CW, STEP).unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].direction, Direction::Clockwise);
    assert_eq!(events[0].position, 1);
    assert_eq!(events[0].angle_remainder_degrees, 4.5);
    assert_eq!(events[0].whole_rotations, 0);
    assert_eq!(knob.get_position(), 1);
}

#[test]
fn sequence_through_b_first_is_counter_clockwise() {
    let (sim, knob) = setup();
    let events = record_rotations(&knob);

    sim.drive_sequence(PIN_A, PIN_B, &CCW, STEP).unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].direction, Direction::CounterClockwise);
    assert_eq!(events[0].position, -1);
    assert_eq!(events[0].angle_remainder_degrees, 355.5);
    assert_eq!(events[0].whole_rotations, -1);
}

#[test]
fn steps_sum_algebraically() {
    let (sim, knob) = setup();
    for _ in 0..5 {
        sim.drive_sequence(PIN_A, PIN_B, &CW, STEP).unwrap();
    }
    assert_eq!(knob.get_position(), 5);
    for _ in 0..7 {
        sim.drive_sequence(PIN_A, PIN_B, &CCW, STEP).unwrap();
    }
    assert_eq!(knob.get_position(), -2);
}

#[test]
fn bounce_on_one_channel_is_absorbed() {
    let (sim, knob) = setup();
    let events = record_rotations(&knob);

    sim.set_level(PIN_A, false).unwrap();
    // B chatters before settling low
    for level in [false, true, false, true, false] {
        sim.set_level(PIN_B, level).unwrap();
    }
    sim.set_level(PIN_A, true).unwrap();
    sim.set_level(PIN_B, true).unwrap();

    assert_eq!(knob.get_position(), 1);
    assert_eq!(events.lock().unwrap().len(), 1);
}

#[test]
fn skipped_state_is_rejected() {
    let (sim, knob) = setup();
    let events = record_rotations(&knob);

    // both lines flip between samples: 11 -> 00 -> 11 has no direction
    sim.set_levels(&[(PIN_A, false), (PIN_B, false)]).unwrap();
    sim.set_levels(&[(PIN_A, true), (PIN_B, true)]).unwrap();

    assert_eq!(knob.get_position(), 0);
    assert!(events.lock().unwrap().is_empty());

    // decoding continues normally afterwards
    sim.drive_sequence(PIN_A, PIN_B, &CW, STEP).unwrap();
    assert_eq!(knob.get_position(), 1);
}

#[test]
fn full_rotation_angles() {
    let sim = Arc::new(SimEdgeSource::new());
    let config = KnobConfig::default().with_pulses_per_rotation(NonZeroU32::new(80).unwrap());
    let knob = RotaryKnob::new(sim.clone(), config).unwrap();
    let events = record_rotations(&knob);

    for _ in 0..90 {
        sim.drive_sequence(PIN_A, PIN_B, &CW, STEP).unwrap();
    }

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 90);
    assert_eq!(events[79].position, 80);
    assert_eq!(events[79].whole_rotations, 1);
    assert_eq!(events[79].angle_remainder_degrees, 0.0);
    assert_eq!(events[89].position, 90);
    assert_eq!(events[89].whole_rotations, 1);
    assert_eq!(events[89].angle_remainder_degrees, 45.0);
    assert_eq!(knob.angle(), (1, 45.0));
}

#[test]
fn reset_position() {
    let (sim, knob) = setup();
    sim.drive_sequence(PIN_A, PIN_B, &CW, STEP).unwrap();
    knob.reset_position();
    assert_eq!(knob.get_position(), 0);
    sim.drive_sequence(PIN_A, PIN_B, &CCW, STEP).unwrap();
    assert_eq!(knob.get_position(), -1);
}

#[test]
fn button_events_in_order() {
    let (sim, knob) = setup();
    let events = record_buttons(&knob);

    sim.set_level(BUTTON, false).unwrap();
    sim.advance(Duration::from_millis(20)).unwrap();
    sim.set_level(BUTTON, true).unwrap();
    sim.advance(Duration::from_millis(1000)).unwrap();
    assert_eq!(sim.fire_watchdog(BUTTON), Ok(true));
    sim.set_level(BUTTON, false).unwrap();

    let events = events.lock().unwrap();
    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ButtonEventKind::Pressed,
            ButtonEventKind::Released,
            ButtonEventKind::WatchdogTimeout,
            ButtonEventKind::Pressed,
        ]
    );
    let levels: Vec<_> = kinds.iter().map(|k| k.level()).collect();
    assert_eq!(levels, vec![0, 1, 2, 0]);
    assert_eq!(events[1].tick, 20_000);
    assert_eq!(events[3].tick, 1_020_000);
}

#[test]
fn last_callback_wins() {
    let (sim, knob) = setup();
    let first = record_buttons(&knob);
    let second = record_buttons(&knob);

    sim.set_level(BUTTON, false).unwrap();
    assert!(first.lock().unwrap().is_empty());
    assert_eq!(second.lock().unwrap().len(), 1);

    knob.clear_button_callback();
    sim.set_level(BUTTON, true).unwrap();
    assert_eq!(second.lock().unwrap().len(), 1);
}

#[test]
fn panicking_callback_does_not_stop_decoding() {
    let (sim, knob) = setup();
    knob.register_rotation_callback(|e: &RotationEvent| {
        if e.position == 1 {
            panic!("callback failure");
        }
    });

    sim.drive_sequence(PIN_A, PIN_B, &CW, STEP).unwrap();
    sim.drive_sequence(PIN_A, PIN_B, &CW, STEP).unwrap();

    assert_eq!(knob.get_position(), 2);
    assert_eq!(knob.callback_failures(), 1);
}

#[test]
fn callback_can_query_the_knob() {
    let (sim, knob) = setup();
    let knob = Arc::new(knob);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let weak = Arc::downgrade(&knob);
    let sink = seen.clone();
    knob.register_rotation_callback(move |_: &RotationEvent| {
        if let Some(knob) = weak.upgrade() {
            sink.lock().unwrap().push(knob.get_position());
        }
    });

    sim.drive_sequence(PIN_A, PIN_B, &CW, STEP).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![1]);
}

#[test]
fn shutdown_is_idempotent() {
    let (sim, knob) = setup();
    let events = record_rotations(&knob);

    knob.shutdown();
    knob.shutdown();
    assert!(knob.is_shut_down());

    for pin in [BUTTON, PIN_A, PIN_B] {
        assert_eq!(sim.subscriber_count(pin), 0);
    }
    assert_eq!(sim.cancelled_count(), 3);
    assert_eq!(sim.watchdog(BUTTON), None);

    sim.drive_sequence(PIN_A, PIN_B, &CW, STEP).unwrap();
    assert!(events.lock().unwrap().is_empty());

    drop(knob);
    assert_eq!(sim.cancelled_count(), 3);
}

#[test]
fn knob_can_be_rebuilt_after_shutdown() {
    let (sim, knob) = setup();
    knob.shutdown();
    for pin in [BUTTON, PIN_A, PIN_B] {
        assert_eq!(sim.pin_config(pin), None);
    }

    let knob = RotaryKnob::new(sim.clone(), KnobConfig::default()).unwrap();
    assert_eq!(sim.watchdog(BUTTON), Some(Duration::from_millis(1000)));
    sim.drive_sequence(PIN_A, PIN_B, &CW, STEP).unwrap();
    assert_eq!(knob.get_position(), 1);
}

#[test]
fn second_knob_on_the_same_pins_is_rejected() {
    let (sim, _knob) = setup();
    let result = RotaryKnob::new(sim.clone(), KnobConfig::default());
    assert_eq!(result.err(), Some(GpioError::AlreadyInUse));
    // the first knob keeps its pins
    assert_eq!(sim.subscriber_count(PIN_A), 1);
    assert_eq!(sim.watchdog(BUTTON), Some(Duration::from_millis(1000)));
}

/// Delegates to a simulated source but refuses subscriptions on one pin.
struct RefusingSource {
    sim: Arc<SimEdgeSource>,
    refused_pin: u32,
}

impl Debug for RefusingSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RefusingSource({})", self.refused_pin)
    }
}

impl EdgeSource for RefusingSource {
    fn configure_pin(&self, pin: u32, config: PinConfig) -> GpioResult<()> {
        self.sim.configure_pin(pin, config)
    }

    fn set_watchdog(&self, pin: u32, timeout: Option<Duration>) -> GpioResult<()> {
        self.sim.set_watchdog(pin, timeout)
    }

    fn read_level(&self, pin: u32) -> GpioResult<bool> {
        self.sim.read_level(pin)
    }

    fn subscribe(&self, pin: u32, edge: Edge, handler: EdgeHandler) -> GpioResult<Subscription> {
        if pin == self.refused_pin {
            return Err(GpioError::Io(std::io::ErrorKind::PermissionDenied));
        }
        self.sim.subscribe(pin, edge, handler)
    }

    fn release_pin(&self, pin: u32) -> GpioResult<()> {
        self.sim.release_pin(pin)
    }
}

#[test]
fn failed_subscription_releases_everything_acquired() {
    let sim = Arc::new(SimEdgeSource::new());
    let source = Arc::new(RefusingSource {
        sim: sim.clone(),
        refused_pin: PIN_B,
    });

    let result = RotaryKnob::new(source, KnobConfig::default());
    assert_eq!(result.err(), Some(GpioError::Io(std::io::ErrorKind::PermissionDenied)));

    // button and A were subscribed before B failed
    assert_eq!(sim.cancelled_count(), 2);
    for pin in [BUTTON, PIN_A, PIN_B] {
        assert_eq!(sim.subscriber_count(pin), 0);
        assert_eq!(sim.pin_config(pin), None);
    }
    assert_eq!(sim.watchdog(BUTTON), None);

    // nothing is left claimed
    let knob = RotaryKnob::new(sim.clone(), KnobConfig::default()).unwrap();
    sim.drive_sequence(PIN_A, PIN_B, &CCW, STEP).unwrap();
    assert_eq!(knob.get_position(), -1);
}

#[test]
fn drop_releases_subscriptions() {
    let (sim, knob) = setup();
    drop(knob);
    assert_eq!(sim.subscriber_count(PIN_A), 0);
    assert_eq!(sim.watchdog(BUTTON), None);
}

#[test]
fn disconnected_source_fails_construction() {
    let sim = Arc::new(SimEdgeSource::disconnected());
    let result = RotaryKnob::new(sim, KnobConfig::default());
    assert_eq!(result.err(), Some(GpioError::NotConnected));
}

#[test]
fn invalid_config_fails_construction() {
    let sim = Arc::new(SimEdgeSource::new());
    let result = RotaryKnob::new(sim.clone(), KnobConfig::new(4, 4, 5));
    assert!(matches!(result, Err(GpioError::InvalidConfig(_))));
    assert_eq!(sim.pin_config(4), None);
}

#[test]
fn disabled_watchdog_is_not_armed() {
    let sim = Arc::new(SimEdgeSource::new());
    let knob = RotaryKnob::new(sim.clone(), KnobConfig::default().with_watchdog(None)).unwrap();
    let events = record_buttons(&knob);

    assert_eq!(sim.watchdog(BUTTON), None);
    assert_eq!(sim.fire_watchdog(BUTTON), Ok(false));
    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn concurrent_channels_stay_consistent() {
    let (sim, knob) = setup();
    let knob = Arc::new(knob);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let knob = knob.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let _ = knob.get_position();
                }
            })
        })
        .collect();

    for _ in 0..100 {
        sim.drive_sequence(PIN_A, PIN_B, &CW, STEP).unwrap();
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(knob.get_position(), 100);
}

#[test]
fn channels_driven_from_separate_threads() {
    const DETENTS: usize = 200;

    for _ in 0..20 {
        let (sim, knob) = setup();
        let barrier = Arc::new(Barrier::new(2));

        // A changes on even steps, B on odd ones; both go low in the first half of a detent
        let drivers: Vec<_> = [(PIN_A, 0), (PIN_B, 1)]
            .into_iter()
            .map(|(pin, parity)| {
                let sim = sim.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    for step in 0..4 * DETENTS {
                        if step % 2 == parity {
                            sim.set_level(pin, step % 4 >= 2).unwrap();
                        }
                        barrier.wait();
                    }
                })
            })
            .collect();

        for driver in drivers {
            driver.join().unwrap();
        }
        assert_eq!(knob.get_position(), DETENTS as i64);
    }
}
