//! Classification of push-button notifications.
//!
//! The edge source is trusted to have glitch-filtered the line already,
//! so every notification maps to exactly one event.

use crate::{EdgeEvent, Level};

/// What happened to the button.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ButtonEventKind {
    /// The line fell; the button is wired active-low.
    Pressed,
    /// The line rose again.
    Released,
    /// No edge was seen for the watchdog period. A liveness signal, not an error.
    WatchdogTimeout,
}

impl ButtonEventKind {
    /// The raw level number of the notification this kind comes from.
    pub fn level(&self) -> u8 {
        self.source_level().raw()
    }

    fn source_level(&self) -> Level {
        match self {
            ButtonEventKind::Pressed => Level::Low,
            ButtonEventKind::Released => Level::High,
            ButtonEventKind::WatchdogTimeout => Level::WatchdogTimeout,
        }
    }
}

impl From<Level> for ButtonEventKind {
    fn from(level: Level) -> Self {
        match level {
            Level::Low => ButtonEventKind::Pressed,
            Level::High => ButtonEventKind::Released,
            Level::WatchdogTimeout => ButtonEventKind::WatchdogTimeout,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ButtonEvent {
    pub kind: ButtonEventKind,
    /// Tick of the notification, in microseconds.
    pub tick: u64,
}

impl ButtonEvent {
    pub fn classify(event: &EdgeEvent) -> Self {
        ButtonEvent {
            kind: event.level.into(),
            tick: event.tick,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_in_order() {
        let kinds: Vec<_> = [0u8, 1, 2, 0]
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                let event = EdgeEvent {
                    pin: 23,
                    level: Level::try_from(raw).unwrap(),
                    tick: i as u64,
                };
                ButtonEvent::classify(&event)
            })
            .collect();

        assert_eq!(
            kinds.iter().map(|e| e.kind).collect::<Vec<_>>(),
            vec![
                ButtonEventKind::Pressed,
                ButtonEventKind::Released,
                ButtonEventKind::WatchdogTimeout,
                ButtonEventKind::Pressed,
            ]
        );
        assert_eq!(kinds.iter().map(|e| e.tick).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn level_round_trips() {
        for raw in 0..3u8 {
            let kind = ButtonEventKind::from(Level::try_from(raw).unwrap());
            assert_eq!(kind.level(), raw);
        }
        assert_eq!(Level::try_from(3), Err(crate::GpioError::InvalidArgument));
    }
}
