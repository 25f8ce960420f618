//! Routing of resolved events to the registered application callbacks.

use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use log::error;
use crate::button::ButtonEvent;
use crate::rotenc::RotationEvent;

pub type RotationCallback = Arc<dyn Fn(&RotationEvent) + Send + Sync>;
pub type ButtonCallback = Arc<dyn Fn(&ButtonEvent) + Send + Sync>;

/// Holds at most one rotation callback and one button callback.
///
/// Registering replaces the previous callback.
/// Callbacks run synchronously on the thread that dispatches the event, with no lock held.
#[derive(Default)]
pub struct EventDispatcher {
    rotation: Mutex<Option<RotationCallback>>,
    button: Mutex<Option<ButtonCallback>>,
    failures: AtomicUsize,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rotation_callback(&self, callback: Option<RotationCallback>) {
        *self.rotation.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    pub fn set_button_callback(&self, callback: Option<ButtonCallback>) {
        *self.button.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    pub fn has_rotation_callback(&self) -> bool {
        self.rotation.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn has_button_callback(&self) -> bool {
        self.button.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// How many callback invocations have panicked so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Delivers the event to the rotation callback.
    ///
    /// Returns whether a callback ran to completion.
    pub fn dispatch_rotation(&self, event: &RotationEvent) -> bool {
        let callback = self.rotation.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match callback {
            Some(callback) => self.guarded("rotation", || callback(event)),
            None => false,
        }
    }

    /// Delivers the event to the button callback.
    ///
    /// Returns whether a callback ran to completion.
    pub fn dispatch_button(&self, event: &ButtonEvent) -> bool {
        let callback = self.button.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match callback {
            Some(callback) => self.guarded("button", || callback(event)),
            None => false,
        }
    }

    fn guarded(&self, name: &str, call: impl FnOnce()) -> bool {
        match catch_unwind(AssertUnwindSafe(call)) {
            Ok(()) => true,
            Err(payload) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let message = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("<non-string panic>");
                error!("The {} callback panicked: {}", name, message);
                false
            }
        }
    }
}

impl Debug for EventDispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EventDispatcher(rotation: {}, button: {})",
            self.has_rotation_callback(),
            self.has_button_callback(),
        )
    }
}
