//! Quadrature decoding for a detented rotary encoder.
//!
//! Channel states are buffered until the encoder settles in its idle detent (both lines high),
//! and only then is the last transition checked against the table of legal transitions.
//! Contact bounce in the middle of a detent never reaches the position counter.

mod angle;

use std::collections::VecDeque;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use log::{debug, trace};
use crate::{EdgeSource, GpioResult};
pub use angle::*;

/// Represents the direction of rotation for a rotary encoder.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    Clockwise,
    CounterClockwise,
}

impl Direction {
    /// The position change caused by one step in this direction.
    pub fn delta(&self) -> i64 {
        match self {
            Direction::Clockwise => 1,
            Direction::CounterClockwise => -1,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            Direction::Clockwise => "CW",
            Direction::CounterClockwise => "CCW",
        };
        write!(f, "{}", str)
    }
}

/// Both quadrature lines sampled at once, packed as `A << 1 | B`.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ChannelState(u8);

impl ChannelState {
    /// The detent state: both lines pulled high.
    pub const IDLE: ChannelState = ChannelState(0b11);

    pub fn from_levels(a: bool, b: bool) -> Self {
        ChannelState(((a as u8) << 1) | b as u8)
    }

    /// Gets the state from its packed value, or `None` if it is not a 2-bit value.
    pub fn from_bits(bits: u8) -> Option<Self> {
        (bits <= 0b11).then_some(ChannelState(bits))
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::IDLE
    }
}

impl Debug for ChannelState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02b}", self.0)
    }
}

/// A transition between two channel states, packed as `previous << 2 | current`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TransitionCode(u8);

impl TransitionCode {
    const CLOCKWISE: [u8; 4] = [0b0010, 0b1011, 0b1101, 0b0100];
    const COUNTER_CLOCKWISE: [u8; 4] = [0b0001, 0b0111, 0b1110, 0b1000];

    pub fn new(previous: ChannelState, current: ChannelState) -> Self {
        TransitionCode((previous.0 << 2) | current.0)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Gets the rotation direction of a legal transition.
    ///
    /// Returns `None` for the 8 codes that can't result from a single valid step.
    pub fn direction(&self) -> Option<Direction> {
        if Self::CLOCKWISE.contains(&self.0) {
            Some(Direction::Clockwise)
        } else if Self::COUNTER_CLOCKWISE.contains(&self.0) {
            Some(Direction::CounterClockwise)
        } else {
            None
        }
    }
}

/// Reads both quadrature lines of an encoder from an [EdgeSource].
#[derive(Debug, Clone)]
pub struct ChannelSampler {
    source: Arc<dyn EdgeSource>,
    pin_a: u32,
    pin_b: u32,
}

impl ChannelSampler {
    pub fn new(source: Arc<dyn EdgeSource>, pin_a: u32, pin_b: u32) -> Self {
        ChannelSampler { source, pin_a, pin_b }
    }

    pub fn sample(&self) -> GpioResult<ChannelState> {
        let a = self.source.read_level(self.pin_a)?;
        let b = self.source.read_level(self.pin_b)?;
        Ok(ChannelState::from_levels(a, b))
    }
}

/// A validated single-detent step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Step {
    pub direction: Direction,
    /// The position after the step was applied.
    pub position: i64,
}

/// Buffers channel states and turns complete detent-to-detent sequences into steps.
///
/// Not synchronized; callers sharing a decoder between edge handlers wrap it in a lock.
#[derive(Debug, Clone)]
pub struct QuadratureDecoder {
    buffer: VecDeque<ChannelState>,
    buffer_limit: usize,
    last_state: ChannelState,
    position: i64,
}

impl QuadratureDecoder {
    pub const DEFAULT_BUFFER_LIMIT: usize = 10;

    /// Creates a decoder at position 0.
    ///
    /// `baseline` is the state the lines were in when decoding started.
    /// `buffer_limit` is clamped to at least 2, the least that can hold a transition.
    pub fn new(baseline: ChannelState, buffer_limit: usize) -> Self {
        let buffer_limit = buffer_limit.max(2);
        QuadratureDecoder {
            buffer: VecDeque::with_capacity(buffer_limit + 1),
            buffer_limit,
            last_state: baseline,
            position: 0,
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn reset_position(&mut self) {
        self.position = 0;
    }

    /// The state the last evaluation happened at, or the baseline before the first one.
    pub fn last_state(&self) -> ChannelState {
        self.last_state
    }

    /// States seen since the last evaluation.
    pub fn buffered(&self) -> impl Iterator<Item = ChannelState> + '_ {
        self.buffer.iter().copied()
    }

    /// Feeds a freshly sampled state into the decoder.
    ///
    /// Returns the step taken, if the state completed a legal transition into the idle detent.
    pub fn push(&mut self, state: ChannelState) -> Option<Step> {
        self.buffer.push_back(state);
        trace!("Buffer: {:?}", self.buffer);

        let step = if state.is_idle() {
            let step = self.evaluate(state);
            self.buffer.clear();
            self.last_state = state;
            step
        } else {
            None
        };

        while self.buffer.len() > self.buffer_limit {
            self.buffer.pop_front();
        }

        step
    }

    fn evaluate(&mut self, current: ChannelState) -> Option<Step> {
        let mut unique: Vec<ChannelState> = Vec::with_capacity(self.buffer.len());
        for &state in &self.buffer {
            if unique.last() != Some(&state) {
                unique.push(state);
            }
        }

        if unique.len() < 2 {
            debug!("Not enough unique states ({}), skipping", unique.len());
            return None;
        }

        let previous = unique[unique.len() - 2];
        let code = TransitionCode::new(previous, current);

        let Some(direction) = code.direction() else {
            debug!("No valid direction for {:04b}, discarding {:?}", code.bits(), unique);
            return None;
        };

        self.position += direction.delta();
        debug!("{} detected, pos={}", direction, self.position);

        Some(Step {
            direction,
            position: self.position,
        })
    }
}
