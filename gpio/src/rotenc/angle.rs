use std::num::NonZeroU32;
use crate::rotenc::Direction;

/// A resolved encoder step, with the position converted to a physical angle.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RotationEvent {
    pub direction: Direction,
    pub position: i64,
    /// Angle within the current revolution, always in `[0, 360)`.
    pub angle_remainder_degrees: f64,
    /// Completed revolutions, rounded towards negative infinity.
    pub whole_rotations: i64,
}

impl RotationEvent {
    pub fn new(direction: Direction, position: i64, pulses_per_rotation: NonZeroU32) -> Self {
        let (whole_rotations, angle_remainder_degrees) = split_angle(position, pulses_per_rotation);
        RotationEvent {
            direction,
            position,
            angle_remainder_degrees,
            whole_rotations,
        }
    }

    /// The total angle travelled from position 0.
    pub fn degrees(&self) -> f64 {
        self.whole_rotations as f64 * 360.0 + self.angle_remainder_degrees
    }
}

/// Splits a position into whole revolutions and the remaining angle in degrees.
///
/// Uses floored division so negative positions still have a remainder in `[0, 360)`.
pub fn split_angle(position: i64, pulses_per_rotation: NonZeroU32) -> (i64, f64) {
    let ppr = i64::from(pulses_per_rotation.get());
    let whole = position.div_euclid(ppr);
    let remainder_pulses = position.rem_euclid(ppr);
    let remainder = remainder_pulses as f64 * (360.0 / ppr as f64);
    (whole, remainder)
}
