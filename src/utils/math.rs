//! Small DSP math helpers
//!
//! Phase arguments are expressed in cycles: one full period is 1.0.

use std::f32::consts::TAU;

/// Wrap into [0, 1) by dropping the integer part
#[inline]
pub fn wrap(x: f32) -> f32 {
    x - x.floor()
}

/// Linear interpolation from `a` to `b`
#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Sine of a phase expressed in cycles
#[inline]
pub fn sine(phase: f32) -> f32 {
    (TAU * phase).sin()
}

/// Cosine of a phase expressed in cycles
#[inline]
pub fn cosine(phase: f32) -> f32 {
    (TAU * phase).cos()
}
