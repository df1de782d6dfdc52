//! Phase-locked loop
//!
//! Unit-amplitude NCO clocked once per audio sample, with a PI controller
//! acting on the step size. Phase is a fraction of one cycle, so at the
//! nominal step of `1 / symbol_duration` the oscillator completes one
//! cycle per symbol.

use crate::utils::math::wrap;

#[derive(Debug, Clone)]
pub struct PhaseLockedLoop {
    nominal_frequency: f32,
    step: f32,
    phase: f32,
    prev_phase: f32,
    error: f32,
    accumulator: f32,
}

impl PhaseLockedLoop {
    /// Proportional gain
    pub const KP: f32 = 0.02;
    /// Integral gain
    pub const KI: f32 = 200e-6;
    /// Clamp on the integral accumulator
    pub const WINDUP_LIMIT: f32 = 0.1;

    /// `normalized_frequency` is the nominal step in cycles per sample
    pub fn new(normalized_frequency: f32) -> Self {
        let mut pll = Self {
            nominal_frequency: normalized_frequency,
            step: 0.0,
            phase: 0.0,
            prev_phase: 0.0,
            error: 0.0,
            accumulator: 0.0,
        };
        pll.reset();
        pll
    }

    /// Return to the nominal frequency with zero phase
    pub fn reset(&mut self) {
        self.step = self.nominal_frequency;
        self.phase = 0.0;
        self.prev_phase = 0.0;
        self.error = 0.0;
        self.accumulator = 0.0;
    }

    #[inline]
    pub fn phase(&self) -> f32 {
        self.phase
    }

    #[inline]
    pub fn step(&self) -> f32 {
        self.step
    }

    #[inline]
    pub fn error(&self) -> f32 {
        self.error
    }

    /// If the phase crossed the threshold `phi` (ascending, wrapped) on
    /// the most recent advance, return the fractional sample delay
    /// between the crossing and the current sample.
    pub fn phase_trigger(&self, phi: f32) -> Option<f32> {
        let current = wrap(self.phase - phi);
        let previous = wrap(self.prev_phase - phi);

        if current < previous && self.phase != self.prev_phase {
            Some(current / wrap(self.phase - self.prev_phase))
        } else {
            None
        }
    }

    /// Feed one phase-detector error sample through the PI controller.
    /// Positive error shrinks the step, slowing the oscillator.
    pub fn process_error(&mut self, error: f32) {
        self.error = error;

        self.accumulator = (self.accumulator + Self::KI * error)
            .clamp(-Self::WINDUP_LIMIT, Self::WINDUP_LIMIT);

        let p_error = Self::KP * error;
        let i_error = self.accumulator;

        let step = self.nominal_frequency * (1.0 - p_error - i_error);
        self.step = step.clamp(0.0, 1.0);
    }

    /// Advance the oscillator by one sample
    #[inline]
    pub fn advance(&mut self) {
        self.prev_phase = self.phase;
        self.phase = wrap(self.phase + self.step);
    }
}
