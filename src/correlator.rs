//! Preamble correlator
//!
//! Matched filter over the last eight decision-rate baseband samples.
//! Locates the alignment-sequence peak to sub-sample precision and votes
//! on the half-cycle decision phase that the carrier loop leaves open.

use crate::utils::math::{cosine, lerp};
use crate::vector::Vector;
use crate::window::Window;

const PATTERN_LENGTH: usize = 8;

/// Expected I and Q traces of the alignment sequence at decision rate.
/// Zero entries fall on the transition instants of the flipping channel.
const ALIGNMENT_PATTERN: [[f32; PATTERN_LENGTH]; 2] = [
    [-1.0, -1.0, -1.0, 0.0, 1.0, 1.0, 1.0, 0.0],
    [-1.0, 0.0, 1.0, 1.0, 1.0, 0.0, -1.0, -1.0],
];

const PEAK_THRESHOLD: f32 = PATTERN_LENGTH as f32 / 2.0;
const NUM_CORRELATION_PEAKS: usize = 4;

/// Alignment-sequence matched filter and decision-phase voter
#[derive(Debug, Clone)]
pub struct Correlator {
    v_history: Window<Vector, PATTERN_LENGTH>,
    phase_history: Window<f32, 3>,
    correlation_history: Window<f32, 3>,
    maximum: f32,
    correlation_peaks: u32,
    decision_vector: Window<f32, NUM_CORRELATION_PEAKS>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            v_history: Window::new(),
            phase_history: Window::new(),
            correlation_history: Window::new(),
            maximum: 0.0,
            correlation_peaks: 0,
            decision_vector: Window::new(),
        }
    }

    pub fn reset(&mut self) {
        self.v_history.reset();
        self.phase_history.reset();
        self.correlation_history.reset();
        self.maximum = 0.0;
        self.correlation_peaks = 0;
        self.decision_vector.reset();
    }

    /// Record a decision-rate sample without running the detector
    pub fn push(&mut self, phase: f32, v: Vector) {
        self.phase_history.write(phase);
        self.v_history.write(v);
    }

    /// Record a decision-rate sample and look for an alignment peak.
    /// Returns the decision phase (0 or 0.5) once four peaks have voted.
    pub fn process(&mut self, phase: f32, v: Vector) -> Option<f32> {
        self.push(phase, v);

        let mut correlation = 0.0;
        for k in 0..PATTERN_LENGTH {
            correlation += ALIGNMENT_PATTERN[0][k] * self.v_history[k].i;
            correlation += ALIGNMENT_PATTERN[1][k] * self.v_history[k].q;
        }

        if correlation > self.maximum {
            self.maximum = correlation;
        }

        self.correlation_history.write(correlation);

        let peak = self.correlation_history[1] == self.maximum
            && self.correlation_history[0] < self.maximum
            && self.maximum >= PEAK_THRESHOLD;

        if correlation < 0.0 {
            // Re-arm at each valley so consecutive peaks are detected
            self.maximum = 0.0;
        }

        if peak {
            // Sub-sample peak position from the relative correlation of
            // the samples on either side of the raw maximum
            let left = self.correlation_history[1] - self.correlation_history[2];
            let right = self.correlation_history[1] - self.correlation_history[0];
            let tilt = 0.5 * (left - right) / (left + right);

            let a = self.phase_history[1];
            let b = self.phase_history[if tilt < 0.0 { 2 } else { 0 }];
            let phase_i = lerp(cosine(a), cosine(b), tilt.abs());

            // Only the in-phase carrier polarity matters for the
            // half-cycle ambiguity, so a single scalar votes per peak
            self.decision_vector.write(phase_i);

            self.correlation_peaks += 1;
            if self.correlation_peaks == NUM_CORRELATION_PEAKS as u32 {
                return Some(if self.decision_vector.sum() > 0.0 { 0.0 } else { 0.5 });
            }
        }

        None
    }

    /// Most recent correlation value
    #[inline]
    pub fn output(&self) -> f32 {
        self.correlation_history[0]
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}
