//! Core modem implementation
//!
//! The demodulator composes the AGC front end, carrier loop, carrier
//! rejection filter, and preamble correlator into a single per-sample
//! state machine.

mod demodulator;

pub use demodulator::{Demodulator, DemodulatorState};
