//! Streaming filters for the receive path

pub mod crf;
pub mod one_pole;

pub use crf::CarrierRejectionFilter;
pub use one_pole::{OnePoleHighpass, OnePoleLowpass};
