//! 16-QAM constellation
//!
//! Four-level quantizer per axis and the 4x4 decision table mapping
//! quantized (I, Q) onto symbol nibbles. Constellation points sit at
//! ±0.25 and ±0.75 on each axis; the outer corner (−0.75, −0.75) doubles
//! as the carrier-sync tone. The table is part of the wire contract.

use crate::vector::Vector;

/// Quantization levels per axis
pub const NUM_QUANTA: usize = 4;

/// Peak I/Q amplitude of the outer constellation ring
pub const IQ_AMPLITUDE: f32 = 1.0 - 1.0 / NUM_QUANTA as f32;

/// Constellation point transmitted as the carrier-sync tone
pub const CARRIER_SYNC_VECTOR: Vector = Vector::new(-IQ_AMPLITUDE, -IQ_AMPLITUDE);

/// Symbol decoded from the carrier-sync tone
pub const CARRIER_SYNC_SYMBOL: u8 = 0xF;

/// Decision table indexed by `[i_index][q_index]`
const IQ_TO_SYMBOL: [[u8; NUM_QUANTA]; NUM_QUANTA] = [
    [0xF, 0xD, 0x9, 0xB],
    [0xE, 0xC, 0x8, 0xA],
    [0x6, 0x4, 0x0, 0x2],
    [0x7, 0x5, 0x1, 0x3],
];

/// Constellation level for a quantization bin
#[inline]
fn level(index: usize) -> f32 {
    IQ_AMPLITUDE * (2.0 * index as f32 / (NUM_QUANTA as f32 - 1.0) - 1.0)
}

/// Map a soft value in [−1, 1] to its quantization bin
#[inline]
pub fn decision_index(sample: f32) -> usize {
    let scaled = (NUM_QUANTA as f32 / 2.0) * (sample + 1.0);
    (scaled as i32).clamp(0, NUM_QUANTA as i32 - 1) as usize
}

/// Snap a soft value to the nearest constellation level
#[inline]
pub fn quantize(sample: f32) -> f32 {
    level(decision_index(sample))
}

/// Snap both components of a baseband vector
#[inline]
pub fn quantize_vector(v: Vector) -> Vector {
    Vector::new(quantize(v.i), quantize(v.q))
}

/// Decide the symbol nibble for a baseband vector
#[inline]
pub fn decide_symbol(v: Vector) -> u8 {
    IQ_TO_SYMBOL[decision_index(v.i)][decision_index(v.q)]
}

/// Exact constellation point for a symbol (the encode direction of the
/// decision table)
pub fn symbol_to_vector(symbol: u8) -> Vector {
    let symbol = symbol & 0xF;
    for (i_index, row) in IQ_TO_SYMBOL.iter().enumerate() {
        for (q_index, &entry) in row.iter().enumerate() {
            if entry == symbol {
                return Vector::new(level(i_index), level(q_index));
            }
        }
    }
    unreachable!("every nibble appears in the decision table");
}
