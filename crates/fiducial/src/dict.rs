//! Embedded 4x4 marker codebooks.
//!
//! A code is the 16 payload bits of a marker read row-major from the top-left
//! cell, white cell = 1. A detection matches a codebook entry under any of
//! the four rotations.

/// 4x4, 50-entry dictionary.
pub const DICT_4X4_50: [u16; 50] = [
    0x2259, 0x1AB8, 0xDCB2, 0x5670, 0x1ADF, 0x374B, 0x004B, 0x6213, 0xA4FA, 0x565E,
    0x8FF6, 0xF5C0, 0xEB6D, 0x8B7C, 0xE4CA, 0x7B0C, 0x746E, 0xECC9, 0xA68A, 0xA265,
    0x3491, 0x583F, 0x2F3B, 0xED02, 0x8FD3, 0xEA7C, 0xD476, 0x055F, 0x00B1, 0x8165,
    0x4C85, 0xF620, 0xA960, 0xC2AB, 0x03C2, 0x4BAD, 0x32E0, 0x8BAD, 0xFACD, 0x6847,
    0x3446, 0x49D1, 0x5206, 0x9A12, 0x0CE6, 0x03D9, 0xF922, 0x8A81, 0x89E2, 0xB66F,
];

/// Rotate a 4x4 bit grid 90 degrees clockwise.
pub fn rotate(code: u16) -> u16 {
    let mut out = 0u16;
    for row in 0..4 {
        for col in 0..4 {
            let bit = (code >> (15 - (row * 4 + col))) & 1;
            // (row, col) -> (col, 3 - row)
            let (nr, nc) = (col, 3 - row);
            out |= bit << (15 - (nr * 4 + nc));
        }
    }
    out
}

/// Match sampled payload bits against a codebook, trying all four
/// rotations. Returns the marker id.
pub fn match_code(codebook: &[u16], bits: u16) -> Option<u32> {
    let mut candidate = bits;
    for _ in 0..4 {
        if let Some(id) = codebook.iter().position(|&c| c == candidate) {
            return Some(id as u32);
        }
        candidate = rotate(candidate);
    }
    None
}
