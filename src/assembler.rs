//! Block Assembly.
//!
//! Packs each encoding's per-track decoded bit arrays into bytes, MSB-first
//! across the configured track permutation, and recognises standard IBM
//! tape labels on the resulting byte stream.

use crate::track_state::TrackState;

/// Pack `data_tracks` tracks' worth of decoded bits into bytes, MSB-first,
/// truncated to `min_bits` (the shortest track: trailing
/// bits beyond the shortest track are simply unavailable and dropped
/// rather than padded).
pub fn assemble_bytes(tracks: &[TrackState], data_tracks: usize, min_bits: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(min_bits / data_tracks.max(1));
    let mut bit_idx = 0usize;
    while bit_idx < min_bits {
        let mut byte = 0u8;
        for track in 0..data_tracks.min(8) {
            let bit = tracks[track].bits.get(bit_idx).unwrap_or(false);
            byte = (byte << 1) | bit as u8;
        }
        out.push(byte);
        bit_idx += 1;
    }
    out
}

/// EBCDIC encodings of the IBM standard label identifiers recognised on
/// 80-byte label blocks.
const LABEL_IDS: [(&str, [u8; 4]); 7] = [
    ("VOL1", [0xE5, 0xD6, 0xD3, 0xF1]),
    ("HDR1", [0xC8, 0xC4, 0xD9, 0xF1]),
    ("HDR2", [0xC8, 0xC4, 0xD9, 0xF2]),
    ("EOF1", [0xC5, 0xD6, 0xC6, 0xF1]),
    ("EOF2", [0xC5, 0xD6, 0xC6, 0xF2]),
    ("EOV1", [0xC5, 0xD6, 0xE5, 0xF1]),
    ("EOV2", [0xC5, 0xD6, 0xE5, 0xF2]),
];

/// A recognised IBM standard label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub id: &'static str,
    pub body: Vec<u8>,
}

/// Recognise a standard 80-byte IBM label on `data`, if it starts with one
/// of the four-character EBCDIC label identifiers.
/// Returns `None` for any other length or content, including within a
/// `tap_format` container where every block is framed as one file and
/// label recognition is skipped entirely by the caller.
pub fn recognise_label(data: &[u8]) -> Option<Label> {
    if data.len() != 80 {
        return None;
    }
    for (id, marker) in LABEL_IDS.iter() {
        if data[0..4] == *marker {
            return Some(Label {
                id,
                body: data.to_vec(),
            });
        }
    }
    None
}
