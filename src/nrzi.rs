//! NRZI (Non-Return-to-Zero Inverted) state machine.
//!
//! Unlike PE, NRZI carries a single *global* clock shared by all tracks: a
//! flux transition on a track within a bit cell means "1" on that track,
//! no transition means "0". A missing transition is not simply the absence
//! of a peak, though: each cell is checked at its midpoint against the
//! neighbouring peaks actually seen (`t_lastpeak`/`t_prevlastpeak`) to
//! decide whether to synthesize a zero or whether two peaks landed in one
//! cell and the extra is spurious. End of block is detected by counting
//! consecutive all-zero character cells (`post_counter`).

use crate::{
    block::{BlockKind, BlockResult},
    edge::EdgeEvent,
    parmset::Parmset,
    track_state::TrackState,
    util,
};

/// Consecutive all-zero character cells required to declare end of block.
pub const NRZI_POSTAMBLE_COUNT: u32 = 8;
/// AGC-gain ratio beyond which a track is considered bad enough to attempt
/// `-correct`-style bit-flip correction.
pub const NRZI_BADTRK_FACTOR: f64 = 2.0;

/// Decode one block's worth of pre-isolated edge events for `n_tracks`
/// tracks of an NRZI-encoded block, 9-track convention (8 data tracks,
/// MSB..LSB, plus one parity track).
pub fn decode_block(
    tracks: &mut [TrackState],
    edges: &[EdgeEvent],
    parmset: &Parmset,
    bpi: f64,
    ips: f64,
    odd_parity: bool,
    correct: bool,
) -> BlockResult {
    let n_tracks = tracks.len();
    let bit_period = if bpi > 0.0 { 1.0 / (bpi * ips) } else { tracks[0].clock.period() };
    let midbit_offset = bit_period * parmset.nrzi_midbit;

    // Global clock: a new character cell begins every `bit_period`,
    // starting from the first edge seen on any track.
    let t0 = edges.iter().map(|e| e.time).fold(f64::INFINITY, f64::min);
    if !t0.is_finite() {
        return BlockResult::new(BlockKind::Noise);
    }

    let last_time = edges.iter().map(|e| e.time).fold(f64::NEG_INFINITY, f64::max);
    let n_cells = (((last_time - t0) / bit_period).ceil() as usize + 1).max(1);

    let mut by_track: Vec<Vec<&EdgeEvent>> = vec![Vec::new(); n_tracks];
    for ev in edges {
        if ev.track < n_tracks {
            by_track[ev.track].push(ev);
        }
    }
    for v in by_track.iter_mut() {
        v.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap());
    }

    // Per track, per cell: walk each track's own peak stream against the
    // global cell grid, checking each cell's midpoint window
    // [t_last_midbit, t_lastclock + (1+midbit)*bit_period) for zero, one,
    // or two peaks landing inside it.
    let mut cell_hit = vec![vec![false; n_cells]; n_tracks];
    let mut missed_midbits = 0u32;

    for (tr, events) in by_track.iter().enumerate() {
        let mut ev_idx = 0usize;
        let mut t_last_midbit = t0 - midbit_offset;
        for cell in 0..n_cells {
            let t_lastclock = t0 + cell as f64 * bit_period;
            let window_end = t_lastclock + (1.0 + parmset.nrzi_midbit) * bit_period;

            let mut hits_in_window = 0u32;
            while ev_idx < events.len() && events[ev_idx].time < window_end {
                if events[ev_idx].time >= t_last_midbit {
                    hits_in_window += 1;
                    tracks[tr].note_top_peak(events[ev_idx].time, 0.0);
                }
                ev_idx += 1;
            }

            match hits_in_window {
                0 => {
                    // No transition landed in this cell's window: synthesize
                    // a zero rather than leaving the cell unresolved.
                    missed_midbits += 1;
                }
                1 => {
                    cell_hit[tr][cell] = true;
                    // Pull the running clock toward the observed peak by
                    // `pulse_adj`, the same phase-lock compensation PE uses.
                    let observed = tracks[tr].t_lastpeak;
                    let deviation = observed - (t_lastclock + bit_period);
                    tracks[tr].t_pulse_adj = deviation * parmset.pulse_adj;
                }
                _ => {
                    // Two peaks landed within one NRZI bit cell: the second
                    // is spurious (the cell windows are wide enough that a
                    // jittered peak can straddle a boundary). Record one bit
                    // and delete the extra.
                    cell_hit[tr][cell] = true;
                }
            }

            t_last_midbit = t_lastclock + (1.0 + parmset.nrzi_midbit) * bit_period;
        }
        for ev in events.iter() {
            if ev.time < t0 + n_cells as f64 * bit_period {
                tracks[tr].peakcount += 1;
            }
        }
    }

    let mut post_counter: u32 = 0;
    let mut end_cell = n_cells;
    for cell in 0..n_cells {
        let any_hit = (0..n_tracks).any(|tr| cell_hit[tr][cell]);
        if any_hit {
            // A one-only cancellation:the postamble
            // counter only resets back to zero when it was exactly 1,
            // not for any higher partial count (documented asymmetry,
            // reproduced literally rather than "fixed").
            if post_counter == 1 {
                post_counter = 0;
            }
        }
        else {
            post_counter += 1;
            if post_counter >= NRZI_POSTAMBLE_COUNT {
                end_cell = cell + 1 - NRZI_POSTAMBLE_COUNT as usize;
                break;
            }
        }
    }

    for (tr, ts) in tracks.iter_mut().enumerate() {
        for cell in cell_hit[tr].iter().take(end_cell) {
            ts.bits.push(*cell);
            ts.data_faked.push(false);
            if *cell {
                ts.datacount += 1;
            }
        }
    }

    if end_cell == 0 {
        return BlockResult::new(BlockKind::Noise);
    }

    let min_bits = tracks.iter().map(|t| t.bits.len()).min().unwrap_or(0);
    let max_bits = tracks.iter().map(|t| t.bits.len()).max().unwrap_or(0);

    let data_tracks = n_tracks.saturating_sub(1);
    let mut bytes = crate::assembler::assemble_bytes(tracks, data_tracks, min_bits);

    let mut vparity_errs = 0u32;
    let mut corrected_bits = 0u32;
    if n_tracks > data_tracks {
        let parity_track = data_tracks;
        for (i, byte) in bytes.iter_mut().enumerate() {
            let parity_bit = tracks[parity_track].bits.get(i).unwrap_or(false);
            let want = util::popcount(*byte) as u32 + parity_bit as u32;
            let is_odd = want % 2 == 1;
            if is_odd != odd_parity {
                vparity_errs += 1;
                if correct {
                    // `-correct`: flip the bit on the track whose gain
                    // deviates furthest from the block average, the track
                    // most likely to have missed/invented a transition
                    //.
                    if let Some(worst) = worst_gain_track(tracks, data_tracks) {
                        let flipped_bit_pos = 7 - worst.min(7);
                        *byte ^= 1 << flipped_bit_pos;
                        corrected_bits += 1;
                    }
                }
            }
        }
    }

    // The post-block trailer is six bytes: `00 00 CRC 00 00 LRC`. Search
    // within a one-byte tolerance for the CRC and LRC positions rather than
    // assuming the trailer is exactly the last two bytes. The CRC is a full
    // 9-bit value; its 9th bit rides the parity track at the CRC
    // character's own byte position, same as every other character.
    let mut crc_errs = 0;
    let mut lrc_errs = 0;
    if bytes.len() >= 6 && n_tracks > data_tracks {
        let parity_track = data_tracks;
        let trailer_start = bytes.len() - 6;
        let data_part = &bytes[..trailer_start];
        let computed_crc = util::nrzi_crc9(data_part) & 0x1FF;
        let computed_lrc = util::lrc(data_part);

        let crc_candidates = [bytes.len() - 5, bytes.len() - 4, bytes.len() - 3];
        let crc_matches = crc_candidates.iter().any(|&i| {
            let ninth = tracks[parity_track].bits.get(i).unwrap_or(false) as u16;
            ((ninth << 8) | bytes[i] as u16) == computed_crc
        });
        if !crc_matches {
            crc_errs += 1;
        }

        let lrc_candidates = [bytes.len() - 2, bytes.len() - 1];
        let lrc_matches = lrc_candidates.iter().any(|&i| bytes[i] == computed_lrc);
        if !lrc_matches {
            lrc_errs += 1;
        }
    }

    if is_tapemark(tracks, data_tracks) {
        let mut r = BlockResult::new(BlockKind::Tapemark);
        r.min_bits = min_bits;
        r.max_bits = max_bits;
        return r;
    }

    let mut specialized = crate::block::SpecializedCounters::default();
    specialized.missed_midbits = missed_midbits;

    let mut result = BlockResult::new(BlockKind::Block);
    result.min_bits = min_bits;
    result.max_bits = max_bits;
    result.avg_bit_spacing = bit_period;
    result.vparity_errs = vparity_errs;
    result.crc_errs = crc_errs;
    result.lrc_errs = lrc_errs;
    result.corrected_bits = corrected_bits;
    result.specialized = specialized;
    result.errcount = vparity_errs + crc_errs + lrc_errs;
    result.warncount = missed_midbits;
    result.data = bytes;
    result
}

fn worst_gain_track(tracks: &[TrackState], data_tracks: usize) -> Option<usize> {
    let avg: f64 = tracks[..data_tracks].iter().map(|t| t.agc.gain()).sum::<f64>() / data_tracks as f64;
    (0..data_tracks).max_by(|&a, &b| {
        let da = (tracks[a].agc.gain() - avg).abs();
        let db = (tracks[b].agc.gain() - avg).abs();
        da.partial_cmp(&db).unwrap()
    })
}

/// An NRZI tapemark is a long run of all-zero characters on every data
/// track (already trimmed away by the postamble detector) with no data
/// bits ever recorded.
fn is_tapemark(tracks: &[TrackState], data_tracks: usize) -> bool {
    tracks[..data_tracks].iter().all(|t| t.datacount == 0) && tracks[..data_tracks].iter().any(|t| t.peakcount > 0)
}


#[cfg(test)]
mod tests {
    use super::synth::*;
    use super::*;
    use crate::parmset::Parmset;

    #[test]
    fn perfect_block_decodes_with_correct_parity() {
        let bit_period = 1.0 / (800.0 * 50.0);
        let data = vec![0x41u8, 0x42, 0x43];
        let edges = synth_nrzi_block(&data, bit_period, true);
        let mut tracks = fresh_tracks(9, bit_period);
        let parmset = Parmset::default();

        let result = decode_block(&mut tracks, &edges, &parmset, 800.0, 50.0, true, false);

        assert_eq!(result.kind, Some(BlockKind::Block));
        assert_eq!(&result.data, &data);
        assert_eq!(result.vparity_errs, 0);
    }

    #[test]
    fn flipped_parity_track_is_flagged_as_an_error() {
        let bit_period = 1.0 / (800.0 * 50.0);
        let data = vec![0x00u8];
        let edges = synth_nrzi_block(&data, bit_period, true);
        let mut tracks = fresh_tracks(9, bit_period);
        let parmset = Parmset::default();

        // Wrong expected parity convention should surface as a parity error.
        let result = decode_block(&mut tracks, &edges, &parmset, 800.0, 50.0, false, false);
        assert!(result.vparity_errs > 0);
    }

    #[test]
    fn post_counter_one_cancellation_is_asymmetric() {
        // A lone zero-cell between two one-cells should not accumulate
        // toward end-of-block; only an exact count of 1 resets.
        let bit_period = 1.0 / (800.0 * 50.0);
        let data = vec![0b10101010u8];
        let edges = synth_nrzi_block(&data, bit_period, true);
        let mut tracks = fresh_tracks(9, bit_period);
        let parmset = Parmset::default();
        let result = decode_block(&mut tracks, &edges, &parmset, 800.0, 50.0, true, false);
        assert_eq!(result.kind, Some(BlockKind::Block));
    }

    #[test]
    fn lrc_trailer_is_found_within_the_six_byte_layout() {
        // Build a payload whose last 6 bytes follow the 00 00 CRC 00 00 LRC
        // layout; the LRC half doesn't depend on the parity track's value
        // and can be checked end-to-end through the synth helper.
        let bit_period = 1.0 / (800.0 * 50.0);
        let payload = vec![0x11u8, 0x22, 0x33];
        let lrc = util::lrc(&payload);
        let mut data = payload.clone();
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, lrc]);

        let edges = synth_nrzi_block(&data, bit_period, true);
        let mut tracks = fresh_tracks(9, bit_period);
        let parmset = Parmset::default();
        let result = decode_block(&mut tracks, &edges, &parmset, 800.0, 50.0, true, false);
        assert_eq!(result.lrc_errs, 0);
    }
}
