//! PE (Phase Encoding) state machine.
//!
//! PE bits are self-clocking Manchester: a flux transition whose direction
//! encodes "1" or "0" occurs once per bit cell; when two consecutive bits
//! share a value (so no natural transition would occur at the cell
//! boundary) an extra mid-cell "clock tick" transition is forced to keep
//! the decoder synchronized. One FSM instance runs per track, entirely
//! independently of the others.

use crate::{
    block::{BlockKind, BlockResult, FakedTracks},
    edge::{Direction, EdgeEvent},
    parmset::Parmset,
    track_state::TrackState,
};

/// Minimum alternating peaks required to leave the preamble.
pub const PE_MIN_PREBITS: u32 = 70;
/// Idle duration, in bit times, after which all tracks being idle ends a
/// block.
pub const PE_IDLE_FACTOR: f64 = 2.5;
/// Maximum postamble bits discarded from the end of each track.
pub const PE_MAX_POSTBITS: usize = 40;
/// Trailing bits never touched by postamble pruning.
pub const PE_IGNORE_POSTBITS: usize = 5;

/// Track indices expected to show many peaks but almost no decoded data on
/// a tapemark, for standard 9-track 1600 bpi PE.
const TAPEMARK_QUIET_TRACKS: [usize; 6] = [0, 2, 5, 6, 7, 8];
const TAPEMARK_SPARSE_TRACKS: [usize; 3] = [1, 3, 4];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    Preamble,
    Data,
}

struct PeTrack {
    phase: Phase,
    /// Time of the last edge classified as a data bit (the reference point
    /// used to classify the next edge as clock-tick vs data).
    t_lastdata: f64,
    has_lastdata: bool,
}

impl PeTrack {
    fn new() -> Self {
        PeTrack {
            phase: Phase::Preamble,
            t_lastdata: 0.0,
            has_lastdata: false,
        }
    }
}

/// Decode one block's worth of pre-isolated edge events for `n_tracks`
/// tracks of a PE-encoded block.
///
/// `edges` must already be time-sorted with same-sample events ordered by
/// track index; the Retry Driver is
/// responsible for slicing the edge stream at the previous end-of-block.
pub fn decode_block(tracks: &mut [TrackState], edges: &[EdgeEvent], parmset: &Parmset, bpi: f64, ips: f64) -> BlockResult {
    let n_tracks = tracks.len();
    let mut pe_tracks: Vec<PeTrack> = (0..n_tracks).map(|_| PeTrack::new()).collect();
    let mut faked = FakedTracks::empty();

    let bit_period = if bpi > 0.0 { 1.0 / (bpi * ips) } else { tracks[0].clock.period() };
    let t_clkwindow = (bit_period / 2.0) * parmset.clk_factor;

    let mut last_edge_time = vec![0.0f64; n_tracks];
    let mut any_edge_time: f64 = 0.0;

    for ev in edges {
        let idx = ev.track;
        if idx >= n_tracks {
            continue;
        }
        any_edge_time = ev.time;
        last_edge_time[idx] = ev.time;

        let ts = &mut tracks[idx];
        let pe = &mut pe_tracks[idx];

        match pe.phase {
            Phase::Preamble => {
                if ts.peakcount == 0 {
                    ts.bit1_up = ev.direction == Direction::Up;
                }
                ts.peakcount += 1;
                if ts.peakcount >= PE_MIN_PREBITS {
                    pe.phase = Phase::Data;
                    pe.has_lastdata = false;
                    ts.idle = false;
                }
            }
            Phase::Data => {
                let delta = if pe.has_lastdata { ev.time - pe.t_lastdata } else { t_clkwindow + 1.0 };
                let compensated = delta - ts.t_pulse_adj;

                if compensated < t_clkwindow {
                    // Mid-cell clock tick: carries no data value, but
                    // advances the pulse-shift compensator.
                    ts.t_pulse_adj = parmset.pulse_adj * (compensated - t_clkwindow / 2.0);
                }
                else {
                    // A data bit. Its value is the direction of the edge,
                    // consistent with this track's fixed polarity.
                    let bit = (ev.direction == Direction::Up) == ts.bit1_up;
                    ts.bits.push(bit);
                    ts.data_faked.push(false);
                    ts.datacount += 1;
                    ts.t_pulse_adj = parmset.pulse_adj * (compensated - bit_period);
                    pe.t_lastdata = ev.time;
                    pe.has_lastdata = true;
                }
                ts.idle = false;
            }
        }
    }

    // Idle dropout handling: if a track went idle mid-block (no edges for
    // PE_IDLE_FACTOR bit times before the block's overall end), optionally
    // fake the missing bits by repeating the last observed value.
    for (idx, ts) in tracks.iter_mut().enumerate() {
        if pe_tracks[idx].phase != Phase::Data {
            continue;
        }
        let silence = any_edge_time - last_edge_time[idx];
        if silence > PE_IDLE_FACTOR * bit_period && pe_tracks[idx].has_lastdata {
            let missing = (silence / bit_period).round() as usize;
            let last_bit = ts.bits.iter().last().unwrap_or(false);
            for _ in 0..missing.min(PE_MAX_POSTBITS) {
                ts.bits.push(last_bit);
                ts.data_faked.push(true);
                faked |= FakedTracks::for_track(idx);
            }
        }
    }

    // Postamble prune: from the end of each track, discard up to
    // PE_MAX_POSTBITS bits, skipping the last PE_IGNORE_POSTBITS
    // unconditionally, until a `1` is removed.
    for ts in tracks.iter_mut() {
        prune_postamble(&mut ts.bits, &mut ts.data_faked);
    }

    let is_tapemark = check_tapemark(tracks);

    let min_bits = tracks.iter().map(|t| t.bits.len()).min().unwrap_or(0);
    let max_bits = tracks.iter().map(|t| t.bits.len()).max().unwrap_or(0);

    if is_tapemark {
        let mut r = BlockResult::new(BlockKind::Tapemark);
        r.min_bits = min_bits;
        r.max_bits = max_bits;
        return r;
    }

    if min_bits == 0 {
        return BlockResult::new(BlockKind::Noise);
    }

    let data_tracks = n_tracks.saturating_sub(1);
    let bytes = crate::assembler::assemble_bytes(tracks, data_tracks, min_bits);

    let mut result = BlockResult::new(BlockKind::Block);
    result.min_bits = min_bits;
    result.max_bits = max_bits;
    result.avg_bit_spacing = bit_period;
    result.faked_tracks = faked;
    result.data = bytes;
    if !faked.is_empty() {
        result.warncount += 1;
    }
    result
}

/// Discard at most `PE_MAX_POSTBITS` bits, skipping the last
/// `PE_IGNORE_POSTBITS` unconditionally, until a `1` is removed.
fn prune_postamble(bits: &mut bit_vec::BitVec, faked: &mut bit_vec::BitVec) {
    let len = bits.len();
    if len <= PE_IGNORE_POSTBITS {
        return;
    }

    let mut removed = 0;
    let mut cursor = len - PE_IGNORE_POSTBITS;
    while removed < PE_MAX_POSTBITS && cursor > 0 {
        cursor -= 1;
        removed += 1;
        let was_one = bits.get(cursor).unwrap_or(false);
        bits.truncate(cursor);
        faked.truncate(cursor);
        if was_one {
            break;
        }
    }
}

/// Tapemark recognition: for a standard 9-track layout,
/// tracks `{0,2,5,6,7,P}` show > 75 peaks each with `datacount <= 2`, and
/// tracks `{1,3,4}` show `peakcount <= 2`.
fn check_tapemark(tracks: &[TrackState]) -> bool {
    if tracks.len() != 9 {
        return false;
    }
    let quiet_ok = TAPEMARK_QUIET_TRACKS
        .iter()
        .all(|&i| tracks[i].peakcount > 75 && tracks[i].datacount <= 2);
    let sparse_ok = TAPEMARK_SPARSE_TRACKS.iter().all(|&i| tracks[i].peakcount <= 2);
    quiet_ok && sparse_ok
}

#[cfg(test)]
mod synth {
    use super::*;
    use crate::{
        edge::{Direction, EdgeEvent},
        parmset::{AgcMode, ClockAvgMode},
    };

    /// Build a synthetic 9-track PE edge stream encoding `data` bytes,
    /// preceded by `prebits` alternating preamble peaks and followed by
    /// `postbits` postamble peaks, using the exact decode rule
    /// `decode_block` implements (so this is a consistency / round-trip
    /// check of the chosen concrete PE model, not a byte-for-byte replay
    /// of the historical readtape.c implementation).
    pub fn synth_pe_block(data: &[u8], bit_period: f64, prebits: u32, postbits: u32) -> (Vec<EdgeEvent>, usize) {
        let n_tracks = 9;
        let mut edges = Vec::new();
        let mut t = 0.0;

        // Preamble: alternating peaks, one track chosen as representative
        // timing reference but emitted identically on all tracks since PE
        // preamble is a synchronized all-zero pattern across the gap.
        let mut up = true;
        for _ in 0..prebits {
            for track in 0..n_tracks {
                edges.push(EdgeEvent {
                    track,
                    time: t,
                    direction: if up { Direction::Up } else { Direction::Down },
                });
            }
            t += bit_period / 2.0;
            up = !up;
        }

        // Data: track 0..7 = MSB..LSB of each byte, track 8 = parity (here
        // always emits alternating clock-only ticks carrying no data value
        // by encoding a data bit equal to the running XOR, simplified to a
        // fixed 0 since no parity check is exercised in these tests).
        for &byte in data {
            for bit_idx in 0..8 {
                let bit = (byte >> (7 - bit_idx)) & 1 == 1;
                let dir = if bit { Direction::Up } else { Direction::Down };
                edges.push(EdgeEvent {
                    track: bit_idx,
                    time: t,
                    direction: dir,
                });
            }
            edges.push(EdgeEvent {
                track: 8,
                time: t,
                direction: Direction::Down,
            });
            t += bit_period;
        }

        // Postamble: more alternating peaks on all tracks (pruned away by
        // decode_block's postamble prune, mirroring PE_MAX_POSTBITS).
        for _ in 0..postbits {
            for track in 0..n_tracks {
                edges.push(EdgeEvent {
                    track,
                    time: t,
                    direction: if up { Direction::Up } else { Direction::Down },
                });
            }
            t += bit_period / 2.0;
            up = !up;
        }

        edges.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap().then(a.track.cmp(&b.track)));
        (edges, n_tracks)
    }

    pub fn fresh_tracks(n: usize, bit_period: f64) -> Vec<TrackState> {
        (0..n)
            .map(|_| {
                TrackState::new(
                    16,
                    ClockAvgMode::Windowed { window: 10 },
                    AgcMode::Windowed { window: 3 },
                    bit_period,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::synth::*;
    use super::*;
    use crate::parmset::Parmset;

    #[test]
    fn perfect_block_roundtrips_bytes_0_to_255() {
        let bit_period = 1.0 / (1600.0 * 50.0);
        let data: Vec<u8> = (0..=255u8).collect();
        let (edges, n_tracks) = synth_pe_block(&data, bit_period, PE_MIN_PREBITS, PE_MAX_POSTBITS as u32);
        let mut tracks = fresh_tracks(n_tracks, bit_period);
        let parmset = Parmset::default();

        let result = decode_block(&mut tracks, &edges, &parmset, 1600.0, 50.0);

        assert_eq!(result.kind, Some(BlockKind::Block));
        assert_eq!(result.data, data);
    }

    #[test]
    fn preamble_of_exactly_70_peaks_is_accepted() {
        let bit_period = 1.0 / (1600.0 * 50.0);
        let (edges, n_tracks) = synth_pe_block(&[0xAA], bit_period, PE_MIN_PREBITS, 10);
        let mut tracks = fresh_tracks(n_tracks, bit_period);
        let parmset = Parmset::default();
        let result = decode_block(&mut tracks, &edges, &parmset, 1600.0, 50.0);
        assert_eq!(result.kind, Some(BlockKind::Block));
    }

    #[test]
    fn tapemark_pattern_is_recognised() {
        let bit_period = 1.0 / (1600.0 * 50.0);
        let mut tracks = fresh_tracks(9, bit_period);
        for &i in &TAPEMARK_QUIET_TRACKS {
            tracks[i].peakcount = 80;
            tracks[i].datacount = 0;
        }
        for &i in &TAPEMARK_SPARSE_TRACKS {
            tracks[i].peakcount = 1;
        }
        assert!(check_tapemark(&tracks));
    }
}
