//! Whirlwind state machine.
//!
//! Whirlwind tape carries six logical tracks: a primary clock, a primary
//! LSB data track, a primary MSB data track, and a redundant alternate
//! copy of each. Every clock tick is formed by merging the primary and
//! alternate clock pulses; disagreement between the two is flagged
//! (`ww_missing_clock`) rather than silently trusting one side. Block marks
//! are detected as a long gap on an LSB track following the last tick, and
//! queued across block boundaries since a mark can straddle the generic
//! silence-based block splitter. Unlike PE/NRZI/GCR, per-track peak/AGC
//! state is never reinitialised between blocks and retries are forbidden —
//! the Retry Driver enforces the latter by handing this module exactly one
//! parmset.

use crate::{
    block::{BlockKind, BlockResult, SpecializedCounters},
    edge::{Direction, EdgeEvent},
    parmset::Parmset,
    track_state::TrackState,
};

/// Silence, in bit times, beyond which flux polarity is re-resolved from
/// scratch rather than trusted.
pub const WW_PEAKSFAR_BITS: f64 = 2.0;
/// Maximum spacing, in bit times, between two peaks for the second to be
/// accepted as a genuine clock tick rather than noise.
pub const WW_PEAKSCLOSE_BITS: f64 = 0.5;
/// Silence, in bit times, after the last clock tick that ends a block.
pub const WW_CLKSTOP_BITS: f64 = 1.5;
/// Maximum fractional deviation of the observed mean tick period from the
/// nominal bit period before a block is flagged `ww_speed_err`.
pub const WW_MAX_CLK_VARIATION: f64 = 0.10;
/// Gap, in bit times, after the last tick beyond which an LSB-track pulse
/// is taken as a block mark rather than a data bit.
pub const WW_BLOCKMARK_GAP_BITS: f64 = 1.2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FluxPolarity {
    Pos,
    Neg,
    Auto,
}

/// The six logical track indices Whirlwind reads from, redundant pairs
/// named for the role they play rather than a fixed channel number. With no
/// dedicated Whirlwind track-role field on [`crate::config::DecoderConfig`],
/// [`WwTrackRoles::sequential`] is the documented default: tracks
/// `0..6` in primary-clock, primary-lsb, primary-msb, alternate-clock,
/// alternate-lsb, alternate-msb order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WwTrackRoles {
    pub primary_clock: usize,
    pub primary_lsb: usize,
    pub primary_msb: usize,
    pub alternate_clock: usize,
    pub alternate_lsb: usize,
    pub alternate_msb: usize,
}

impl WwTrackRoles {
    pub fn sequential() -> Self {
        WwTrackRoles {
            primary_clock: 0,
            primary_lsb: 1,
            primary_msb: 2,
            alternate_clock: 3,
            alternate_lsb: 4,
            alternate_msb: 5,
        }
    }
}

/// Per-run Whirlwind state that, unlike the other encodings, persists its
/// flux-polarity resolution and block-mark queue across block boundaries.
#[derive(Debug, Clone)]
pub struct WwRunState {
    pub polarity: FluxPolarity,
    pub resolved_positive: bool,
    pub polarity_changes: u32,
    pub last_clock_time: Option<f64>,
    /// A block-mark time seen while decoding the previous block but not yet
    /// consumed, carried forward since a mark edge can fall just past the
    /// generic silence-based block boundary.
    pub blockmark_queued: Option<f64>,
    pub t_lastblockmark: f64,
}

impl WwRunState {
    pub fn new(polarity: FluxPolarity) -> Self {
        WwRunState {
            polarity,
            resolved_positive: true,
            polarity_changes: 0,
            last_clock_time: None,
            blockmark_queued: None,
            t_lastblockmark: f64::NEG_INFINITY,
        }
    }

    /// Resolve the expected clock direction from a long silence: when more
    /// than `WW_PEAKSFAR_BITS` bit-times have elapsed
    /// since the last clock tick, trust the next edge's own direction.
    fn resolve_if_stale(&mut self, now: f64, bit_period: f64, observed: Direction) {
        let stale = match self.last_clock_time {
            Some(last) => (now - last) > WW_PEAKSFAR_BITS * bit_period,
            None => true,
        };
        if stale && self.polarity == FluxPolarity::Auto {
            let new_positive = observed == Direction::Up;
            if new_positive != self.resolved_positive {
                self.polarity_changes += 1;
            }
            self.resolved_positive = new_positive;
        }
    }

    fn expected_clock_direction(&self) -> Direction {
        match self.polarity {
            FluxPolarity::Pos => Direction::Up,
            FluxPolarity::Neg => Direction::Down,
            FluxPolarity::Auto => {
                if self.resolved_positive {
                    Direction::Up
                }
                else {
                    Direction::Down
                }
            }
        }
    }
}

/// One merged clock tick: its time, and whether the primary and alternate
/// clock tracks agreed it occurred.
struct Tick {
    time: f64,
    primary_seen: bool,
    alternate_seen: bool,
}

/// Merge the primary and alternate clock pulse-end events into one ordered
/// tick sequence, de-duplicating ticks within `WW_PEAKSCLOSE_BITS` of each
/// other (the same physical tick observed on both redundant tracks).
fn merge_clock_ticks(primary: &[f64], alternate: &[f64], bit_period: f64) -> Vec<Tick> {
    let mut all: Vec<(f64, bool)> = primary.iter().map(|&t| (t, true)).chain(alternate.iter().map(|&t| (t, false))).collect();
    all.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

    let mut ticks: Vec<Tick> = Vec::new();
    for (t, is_primary) in all {
        if let Some(last) = ticks.last_mut() {
            if (t - last.time).abs() < WW_PEAKSCLOSE_BITS * bit_period {
                if is_primary {
                    last.primary_seen = true;
                }
                else {
                    last.alternate_seen = true;
                }
                continue;
            }
        }
        ticks.push(Tick {
            time: t,
            primary_seen: is_primary,
            alternate_seen: !is_primary,
        });
    }
    ticks
}

/// Decode one block's worth of pre-isolated edge events against the
/// six-track redundant model described by `roles`.
pub fn decode_block(
    tracks: &mut [TrackState],
    run: &mut WwRunState,
    edges: &[EdgeEvent],
    _parmset: &Parmset,
    roles: &WwTrackRoles,
    bpi: f64,
    ips: f64,
    reverse: bool,
) -> BlockResult {
    let n_tracks = tracks.len();
    let bit_period = if bpi > 0.0 { 1.0 / (bpi * ips) } else { tracks[0].clock.period() };

    let mut primary_clock_times: Vec<f64> = Vec::new();
    let mut alternate_clock_times: Vec<f64> = Vec::new();
    let mut primary_lsb: Vec<&EdgeEvent> = Vec::new();
    let mut primary_msb: Vec<&EdgeEvent> = Vec::new();
    let mut alternate_lsb: Vec<&EdgeEvent> = Vec::new();
    let mut alternate_msb: Vec<&EdgeEvent> = Vec::new();

    for ev in edges {
        if ev.track == roles.primary_clock || ev.track == roles.alternate_clock {
            run.resolve_if_stale(ev.time, bit_period, ev.direction);
            let expected = run.expected_clock_direction();
            if ev.direction != expected {
                continue;
            }
            if ev.track == roles.primary_clock {
                primary_clock_times.push(ev.time);
            }
            else {
                alternate_clock_times.push(ev.time);
            }
        }
        else if ev.track == roles.primary_lsb {
            primary_lsb.push(ev);
        }
        else if ev.track == roles.primary_msb {
            primary_msb.push(ev);
        }
        else if ev.track == roles.alternate_lsb {
            alternate_lsb.push(ev);
        }
        else if ev.track == roles.alternate_msb {
            alternate_msb.push(ev);
        }
    }

    let ticks = merge_clock_ticks(&primary_clock_times, &alternate_clock_times, bit_period);
    if ticks.is_empty() {
        return BlockResult::new(BlockKind::Noise);
    }

    let mut specialized = SpecializedCounters::default();
    for t in &ticks {
        if t.primary_seen != t.alternate_seen {
            specialized.ww_missing_clock += 1;
        }
        run.last_clock_time = Some(t.time);
    }

    let block_end = ticks.last().map(|t| t.time).unwrap_or(0.0) + WW_CLKSTOP_BITS * bit_period;

    // A block mark is a pulse on either LSB track arriving well after the
    // last clock tick rather than within a tick interval; one queued from
    // the previous call is consumed first.
    let mut blockmark_time = run.blockmark_queued.take();
    for ev in primary_lsb.iter().chain(alternate_lsb.iter()) {
        if let Some(last_tick) = ticks.last() {
            if ev.time > last_tick.time + WW_BLOCKMARK_GAP_BITS * bit_period {
                blockmark_time = Some(blockmark_time.map_or(ev.time, |t| t.min(ev.time)));
            }
        }
    }
    if let Some(bm) = blockmark_time {
        if bm > block_end {
            run.blockmark_queued = Some(bm);
        }
        else {
            run.t_lastblockmark = bm;
        }
    }

    // Assemble one 2-bit character per tick interval: bit 1 from the MSB
    // pair, bit 0 from the LSB pair, each combined by OR across primary and
    // alternate (redundancy tolerates either copy missing, not both).
    let mut chars: Vec<u8> = Vec::new();
    for w in ticks.windows(2) {
        let (start, end) = (w[0].time, w[1].time);
        if end > block_end {
            break;
        }
        let msb_hit = primary_msb.iter().any(|e| e.time >= start && e.time < end) || alternate_msb.iter().any(|e| e.time >= start && e.time < end);
        let lsb_hit = primary_lsb.iter().any(|e| e.time >= start && e.time < end) || alternate_lsb.iter().any(|e| e.time >= start && e.time < end);

        let msb_disagree = (primary_msb.iter().any(|e| e.time >= start && e.time < end)) != (alternate_msb.iter().any(|e| e.time >= start && e.time < end));
        let lsb_disagree = (primary_lsb.iter().any(|e| e.time >= start && e.time < end)) != (alternate_lsb.iter().any(|e| e.time >= start && e.time < end));
        if msb_disagree || lsb_disagree {
            specialized.ww_missing_onebit += 1;
        }

        let mut ch = 0u8;
        if msb_hit {
            ch |= 0b10;
        }
        if lsb_hit {
            ch |= 0b01;
        }
        chars.push(ch);
    }

    // A spurious leading clock tick can appear ahead of the true first
    // character, inflating the character count to `8n+1`; discard it
    // before byte assembly so the remainder divides evenly into bytes.
    let mut leading_clock_count = 0u32;
    if chars.len() % 8 == 1 && !chars.is_empty() {
        chars.remove(0);
        leading_clock_count = 1;
    }
    if leading_clock_count > 0 {
        specialized.ww_leading_clock = leading_clock_count;
    }

    // Four 2-bit characters assemble into one byte, MSB-first (forward) or
    // LSB-first (reverse read direction).
    let mut bytes = Vec::with_capacity(chars.len() / 4);
    for group in chars.chunks(4) {
        if group.len() < 4 {
            specialized.ww_bad_length += 1;
            continue;
        }
        let mut byte = 0u8;
        if reverse {
            for &c in group.iter() {
                byte = (byte >> 2) | (c << 6);
            }
        }
        else {
            for &c in group.iter() {
                byte = (byte << 2) | c;
            }
        }
        bytes.push(byte);
    }

    // Speed error: the mean tick-to-tick interval deviating from the
    // nominal bit period by more than WW_MAX_CLK_VARIATION indicates the
    // tape ran at the wrong speed for this parmset's configured bpi/ips.
    let mut ww_speed_err = 0u32;
    if ticks.len() >= 2 {
        let total_span = ticks.last().unwrap().time - ticks.first().unwrap().time;
        let mean_period = total_span / (ticks.len() - 1) as f64;
        let deviation = (mean_period - bit_period).abs() / bit_period;
        if deviation > WW_MAX_CLK_VARIATION {
            ww_speed_err = 1;
        }
    }
    specialized.ww_speed_err = ww_speed_err;

    let min_bits = chars.len() * 2;
    let max_bits = min_bits;

    for tr in 0..n_tracks {
        if tr != roles.primary_clock && tr != roles.alternate_clock {
            tracks[tr].peakcount += match tr {
                t if t == roles.primary_lsb => primary_lsb.len() as u32,
                t if t == roles.primary_msb => primary_msb.len() as u32,
                t if t == roles.alternate_lsb => alternate_lsb.len() as u32,
                t if t == roles.alternate_msb => alternate_msb.len() as u32,
                _ => 0,
            };
        }
    }

    let mut result = BlockResult::new(BlockKind::Block);
    result.min_bits = min_bits;
    result.max_bits = max_bits;
    result.avg_bit_spacing = bit_period;
    result.specialized = specialized;
    result.errcount = specialized.ww_bad_length + specialized.ww_speed_err;
    result.warncount = specialized.ww_missing_onebit + specialized.ww_leading_clock + specialized.ww_missing_clock;
    result.data = bytes;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parmset::{AgcMode, ClockAvgMode};

    fn fresh_tracks(n: usize, bit_period: f64) -> Vec<TrackState> {
        (0..n)
            .map(|_| TrackState::new(16, ClockAvgMode::Windowed { window: 10 }, AgcMode::Windowed { window: 3 }, bit_period))
            .collect()
    }

    /// Synthesize clock ticks on both the primary and alternate clock
    /// tracks, plus primary+alternate MSB/LSB pulses, that assemble into
    /// `byte`, MSB-first. Data pulses land at `0.8` of the cell width so
    /// they fall strictly within `[tick_i, tick_{i+1})` rather than
    /// straddling the boundary at `tick_i`.
    fn synth_ww_byte(byte: u8, bit_period: f64, t0: f64) -> Vec<EdgeEvent> {
        let roles = WwTrackRoles::sequential();
        let mut edges = Vec::new();
        let mut t = t0;
        for i in 0..4 {
            edges.push(EdgeEvent {
                track: roles.primary_clock,
                time: t,
                direction: Direction::Up,
            });
            edges.push(EdgeEvent {
                track: roles.alternate_clock,
                time: t,
                direction: Direction::Up,
            });
            let ch = (byte >> (6 - 2 * i)) & 0b11;
            if ch & 0b10 != 0 {
                edges.push(EdgeEvent {
                    track: roles.primary_msb,
                    time: t + bit_period * 0.8,
                    direction: Direction::Up,
                });
                edges.push(EdgeEvent {
                    track: roles.alternate_msb,
                    time: t + bit_period * 0.8,
                    direction: Direction::Up,
                });
            }
            if ch & 0b01 != 0 {
                edges.push(EdgeEvent {
                    track: roles.primary_lsb,
                    time: t + bit_period * 0.8,
                    direction: Direction::Up,
                });
                edges.push(EdgeEvent {
                    track: roles.alternate_lsb,
                    time: t + bit_period * 0.8,
                    direction: Direction::Up,
                });
            }
            t += bit_period;
        }
        // Final clock tick closing the last cell.
        edges.push(EdgeEvent {
            track: roles.primary_clock,
            time: t,
            direction: Direction::Up,
        });
        edges.push(EdgeEvent {
            track: roles.alternate_clock,
            time: t,
            direction: Direction::Up,
        });
        edges
    }

    #[test]
    fn single_byte_round_trips_through_primary_and_alternate_tracks() {
        let bit_period = 1.0 / (2000.0 * 50.0);
        let edges = synth_ww_byte(0xB4, bit_period, 0.0);
        let mut tracks = fresh_tracks(6, bit_period);
        let mut run = WwRunState::new(FluxPolarity::Pos);
        let parmset = Parmset::default();
        let roles = WwTrackRoles::sequential();

        let result = decode_block(&mut tracks, &mut run, &edges, &parmset, &roles, 2000.0, 50.0, false);

        assert_eq!(result.kind, Some(BlockKind::Block));
        assert_eq!(result.data, vec![0xB4]);
        assert_eq!(result.specialized.ww_missing_clock, 0);
        assert_eq!(result.specialized.ww_missing_onebit, 0);
    }

    #[test]
    fn no_clock_ticks_is_noise() {
        let bit_period = 1.0 / (2000.0 * 50.0);
        let mut tracks = fresh_tracks(6, bit_period);
        let mut run = WwRunState::new(FluxPolarity::Pos);
        let parmset = Parmset::default();
        let roles = WwTrackRoles::sequential();
        let result = decode_block(&mut tracks, &mut run, &[], &parmset, &roles, 2000.0, 50.0, false);
        assert_eq!(result.kind, Some(BlockKind::Noise));
    }

    #[test]
    fn polarity_auto_resolves_from_first_edge_after_long_silence() {
        let mut run = WwRunState::new(FluxPolarity::Auto);
        assert!(run.resolved_positive);
        run.resolve_if_stale(10.0, 1e-5, Direction::Down);
        assert!(!run.resolved_positive);
        assert_eq!(run.polarity_changes, 1);
    }

    #[test]
    fn missing_alternate_clock_tick_is_flagged() {
        let bit_period = 1.0 / (2000.0 * 50.0);
        let roles = WwTrackRoles::sequential();
        let mut edges = synth_ww_byte(0x00, bit_period, 0.0);
        // Drop one alternate clock tick to simulate a redundancy mismatch.
        let drop_at = edges.iter().position(|e| e.track == roles.alternate_clock).unwrap();
        edges.remove(drop_at);

        let mut tracks = fresh_tracks(6, bit_period);
        let mut run = WwRunState::new(FluxPolarity::Pos);
        let parmset = Parmset::default();
        let result = decode_block(&mut tracks, &mut run, &edges, &parmset, &roles, 2000.0, 50.0, false);
        assert!(result.specialized.ww_missing_clock > 0);
    }

    #[test]
    fn sequential_roles_cover_six_distinct_tracks() {
        let roles = WwTrackRoles::sequential();
        let all = [
            roles.primary_clock,
            roles.primary_lsb,
            roles.primary_msb,
            roles.alternate_clock,
            roles.alternate_lsb,
            roles.alternate_msb,
        ];
        for (i, &a) in all.iter().enumerate() {
            for (j, &b) in all.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }
}
