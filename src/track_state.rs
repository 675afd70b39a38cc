//! Track State: per-track timing and voltage history.
//!
//! One [`TrackState`] exists per magnetic head/track and is exclusively
//! owned by the encoding state machine for the duration of a block decode
//!. It bundles the peak-window ring buffer, last-detected
//! peak timings, AGC and clock sub-state, and the small set of counters
//! and booleans each encoding's state machine consults.

use crate::{
    clock::{Agc, ClockAvg},
    parmset::{AgcMode, ClockAvgMode},
    MAX_PEAK_WINDOW,
};

/// A ring buffer of up to [`MAX_PEAK_WINDOW`] raw voltage samples for one
/// track, with a cached `(min_v, max_v)` and their indices, used by the
/// moving-window peak detector.
#[derive(Debug, Clone)]
pub struct PeakWindow {
    times: Vec<f64>,
    values: Vec<f32>,
    capacity: usize,
    min_idx: usize,
    max_idx: usize,
    /// Countdown of samples during which no further peak is considered,
    /// after a peak has just been emitted.
    pub left_distance: usize,
}

impl PeakWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_PEAK_WINDOW).max(1);
        PeakWindow {
            times: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            capacity,
            min_idx: 0,
            max_idx: 0,
            left_distance: 0,
        }
    }

    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.min(MAX_PEAK_WINDOW).max(1);
        while self.times.len() > self.capacity {
            self.times.remove(0);
            self.values.remove(0);
        }
        self.rescan();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn min_v(&self) -> f32 {
        self.values.get(self.min_idx).copied().unwrap_or(0.0)
    }

    pub fn max_v(&self) -> f32 {
        self.values.get(self.max_idx).copied().unwrap_or(0.0)
    }

    pub fn min_time(&self) -> f64 {
        self.times.get(self.min_idx).copied().unwrap_or(0.0)
    }

    pub fn max_time(&self) -> f64 {
        self.times.get(self.max_idx).copied().unwrap_or(0.0)
    }

    /// Value and time of the sample immediately preceding the window's
    /// current maximum/minimum, used for peak-time refinement.
    pub fn neighbours_of(&self, idx: usize) -> (Option<(f64, f32)>, Option<(f64, f32)>) {
        let left = if idx > 0 {
            Some((self.times[idx - 1], self.values[idx - 1]))
        }
        else {
            None
        };
        let right = if idx + 1 < self.values.len() {
            Some((self.times[idx + 1], self.values[idx + 1]))
        }
        else {
            None
        };
        (left, right)
    }

    pub fn max_idx(&self) -> usize {
        self.max_idx
    }

    pub fn min_idx(&self) -> usize {
        self.min_idx
    }

    pub fn left_edge_v(&self) -> f32 {
        self.values.first().copied().unwrap_or(0.0)
    }

    pub fn right_edge_v(&self) -> f32 {
        self.values.last().copied().unwrap_or(0.0)
    }

    /// Push a new sample into the ring, evicting the oldest once full.
    ///
    /// Per its documented suspected-source behaviour: when a
    /// sample that evicts the cached `min_v`/`max_v` is pushed, this always
    /// performs a full rescan rather than attempting (and failing) an
    /// incremental new-minimum/new-maximum test. That asymmetric
    /// "self-comparison that always fails" is reproduced literally here by
    /// simply never attempting the incremental path.
    pub fn push(&mut self, t: f64, v: f32) {
        let evicting_extreme = self.values.len() >= self.capacity && (self.min_idx == 0 || self.max_idx == 0);

        if self.values.len() >= self.capacity {
            self.times.remove(0);
            self.values.remove(0);
        }
        self.times.push(t);
        self.values.push(v);

        if evicting_extreme || self.values.len() <= 1 {
            self.rescan();
        }
        else {
            // Maintain indices after the shift-left caused by eviction.
            if self.min_idx > 0 {
                self.min_idx -= 1;
            }
            if self.max_idx > 0 {
                self.max_idx -= 1;
            }
            let new_idx = self.values.len() - 1;
            if self.values[new_idx] < self.values[self.min_idx] {
                self.min_idx = new_idx;
            }
            if self.values[new_idx] > self.values[self.max_idx] {
                self.max_idx = new_idx;
            }
        }
    }

    fn rescan(&mut self) {
        self.min_idx = 0;
        self.max_idx = 0;
        for i in 1..self.values.len() {
            if self.values[i] < self.values[self.min_idx] {
                self.min_idx = i;
            }
            if self.values[i] > self.values[self.max_idx] {
                self.max_idx = i;
            }
        }
    }

    pub fn clear(&mut self) {
        self.times.clear();
        self.values.clear();
        self.min_idx = 0;
        self.max_idx = 0;
        self.left_distance = 0;
    }
}

/// All timing and voltage history for one magnetic head.
#[derive(Debug, Clone)]
pub struct TrackState {
    pub v_now: f32,
    pub v_prev: f32,
    pub v_last_raw: f32,

    pub window: PeakWindow,

    pub t_top: f64,
    pub v_top: f32,
    pub t_bot: f64,
    pub v_bot: f32,
    pub t_lastpeak: f64,
    pub v_lastpeak: f32,
    pub t_prevlastpeak: f64,

    pub zerocross_pending: bool,

    pub agc: Agc,
    pub clock: ClockAvg,

    pub datacount: u32,
    pub peakcount: u32,
    pub consecutive_zeroes: u32,

    pub idle: bool,
    pub datablock: bool,

    // PE-only fields.
    pub bit1_up: bool,
    pub clknext: bool,
    pub t_clkwindow: f64,

    /// Pulse-shift compensation accumulator.
    pub t_pulse_adj: f64,

    /// Decoded data bits for this track, MSB-first as discovered.
    pub bits: bit_vec::BitVec,
    /// Parallel bitmask of bits that were synthesized (faked) rather than
    /// directly observed.
    pub data_faked: bit_vec::BitVec,
}

impl TrackState {
    pub fn new(window_capacity: usize, clk_mode: ClockAvgMode, agc_mode: AgcMode, constant_period: f64) -> Self {
        TrackState {
            v_now: 0.0,
            v_prev: 0.0,
            v_last_raw: 0.0,
            window: PeakWindow::new(window_capacity),
            t_top: 0.0,
            v_top: 0.0,
            t_bot: 0.0,
            v_bot: 0.0,
            t_lastpeak: 0.0,
            v_lastpeak: 0.0,
            t_prevlastpeak: 0.0,
            zerocross_pending: false,
            agc: Agc::new(agc_mode),
            clock: ClockAvg::new(clk_mode, constant_period),
            datacount: 0,
            peakcount: 0,
            consecutive_zeroes: 0,
            idle: true,
            datablock: false,
            bit1_up: true,
            clknext: true,
            t_clkwindow: constant_period / 2.0,
            t_pulse_adj: 0.0,
            bits: bit_vec::BitVec::new(),
            data_faked: bit_vec::BitVec::new(),
        }
    }

    /// Reset per-block mutable state ahead of a retry, without touching the
    /// clock/AGC history (PE, NRZI, GCR only — Whirlwind forbids this and
    /// manages its own reinitialisation separately).
    pub fn reset_for_block(&mut self) {
        self.window.clear();
        self.datacount = 0;
        self.peakcount = 0;
        self.consecutive_zeroes = 0;
        self.idle = true;
        self.datablock = false;
        self.bit1_up = true;
        self.clknext = true;
        self.t_pulse_adj = 0.0;
        self.bits.clear();
        self.data_faked.clear();
        self.agc.start_block();
    }

    /// Record a newly detected top (up) peak at time `t`, value `v`.
    pub fn note_top_peak(&mut self, t: f64, v: f32) {
        self.t_prevlastpeak = self.t_lastpeak;
        self.t_top = t;
        self.v_top = v;
        self.t_lastpeak = t;
        self.v_lastpeak = v;
        self.peakcount += 1;
    }

    /// Record a newly detected bottom (down) peak at time `t`, value `v`.
    pub fn note_bottom_peak(&mut self, t: f64, v: f32) {
        self.t_prevlastpeak = self.t_lastpeak;
        self.t_bot = t;
        self.v_bot = v;
        self.t_lastpeak = t;
        self.v_lastpeak = v;
        self.peakcount += 1;
    }
}
