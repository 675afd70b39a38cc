//! Clock Estimator and AGC.
//!
//! Windowed phase/frequency adjustment with a clamped rate, reshaped into
//! three mutually-exclusive strategies, since tape's per-track clocks are
//! simpler single-quantity trackers rather than a full bit-cell PLL.

use crate::{parmset::AgcMode, parmset::ClockAvgMode, MAX_AGC_WINDOW, MAX_CLOCK_WINDOW};
use std::collections::VecDeque;

/// Upper clamp on AGC gain.
pub const AGC_MAX_VALUE: f64 = 2.0;
/// Number of peaks after which AGC baseline accumulation begins.
pub const AGC_STARTBASE: usize = 5;
/// Number of peaks after which AGC baseline accumulation ends and live
/// tracking begins.
pub const AGC_ENDBASE: usize = 15;

/// `clkavg_t`: a moving window of bit-spacings plus their mean, or an
/// exponential/constant alternative. Exactly one
/// strategy is active per track.
#[derive(Debug, Clone)]
pub struct ClockAvg {
    mode: ClockAvgMode,
    window: VecDeque<f64>,
    mean: f64,
}

impl ClockAvg {
    pub fn new(mode: ClockAvgMode, constant_period: f64) -> Self {
        let mean = match mode {
            ClockAvgMode::Constant => constant_period,
            _ => constant_period,
        };
        ClockAvg {
            mode,
            window: VecDeque::with_capacity(MAX_CLOCK_WINDOW),
            mean,
        }
    }

    /// The current bit period estimate.
    pub fn period(&self) -> f64 {
        self.mean
    }

    /// Feed one observed bit-spacing into the selected strategy
    /// (`adjust_clock`).
    pub fn adjust_clock(&mut self, delta: f64) {
        match self.mode {
            ClockAvgMode::Windowed { window } => {
                let window = window.min(MAX_CLOCK_WINDOW).max(1);
                if self.window.len() >= window {
                    let old = self.window.pop_front().unwrap();
                    self.mean += (delta - old) / window as f64;
                }
                else {
                    // Seed the window: recompute the mean exactly until full.
                    self.window.push_back(delta);
                    let sum: f64 = self.window.iter().sum();
                    self.mean = sum / self.window.len() as f64;
                    return;
                }
                self.window.push_back(delta);
            }
            ClockAvgMode::Exponential { alpha } => {
                let alpha = alpha.clamp(f64::MIN_POSITIVE, 1.0);
                self.mean = alpha * delta + (1.0 - alpha) * self.mean;
            }
            ClockAvgMode::Constant => {
                // Constant strategy ignores observations entirely.
            }
        }
    }

    /// Override all history unconditionally (`force_clock`, used in GCR
    /// resync bursts).
    pub fn force_clock(&mut self, period: f64) {
        self.mean = period;
        self.window.clear();
    }
}

/// Automatic Gain Control state for one track.
#[derive(Debug, Clone)]
pub struct Agc {
    mode: AgcMode,
    window: VecDeque<f64>,
    gain: f64,
    v_avg_height: f64,
    baseline_heights: Vec<f64>,
    peak_count: usize,
    pub block_min_gain: f64,
    pub block_max_gain: f64,
}

impl Agc {
    pub fn new(mode: AgcMode) -> Self {
        Agc {
            mode,
            window: VecDeque::with_capacity(MAX_AGC_WINDOW),
            gain: 1.0,
            v_avg_height: 0.0,
            baseline_heights: Vec::new(),
            peak_count: 0,
            block_min_gain: 1.0,
            block_max_gain: 1.0,
        }
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn v_avg_height(&self) -> f64 {
        self.v_avg_height
    }

    /// Directly seed `v_avg_height`, bypassing the baseline-window
    /// accumulation. Used by tests and by the retry driver when replaying
    /// a block under a previously-measured gain.
    pub fn set_v_avg_height(&mut self, height: f64) {
        self.v_avg_height = height;
    }

    /// Reset per-block min/max gain tracking at the start of a new block.
    pub fn start_block(&mut self) {
        self.block_min_gain = self.gain;
        self.block_max_gain = self.gain;
    }

    /// Feed one observed peak-to-peak height. Between peaks
    /// `AGC_STARTBASE..AGC_ENDBASE`, accumulate a baseline average that
    /// seeds `v_avg_height`; thereafter every new peak updates the gain.
    pub fn on_peak_height(&mut self, height: f64) {
        self.peak_count += 1;

        if (AGC_STARTBASE..AGC_ENDBASE).contains(&self.peak_count) {
            self.baseline_heights.push(height);
            if self.peak_count == AGC_ENDBASE - 1 {
                let sum: f64 = self.baseline_heights.iter().sum();
                self.v_avg_height = sum / self.baseline_heights.len() as f64;
            }
            return;
        }

        if self.peak_count < AGC_STARTBASE {
            return;
        }

        match self.mode {
            AgcMode::Windowed { window } => {
                let window = window.min(10).max(1);
                if self.window.len() >= window {
                    self.window.pop_front();
                }
                self.window.push_back(height);
                let min_in_window = self.window.iter().cloned().fold(f64::INFINITY, f64::min);
                if min_in_window > 0.0 {
                    self.gain = (self.v_avg_height / min_in_window).clamp(0.0, AGC_MAX_VALUE);
                }
            }
            AgcMode::Exponential { alpha } => {
                if height > 0.0 {
                    let alpha = alpha.clamp(f64::MIN_POSITIVE, 1.0);
                    self.gain = (alpha * (self.v_avg_height / height) + (1.0 - alpha) * self.gain)
                        .clamp(0.0, AGC_MAX_VALUE);
                }
            }
        }

        self.block_min_gain = self.block_min_gain.min(self.gain);
        self.block_max_gain = self.block_max_gain.max(self.gain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windowed_clock_converges_to_constant_input() {
        let mut c = ClockAvg::new(ClockAvgMode::Windowed { window: 5 }, 1.0);
        for _ in 0..20 {
            c.adjust_clock(2.0);
        }
        assert!((c.period() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn exponential_clock_tracks_new_value_gradually() {
        let mut c = ClockAvg::new(ClockAvgMode::Exponential { alpha: 0.5 }, 1.0);
        c.adjust_clock(3.0);
        assert!(c.period() > 1.0 && c.period() < 3.0);
    }

    #[test]
    fn constant_clock_never_changes() {
        let mut c = ClockAvg::new(ClockAvgMode::Constant, 1.0 / (800.0 * 50.0));
        let before = c.period();
        c.adjust_clock(99.0);
        assert_eq!(c.period(), before);
    }

    #[test]
    fn force_clock_overrides_history() {
        let mut c = ClockAvg::new(ClockAvgMode::Windowed { window: 5 }, 1.0);
        c.adjust_clock(2.0);
        c.force_clock(5.0);
        assert_eq!(c.period(), 5.0);
    }

    #[test]
    fn agc_gain_clamped_to_max() {
        let mut agc = Agc::new(AgcMode::Windowed { window: 3 });
        agc.v_avg_height = 10.0;
        for i in 0..20 {
            agc.on_peak_height(if i < 16 { 1.0 } else { 0.001 });
        }
        assert!(agc.gain() <= AGC_MAX_VALUE);
    }
}
