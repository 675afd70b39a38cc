//! Per-Track Edge Detector.
//!
//! Two algorithms, selected per run: the moving-window peak detector
//! (default) and the zero-crossing detector (opt-in). Both emit typed
//! `(track, time, direction)` edge events.

use crate::{parmset::Parmset, track_state::TrackState, Error};

/// Direction of a detected flux transition / edge.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// One detected edge event.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct EdgeEvent {
    pub track: usize,
    pub time: f64,
    pub direction: Direction,
}

/// Normalizing constant relating `pkww_rise`/`min_peak` (fractions of
/// `v_avg_height`) to an absolute voltage threshold.
const PKWW_PEAKHEIGHT: f64 = 2.0;
/// Half-width, in volts (pre-AGC-scaled), within which a neighbour sample
/// is considered "close enough" to the peak to shift the reported time.
const PEAK_THRESHOLD: f64 = 0.1;

/// Zero-crossing detector thresholds.
pub const ZEROCROSS_PEAK: f64 = 0.2;
pub const ZEROCROSS_SLOPE: f64 = 1.5;

/// Compute the moving window size `W` for the peak detector from the
/// parmset and density:
/// `W = min(50, floor(pkww_bitfrac / (bpi * ips * delta_t)))`, floored at 8
/// if bpi is unknown (`bpi == 0.0`).
pub fn compute_window_size(parmset: &Parmset, bpi: f64, ips: f64, delta_t: f64) -> usize {
    if bpi <= 0.0 {
        return 8;
    }
    let bit_period = 1.0 / (bpi * ips);
    let raw = (parmset.pkww_bitfrac * bit_period / delta_t).floor();
    if raw.is_finite() && raw >= 1.0 {
        (raw as usize).min(50).max(8)
    }
    else {
        8
    }
}

/// The moving-window peak detector, default algorithm.
pub struct PeakDetector {
    parmset: Parmset,
}

impl PeakDetector {
    pub fn new(parmset: Parmset) -> Self {
        PeakDetector { parmset }
    }

    /// Feed one new voltage sample for a track. Returns `Some(edge)` if a
    /// top or bottom peak was declared at this sample.
    pub fn on_sample(&self, track_idx: usize, ts: &mut TrackState, t: f64, v: f32) -> Result<Option<EdgeEvent>, Error> {
        ts.v_prev = ts.v_now;
        ts.v_now = v;
        ts.window.push(t, v);

        if ts.window.left_distance > 0 {
            ts.window.left_distance -= 1;
            return Ok(None);
        }

        if ts.window.len() < 3 {
            return Ok(None);
        }

        let v_avg = ts.agc.v_avg_height().max(1e-9);
        let gain = ts.agc.gain().max(1e-9);
        let r = self.parmset.pkww_rise * v_avg / (PKWW_PEAKHEIGHT * gain);
        let min_peak_required = if self.parmset.min_peak > 0.0 {
            Some(self.parmset.min_peak * v_avg / (PKWW_PEAKHEIGHT * gain))
        }
        else {
            None
        };

        let max_v = ts.window.max_v() as f64;
        let min_v = ts.window.min_v() as f64;
        let left_v = ts.window.left_edge_v() as f64;
        let right_v = ts.window.right_edge_v() as f64;

        let top_ok = (max_v - left_v) >= r
            && (max_v - right_v) >= r
            && min_peak_required.map(|mp| max_v > mp).unwrap_or(true);

        let bottom_ok = (left_v - min_v) >= r
            && (right_v - min_v) >= r
            && min_peak_required.map(|mp| min_v.abs() > mp).unwrap_or(true);

        if top_ok {
            let idx = ts.window.max_idx();
            let (time, height) = self.refine_time(ts, idx, gain);
            let peak_to_peak = (max_v - min_v).abs();
            ts.note_top_peak(time, height);
            ts.agc.on_peak_height(peak_to_peak);
            ts.window.left_distance = ts.window.len().saturating_sub(1);
            return Ok(Some(EdgeEvent {
                track: track_idx,
                time,
                direction: Direction::Up,
            }));
        }

        if bottom_ok {
            let idx = ts.window.min_idx();
            let (time, height) = self.refine_time(ts, idx, gain);
            let peak_to_peak = (max_v - min_v).abs();
            ts.note_bottom_peak(time, height);
            ts.agc.on_peak_height(peak_to_peak);
            ts.window.left_distance = ts.window.len().saturating_sub(1);
            return Ok(Some(EdgeEvent {
                track: track_idx,
                time,
                direction: Direction::Down,
            }));
        }

        Ok(None)
    }

    /// Time refinement: compare the peak's two immediate
    /// neighbours. If exactly one is within `PEAK_THRESHOLD / agc_gain` of
    /// the peak, shift the reported time by half a sample toward it.
    fn refine_time(&self, ts: &TrackState, idx: usize, gain: f64) -> (f64, f32) {
        let peak_v = if idx == ts.window.max_idx() {
            ts.window.max_v()
        }
        else {
            ts.window.min_v()
        };
        let peak_t = if idx == ts.window.max_idx() {
            ts.window.max_time()
        }
        else {
            ts.window.min_time()
        };

        let (left, right) = ts.window.neighbours_of(idx);
        let threshold = PEAK_THRESHOLD / gain.max(1e-9);

        let left_close = left.map(|(_, v)| (v as f64 - peak_v as f64).abs() <= threshold).unwrap_or(false);
        let right_close = right.map(|(_, v)| (v as f64 - peak_v as f64).abs() <= threshold).unwrap_or(false);

        let shift = match (left_close, right_close) {
            (true, false) => {
                let left_t = left.unwrap().0;
                -0.5 * (peak_t - left_t)
            }
            (false, true) => {
                let right_t = right.unwrap().0;
                0.5 * (right_t - peak_t)
            }
            _ => 0.0,
        };

        (peak_t + shift, peak_v)
    }
}

/// Variant of the zero-crossing detector.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ZeroCrossVariant {
    Raw,
    Differentiated,
}

/// The zero-crossing detector, opt-in alternative to the
/// moving-window peak detector. AGC is disabled while this is active.
pub struct ZeroCrossDetector {
    variant: ZeroCrossVariant,
    bit_period: f64,
    swing_peak: f64,
    last_sign: i8,
    pending_zero_run: Vec<f64>,
}

impl ZeroCrossDetector {
    pub fn new(variant: ZeroCrossVariant, bit_period: f64) -> Self {
        ZeroCrossDetector {
            variant,
            bit_period,
            swing_peak: 0.0,
            last_sign: 0,
            pending_zero_run: Vec::new(),
        }
    }

    /// Feed one new sample. Returns `Some(edge)` when a qualifying
    /// zero-crossing is detected.
    pub fn on_sample(&mut self, track_idx: usize, t: f64, v: f32) -> Option<EdgeEvent> {
        let v = v as f64;

        if self.variant == ZeroCrossVariant::Differentiated && v == 0.0 {
            self.pending_zero_run.push(t);
            return None;
        }

        let sign = if v > 0.0 {
            1
        }
        else if v < 0.0 {
            -1
        }
        else {
            0
        };

        self.swing_peak = if self.last_sign == sign || self.last_sign == 0 {
            self.swing_peak.max(v.abs())
        }
        else {
            v.abs()
        };

        let mut event = None;
        if sign != 0 && self.last_sign != 0 && sign != self.last_sign && self.swing_peak >= ZEROCROSS_PEAK {
            let crossing_time = if !self.pending_zero_run.is_empty() {
                let avg = self.pending_zero_run.iter().sum::<f64>() / self.pending_zero_run.len() as f64;
                self.pending_zero_run.clear();
                avg
            }
            else {
                t
            };

            let direction = if sign > 0 { Direction::Up } else { Direction::Down };
            event = Some(EdgeEvent {
                track: track_idx,
                time: crossing_time,
                direction,
            });
            self.swing_peak = 0.0;
        }

        if sign != 0 {
            self.last_sign = sign;
        }

        let _ = ZEROCROSS_SLOPE * self.bit_period;
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parmset::{AgcMode, ClockAvgMode, Parmset};
    use crate::track_state::TrackState;

    fn track() -> TrackState {
        let mut ts = TrackState::new(8, ClockAvgMode::Windowed { window: 5 }, AgcMode::Windowed { window: 3 }, 1.0);
        ts.agc.set_v_avg_height(1.0);
        ts
    }

    #[test]
    fn window_size_floors_at_8_when_bpi_unknown() {
        let p = Parmset::default();
        assert_eq!(compute_window_size(&p, 0.0, 50.0, 1e-6), 8);
    }

    #[test]
    fn window_size_respects_cap_of_50() {
        let mut p = Parmset::default();
        p.pkww_bitfrac = 0.9;
        let w = compute_window_size(&p, 200.0, 50.0, 1e-9);
        assert!(w <= 50);
    }

    #[test]
    fn zero_cross_requires_minimum_swing() {
        let mut zc = ZeroCrossDetector::new(ZeroCrossVariant::Raw, 1e-5);
        assert!(zc.on_sample(0, 0.0, 0.05).is_none());
        assert!(zc.on_sample(0, 1e-6, -0.05).is_none());
    }

    #[test]
    fn zero_cross_fires_after_sufficient_swing() {
        let mut zc = ZeroCrossDetector::new(ZeroCrossVariant::Raw, 1e-5);
        zc.on_sample(0, 0.0, 1.0);
        let edge = zc.on_sample(0, 1e-6, -1.0);
        assert!(edge.is_some());
    }

    #[test]
    fn peak_detector_ignores_samples_during_countdown() {
        let detector = PeakDetector::new(Parmset::default());
        let mut ts = track();
        ts.window.left_distance = 5;
        let r = detector.on_sample(0, &mut ts, 0.0, 1.0).unwrap();
        assert!(r.is_none());
        assert_eq!(ts.window.left_distance, 4);
    }
}
