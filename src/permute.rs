//! Head→Track Permuter & Preprocessor.
//!
//! Re-labels incoming head columns into canonical track order, applies
//! optional per-track polarity inversion, skew-delay buffering, and an
//! optional first-difference (differentiator) filter.

use crate::sample::Sample;

const DISCARD: usize = usize::MAX;

/// A per-track circular delay buffer implementing skew compensation
///. Before the buffer is full, samples pass through
/// unchanged (the first `skew` samples of a file are approximate, per spec).
struct SkewBuffer {
    buf: Vec<f32>,
    len: usize,
    write: usize,
    filled: usize,
}

impl SkewBuffer {
    fn new(skew: usize) -> Self {
        SkewBuffer {
            buf: vec![0.0; skew.max(1)],
            len: skew,
            write: 0,
            filled: 0,
        }
    }

    /// Push a new voltage, returning the delayed voltage to use this sample.
    fn push(&mut self, v: f32) -> f32 {
        if self.len == 0 {
            return v;
        }
        if self.filled < self.len {
            // Buffer not yet full: pass through, but keep filling the ring
            // so that after `len` samples the delay is exact.
            let out = v;
            self.buf[self.write] = v;
            self.write = (self.write + 1) % self.len;
            self.filled += 1;
            out
        }
        else {
            let out = self.buf[self.write];
            self.buf[self.write] = v;
            self.write = (self.write + 1) % self.len;
            out
        }
    }
}

/// Converts incoming multi-head `Sample`s into per-track voltages observed
/// at a consistent point along the tape.
pub struct Permuter {
    /// `head_to_track[head] = track`, or `DISCARD` for unused Whirlwind heads.
    head_to_track: Vec<usize>,
    n_tracks: usize,
    invert: bool,
    differentiate: bool,
    samples_per_bit: f64,
    skew: Vec<SkewBuffer>,
    v_last_raw: Vec<f32>,
}

impl Permuter {
    pub fn new(head_to_track: Vec<usize>, n_tracks: usize, invert: bool, differentiate: bool, samples_per_bit: f64) -> Self {
        let skew = (0..n_tracks).map(|_| SkewBuffer::new(0)).collect();
        Permuter {
            head_to_track,
            n_tracks,
            invert,
            differentiate,
            samples_per_bit,
            skew,
            v_last_raw: vec![0.0; n_tracks],
        }
    }

    /// Route unused head columns to the discard slot (Whirlwind).
    pub fn discard_head(&mut self, head: usize) {
        self.head_to_track[head] = DISCARD;
    }

    /// Configure the per-track skew delay in samples (`skew[track] in 0..50`).
    pub fn set_skew(&mut self, skew: &[usize]) {
        assert_eq!(skew.len(), self.n_tracks);
        self.skew = skew.iter().map(|&s| SkewBuffer::new(s)).collect();
    }

    /// Permute, invert, deskew, and optionally differentiate one incoming
    /// frame. Returns a per-track voltage vector of length `n_tracks`.
    pub fn process(&mut self, sample: &Sample) -> Vec<f32> {
        let mut out = vec![0.0f32; self.n_tracks];
        for (head, &v_raw) in sample.v.iter().enumerate() {
            let Some(&track) = self.head_to_track.get(head) else {
                continue;
            };
            if track == DISCARD {
                continue;
            }

            let mut v = v_raw;
            if self.invert {
                v = -v;
            }

            if self.differentiate {
                let delta = (v - self.v_last_raw[track]) as f64;
                let delta = if delta.abs() < 0.05 { 0.0 } else { delta };
                self.v_last_raw[track] = v;
                v = (delta * 0.4 * self.samples_per_bit) as f32;
            }
            else {
                self.v_last_raw[track] = v;
            }

            out[track] = self.skew[track].push(v);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permutes_head_columns_into_track_order() {
        // head 0 -> track 1, head 1 -> track 0
        let mut p = Permuter::new(vec![1, 0], 2, false, false, 1.0);
        let out = p.process(&Sample::new(0.0, vec![1.0, 2.0]));
        assert_eq!(out, vec![2.0, 1.0]);
    }

    #[test]
    fn inversion_negates_voltage() {
        let mut p = Permuter::new(vec![0], 1, true, false, 1.0);
        let out = p.process(&Sample::new(0.0, vec![3.0]));
        assert_eq!(out, vec![-3.0]);
    }

    #[test]
    fn skew_delays_by_exact_sample_count() {
        let mut p = Permuter::new(vec![0], 1, false, false, 1.0);
        p.set_skew(&[2]);

        let v0 = p.process(&Sample::new(0.0, vec![1.0]))[0];
        let v1 = p.process(&Sample::new(1.0, vec![2.0]))[0];
        let v2 = p.process(&Sample::new(2.0, vec![3.0]))[0];
        let v3 = p.process(&Sample::new(3.0, vec![4.0]))[0];

        // First `skew` samples pass through approximately, then the delay
        // becomes exact.
        assert_eq!(v0, 1.0);
        assert_eq!(v1, 2.0);
        assert_eq!(v2, 1.0);
        assert_eq!(v3, 2.0);
    }

    #[test]
    fn differentiator_applies_dead_band() {
        let mut p = Permuter::new(vec![0], 1, false, true, 2.0);
        // Small delta below the 0.05 dead-band collapses to zero.
        p.process(&Sample::new(0.0, vec![0.0]));
        let out = p.process(&Sample::new(1.0, vec![0.02]));
        assert_eq!(out[0], 0.0);
    }

    #[test]
    fn discarded_head_is_skipped() {
        let mut p = Permuter::new(vec![0, 1], 2, false, false, 1.0);
        p.discard_head(1);
        let out = p.process(&Sample::new(0.0, vec![5.0, 9.0]));
        assert_eq!(out, vec![5.0, 0.0]);
    }
}
