//! Density Estimator pre-pass.
//!
//! Runs ahead of the main decode loop whenever `bpi == 0.0`: buckets
//! observed peak-to-peak intervals into a coarse histogram, finds the
//! dominant interval by local-maxima search, and snaps it to the nearest
//! standard tape density. Uses a bucketed local-maxima search over
//! inter-peak gaps, the same shape as a flux-transition histogram reshaped
//! around gaps instead of flux-transition lengths.

use crate::{config::Mode, Error};

/// Histogram bucket width, in microseconds.
const BUCKET_US: f64 = 0.5;
/// A bucket must hold at least this fraction of all samples to be
/// considered a candidate local maximum, for noise immunity.
const NOISE_IMMUNITY_FRACTION: f64 = 0.05;
/// Total transitions observed after which estimation terminates even if no
/// stable maximum has been found.
const ESTDEN_COUNTNEEDED: usize = 9999;
/// Standard densities, in bits per inch, that density estimation snaps to.
const STANDARD_DENSITIES: [f64; 5] = [200.0, 556.0, 800.0, 1600.0, 9042.0];
/// Relative tolerance for snapping a measured density to a standard one.
const SNAP_TOLERANCE: f64 = 0.20;

/// Accumulates inter-peak interval observations and estimates the tape's
/// bits-per-inch density.
#[derive(Debug, Default)]
pub struct DensityEstimator {
    buckets: Vec<u32>,
    total: usize,
}

impl DensityEstimator {
    pub fn new() -> Self {
        DensityEstimator::default()
    }

    /// `true` once enough observations have been collected to stop feeding
    /// more samples.
    pub fn is_saturated(&self) -> bool {
        self.total >= ESTDEN_COUNTNEEDED
    }

    /// Feed one observed inter-peak interval, in seconds.
    pub fn observe(&mut self, interval_seconds: f64) {
        if self.is_saturated() {
            return;
        }
        let us = interval_seconds * 1e6;
        let bucket = (us / BUCKET_US).round().max(0.0) as usize;
        if bucket >= self.buckets.len() {
            self.buckets.resize(bucket + 1, 0);
        }
        self.buckets[bucket] += 1;
        self.total += 1;
    }

    /// Find the dominant bucket: the smallest-index (minimum-distance)
    /// bucket that clears the noise-immunity threshold, not the tallest.
    /// Picking the nearest qualifying interval rather than the most
    /// populous one is what lets a block of genuine 1600bpi transitions
    /// with a scattering of longer (half-rate) gaps still snap to 1600
    /// rather than drift to whichever bucket happens to be tallest.
    fn dominant_interval_us(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        let threshold = (self.total as f64 * NOISE_IMMUNITY_FRACTION).ceil() as u32;
        for (i, &v) in self.buckets.iter().enumerate() {
            if v >= threshold {
                return Some(i as f64 * BUCKET_US);
            }
        }
        None
    }

    /// Estimate the tape's density in bits per inch, given the known tape
    /// speed (inches per second) and decode mode. Snaps the measured value
    /// to the nearest standard density within [`SNAP_TOLERANCE`]; returns
    /// [`Error::DensityNotStandard`] if none is close enough.
    ///
    /// Phase Encoding writes one flux transition per half bit-cell in the
    /// worst case, so its dominant inter-peak interval measures half a bit
    /// period; the candidate bpi is halved before snapping so a PE block
    /// recorded at 1600bpi doesn't get mistaken for 3200bpi.
    pub fn estimate_bpi(&self, ips: f64, mode: Mode) -> Result<f64, Error> {
        let interval_us = self
            .dominant_interval_us()
            .ok_or_else(|| Error::MalformedSource("no transitions observed during density estimation".into()))?;

        let interval_seconds = interval_us * 1e-6;
        if interval_seconds <= 0.0 || ips <= 0.0 {
            return Err(Error::DensityNotStandard);
        }
        let mut measured_bpi = 1.0 / (interval_seconds * ips);
        if mode == Mode::Pe {
            measured_bpi /= 2.0;
        }

        STANDARD_DENSITIES
            .iter()
            .copied()
            .find(|&std_bpi| ((measured_bpi - std_bpi).abs() / std_bpi) <= SNAP_TOLERANCE)
            .ok_or(Error::DensityNotStandard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_on_the_dominant_interval() {
        let mut est = DensityEstimator::new();
        let ips = 50.0;
        let bit_period = 1.0 / (1600.0 * ips);
        for _ in 0..500 {
            est.observe(bit_period);
        }
        // Sprinkle a little noise well below the immunity threshold.
        for _ in 0..5 {
            est.observe(bit_period * 3.0);
        }
        let bpi = est.estimate_bpi(ips, Mode::Nrzi).unwrap();
        assert!((bpi - 1600.0).abs() < 1.0);
    }

    #[test]
    fn non_standard_density_is_rejected() {
        let mut est = DensityEstimator::new();
        let ips = 50.0;
        // An interval corresponding to ~1000 bpi, nowhere near a standard.
        let bit_period = 1.0 / (1000.0 * ips);
        for _ in 0..200 {
            est.observe(bit_period);
        }
        assert!(matches!(est.estimate_bpi(ips, Mode::Nrzi), Err(Error::DensityNotStandard)));
    }

    #[test]
    fn pe_mode_halves_the_candidate_bpi_before_snapping() {
        // A dominant interval measuring out to 3200bpi at face value must
        // snap to 1600, not 3200, once halved for PE's per-half-cell
        // transition rate.
        let mut est = DensityEstimator::new();
        let ips = 50.0;
        let bit_period = 1.0 / (3200.0 * ips);
        for _ in 0..500 {
            est.observe(bit_period);
        }
        let bpi = est.estimate_bpi(ips, Mode::Pe).unwrap();
        assert!((bpi - 1600.0).abs() < 1.0);
    }

    #[test]
    fn minimum_distance_bucket_wins_over_a_taller_farther_one() {
        // A shorter, less-populous qualifying interval must be preferred
        // over a taller bucket further from zero.
        let mut est = DensityEstimator::new();
        let ips = 50.0;
        let near = 1.0 / (1600.0 * ips);
        let far = 1.0 / (800.0 * ips);
        for _ in 0..600 {
            est.observe(far);
        }
        for _ in 0..60 {
            est.observe(near);
        }
        let bpi = est.estimate_bpi(ips, Mode::Nrzi).unwrap();
        assert!((bpi - 1600.0).abs() < 1.0);
    }

    #[test]
    fn saturates_after_estden_countneeded_observations() {
        let mut est = DensityEstimator::new();
        for _ in 0..(ESTDEN_COUNTNEEDED + 10) {
            est.observe(1e-6);
        }
        assert!(est.is_saturated());
        assert_eq!(est.total, ESTDEN_COUNTNEEDED);
    }
}
