//! Deskew pre-pass.
//!
//! Accumulates, per track, the phase of each flux transition relative to
//! the nominal bit clock, then derives a per-track sample-delay skew from
//! the mean phase offset. Runs ahead of the main decode loop when
//! `Deskew::Auto` is configured.

/// Pre-pass terminates after this many blocks even if no track has seen
/// enough transitions.
const DESKEW_MAX_BLOCKS: u32 = 100;
/// Pre-pass terminates early once any one track accumulates this many
/// transitions.
const DESKEW_MAX_TRANSITIONS: u32 = 1000;
/// Per-track phase standard deviation, as a fraction of the bit period,
/// above which the estimate is flagged unreliable.
const SKEW_STDDEV_WARN: f64 = 0.10;
/// Cross-track spread in mean phase, as a fraction of the bit period,
/// below which skewing is considered unnecessary.
const SKEW_NEGLIGIBLE_STDDEV: f64 = 0.03;

#[derive(Debug, Default, Clone)]
struct TrackPhaseStats {
    sum: f64,
    sum_sq: f64,
    count: u32,
}

impl TrackPhaseStats {
    fn observe(&mut self, phase: f64) {
        self.sum += phase;
        self.sum_sq += phase * phase;
        self.count += 1;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        }
        else {
            self.sum / self.count as f64
        }
    }

    fn stddev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = (self.sum_sq / self.count as f64) - mean * mean;
        variance.max(0.0).sqrt()
    }
}

/// Accumulates per-track transition phase and derives a skew-in-samples
/// vector once enough data has been seen.
#[derive(Debug, Default)]
pub struct DeskewEstimator {
    blocks_seen: u32,
    tracks: Vec<TrackPhaseStats>,
}

impl DeskewEstimator {
    pub fn new(n_tracks: usize) -> Self {
        DeskewEstimator {
            blocks_seen: 0,
            tracks: vec![TrackPhaseStats::default(); n_tracks],
        }
    }

    /// Record one transition on `track` at `phase` (its time modulo the
    /// nominal bit period, already normalised to `[0, 1)`).
    pub fn observe(&mut self, track: usize, phase: f64) {
        if track < self.tracks.len() {
            self.tracks[track].observe(phase);
        }
    }

    pub fn note_block_boundary(&mut self) {
        self.blocks_seen += 1;
    }

    /// `true` once the pre-pass should stop feeding more blocks.
    pub fn is_done(&self) -> bool {
        self.blocks_seen >= DESKEW_MAX_BLOCKS || self.tracks.iter().any(|t| t.count >= DESKEW_MAX_TRANSITIONS)
    }

    /// Whether any track's phase measurement is noisy enough that the
    /// derived skew should be treated with suspicion.
    pub fn any_track_unreliable(&self) -> bool {
        self.tracks.iter().any(|t| t.stddev() > SKEW_STDDEV_WARN)
    }

    /// Compute the per-track skew, in whole samples at `sample_rate` Hz,
    /// relative to the earliest-arriving track. Returns `None` (no
    /// skewing needed) if the cross-track spread of mean phases is below
    /// [`SKEW_NEGLIGIBLE_STDDEV`].
    pub fn compute_skew(&self, bit_period: f64, sample_rate: f64) -> Option<Vec<usize>> {
        if self.tracks.is_empty() {
            return None;
        }
        let means: Vec<f64> = self.tracks.iter().map(|t| t.mean()).collect();
        let avg = means.iter().sum::<f64>() / means.len() as f64;
        let variance = means.iter().map(|m| (m - avg).powi(2)).sum::<f64>() / means.len() as f64;
        if variance.sqrt() < SKEW_NEGLIGIBLE_STDDEV {
            return None;
        }

        let earliest = means.iter().cloned().fold(f64::INFINITY, f64::min);
        Some(
            means
                .iter()
                .map(|&m| (((m - earliest) * bit_period) * sample_rate).round().max(0.0) as usize)
                .collect(),
        )
    }
}
