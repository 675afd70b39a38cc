//! `DecoderContext`: the top-level per-run driver.
//!
//! Owns the [`crate::sample::SampleSource`] cursor, one [`TrackState`] per
//! track (whose clock/AGC history persists across blocks), and a
//! per-parmset try/choose counter array. [`DecoderContext::decode_next_block`]
//! is the crate's single entry point: it runs the density/deskew pre-passes
//! once, then repeatedly isolates one block's worth of edges per candidate
//! parmset and hands them to the configured encoding's state machine.

use crate::{
    block::{BlockAttempt, BlockKind, BlockResult},
    config::{Deskew, DecoderConfig, FluxDirection, Mode},
    density::DensityEstimator,
    deskew::DeskewEstimator,
    edge::{EdgeEvent, PeakDetector},
    gcr, nrzi,
    parmset::{Parmset, ParmsetCounters},
    pe,
    permute::Permuter,
    sample::{Position, SampleSource},
    track_state::TrackState,
    whirlwind,
};

/// How many consecutive bit-times of total silence, across every track,
/// are taken as the (generous, encoding-independent) upper bound on one
/// block's extent. Each encoding's own `decode_block` then trims its
/// precise end from within this window using its own end-of-block rule.
const GENERIC_BLOCK_GAP_FACTOR: f64 = 10.0;

pub struct DecoderContext<S: SampleSource> {
    source: S,
    config: DecoderConfig,
    tracks: Vec<TrackState>,
    catalog: Vec<Parmset>,
    counters: Vec<ParmsetCounters>,
    samples_per_bit: f64,
    bpi: f64,
    ww_run: Option<whirlwind::WwRunState>,
    ww_roles: whirlwind::WwTrackRoles,
    density: Option<DensityEstimator>,
    deskew_est: Option<DeskewEstimator>,
    preprocessed: bool,
    blocks_decoded: u64,
}

impl<S: SampleSource> DecoderContext<S> {
    pub fn new(source: S, config: DecoderConfig) -> crate::Result<Self> {
        config.validate()?;

        let constant_period = if config.bpi > 0.0 { 1.0 / (config.bpi * config.ips) } else { 1.0 };
        let samples_per_bit = constant_period / source.sample_delta_t().max(f64::MIN_POSITIVE);

        let first = config.parmsets.first().cloned().unwrap_or_default();
        let tracks = (0..config.n_tracks)
            .map(|_| TrackState::new(32, first.clk_avg, first.agc_avg, constant_period))
            .collect();

        let catalog = config.parmsets.clone();
        let counters = vec![ParmsetCounters::default(); catalog.len()];

        let ww_run = if config.mode == Mode::Whirlwind {
            let polarity = match config.flux_direction {
                FluxDirection::Pos => whirlwind::FluxPolarity::Pos,
                FluxDirection::Neg => whirlwind::FluxPolarity::Neg,
                FluxDirection::Auto => whirlwind::FluxPolarity::Auto,
            };
            Some(whirlwind::WwRunState::new(polarity))
        }
        else {
            None
        };

        let density = if config.bpi <= 0.0 { Some(DensityEstimator::new()) } else { None };
        let deskew_est = if matches!(config.deskew, Deskew::Auto) {
            Some(DeskewEstimator::new(config.n_tracks))
        }
        else {
            None
        };
        let bpi = config.bpi;

        Ok(DecoderContext {
            source,
            config,
            tracks,
            catalog,
            counters,
            samples_per_bit,
            bpi,
            ww_run,
            ww_roles: whirlwind::WwTrackRoles::sequential(),
            density,
            deskew_est,
            preprocessed: false,
            blocks_decoded: 0,
        })
    }

    pub fn counters(&self) -> &[ParmsetCounters] {
        &self.counters
    }

    fn fresh_permuter(&self) -> Permuter {
        let mut permuter = Permuter::new(
            self.config.head_to_track.clone(),
            self.config.n_tracks,
            self.config.invert,
            self.config.differentiate,
            self.samples_per_bit,
        );
        if let Deskew::Manual(ref skew) = self.config.deskew {
            permuter.set_skew(skew);
        }
        permuter
    }

    fn bit_period(&self) -> f64 {
        if self.bpi > 0.0 {
            1.0 / (self.bpi * self.config.ips)
        }
        else {
            self.tracks[0].clock.period()
        }
    }

    /// Run the density and/or deskew pre-passes once, ahead of the first
    /// block. No-op on subsequent calls.
    fn run_prepasses(&mut self) {
        if self.preprocessed {
            return;
        }
        self.preprocessed = true;

        let start_pos = self.source.position();

        if let Some(mut estimator) = self.density.take() {
            let mut permuter = self.fresh_permuter();
            let parmset = self.catalog.first().cloned().unwrap_or_default();
            let detector = PeakDetector::new(parmset);
            let mut scratch: Vec<TrackState> = self.tracks.clone();
            let mut last_peak: Vec<Option<f64>> = vec![None; self.config.n_tracks];

            while !estimator.is_saturated() {
                let Some(sample) = self.source.next()
                else {
                    break;
                };
                let voltages = permuter.process(&sample);
                for (idx, &v) in voltages.iter().enumerate() {
                    if let Ok(Some(edge)) = detector.on_sample(idx, &mut scratch[idx], sample.t, v) {
                        if let Some(prev) = last_peak[idx] {
                            estimator.observe(edge.time - prev);
                        }
                        last_peak[idx] = Some(edge.time);
                    }
                }
            }

            match estimator.estimate_bpi(self.config.ips, self.config.mode) {
                Ok(bpi) => {
                    log::debug!("density pre-pass converged on {bpi} bpi");
                    self.bpi = bpi;
                }
                Err(e) => log::debug!("density pre-pass inconclusive: {e}"),
            }
            self.source.seek(start_pos);
        }

        if let Some(mut estimator) = self.deskew_est.take() {
            let mut permuter = self.fresh_permuter();
            let parmset = self.catalog.first().cloned().unwrap_or_default();
            let detector = PeakDetector::new(parmset);
            let mut scratch: Vec<TrackState> = self.tracks.clone();
            let bit_period = self.bit_period();

            while !estimator.is_done() {
                let Some(sample) = self.source.next()
                else {
                    break;
                };
                let voltages = permuter.process(&sample);
                for (idx, &v) in voltages.iter().enumerate() {
                    if let Ok(Some(edge)) = detector.on_sample(idx, &mut scratch[idx], sample.t, v) {
                        let phase = (edge.time / bit_period).fract();
                        estimator.observe(idx, phase);
                    }
                }
                estimator.note_block_boundary();
            }

            // Skew is expressed in whole samples; without a dedicated
            // sample-rate field on the config, fall back on the source's
            // own inter-sample spacing, already known to `samples_per_bit`.
            let sample_rate = 1.0 / (self.bit_period() / self.samples_per_bit.max(1.0));
            if let Some(skew) = estimator.compute_skew(bit_period, sample_rate) {
                log::debug!("deskew pre-pass computed per-track sample delays: {skew:?}");
                self.config.deskew = Deskew::Manual(skew);
            }
            self.source.seek(start_pos);
        }
    }

    /// Seek to `from`, detect edges with `parmset` against a fresh copy of
    /// `tracks`, stopping once every track has been silent for
    /// [`GENERIC_BLOCK_GAP_FACTOR`] bit-times or the source is exhausted.
    /// Leaves the source positioned just past the silence gap and returns
    /// that position alongside the detected edges.
    fn scan_one_attempt(&mut self, from: Position, parmset: &Parmset, tracks: &mut [TrackState]) -> (Vec<EdgeEvent>, Position, bool) {
        self.source.seek(from);
        let mut permuter = self.fresh_permuter();
        let detector = PeakDetector::new(parmset.clone());
        let gap_limit = GENERIC_BLOCK_GAP_FACTOR * self.bit_period();

        let mut edges = Vec::new();
        let mut last_time = 0.0f64;
        let mut saw_any = false;
        let mut exhausted = false;

        loop {
            let Some(sample) = self.source.next()
            else {
                exhausted = true;
                break;
            };
            let voltages = permuter.process(&sample);
            let mut any_edge_this_sample = false;
            for (idx, &v) in voltages.iter().enumerate() {
                if idx >= tracks.len() {
                    continue;
                }
                if let Ok(Some(edge)) = detector.on_sample(idx, &mut tracks[idx], sample.t, v) {
                    edges.push(edge);
                    any_edge_this_sample = true;
                }
            }
            if any_edge_this_sample {
                last_time = sample.t;
                saw_any = true;
            }
            else if saw_any && (sample.t - last_time) > gap_limit {
                break;
            }
        }

        (edges, self.source.position(), exhausted)
    }

    fn decode_with(&mut self, mode: Mode, tracks: &mut [TrackState], edges: &[EdgeEvent], parmset: &Parmset) -> BlockResult {
        let bpi = self.bpi;
        let ips = self.config.ips;
        match mode {
            Mode::Pe => pe::decode_block(tracks, edges, parmset, bpi, ips),
            Mode::Nrzi => {
                let odd_parity = matches!(self.config.parity, crate::config::Parity::Odd);
                nrzi::decode_block(tracks, edges, parmset, bpi, ips, odd_parity, self.config.correct_errors)
            }
            Mode::Gcr => gcr::decode_block(tracks, edges, parmset, bpi, ips, self.config.correct_errors),
            Mode::Whirlwind => {
                let run = self.ww_run.as_mut().expect("whirlwind mode without WwRunState");
                whirlwind::decode_block(tracks, run, edges, parmset, &self.ww_roles, bpi, ips, self.config.reverse_tape)
            }
        }
    }

    /// Decode the next block. Returns `Ok(None)` once the source is
    /// exhausted with no further edges to decode.
    pub fn decode_next_block(&mut self) -> crate::Result<Option<BlockResult>> {
        self.run_prepasses();

        let block_start = self.source.position();
        let mode = self.config.mode;
        let skip_noise = !self.config.multiple_tries;
        let catalog = self.catalog.clone();
        let tracks_template = self.tracks.clone();

        let mut attempt = BlockAttempt::new(block_start.0 as f64);
        let mut snapshots: Vec<(Vec<TrackState>, Position, bool)> = Vec::with_capacity(catalog.len());

        for (idx, parmset) in catalog.iter().enumerate() {
            let mut tracks = tracks_template.clone();
            for t in tracks.iter_mut() {
                t.reset_for_block();
            }

            let (edges, end_pos, exhausted) = self.scan_one_attempt(block_start, parmset, &mut tracks);

            if edges.is_empty() && exhausted && idx == 0 {
                return Ok(None);
            }

            let result = self.decode_with(mode, &mut tracks, &edges, parmset);
            self.counters[idx].tried += 1;

            let commit_now =
                result.is_perfect() || matches!(result.kind, Some(BlockKind::Tapemark)) || (skip_noise && matches!(result.kind, Some(BlockKind::Noise)));

            attempt.tries += 1;
            attempt.results.push(result);
            snapshots.push((tracks, end_pos, exhausted));

            if commit_now {
                attempt.parmset_idx = idx;
                break;
            }
        }

        if attempt.parmset_idx == 0 && attempt.results.len() > 1 {
            let best_idx = attempt
                .results
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.preference_key())
                .map(|(i, _)| i)
                .unwrap_or(0);
            attempt.parmset_idx = best_idx;
        }

        self.counters[attempt.parmset_idx].chosen += 1;
        let (chosen_tracks, chosen_end_pos, _) = snapshots.into_iter().nth(attempt.parmset_idx).expect("attempt ran at least once");

        log::debug!(
            "block {} settled on parmset {} after {} {} in {} mode",
            self.blocks_decoded,
            attempt.parmset_idx,
            attempt.tries,
            if attempt.tries == 1 { "try" } else { "tries" },
            mode,
        );

        self.source.seek(chosen_end_pos);
        self.tracks = chosen_tracks;
        self.blocks_decoded += 1;

        Ok(attempt.results.into_iter().nth(attempt.parmset_idx))
    }

    pub fn blocks_decoded(&self) -> u64 {
        self.blocks_decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FluxDirection, Parity};
    use crate::sample::{Sample, VecSampleSource};

    fn base_config() -> DecoderConfig {
        DecoderConfig {
            mode: Mode::Nrzi,
            n_tracks: 9,
            n_heads: 9,
            head_to_track: (0..9).collect(),
            bpi: 800.0,
            ips: 50.0,
            parity: Parity::Odd,
            revparity_threshold: 2.0,
            invert: false,
            differentiate: false,
            find_zeros: false,
            reverse_tape: false,
            flux_direction: FluxDirection::Auto,
            subsample: 1,
            skip_samples: 0,
            stopaft: None,
            start_time: None,
            end_time: None,
            deskew: Deskew::None,
            correct_errors: false,
            multiple_tries: false,
            parmsets: vec![Parmset::default()],
        }
    }

    #[test]
    fn empty_source_yields_no_blocks() {
        let src = VecSampleSource::new(vec![], 1e-6);
        let mut ctx = DecoderContext::new(src, base_config()).unwrap();
        assert!(ctx.decode_next_block().unwrap().is_none());
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let src = VecSampleSource::new(vec![], 1e-6);
        let mut cfg = base_config();
        cfg.n_tracks = 0;
        assert!(DecoderContext::new(src, cfg).is_err());
    }

    #[test]
    fn flat_silent_source_produces_no_blocks() {
        let samples = (0..50).map(|i| Sample::new(i as f64 * 1e-6, vec![0.0; 9])).collect();
        let src = VecSampleSource::new(samples, 1e-6);
        let mut ctx = DecoderContext::new(src, base_config()).unwrap();
        let result = ctx.decode_next_block().unwrap();
        assert!(result.is_none());
    }
}
