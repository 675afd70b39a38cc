//! Retry Driver & parmset selection.
//!
//! Tries each parmset in a mode's catalog against the same block, in
//! catalog order, committing early on a perfect block or a tapemark, and
//! otherwise keeping the most-preferred [`BlockResult`] once every
//! candidate has been tried (or `skip_noise` accepts the first `Noise`
//! early). Every attempt's decoded bytes are kept with its `BlockResult`,
//! so the final commit never needs to re-run the winning parmset.

use crate::{
    block::{BlockAttempt, BlockKind, BlockResult},
    edge::EdgeEvent,
    parmset::{Parmset, ParmsetCounters},
    track_state::TrackState,
};

/// Drives repeated decode attempts of one block under each parmset in a
/// mode's catalog, tracking per-parmset try/choose counters across the
/// whole run.
#[derive(Debug, Default)]
pub struct RetryDriver {
    counters: Vec<ParmsetCounters>,
}

impl RetryDriver {
    pub fn new(catalog_len: usize) -> Self {
        RetryDriver {
            counters: vec![ParmsetCounters::default(); catalog_len],
        }
    }

    pub fn counters(&self) -> &[ParmsetCounters] {
        &self.counters
    }

    /// Run `decode_fn` once per parmset in `catalog` against a fresh clone
    /// of `tracks_template` (clock/AGC history preserved across retries of
    /// the same block's `reset_for_block`), returning the
    /// fully populated [`BlockAttempt`] and the [`TrackState`]s produced
    /// by whichever attempt was ultimately chosen.
    pub fn run<F>(
        &mut self,
        catalog: &[Parmset],
        tracks_template: &[TrackState],
        edges: &[EdgeEvent],
        t_blockstart: f64,
        skip_noise: bool,
        mut decode_fn: F,
    ) -> (BlockAttempt, Vec<TrackState>)
    where
        F: FnMut(&mut [TrackState], &[EdgeEvent], &Parmset) -> BlockResult,
    {
        let mut attempt = BlockAttempt::new(t_blockstart);
        let mut track_snapshots: Vec<Vec<TrackState>> = Vec::with_capacity(catalog.len());

        for (idx, parmset) in catalog.iter().enumerate() {
            let mut tracks = tracks_template.to_vec();
            for t in tracks.iter_mut() {
                t.reset_for_block();
            }

            let result = decode_fn(&mut tracks, edges, parmset);
            self.counters[idx].tried += 1;
            attempt.tries += 1;

            let should_commit_now = result.is_perfect()
                || matches!(result.kind, Some(BlockKind::Tapemark))
                || (skip_noise && matches!(result.kind, Some(BlockKind::Noise)));

            attempt.results.push(result);
            track_snapshots.push(tracks);

            if should_commit_now {
                attempt.parmset_idx = idx;
                self.counters[idx].chosen += 1;
                let chosen_tracks = track_snapshots.pop().unwrap();
                return (attempt, chosen_tracks);
            }
        }

        let best_idx = attempt
            .results
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| r.preference_key())
            .map(|(i, _)| i)
            .unwrap_or(0);

        attempt.parmset_idx = best_idx;
        self.counters[best_idx].chosen += 1;
        let chosen_tracks = track_snapshots.swap_remove(best_idx);
        (attempt, chosen_tracks)
    }
}
