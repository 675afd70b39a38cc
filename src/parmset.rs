//! Parmset: a record of decoding tunables tried independently on the same
//! block.

use crate::config::Mode;

/// Strategy selector for the clock-averaging filter.
/// At most one of `clk_window`/`clk_alpha` may be non-zero.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ClockAvgMode {
    Windowed { window: usize },
    Exponential { alpha: f64 },
    Constant,
}

/// Strategy selector for the AGC averaging filter.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum AgcMode {
    Windowed { window: usize },
    Exponential { alpha: f64 },
}

/// A single decoding parameterization (the decoder's 13-field tunable
/// record). Each field maps directly onto a named constant.
#[derive(Debug, Clone, PartialEq)]
pub struct Parmset {
    pub clk_avg: ClockAvgMode,
    pub agc_avg: AgcMode,
    /// Minimum voltage a peak must exceed to be considered real (0 disables).
    pub min_peak: f64,
    /// Fraction of the observed timing deviation fed back as pulse-shift
    /// compensation / NRZI clock pull (`pulse_adj`).
    pub pulse_adj: f64,
    /// Fraction of the nominal bit time used to size the peak detector's
    /// moving window (`pkww_bitfrac`).
    pub pkww_bitfrac: f64,
    /// Rise fraction required of a peak relative to its window edges
    /// (`pkww_rise`).
    pub pkww_rise: f64,
    /// PE clock-window widening factor (`clk_factor`).
    pub clk_factor: f64,
    /// NRZI mid-bit fraction offset into the next bit cell (`midbit`).
    pub nrzi_midbit: f64,
    /// GCR one-zero threshold, as a fraction of bit period (`z1pt`).
    pub gcr_z1pt: f64,
    /// GCR two-zero threshold, as a fraction of bit period (`z2pt`).
    pub gcr_z2pt: f64,
}

impl Default for Parmset {
    fn default() -> Self {
        Parmset {
            clk_avg: ClockAvgMode::Windowed { window: 10 },
            agc_avg: AgcMode::Windowed { window: 3 },
            min_peak: 0.0,
            pulse_adj: 0.5,
            pkww_bitfrac: 0.5,
            pkww_rise: 0.2,
            clk_factor: 1.4,
            nrzi_midbit: 0.5,
            gcr_z1pt: 1.5,
            gcr_z2pt: 2.5,
        }
    }
}

impl Parmset {
    /// Tracks how many times this parmset has been tried and chosen across
    /// a run. Kept separate from the immutable tunable fields so the
    /// read-only-during-decode discipline holds: only these
    /// counters are mutated from the Retry Driver, never the tunables.
    pub fn counters() -> ParmsetCounters {
        ParmsetCounters::default()
    }

    /// The default catalog of parmsets tried for a given mode: a fixed small
    /// catalog provided per encoding mode. Whirlwind gets exactly one entry
    /// since per-block retries are forbidden for it.
    pub fn catalog_for(mode: Mode) -> Vec<Parmset> {
        let base = Parmset::default();
        match mode {
            Mode::Pe => vec![
                base.clone(),
                Parmset {
                    pkww_rise: 0.35,
                    pulse_adj: 0.3,
                    ..base.clone()
                },
                Parmset {
                    clk_factor: 1.2,
                    min_peak: 0.1,
                    ..base
                },
            ],
            Mode::Nrzi => vec![
                base.clone(),
                Parmset {
                    nrzi_midbit: 0.6,
                    pulse_adj: 0.35,
                    ..base.clone()
                },
                Parmset {
                    pkww_rise: 0.3,
                    min_peak: 0.15,
                    ..base
                },
            ],
            Mode::Gcr => vec![
                base.clone(),
                Parmset {
                    gcr_z1pt: 1.4,
                    gcr_z2pt: 2.4,
                    ..base.clone()
                },
                Parmset {
                    gcr_z1pt: 1.6,
                    gcr_z2pt: 2.6,
                    min_peak: 0.1,
                    ..base
                },
            ],
            Mode::Whirlwind => vec![base],
        }
    }
}

/// Per-parmset `tried`/`chosen` counters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParmsetCounters {
    pub tried: u64,
    pub chosen: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whirlwind_catalog_has_exactly_one_entry() {
        assert_eq!(Parmset::catalog_for(Mode::Whirlwind).len(), 1);
    }

    #[test]
    fn other_modes_have_multiple_candidates() {
        assert!(Parmset::catalog_for(Mode::Pe).len() > 1);
        assert!(Parmset::catalog_for(Mode::Nrzi).len() > 1);
        assert!(Parmset::catalog_for(Mode::Gcr).len() > 1);
    }

    #[test]
    fn every_mode_ships_a_nonempty_catalog() {
        use strum::IntoEnumIterator;
        for mode in Mode::iter() {
            assert!(!Parmset::catalog_for(mode).is_empty(), "{mode} has no parmsets");
        }
    }
}
