//! Decoder configuration.
//!
//! The core consumes a fully-populated [`DecoderConfig`]; the `.parm` file
//! tokenizer and CLI option plumbing that would normally build one are
//! external collaborators.

use crate::{parmset::Parmset, Error};

/// Selects which per-encoding state machine drives the decode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display, strum::EnumIter)]
pub enum Mode {
    Pe,
    Nrzi,
    Gcr,
    Whirlwind,
}

/// Expected vertical parity for NRZI/GCR characters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Parity {
    Odd,
    Even,
}

/// Flux polarity resolution strategy, Whirlwind only.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FluxDirection {
    Pos,
    Neg,
    Auto,
}

/// Per-track skew compensation strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Deskew {
    None,
    Auto,
    Manual(Vec<usize>),
}

/// The fully-populated configuration record the core consumes.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub mode: Mode,
    pub n_tracks: usize,
    pub n_heads: usize,
    pub head_to_track: Vec<usize>,

    /// Density in bits per inch; `0.0` triggers the density pre-pass.
    pub bpi: f64,
    /// Linear tape speed in inches per second.
    pub ips: f64,

    pub parity: Parity,
    pub revparity_threshold: f64,

    pub invert: bool,
    pub differentiate: bool,
    pub find_zeros: bool,
    pub reverse_tape: bool,

    pub flux_direction: FluxDirection,

    pub subsample: usize,
    pub skip_samples: usize,
    pub stopaft: Option<usize>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,

    pub deskew: Deskew,

    pub correct_errors: bool,
    pub multiple_tries: bool,

    pub parmsets: Vec<Parmset>,
}

impl DecoderConfig {
    /// Validate the configuration invariants. Called once by
    /// [`crate::context::DecoderContext::new`].
    pub fn validate(&self) -> Result<(), Error> {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start >= end {
                return Err(Error::ConfigInvariant(
                    "start_time must be strictly less than end_time".into(),
                ));
            }
        }

        if let Deskew::Manual(ref skew) = self.deskew {
            if self.n_tracks == 0 {
                return Err(Error::ConfigInvariant(
                    "skew given but n_tracks is unset".into(),
                ));
            }
            if skew.len() != self.n_tracks {
                return Err(Error::ConfigInvariant(format!(
                    "skew vector has {} entries but n_tracks is {}",
                    skew.len(),
                    self.n_tracks
                )));
            }
            if skew.iter().any(|&s| s > 50) {
                return Err(Error::ConfigInvariant(
                    "per-track skew delay must be in 0..50 samples".into(),
                ));
            }
        }

        if self.n_tracks == 0 {
            return Err(Error::ConfigInvariant("n_tracks must be nonzero".into()));
        }

        if self.head_to_track.len() != self.n_heads {
            return Err(Error::ConfigInvariant(
                "head_to_track permutation length must equal n_heads".into(),
            ));
        }

        if self.subsample == 0 {
            return Err(Error::ConfigInvariant("subsample must be >= 1".into()));
        }

        if self.parmsets.is_empty() {
            return Err(Error::ConfigInvariant(
                "at least one parmset must be configured".into(),
            ));
        }

        if self.mode == Mode::Whirlwind && self.multiple_tries && self.parmsets.len() > 1 {
            return Err(Error::ConfigInvariant(
                "Whirlwind forbids per-block retries across multiple parmsets".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parmset::Parmset;

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
    fn rejects_inverted_time_window() {
        let mut cfg = base_config();
        cfg.start_time = Some(5.0);
        cfg.end_time = Some(1.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_skew_without_tracks() {
        let mut cfg = base_config();
        cfg.n_tracks = 0;
        cfg.head_to_track = vec![];
        cfg.deskew = Deskew::Manual(vec![1, 2, 3]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_config() {
        assert!(base_config().validate().is_ok());
    }
}
