//! # tapedecode
//!
//! `tapedecode` reconstructs the original digital byte stream from
//! oscilloscope-style analog recordings of the read-head voltages of a
//! multi-track magnetic tape. It implements the per-track analog-to-symbol
//! decoder for Phase Encoding (PE), Non-Return-to-Zero Inverted (NRZI),
//! Group Coded Recording (GCR), and the 6-track Whirlwind variant.
//!
//! The crate consumes a lazy, restartable sequence of timestamped
//! multi-track voltage samples (a [`sample::SampleSource`]) and produces a
//! stream of [`block::BlockResult`]s, driven by [`context::DecoderContext`].
//!
//! File I/O, CLI/option parsing, and the analog container formats are
//! deliberately out of scope; callers adapt their own sample source to the
//! [`sample::SampleSource`] trait.

pub mod assembler;
pub mod block;
pub mod clock;
pub mod config;
pub mod context;
pub mod density;
pub mod deskew;
pub mod edge;
pub mod gcr;
pub mod nrzi;
pub mod parmset;
pub mod pe;
pub mod permute;
pub mod retry;
pub mod sample;
pub mod track_state;
pub mod util;
pub mod whirlwind;

use thiserror::Error;

/// Maximum number of 16-bit cells held in a single block's data buffer.
pub const MAXBLOCK: usize = 131_072;
/// Maximum size of the peak-detection moving window, in samples.
pub const MAX_PEAK_WINDOW: usize = 50;
/// Maximum size of the clock-averaging window, in bit-spacings.
pub const MAX_CLOCK_WINDOW: usize = 50;
/// Maximum size of the AGC averaging window, in peak-to-peak samples.
pub const MAX_AGC_WINDOW: usize = 10;

/// Fatal conditions that abort a decoding run.
///
/// These are distinct from per-block diagnostics ([`block::BlockResult`]),
/// which are always carried as data and never raised as an `Error`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("a configuration invariant was violated: {0}")]
    ConfigInvariant(String),
    #[error("the sample source is malformed: {0}")]
    MalformedSource(String),
    #[error("unsupported sample width (only 16-bit samples are supported)")]
    UnsupportedSampleWidth,
    #[error("peak window overflow: a peak value could not be found in the ring buffer")]
    PeakWindowOverflow,
    #[error("the density estimator could not snap the measured bpi to any standard within 20%")]
    DensityNotStandard,
}

pub type Result<T> = std::result::Result<T, Error>;

pub use crate::{
    block::{BlockAttempt, BlockKind, BlockResult},
    config::{DecoderConfig, Deskew, FluxDirection, Mode, Parity},
    context::DecoderContext,
    sample::{Position, Sample, SampleSource},
};
