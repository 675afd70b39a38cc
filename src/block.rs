//! Block Result & Block Attempt.

use bitflags::bitflags;

/// The outcome kind of one block-decode attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockKind {
    None,
    Tapemark,
    Noise,
    BadBlock,
    Block,
    Aborted,
}

bitflags! {
    /// Bitmask of tracks whose bits were synthesized ("faked") rather than
    /// directly observed, e.g. during a PE idle dropout.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct FakedTracks: u16 {
        const TRACK_0 = 1 << 0;
        const TRACK_1 = 1 << 1;
        const TRACK_2 = 1 << 2;
        const TRACK_3 = 1 << 3;
        const TRACK_4 = 1 << 4;
        const TRACK_5 = 1 << 5;
        const TRACK_6 = 1 << 6;
        const TRACK_7 = 1 << 7;
        const TRACK_8 = 1 << 8;
    }
}

impl FakedTracks {
    pub fn for_track(track: usize) -> Self {
        Self::from_bits_truncate(1u16 << track.min(15))
    }
}

/// Per-encoding specialised counters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpecializedCounters {
    pub gcr_bad_dgroups: u32,
    pub ww_missing_clock: u32,
    pub ww_missing_onebit: u32,
    pub ww_leading_clock: u32,
    pub ww_bad_length: u32,
    pub ww_speed_err: u32,
    pub missed_midbits: u32,
}

/// The outcome of one block-decode attempt under one parmset.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockResult {
    pub kind: Option<BlockKind>,
    pub min_bits: usize,
    pub max_bits: usize,
    pub avg_bit_spacing: f64,

    pub vparity_errs: u32,
    pub crc_errs: u32,
    pub lrc_errs: u32,
    pub ecc_errs: u32,
    pub track_mismatch_errs: u32,
    pub corrected_bits: u32,
    pub faked_tracks: FakedTracks,

    pub alltrk_min_agc_gain: f64,
    pub alltrk_max_agc_gain: f64,

    pub specialized: SpecializedCounters,

    pub errcount: u32,
    pub warncount: u32,

    /// The decoded data bytes, in canonical MSB...LSB,P order.
    pub data: Vec<u8>,
}

impl BlockResult {
    pub fn new(kind: BlockKind) -> Self {
        BlockResult {
            kind: Some(kind),
            alltrk_min_agc_gain: f64::INFINITY,
            alltrk_max_agc_gain: 0.0,
            ..Default::default()
        }
    }

    /// `true` for a block with zero errors and zero warnings (the Retry
    /// Driver's immediate-commit condition).
    pub fn is_perfect(&self) -> bool {
        matches!(self.kind, Some(BlockKind::Block)) && self.errcount == 0 && self.warncount == 0
    }

    /// `max_bits - min_bits`, the track-length mismatch used both by the
    /// mode-specific tolerance check (Testable Property 1) and by the Retry
    /// Driver's `BadBlock` tie-break.
    pub fn track_mismatch(&self) -> usize {
        self.max_bits.saturating_sub(self.min_bits)
    }

    /// Sort key implementing the Retry Driver's parmset preference order:
    /// lower is more preferred.
    ///
    /// 1. First `Block` with `errcount == 0`, fewest warnings.
    /// 2. Else first `Block` with fewest errors.
    /// 3. Else first `BadBlock` with smallest track-length mismatch.
    /// 4. Else first `Noise`.
    pub fn preference_key(&self) -> (u8, u32, u32, usize) {
        match self.kind {
            Some(BlockKind::Block) if self.errcount == 0 => (0, 0, self.warncount, 0),
            Some(BlockKind::Block) => (1, self.errcount, self.warncount, 0),
            Some(BlockKind::BadBlock) => (2, 0, 0, self.track_mismatch()),
            Some(BlockKind::Noise) => (3, 0, 0, 0),
            _ => (4, 0, 0, 0),
        }
    }
}

/// One candidate block-decode, tracking the parmset used and how many
/// attempts have been made.
#[derive(Debug, Clone)]
pub struct BlockAttempt {
    pub tries: u32,
    pub parmset_idx: usize,
    pub t_blockstart: f64,
    pub results: Vec<BlockResult>,
}

impl BlockAttempt {
    pub fn new(t_blockstart: f64) -> Self {
        BlockAttempt {
            tries: 0,
            parmset_idx: 0,
            t_blockstart,
            results: Vec::new(),
        }
    }
}
