//! Hardware tiers and their static kernel profiles.
//!
//! Every tier maps to exactly one [`TierProfile`]: the kernel family it uses,
//! which quantization granularities and accumulator modes are eligible, the
//! defaults applied when the caller leaves them unset, the tile sizes that
//! quantization must agree with, and the entry points the family exports.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::config::{AccumulatorMode, Granularity};
use crate::core::errors::{AttentionError, Result};
use crate::kernels::selector::KernelEntry;
use crate::kernels::KernelFamily;

/// GPU generation class determining which kernels and precisions are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareTier {
    Sm80,
    Sm86,
    Sm89,
    Sm90,
    Sm120,
}

impl HardwareTier {
    pub const ALL: [HardwareTier; 5] = [
        HardwareTier::Sm80,
        HardwareTier::Sm86,
        HardwareTier::Sm89,
        HardwareTier::Sm90,
        HardwareTier::Sm120,
    ];

    /// Map a CUDA compute capability to a tier.
    pub fn from_compute_capability(major: u32, minor: u32) -> Result<Self> {
        match (major, minor) {
            (8, 0) => Ok(HardwareTier::Sm80),
            (8, 6) => Ok(HardwareTier::Sm86),
            (8, 9) => Ok(HardwareTier::Sm89),
            (9, 0) => Ok(HardwareTier::Sm90),
            (12, 0) => Ok(HardwareTier::Sm120),
            _ => Err(AttentionError::UnsupportedTier {
                detail: format!("compute capability {major}.{minor}"),
            }),
        }
    }

    pub fn profile(self) -> &'static TierProfile {
        match self {
            HardwareTier::Sm80 => &SM80,
            HardwareTier::Sm86 => &SM86,
            HardwareTier::Sm89 => &SM89,
            HardwareTier::Sm90 => &SM90,
            HardwareTier::Sm120 => &SM120,
        }
    }
}

impl fmt::Display for HardwareTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HardwareTier::Sm80 => "sm80",
            HardwareTier::Sm86 => "sm86",
            HardwareTier::Sm89 => "sm89",
            HardwareTier::Sm90 => "sm90",
            HardwareTier::Sm120 => "sm120",
        };
        f.write_str(name)
    }
}

impl FromStr for HardwareTier {
    type Err = AttentionError;

    /// Accepts tier names (`sm89`) or dotted compute capabilities (`8.9`).
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().to_ascii_lowercase();
        if let Some((major, minor)) = trimmed.split_once('.') {
            let parse = |part: &str| {
                part.parse::<u32>().map_err(|_| AttentionError::UnsupportedTier {
                    detail: format!("unparseable compute capability '{s}'"),
                })
            };
            return Self::from_compute_capability(parse(major)?, parse(minor)?);
        }
        match trimmed.as_str() {
            "sm80" => Ok(HardwareTier::Sm80),
            "sm86" => Ok(HardwareTier::Sm86),
            "sm89" => Ok(HardwareTier::Sm89),
            "sm90" => Ok(HardwareTier::Sm90),
            "sm120" => Ok(HardwareTier::Sm120),
            _ => Err(AttentionError::UnsupportedTier {
                detail: format!("unknown tier '{s}'"),
            }),
        }
    }
}

/// Tile sizes shared by quantization and the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileShape {
    pub block_q: usize,
    pub warp_q: usize,
    pub block_k: usize,
    pub warp_k: usize,
}

impl TileShape {
    pub const fn new(block_q: usize, warp_q: usize, block_k: usize, warp_k: usize) -> Self {
        Self {
            block_q,
            warp_q,
            block_k,
            warp_k,
        }
    }
}

/// Static description of what a tier supports.
#[derive(Debug)]
pub struct TierProfile {
    pub tier: HardwareTier,
    pub family: KernelFamily,
    pub granularities: &'static [Granularity],
    pub default_granularity: Granularity,
    pub accumulators: &'static [AccumulatorMode],
    pub default_accumulator: AccumulatorMode,
    pub tiles: TileShape,
    /// V's sequence axis is zero-padded to a multiple of this.
    pub value_seq_alignment: Option<usize>,
    pub entries: &'static [KernelEntry],
    /// Empty when the tier offers no variable-length path.
    pub varlen_entries: &'static [KernelEntry],
}

impl TierProfile {
    /// Tile sizes for a concrete call.
    ///
    /// The sm80 hybrid kernel halves the query warp at head_dim 128.
    pub fn tiles_for(&self, head_dim: usize, accumulator: AccumulatorMode) -> TileShape {
        let mut tiles = self.tiles;
        if self.tier == HardwareTier::Sm80
            && head_dim == 128
            && accumulator == AccumulatorMode::Hybrid
        {
            tiles.warp_q = 16;
        }
        tiles
    }

    pub fn supports_varlen(&self) -> bool {
        !self.varlen_entries.is_empty()
    }
}

use AccumulatorMode::{Hybrid, Narrow, Wide};
use Granularity::{PerBlock, PerThread, PerWarp};

/// Per-block tiles used by the portable fixed and variable-length kernels.
pub const TRITON_TILES: TileShape = TileShape::new(128, 128, 64, 64);

const TRITON_VARLEN: [KernelEntry; 2] = [
    KernelEntry::new(
        KernelFamily::Triton,
        "attn_qk_int8_block_varlen",
        Wide,
        Some(false),
        false,
    ),
    KernelEntry::new(
        KernelFamily::Triton,
        "attn_qk_int8_per_block_causal_varlen",
        Wide,
        Some(true),
        false,
    ),
];

const SM80_ENTRIES: [KernelEntry; 4] = [
    KernelEntry::new(
        KernelFamily::Sm80,
        "qk_int8_sv_f16_accum_f16_attn",
        Narrow,
        None,
        false,
    ),
    KernelEntry::new(
        KernelFamily::Sm80,
        "qk_int8_sv_f16_accum_f16_fuse_v_mean_attn",
        Narrow,
        None,
        true,
    ),
    KernelEntry::new(
        KernelFamily::Sm80,
        "qk_int8_sv_f16_accum_f16_attn_inst_buf",
        Hybrid,
        None,
        false,
    ),
    KernelEntry::new(
        KernelFamily::Sm80,
        "qk_int8_sv_f16_accum_f32_attn",
        Wide,
        None,
        false,
    ),
];

const SM86_ENTRIES: [KernelEntry; 2] = [
    KernelEntry::new(
        KernelFamily::Triton,
        "attn_qk_int8_per_block",
        Wide,
        Some(false),
        false,
    ),
    KernelEntry::new(
        KernelFamily::Triton,
        "attn_qk_int8_per_block_causal",
        Wide,
        Some(true),
        false,
    ),
];

const SM89_ENTRIES: [KernelEntry; 3] = [
    KernelEntry::new(
        KernelFamily::Sm89,
        "qk_int8_sv_f8_accum_f32_fuse_v_scale_attn",
        Narrow,
        None,
        false,
    ),
    KernelEntry::new(
        KernelFamily::Sm89,
        "qk_int8_sv_f8_accum_f32_fuse_v_scale_fuse_v_mean_attn",
        Narrow,
        None,
        true,
    ),
    KernelEntry::new(
        KernelFamily::Sm89,
        "qk_int8_sv_f8_accum_f32_fuse_v_scale_attn_inst_buf",
        Hybrid,
        None,
        false,
    ),
];

const SM90_ENTRIES: [KernelEntry; 1] = [KernelEntry::new(
    KernelFamily::Sm90,
    "qk_int8_sv_f8_accum_f32_fuse_v_scale_attn_inst_buf",
    Hybrid,
    None,
    false,
)];

static SM80: TierProfile = TierProfile {
    tier: HardwareTier::Sm80,
    family: KernelFamily::Sm80,
    granularities: &[PerWarp, PerThread],
    default_granularity: PerThread,
    accumulators: &[Narrow, Hybrid, Wide],
    default_accumulator: Wide,
    tiles: TileShape::new(128, 32, 64, 64),
    value_seq_alignment: None,
    entries: &SM80_ENTRIES,
    varlen_entries: &TRITON_VARLEN,
};

static SM86: TierProfile = TierProfile {
    tier: HardwareTier::Sm86,
    family: KernelFamily::Triton,
    granularities: &[PerBlock],
    default_granularity: PerBlock,
    accumulators: &[Wide],
    default_accumulator: Wide,
    tiles: TRITON_TILES,
    value_seq_alignment: None,
    entries: &SM86_ENTRIES,
    varlen_entries: &TRITON_VARLEN,
};

static SM89: TierProfile = TierProfile {
    tier: HardwareTier::Sm89,
    family: KernelFamily::Sm89,
    granularities: &[PerWarp, PerThread],
    default_granularity: PerThread,
    accumulators: &[Narrow, Hybrid],
    default_accumulator: Hybrid,
    tiles: TileShape::new(128, 32, 64, 64),
    value_seq_alignment: None,
    entries: &SM89_ENTRIES,
    varlen_entries: &TRITON_VARLEN,
};

static SM90: TierProfile = TierProfile {
    tier: HardwareTier::Sm90,
    family: KernelFamily::Sm90,
    granularities: &[PerWarp, PerThread],
    default_granularity: PerThread,
    accumulators: &[Hybrid],
    default_accumulator: Hybrid,
    tiles: TileShape::new(64, 16, 128, 128),
    value_seq_alignment: Some(128),
    entries: &SM90_ENTRIES,
    varlen_entries: &TRITON_VARLEN,
};

// sm120 runs the sm89 kernels; the portable per-block path does not build there.
static SM120: TierProfile = TierProfile {
    tier: HardwareTier::Sm120,
    family: KernelFamily::Sm89,
    granularities: &[PerWarp, PerThread],
    default_granularity: PerWarp,
    accumulators: &[Narrow, Hybrid],
    default_accumulator: Narrow,
    tiles: TileShape::new(128, 32, 64, 64),
    value_seq_alignment: None,
    entries: &SM89_ENTRIES,
    varlen_entries: &[],
};
