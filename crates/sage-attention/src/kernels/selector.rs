//! Accumulator and kernel-entry selection.
//!
//! Selection is a pure function of the tier profile and the caller's request:
//! the requested granularity and accumulator must both be eligible on the
//! tier, otherwise the call fails naming the combination. There is no
//! fallback to another kernel.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::config::{AccumulatorMode, Granularity};
use crate::core::errors::{AttentionError, Result};
use crate::device::tier::{TierProfile, TileShape};

/// A family of externally built fused kernels sharing one binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelFamily {
    /// Portable per-block kernels (fixed and variable length).
    Triton,
    /// INT8 Q·Kᵀ, FP16 P·V tensor-core kernels.
    Sm80,
    /// INT8 Q·Kᵀ, FP8 P·V kernels (also used on sm120).
    Sm89,
    /// INT8 Q·Kᵀ, FP8 P·V kernels using the sm90 async pipeline.
    Sm90,
}

impl KernelFamily {
    pub const ALL: [KernelFamily; 4] = [
        KernelFamily::Triton,
        KernelFamily::Sm80,
        KernelFamily::Sm89,
        KernelFamily::Sm90,
    ];

    /// Precision the family feeds into the P·V product.
    pub fn pv_precision(self) -> PvPrecision {
        match self {
            KernelFamily::Triton | KernelFamily::Sm80 => PvPrecision::F16,
            KernelFamily::Sm89 | KernelFamily::Sm90 => PvPrecision::F8,
        }
    }
}

impl fmt::Display for KernelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelFamily::Triton => f.write_str("triton"),
            KernelFamily::Sm80 => f.write_str("sm80"),
            KernelFamily::Sm89 => f.write_str("sm89"),
            KernelFamily::Sm90 => f.write_str("sm90"),
        }
    }
}

/// Element type of the P and V operands in the P·V product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PvPrecision {
    F16,
    /// FP8 E4M3 with per-channel V scales fused into the epilogue.
    F8,
}

/// One entry point exported by a kernel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelEntry {
    pub family: KernelFamily,
    pub symbol: &'static str,
    pub accumulator: AccumulatorMode,
    /// `Some(flag)` when causal and non-causal are separate entry points,
    /// `None` when the entry takes causality as a launch argument.
    pub causal: Option<bool>,
    /// The entry adds a per-channel V mean back in its epilogue.
    pub fuse_v_mean: bool,
}

impl KernelEntry {
    pub(crate) const fn new(
        family: KernelFamily,
        symbol: &'static str,
        accumulator: AccumulatorMode,
        causal: Option<bool>,
        fuse_v_mean: bool,
    ) -> Self {
        Self {
            family,
            symbol,
            accumulator,
            causal,
            fuse_v_mean,
        }
    }

    fn matches(&self, accumulator: AccumulatorMode, causal: bool, smooth_v: bool) -> bool {
        self.accumulator == accumulator
            && self.causal.map_or(true, |c| c == causal)
            && self.fuse_v_mean == smooth_v
    }
}

impl fmt::Display for KernelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.family, self.symbol)
    }
}

/// Outcome of kernel selection for a fixed-length call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelSelection {
    pub entry: KernelEntry,
    pub granularity: Granularity,
    pub accumulator: AccumulatorMode,
    /// Effective V smoothing after mode/entry checks.
    pub smooth_v: bool,
    pub tiles: TileShape,
}

/// Select the fixed-length entry point for a request on `profile`.
///
/// Requested smooth-V is dropped with a warning when the accumulator mode
/// cannot correct it or the tier exports no V-mean entry for that mode.
pub fn select_kernel(
    profile: &TierProfile,
    granularity: Option<Granularity>,
    accumulator: Option<AccumulatorMode>,
    causal: bool,
    smooth_v: bool,
    head_dim: usize,
) -> Result<KernelSelection> {
    let granularity = granularity.unwrap_or(profile.default_granularity);
    let accumulator = accumulator.unwrap_or(profile.default_accumulator);

    if !profile.granularities.contains(&granularity) {
        return Err(AttentionError::InvalidCombination {
            tier: profile.tier,
            granularity,
            accumulator,
            reason: format!(
                "granularity not eligible, expected one of {}",
                join(profile.granularities)
            ),
        });
    }
    if !profile.accumulators.contains(&accumulator) {
        return Err(AttentionError::InvalidCombination {
            tier: profile.tier,
            granularity,
            accumulator,
            reason: format!(
                "accumulator not eligible, expected one of {}",
                join(profile.accumulators)
            ),
        });
    }

    let smooth_v = resolve_smooth_v(profile, accumulator, smooth_v);

    let entry = profile
        .entries
        .iter()
        .find(|entry| entry.matches(accumulator, causal, smooth_v))
        .copied()
        .ok_or_else(|| AttentionError::InvalidCombination {
            tier: profile.tier,
            granularity,
            accumulator,
            reason: format!("no entry point for causal={causal} smooth_v={smooth_v}"),
        })?;

    Ok(KernelSelection {
        entry,
        granularity,
        accumulator,
        smooth_v,
        tiles: profile.tiles_for(head_dim, accumulator),
    })
}

/// Select the variable-length entry point on `profile`.
pub fn select_varlen_kernel(profile: &TierProfile, causal: bool) -> Result<KernelEntry> {
    let unsupported = AttentionError::UnsupportedFeature {
        tier: profile.tier,
        feature: "variable-length attention",
    };
    if !profile.supports_varlen() {
        return Err(unsupported);
    }
    profile
        .varlen_entries
        .iter()
        .find(|entry| entry.causal.map_or(true, |c| c == causal))
        .copied()
        .ok_or(unsupported)
}

fn resolve_smooth_v(profile: &TierProfile, accumulator: AccumulatorMode, requested: bool) -> bool {
    if !requested {
        return false;
    }
    if !accumulator.permits_smooth_v() {
        log::warn!("accumulator is {accumulator}, smooth_v will be ignored");
        return false;
    }
    let available = profile
        .entries
        .iter()
        .any(|entry| entry.accumulator == accumulator && entry.fuse_v_mean);
    if !available {
        log::warn!(
            "{} exports no V-mean entry for accumulator {accumulator}, smooth_v will be ignored",
            profile.tier
        );
    }
    available
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
