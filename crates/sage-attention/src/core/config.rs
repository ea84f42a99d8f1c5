//! Configuration options shared by the attention entry points.
//!
//! [`Config`] captures run-time knobs (layout, causal masking, quantization
//! granularity, accumulator precision, smoothing) that callers can tune
//! without swapping implementations. Unset granularity/accumulator fields fall
//! back to the active hardware tier's defaults.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Physical axis order of a 4D attention tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TensorLayout {
    /// `[batch, heads, seq, head_dim]`.
    #[default]
    Hnd,
    /// `[batch, seq, heads, head_dim]`.
    Nhd,
}

impl TensorLayout {
    /// Split physical dims into `(batch, heads, seq, head_dim)`.
    pub fn logical_dims(self, dims: (usize, usize, usize, usize)) -> (usize, usize, usize, usize) {
        match self {
            TensorLayout::Hnd => dims,
            TensorLayout::Nhd => (dims.0, dims.2, dims.1, dims.3),
        }
    }

    /// Flat offset of `(b, h, s, d)` in a contiguous buffer with this layout.
    #[inline]
    pub fn offset(
        self,
        (heads, seq, dim): (usize, usize, usize),
        b: usize,
        h: usize,
        s: usize,
        d: usize,
    ) -> usize {
        match self {
            TensorLayout::Hnd => ((b * heads + h) * seq + s) * dim + d,
            TensorLayout::Nhd => ((b * seq + s) * heads + h) * dim + d,
        }
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorLayout::Hnd => f.write_str("HND"),
            TensorLayout::Nhd => f.write_str("NHD"),
        }
    }
}

impl FromStr for TensorLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HND" => Ok(TensorLayout::Hnd),
            "NHD" => Ok(TensorLayout::Nhd),
            other => Err(format!("unknown tensor layout '{other}'")),
        }
    }
}

/// How many sequence positions share one quantization scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One scale per scheduling tile.
    PerBlock,
    /// One scale per warp sub-tile.
    PerWarp,
    /// One scale per interleaved lane subset inside a warp sub-tile.
    PerThread,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::PerBlock => f.write_str("per_block"),
            Granularity::PerWarp => f.write_str("per_warp"),
            Granularity::PerThread => f.write_str("per_thread"),
        }
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "per_block" | "block" => Ok(Granularity::PerBlock),
            "per_warp" | "warp" => Ok(Granularity::PerWarp),
            "per_thread" | "thread" => Ok(Granularity::PerThread),
            other => Err(format!("unknown granularity '{other}'")),
        }
    }
}

/// Precision used to accumulate the P·V product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulatorMode {
    /// Native low-precision accumulation (f16, or the 22-bit fp8 MMA accumulator).
    Narrow,
    /// Full f32 accumulation.
    Wide,
    /// Low-precision accumulation flushed into an f32 buffer once per key tile.
    Hybrid,
}

impl AccumulatorMode {
    /// Whether V mean-centering can be corrected under this mode.
    pub fn permits_smooth_v(self) -> bool {
        !matches!(self, AccumulatorMode::Wide)
    }
}

impl fmt::Display for AccumulatorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccumulatorMode::Narrow => f.write_str("narrow"),
            AccumulatorMode::Wide => f.write_str("wide"),
            AccumulatorMode::Hybrid => f.write_str("hybrid"),
        }
    }
}

impl FromStr for AccumulatorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "narrow" | "fp16" => Ok(AccumulatorMode::Narrow),
            "wide" | "fp32" => Ok(AccumulatorMode::Wide),
            "hybrid" | "fp16+fp32" | "fp32+fp32" => Ok(AccumulatorMode::Hybrid),
            other => Err(format!("unknown accumulator mode '{other}'")),
        }
    }
}

/// Configuration driving fixed-length attention behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Physical axis order of Q, K, V and the output.
    pub layout: TensorLayout,
    /// Apply a causal mask; queries align with the most recent keys.
    pub causal: bool,
    /// Softmax scale; defaults to `1/sqrt(head_dim)` of the unpadded head_dim.
    pub softmax_scale: Option<f32>,
    /// Return the base-e log-sum-exp of each attention row.
    pub return_lse: bool,
    /// Q/K quantization granularity. `None` uses the tier default.
    pub granularity: Option<Granularity>,
    /// P·V accumulator precision. `None` uses the tier default.
    pub accumulator: Option<AccumulatorMode>,
    /// Subtract the per-head K mean over the sequence before quantizing.
    pub smooth_k: bool,
    /// Subtract the per-channel V mean before fp8 quantization.
    pub smooth_v: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            layout: TensorLayout::Hnd,
            causal: false,
            softmax_scale: None,
            return_lse: false,
            granularity: None,
            accumulator: None,
            smooth_k: true,
            smooth_v: false,
        }
    }
}

impl Config {
    /// Defaults with `SAGEATTN_*` environment overrides applied.
    ///
    /// The environment is only read here; a `Config` handed to the entry
    /// points is used as given.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `SAGEATTN_*` environment overrides on top of the current values.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(granularity) = parse_override::<Granularity>(&lookup, "SAGEATTN_GRANULARITY") {
            self.granularity = Some(granularity);
        }
        if let Some(mode) = parse_override::<AccumulatorMode>(&lookup, "SAGEATTN_ACCUMULATOR") {
            self.accumulator = Some(mode);
        }
        if let Some(flag) = parse_flag(&lookup, "SAGEATTN_SMOOTH_K") {
            self.smooth_k = flag;
        }
        if let Some(flag) = parse_flag(&lookup, "SAGEATTN_SMOOTH_V") {
            self.smooth_v = flag;
        }
    }
}

/// Configuration for the variable-length entry point.
///
/// Variable-length attention always quantizes per block and never returns LSE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarlenConfig {
    pub causal: bool,
    pub softmax_scale: Option<f32>,
    /// Center K with the mean over the whole packed batch.
    pub smooth_k: bool,
}

impl Default for VarlenConfig {
    fn default() -> Self {
        Self {
            causal: false,
            softmax_scale: None,
            smooth_k: true,
        }
    }
}

impl VarlenConfig {
    /// Defaults with the `SAGEATTN_SMOOTH_K` override applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides_from(|name| std::env::var(name).ok());
        config
    }

    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(flag) = parse_flag(&lookup, "SAGEATTN_SMOOTH_K") {
            self.smooth_k = flag;
        }
    }
}

fn parse_override<T: FromStr<Err = String>>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let value = lookup(name)?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            log::warn!("ignoring {name}={value}: {err}");
            None
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    let value = lookup(name)?;
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => {
            log::warn!("ignoring {name}={value}: expected a boolean");
            None
        }
    }
}
