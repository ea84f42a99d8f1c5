//! Entry points: validate, select, quantize, launch and correct.
//!
//! Every configuration error surfaces before any quantization work starts:
//! input validation, tier eligibility and kernel availability are all checked
//! while building the [`DispatchPlan`].

use std::fmt;
use std::sync::{Arc, OnceLock};

use candle_core::{Device, Tensor};

use crate::core::config::{Config, VarlenConfig};
use crate::core::errors::{AttentionError, Result};
use crate::core::{Attention, AttentionOutput};
use crate::correct::{correct_lse, finalize_output, lse_correction, raw_lse_tensor};
use crate::device::tier::TRITON_TILES;
use crate::device::Capabilities;
use crate::interop::{AttentionShape, HALF_DTYPES};
use crate::kernels::{
    select_kernel, select_varlen_kernel, FusedAttentionKernel, KernelEntry, KernelLaunch,
    KernelSelection, PvPrecision, QkOperand, ValueOperand, VarlenLaunch,
};
use crate::layout::normalize::validate_packed;
use crate::layout::{pad_head_dim, padded_head_dim, validate_inputs, HostView};
use crate::quant::{
    quantize_int8, quantize_int8_varlen, quantize_value_fp8, ChannelMean, CuSeqlens, Fp8Value,
    GroupPlan,
};

/// Quantized attention bound to one capability table.
pub struct SageAttention {
    capabilities: Arc<Capabilities>,
    first_call: OnceLock<()>,
}

impl fmt::Debug for SageAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SageAttention")
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Everything decided about a fixed-length call before touching the data.
#[derive(Clone)]
pub struct DispatchPlan {
    /// Logical shape with the caller's head dimension.
    pub shape: AttentionShape,
    pub padded_head_dim: usize,
    pub selection: KernelSelection,
    pub sm_scale: f32,
    kernel: Arc<dyn FusedAttentionKernel>,
}

impl fmt::Debug for DispatchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPlan")
            .field("shape", &self.shape)
            .field("padded_head_dim", &self.padded_head_dim)
            .field("selection", &self.selection)
            .field("sm_scale", &self.sm_scale)
            .field("kernel", &self.kernel.name())
            .finish()
    }
}

/// V prepared in the family's P·V precision.
enum PreparedValue {
    Half {
        values: HostView,
        mean: Option<ChannelMean>,
    },
    Fp8(Fp8Value),
}

impl PreparedValue {
    fn operand(&self) -> ValueOperand<'_> {
        match self {
            PreparedValue::Half { values, .. } => ValueOperand::Half(values),
            PreparedValue::Fp8(value) => ValueOperand::Fp8 {
                values: &value.values,
                scales: &value.scales,
            },
        }
    }

    fn mean(&self) -> Option<&ChannelMean> {
        match self {
            PreparedValue::Half { mean, .. } => mean.as_ref(),
            PreparedValue::Fp8(value) => value.mean.as_ref(),
        }
    }
}

impl SageAttention {
    pub fn new(capabilities: Arc<Capabilities>) -> Self {
        Self {
            capabilities,
            first_call: OnceLock::new(),
        }
    }

    /// Bind to the process-wide capability table.
    pub fn for_device(device: &Device) -> Result<Self> {
        Ok(Self::new(Capabilities::global(device)?))
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Validate a fixed-length call and resolve its kernel without running it.
    pub fn plan(&self, q: &Tensor, k: &Tensor, v: &Tensor, config: &Config) -> Result<DispatchPlan> {
        let shape = validate_inputs(q, k, v, config.layout, HALF_DTYPES)?;
        let padded = padded_head_dim(shape.head_dim)?;
        let profile = self.capabilities.profile();
        let selection = select_kernel(
            profile,
            config.granularity,
            config.accumulator,
            config.causal,
            config.smooth_v,
            padded,
        )?;
        let kernel = Arc::clone(self.capabilities.kernel(selection.entry.family)?);
        let sm_scale = config
            .softmax_scale
            .unwrap_or_else(|| default_scale(shape.head_dim));
        Ok(DispatchPlan {
            shape,
            padded_head_dim: padded,
            selection,
            sm_scale,
            kernel,
        })
    }

    fn log_first_call(&self, config: &Config) {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "sage_attention init tier={} layout={} granularity={:?} accumulator={:?} smooth_k={} smooth_v={}",
                self.capabilities.tier(),
                config.layout,
                config.granularity,
                config.accumulator,
                config.smooth_k,
                config.smooth_v
            );
        }
    }

    /// Attention over packed variable-length sequences.
    ///
    /// `q` is `[total_q, q_heads, head_dim]`, `k`/`v` are `[total_kv, kv_heads,
    /// head_dim]`, and the cumulative tables delimit each sequence. Returns
    /// `[total_q, q_heads, head_dim]` in Q's dtype.
    #[allow(clippy::too_many_arguments)]
    pub fn attend_varlen(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cu_seqlens_q: &Tensor,
        cu_seqlens_k: &Tensor,
        max_seqlen_q: usize,
        max_seqlen_k: usize,
        config: &VarlenConfig,
    ) -> Result<Tensor> {
        let shape = validate_packed(q, k, v, HALF_DTYPES)?;
        let cu_q = CuSeqlens::from_tensor(cu_seqlens_q, shape.q_len, max_seqlen_q)?;
        let cu_k = CuSeqlens::from_tensor(cu_seqlens_k, shape.kv_len, max_seqlen_k)?;
        if cu_q.batch() != cu_k.batch() {
            return Err(AttentionError::InvalidSeqlens {
                context: format!(
                    "cu_seqlens_q describes {} sequences, cu_seqlens_k {}",
                    cu_q.batch(),
                    cu_k.batch()
                ),
            });
        }
        let padded = padded_head_dim(shape.head_dim)?;
        let entry = select_varlen_kernel(self.capabilities.profile(), config.causal)?;
        let kernel = self.capabilities.kernel(entry.family)?;
        let sm_scale = config
            .softmax_scale
            .unwrap_or_else(|| default_scale(shape.head_dim));

        static BATCH_MEAN_WARNED: OnceLock<()> = OnceLock::new();
        if config.smooth_k && BATCH_MEAN_WARNED.set(()).is_ok() {
            log::warn!(
                "variable-length smooth_k centers K on the mean over the whole packed batch, not per sequence"
            );
        }
        log::debug!(
            "sage_attention varlen tier={} entry={entry} sequences={} causal={}",
            self.capabilities.tier(),
            cu_q.batch(),
            config.causal
        );

        let q_view = HostView::from_packed(&pad_head_dim(q, padded)?)?;
        let k_view = HostView::from_packed(&pad_head_dim(k, padded)?)?;
        let v_view = HostView::from_packed(&pad_head_dim(v, padded)?)?.round_to_f16();
        let k_mean = config.smooth_k.then(|| ChannelMean::over_sequence(&k_view));

        let (q_quant, k_quant) = rayon::join(
            || quantize_int8_varlen(&q_view, None, &cu_q, TRITON_TILES.block_q),
            || quantize_int8_varlen(&k_view, k_mean.as_ref(), &cu_k, TRITON_TILES.block_k),
        );
        let (q_quant, k_quant) = (q_quant?, k_quant?);

        let launch = VarlenLaunch {
            entry,
            shape: AttentionShape {
                head_dim: padded,
                ..shape
            },
            q: &q_quant,
            k: &k_quant,
            v: &v_view,
            cu_seqlens_q: &cu_q,
            cu_seqlens_k: &cu_k,
            max_seqlen_q,
            max_seqlen_k,
            causal: config.causal,
            sm_scale,
        };
        let mut buffer = vec![0f32; q_view.len()];
        kernel.launch_varlen(&launch, &mut buffer)?;

        finalize_output(
            buffer,
            &[shape.q_len, shape.q_heads, padded],
            shape.head_dim,
            q.dtype(),
            q.device(),
        )
    }
}

impl Attention for SageAttention {
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, config: &Config) -> Result<AttentionOutput> {
        self.log_first_call(config);

        let plan = self.plan(q, k, v, config)?;
        let KernelSelection {
            entry,
            granularity,
            smooth_v,
            tiles,
            ..
        } = plan.selection;
        log::debug!(
            "sage_attention dispatch tier={} entry={entry} granularity={granularity} shape={:?}",
            self.capabilities.tier(),
            plan.shape
        );

        let layout = config.layout;
        let padded = plan.padded_head_dim;
        let q_padded = pad_head_dim(q, padded)?;
        let q_view = HostView::from_tensor(&q_padded, layout)?;
        let k_view = HostView::from_tensor(&pad_head_dim(k, padded)?, layout)?;
        let v_view = HostView::from_tensor(&pad_head_dim(v, padded)?, layout)?;

        let k_mean = config.smooth_k.then(|| ChannelMean::over_sequence(&k_view));
        let correction = match (&k_mean, config.return_lse) {
            (Some(mean), true) => Some(lse_correction(&q_padded, mean, layout)?),
            _ => None,
        };

        let q_plan = GroupPlan::for_query(granularity, tiles);
        let k_plan = GroupPlan::for_key(granularity, tiles);
        let (q_quant, k_quant) = rayon::join(
            || quantize_int8(&q_view, None, q_plan),
            || quantize_int8(&k_view, k_mean.as_ref(), k_plan),
        );
        let (q_quant, k_quant) = (q_quant?, k_quant?);

        let value = prepare_value(
            v_view,
            &entry,
            smooth_v,
            self.capabilities.profile().value_seq_alignment,
        )?;

        let launch = KernelLaunch {
            entry,
            shape: AttentionShape {
                head_dim: padded,
                ..plan.shape
            },
            tiles,
            q: QkOperand {
                values: &q_quant.values,
                scales: &q_quant.scales,
                plan: q_quant.plan,
            },
            k: QkOperand {
                values: &k_quant.values,
                scales: &k_quant.scales,
                plan: k_quant.plan,
            },
            v: value.operand(),
            v_mean: value.mean(),
            causal: config.causal,
            sm_scale: plan.sm_scale,
            return_lse: config.return_lse,
        };
        let mut buffer = vec![0f32; q_view.len()];
        let raw_lse = plan.kernel.launch(&launch, &mut buffer)?;

        let output = finalize_output(
            buffer,
            q_padded.dims(),
            plan.shape.head_dim,
            q.dtype(),
            q.device(),
        )?;
        let lse = if config.return_lse {
            let raw = raw_lse.ok_or_else(|| AttentionError::Backend {
                message: format!("{} returned no LSE for {entry}", plan.kernel.name()),
            })?;
            let raw = raw_lse_tensor(
                raw,
                (plan.shape.batch, plan.shape.q_heads, plan.shape.q_len),
                q.device(),
            )?;
            Some(correct_lse(&raw, correction.as_ref(), plan.sm_scale)?)
        } else {
            None
        };

        Ok(AttentionOutput { output, lse })
    }
}

fn default_scale(head_dim: usize) -> f32 {
    1.0 / (head_dim as f32).sqrt()
}

fn prepare_value(
    view: HostView,
    entry: &KernelEntry,
    smooth_v: bool,
    seq_alignment: Option<usize>,
) -> Result<PreparedValue> {
    match entry.family.pv_precision() {
        PvPrecision::F16 => {
            let mean = smooth_v.then(|| ChannelMean::over_sequence(&view));
            let values = match &mean {
                Some(mean) => mean.center(view),
                None => view,
            };
            Ok(PreparedValue::Half {
                values: values.round_to_f16(),
                mean,
            })
        }
        PvPrecision::F8 => Ok(PreparedValue::Fp8(quantize_value_fp8(
            &view,
            smooth_v,
            seq_alignment,
        )?)),
    }
}

/// Process-wide instance, built from the device of the first call.
///
/// The tier is a property of the process (see [`Capabilities::global`]), so
/// later calls reuse this instance whatever device they pass.
fn global_for(device: &Device) -> Result<&'static SageAttention> {
    static GLOBAL: OnceLock<SageAttention> = OnceLock::new();
    if let Some(existing) = GLOBAL.get() {
        return Ok(existing);
    }
    let attention = SageAttention::for_device(device)?;
    Ok(GLOBAL.get_or_init(|| attention))
}

/// Fixed-length quantized attention on the process-wide capability table.
///
/// The table is detected on the first call and shared by every device
/// afterwards; build a [`SageAttention`] per device to use different tiers.
pub fn attention(q: &Tensor, k: &Tensor, v: &Tensor, config: &Config) -> Result<AttentionOutput> {
    global_for(q.device())?.attend(q, k, v, config)
}

/// Variable-length quantized attention on the process-wide capability table.
///
/// Shares the instance used by [`attention`].
#[allow(clippy::too_many_arguments)]
pub fn attention_varlen(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    cu_seqlens_q: &Tensor,
    cu_seqlens_k: &Tensor,
    max_seqlen_q: usize,
    max_seqlen_k: usize,
    config: &VarlenConfig,
) -> Result<Tensor> {
    global_for(q.device())?.attend_varlen(
        q,
        k,
        v,
        cu_seqlens_q,
        cu_seqlens_k,
        max_seqlen_q,
        max_seqlen_k,
        config,
    )
}
