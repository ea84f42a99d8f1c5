//! Accuracy and host throughput of the quantized path on every tier.
//! Run with: `cargo bench -p sage-attention --bench quantize`

#[path = "common/mod.rs"]
mod util;

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use sage_attention::layout::HostView;
use sage_attention::quant::{quantize_int8, ChannelMean, GroupPlan};
use sage_attention::{
    Attention, Capabilities, Config, ExactAttention, HardwareTier, SageAttention, TensorLayout,
};
use util::{format_markdown_table, format_rate, update_results};

#[derive(Clone, Copy)]
struct Case {
    batch: usize,
    heads: usize,
    seq_len: usize,
    head_dim: usize,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("quantize bench failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let device = Device::Cpu;
    let cases = [
        Case {
            batch: 1,
            heads: 4,
            seq_len: 256,
            head_dim: 64,
        },
        Case {
            batch: 1,
            heads: 4,
            seq_len: 1024,
            head_dim: 128,
        },
        Case {
            batch: 2,
            heads: 8,
            seq_len: 512,
            head_dim: 64,
        },
    ];

    let mut accuracy = Vec::new();
    let mut throughput = Vec::new();
    let reference = ExactAttention::new();

    for case in cases {
        let (q, k, v) = build_inputs(&device, &case)?;
        for causal in [false, true] {
            let config = Config {
                causal,
                return_lse: true,
                ..Config::default()
            };
            let exact = reference.attend(&q, &k, &v, &config)?;
            let exact_out = exact.output.to_dtype(DType::F32)?;
            let exact_lse = exact.lse.ok_or("reference returned no lse")?;

            for tier in HardwareTier::ALL {
                let sage = SageAttention::new(Arc::new(Capabilities::new(tier).with_builtin_kernels()));
                let out = sage.attend(&q, &k, &v, &config)?;
                let diff = out.output.to_dtype(DType::F32)?.sub(&exact_out)?.abs()?;
                let max_abs = diff.max_all()?.to_vec0::<f32>()?;
                let rel_l1 = diff.sum_all()?.to_vec0::<f32>()?
                    / exact_out.abs()?.sum_all()?.to_vec0::<f32>()?;
                let lse_diff = match out.lse {
                    Some(lse) => lse.sub(&exact_lse)?.abs()?.max_all()?.to_vec0::<f32>()?,
                    None => f32::NAN,
                };
                accuracy.push(vec![
                    describe_case(&case),
                    causal.to_string(),
                    tier.to_string(),
                    format!("{max_abs:.2e}"),
                    format!("{rel_l1:.2e}"),
                    format!("{lse_diff:.2e}"),
                ]);
            }
        }

        let iterations = 5;
        let tokens = (case.batch * case.heads * case.seq_len) as f64;
        let k_view = HostView::from_tensor(&k, TensorLayout::Hnd)?;
        let mean = ChannelMean::over_sequence(&k_view);
        let profile = HardwareTier::Sm89.profile();
        let plan = GroupPlan::for_key(profile.default_granularity, profile.tiles);
        let start = Instant::now();
        for _ in 0..iterations {
            let _ = quantize_int8(&k_view, Some(&mean), plan)?;
        }
        let quant_rate = iterations as f64 * tokens / start.elapsed().as_secs_f64();

        let sage = SageAttention::new(Arc::new(
            Capabilities::new(HardwareTier::Sm89).with_builtin_kernels(),
        ));
        let attend_rate = measure(&sage, &q, &k, &v, iterations)? * tokens;
        let exact_rate = measure(&reference, &q, &k, &v, iterations)? * tokens;
        throughput.push(vec![
            describe_case(&case),
            format_rate(quant_rate),
            format_rate(attend_rate),
            format_rate(exact_rate),
        ]);
    }

    let accuracy = format_markdown_table(
        &["shape (b,h,s,d)", "causal", "tier", "max abs", "rel L1", "max |Δlse|"],
        &accuracy,
    );
    println!("\nAccuracy summary:\n{accuracy}");
    update_results("Accuracy", &accuracy)?;

    let throughput = format_markdown_table(
        &["shape (b,h,s,d)", "int8 K tokens/sec", "sm89 emulated tokens/sec", "exact tokens/sec"],
        &throughput,
    );
    println!("\nThroughput summary:\n{throughput}");
    update_results("Throughput", &throughput)?;
    Ok(())
}

fn measure<A: Attention>(
    backend: &A,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    iterations: usize,
) -> Result<f64, Box<dyn Error>> {
    let config = Config::default();
    let _ = backend.attend(q, k, v, &config)?;
    let start = Instant::now();
    for _ in 0..iterations {
        let _ = backend.attend(q, k, v, &config)?;
    }
    Ok(iterations as f64 / start.elapsed().as_secs_f64())
}

fn describe_case(case: &Case) -> String {
    format!(
        "({},{},{},{})",
        case.batch, case.heads, case.seq_len, case.head_dim
    )
}

fn build_inputs(device: &Device, case: &Case) -> Result<(Tensor, Tensor, Tensor), Box<dyn Error>> {
    let shape = (case.batch, case.heads, case.seq_len, case.head_dim);
    let q = Tensor::randn(0.0f32, 1.0, shape, device)?.to_dtype(DType::F16)?;
    // Offset K so smoothing has a shared component to remove.
    let k = (Tensor::randn(0.0f32, 1.0, shape, device)? + 0.5)?.to_dtype(DType::F16)?;
    let v = Tensor::randn(0.0f32, 1.0, shape, device)?.to_dtype(DType::F16)?;
    Ok((q, k, v))
}
