//! Expert-layer orchestration.
//!
//! Sequences the two grouped GEMMs of one MoE feed-forward layer: the
//! up-projection with the activation epilogue, then the down-projection
//! with the routing-weight epilogue, followed by the top-k reduction per
//! token. Tokens are processed in fixed-size chunks to bound the
//! intermediate buffers, and the kernel tile configuration is re-selected
//! per chunk from the tuning cache.

use std::path::PathBuf;

use candle_core::{DType, Device, Result, Tensor};
use tracing::debug;

use crate::align::align_block_size_flat;
use crate::config::{MoeRuntimeOptions, FUSED_MOE_CHUNK_SIZE};
use crate::kernel::{invoke_grouped_gemm, ActivationOperand, GroupedGemmArgs, WeightOperand};
use crate::quantize::scaled_int8_quant;
use crate::routing::{fused_topk, grouped_topk};
use crate::schedule::SchedulePolicy;
use crate::tuning::{TableKey, TuningCache};

/// Quantization configuration for the expert weights.
///
/// Quantized weight tensors are stored as `DType::U8` carrying
/// two's-complement int8 values (Candle has no signed 8-bit dtype).
#[derive(Debug, Clone)]
pub enum MoeQuantConfig {
    /// Full-precision weights and activations.
    None,
    /// 8-bit weights and 8-bit activations. `w1_scale` / `w2_scale` hold
    /// one dequantization scale per expert, shape `[E]`. Activation scales
    /// are per-tensor; `None` selects dynamic quantization.
    Int8W8A8 {
        w1_scale: Tensor,
        w2_scale: Tensor,
        a1_scale: Option<f32>,
        a2_scale: Option<f32>,
    },
    /// 8-bit weights with full-precision activations. Scales are per
    /// `(expert, output channel)`: `w1_scale` is `[E, N]`, `w2_scale` is
    /// `[E, hidden]`.
    Int8W8A16 { w1_scale: Tensor, w2_scale: Tensor },
}

impl MoeQuantConfig {
    /// Data-path selector used in tuning-table file names.
    fn dtype_selector(&self, input_dtype: DType) -> Option<String> {
        match self {
            MoeQuantConfig::Int8W8A8 { .. } => Some("int8_w8a8".to_string()),
            MoeQuantConfig::Int8W8A16 { .. } => Some("int8_w8a16".to_string()),
            // Plain f32 inputs borrow the f16/bf16 tables' heuristics but
            // keep a distinct selector.
            MoeQuantConfig::None => match input_dtype {
                DType::F32 => Some("float32".to_string()),
                _ => None,
            },
        }
    }

    fn is_quantized(&self) -> bool {
        !matches!(self, MoeQuantConfig::None)
    }
}

/// Extracted expert weights, ready for the kernel.
enum WeightData {
    Dense(Vec<f32>),
    Quantized(Vec<i8>),
}

impl WeightData {
    fn from_tensor(w: &Tensor, quantized: bool) -> Result<Self> {
        if quantized {
            if w.dtype() != DType::U8 {
                candle_core::bail!(
                    "quantized expert weights must be U8 (int8 bit pattern), got {:?}",
                    w.dtype()
                );
            }
            let raw: Vec<u8> = w.flatten_all()?.to_vec1()?;
            Ok(WeightData::Quantized(raw.into_iter().map(|v| v as i8).collect()))
        } else {
            let raw: Vec<f32> = w.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
            Ok(WeightData::Dense(raw))
        }
    }

    fn operand<'a>(&'a self, scales: Option<(&'a [f32], bool)>) -> WeightOperand<'a> {
        match (self, scales) {
            (WeightData::Dense(data), _) => WeightOperand::Dense(data),
            (WeightData::Quantized(data), Some((scales, true))) => {
                WeightOperand::QuantizedPerChannel { data, scales }
            }
            (WeightData::Quantized(data), Some((scales, false))) => {
                WeightOperand::QuantizedPerExpert { data, scales }
            }
            (WeightData::Quantized(_), None) => {
                unreachable!("quantized weights always carry scales")
            }
        }
    }
}

/// Sum the `top_k` expert contributions of each token.
///
/// `contributions` is `[num_tokens * top_k, width]` row-major; `out` is
/// `[num_tokens, width]` and is overwritten.
pub fn moe_sum(contributions: &[f32], num_tokens: usize, top_k: usize, width: usize, out: &mut [f32]) {
    for token in 0..num_tokens {
        let out_row = &mut out[token * width..(token + 1) * width];
        out_row.fill(0.0);
        for slot in 0..top_k {
            let row = &contributions
                [(token * top_k + slot) * width..(token * top_k + slot + 1) * width];
            for (o, &v) in out_row.iter_mut().zip(row) {
                *o += v;
            }
        }
    }
}

/// Fused MoE expert layer.
///
/// Owns the runtime options and the tuning cache. `forward` runs the full
/// routed feed-forward pass; `forward_from_logits` additionally performs
/// the gating top-k.
pub struct FusedExpertLayer {
    options: MoeRuntimeOptions,
    tuning: TuningCache,
    chunk_size: usize,
}

impl FusedExpertLayer {
    /// Create a layer with the given runtime options. `tuning_dir`, when
    /// set, points at the directory of tuned configuration files.
    pub fn new(options: MoeRuntimeOptions, tuning_dir: Option<PathBuf>) -> Self {
        Self {
            options,
            tuning: TuningCache::new(tuning_dir),
            chunk_size: FUSED_MOE_CHUNK_SIZE,
        }
    }

    /// Override the token chunk size. Affects buffer sizing only, never
    /// results.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        self.chunk_size = chunk_size;
        self
    }

    pub fn options(&self) -> &MoeRuntimeOptions {
        &self.options
    }

    /// The owned tuning cache, for explicit invalidation or reload.
    pub fn tuning_cache_mut(&mut self) -> &mut TuningCache {
        &mut self.tuning
    }

    /// Gating plus expert forward in one call.
    ///
    /// `expert_groups` restricts candidates to the top-scoring expert
    /// groups before the final top-k (`(num_expert_group, topk_group)`).
    #[allow(clippy::too_many_arguments)]
    pub fn forward_from_logits(
        &mut self,
        hidden_states: &Tensor,
        w1: &Tensor,
        w2: &Tensor,
        gating_output: &Tensor,
        top_k: usize,
        renormalize: bool,
        expert_groups: Option<(usize, usize)>,
        quant: &MoeQuantConfig,
        inplace: bool,
    ) -> Result<Tensor> {
        if gating_output.dim(1)? != w1.dim(0)? {
            candle_core::bail!(
                "number of experts mismatch: gating output has {}, weights have {}",
                gating_output.dim(1)?,
                w1.dim(0)?
            );
        }
        let (topk_weights, topk_ids) = match expert_groups {
            Some((num_expert_group, topk_group)) => grouped_topk(
                hidden_states,
                gating_output,
                top_k,
                renormalize,
                num_expert_group,
                topk_group,
            )?,
            None => fused_topk(hidden_states, gating_output, top_k, renormalize)?,
        };
        self.forward(hidden_states, w1, w2, &topk_weights, &topk_ids, quant, inplace)
    }

    /// Run the routed expert feed-forward pass.
    ///
    /// # Arguments
    /// * `hidden_states` - `[num_tokens, hidden_size]`, contiguous
    /// * `w1` - Up-projection weights `[E, N, hidden_size (+K padding)]`
    /// * `w2` - Down-projection weights `[E, hidden_size, N (+K padding)]`
    /// * `topk_weights` - Routing weights `[num_tokens, top_k]`
    /// * `topk_ids` - Routed expert ids `[num_tokens, top_k]`
    /// * `quant` - Weight quantization configuration
    /// * `inplace` - Reserved: Candle tensors are immutable, so the output
    ///   buffer is always fresh
    ///
    /// # Returns
    /// Output tensor with the shape and dtype of `hidden_states`.
    pub fn forward(
        &mut self,
        hidden_states: &Tensor,
        w1: &Tensor,
        w2: &Tensor,
        topk_weights: &Tensor,
        topk_ids: &Tensor,
        quant: &MoeQuantConfig,
        inplace: bool,
    ) -> Result<Tensor> {
        let _ = inplace;
        let k_pad = self.options.weight_k_padding();

        // Contract checks, all before any kernel work.
        let (num_tokens, hidden_size) = hidden_states.dims2()?;
        let (num_experts, n1, w1_k_storage) = w1.dims3()?;
        let (w2_experts, w2_out, w2_k_storage) = w2.dims3()?;
        if w2_experts != num_experts {
            candle_core::bail!(
                "expert count mismatch between w1 ({}) and w2 ({})",
                num_experts,
                w2_experts
            );
        }
        if w1_k_storage < k_pad || hidden_size != w1_k_storage - k_pad {
            candle_core::bail!(
                "hidden size mismatch: input has {}, w1 expects {}",
                hidden_size,
                w1_k_storage.saturating_sub(k_pad)
            );
        }
        if w2_k_storage < k_pad || w2_k_storage - k_pad != n1 {
            candle_core::bail!(
                "intermediate size mismatch: w1 produces {}, w2 expects {}",
                n1,
                w2_k_storage.saturating_sub(k_pad)
            );
        }
        if w2_out != hidden_size {
            candle_core::bail!(
                "w2 output width {} does not match hidden size {}",
                w2_out,
                hidden_size
            );
        }
        if topk_weights.dims() != topk_ids.dims() {
            candle_core::bail!(
                "topk shape mismatch: weights {:?}, ids {:?}",
                topk_weights.dims(),
                topk_ids.dims()
            );
        }
        let (weight_tokens, top_k) = topk_ids.dims2()?;
        if weight_tokens != num_tokens {
            candle_core::bail!(
                "routing covers {} tokens, input has {}",
                weight_tokens,
                num_tokens
            );
        }
        for (name, tensor) in [
            ("hidden_states", hidden_states),
            ("w1", w1),
            ("w2", w2),
            ("topk_weights", topk_weights),
        ] {
            if !tensor.is_contiguous() {
                candle_core::bail!("{} must be contiguous", name);
            }
        }
        if !matches!(hidden_states.dtype(), DType::F32 | DType::F16 | DType::BF16) {
            candle_core::bail!(
                "unsupported hidden_states dtype {:?}",
                hidden_states.dtype()
            );
        }

        let ids_vec: Vec<u32> = topk_ids.to_dtype(DType::U32)?.flatten_all()?.to_vec1()?;
        if let Some(&bad) = ids_vec.iter().find(|&&e| e as usize >= num_experts) {
            candle_core::bail!("expert id {} out of range for {} experts", bad, num_experts);
        }

        if num_tokens == 0 {
            return hidden_states.zeros_like();
        }

        let weights_vec: Vec<f32> = topk_weights
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1()?;
        let x: Vec<f32> = hidden_states
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1()?;

        let w1_data = WeightData::from_tensor(w1, quant.is_quantized())?;
        let w2_data = WeightData::from_tensor(w2, quant.is_quantized())?;
        let scales = ExtractedScales::new(quant, num_experts, n1, hidden_size)?;

        let policy = if self.options.persistent_scheduling {
            SchedulePolicy::Persistent {
                num_units: persistent_unit_count(),
            }
        } else {
            SchedulePolicy::Direct
        };
        let table_key = TableKey {
            num_experts,
            intermediate_width: n1,
            device_name: device_name(hidden_states.device()).to_string(),
            dtype: quant.dtype_selector(hidden_states.dtype()),
        };

        let mut out = vec![0f32; num_tokens * hidden_size];
        let mut chunk_start = 0;
        while chunk_start < num_tokens {
            let chunk_end = (chunk_start + self.chunk_size).min(num_tokens);
            let m = chunk_end - chunk_start;
            let config = self.tuning.select(&table_key, m);
            debug!(
                tokens = m,
                block_size_m = config.block_size_m,
                persistent = self.options.persistent_scheduling,
                "dispatching fused MoE chunk"
            );

            let chunk_ids = &ids_vec[chunk_start * top_k..chunk_end * top_k];
            let chunk_weights = &weights_vec[chunk_start * top_k..chunk_end * top_k];
            let chunk_x = &x[chunk_start * hidden_size..chunk_end * hidden_size];

            let aligned = align_block_size_flat(chunk_ids, num_experts, config.block_size_m)?;

            // GEMM #1: up-projection, activation epilogue.
            let mut intermediate = vec![0f32; m * top_k * n1];
            let (a1_q, a1_scale) = match quant {
                MoeQuantConfig::Int8W8A8 { a1_scale, .. } => {
                    let (q, s) = scaled_int8_quant(chunk_x, *a1_scale);
                    (Some(q), s)
                }
                _ => (None, 1.0),
            };
            let a1 = match &a1_q {
                Some(q) => ActivationOperand::Quantized {
                    data: q,
                    scale: a1_scale,
                },
                None => ActivationOperand::Dense(chunk_x),
            };
            invoke_grouped_gemm(
                a1,
                w1_data.operand(scales.w1()),
                &mut intermediate,
                &GroupedGemmArgs {
                    aligned: &aligned,
                    topk_weights: chunk_weights,
                    n: n1,
                    k: hidden_size,
                    a_row_stride: hidden_size,
                    b_k_storage: w1_k_storage,
                    top_k,
                    apply_routing_weight: false,
                    apply_activation: true,
                    config,
                    policy,
                },
            )?;

            // Barrier between the GEMMs is implicit in sequential host
            // execution; the second consumes the first's full output.

            // GEMM #2: down-projection, routing-weight epilogue. The
            // intermediate buffer is viewed as flat rows, one per slot, so
            // the gather runs with a replication factor of 1.
            let mut contributions = vec![0f32; m * top_k * hidden_size];
            let (a2_q, a2_scale) = match quant {
                MoeQuantConfig::Int8W8A8 { a2_scale, .. } => {
                    let (q, s) = scaled_int8_quant(&intermediate, *a2_scale);
                    (Some(q), s)
                }
                _ => (None, 1.0),
            };
            let a2 = match &a2_q {
                Some(q) => ActivationOperand::Quantized {
                    data: q,
                    scale: a2_scale,
                },
                None => ActivationOperand::Dense(&intermediate),
            };
            invoke_grouped_gemm(
                a2,
                w2_data.operand(scales.w2()),
                &mut contributions,
                &GroupedGemmArgs {
                    aligned: &aligned,
                    topk_weights: chunk_weights,
                    n: hidden_size,
                    k: n1,
                    a_row_stride: n1,
                    b_k_storage: w2_k_storage,
                    top_k: 1,
                    apply_routing_weight: true,
                    apply_activation: false,
                    config,
                    policy,
                },
            )?;

            moe_sum(
                &contributions,
                m,
                top_k,
                hidden_size,
                &mut out[chunk_start * hidden_size..chunk_end * hidden_size],
            );
            chunk_start = chunk_end;
        }

        Tensor::from_vec(out, (num_tokens, hidden_size), hidden_states.device())?
            .to_dtype(hidden_states.dtype())
    }
}

/// One-call fused MoE forward: gating plus expert layer under default
/// runtime options and no tuning directory.
///
/// Callers that run many forward passes should hold a [`FusedExpertLayer`]
/// instead, so tuned configurations stay cached across calls.
#[allow(clippy::too_many_arguments)]
pub fn fused_moe(
    hidden_states: &Tensor,
    w1: &Tensor,
    w2: &Tensor,
    gating_output: &Tensor,
    top_k: usize,
    renormalize: bool,
    expert_groups: Option<(usize, usize)>,
    quant: &MoeQuantConfig,
) -> Result<Tensor> {
    FusedExpertLayer::new(MoeRuntimeOptions::default(), None).forward_from_logits(
        hidden_states,
        w1,
        w2,
        gating_output,
        top_k,
        renormalize,
        expert_groups,
        quant,
        false,
    )
}

/// Dequantization scales extracted from a [`MoeQuantConfig`].
struct ExtractedScales {
    w1: Option<(Vec<f32>, bool)>,
    w2: Option<(Vec<f32>, bool)>,
}

impl ExtractedScales {
    fn new(
        quant: &MoeQuantConfig,
        num_experts: usize,
        n1: usize,
        hidden_size: usize,
    ) -> Result<Self> {
        let extract = |t: &Tensor, expected: usize, name: &str| -> Result<Vec<f32>> {
            if t.elem_count() != expected {
                candle_core::bail!(
                    "{} holds {} scales, expected {}",
                    name,
                    t.elem_count(),
                    expected
                );
            }
            t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()
        };
        match quant {
            MoeQuantConfig::None => Ok(Self { w1: None, w2: None }),
            MoeQuantConfig::Int8W8A8 {
                w1_scale, w2_scale, ..
            } => Ok(Self {
                w1: Some((extract(w1_scale, num_experts, "w1_scale")?, false)),
                w2: Some((extract(w2_scale, num_experts, "w2_scale")?, false)),
            }),
            MoeQuantConfig::Int8W8A16 { w1_scale, w2_scale } => Ok(Self {
                w1: Some((extract(w1_scale, num_experts * n1, "w1_scale")?, true)),
                w2: Some((extract(w2_scale, num_experts * hidden_size, "w2_scale")?, true)),
            }),
        }
    }

    fn w1(&self) -> Option<(&[f32], bool)> {
        self.w1.as_ref().map(|(s, per_channel)| (s.as_slice(), *per_channel))
    }

    fn w2(&self) -> Option<(&[f32], bool)> {
        self.w2.as_ref().map(|(s, per_channel)| (s.as_slice(), *per_channel))
    }
}

fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

/// Persistent-wave width: roughly twice the host's compute units, the same
/// oversubscription the device variant uses against its SM count.
fn persistent_unit_count() -> usize {
    2 * std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
