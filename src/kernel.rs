//! Grouped GEMM kernel with fused epilogues.
//!
//! Executes one block matrix multiply per scheduled `(row_block, col_block)`
//! tile: input rows are gathered through the aligned token table, multiplied
//! against the tile's expert weight block, accumulated in a wide accumulator
//! over fixed-size K sub-steps, then run through the epilogue chain
//! (dequantize, routing weight, cast, activation) before a masked scatter
//! back by token slot.
//!
//! Operand layout follows the device convention: `A` is `[rows, K]`
//! row-major, `B` is `[E, N, K]` row-major (possibly with padded K storage),
//! `C` is `[num_valid_tokens, N]` row-major indexed by flat token slot.

use candle_core::Result;

use crate::align::AlignedTokens;
use crate::config::KernelConfig;
use crate::schedule::{SchedulePolicy, TileGrid, TileScheduler};

/// Gathered input operand of one grouped GEMM.
#[derive(Debug, Clone, Copy)]
pub enum ActivationOperand<'a> {
    /// Full-precision rows.
    Dense(&'a [f32]),
    /// Per-tensor quantized rows; `scale` restores magnitude after the full
    /// K reduction.
    Quantized { data: &'a [i8], scale: f32 },
}

impl ActivationOperand<'_> {
    #[inline]
    fn load(&self, idx: usize) -> f64 {
        match self {
            ActivationOperand::Dense(data) => data[idx] as f64,
            ActivationOperand::Quantized { data, .. } => data[idx] as f64,
        }
    }

    fn scale(&self) -> f32 {
        match self {
            ActivationOperand::Dense(_) => 1.0,
            ActivationOperand::Quantized { scale, .. } => *scale,
        }
    }
}

/// Stacked expert weight operand of one grouped GEMM.
#[derive(Debug, Clone, Copy)]
pub enum WeightOperand<'a> {
    /// Full-precision weights.
    Dense(&'a [f32]),
    /// 8-bit weights with one dequantization scale per expert. Pairs with a
    /// quantized activation operand.
    QuantizedPerExpert { data: &'a [i8], scales: &'a [f32] },
    /// 8-bit weights with one dequantization scale per `(expert, output
    /// channel)`, laid out `[E, N]`. Pairs with dense activations.
    QuantizedPerChannel { data: &'a [i8], scales: &'a [f32] },
}

impl WeightOperand<'_> {
    #[inline]
    fn load(&self, idx: usize) -> f64 {
        match self {
            WeightOperand::Dense(data) => data[idx] as f64,
            WeightOperand::QuantizedPerExpert { data, .. } => data[idx] as f64,
            WeightOperand::QuantizedPerChannel { data, .. } => data[idx] as f64,
        }
    }
}

/// Invocation parameters shared by every tile of one grouped GEMM call.
#[derive(Debug, Clone, Copy)]
pub struct GroupedGemmArgs<'a> {
    /// Block-aligned token layout; its block size must match
    /// `config.block_size_m`.
    pub aligned: &'a AlignedTokens,
    /// Routing weights indexed by flat token slot, read only when
    /// `apply_routing_weight` is set.
    pub topk_weights: &'a [f32],
    /// Output width (true N, excluding any weight padding).
    pub n: usize,
    /// Reduction depth (true K, excluding any weight padding).
    pub k: usize,
    /// Row stride of the activation operand.
    pub a_row_stride: usize,
    /// K-dimension storage width of the weight operand (`k` plus padding).
    pub b_k_storage: usize,
    /// Replication factor of the gather: a slot's input row is
    /// `slot / top_k`.
    pub top_k: usize,
    /// Multiply each row by its routing weight before storing.
    pub apply_routing_weight: bool,
    /// Apply the activation to the tile before storing.
    pub apply_activation: bool,
    pub config: KernelConfig,
    pub policy: SchedulePolicy,
}

/// GELU, tanh approximation. The fixed activation epilogue.
#[inline]
pub fn gelu_tanh(x: f32) -> f32 {
    0.5 * x * (1.0 + (0.7978845608 * (x + 0.044715 * x * x * x)).tanh())
}

/// Run one grouped GEMM over the aligned layout, writing `c` in place.
///
/// `c` is `[num_valid_tokens, n]` row-major; each scheduled tile writes a
/// disjoint slice of it, so execution units never race. Tiles whose row
/// block lies past the post-padding boundary perform no memory traffic.
pub fn invoke_grouped_gemm(
    a: ActivationOperand,
    b: WeightOperand,
    c: &mut [f32],
    args: &GroupedGemmArgs,
) -> Result<()> {
    let aligned = args.aligned;
    if aligned.block_size != args.config.block_size_m {
        candle_core::bail!(
            "aligned block size {} does not match kernel BLOCK_SIZE_M {}",
            aligned.block_size,
            args.config.block_size_m
        );
    }
    if matches!(a, ActivationOperand::Quantized { .. })
        && !matches!(b, WeightOperand::QuantizedPerExpert { .. })
    {
        candle_core::bail!("quantized activations require per-expert quantized weights");
    }
    if args.apply_routing_weight && args.topk_weights.len() < aligned.num_valid_tokens {
        candle_core::bail!(
            "routing weights cover {} slots, need {}",
            args.topk_weights.len(),
            aligned.num_valid_tokens
        );
    }
    if c.len() < aligned.num_valid_tokens * args.n {
        candle_core::bail!(
            "output buffer holds {} values, need {}",
            c.len(),
            aligned.num_valid_tokens * args.n
        );
    }

    let grid = TileGrid {
        num_row_blocks: aligned.max_row_blocks(),
        num_col_blocks: args.n.div_ceil(args.config.block_size_n),
        group_size: args.config.group_size_m.max(1),
    };
    let scheduler = TileScheduler::new(grid, args.policy);
    let populated = aligned.populated_blocks();

    // Units run one after another on the host; each owns a disjoint set of
    // output tiles, and the order of execution does not affect the result.
    for unit in 0..scheduler.unit_count() {
        for (pid_m, pid_n) in scheduler.tiles_for_unit(unit, populated) {
            execute_tile(pid_m, pid_n, a, b, c, args);
        }
    }
    Ok(())
}

/// Compute and store one output tile.
fn execute_tile(
    pid_m: usize,
    pid_n: usize,
    a: ActivationOperand,
    b: WeightOperand,
    c: &mut [f32],
    args: &GroupedGemmArgs,
) {
    let aligned = args.aligned;
    let bm = args.config.block_size_m;
    let bn = args.config.block_size_n;
    let bk = args.config.block_size_k;

    // Rows past the post-padding boundary carry no tokens; exit before any
    // table or operand access.
    if pid_m * bm >= aligned.num_tokens_post_padded {
        return;
    }
    let expert = aligned.block_expert_ids[pid_m];
    if expert < 0 {
        return;
    }
    let expert = expert as usize;
    let block_token_num = aligned.block_token_counts[pid_m] as usize;
    let offs_token = &aligned.sorted_token_ids[pid_m * bm..pid_m * bm + bm];

    let stride_be = args.n * args.b_k_storage;
    let even_k = args.k % bk == 0;

    // Wide accumulator over the full K reduction.
    let mut acc = vec![0f64; bm * bn];
    let mut k0 = 0;
    while k0 < args.k {
        // Full-width fast path when K divides evenly; otherwise the tail
        // sub-step is truncated, which is the masked load with zero fill.
        let kw = if even_k { bk } else { bk.min(args.k - k0) };
        for (i, &slot) in offs_token.iter().enumerate() {
            if i >= block_token_num {
                continue;
            }
            let a_base = (slot as usize / args.top_k) * args.a_row_stride + k0;
            for j in 0..bn {
                let b_col = (pid_n * bn + j) % args.n;
                let b_base = expert * stride_be + b_col * args.b_k_storage + k0;
                let mut sum = 0f64;
                for kk in 0..kw {
                    sum += a.load(a_base + kk) * b.load(b_base + kk);
                }
                acc[i * bn + j] += sum;
            }
        }
        k0 += bk;
    }

    // Dequantize once after the full reduction, one scale multiply per tile.
    match b {
        WeightOperand::Dense(_) => {}
        WeightOperand::QuantizedPerExpert { scales, .. } => {
            let scale = (a.scale() * scales[expert]) as f64;
            for v in acc.iter_mut() {
                *v *= scale;
            }
        }
        WeightOperand::QuantizedPerChannel { scales, .. } => {
            for j in 0..bn {
                let b_col = (pid_n * bn + j) % args.n;
                let scale = scales[expert * args.n + b_col] as f64;
                for i in 0..bm {
                    acc[i * bn + j] *= scale;
                }
            }
        }
    }

    if args.apply_routing_weight {
        for (i, &slot) in offs_token.iter().enumerate() {
            if i >= block_token_num {
                continue;
            }
            let weight = args.topk_weights[slot as usize] as f64;
            for j in 0..bn {
                acc[i * bn + j] *= weight;
            }
        }
    }

    // Cast to storage precision, activate, and scatter by token slot.
    // Rows past the block's valid count and columns past N are masked out.
    for (i, &slot) in offs_token.iter().enumerate() {
        if i >= block_token_num {
            continue;
        }
        let c_base = slot as usize * args.n;
        for j in 0..bn {
            let col = pid_n * bn + j;
            if col >= args.n {
                break;
            }
            let mut value = acc[i * bn + j] as f32;
            if args.apply_activation {
                value = gelu_tanh(value);
            }
            c[c_base + col] = value;
        }
    }
}
