//! Block alignment of routed tokens.
//!
//! Converts the ragged per-token expert assignment produced by gating into a
//! block-aligned layout the grouped GEMM can consume: token slots sorted by
//! expert, each expert's run padded to a multiple of the block size so that
//! no GEMM block ever mixes two experts.

use candle_core::{Result, Tensor};

/// Block-aligned token layout for one grouped GEMM invocation.
///
/// `sorted_token_ids` holds flat token slots (`token_index * top_k + k`),
/// grouped contiguously by assigned expert. Entries that do not correspond
/// to a real slot hold the sentinel value `num_valid_tokens`, which is
/// outside the valid slot range. The table is allocated at its worst-case
/// length (`num_valid_tokens + num_experts * (block_size - 1)`); only the
/// first `num_tokens_post_padded` entries are ever scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedTokens {
    /// Expert-sorted token slots, sentinel-padded per expert run.
    pub sorted_token_ids: Vec<i32>,
    /// Owning expert per `block_size` chunk of `sorted_token_ids`;
    /// -1 for chunks past the populated region.
    pub block_expert_ids: Vec<i32>,
    /// Number of real (non-sentinel) entries per chunk.
    pub block_token_counts: Vec<i32>,
    /// Populated blocks times `block_size`. Blocks at or past this point
    /// carry no work and must not be scheduled.
    pub num_tokens_post_padded: usize,
    /// Real slot count, `num_tokens * top_k`. Doubles as the sentinel value.
    pub num_valid_tokens: usize,
    /// Alignment block size the tables were built for.
    pub block_size: usize,
}

impl AlignedTokens {
    /// Blocks that actually hold tokens.
    pub fn populated_blocks(&self) -> usize {
        self.num_tokens_post_padded / self.block_size
    }

    /// Row blocks in the worst-case table, populated or not. This is the
    /// row extent of the GEMM launch grid.
    pub fn max_row_blocks(&self) -> usize {
        self.sorted_token_ids.len().div_ceil(self.block_size)
    }

    /// Sentinel written into padding entries of `sorted_token_ids`.
    pub fn sentinel(&self) -> i32 {
        self.num_valid_tokens as i32
    }
}

/// Align routed tokens to block boundaries.
///
/// # Arguments
/// * `topk_ids` - Expert indices per token, shape `[num_tokens, top_k]`, U32
/// * `num_experts` - Total number of experts
/// * `block_size` - Row-block size of the grouped GEMM
///
/// Any expert index `>= num_experts` is a caller contract violation and
/// fails eagerly. An empty assignment is valid and yields zero populated
/// blocks.
pub fn align_block_size(
    topk_ids: &Tensor,
    num_experts: usize,
    block_size: usize,
) -> Result<AlignedTokens> {
    let flat: Vec<u32> = topk_ids.flatten_all()?.to_vec1()?;
    align_block_size_flat(&flat, num_experts, block_size)
}

/// Slice-level alignment over the flattened `(token, expert)` stream.
///
/// The stream is ordered `token_index * top_k + k`; that order is preserved
/// within each expert's run (stable scatter), so re-running on the same
/// input yields a bit-identical table.
pub fn align_block_size_flat(
    topk_ids: &[u32],
    num_experts: usize,
    block_size: usize,
) -> Result<AlignedTokens> {
    let numel = topk_ids.len();

    // Count slots per expert, rejecting out-of-range ids before any layout.
    let mut expert_counts = vec![0usize; num_experts];
    for &expert_id in topk_ids {
        let expert_idx = expert_id as usize;
        if expert_idx >= num_experts {
            candle_core::bail!(
                "expert id {} out of range for {} experts",
                expert_id,
                num_experts
            );
        }
        expert_counts[expert_idx] += 1;
    }

    // Prefix offsets over block-rounded expert run lengths.
    let mut cumsum = vec![0usize; num_experts + 1];
    for (i, &count) in expert_counts.iter().enumerate() {
        cumsum[i + 1] = cumsum[i] + count.div_ceil(block_size) * block_size;
    }
    let num_tokens_post_padded = cumsum[num_experts];

    let max_num_tokens_padded = numel + num_experts * (block_size - 1);
    let max_num_blocks = max_num_tokens_padded.div_ceil(block_size);

    // Sentinel-fill, then scatter each slot into its expert's region in
    // stream order.
    let mut sorted_token_ids = vec![numel as i32; max_num_tokens_padded];
    let mut expert_offsets = cumsum[..num_experts].to_vec();
    for (slot, &expert_id) in topk_ids.iter().enumerate() {
        let expert_idx = expert_id as usize;
        sorted_token_ids[expert_offsets[expert_idx]] = slot as i32;
        expert_offsets[expert_idx] += 1;
    }

    // Per-block owning expert and real-entry count.
    let mut block_expert_ids = vec![-1i32; max_num_blocks];
    let mut block_token_counts = vec![0i32; max_num_blocks];
    for expert_idx in 0..num_experts {
        let start_block = cumsum[expert_idx] / block_size;
        let end_block = cumsum[expert_idx + 1] / block_size;
        let mut remaining = expert_counts[expert_idx];
        for block in start_block..end_block {
            block_expert_ids[block] = expert_idx as i32;
            block_token_counts[block] = remaining.min(block_size) as i32;
            remaining = remaining.saturating_sub(block_size);
        }
    }

    Ok(AlignedTokens {
        sorted_token_ids,
        block_expert_ids,
        block_token_counts,
        num_tokens_post_padded,
        num_valid_tokens: numel,
        block_size,
    })
}
