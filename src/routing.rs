//! Gating collaborators: top-k expert selection over router logits.
//!
//! The fused MoE layer consumes routing weights and expert ids produced
//! here (or by any caller honoring the same contract): weights are
//! non-negative f32, optionally renormalized to sum to 1 across the k
//! picks, ids are u32 in `0..num_experts`.

use candle_core::{DType, Result, Tensor};

/// Softmax + top-k selection over gating logits.
///
/// # Arguments
/// * `hidden_states` - `[num_tokens, hidden_size]`, used only to validate
///   the token count against the gating output
/// * `gating_output` - Raw router logits `[num_tokens, num_experts]`
/// * `top_k` - Experts selected per token
/// * `renormalize` - Rescale the selected weights to sum to 1 per token
///
/// # Returns
/// * `(weights: f32 [num_tokens, top_k], ids: u32 [num_tokens, top_k])`
pub fn fused_topk(
    hidden_states: &Tensor,
    gating_output: &Tensor,
    top_k: usize,
    renormalize: bool,
) -> Result<(Tensor, Tensor)> {
    let (num_tokens, num_experts) = gating_output.dims2()?;
    if hidden_states.dim(0)? != num_tokens {
        candle_core::bail!(
            "number of tokens mismatch: hidden_states has {}, gating output has {}",
            hidden_states.dim(0)?,
            num_tokens
        );
    }
    if top_k > num_experts {
        candle_core::bail!(
            "top_k ({}) cannot be greater than num_experts ({})",
            top_k,
            num_experts
        );
    }

    let probs = candle_nn::ops::softmax(&gating_output.to_dtype(DType::F32)?, 1)?;

    // Descending sort, keep the first k columns.
    let sorted_indices = probs.arg_sort_last_dim(false)?;
    let topk_ids = sorted_indices.narrow(1, 0, top_k)?.contiguous()?;
    let topk_weights = probs.gather(&topk_ids, 1)?;

    let topk_weights = if renormalize {
        let sum = topk_weights.sum_keepdim(1)?;
        topk_weights.broadcast_div(&sum)?
    } else {
        topk_weights
    };

    Ok((topk_weights, topk_ids.to_dtype(DType::U32)?))
}

/// Grouped top-k selection: candidate experts are restricted to the
/// `topk_group` highest-scoring expert groups before the final top-k.
///
/// `num_experts` must divide evenly into `num_expert_group` groups; a
/// group's score is the maximum expert probability inside it.
pub fn grouped_topk(
    hidden_states: &Tensor,
    gating_output: &Tensor,
    top_k: usize,
    renormalize: bool,
    num_expert_group: usize,
    topk_group: usize,
) -> Result<(Tensor, Tensor)> {
    let (num_tokens, num_experts) = gating_output.dims2()?;
    if hidden_states.dim(0)? != num_tokens {
        candle_core::bail!(
            "number of tokens mismatch: hidden_states has {}, gating output has {}",
            hidden_states.dim(0)?,
            num_tokens
        );
    }
    if num_expert_group == 0 || num_experts % num_expert_group != 0 {
        candle_core::bail!(
            "{} experts do not divide into {} groups",
            num_experts,
            num_expert_group
        );
    }
    if topk_group > num_expert_group {
        candle_core::bail!(
            "topk_group ({}) cannot exceed num_expert_group ({})",
            topk_group,
            num_expert_group
        );
    }
    let group_width = num_experts / num_expert_group;

    let probs = candle_nn::ops::softmax(&gating_output.to_dtype(DType::F32)?, 1)?;
    let scores: Vec<f32> = probs.flatten_all()?.to_vec1()?;

    let mut weights = Vec::with_capacity(num_tokens * top_k);
    let mut ids = Vec::with_capacity(num_tokens * top_k);
    for token in 0..num_tokens {
        let row = &scores[token * num_experts..(token + 1) * num_experts];

        // Score each group by its best expert, keep the topk_group groups.
        let mut group_order: Vec<usize> = (0..num_expert_group).collect();
        group_order.sort_by(|&a, &b| {
            let score = |g: usize| {
                row[g * group_width..(g + 1) * group_width]
                    .iter()
                    .fold(f32::NEG_INFINITY, |m, &v| m.max(v))
            };
            score(b).partial_cmp(&score(a)).unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut allowed = vec![false; num_experts];
        for &g in group_order.iter().take(topk_group) {
            allowed[g * group_width..(g + 1) * group_width].fill(true);
        }

        // Final top-k over the surviving experts.
        let mut expert_order: Vec<usize> = (0..num_experts).collect();
        expert_order.sort_by(|&a, &b| {
            let masked = |e: usize| if allowed[e] { row[e] } else { 0.0 };
            masked(b)
                .partial_cmp(&masked(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let picked = &expert_order[..top_k];
        let mut picked_weights: Vec<f32> =
            picked.iter().map(|&e| if allowed[e] { row[e] } else { 0.0 }).collect();
        if renormalize {
            let sum: f32 = picked_weights.iter().sum();
            if sum > 0.0 {
                for w in picked_weights.iter_mut() {
                    *w /= sum;
                }
            }
        }
        weights.extend(picked_weights);
        ids.extend(picked.iter().map(|&e| e as u32));
    }

    let device = gating_output.device();
    Ok((
        Tensor::from_vec(weights, (num_tokens, top_k), device)?,
        Tensor::from_vec(ids, (num_tokens, top_k), device)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn approx_eq(a: f32, b: f32, eps: f32) -> bool {
        (a - b).abs() < eps
    }

    #[test]
    fn test_fused_topk_shapes_and_renormalize() {
        let device = Device::Cpu;
        let hidden = Tensor::zeros((4, 16), DType::F32, &device).unwrap();
        let logits = Tensor::randn(0f32, 1.0, (4, 8), &device).unwrap();

        let (weights, ids) = fused_topk(&hidden, &logits, 2, true).unwrap();
        assert_eq!(weights.dims(), &[4, 2]);
        assert_eq!(ids.dims(), &[4, 2]);

        let weights_vec: Vec<f32> = weights.flatten_all().unwrap().to_vec1().unwrap();
        for row in weights_vec.chunks(2) {
            let sum: f32 = row.iter().sum();
            assert!(approx_eq(sum, 1.0, 1e-5), "weights should sum to 1, got {}", sum);
            assert!(row.iter().all(|&w| w >= 0.0));
        }
        let ids_vec: Vec<u32> = ids.flatten_all().unwrap().to_vec1().unwrap();
        assert!(ids_vec.iter().all(|&e| e < 8));
    }

    #[test]
    fn test_fused_topk_ordering() {
        let device = Device::Cpu;
        let hidden = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        let logits = Tensor::new(&[[0.5f32, -1.0, 2.0, 0.1]], &device).unwrap();

        let (weights, ids) = fused_topk(&hidden, &logits, 2, true).unwrap();
        let ids_vec: Vec<u32> = ids.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(ids_vec, vec![2, 0]);

        let weights_vec: Vec<f32> = weights.flatten_all().unwrap().to_vec1().unwrap();
        assert!(weights_vec[0] >= weights_vec[1]);
    }

    #[test]
    fn test_fused_topk_no_renormalize() {
        let device = Device::Cpu;
        let hidden = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        let logits = Tensor::randn(0f32, 1.0, (2, 6), &device).unwrap();

        let (weights, _) = fused_topk(&hidden, &logits, 2, false).unwrap();
        let weights_vec: Vec<f32> = weights.flatten_all().unwrap().to_vec1().unwrap();
        for row in weights_vec.chunks(2) {
            let sum: f32 = row.iter().sum();
            assert!(sum <= 1.0 + 1e-5);
        }
    }

    #[test]
    fn test_fused_topk_token_count_mismatch() {
        let device = Device::Cpu;
        let hidden = Tensor::zeros((3, 4), DType::F32, &device).unwrap();
        let logits = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        assert!(fused_topk(&hidden, &logits, 2, true).is_err());
    }

    #[test]
    fn test_grouped_topk_restricts_to_best_groups() {
        let device = Device::Cpu;
        let hidden = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        // 8 experts in 4 groups of 2. Expert 5 carries the single highest
        // logit; with topk_group=1, group 2 (experts 4,5) wins and both
        // picks must come from it.
        let logits = Tensor::new(
            &[[1.0f32, 2.5, 2.0, 0.0, 2.9f32, 3.0, 0.0, 1.0]],
            &device,
        )
        .unwrap();

        let (_, ids) = grouped_topk(&hidden, &logits, 2, true, 4, 1).unwrap();
        let mut ids_vec: Vec<u32> = ids.flatten_all().unwrap().to_vec1().unwrap();
        ids_vec.sort_unstable();
        assert_eq!(ids_vec, vec![4, 5]);
    }

    #[test]
    fn test_grouped_topk_renormalizes() {
        let device = Device::Cpu;
        let hidden = Tensor::zeros((3, 4), DType::F32, &device).unwrap();
        let logits = Tensor::randn(0f32, 1.0, (3, 8), &device).unwrap();

        let (weights, ids) = grouped_topk(&hidden, &logits, 2, true, 2, 1).unwrap();
        assert_eq!(weights.dims(), &[3, 2]);
        let weights_vec: Vec<f32> = weights.flatten_all().unwrap().to_vec1().unwrap();
        for row in weights_vec.chunks(2) {
            let sum: f32 = row.iter().sum();
            assert!(approx_eq(sum, 1.0, 1e-5));
        }
        let ids_vec: Vec<u32> = ids.flatten_all().unwrap().to_vec1().unwrap();
        assert!(ids_vec.iter().all(|&e| e < 8));
    }

    #[test]
    fn test_grouped_topk_bad_grouping() {
        let device = Device::Cpu;
        let hidden = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        let logits = Tensor::zeros((1, 8), DType::F32, &device).unwrap();
        assert!(grouped_topk(&hidden, &logits, 2, true, 3, 1).is_err());
        assert!(grouped_topk(&hidden, &logits, 2, true, 2, 3).is_err());
    }
}
