//! Configuration for the fused MoE layer and its grouped GEMM kernel.

use serde::{Deserialize, Serialize};

/// Number of tokens processed per orchestrator chunk.
///
/// Bounds the size of the intermediate activation buffers: each chunk
/// allocates `chunk * top_k * intermediate_size` floats, independent of the
/// total batch size.
pub const FUSED_MOE_CHUNK_SIZE: usize = 65536;

/// Padding columns appended to the K dimension of expert weights when
/// [`MoeRuntimeOptions::pad_weight_k_dimension`] is set.
pub const WEIGHT_K_PADDING: usize = 128;

/// Tile-size configuration for one grouped GEMM invocation.
///
/// Field names match the on-disk tuning-table format
/// (`BLOCK_SIZE_M`, `BLOCK_SIZE_N`, `BLOCK_SIZE_K`, `GROUP_SIZE_M`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct KernelConfig {
    /// Rows (tokens) per output tile. Also the alignment block size.
    pub block_size_m: usize,
    /// Columns (output features) per output tile.
    pub block_size_n: usize,
    /// Reduction-dimension step per accumulation sub-step.
    pub block_size_k: usize,
    /// Row-block group size for the swizzled tile ordering.
    pub group_size_m: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            block_size_m: 64,
            block_size_n: 128,
            block_size_k: 128,
            group_size_m: 8,
        }
    }
}

impl KernelConfig {
    /// Configuration for small batches: one row group, narrow row blocks.
    pub fn small_batch() -> Self {
        Self {
            block_size_m: 16,
            block_size_n: 128,
            block_size_k: 128,
            group_size_m: 1,
        }
    }

    /// Static heuristic used when no tuned entry matches the shape.
    ///
    /// Small row blocks win when the batch is at most the expert count,
    /// since most blocks then hold a handful of tokens for one expert.
    pub fn heuristic(num_tokens: usize, num_experts: usize) -> Self {
        if num_tokens <= num_experts {
            Self::small_batch()
        } else {
            Self::default()
        }
    }
}

/// Runtime options for the fused MoE layer, fixed at construction time.
///
/// Explicit per-instance configuration; there are no process-wide toggles.
#[derive(Debug, Clone, Copy)]
pub struct MoeRuntimeOptions {
    /// Use the persistent tile scheduler: a fixed wave of execution units
    /// each processes a strided sequence of tiles, instead of one unit per
    /// tile.
    pub persistent_scheduling: bool,
    /// Expert weights carry [`WEIGHT_K_PADDING`] extra columns along K;
    /// the effective reduction depth excludes them.
    pub pad_weight_k_dimension: bool,
    /// Device kernel-launch hint that routes weight-tile loads around local
    /// data share. No effect on the CPU execution path.
    pub lds_bypass: bool,
}

impl Default for MoeRuntimeOptions {
    fn default() -> Self {
        Self {
            persistent_scheduling: false,
            pad_weight_k_dimension: false,
            lds_bypass: true,
        }
    }
}

impl MoeRuntimeOptions {
    /// Effective K padding implied by these options.
    pub fn weight_k_padding(&self) -> usize {
        if self.pad_weight_k_dimension {
            WEIGHT_K_PADDING
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert_eq!(config.block_size_m, 64);
        assert_eq!(config.group_size_m, 8);
    }

    #[test]
    fn test_heuristic_small_batch() {
        // Batch no larger than the expert count selects the small config.
        let config = KernelConfig::heuristic(8, 8);
        assert_eq!(config.block_size_m, 16);
        assert_eq!(config.group_size_m, 1);

        let config = KernelConfig::heuristic(9, 8);
        assert_eq!(config.block_size_m, 64);
    }

    #[test]
    fn test_config_json_field_names() {
        let json = r#"{"BLOCK_SIZE_M":32,"BLOCK_SIZE_N":64,"BLOCK_SIZE_K":64,"GROUP_SIZE_M":4}"#;
        let config: KernelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.block_size_m, 32);
        assert_eq!(config.block_size_n, 64);
        assert_eq!(config.block_size_k, 64);
        assert_eq!(config.group_size_m, 4);
    }

    #[test]
    fn test_weight_k_padding() {
        let options = MoeRuntimeOptions::default();
        assert_eq!(options.weight_k_padding(), 0);

        let options = MoeRuntimeOptions {
            pad_weight_k_dimension: true,
            ..Default::default()
        };
        assert_eq!(options.weight_k_padding(), WEIGHT_K_PADDING);
    }
}
