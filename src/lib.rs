//! Fused Mixture-of-Experts (MoE) feed-forward layer.
//!
//! Runs the routed expert feed-forward of sparse MoE models as two grouped
//! GEMMs over a block-aligned token layout, with the activation and
//! routing-weight multiplies fused into the kernel epilogues.
//!
//! ## Submodules
//!
//! - [`align`]: Block-aligned token layout sorted by routed expert
//! - [`schedule`]: Tile ordering and work distribution (direct / persistent)
//! - [`kernel`]: Grouped GEMM with fused epilogues
//! - [`layer`]: Expert-layer orchestration, chunking, top-k reduction
//! - [`routing`]: Top-k and grouped top-k gating
//! - [`quantize`]: Int8 activation quantization for the 8-bit weight paths
//! - [`tuning`]: On-disk tile-configuration tables with per-shape caching
//! - [`config`]: Kernel tile configuration and runtime options

pub mod align;
pub mod config;
pub mod kernel;
pub mod layer;
pub mod quantize;
pub mod routing;
pub mod schedule;
pub mod tuning;

pub use align::{align_block_size, align_block_size_flat, AlignedTokens};
pub use config::{KernelConfig, MoeRuntimeOptions, FUSED_MOE_CHUNK_SIZE, WEIGHT_K_PADDING};
pub use kernel::{invoke_grouped_gemm, ActivationOperand, GroupedGemmArgs, WeightOperand};
pub use layer::{fused_moe, moe_sum, FusedExpertLayer, MoeQuantConfig};
pub use quantize::scaled_int8_quant;
pub use routing::{fused_topk, grouped_topk};
pub use schedule::{populated_tile_count, SchedulePolicy, TileGrid, TileScheduler};
pub use tuning::{config_file_name, read_table, TableKey, TuningCache, TuningError};
