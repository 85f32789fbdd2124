//! On-disk tuning tables for kernel tile configurations.
//!
//! A tuning table maps an irregular grid of batch sizes to kernel
//! configurations for one `(expert_count, intermediate_width, device,
//! dtype)` shape, stored as JSON named
//! `E={E},N={N},device_name={name}[,dtype={dtype}].json`. Lookups pick the
//! entry whose batch size is nearest the observed one; a missing or
//! unreadable table falls back to the static heuristic.
//!
//! Tables are cached per shape inside [`TuningCache`], owned by the layer
//! that uses it, with explicit invalidation instead of process-lifetime
//! memoization.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::KernelConfig;

#[derive(Error, Debug)]
pub enum TuningError {
    #[error("failed to read tuning table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse tuning table {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid batch size key {key:?} in tuning table {path}")]
    InvalidBatchKey { key: String, path: PathBuf },
}

/// Shape key identifying one tuning table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableKey {
    pub num_experts: usize,
    /// N dimension of the down-projection weights.
    pub intermediate_width: usize,
    pub device_name: String,
    /// Data-path selector, e.g. "int8_w8a8"; `None` for the plain f16/bf16
    /// path.
    pub dtype: Option<String>,
}

/// File name a table for `key` is stored under.
pub fn config_file_name(key: &TableKey) -> String {
    let dtype_selector = match &key.dtype {
        Some(dtype) => format!(",dtype={}", dtype),
        None => String::new(),
    };
    format!(
        "E={},N={},device_name={}{}.json",
        key.num_experts, key.intermediate_width, key.device_name, dtype_selector
    )
}

/// Parse one tuning table file: a JSON object mapping batch-size strings to
/// kernel configurations.
pub fn read_table(path: &Path) -> Result<BTreeMap<usize, KernelConfig>, TuningError> {
    let raw = fs::read_to_string(path).map_err(|source| TuningError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: BTreeMap<String, KernelConfig> =
        serde_json::from_str(&raw).map_err(|source| TuningError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    let mut table = BTreeMap::new();
    for (key, config) in parsed {
        let batch = key
            .parse::<usize>()
            .map_err(|_| TuningError::InvalidBatchKey {
                key,
                path: path.to_path_buf(),
            })?;
        table.insert(batch, config);
    }
    Ok(table)
}

/// Per-shape cache over on-disk tuning tables.
pub struct TuningCache {
    config_dir: Option<PathBuf>,
    tables: HashMap<TableKey, Option<BTreeMap<usize, KernelConfig>>>,
}

impl TuningCache {
    /// `config_dir` is the directory holding the table files; `None`
    /// disables lookups entirely (every selection uses the heuristic).
    pub fn new(config_dir: Option<PathBuf>) -> Self {
        Self {
            config_dir,
            tables: HashMap::new(),
        }
    }

    /// Select the configuration for `num_tokens` under the shape `key`.
    ///
    /// Nearest batch size wins, ties resolved toward the smaller batch
    /// size (ascending key order); a configuration miss is non-fatal and
    /// falls back to [`KernelConfig::heuristic`].
    pub fn select(&mut self, key: &TableKey, num_tokens: usize) -> KernelConfig {
        if let Some(table) = self.table(key) {
            let mut best: Option<(usize, KernelConfig)> = None;
            for (&batch, &config) in table {
                let distance = batch.abs_diff(num_tokens);
                if best.map_or(true, |(d, _)| distance < d) {
                    best = Some((distance, config));
                }
            }
            if let Some((_, config)) = best {
                return config;
            }
        }
        KernelConfig::heuristic(num_tokens, key.num_experts)
    }

    /// Drop every cached table; subsequent lookups re-read from disk.
    pub fn invalidate(&mut self) {
        self.tables.clear();
    }

    /// Re-read the table for one shape from disk, replacing the cached
    /// entry.
    pub fn reload(&mut self, key: &TableKey) {
        self.tables.remove(key);
        self.table(key);
    }

    fn table(&mut self, key: &TableKey) -> Option<&BTreeMap<usize, KernelConfig>> {
        if !self.tables.contains_key(key) {
            let loaded = self.load(key);
            self.tables.insert(key.clone(), loaded);
        }
        self.tables.get(key).and_then(|t| t.as_ref())
    }

    fn load(&self, key: &TableKey) -> Option<BTreeMap<usize, KernelConfig>> {
        let dir = self.config_dir.as_ref()?;
        let path = dir.join(config_file_name(key));
        if !path.exists() {
            info!(
                path = %path.display(),
                "no tuned MoE configuration found, using heuristic default"
            );
            return None;
        }
        match read_table(&path) {
            Ok(table) => {
                info!(path = %path.display(), "using tuned MoE configuration");
                Some(table)
            }
            Err(err) => {
                warn!(%err, "ignoring unreadable tuning table");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn key() -> TableKey {
        TableKey {
            num_experts: 8,
            intermediate_width: 1024,
            device_name: "cpu".to_string(),
            dtype: None,
        }
    }

    fn write_table(dir: &Path, key: &TableKey, body: &str) {
        let mut file = File::create(dir.join(config_file_name(key))).unwrap();
        file.write_all(body.as_bytes()).unwrap();
    }

    const TABLE: &str = r#"{
        "1":  {"BLOCK_SIZE_M": 16, "BLOCK_SIZE_N": 64,  "BLOCK_SIZE_K": 64,  "GROUP_SIZE_M": 1},
        "64": {"BLOCK_SIZE_M": 32, "BLOCK_SIZE_N": 128, "BLOCK_SIZE_K": 128, "GROUP_SIZE_M": 4},
        "256":{"BLOCK_SIZE_M": 64, "BLOCK_SIZE_N": 128, "BLOCK_SIZE_K": 128, "GROUP_SIZE_M": 8}
    }"#;

    #[test]
    fn test_config_file_name() {
        let name = config_file_name(&key());
        assert_eq!(name, "E=8,N=1024,device_name=cpu.json");

        let mut with_dtype = key();
        with_dtype.dtype = Some("int8_w8a8".to_string());
        assert_eq!(
            config_file_name(&with_dtype),
            "E=8,N=1024,device_name=cpu,dtype=int8_w8a8.json"
        );
    }

    #[test]
    fn test_nearest_batch_lookup() {
        let dir = tempfile::tempdir().unwrap();
        write_table(dir.path(), &key(), TABLE);
        let mut cache = TuningCache::new(Some(dir.path().to_path_buf()));

        assert_eq!(cache.select(&key(), 2).block_size_m, 16);
        assert_eq!(cache.select(&key(), 60).block_size_m, 32);
        assert_eq!(cache.select(&key(), 100_000).block_size_m, 64);
        // 160 is equidistant from 64 and 256; the smaller batch wins.
        assert_eq!(cache.select(&key(), 160).block_size_m, 32);
    }

    #[test]
    fn test_missing_table_falls_back_to_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = TuningCache::new(Some(dir.path().to_path_buf()));

        assert_eq!(cache.select(&key(), 4), KernelConfig::small_batch());
        assert_eq!(cache.select(&key(), 512), KernelConfig::default());
    }

    #[test]
    fn test_no_config_dir_uses_heuristic() {
        let mut cache = TuningCache::new(None);
        assert_eq!(cache.select(&key(), 512), KernelConfig::default());
    }

    #[test]
    fn test_unreadable_table_is_non_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_table(dir.path(), &key(), "not json");
        let mut cache = TuningCache::new(Some(dir.path().to_path_buf()));
        assert_eq!(cache.select(&key(), 512), KernelConfig::default());
    }

    #[test]
    fn test_invalid_batch_key_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_table(
            dir.path(),
            &key(),
            r#"{"abc": {"BLOCK_SIZE_M": 16, "BLOCK_SIZE_N": 64, "BLOCK_SIZE_K": 64, "GROUP_SIZE_M": 1}}"#,
        );
        let err = read_table(&dir.path().join(config_file_name(&key()))).unwrap_err();
        assert!(matches!(err, TuningError::InvalidBatchKey { .. }));
    }

    #[test]
    fn test_invalidate_and_reload_pick_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = TuningCache::new(Some(dir.path().to_path_buf()));

        // First lookup caches the miss.
        assert_eq!(cache.select(&key(), 512), KernelConfig::default());

        // A table written afterwards is invisible until invalidation.
        write_table(dir.path(), &key(), TABLE);
        assert_eq!(cache.select(&key(), 512), KernelConfig::default());

        cache.invalidate();
        assert_eq!(cache.select(&key(), 512).block_size_m, 64);

        // Reload replaces a cached table in place.
        write_table(
            dir.path(),
            &key(),
            r#"{"512": {"BLOCK_SIZE_M": 128, "BLOCK_SIZE_N": 128, "BLOCK_SIZE_K": 64, "GROUP_SIZE_M": 8}}"#,
        );
        cache.reload(&key());
        assert_eq!(cache.select(&key(), 512).block_size_m, 128);
    }
}
