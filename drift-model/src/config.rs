//! Tunables for read/write replication

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Diagnostic categories that can be enabled at runtime. Enabled categories
/// emit per-operation detail through `tracing::debug!`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceCategory {
    /// Inbound and outbound protocol events.
    Net,
    /// Individual index records in and out.
    Idx,
    /// Puller and walker file operations.
    File,
    /// Need-set computation.
    Need,
}

/// Configuration for read/write processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Apply deletion tombstones to local disk.
    pub delete: bool,
    /// Maximum number of files pulled concurrently.
    pub parallel_files: usize,
    /// Maximum number of concurrent block requests per file.
    pub parallel_requests: usize,
    /// Diagnostic categories to enable.
    #[serde(default)]
    pub trace: HashSet<TraceCategory>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            delete: false,
            parallel_files: 4,
            parallel_requests: 8,
            trace: HashSet::new(),
        }
    }
}
