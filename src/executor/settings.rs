//! Executor configuration.

use std::path::PathBuf;

use serde::Deserialize;

use crate::graph::Accelerator;

/// CPU backend tuning knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct CpuConfig {
    /// Number of threads the compiled graph may use.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
}

fn default_num_threads() -> usize {
    4
}

impl Default for CpuConfig {
    fn default() -> Self {
        CpuConfig {
            num_threads: default_num_threads(),
        }
    }
}

/// GPU backend tuning knobs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GpuConfig {
    /// Prefer fp16 activations when the device supports them.
    #[serde(default)]
    pub allow_fp16: bool,
}

/// NPU backend tuning knobs. Fully ahead-of-time compiled models need none
/// today; the struct is the extension point.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NpuConfig {}

/// Per-backend configuration, tagged by the accelerator it applies to.
#[derive(Debug, Clone, Deserialize)]
pub enum BackendConfig {
    Cpu(CpuConfig),
    Gpu(GpuConfig),
    Npu(NpuConfig),
}

impl BackendConfig {
    pub fn accelerator(&self) -> Accelerator {
        match self {
            BackendConfig::Cpu(_) => Accelerator::Cpu,
            BackendConfig::Gpu(_) => Accelerator::Gpu,
            BackendConfig::Npu(_) => Accelerator::Npu,
        }
    }
}

/// Settings governing one executor instance.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Accelerator the transformer subgraph is compiled for. The auxiliary
    /// and embedder subgraphs always run on CPU.
    pub backend: Accelerator,

    /// Backend-specific tuning.
    pub backend_config: BackendConfig,

    /// Maximum number of tokens the KV cache can hold.
    pub max_num_tokens: usize,

    /// Directory for compiled-model caching, when the backend supports it.
    pub cache_dir: Option<PathBuf>,

    /// KV-cache tensors whose element type differs between the prefill and
    /// decode signatures. The executor allocates fresh decode-side buffers
    /// for these instead of aliasing the prefill buffers. Model-specific;
    /// empty for models without the quirk.
    pub decode_incompatible_cache_tensors: Vec<String>,
}

impl ExecutorSettings {
    /// Default settings for the given accelerator.
    pub fn new(backend: Accelerator) -> Self {
        let backend_config = match backend {
            Accelerator::Cpu => BackendConfig::Cpu(CpuConfig::default()),
            Accelerator::Gpu => BackendConfig::Gpu(GpuConfig::default()),
            Accelerator::Npu => BackendConfig::Npu(NpuConfig::default()),
        };
        ExecutorSettings {
            backend,
            backend_config,
            max_num_tokens: 4096,
            cache_dir: None,
            decode_incompatible_cache_tensors: vec![
                "kv_cache_k_25".to_string(),
                "kv_cache_v_25".to_string(),
            ],
        }
    }
}
