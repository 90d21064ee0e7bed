//! Resolution of conventional sub-model entries out of an asset bundle.
//!
//! Bundles ship one file per compiled sub-model plus the tokenizer JSON. The
//! entry names are a packaging convention; this layer is the only place that
//! knows them.

use crate::error::Result;

use super::bundle::AssetBundle;

/// The roles a sub-model file can play in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    /// The transformer stack with `prefill_*` and `decode` signatures.
    PrefillDecode,
    /// Auxiliary graph: RoPE, mask, and cache-update signatures.
    Auxiliary,
    /// Token-embedding lookup graph.
    Embedder,
}

impl ModelRole {
    /// Conventional entry name inside the bundle.
    pub fn entry_name(self) -> &'static str {
        match self {
            ModelRole::PrefillDecode => "prefill_decode.tflite",
            ModelRole::Auxiliary => "aux.tflite",
            ModelRole::Embedder => "embedder.tflite",
        }
    }
}

/// Conventional entry name of the tokenizer definition.
pub const TOKENIZER_ENTRY: &str = "tokenizer.json";

/// Borrowing view over a bundle that resolves sub-model bytes by role.
pub struct ModelResources<'a> {
    bundle: &'a AssetBundle,
}

impl<'a> ModelResources<'a> {
    pub fn new(bundle: &'a AssetBundle) -> Self {
        ModelResources { bundle }
    }

    /// Bytes of the sub-model serving `role`.
    pub fn model_bytes(&self, role: ModelRole) -> Result<&'a [u8]> {
        self.bundle.get_file(role.entry_name())
    }

    /// Bytes of the tokenizer JSON definition.
    pub fn tokenizer_bytes(&self) -> Result<&'a [u8]> {
        self.bundle.get_file(TOKENIZER_ENTRY)
    }

    pub fn bundle(&self) -> &'a AssetBundle {
        self.bundle
    }
}
