//! Error types for the edgelm crate.

use thiserror::Error;

/// Top-level error type for all runtime operations.
///
/// The variants mirror the error kinds the runtime distinguishes at its API
/// boundaries; callers match on the variant, never on message text.
#[derive(Error, Debug)]
pub enum EdgeLmError {
    /// Malformed caller input: bad shapes, batch size != 1, empty prefill.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown asset-bundle entry or unknown signature name.
    #[error("not found: {0}")]
    NotFound(String),

    /// The decoded token ids end mid-way through a multi-byte codepoint;
    /// the caller should feed more tokens and retry.
    #[error("incomplete BPE sequence: {0}")]
    IncompleteBpe(String),

    /// Invariant violation or subgraph execution failure. Fatal to the
    /// current operation.
    #[error("internal error: {0}")]
    Internal(String),

    /// Corrupt bundle or model data.
    #[error("data loss: {0}")]
    DataLoss(String),

    /// Capability the current component does not provide (e.g. a tokenizer
    /// without BOS/EOS ids).
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EdgeLmError {
    /// Whether this error is the recoverable incomplete-BPE signal.
    ///
    /// Streaming callers use this to retain the undecodable tail and retry
    /// once more tokens arrive.
    pub fn is_incomplete_bpe(&self) -> bool {
        matches!(self, EdgeLmError::IncompleteBpe(_))
    }
}

pub type Result<T> = std::result::Result<T, EdgeLmError>;
