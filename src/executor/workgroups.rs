//! Prefill work-group tiling.
//!
//! A model ships one prefill signature per supported chunk length. An
//! arbitrary prompt length is decomposed into a sequence of chunks, each
//! dispatched to the signature whose declared length can hold it.

use std::collections::BTreeMap;

use crate::error::{EdgeLmError, Result};

/// Supported prefill chunk lengths mapped to their signature names, kept
/// sorted so callers can walk from the largest length down.
#[derive(Debug, Clone, Default)]
pub struct PrefillSignatureMap {
    lengths: BTreeMap<usize, String>,
}

impl PrefillSignatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, length: usize, signature: &str) {
        self.lengths.insert(length, signature.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// `(length, signature)` pairs from largest to smallest length.
    pub fn iter_descending(&self) -> impl Iterator<Item = (usize, &str)> {
        self.lengths.iter().rev().map(|(l, s)| (*l, s.as_str()))
    }
}

/// One prefill dispatch: the signature to invoke and how many of the input
/// tokens it consumes (at most the signature's declared length).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefillWorkGroup {
    pub signature: String,
    pub num_tokens: usize,
}

/// Decompose `input_length` tokens into work groups.
///
/// Strategy: dispatch the largest-length signature until the remainder is
/// smaller than its length, then finish the remainder with the smallest
/// signature that still covers it in one call.
pub fn optimized_prefill_work_groups(
    signatures: &PrefillSignatureMap,
    input_length: usize,
) -> Result<Vec<PrefillWorkGroup>> {
    if signatures.is_empty() {
        return Err(EdgeLmError::InvalidArgument(
            "no prefill signatures registered".into(),
        ));
    }

    let mut work_groups = Vec::new();
    let lengths: Vec<(usize, &str)> = signatures.iter_descending().collect();
    let (max_len, max_sig) = lengths[0];

    let mut remaining = input_length;
    while remaining >= max_len {
        work_groups.push(PrefillWorkGroup {
            signature: max_sig.to_string(),
            num_tokens: max_len,
        });
        remaining -= max_len;
    }

    if remaining > 0 {
        for (idx, (_, signature)) in lengths.iter().enumerate() {
            // Skip this signature if the next smaller one still covers the
            // remainder in a single call.
            if let Some((next_len, _)) = lengths.get(idx + 1) {
                if *next_len >= remaining {
                    continue;
                }
            }
            work_groups.push(PrefillWorkGroup {
                signature: signature.to_string(),
                num_tokens: remaining,
            });
            break;
        }
    }

    Ok(work_groups)
}
