//! Text ↔ token-id conversion.
//!
//! The runtime treats the tokenizer as a narrow contract: encode text to ids,
//! decode ids back to text, and — crucially for streaming — *refuse* to
//! decode a sequence that ends mid-way through a multi-byte codepoint. BPE
//! vocabularies with byte fallback can split one Unicode codepoint across
//! several tokens; decoding only the first part yields the replacement
//! character U+FFFD at the end of the string, which is the tokenizer's signal
//! to the session to accumulate more tokens before emitting a chunk.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::asset::ModelResources;
use crate::error::{EdgeLmError, Result};

/// Replacement character (U+FFFD) that terminates an undecodable tail.
const REPLACEMENT_CHARACTER: char = '\u{FFFD}';

/// Sentinel marking "no token id".
pub const NO_TOKEN_ID: i32 = -1;

/// Text ↔ token-id contract required by the session layer.
pub trait Tokenizer: Send {
    /// Encode text into a sequence of token ids.
    fn text_to_token_ids(&self, text: &str) -> Result<Vec<i32>>;

    /// Decode a sequence of token ids into text.
    ///
    /// Returns [`EdgeLmError::IncompleteBpe`] when the decoded UTF-8 ends
    /// with U+FFFD, i.e. the ids stop part-way through a codepoint.
    fn token_ids_to_text(&self, token_ids: &[i32]) -> Result<String>;

    /// BOS token id, if the vocabulary defines one.
    fn bos_id(&self) -> Result<i32> {
        Err(EdgeLmError::Unimplemented(
            "BOS id is not available for this tokenizer".into(),
        ))
    }

    /// EOS token id, if the vocabulary defines one.
    fn eos_id(&self) -> Result<i32> {
        Err(EdgeLmError::Unimplemented(
            "EOS id is not available for this tokenizer".into(),
        ))
    }
}

/// Merge two batches of token ids row by row, appending each `next` row to
/// the corresponding `previous` row.
pub fn merge_token_ids(previous: &[Vec<i32>], next: &[Vec<i32>]) -> Result<Vec<Vec<i32>>> {
    if previous.len() != next.len() {
        return Err(EdgeLmError::InvalidArgument(format!(
            "previous and next token ids must have the same number of rows ({} vs {})",
            previous.len(),
            next.len()
        )));
    }
    Ok(previous
        .iter()
        .zip(next)
        .map(|(prev, next)| {
            let mut merged = prev.clone();
            merged.extend_from_slice(next);
            merged
        })
        .collect())
}

/// On-disk shape of a HuggingFace-format `tokenizer.json`, reduced to the
/// fields this runtime consumes.
#[derive(Deserialize)]
struct TokenizerFile {
    model: TokenizerModel,
}

#[derive(Deserialize)]
struct TokenizerModel {
    #[serde(default)]
    vocab: HashMap<String, i32>,
    /// Merge rules as `"left right"` strings, highest priority first.
    #[serde(default)]
    merges: Vec<String>,
}

/// BPE tokenizer loaded from a HuggingFace-format `tokenizer.json`.
///
/// Supports byte-fallback vocabularies: tokens of the form `<0xHH>` encode a
/// single raw byte, which is how multi-byte codepoints end up split across
/// tokens.
pub struct BpeTokenizer {
    /// Decode table; `None` for ids the vocabulary does not assign.
    id_to_token: Vec<Option<String>>,

    /// Encode table: token string -> token_id.
    token_to_id: HashMap<String, i32>,

    /// Adjacent-pair merge rules and their priority (lower rank wins).
    merge_ranks: HashMap<(String, String), usize>,

    /// Byte-fallback ids: byte value -> token_id, when the vocab has them.
    byte_tokens: [i32; 256],

    bos_id: Option<i32>,
    eos_id: Option<i32>,
}

impl BpeTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            EdgeLmError::InvalidArgument(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    /// Load the tokenizer entry out of a model asset bundle.
    pub fn from_bundle(resources: &ModelResources<'_>) -> Result<Self> {
        let bytes = resources.tokenizer_bytes()?;
        let data = std::str::from_utf8(bytes)
            .map_err(|_| EdgeLmError::DataLoss("tokenizer entry is not valid UTF-8".into()))?;
        Self::from_json(data)
    }

    /// Parse a HuggingFace-format tokenizer definition.
    pub fn from_json(data: &str) -> Result<Self> {
        let file: TokenizerFile = serde_json::from_str(data).map_err(|e| {
            EdgeLmError::InvalidArgument(format!("malformed tokenizer JSON: {e}"))
        })?;

        let mut id_to_token: Vec<Option<String>> = Vec::new();
        let mut byte_tokens = [NO_TOKEN_ID; 256];
        for (token, &id) in &file.model.vocab {
            if id < 0 {
                return Err(EdgeLmError::InvalidArgument(format!(
                    "token {token} has negative id {id}"
                )));
            }
            let slot = id as usize;
            if slot >= id_to_token.len() {
                id_to_token.resize(slot + 1, None);
            }
            id_to_token[slot] = Some(token.clone());
            if let Some(byte) = parse_byte_token(token) {
                byte_tokens[byte as usize] = id;
            }
        }

        let mut merge_ranks = HashMap::with_capacity(file.model.merges.len());
        for (rank, rule) in file.model.merges.iter().enumerate() {
            let Some((left, right)) = rule.split_once(' ') else {
                return Err(EdgeLmError::InvalidArgument(format!(
                    "malformed merge rule: {rule:?}"
                )));
            };
            merge_ranks.insert((left.to_string(), right.to_string()), rank);
        }

        let bos_id = lookup_first(&file.model.vocab, &["<bos>", "<s>", "<|begin_of_text|>"]);
        let eos_id = lookup_first(&file.model.vocab, &["<eos>", "</s>", "<|end_of_text|>"]);

        Ok(BpeTokenizer {
            id_to_token,
            token_to_id: file.model.vocab,
            merge_ranks,
            byte_tokens,
            bos_id,
            eos_id,
        })
    }

    /// Number of id slots in the decode table (highest assigned id + 1).
    pub fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }

    /// The highest-priority merge applicable to `pieces`, as
    /// `(rank, left index)`.
    fn best_merge(&self, pieces: &[String]) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        for idx in 0..pieces.len().saturating_sub(1) {
            let pair = (pieces[idx].clone(), pieces[idx + 1].clone());
            if let Some(&rank) = self.merge_ranks.get(&pair) {
                if best.map_or(true, |(best_rank, _)| rank < best_rank) {
                    best = Some((rank, idx));
                }
            }
        }
        best
    }
}

impl Tokenizer for BpeTokenizer {
    fn text_to_token_ids(&self, text: &str) -> Result<Vec<i32>> {
        // Standard BPE: start from single characters, then repeatedly apply
        // the highest-priority merge anywhere in the sequence until no rule
        // matches an adjacent pair.
        let mut pieces: Vec<String> = text.chars().map(String::from).collect();
        while let Some((_, idx)) = self.best_merge(&pieces) {
            let right = pieces.remove(idx + 1);
            pieces[idx].push_str(&right);
        }

        let mut ids = Vec::with_capacity(pieces.len());
        for piece in &pieces {
            if let Some(&id) = self.token_to_id.get(piece) {
                ids.push(id);
            } else {
                // Byte fallback: encode the piece's UTF-8 bytes individually.
                for byte in piece.bytes() {
                    let id = self.byte_tokens[byte as usize];
                    if id == NO_TOKEN_ID {
                        tracing::warn!(%piece, "piece not in vocabulary and no byte fallback");
                        break;
                    }
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    fn token_ids_to_text(&self, token_ids: &[i32]) -> Result<String> {
        let mut bytes = Vec::new();
        for &id in token_ids {
            let token = usize::try_from(id)
                .ok()
                .and_then(|slot| self.id_to_token.get(slot))
                .and_then(|entry| entry.as_deref())
                .ok_or_else(|| {
                    EdgeLmError::InvalidArgument(format!("id {id} is not in the vocabulary"))
                })?;
            if let Some(byte) = parse_byte_token(token) {
                bytes.push(byte);
            } else {
                bytes.extend_from_slice(token.as_bytes());
            }
        }
        let decoded = String::from_utf8_lossy(&bytes).into_owned();
        if decoded.ends_with(REPLACEMENT_CHARACTER) {
            return Err(EdgeLmError::IncompleteBpe(
                "the token ids end part-way through a BPE byte sequence; more tokens are needed"
                    .into(),
            ));
        }
        Ok(decoded)
    }

    fn bos_id(&self) -> Result<i32> {
        self.bos_id
            .ok_or_else(|| EdgeLmError::Unimplemented("vocabulary defines no BOS token".into()))
    }

    fn eos_id(&self) -> Result<i32> {
        self.eos_id
            .ok_or_else(|| EdgeLmError::Unimplemented("vocabulary defines no EOS token".into()))
    }
}

/// Parse a byte-fallback token of the form `<0xHH>`.
fn parse_byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

fn lookup_first(token_to_id: &HashMap<String, i32>, names: &[&str]) -> Option<i32> {
    names.iter().find_map(|n| token_to_id.get(*n).copied())
}
