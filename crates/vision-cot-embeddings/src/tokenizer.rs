//! Text tokenization seam.
//!
//! The backbone consumes token ids from a [`TextTokenizer`]. Pretrained
//! backbones ship a HuggingFace `tokenizer.json` loaded through
//! [`HfTokenizer`]; randomly initialised backbones use the self-contained
//! [`ByteTokenizer`].

use std::path::Path;

use tokenizers::Tokenizer;
use tracing::info;

use crate::error::{VisionCotError, VisionCotResult};

/// Converts text to token ids and back.
pub trait TextTokenizer: Send + Sync {
    /// Encode text without adding special tokens.
    fn encode(&self, text: &str) -> VisionCotResult<Vec<u32>>;

    /// Decode ids, skipping special tokens.
    fn decode(&self, ids: &[u32]) -> VisionCotResult<String>;

    /// Size of the id space produced by `encode`.
    fn vocab_size(&self) -> usize;

    /// End-of-sequence id, if any.
    fn eos_token_id(&self) -> Option<u32>;

    /// Number of tokens `text` encodes to.
    fn count_tokens(&self, text: &str) -> VisionCotResult<usize> {
        Ok(self.encode(text)?.len())
    }
}

/// Byte-level tokenizer: ids `0..=255` are raw UTF-8 bytes, `256` is EOS.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    /// End-of-sequence id.
    pub const EOS_TOKEN_ID: u32 = 256;
    /// Bytes plus EOS.
    pub const VOCAB_SIZE: usize = 257;
}

impl TextTokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> VisionCotResult<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> VisionCotResult<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id < Self::EOS_TOKEN_ID)
            .map(|&id| id as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB_SIZE
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(Self::EOS_TOKEN_ID)
    }
}

/// End-of-sequence spellings probed in a HuggingFace vocabulary, in order.
const EOS_CANDIDATES: [&str; 5] = ["<|endoftext|>", "<|im_end|>", "</s>", "<eos>", "<|eot_id|>"];

/// HuggingFace tokenizer loaded from `tokenizer.json`.
pub struct HfTokenizer {
    inner: Tokenizer,
    eos_token_id: Option<u32>,
}

impl HfTokenizer {
    /// Load a tokenizer file.
    pub fn from_file(path: impl AsRef<Path>) -> VisionCotResult<Self> {
        let path = path.as_ref();
        let inner = Tokenizer::from_file(path).map_err(|e| VisionCotError::TokenizerError {
            message: format!("Failed to load tokenizer '{}': {}", path.display(), e),
        })?;
        let eos_token_id = EOS_CANDIDATES.iter().find_map(|t| inner.token_to_id(t));

        info!(
            path = %path.display(),
            vocab_size = inner.get_vocab_size(true),
            eos_token_id = ?eos_token_id,
            "Loaded tokenizer"
        );

        Ok(Self {
            inner,
            eos_token_id,
        })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> VisionCotResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| VisionCotError::TokenizerError {
                message: format!("Tokenization failed: {}", e),
            })?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> VisionCotResult<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| VisionCotError::TokenizerError {
                message: format!("Decoding failed: {}", e),
            })
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
}

/// Load the configured tokenizer, or the byte tokenizer when none is set.
pub fn load_tokenizer(path: Option<&Path>) -> VisionCotResult<Box<dyn TextTokenizer>> {
    match path {
        Some(p) => Ok(Box::new(HfTokenizer::from_file(p)?)),
        None => Ok(Box::new(ByteTokenizer)),
    }
}
