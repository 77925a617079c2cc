use crate::dataset::{TokenId, TokenizedRecord};
use crate::error::{TrainingError, TrainingResult};
use std::path::Path;

/// Auxiliary field emitted alongside the primary ids.
pub const ATTENTION_MASK_FIELD: &str = "attention_mask";

/// Seam to the tokenizer that turns raw text into token ids.
pub trait Tokenizer: Send + Sync {
    fn id(&self) -> &'static str;

    fn encode(&self, text: &str) -> TrainingResult<Vec<TokenId>>;

    /// Id appended after every document, if the tokenizer has one.
    fn eos_token_id(&self) -> Option<TokenId>;

    /// Tokenize one document into a record with `primary_field` and an all-ones attention mask.
    fn encode_record(&self, text: &str, primary_field: &str) -> TrainingResult<TokenizedRecord> {
        let mut ids = self.encode(text)?;
        if let Some(eos) = self.eos_token_id() {
            ids.push(eos);
        }
        let mask = vec![1; ids.len()];

        let mut record = TokenizedRecord::new();
        record.insert(primary_field.to_string(), ids);
        record.insert(ATTENTION_MASK_FIELD.to_string(), mask);
        Ok(record)
    }
}

/// End-of-text markers, most specific first.
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|end_of_text|>", "<|im_end|>", "<eos>", "[SEP]"];

/// A model tokenizer loaded from a Hugging Face `tokenizer.json`.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    eos_token_id: Option<TokenId>,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> TrainingResult<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            TrainingError::InvalidConfig(format!("failed to load tokenizer {}: {e}", path.display()))
        })?;
        let eos_token_id = detect_eos(&inner);
        if eos_token_id.is_none() {
            tracing::warn!(path = %path.display(), "tokenizer has no end-of-text token; documents will run together");
        }
        Ok(Self { inner, eos_token_id })
    }

    #[must_use]
    pub fn with_eos_token_id(mut self, eos_token_id: Option<TokenId>) -> Self {
        self.eos_token_id = eos_token_id;
        self
    }
}

/// Prefer special added tokens, then fall back to the plain vocabulary.
fn detect_eos(tokenizer: &tokenizers::Tokenizer) -> Option<TokenId> {
    let added = tokenizer.get_added_tokens_decoder();
    EOS_CANDIDATES
        .iter()
        .find_map(|name| added.iter().find(|(_, token)| token.special && token.content == *name).map(|(id, _)| *id))
        .or_else(|| EOS_CANDIDATES.iter().find_map(|name| tokenizer.token_to_id(name)))
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.inner.get_vocab_size(true))
            .field("eos_token_id", &self.eos_token_id)
            .finish()
    }
}

impl Tokenizer for HfTokenizer {
    fn id(&self) -> &'static str {
        "huggingface"
    }

    fn encode(&self, text: &str) -> TrainingResult<Vec<TokenId>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| TrainingError::Dataset(format!("tokenization failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn eos_token_id(&self) -> Option<TokenId> {
        self.eos_token_id
    }
}

/// Byte-level tokenizer: one id per UTF-8 byte, `256` marks end of text.
///
/// The ids match no real model vocabulary; use it only where the ids are never trained on.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const EOS_TOKEN_ID: TokenId = 256;
    pub const VOCAB_SIZE: usize = 257;
}

impl Tokenizer for ByteTokenizer {
    fn id(&self) -> &'static str {
        "byte"
    }

    fn encode(&self, text: &str) -> TrainingResult<Vec<TokenId>> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn eos_token_id(&self) -> Option<TokenId> {
        Some(Self::EOS_TOKEN_ID)
    }
}
