//! Text preparation, SentencePiece tokenization and text embeddings
//!
//! Text is normalized with [`prepare_text`], split into subword ids by a
//! [`TextTokenizer`] and embedded by the text conditioner unit.

use crate::error::{Result, TtsError};
use crate::unit::{TensorUnit, take_output};
use candle_core::{Device, Tensor};
use sentencepiece::SentencePieceProcessor;
use std::path::Path;

use super::to_rank3;

/// Text to subword token ids.
pub trait TextTokenizer: Send {
    /// Tokenize `text`. Implementations apply [`prepare_text`] first.
    fn encode(&self, text: &str) -> Result<Vec<i64>>;

    fn vocab_size(&self) -> usize;
}

pub struct SentencePieceTokenizer {
    sp: SentencePieceProcessor,
}

impl SentencePieceTokenizer {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let sp = SentencePieceProcessor::open(path).map_err(|e| {
            TtsError::Setup(format!("Failed to load tokenizer {:?}: {:?}", path, e))
        })?;
        Ok(Self { sp })
    }
}

impl TextTokenizer for SentencePieceTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let prepared = prepare_text(text)?;
        let pieces = self
            .sp
            .encode(&prepared)
            .map_err(|e| TtsError::Input(format!("Failed to encode text: {:?}", e)))?;
        Ok(pieces.iter().map(|p| p.id as i64).collect())
    }

    fn vocab_size(&self) -> usize {
        self.sp.len()
    }
}

/// Normalize text before tokenization.
///
/// Trims surrounding whitespace, appends a period when the text ends in a
/// letter or digit, and upper-cases a leading lowercase letter.
pub fn prepare_text(text: &str) -> Result<String> {
    let text = text.trim();
    if text.is_empty() {
        return Err(TtsError::Input("Text cannot be empty".into()));
    }

    let mut text = text.to_string();
    if let Some(last) = text.chars().last()
        && last.is_alphanumeric()
    {
        text.push('.');
    }

    if let Some(first) = text.chars().next()
        && first.is_lowercase()
    {
        text = format!("{}{}", first.to_uppercase(), &text[first.len_utf8()..]);
    }

    Ok(text)
}

/// Run the text conditioner over token ids.
///
/// Input `token_ids` is int64 `[1, T]`; the `embeddings` output comes back
/// as `[1, T, D]`.
pub fn embed_text<U: TensorUnit + ?Sized>(unit: &mut U, ids: &[i64]) -> Result<Tensor> {
    let tokens = Tensor::from_vec(ids.to_vec(), (1, ids.len()), &Device::Cpu)?;
    let mut outputs = unit.run(vec![("token_ids".to_string(), tokens)])?;
    let embeddings = take_output(&mut outputs, unit.name(), "embeddings")?;
    to_rank3(embeddings, unit.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTextConditioner;

    #[test]
    fn test_prepare_text() {
        assert_eq!(prepare_text("hello world").unwrap(), "Hello world.");
        assert_eq!(prepare_text("  Hello world!  ").unwrap(), "Hello world!");
        assert_eq!(prepare_text("\tnumber 42\n").unwrap(), "Number 42.");
        assert_eq!(prepare_text("über").unwrap(), "Über.");
        // Already punctuated, no capital to add
        assert_eq!(prepare_text("3 apples?").unwrap(), "3 apples?");
    }

    #[test]
    fn test_prepare_text_rejects_blank() {
        let err = prepare_text(" \n\t ").unwrap_err();
        assert!(matches!(err, TtsError::Input(_)));
    }

    #[test]
    fn test_embed_text_shape() -> Result<()> {
        let mut unit = MockTextConditioner::new(8);
        let emb = embed_text(&mut unit, &[4, 5, 6])?;
        assert_eq!(emb.dims(), &[1, 3, 8]);
        Ok(())
    }

    #[test]
    fn test_missing_tokenizer_is_setup_error() {
        let err = SentencePieceTokenizer::open("does/not/exist.model")
            .err()
            .unwrap();
        assert!(matches!(err, TtsError::Setup(_)));
    }
}
