/// Transcript postprocessing
///
/// Strips backend meta-tokens (`<|zh|>`, `<|NEUTRAL|>`, `<|Speech|>` and the
/// like) from raw transcription output and optionally re-punctuates the text
/// through a secondary model. Punctuation is best-effort and never fails a
/// job.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

static META_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\|[^|>]*\|>").expect("meta token pattern"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

/// Remove `<|...|>` meta-tokens and collapse repeated whitespace. Idempotent.
pub fn clean(text: &str) -> String {
    let stripped = META_TOKEN.replace_all(text, "");
    WHITESPACE.replace_all(&stripped, " ").trim().to_string()
}

/// Secondary model that restores punctuation for supported languages
#[async_trait]
pub trait PunctuationModel: Send + Sync {
    /// Whether a punctuation model exists for this language
    fn supports(&self, language: &str) -> bool;

    async fn punctuate(&self, text: &str, language: &str) -> Result<String, String>;
}

/// Cleans raw backend text and optionally routes it through a punctuation
/// model
pub struct Postprocessor {
    punctuation: Option<Arc<dyn PunctuationModel>>,
}

impl Postprocessor {
    pub fn new() -> Self {
        Self { punctuation: None }
    }

    pub fn with_punctuation(model: Arc<dyn PunctuationModel>) -> Self {
        Self {
            punctuation: Some(model),
        }
    }

    /// Clean the text and, when a punctuation model covers `language`,
    /// re-punctuate it. Punctuation failures log a warning and return the
    /// cleaned text unchanged.
    pub async fn apply(&self, text: &str, language: &str) -> String {
        let cleaned = clean(text);

        if cleaned.is_empty() {
            return cleaned;
        }

        let model = match &self.punctuation {
            Some(model) => model,
            None => return cleaned,
        };

        if !model.supports(language) {
            debug!("No punctuation model for language {}, skipping", language);
            return cleaned;
        }

        match model.punctuate(&cleaned, language).await {
            Ok(punctuated) => punctuated,
            Err(e) => {
                warn!("Punctuation failed ({}), keeping unpunctuated text", e);
                cleaned
            }
        }
    }
}

impl Default for Postprocessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UppercasePunctuator;

    #[async_trait]
    impl PunctuationModel for UppercasePunctuator {
        fn supports(&self, language: &str) -> bool {
            language == "en"
        }

        async fn punctuate(&self, text: &str, _language: &str) -> Result<String, String> {
            Ok(format!("{}.", text))
        }
    }

    struct FailingPunctuator;

    #[async_trait]
    impl PunctuationModel for FailingPunctuator {
        fn supports(&self, _language: &str) -> bool {
            true
        }

        async fn punctuate(&self, _text: &str, _language: &str) -> Result<String, String> {
            Err("model crashed".to_string())
        }
    }

    #[test]
    fn test_clean_strips_meta_tokens() {
        let raw = "<|zh|><|NEUTRAL|><|Speech|>你好世界";
        assert_eq!(clean(raw), "你好世界");
    }

    #[test]
    fn test_clean_strips_event_tags_mid_text() {
        let raw = "hello <|BGM|> world <|withitn|>";
        assert_eq!(clean(raw), "hello world");
    }

    #[test]
    fn test_clean_collapses_whitespace() {
        assert_eq!(clean("  a \t b \n\n c  "), "a b c");
    }

    #[test]
    fn test_clean_is_idempotent() {
        let raw = "<|en|> some   text <|EMO_UNKNOWN|>";
        let once = clean(raw);
        assert_eq!(clean(&once), once);
    }

    #[test]
    fn test_clean_keeps_plain_text() {
        assert_eq!(clean("already clean"), "already clean");
    }

    #[tokio::test]
    async fn test_apply_without_model() {
        let post = Postprocessor::new();
        let out = post.apply("<|en|> hello", "en").await;
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_apply_punctuates_supported_language() {
        let post = Postprocessor::with_punctuation(Arc::new(UppercasePunctuator));
        let out = post.apply("hello world", "en").await;
        assert_eq!(out, "hello world.");
    }

    #[tokio::test]
    async fn test_apply_bypasses_unsupported_language() {
        let post = Postprocessor::with_punctuation(Arc::new(UppercasePunctuator));
        let out = post.apply("你好", "zh").await;
        assert_eq!(out, "你好");
    }

    #[tokio::test]
    async fn test_apply_failure_returns_cleaned_text() {
        let post = Postprocessor::with_punctuation(Arc::new(FailingPunctuator));
        let out = post.apply("<|en|> hello  world", "en").await;
        assert_eq!(out, "hello world");
    }
}
