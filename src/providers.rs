//! Collaborator contracts: ASR, LLM, TTS, and the VAD model.
//!
//! The engine consumes these traits; any backend may implement them.
//! Adapters normalize provider-specific failures into the kind enums here
//! so the turn processor can apply one retry policy across all of them.

use crate::memory::ChatMessage;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Classification of a collaborator failure, shared across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Provider throttled the request; retry after backoff.
    RateLimited,
    /// Transient fault (network, timeout); retry after backoff.
    Transient,
    /// Permanent fault (auth, bad request); do not retry.
    Permanent,
}

impl FailureKind {
    /// Stable string form used in signal payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

/// Speech-to-text failure.
#[derive(Debug, thiserror::Error)]
#[error("ASR {}: {message}", .kind.as_str())]
pub struct AsrError {
    pub kind: FailureKind,
    pub message: String,
}

impl AsrError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Whether the failure is worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind != FailureKind::Permanent
    }
}

/// Language-model failure.
#[derive(Debug, thiserror::Error)]
#[error("LLM {}: {message}", .kind.as_str())]
pub struct LlmError {
    pub kind: FailureKind,
    pub message: String,
}

impl LlmError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::RateLimited,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Whether the failure is worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind != FailureKind::Permanent
    }
}

/// Text-to-speech failure.
#[derive(Debug, thiserror::Error)]
#[error("TTS {}: {message}", .kind.as_str())]
pub struct TtsError {
    pub kind: FailureKind,
    pub message: String,
}

impl TtsError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Whether the failure is worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind != FailureKind::Permanent
    }
}

/// A finished transcription.
#[derive(Debug, Clone)]
pub struct Transcript {
    /// The transcribed text.
    pub text: String,
    /// Backend-reported latency in milliseconds.
    pub latency_ms: u64,
}

/// Lazily growing transcription prefixes for the in-flight human turn.
pub type PartialStream = BoxStream<'static, String>;

/// Speech-to-text collaborator.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe a complete utterance.
    ///
    /// # Errors
    ///
    /// Returns [`AsrError`] on failure; retryable kinds are retried by the
    /// turn processor with exponential backoff.
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<Transcript, AsrError>;

    /// Streaming partial transcripts, if the backend supports them.
    ///
    /// The default implementation reports no partials; energy-only
    /// interruption detection still works without them.
    fn partial_stream(&self) -> Option<PartialStream> {
        None
    }
}

/// A boxed stream of generated tokens, terminated by the stream closing.
pub type TokenStream = BoxStream<'static, Result<String, LlmError>>;

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Fully composed system prompt.
    pub system_prompt: String,
    /// Conversation history, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Token budget.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

/// Language-model collaborator.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Open a token stream for the given request.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] if the request cannot be initiated. Mid-stream
    /// faults are delivered as `Err` items on the stream.
    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream, LlmError>;
}

/// Synthesized speech audio.
#[derive(Debug, Clone)]
pub struct SynthesizedSpeech {
    /// Mono f32 samples.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

/// Text-to-speech collaborator.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize one sentence in the given voice.
    ///
    /// # Errors
    ///
    /// Returns [`TtsError`] on failure.
    async fn synthesize(&self, text: &str, voice: &str) -> Result<SynthesizedSpeech, TtsError>;
}

/// Voice-activity model scoring one capture frame at a time.
pub trait VoiceActivityModel: Send {
    /// Probability in \[0, 1\] that the frame contains speech.
    fn score(&mut self, frame: &[f32]) -> f32;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn rate_limited_is_retryable() {
        let err = LlmError::rate_limited("429");
        assert!(err.is_retryable());
        assert_eq!(err.kind.as_str(), "rate_limited");
    }

    #[test]
    fn permanent_is_not_retryable() {
        assert!(!AsrError::permanent("bad model").is_retryable());
        assert!(!TtsError::permanent("bad voice").is_retryable());
        assert!(!LlmError::permanent("401").is_retryable());
    }

    #[test]
    fn error_display_includes_kind() {
        let err = AsrError::transient("socket closed");
        assert_eq!(err.to_string(), "ASR transient: socket closed");
    }
}
