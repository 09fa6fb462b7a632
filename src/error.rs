//! Error types for the conversation engine.

/// Top-level error type for the conversation engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text transcription error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Language model generation error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Profile or engine configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Event queue or worker channel error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, EngineError>;
