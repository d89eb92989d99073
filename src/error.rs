use thiserror::Error;

/// Error type for pipeline operations.
///
/// Only whole-batch and configuration problems are fatal to a run. Failures
/// of a single video or a single evidence marker are recovered at the unit
/// boundary (see `notes::UnitFailure` and `trace::TraceReport`) and never
/// surface through this type.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Video search failed: {0}")]
    Search(String),

    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Note synthesis failed: {0}")]
    Synthesis(String),

    #[error("LLM request failed: {0}")]
    Llm(String),

    #[error("All {0} videos failed, no usable notes")]
    BatchExhausted(usize),

    #[error("Evidence trace failed: {0}")]
    Trace(String),

    #[error("External tool not found: {0}. Install it and make sure it is on PATH.")]
    ToolNotFound(String),

    #[error("External tool failed: {0}")]
    ToolFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
