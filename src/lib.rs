/// evinote - multi-video evidence notebook
///
/// Answers a question by searching for relevant videos, turning each one
/// into a structured Markdown note, fusing the notes into one deduplicated
/// answer, and tracing every claim back to a keyframe of its source video.

pub mod config;
pub mod dedup;
pub mod error;
pub mod fusion;
pub mod llm;
pub mod media;
pub mod notes;
pub mod pipeline;
pub mod prompts;
pub mod search;
pub mod state;
pub mod trace;
pub mod transcription;

// Re-export main types for easy access
pub use crate::config::Config;
pub use crate::dedup::DedupEngine;
pub use crate::error::{PipelineError, Result};
pub use crate::fusion::FusionEngine;
pub use crate::llm::{ChatMessage, Llm, LlmRegistry, LlmResponse, ModelSelector};
pub use crate::media::{AcquiredMedia, AudioMeta, MediaFetcher};
pub use crate::notes::{NoteBatch, NoteBatchReport, NoteEngine, NoteResult};
pub use crate::pipeline::{Pipeline, Route};
pub use crate::search::{VideoReference, VideoSearcher};
pub use crate::state::{ChatRole, ChatTurn, PipelineState};
pub use crate::trace::{TraceEngine, TraceMap, TraceRecord, TraceReport};
pub use crate::transcription::{Transcriber, Transcript, TranscriptSegment};
