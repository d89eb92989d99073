use crate::llm::ModelSelector;
use crate::notes::{NoteBatchReport, NoteResult};
use crate::search::VideoReference;
use crate::trace::{TraceMap, TraceReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One prior turn of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Run metadata stamped onto the final state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub videos_found: usize,
    pub notes_generated: usize,
    pub markers_traced: usize,
}

/// Everything one pipeline run reads and writes, explicit in one place.
///
/// Each stage consumes the fields the previous stages filled in and writes
/// its own; nothing is smuggled through globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    /// The user's question, verbatim
    pub question: String,

    /// Prior conversation turns; a prior assistant turn routes the run to
    /// chat instead of the full pipeline
    pub history: Vec<ChatTurn>,

    /// Which model answers this run
    pub model_selector: ModelSelector,

    /// Ranked search results, filled by the search stage
    pub video_refs: Vec<VideoReference>,

    /// Per-video notes, filled by the note generation stage
    pub note_results: Vec<NoteResult>,

    pub note_report: Option<NoteBatchReport>,

    /// The deduplicated, evidence-linked answer
    pub fused_answer: Option<String>,

    /// Evidence records keyed `"{video_id}_{timestamp}"`
    pub trace_map: TraceMap,

    pub trace_report: Option<TraceReport>,

    pub metadata: RunMetadata,
}

impl PipelineState {
    pub fn new(question: impl Into<String>, model_selector: ModelSelector) -> Self {
        Self {
            question: question.into(),
            history: Vec::new(),
            model_selector,
            video_refs: Vec::new(),
            note_results: Vec::new(),
            note_report: None,
            fused_answer: None,
            trace_map: TraceMap::new(),
            trace_report: None,
            metadata: RunMetadata::default(),
        }
    }

    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = history;
        self
    }

    /// The most recent fused answer available to a follow-up question:
    /// either this run's, or the last assistant turn from history.
    pub fn prior_answer(&self) -> Option<&str> {
        if let Some(answer) = &self.fused_answer {
            return Some(answer);
        }
        self.history
            .iter()
            .rev()
            .find(|t| t.role == ChatRole::Assistant)
            .map(|t| t.content.as_str())
    }

    /// True when the conversation already holds an assistant answer, which
    /// routes the run to chat instead of the full pipeline.
    pub fn has_prior_answer(&self) -> bool {
        self.history.iter().any(|t| t.role == ChatRole::Assistant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> ModelSelector {
        ModelSelector::new("gpt-4o-mini", "openai")
    }

    #[test]
    fn test_fresh_state_routes_to_pipeline() {
        let state = PipelineState::new("这款相机怎么样", selector());
        assert!(!state.has_prior_answer());
        assert!(state.prior_answer().is_none());
    }

    #[test]
    fn test_history_with_assistant_turn_routes_to_chat() {
        let state = PipelineState::new("续航呢", selector()).with_history(vec![
            ChatTurn::user("这款相机怎么样"),
            ChatTurn::assistant("总结内容"),
        ]);
        assert!(state.has_prior_answer());
        assert_eq!(state.prior_answer(), Some("总结内容"));
    }

    #[test]
    fn test_user_only_history_still_runs_pipeline() {
        let state = PipelineState::new("问题", selector())
            .with_history(vec![ChatTurn::user("早前的问题")]);
        assert!(!state.has_prior_answer());
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut state = PipelineState::new("问题", selector());
        state.fused_answer = Some("回答".to_string());
        state.metadata.videos_found = 3;

        let json = serde_json::to_string(&state).unwrap();
        let back: PipelineState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.question, "问题");
        assert_eq!(back.fused_answer.as_deref(), Some("回答"));
        assert_eq!(back.metadata.videos_found, 3);
    }
}
