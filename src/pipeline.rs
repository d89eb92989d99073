use crate::config::Config;
use crate::dedup::DedupEngine;
use crate::error::Result;
use crate::fusion::FusionEngine;
use crate::llm::{LlmRegistry, ModelSelector};
use crate::media::MediaFetcher;
use crate::notes::NoteEngine;
use crate::prompts::Prompts;
use crate::search::VideoSearcher;
use crate::state::PipelineState;
use crate::trace::{FfmpegFrameExtractor, TraceEngine};
use crate::transcription::Transcriber;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Answer returned when search yields nothing to work with.
pub const NO_CONTENT_ANSWER: &str = "抱歉，没有找到相关的视频内容，无法回答该问题。";

/// Which path a run takes through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// search -> notes -> fusion -> dedup -> trace
    FullPipeline,
    /// follow-up against a prior fused answer
    Chat,
}

/// A question with a prior assistant answer in its history is a follow-up;
/// everything else runs the full pipeline.
pub fn route(state: &PipelineState) -> Route {
    if state.has_prior_answer() {
        Route::Chat
    } else {
        Route::FullPipeline
    }
}

/// The orchestrator: wires the stage engines together and drives one
/// question through them.
///
/// Stages do not retry. A stage that fails hard (search, fusion, an
/// exhausted note batch) fails the run; per-unit failures inside a stage
/// are the stage's own business.
pub struct Pipeline {
    searcher: VideoSearcher,
    note_engine: NoteEngine,
    fusion: FusionEngine,
    dedup: DedupEngine,
    trace: TraceEngine,
    registry: Arc<LlmRegistry>,
}

impl Pipeline {
    pub async fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(LlmRegistry::new(config.llm.clone()));
        let prompts = Prompts::load(&config.llm.prompts).await;

        let searcher = VideoSearcher::new(config.search.clone())?;
        let fetcher = MediaFetcher::new(config.media.clone());
        let transcriber = Arc::new(Transcriber::new(config.transcription.clone())?);

        let note_engine = NoteEngine::new(
            fetcher.clone(),
            transcriber,
            Arc::clone(&registry),
            prompts.clone(),
            config.performance.max_workers,
        );
        let fusion = FusionEngine::new(Arc::clone(&registry), prompts);
        let dedup = DedupEngine::new(config.dedup.clone());
        let trace = TraceEngine::new(
            config.media,
            config.trace,
            Box::new(FfmpegFrameExtractor),
            Box::new(fetcher),
        );

        Ok(Self {
            searcher,
            note_engine,
            fusion,
            dedup,
            trace,
            registry,
        })
    }

    pub fn default_selector(&self) -> ModelSelector {
        self.registry.default_selector()
    }

    /// Drive one state to completion.
    pub async fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        state.metadata.started_at = Some(Utc::now());

        match route(&state) {
            Route::Chat => {
                info!("Prior answer present, routing to chat");
                self.run_chat(&mut state).await?;
            }
            Route::FullPipeline => {
                info!("Running full pipeline for: {}", state.question);
                self.run_full(&mut state).await?;
            }
        }

        state.metadata.finished_at = Some(Utc::now());
        Ok(state)
    }

    async fn run_full(&self, state: &mut PipelineState) -> Result<()> {
        let refs = self.searcher.search(&state.question).await?;
        state.metadata.videos_found = refs.len();
        state.video_refs = refs.clone();

        if refs.is_empty() {
            warn!("Search returned no usable videos");
            state.fused_answer = Some(NO_CONTENT_ANSWER.to_string());
            return Ok(());
        }

        let batch = self.note_engine.generate(refs, &state.model_selector).await?;
        state.metadata.notes_generated = batch.notes.len();
        state.note_report = Some(batch.report);
        state.note_results = batch.notes;

        let answer = self
            .fusion
            .fuse(&state.question, &state.note_results, &state.model_selector)
            .await?;

        let deduped = self.dedup.dedup(&answer);

        // Tracing is best effort: a failed pass still yields the deduped
        // answer, just without evidence links.
        match self.trace.trace(&deduped, &state.note_results).await {
            Ok(outcome) => {
                state.metadata.markers_traced = outcome.report.succeeded;
                state.trace_report = Some(outcome.report);
                state.trace_map = outcome.trace_map;
                state.fused_answer = Some(outcome.markdown);
            }
            Err(e) => {
                warn!("Trace pass failed, returning untraced answer: {}", e);
                state.fused_answer = Some(deduped);
            }
        }

        Ok(())
    }

    async fn run_chat(&self, state: &mut PipelineState) -> Result<()> {
        let prior = state.prior_answer().unwrap_or_default().to_string();
        let answer = self
            .fusion
            .chat(&state.question, &state.history, &prior, &state.model_selector)
            .await?;
        state.fused_answer = Some(answer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ChatTurn;

    fn state(question: &str) -> PipelineState {
        PipelineState::new(question, ModelSelector::new("gpt-4o-mini", "openai"))
    }

    #[test]
    fn test_fresh_question_takes_full_pipeline() {
        assert_eq!(route(&state("这款相机怎么样")), Route::FullPipeline);
    }

    #[test]
    fn test_followup_takes_chat() {
        let s = state("续航呢").with_history(vec![
            ChatTurn::user("这款相机怎么样"),
            ChatTurn::assistant("先前的总结"),
        ]);
        assert_eq!(route(&s), Route::Chat);
    }

    #[test]
    fn test_user_only_history_takes_full_pipeline() {
        let s = state("问题").with_history(vec![ChatTurn::user("早前的问题")]);
        assert_eq!(route(&s), Route::FullPipeline);
    }

    #[tokio::test]
    async fn test_pipeline_construction_from_default_config() {
        let pipeline = Pipeline::new(Config::default()).await.unwrap();
        let selector = pipeline.default_selector();
        assert_eq!(selector.model, "gpt-4o-mini");
        assert_eq!(selector.provider_id, "openai");
    }
}
