use crate::error::{PipelineError, Result};
use crate::llm::{ChatMessage, Llm, LlmRegistry, ModelSelector};
use crate::media::{AudioMeta, MediaFetcher};
use crate::prompts::{self, Prompts};
use crate::search::VideoReference;
use crate::transcription::{Transcriber, Transcript};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

/// Hard cap on concurrent note workers; the effective pool size is
/// `min(cap, batch size)`.
pub const WORKER_CAP: usize = 5;

/// The work product for one video: its note plus everything the trace
/// engine needs to resolve evidence markers back into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteResult {
    pub url: String,
    pub platform: String,
    pub title: String,
    pub markdown: String,
    pub transcript: Transcript,
    pub audio_meta: AudioMeta,
}

/// A recovered per-video failure, excluded from the batch rather than
/// escalated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitFailure {
    /// Index of the failed reference in the input batch
    pub index: usize,
    pub url: String,
    pub reason: String,
}

/// Success/failure accounting for one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteBatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<UnitFailure>,
}

/// Output of the note generation engine.
#[derive(Debug, Clone)]
pub struct NoteBatch {
    /// Successful notes; completion order, not input order
    pub notes: Vec<NoteResult>,
    pub report: NoteBatchReport,
}

/// Bounded-parallel map with partial-failure collection.
///
/// Runs `unit` over every item with at most `limit` in flight, waits for all
/// of them to settle, and returns each item's outcome tagged with its input
/// index. One item failing never cancels the others. Output order follows
/// completion, not input.
pub async fn bounded_map<T, R, F, Fut>(
    items: Vec<T>,
    limit: usize,
    unit: F,
) -> Vec<(usize, Result<R>)>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(usize, T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let total = items.len();
    let limit = limit.max(1).min(total.max(1));
    let semaphore = Arc::new(Semaphore::new(limit));
    let (tx, mut rx) = mpsc::channel(limit);

    for (index, item) in items.into_iter().enumerate() {
        let unit = unit.clone();
        let tx = tx.clone();
        let semaphore = Arc::clone(&semaphore);

        tokio::spawn(async move {
            let _permit = semaphore.acquire().await.unwrap();
            let result = unit(index, item).await;
            if let Err(e) = tx.send((index, result)).await {
                error!("Failed to send unit result: {}", e);
            }
        });
    }

    // Close the channel once all tasks complete
    drop(tx);

    let mut results = Vec::with_capacity(total);
    while let Some(result) = rx.recv().await {
        results.push(result);
    }

    results
}

/// Fold per-unit outcomes into a batch, enforcing the aggregation policy:
/// some failures are tolerated, an all-failed batch is fatal.
fn aggregate(
    refs: &[VideoReference],
    results: Vec<(usize, Result<NoteResult>)>,
) -> Result<NoteBatch> {
    let total = refs.len();
    let mut notes = Vec::new();
    let mut failures = Vec::new();

    for (index, result) in results {
        match result {
            Ok(note) => notes.push(note),
            Err(e) => {
                let url = refs.get(index).map(|v| v.url.clone()).unwrap_or_default();
                warn!("Note generation failed for {} (skipped): {}", url, e);
                failures.push(UnitFailure {
                    index,
                    url,
                    reason: e.to_string(),
                });
            }
        }
    }

    if notes.is_empty() && total > 0 {
        error!("All {} videos failed, nothing to fuse", total);
        return Err(PipelineError::BatchExhausted(total));
    }

    let report = NoteBatchReport {
        total,
        succeeded: notes.len(),
        failed: failures.len(),
        failures,
    };

    info!(
        "Note generation finished: {}/{} succeeded, {} failed",
        report.succeeded, report.total, report.failed
    );

    Ok(NoteBatch { notes, report })
}

/// Orchestrates the acquisition → transcription → synthesis chain over a
/// batch of video references with bounded concurrency.
pub struct NoteEngine {
    fetcher: MediaFetcher,
    transcriber: Arc<Transcriber>,
    registry: Arc<LlmRegistry>,
    prompts: Prompts,
    max_workers: usize,
}

impl NoteEngine {
    pub fn new(
        fetcher: MediaFetcher,
        transcriber: Arc<Transcriber>,
        registry: Arc<LlmRegistry>,
        prompts: Prompts,
        max_workers: usize,
    ) -> Self {
        Self {
            fetcher,
            transcriber,
            registry,
            prompts,
            max_workers: max_workers.min(WORKER_CAP),
        }
    }

    /// Generate notes for every reference. Returns the successful subset;
    /// fails only when the whole batch failed.
    ///
    /// Output order is completion order. Callers correlate by url/video_id.
    pub async fn generate(
        &self,
        refs: Vec<VideoReference>,
        selector: &ModelSelector,
    ) -> Result<NoteBatch> {
        if refs.is_empty() {
            return Ok(NoteBatch {
                notes: Vec::new(),
                report: NoteBatchReport {
                    total: 0,
                    succeeded: 0,
                    failed: 0,
                    failures: Vec::new(),
                },
            });
        }

        let llm = self.registry.client(selector)?;
        let workers = self.max_workers.min(refs.len());
        info!(
            "Generating notes for {} videos ({} workers)",
            refs.len(),
            workers
        );

        let fetcher = self.fetcher.clone();
        let transcriber = Arc::clone(&self.transcriber);
        let prompts = self.prompts.clone();

        let results = bounded_map(refs.clone(), workers, move |index, video| {
            let fetcher = fetcher.clone();
            let transcriber = Arc::clone(&transcriber);
            let llm = Arc::clone(&llm);
            let prompts = prompts.clone();

            async move {
                let started = Instant::now();
                info!("Processing video {}: {}", index + 1, video.url);
                let note =
                    generate_single_note(&fetcher, &transcriber, llm.as_ref(), &prompts, &video)
                        .await?;
                info!(
                    "Note ready for {} in {:.1}s",
                    video.url,
                    started.elapsed().as_secs_f64()
                );
                Ok(note)
            }
        })
        .await;

        aggregate(&refs, results)
    }
}

/// Full unit of work for one video reference.
async fn generate_single_note(
    fetcher: &MediaFetcher,
    transcriber: &Transcriber,
    llm: &dyn Llm,
    prompts: &Prompts,
    video: &VideoReference,
) -> Result<NoteResult> {
    let acquired = fetcher.acquire(video).await?;
    let transcript = transcriber.transcribe(&acquired.audio_path).await?;

    let messages = vec![
        ChatMessage::system(prompts.synthesis.clone()),
        ChatMessage::user(prompts::synthesis_user_prompt(
            &video.title,
            &transcript.full_text,
        )),
    ];

    let response = llm.chat(messages).await?;
    if response.content.trim().is_empty() {
        return Err(PipelineError::Synthesis(format!(
            "empty note for {}",
            video.url
        )));
    }

    Ok(NoteResult {
        url: video.url.clone(),
        platform: video.platform.clone(),
        title: acquired.meta.title.clone(),
        markdown: response.content,
        transcript,
        audio_meta: acquired.meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn refs(n: usize) -> Vec<VideoReference> {
        (0..n)
            .map(|i| VideoReference {
                url: format!("https://www.bilibili.com/video/BV{}", i),
                platform: "bilibili".to_string(),
                title: format!("视频 {}", i),
                popularity_score: 0.5,
            })
            .collect()
    }

    fn note_for(video: &VideoReference) -> NoteResult {
        NoteResult {
            url: video.url.clone(),
            platform: video.platform.clone(),
            title: video.title.clone(),
            markdown: "# 笔记".to_string(),
            transcript: Transcript {
                language: None,
                full_text: String::new(),
                segments: Vec::new(),
            },
            audio_meta: AudioMeta {
                title: video.title.clone(),
                duration: 60.0,
                platform: video.platform.clone(),
                video_id: "BV0".to_string(),
                cover_url: None,
                local_video_path: None,
            },
        }
    }

    #[tokio::test]
    async fn test_bounded_map_collects_all_results() {
        let results = bounded_map(vec![1u64, 2, 3, 4], 2, |_, n| async move { Ok(n * 10) }).await;

        assert_eq!(results.len(), 4);
        let mut values: Vec<u64> = results.into_iter().map(|(_, r)| r.unwrap()).collect();
        values.sort();
        assert_eq!(values, vec![10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn test_bounded_map_respects_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let in_flight2 = Arc::clone(&in_flight);
        let peak2 = Arc::clone(&peak);
        let results = bounded_map(vec![(); 8], 3, move |_, _| {
            let in_flight = Arc::clone(&in_flight2);
            let peak = Arc::clone(&peak2);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(results.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_bounded_map_partial_failure_does_not_cancel() {
        let results = bounded_map(vec![0usize, 1, 2, 3, 4], 5, |_, n| async move {
            if n == 1 || n == 3 {
                Err(PipelineError::MediaAcquisition(format!("boom {}", n)))
            } else {
                Ok(n)
            }
        })
        .await;

        let ok = results.iter().filter(|(_, r)| r.is_ok()).count();
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        assert_eq!(ok, 3);
        assert_eq!(failed, 2);
    }

    #[test]
    fn test_aggregate_partial_failure_returns_subset() {
        let refs = refs(5);
        let results: Vec<(usize, Result<NoteResult>)> = refs
            .iter()
            .enumerate()
            .map(|(i, v)| {
                if i < 2 {
                    (
                        i,
                        Err(PipelineError::MediaAcquisition("download failed".to_string())),
                    )
                } else {
                    (i, Ok(note_for(v)))
                }
            })
            .collect();

        let batch = aggregate(&refs, results).unwrap();
        assert_eq!(batch.notes.len(), 3);
        assert_eq!(batch.report.total, 5);
        assert_eq!(batch.report.failed, 2);
        assert_eq!(batch.report.failures[0].url, refs[0].url);
    }

    #[test]
    fn test_aggregate_all_failed_is_batch_exhausted() {
        let refs = refs(3);
        let results: Vec<(usize, Result<NoteResult>)> = (0..3)
            .map(|i| {
                (
                    i,
                    Err(PipelineError::Transcription("rate limited".to_string())),
                )
            })
            .collect();

        let err = aggregate(&refs, results).unwrap_err();
        assert!(matches!(err, PipelineError::BatchExhausted(3)));
    }

    #[test]
    fn test_aggregate_empty_batch_is_not_an_error() {
        let batch = aggregate(&[], Vec::new()).unwrap();
        assert_eq!(batch.report.total, 0);
        assert!(batch.notes.is_empty());
    }
}
