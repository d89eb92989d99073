use crate::config::{MediaConfig, TraceConfig};
use crate::error::{PipelineError, Result};
use crate::media::{extract_video_id, locate_local_video, MediaFetcher};
use crate::notes::NoteResult;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// One resolved evidence link: a claim in the fused answer traced back to a
/// keyframe of the source video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub video_url: String,
    pub video_id: String,
    pub timestamp: u64,
    pub frame_url: String,
    pub frame_path: PathBuf,
    pub platform: String,
}

/// Complete evidence set for one run, keyed `"{video_id}_{timestamp}"`
/// (numeric suffix on collision).
pub type TraceMap = BTreeMap<String, TraceRecord>;

/// Per-run marker accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceReport {
    pub markers_found: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Result of a trace pass.
#[derive(Debug, Clone)]
pub struct TraceOutcome {
    pub markdown: String,
    pub trace_map: TraceMap,
    pub report: TraceReport,
}

/// An evidence marker parsed out of the fused answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    /// Exact matched text, used for first-occurrence replacement
    pub raw: String,
    /// mm*60+ss
    pub timestamp: u64,
    /// 0-based explicit video index, when the marker carries `-video{k}`
    pub video_idx: Option<usize>,
    /// Collapsed text preceding the marker, at most ~150 chars
    pub context: String,
}

/// Capability that cuts a single frame out of a local video file.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract_frame(
        &self,
        video_path: &Path,
        timestamp: u64,
        output_dir: &Path,
        index: usize,
    ) -> Result<PathBuf>;
}

/// Capability that downloads a video on demand for keyframe extraction.
#[async_trait]
pub trait VideoFetcher: Send + Sync {
    async fn fetch_video(&self, url: &str, video_id: &str) -> Result<PathBuf>;
}

/// ffmpeg-based keyframe extraction. Filenames embed the caller-supplied
/// sequence index, so concurrent runs sharing the directory never collide.
pub struct FfmpegFrameExtractor;

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn extract_frame(
        &self,
        video_path: &Path,
        timestamp: u64,
        output_dir: &Path,
        index: usize,
    ) -> Result<PathBuf> {
        let frame_path = output_dir.join(format!("frame_{:04}_{}.jpg", index, timestamp));

        let status = Command::new("ffmpeg")
            .args([
                "-ss",
                &timestamp.to_string(),
                "-i",
                &video_path.to_string_lossy(),
                "-vframes",
                "1",
                "-q:v",
                "2",
                "-y",
                "-loglevel",
                "error",
                &frame_path.to_string_lossy(),
            ])
            .status()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PipelineError::ToolNotFound("ffmpeg".to_string()),
                _ => PipelineError::Io(e),
            })?;

        if !status.success() {
            return Err(PipelineError::ToolFailed(format!(
                "ffmpeg frame extraction failed at {}s for {}",
                timestamp,
                video_path.display()
            )));
        }

        Ok(frame_path)
    }
}

#[async_trait]
impl VideoFetcher for MediaFetcher {
    async fn fetch_video(&self, url: &str, video_id: &str) -> Result<PathBuf> {
        self.download_video(url, video_id).await
    }
}

/// Take the last `n` chars of a string (UTF-8 safe).
fn tail_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    let start = s
        .char_indices()
        .nth(count - n)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &s[start..]
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '。' | '？' | '！' | '.' | '?' | '!')
}

/// Collapse and bound a context window to roughly one trailing sentence.
fn build_context(window: &str) -> String {
    let ws = Regex::new(r"\s+").unwrap();
    let collapsed = ws.replace_all(window.trim(), " ").to_string();

    if collapsed.chars().count() <= 150 {
        return collapsed;
    }

    let truncated = tail_chars(&collapsed, 150);
    let boundary = truncated
        .char_indices()
        .filter(|(_, c)| is_sentence_end(*c))
        .last();

    match boundary {
        Some((byte_idx, ch)) => {
            let char_pos = truncated[..byte_idx].chars().count();
            if char_pos > 50 {
                format!("...{}", truncated[byte_idx + ch.len_utf8()..].trim())
            } else {
                format!("...{}", truncated)
            }
        }
        None => format!("...{}", truncated),
    }
}

/// Scan fused Markdown for evidence markers in document order.
///
/// Recognized shapes: `Content-[mm:ss]`, `*Content-[mm:ss]`,
/// `Content-[mm:ss]-video{k}`. Total over any input: a string with no
/// markers yields an empty list.
pub fn extract_markers(markdown: &str) -> Vec<Marker> {
    let pattern = Regex::new(r"\*?Content-\[(\d{2}):(\d{2})\](?:-video(\d+))?").unwrap();
    let mut markers = Vec::new();

    for caps in pattern.captures_iter(markdown) {
        let whole = caps.get(0).unwrap();
        let mm: u64 = caps[1].parse().unwrap_or(0);
        let ss: u64 = caps[2].parse().unwrap_or(0);
        let video_idx = caps
            .get(3)
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .and_then(|k| k.checked_sub(1));

        let prefix = &markdown[..whole.start()];
        let context = build_context(tail_chars(prefix, 200));

        markers.push(Marker {
            raw: whole.as_str().to_string(),
            timestamp: mm * 60 + ss,
            video_idx,
            context,
        });
    }

    markers
}

/// Resolve which note a marker points at.
///
/// An in-range explicit index wins. Otherwise the first note whose
/// transcript has a segment containing the timestamp is taken. When neither
/// applies, this falls back to the first note of the batch, which is a
/// guess, not a verified match.
pub fn resolve_marker_video<'a>(
    timestamp: u64,
    video_idx: Option<usize>,
    notes: &'a [NoteResult],
) -> Option<&'a NoteResult> {
    if let Some(idx) = video_idx {
        if idx < notes.len() {
            return Some(&notes[idx]);
        }
    }

    for note in notes {
        if note.transcript.segment_containing(timestamp).is_some() {
            return Some(note);
        }
    }

    notes.first()
}

/// Resolves evidence markers in a fused answer into keyframes and deep
/// links, rewriting the text in place. Per-marker failures are counted and
/// skipped; the engine never fails a run over a single bad marker.
pub struct TraceEngine {
    media_config: MediaConfig,
    trace_config: TraceConfig,
    extractor: Box<dyn FrameExtractor>,
    fetcher: Box<dyn VideoFetcher>,
    marker_pattern: Regex,
    bold_pattern: Regex,
    italic_pattern: Regex,
    heading_pattern: Regex,
}

impl TraceEngine {
    pub fn new(
        media_config: MediaConfig,
        trace_config: TraceConfig,
        extractor: Box<dyn FrameExtractor>,
        fetcher: Box<dyn VideoFetcher>,
    ) -> Self {
        Self {
            media_config,
            trace_config,
            extractor,
            fetcher,
            marker_pattern: Regex::new(r"\*?Content-\[\d{2}:\d{2}\](?:-video\d+)?").unwrap(),
            bold_pattern: Regex::new(r"\*\*([^*]+)\*\*").unwrap(),
            italic_pattern: Regex::new(r"\*([^*]+)\*").unwrap(),
            heading_pattern: Regex::new(r"#{1,6}\s+").unwrap(),
        }
    }

    /// Run the trace pass over a fused answer.
    pub async fn trace(&self, markdown: &str, notes: &[NoteResult]) -> Result<TraceOutcome> {
        if markdown.trim().is_empty() || notes.is_empty() {
            return Ok(TraceOutcome {
                markdown: markdown.to_string(),
                trace_map: TraceMap::new(),
                report: TraceReport::default(),
            });
        }

        let markers = extract_markers(markdown);
        if markers.is_empty() {
            debug!("No evidence markers found");
            return Ok(TraceOutcome {
                markdown: markdown.to_string(),
                trace_map: TraceMap::new(),
                report: TraceReport::default(),
            });
        }

        tokio::fs::create_dir_all(&self.trace_config.frame_output_dir).await?;
        info!("Tracing {} evidence markers", markers.len());

        let mut trace_map = TraceMap::new();
        let mut updated = markdown.to_string();
        let mut frame_index = 0usize;
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for marker in &markers {
            match self
                .trace_one(marker, notes, &mut updated, &mut trace_map, frame_index)
                .await
            {
                Ok(()) => {
                    frame_index += 1;
                    succeeded += 1;
                }
                Err(e) => {
                    warn!(
                        "Marker at {}s unresolvable (skipped): {}",
                        marker.timestamp, e
                    );
                    failed += 1;
                }
            }
        }

        let report = TraceReport {
            markers_found: markers.len(),
            succeeded,
            failed,
        };
        info!(
            "Trace finished: {} succeeded, {} failed, {} total",
            report.succeeded, report.failed, report.markers_found
        );

        Ok(TraceOutcome {
            markdown: updated,
            trace_map,
            report,
        })
    }

    /// Resolve, extract and rewrite one marker. Any error here means "this
    /// marker is unresolvable", recovered by the caller.
    async fn trace_one(
        &self,
        marker: &Marker,
        notes: &[NoteResult],
        updated: &mut String,
        trace_map: &mut TraceMap,
        frame_index: usize,
    ) -> Result<()> {
        let note = resolve_marker_video(marker.timestamp, marker.video_idx, notes)
            .ok_or_else(|| PipelineError::Trace("empty note batch".to_string()))?;

        let video_id = if !note.audio_meta.video_id.is_empty() {
            note.audio_meta.video_id.clone()
        } else {
            extract_video_id(&note.url, &note.platform).ok_or_else(|| {
                PipelineError::MediaAcquisition(format!("no video id for {}", note.url))
            })?
        };

        // Local file, then on-demand download for supported platforms
        let video_path = match locate_local_video(&video_id, &self.media_config) {
            Some(path) => path,
            None if note.platform == "bilibili" => {
                info!("Video {} not local, downloading for keyframe", video_id);
                self.fetcher.fetch_video(&note.url, &video_id).await?
            }
            None => {
                return Err(PipelineError::MediaAcquisition(format!(
                    "platform {} does not support on-demand download",
                    note.platform
                )));
            }
        };

        let duration = note.audio_meta.duration;
        if duration > 0.0 && marker.timestamp as f64 > duration {
            return Err(PipelineError::Trace(format!(
                "timestamp {}s beyond video duration {:.0}s",
                marker.timestamp, duration
            )));
        }

        let frame_path = self
            .extractor
            .extract_frame(
                &video_path,
                marker.timestamp,
                &self.trace_config.frame_output_dir,
                frame_index,
            )
            .await?;

        let metadata = tokio::fs::metadata(&frame_path)
            .await
            .map_err(|_| PipelineError::ToolFailed(format!("missing frame {}", frame_path.display())))?;
        if metadata.len() == 0 {
            return Err(PipelineError::ToolFailed(format!(
                "empty frame file {}",
                frame_path.display()
            )));
        }

        let filename = frame_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let frame_url = format!(
            "{}/{}/{}",
            self.trace_config.public_base_url.trim_end_matches('/'),
            self.trace_config.frame_base_url.trim_matches('/'),
            filename
        );

        let mut key = format!("{}_{}", video_id, marker.timestamp);
        if trace_map.contains_key(&key) {
            let mut counter = 1;
            while trace_map.contains_key(&format!("{}_{}", key, counter)) {
                counter += 1;
            }
            key = format!("{}_{}", key, counter);
        }

        trace_map.insert(
            key,
            TraceRecord {
                video_url: note.url.clone(),
                video_id,
                timestamp: marker.timestamp,
                frame_url: frame_url.clone(),
                frame_path,
                platform: note.platform.clone(),
            },
        );

        let conclusion = self.conclusion_text(marker, updated);
        let mm = marker.timestamp / 60;
        let ss = marker.timestamp % 60;
        let video_link = if note.platform == "bilibili" {
            format!("{}?t={}", note.url, marker.timestamp)
        } else {
            note.url.clone()
        };

        let replacement = format!(
            "{}\n\n![关键帧 @ {:02}:{:02}]({})\n\n[查看原片 @ {:02}:{:02}]({})",
            conclusion, mm, ss, frame_url, mm, ss, video_link
        );

        // First remaining occurrence only, so a repeated mm:ss marker text is
        // substituted once per processed marker
        *updated = updated.replacen(&marker.raw, &replacement, 1);

        Ok(())
    }

    /// Build the conclusion sentence attached to a keyframe.
    fn conclusion_text(&self, marker: &Marker, updated: &str) -> String {
        let text = self.marker_pattern.replace_all(&marker.context, "");
        let text = self.bold_pattern.replace_all(&text, "$1");
        let text = self.italic_pattern.replace_all(&text, "$1");
        let text = self.heading_pattern.replace_all(&text, "");
        let mut conclusion = text.trim().to_string();

        if conclusion.chars().count() < 5 {
            if let Some(widened) = self.widened_conclusion(marker, updated) {
                conclusion = widened;
            }
        }

        if conclusion.chars().count() < 5 {
            conclusion = "上述结论".to_string();
        }

        conclusion
    }

    /// Widened lookback in the partially rewritten document when the local
    /// context yielded nothing usable.
    fn widened_conclusion(&self, marker: &Marker, updated: &str) -> Option<String> {
        let pos = updated.find(&marker.raw)?;
        if pos == 0 {
            return None;
        }

        let ws = Regex::new(r"\s+").unwrap();
        let window = tail_chars(&updated[..pos], 300);
        let collapsed = ws.replace_all(window.trim(), " ").to_string();

        let last_sentence = collapsed
            .rsplit(is_sentence_end)
            .find(|s| !s.trim().is_empty())?
            .trim()
            .to_string();

        if last_sentence.chars().count() > 100 {
            Some(format!("...{}", tail_chars(&last_sentence, 100)))
        } else {
            Some(last_sentence)
        }
    }
}
