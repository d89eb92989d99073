use crate::config::TranscriptionConfig;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// One timed span of transcribed speech.
///
/// Segments arrive ordered with non-decreasing start times from the
/// transcriber; this is assumed downstream, not enforced here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    /// Transcribed text
    pub text: String,
}

/// Complete transcript for one video's audio track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    /// Detected language
    pub language: Option<String>,
    /// Full transcription text
    pub full_text: String,
    /// Individual segments with timestamps
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    /// Find the segment whose `[start, end]` span contains `seconds`.
    pub fn segment_containing(&self, seconds: u64) -> Option<&TranscriptSegment> {
        let t = seconds as f64;
        self.segments
            .iter()
            .find(|seg| seg.start <= t && t <= seg.end)
    }
}

/// Transcription adapter for OpenAI/Groq-compatible audio endpoints
pub struct Transcriber {
    config: TranscriptionConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct VerboseJsonResponse {
    language: Option<String>,
    #[allow(dead_code)]
    text: Option<String>,
    #[serde(default)]
    segments: Vec<VerboseJsonSegment>,
}

#[derive(Debug, Deserialize)]
struct VerboseJsonSegment {
    start: f64,
    end: f64,
    text: String,
}

impl Transcriber {
    pub fn new(config: TranscriptionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self { config, client })
    }

    /// Transcribe a local audio file into timed segments.
    pub async fn transcribe(&self, audio_path: &Path) -> Result<Transcript> {
        let endpoint = self.config.api_endpoint.as_ref().ok_or_else(|| {
            PipelineError::Config("transcription endpoint not configured".to_string())
        })?;

        let api_key = self.config.api_key.as_ref().ok_or_else(|| {
            PipelineError::Config("transcription API key not configured".to_string())
        })?;

        let metadata = tokio::fs::metadata(audio_path).await?;
        let upload_path = if metadata.len() > self.config.max_upload_bytes {
            info!(
                "Audio {} exceeds {} bytes, re-encoding at {}",
                audio_path.display(),
                self.config.max_upload_bytes,
                self.config.compress_bitrate
            );
            self.compress_audio(audio_path).await?
        } else {
            audio_path.to_path_buf()
        };

        let file_name = upload_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio.mp3".to_string());
        let bytes = tokio::fs::read(&upload_path).await?;

        debug!("Uploading {} bytes to {}", bytes.len(), endpoint);

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            )
            .text("model", self.config.model.clone())
            .text("response_format", "verbose_json");

        let response = self
            .client
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", api_key.trim()))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Transcription(format!(
                "API error {}: {}",
                status, text
            )));
        }

        let parsed: VerboseJsonResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Transcription(format!("malformed response: {}", e)))?;

        Ok(build_transcript(parsed))
    }

    /// Re-encode oversized audio to a lower bitrate MP3 next to the original.
    async fn compress_audio(&self, input: &Path) -> Result<PathBuf> {
        let output = input.with_extension("compressed.mp3");

        let status = Command::new("ffmpeg")
            .args([
                "-i",
                &input.to_string_lossy(),
                "-b:a",
                &self.config.compress_bitrate,
                "-y",
                "-loglevel",
                "error",
                &output.to_string_lossy(),
            ])
            .status()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PipelineError::ToolNotFound("ffmpeg".to_string()),
                _ => PipelineError::Io(e),
            })?;

        if !status.success() {
            return Err(PipelineError::ToolFailed(format!(
                "ffmpeg re-encode failed for {}",
                input.display()
            )));
        }

        Ok(output)
    }
}

fn build_transcript(parsed: VerboseJsonResponse) -> Transcript {
    let mut full_text = String::new();
    let mut segments = Vec::with_capacity(parsed.segments.len());

    for seg in parsed.segments {
        let text = seg.text.trim().to_string();
        if !full_text.is_empty() {
            full_text.push(' ');
        }
        full_text.push_str(&text);
        segments.push(TranscriptSegment {
            start: seg.start,
            end: seg.end,
            text,
        });
    }

    Transcript {
        language: parsed.language,
        full_text,
        segments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transcript() -> Transcript {
        Transcript {
            language: Some("zh".to_string()),
            full_text: "第一段 第二段".to_string(),
            segments: vec![
                TranscriptSegment {
                    start: 0.0,
                    end: 12.5,
                    text: "第一段".to_string(),
                },
                TranscriptSegment {
                    start: 12.5,
                    end: 40.0,
                    text: "第二段".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_segment_containing() {
        let transcript = sample_transcript();
        assert_eq!(transcript.segment_containing(5).unwrap().text, "第一段");
        assert_eq!(transcript.segment_containing(30).unwrap().text, "第二段");
        assert!(transcript.segment_containing(100).is_none());
    }

    #[test]
    fn test_verbose_json_parsing() {
        let body = r#"{
            "language": "zh",
            "text": "ignored, rebuilt from segments",
            "segments": [
                {"start": 0.0, "end": 3.2, "text": " 你好 "},
                {"start": 3.2, "end": 7.8, "text": "世界"}
            ]
        }"#;

        let parsed: VerboseJsonResponse = serde_json::from_str(body).unwrap();
        let transcript = build_transcript(parsed);

        assert_eq!(transcript.language.as_deref(), Some("zh"));
        assert_eq!(transcript.full_text, "你好 世界");
        assert_eq!(transcript.segments.len(), 2);
        assert_eq!(transcript.segments[0].text, "你好");
    }

    #[test]
    fn test_verbose_json_without_segments() {
        let body = r#"{"language": "en", "text": "hi"}"#;
        let parsed: VerboseJsonResponse = serde_json::from_str(body).unwrap();
        let transcript = build_transcript(parsed);
        assert!(transcript.segments.is_empty());
        assert!(transcript.full_text.is_empty());
    }
}
