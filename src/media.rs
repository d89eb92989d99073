use crate::config::MediaConfig;
use crate::error::{PipelineError, Result};
use crate::search::VideoReference;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Static metadata for one acquired video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioMeta {
    pub title: String,
    /// Duration in seconds; 0.0 when the probe failed
    pub duration: f64,
    pub platform: String,
    /// Stable cross-stage join key (bilibili BV id)
    pub video_id: String,
    pub cover_url: Option<String>,
    /// Populated when the video track was downloaded alongside the audio
    pub local_video_path: Option<PathBuf>,
}

/// Result of acquiring one video's media.
#[derive(Debug, Clone)]
pub struct AcquiredMedia {
    pub audio_path: PathBuf,
    pub meta: AudioMeta,
}

/// Extract the platform video id from a URL.
///
/// Only bilibili is recognized; other platforms return None and their
/// markers are skipped downstream rather than crashing the run.
pub fn extract_video_id(url: &str, platform: &str) -> Option<String> {
    if platform != "bilibili" {
        return None;
    }
    let pattern = Regex::new(r"/video/(BV[0-9A-Za-z]+|av\d+)").unwrap();
    pattern
        .captures(url)
        .map(|caps| caps.get(1).unwrap().as_str().to_string())
}

/// Locate a previously downloaded video file for `video_id`, probing the
/// data directory first and the pre-seeded fallback directory second.
pub fn locate_local_video(video_id: &str, config: &MediaConfig) -> Option<PathBuf> {
    let candidate = config.data_dir.join(format!("{}.mp4", video_id));
    if candidate.exists() {
        return Some(candidate);
    }

    let fallback = config.fallback_video_dir.join(format!("{}.mp4", video_id));
    if fallback.exists() {
        return Some(fallback);
    }

    None
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

fn parse_ffprobe_duration(json_str: &str) -> Result<f64> {
    let parsed: FfprobeOutput = serde_json::from_str(json_str)?;
    Ok(parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0))
}

/// Media acquisition adapter: downloads audio (and optionally video) with
/// yt-dlp and probes duration with ffprobe.
#[derive(Clone)]
pub struct MediaFetcher {
    config: MediaConfig,
}

impl MediaFetcher {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }

    /// Run the full acquisition for one video reference.
    pub async fn acquire(&self, video: &VideoReference) -> Result<AcquiredMedia> {
        let video_id = extract_video_id(&video.url, &video.platform).ok_or_else(|| {
            PipelineError::MediaAcquisition(format!("cannot extract video id from {}", video.url))
        })?;

        tokio::fs::create_dir_all(&self.config.data_dir).await?;

        let audio_path = self.download_audio(&video.url, &video_id).await?;

        let local_video_path = if self.config.download_video {
            match self.download_video(&video.url, &video_id).await {
                Ok(path) => Some(path),
                Err(e) => {
                    // Keyframes degrade, the note itself does not
                    tracing::warn!("Video download failed for {}: {}", video_id, e);
                    None
                }
            }
        } else {
            None
        };

        let duration = self.probe_duration(&audio_path).await.unwrap_or(0.0);

        Ok(AcquiredMedia {
            audio_path,
            meta: AudioMeta {
                title: video.title.clone(),
                duration,
                platform: video.platform.clone(),
                video_id,
                cover_url: None,
                local_video_path,
            },
        })
    }

    /// Download and extract the audio track as MP3. Cached files are reused.
    pub async fn download_audio(&self, url: &str, video_id: &str) -> Result<PathBuf> {
        let target = self.config.data_dir.join(format!("{}.mp3", video_id));
        if target.exists() {
            info!("Using cached audio file for {}", video_id);
            return Ok(target);
        }

        info!("Downloading audio for {}", video_id);
        let template = self.config.data_dir.join(format!("{}.%(ext)s", video_id));

        let output = Command::new("yt-dlp")
            .arg("--extract-audio")
            .arg("--audio-format")
            .arg("mp3")
            .arg("--audio-quality")
            .arg("0")
            .arg("--output")
            .arg(template.as_os_str())
            .arg("--no-playlist")
            .arg("--quiet")
            .arg("--no-warnings")
            .arg(url)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PipelineError::ToolNotFound("yt-dlp".to_string()),
                _ => PipelineError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::MediaAcquisition(format!(
                "yt-dlp audio download failed: {}",
                stderr
            )));
        }

        self.find_downloaded_audio(video_id)
    }

    /// Download the video track as MP4 for later keyframe extraction.
    pub async fn download_video(&self, url: &str, video_id: &str) -> Result<PathBuf> {
        let target = self.config.data_dir.join(format!("{}.mp4", video_id));
        if target.exists() {
            info!("Using cached video file for {}", video_id);
            return Ok(target);
        }

        info!("Downloading video for {}", video_id);

        let output = Command::new("yt-dlp")
            .arg("-f")
            .arg("mp4")
            .arg("--output")
            .arg(target.as_os_str())
            .arg("--no-playlist")
            .arg("--quiet")
            .arg("--no-warnings")
            .arg(url)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PipelineError::ToolNotFound("yt-dlp".to_string()),
                _ => PipelineError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::MediaAcquisition(format!(
                "yt-dlp video download failed: {}",
                stderr
            )));
        }

        if !target.exists() {
            return Err(PipelineError::MediaAcquisition(format!(
                "video file missing after download: {}",
                target.display()
            )));
        }

        Ok(target)
    }

    /// Probe media duration in seconds via ffprobe.
    pub async fn probe_duration(&self, media_path: &Path) -> Result<f64> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                &media_path.to_string_lossy(),
            ])
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PipelineError::ToolNotFound("ffprobe".to_string()),
                _ => PipelineError::Io(e),
            })?;

        if !output.status.success() {
            return Err(PipelineError::ToolFailed(format!(
                "ffprobe failed for {}",
                media_path.display()
            )));
        }

        let json_str = String::from_utf8_lossy(&output.stdout);
        let duration = parse_ffprobe_duration(&json_str)?;
        debug!("Probed duration {:.1}s for {}", duration, media_path.display());
        Ok(duration)
    }

    /// yt-dlp may leave a non-mp3 extension behind; locate whatever landed.
    fn find_downloaded_audio(&self, video_id: &str) -> Result<PathBuf> {
        for ext in &["mp3", "m4a", "opus", "webm", "ogg"] {
            let candidate = self.config.data_dir.join(format!("{}.{}", video_id, ext));
            if candidate.exists() {
                return Ok(candidate);
            }
        }

        Err(PipelineError::MediaAcquisition(format!(
            "audio file not found after download for {}",
            video_id
        )))
    }
}
