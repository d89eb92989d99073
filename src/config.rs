use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the evinote pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Video search settings
    pub search: SearchConfig,

    /// Media download settings
    pub media: MediaConfig,

    /// Transcription service settings
    pub transcription: TranscriptionConfig,

    /// LLM settings (note synthesis, fusion, chat)
    pub llm: LlmConfig,

    /// Summary deduplication thresholds
    pub dedup: DedupConfig,

    /// Evidence trace / keyframe settings
    pub trace: TraceConfig,

    /// Performance and resource settings
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Search API endpoint
    pub api_endpoint: String,

    /// Maximum number of videos to hand to the note engine
    pub max_results: usize,

    /// Results per search page requested from the API
    pub page_size: usize,

    /// Videos longer than this are filtered out (seconds)
    pub max_duration_seconds: u64,

    /// HTTP request timeout in seconds
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Directory where downloaded media lands
    pub data_dir: PathBuf,

    /// Secondary directory probed for pre-seeded video files
    pub fallback_video_dir: PathBuf,

    /// Also download the video track so the trace engine can cut keyframes
    pub download_video: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// OpenAI-compatible transcription endpoint (audio/transcriptions)
    pub api_endpoint: Option<String>,

    /// API key for the transcription service
    pub api_key: Option<String>,

    /// Transcription model
    pub model: String,

    /// Uploads above this size get re-encoded to a lower bitrate first
    pub max_upload_bytes: u64,

    /// Target audio bitrate for the oversized-upload re-encode
    pub compress_bitrate: String,

    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions endpoint
    pub endpoint: Option<String>,

    /// API key
    pub api_key: Option<String>,

    /// Default model name
    pub model: String,

    /// Default provider id
    pub provider_id: String,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Request timeout in seconds
    pub timeout_seconds: u64,

    /// Prompt template overrides
    pub prompts: PromptConfig,
}

/// Locations of prompt override files. When a file is absent the built-in
/// template is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Base directory for prompt files
    pub prompt_dir: PathBuf,

    /// Per-video note synthesis prompt file
    pub synthesis_file: String,

    /// Multi-note fusion prompt file
    pub fusion_file: String,

    /// Follow-up chat system prompt file
    pub chat_file: String,
}

/// Similarity thresholds for the summary deduplication pass.
///
/// The defaults are inherited heuristics with no stated derivation; they are
/// configuration rather than constants so deployments can adjust them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Length-ratio threshold for paragraph containment dedup
    pub paragraph_similarity: f64,

    /// Length-ratio threshold for single-line containment dedup
    pub line_similarity: f64,

    /// Jaccard character-set threshold for single-line dedup
    pub line_jaccard: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Directory where extracted keyframes are written
    pub frame_output_dir: PathBuf,

    /// Public URL prefix mapped onto `frame_output_dir`
    pub frame_base_url: String,

    /// Origin prepended to `frame_base_url` when building absolute URLs
    pub public_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Hard cap on concurrent note-generation workers
    pub max_workers: usize,
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        let config_paths = [
            "evinote.toml",
            "config/evinote.toml",
            "~/.config/evinote/config.toml",
            "/etc/evinote/config.toml",
        ];

        for path in &config_paths {
            if let Ok(config_str) = std::fs::read_to_string(path) {
                match toml::from_str(&config_str) {
                    Ok(config) => {
                        tracing::info!("Loaded configuration from: {}", path);
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse config file {}: {}", path, e);
                    }
                }
            }
        }

        // Try environment variables
        if let Ok(config) = Self::from_env() {
            return Ok(config);
        }

        Err(PipelineError::Config(
            "no configuration file found".to_string(),
        ))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(workers) = std::env::var("EVINOTE_WORKERS") {
            config.performance.max_workers = workers.parse().unwrap_or(5);
        }

        if let Ok(api_key) = std::env::var("EVINOTE_LLM_API_KEY") {
            config.llm.api_key = Some(api_key);
        }

        if let Ok(endpoint) = std::env::var("EVINOTE_LLM_ENDPOINT") {
            config.llm.endpoint = Some(endpoint);
        }

        if let Ok(model) = std::env::var("EVINOTE_LLM_MODEL") {
            config.llm.model = model;
        }

        if let Ok(api_key) = std::env::var("EVINOTE_TRANSCRIBER_API_KEY") {
            config.transcription.api_key = Some(api_key);
        }

        if let Ok(endpoint) = std::env::var("EVINOTE_TRANSCRIBER_ENDPOINT") {
            config.transcription.api_endpoint = Some(endpoint);
        }

        if let Ok(data_dir) = std::env::var("EVINOTE_DATA_DIR") {
            config.media.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(out_dir) = std::env::var("EVINOTE_FRAME_DIR") {
            config.trace.frame_output_dir = PathBuf::from(out_dir);
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &str) -> Result<()> {
        let config_str = toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, config_str)?;
        tracing::info!("Configuration saved to: {}", path);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.performance.max_workers == 0 {
            return Err(PipelineError::Config(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.search.max_results == 0 {
            return Err(PipelineError::Config(
                "search.max_results must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.dedup.paragraph_similarity)
            || !(0.0..=1.0).contains(&self.dedup.line_similarity)
            || !(0.0..=1.0).contains(&self.dedup.line_jaccard)
        {
            return Err(PipelineError::Config(
                "dedup thresholds must be within 0.0..=1.0".to_string(),
            ));
        }

        if self.llm.endpoint.is_none() {
            return Err(PipelineError::Config("llm.endpoint is required".to_string()));
        }

        if !self.media.data_dir.exists() {
            if let Err(e) = std::fs::create_dir_all(&self.media.data_dir) {
                return Err(PipelineError::Config(format!(
                    "cannot create data directory: {}",
                    e
                )));
            }
        }

        Ok(())
    }
}

impl PromptConfig {
    /// Load prompt content from a specific file under the prompt directory
    pub async fn load_prompt(&self, filename: &str) -> Result<String> {
        let path = self.prompt_dir.join(filename);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content.trim().to_string()),
            Err(e) => Err(PipelineError::Config(format!(
                "failed to load prompt from {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            search: SearchConfig {
                api_endpoint: "https://api.bilibili.com/x/web-interface/search/type".to_string(),
                max_results: 5,
                page_size: 50,
                max_duration_seconds: 1400,
                request_timeout_seconds: 15,
            },
            media: MediaConfig {
                data_dir: PathBuf::from("./data"),
                fallback_video_dir: PathBuf::from("./demos"),
                download_video: true,
            },
            transcription: TranscriptionConfig {
                api_endpoint: Some(
                    "https://api.groq.com/openai/v1/audio/transcriptions".to_string(),
                ),
                api_key: None,
                model: "whisper-large-v3".to_string(),
                max_upload_bytes: 18 * 1024 * 1024,
                compress_bitrate: "64k".to_string(),
                timeout_seconds: 600,
            },
            llm: LlmConfig {
                endpoint: Some("https://api.openai.com/v1/chat/completions".to_string()),
                api_key: None,
                model: "gpt-4o-mini".to_string(),
                provider_id: "openai".to_string(),
                max_tokens: 8192,
                temperature: 0.7,
                timeout_seconds: 120,
                prompts: PromptConfig {
                    prompt_dir: PathBuf::from("config/prompts"),
                    synthesis_file: "synthesis.txt".to_string(),
                    fusion_file: "fusion.txt".to_string(),
                    chat_file: "chat.txt".to_string(),
                },
            },
            dedup: DedupConfig {
                paragraph_similarity: 0.9,
                line_similarity: 0.85,
                line_jaccard: 0.85,
            },
            trace: TraceConfig {
                frame_output_dir: PathBuf::from("./static/screenshots"),
                frame_base_url: "/static/screenshots".to_string(),
                public_base_url: "http://localhost:8483".to_string(),
            },
            performance: PerformanceConfig { max_workers: 5 },
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Config::default().dedup
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.performance.max_workers = workers;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.config.search.max_results = max_results;
        self
    }

    pub fn with_llm_endpoint(mut self, endpoint: String) -> Self {
        self.config.llm.endpoint = Some(endpoint);
        self
    }

    pub fn with_llm_api_key(mut self, api_key: String) -> Self {
        self.config.llm.api_key = Some(api_key);
        self
    }

    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.config.media.data_dir = dir;
        self
    }

    pub fn with_frame_output_dir(mut self, dir: PathBuf) -> Self {
        self.config.trace.frame_output_dir = dir;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
