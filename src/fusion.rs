use crate::error::{PipelineError, Result};
use crate::llm::{ChatMessage, Llm, LlmRegistry, ModelSelector};
use crate::notes::NoteResult;
use crate::prompts::{self, Prompts};
use crate::state::{ChatRole, ChatTurn};
use std::sync::Arc;
use tracing::{debug, info};

/// Fallback answer when the whole batch produced nothing to fuse.
pub const EMPTY_BATCH_ANSWER: &str = "没有可用的笔记内容进行总结";

/// Maximum transcript excerpts included per video in the fusion prompt.
const EXCERPTS_PER_VIDEO: usize = 3;

/// Chars compared when deciding whether a history turn repeats the summary
/// already carried in the system prompt.
const SUMMARY_PREFIX_CHARS: usize = 500;

/// Fuses per-video notes into one cross-video answer and handles follow-up
/// questions against a prior answer.
pub struct FusionEngine {
    registry: Arc<LlmRegistry>,
    prompts: Prompts,
}

impl FusionEngine {
    pub fn new(registry: Arc<LlmRegistry>, prompts: Prompts) -> Self {
        Self { registry, prompts }
    }

    /// Fuse all notes of a batch into one answer to `question`.
    pub async fn fuse(
        &self,
        question: &str,
        notes: &[NoteResult],
        selector: &ModelSelector,
    ) -> Result<String> {
        if notes.is_empty() {
            info!("No notes to fuse, returning fallback answer");
            return Ok(EMPTY_BATCH_ANSWER.to_string());
        }

        let llm = self.registry.client(selector)?;
        fuse_notes(llm.as_ref(), &self.prompts, question, notes).await
    }

    /// Answer a follow-up question in the context of a prior fused answer.
    pub async fn chat(
        &self,
        question: &str,
        history: &[ChatTurn],
        prior_answer: &str,
        selector: &ModelSelector,
    ) -> Result<String> {
        let llm = self.registry.client(selector)?;
        chat_followup(llm.as_ref(), &self.prompts, question, history, prior_answer).await
    }
}

async fn fuse_notes(
    llm: &dyn Llm,
    prompts: &Prompts,
    question: &str,
    notes: &[NoteResult],
) -> Result<String> {
    let notes_text = render_notes(notes);
    debug!(
        "Fusing {} notes ({} chars of context)",
        notes.len(),
        notes_text.len()
    );

    let messages = vec![
        ChatMessage::system(prompts.fusion.clone()),
        ChatMessage::user(prompts::fusion_user_prompt(
            question,
            notes.len(),
            &notes_text,
        )),
    ];

    let response = llm.chat(messages).await?;
    if response.content.trim().is_empty() {
        return Err(PipelineError::Synthesis(
            "fusion model returned empty content".to_string(),
        ));
    }

    info!(
        "Fused answer generated ({} chars, {:?} tokens)",
        response.content.len(),
        response.tokens_used
    );
    Ok(response.content)
}

async fn chat_followup(
    llm: &dyn Llm,
    prompts: &Prompts,
    question: &str,
    history: &[ChatTurn],
    prior_answer: &str,
) -> Result<String> {
    let mut messages = vec![ChatMessage::system(prompts.chat_system(prior_answer))];

    // The first assistant turn is usually the fused answer itself, already
    // carried by the system prompt; drop it rather than feed it twice.
    let mut skipped_summary = false;
    for turn in history {
        if !skipped_summary
            && turn.role == ChatRole::Assistant
            && char_prefix(&turn.content, SUMMARY_PREFIX_CHARS)
                == char_prefix(prior_answer, SUMMARY_PREFIX_CHARS)
        {
            skipped_summary = true;
            continue;
        }
        messages.push(match turn.role {
            ChatRole::User => ChatMessage::user(turn.content.clone()),
            ChatRole::Assistant => ChatMessage::assistant(turn.content.clone()),
        });
    }

    messages.push(ChatMessage::user(question.to_string()));

    let response = llm.chat(messages).await?;
    if response.content.trim().is_empty() {
        return Err(PipelineError::Llm(
            "chat model returned empty content".to_string(),
        ));
    }
    Ok(response.content)
}

fn char_prefix(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Render all notes into the fusion prompt body: numbered sections with the
/// note markdown plus a few timestamped transcript excerpts per video, so
/// the model has raw wording to anchor evidence markers on.
fn render_notes(notes: &[NoteResult]) -> String {
    let mut out = String::new();

    for (i, note) in notes.iter().enumerate() {
        out.push_str(&format!("## 视频 {}: {}\n", i + 1, note.title));
        out.push_str(&format!("来源: {}\n\n", note.url));
        out.push_str(&note.markdown);
        out.push('\n');

        let excerpts = pick_excerpts(note);
        if !excerpts.is_empty() {
            out.push_str("\n### 转写摘录\n");
            for (start, text) in excerpts {
                let secs = start as u64;
                out.push_str(&format!("[{:02}:{:02}] {}\n", secs / 60, secs % 60, text));
            }
        }
        out.push('\n');
    }

    out
}

/// Up to three evenly spaced segments per video: first, middle, last.
fn pick_excerpts(note: &NoteResult) -> Vec<(f64, String)> {
    let segments = &note.transcript.segments;
    if segments.is_empty() {
        return Vec::new();
    }

    let indices: Vec<usize> = if segments.len() <= EXCERPTS_PER_VIDEO {
        (0..segments.len()).collect()
    } else {
        vec![0, segments.len() / 2, segments.len() - 1]
    };

    indices
        .into_iter()
        .map(|i| (segments[i].start, segments[i].text.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmResponse;
    use crate::media::AudioMeta;
    use crate::transcription::{Transcript, TranscriptSegment};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records the messages it is called with and replies with a canned
    /// answer.
    struct FakeLlm {
        reply: String,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl FakeLlm {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Llm for FakeLlm {
        async fn chat(&self, messages: Vec<ChatMessage>) -> Result<LlmResponse> {
            self.seen.lock().unwrap().push(messages);
            Ok(LlmResponse {
                content: self.reply.clone(),
                tokens_used: Some(42),
            })
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn note_with_segments(title: &str, count: usize) -> NoteResult {
        let segments = (0..count)
            .map(|i| TranscriptSegment {
                start: i as f64 * 10.0,
                end: i as f64 * 10.0 + 10.0,
                text: format!("片段{}", i),
            })
            .collect();
        NoteResult {
            url: "https://www.bilibili.com/video/BVx".to_string(),
            platform: "bilibili".to_string(),
            title: title.to_string(),
            markdown: format!("# {}\n\n要点若干。", title),
            transcript: Transcript {
                language: Some("zh".to_string()),
                full_text: "内容".to_string(),
                segments,
            },
            audio_meta: AudioMeta {
                title: title.to_string(),
                duration: count as f64 * 10.0,
                platform: "bilibili".to_string(),
                video_id: "BVx".to_string(),
                cover_url: None,
                local_video_path: None,
            },
        }
    }

    #[test]
    fn test_render_notes_numbers_sections() {
        let notes = vec![note_with_segments("相机评测", 2), note_with_segments("对比视频", 2)];
        let rendered = render_notes(&notes);

        assert!(rendered.contains("## 视频 1: 相机评测"));
        assert!(rendered.contains("## 视频 2: 对比视频"));
        assert!(rendered.contains("来源: https://www.bilibili.com/video/BVx"));
        assert!(rendered.contains("[00:00] 片段0"));
    }

    #[test]
    fn test_pick_excerpts_evenly_spaced() {
        let note = note_with_segments("长视频", 10);
        let excerpts = pick_excerpts(&note);

        assert_eq!(excerpts.len(), 3);
        assert_eq!(excerpts[0].0, 0.0);
        assert_eq!(excerpts[1].0, 50.0);
        assert_eq!(excerpts[2].0, 90.0);

        let short = note_with_segments("短视频", 2);
        assert_eq!(pick_excerpts(&short).len(), 2);
    }

    #[tokio::test]
    async fn test_fuse_notes_builds_prompt() {
        let llm = FakeLlm::new("融合后的回答 *Content-[00:30]-video1");
        let prompts = Prompts::default();
        let notes = vec![note_with_segments("评测甲", 3)];

        let answer = fuse_notes(&llm, &prompts, "这款相机怎么样", &notes)
            .await
            .unwrap();
        assert!(answer.contains("融合后的回答"));

        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0].role, "system");
        assert!(seen[0][1].content.contains("这款相机怎么样"));
        assert!(seen[0][1].content.contains("1 个视频"));
    }

    #[tokio::test]
    async fn test_fuse_rejects_empty_reply() {
        let llm = FakeLlm::new("   ");
        let prompts = Prompts::default();
        let notes = vec![note_with_segments("评测甲", 1)];

        let err = fuse_notes(&llm, &prompts, "问题", &notes).await.unwrap_err();
        assert!(matches!(err, PipelineError::Synthesis(_)));
    }

    #[tokio::test]
    async fn test_chat_skips_repeated_summary_turn() {
        let llm = FakeLlm::new("追问的回答");
        let prompts = Prompts::default();
        let prior = "这是先前的视频总结内容。";
        let history = vec![
            ChatTurn {
                role: ChatRole::User,
                content: "这款相机怎么样".to_string(),
            },
            ChatTurn {
                role: ChatRole::Assistant,
                content: prior.to_string(),
            },
            ChatTurn {
                role: ChatRole::User,
                content: "续航呢".to_string(),
            },
            ChatTurn {
                role: ChatRole::Assistant,
                content: "续航一般。".to_string(),
            },
        ];

        let answer = chat_followup(&llm, &prompts, "防抖呢", &history, prior)
            .await
            .unwrap();
        assert_eq!(answer, "追问的回答");

        let seen = llm.seen.lock().unwrap();
        let messages = &seen[0];
        // system + 3 history turns (summary dropped) + question
        assert_eq!(messages.len(), 5);
        assert!(messages[0].content.contains(prior));
        assert!(!messages.iter().skip(1).any(|m| m.content == prior));
        assert_eq!(messages.last().unwrap().content, "防抖呢");
    }
}
