use crate::config::PromptConfig;

/// Built-in system prompt for per-video note synthesis.
const SYNTHESIS_SYSTEM_PROMPT: &str = r#"你是一名专业的视频内容笔记员。根据提供的视频转写内容，整理出一份结构化的 Markdown 笔记。
要求：
1. 使用清晰的标题层级组织内容，提炼视频的核心观点与结论。
2. 每当写下一个可以追溯到原视频的结论时，在结论句末尾紧跟时间戳标记，格式为 Content-[mm:ss]，mm:ss 为该结论在视频中出现的时间。
3. 只记录视频中实际出现的内容，不要补充外部信息。"#;

/// Built-in system prompt for multi-note fusion.
const FUSION_SYSTEM_PROMPT: &str = r#"你是一名跨视频信息整合助手。用户提供了多个视频的笔记，请围绕用户的问题生成一份综合回答。
要求：
1. 综合多个视频的观点，指出共识与分歧，直接回答用户的问题。
2. 每个关键结论后紧跟时间戳标记：*Content-[mm:ss]-video{k}，k 为该结论来源视频的编号（从 1 开始）。
3. 不要重复相同的结论；内容使用 Markdown 组织。"#;

/// Built-in system prompt template for follow-up chat turns.
/// `{previous_summary}` is replaced with the prior fused answer.
const CHAT_SYSTEM_PROMPT: &str = r#"你是一名视频内容问答助手。以下是此前根据多个视频生成的总结，请基于它回答用户的后续问题。回答要简洁、直接，不要重复整段总结。

=== 此前的视频总结 ===
{previous_summary}
=== 总结结束 ==="#;

/// Resolved prompt set: file overrides when present, built-ins otherwise.
#[derive(Debug, Clone)]
pub struct Prompts {
    pub synthesis: String,
    pub fusion: String,
    pub chat: String,
}

impl Prompts {
    /// Load prompts, falling back to the built-in templates per file.
    pub async fn load(config: &PromptConfig) -> Self {
        Self {
            synthesis: config
                .load_prompt(&config.synthesis_file)
                .await
                .unwrap_or_else(|_| SYNTHESIS_SYSTEM_PROMPT.to_string()),
            fusion: config
                .load_prompt(&config.fusion_file)
                .await
                .unwrap_or_else(|_| FUSION_SYSTEM_PROMPT.to_string()),
            chat: config
                .load_prompt(&config.chat_file)
                .await
                .unwrap_or_else(|_| CHAT_SYSTEM_PROMPT.to_string()),
        }
    }

    /// Chat system prompt with the prior fused answer substituted in.
    pub fn chat_system(&self, previous_summary: &str) -> String {
        self.chat.replace("{previous_summary}", previous_summary)
    }
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            synthesis: SYNTHESIS_SYSTEM_PROMPT.to_string(),
            fusion: FUSION_SYSTEM_PROMPT.to_string(),
            chat: CHAT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// User prompt for synthesizing one video's note.
pub fn synthesis_user_prompt(title: &str, transcript_text: &str) -> String {
    format!("视频标题：{}\n\n视频转写内容：\n{}", title, transcript_text)
}

/// User prompt for fusing all notes into one answer.
pub fn fusion_user_prompt(question: &str, note_count: usize, notes_text: &str) -> String {
    format!(
        "用户问题：{}\n\n以下是 {} 个视频的笔记内容：\n{}",
        question, note_count, notes_text
    )
}
