use crate::config::SearchConfig;
use crate::error::{PipelineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One ranked search hit handed to the note engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoReference {
    pub url: String,
    pub platform: String,
    pub title: String,
    pub popularity_score: f64,
}

/// Title keywords that mark low-value marketing uploads
const MARKETING_KEYWORDS: &[&str] = &[
    "拼多多", "抽奖", "纯搬运", "广告", "推广", "带货", "优惠券", "限时", "秒杀", "特价",
    "折扣", "返利",
];

/// Review-style keywords appended to the user question, one at most
const SEARCH_KEYWORDS: &[&str] = &["评测", "实拍", "选购", "推荐", "对比"];

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Rewrite a user question into a search query: drop question phrases and
/// append a single review keyword not already present.
pub fn expand_search_query(question: &str) -> String {
    let question_words = Regex::new(r"(怎么样|如何|好不好|值得买吗|推荐)").unwrap();
    let stripped = question_words.replace_all(question, "");
    let stripped = stripped.trim();

    for keyword in SEARCH_KEYWORDS {
        if !stripped.contains(keyword) {
            return format!("{} {}", stripped, keyword).trim().to_string();
        }
    }

    stripped.to_string()
}

/// Popularity score: 0.2 weight on views, 0.8 on likes, both normalized.
pub fn popularity_score(views: u64, likes: u64) -> f64 {
    let normalized_views = (views as f64 / 10_000_000.0).min(1.0);
    let normalized_likes = (likes as f64 / 1_000_000.0).min(1.0);
    normalized_views * 0.2 + normalized_likes * 0.8
}

/// Returns false for titles carrying marketing keywords.
pub fn keep_title(title: &str) -> bool {
    !MARKETING_KEYWORDS.iter().any(|kw| title.contains(kw))
}

/// Parse a duration field that may be "MM:SS", "HH:MM:SS" or bare seconds.
fn parse_duration_seconds(raw: &str) -> u64 {
    let parts: Vec<&str> = raw.split(':').collect();
    match parts.len() {
        2 => {
            let m: u64 = parts[0].parse().unwrap_or(0);
            let s: u64 = parts[1].parse().unwrap_or(0);
            m * 60 + s
        }
        3 => {
            let h: u64 = parts[0].parse().unwrap_or(0);
            let m: u64 = parts[1].parse().unwrap_or(0);
            let s: u64 = parts[2].parse().unwrap_or(0);
            h * 3600 + m * 60 + s
        }
        _ => raw.parse().unwrap_or(0),
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    code: i64,
    message: Option<String>,
    data: Option<SearchData>,
}

#[derive(Debug, Deserialize)]
struct SearchData {
    #[serde(default)]
    result: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(default)]
    bvid: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    duration: String,
    #[serde(default)]
    play: u64,
    #[serde(default)]
    like: u64,
}

/// Video search adapter over the bilibili search API.
pub struct VideoSearcher {
    config: SearchConfig,
    client: reqwest::Client,
}

impl VideoSearcher {
    pub fn new(config: SearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { config, client })
    }

    /// Search for videos answering `question`, ranked by popularity score.
    pub async fn search(&self, question: &str) -> Result<Vec<VideoReference>> {
        let query = expand_search_query(question);
        info!("Searching videos for query: {}", query);

        let url = format!(
            "{}?search_type=video&keyword={}&page=1&pagesize={}&order=totalrank",
            self.config.api_endpoint,
            urlencoding::encode(&query),
            self.config.page_size
        );

        let response = self
            .client
            .get(&url)
            .header("Referer", "https://www.bilibili.com/")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PipelineError::Search(format!(
                "search API returned {}",
                response.status()
            )));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Search(format!("malformed search response: {}", e)))?;

        if parsed.code != 0 {
            return Err(PipelineError::Search(format!(
                "search API error code {}: {}",
                parsed.code,
                parsed.message.unwrap_or_default()
            )));
        }

        let items = parsed.data.map(|d| d.result).unwrap_or_default();
        let refs = self.rank_results(items);

        if refs.is_empty() {
            warn!("No usable videos found for query: {}", query);
        } else {
            info!("Selected {} videos", refs.len());
            for (i, video) in refs.iter().enumerate() {
                debug!(
                    "  {}. {} (score {:.4}) {}",
                    i + 1,
                    video.title,
                    video.popularity_score,
                    video.url
                );
            }
        }

        Ok(refs)
    }

    /// Filter, score and keep the top `max_results` hits.
    fn rank_results(&self, items: Vec<SearchItem>) -> Vec<VideoReference> {
        let em_tags = Regex::new(r#"</?em[^>]*>"#).unwrap();

        let mut scored: Vec<VideoReference> = items
            .into_iter()
            .filter_map(|item| {
                if item.bvid.is_empty() {
                    return None;
                }

                let title = em_tags.replace_all(&item.title, "").to_string();
                if !keep_title(&title) {
                    return None;
                }

                let duration = parse_duration_seconds(&item.duration);
                if duration > 0 && duration > self.config.max_duration_seconds {
                    return None;
                }

                Some(VideoReference {
                    url: format!("https://www.bilibili.com/video/{}", item.bvid),
                    platform: "bilibili".to_string(),
                    title,
                    popularity_score: popularity_score(item.play, item.like),
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.popularity_score
                .partial_cmp(&a.popularity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(self.config.max_results);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_expand_search_query_strips_question_words() {
        let query = expand_search_query("索尼 A7M4 怎么样");
        assert_eq!(query, "索尼 A7M4 评测");
    }

    #[test]
    fn test_expand_search_query_no_duplicate_keyword() {
        let query = expand_search_query("相机评测");
        // 评测 already present, next keyword appended instead
        assert_eq!(query, "相机评测 实拍");
    }

    #[test]
    fn test_popularity_score_weights_likes() {
        let liked = popularity_score(0, 500_000);
        let viewed = popularity_score(5_000_000, 0);
        assert!(liked > viewed);
        assert!(popularity_score(u64::MAX, u64::MAX) <= 1.0);
    }

    #[test]
    fn test_marketing_filter() {
        assert!(keep_title("相机深度评测"));
        assert!(!keep_title("限时秒杀！相机优惠券"));
    }

    #[test]
    fn test_parse_duration_formats() {
        assert_eq!(parse_duration_seconds("10:30"), 630);
        assert_eq!(parse_duration_seconds("1:02:03"), 3723);
        assert_eq!(parse_duration_seconds("630"), 630);
        assert_eq!(parse_duration_seconds(""), 0);
    }

    #[test]
    fn test_rank_results_filters_and_sorts() {
        let searcher = VideoSearcher::new(Config::default().search).unwrap();

        let items = vec![
            SearchItem {
                bvid: "BV1xx".to_string(),
                title: "<em class=\"keyword\">相机</em>评测".to_string(),
                duration: "10:00".to_string(),
                play: 100_000,
                like: 90_000,
            },
            SearchItem {
                bvid: "BV2yy".to_string(),
                title: "相机广告推广".to_string(),
                duration: "5:00".to_string(),
                play: 1_000_000,
                like: 900_000,
            },
            SearchItem {
                bvid: "BV3zz".to_string(),
                title: "超长直播回放".to_string(),
                duration: "2:00:00".to_string(),
                play: 1_000_000,
                like: 900_000,
            },
            SearchItem {
                bvid: "BV4aa".to_string(),
                title: "实拍对比".to_string(),
                duration: "8:00".to_string(),
                play: 2_000_000,
                like: 500_000,
            },
        ];

        let refs = searcher.rank_results(items);
        assert_eq!(refs.len(), 2);
        // BV4aa scores higher than BV1xx; marketing and over-length hits dropped
        assert_eq!(refs[0].url, "https://www.bilibili.com/video/BV4aa");
        assert_eq!(refs[1].title, "相机评测");
    }
}
