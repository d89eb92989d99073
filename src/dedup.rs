use crate::config::DedupConfig;
use regex::Regex;
use std::collections::HashSet;

/// Paragraphs shorter than this (normalized chars) are never deduplicated.
const MIN_PARAGRAPH_LEN: usize = 20;

/// Lines shorter than this are treated as formatting and always kept.
const MIN_LINE_LEN: usize = 5;

/// Lines must be at least this long to be recorded for later comparisons.
const RECORD_LINE_LEN: usize = 10;

/// Removes redundant headings, paragraphs and lines the fusion step tends to
/// introduce when several notes legitimately overlap. A single left-to-right
/// pass: the first occurrence of anything always survives, later repeats are
/// dropped. Structurally distinct content is never removed.
pub struct DedupEngine {
    config: DedupConfig,
    marker_pattern: Regex,
    keep_pattern: Regex,
    heading_pattern: Regex,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            marker_pattern: Regex::new(r"\*?Content-\[\d{2}:\d{2}\](?:-video\d+)?").unwrap(),
            keep_pattern: Regex::new(r"[\w\p{Han}]+").unwrap(),
            heading_pattern: Regex::new(r"^(#{1,6})\s+(.*)$").unwrap(),
        }
    }

    /// Normalize text for comparison: strip evidence markers, keep only word
    /// characters and CJK ideographs, lowercase.
    fn normalize(&self, text: &str) -> String {
        let stripped = self.marker_pattern.replace_all(text, "");
        self.keep_pattern
            .find_iter(&stripped)
            .map(|m| m.as_str())
            .collect::<String>()
            .to_lowercase()
    }

    /// Length-ratio similarity of two normalized strings: shorter / longer.
    fn length_ratio(a: &str, b: &str) -> f64 {
        let (la, lb) = (a.chars().count(), b.chars().count());
        if la == 0 || lb == 0 {
            return 0.0;
        }
        la.min(lb) as f64 / la.max(lb) as f64
    }

    /// Jaccard overlap of the two strings' character sets.
    fn jaccard(a: &str, b: &str) -> f64 {
        let sa: HashSet<char> = a.chars().collect();
        let sb: HashSet<char> = b.chars().collect();
        if sa.is_empty() && sb.is_empty() {
            return 0.0;
        }
        let intersection = sa.intersection(&sb).count();
        let union = sa.union(&sb).count();
        intersection as f64 / union as f64
    }

    fn is_duplicate_paragraph(&self, norm: &str, seen: &[String]) -> bool {
        seen.iter().any(|prev| {
            if prev == norm {
                return true;
            }
            (prev.contains(norm) || norm.contains(prev))
                && Self::length_ratio(prev, norm) > self.config.paragraph_similarity
        })
    }

    fn is_duplicate_line(&self, norm: &str, seen: &[String]) -> bool {
        seen.iter().any(|prev| {
            if prev == norm {
                return true;
            }
            if prev.contains(norm) || norm.contains(prev) {
                Self::length_ratio(prev, norm) > self.config.line_similarity
            } else {
                Self::jaccard(prev, norm) > self.config.line_jaccard
            }
        })
    }

    /// Emit buffered blank lines ahead of a kept block, collapsing 4+ to 2.
    fn flush_blanks(output: &mut Vec<String>, pending: &mut usize) {
        let emit = if *pending >= 4 { 2 } else { *pending };
        for _ in 0..emit {
            output.push(String::new());
        }
        *pending = 0;
    }

    /// Deduplicate a fused Markdown answer. Pure transform; the output never
    /// has more lines than the input and a second application is a no-op.
    pub fn dedup(&self, markdown: &str) -> String {
        let lines: Vec<&str> = markdown.lines().collect();
        let mut output: Vec<String> = Vec::with_capacity(lines.len());

        let mut seen_headings: HashSet<String> = HashSet::new();
        let mut seen_paragraphs: Vec<String> = Vec::new();
        let mut seen_lines: Vec<String> = Vec::new();

        // While Some(level), lines are inside a dropped heading's section
        let mut skip_level: Option<usize> = None;

        // Blank runs are buffered, not emitted on sight: when the block
        // between two runs is dropped, both runs count as one run on this
        // pass, exactly as a rescan of the output would see them. Blanks
        // left pending at the end go with the final newline.
        let mut pending_blanks = 0usize;

        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];

            if line.trim().is_empty() {
                let start = i;
                while i < lines.len() && lines[i].trim().is_empty() {
                    i += 1;
                }
                if skip_level.is_none() {
                    pending_blanks += i - start;
                }
                continue;
            }

            if let Some(caps) = self.heading_pattern.captures(line) {
                let level = caps.get(1).unwrap().as_str().len();
                let text = caps.get(2).unwrap().as_str();

                if let Some(dropped_level) = skip_level {
                    if level > dropped_level {
                        // Nested under the dropped heading
                        i += 1;
                        continue;
                    }
                    skip_level = None;
                }

                let norm = self.normalize(text);
                if seen_headings.contains(&norm) {
                    skip_level = Some(level);
                } else {
                    seen_headings.insert(norm);
                    Self::flush_blanks(&mut output, &mut pending_blanks);
                    output.push(line.to_string());
                }
                i += 1;
                continue;
            }

            // Paragraph: maximal run of non-blank, non-heading lines
            let start = i;
            while i < lines.len()
                && !lines[i].trim().is_empty()
                && !self.heading_pattern.is_match(lines[i])
            {
                i += 1;
            }

            if skip_level.is_some() {
                continue;
            }

            let run = &lines[start..i];
            if run.len() == 1 {
                let norm = self.normalize(run[0]);
                let len = norm.chars().count();
                if len < MIN_LINE_LEN {
                    Self::flush_blanks(&mut output, &mut pending_blanks);
                    output.push(run[0].to_string());
                } else if !self.is_duplicate_line(&norm, &seen_lines) {
                    if len >= RECORD_LINE_LEN {
                        seen_lines.push(norm);
                    }
                    Self::flush_blanks(&mut output, &mut pending_blanks);
                    output.push(run[0].to_string());
                }
            } else {
                let norm = self.normalize(&run.join(" "));
                if norm.chars().count() < MIN_PARAGRAPH_LEN {
                    Self::flush_blanks(&mut output, &mut pending_blanks);
                    for l in run {
                        output.push(l.to_string());
                    }
                } else if !self.is_duplicate_paragraph(&norm, &seen_paragraphs) {
                    seen_paragraphs.push(norm);
                    Self::flush_blanks(&mut output, &mut pending_blanks);
                    for l in run {
                        output.push(l.to_string());
                    }
                }
            }
        }

        output.join("\n")
    }
}

impl Default for DedupEngine {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DedupEngine {
        DedupEngine::default()
    }

    #[test]
    fn test_normalize_strips_markers_and_punctuation() {
        let e = engine();
        assert_eq!(
            e.normalize("画质表现出色！*Content-[02:15]-video1 （实测）"),
            "画质表现出色实测"
        );
        assert_eq!(e.normalize("**Great Low-Light!**"), "greatlowlight");
    }

    #[test]
    fn test_duplicate_heading_section_removed() {
        let input = "## 价格\n\n这款相机的定价是一万五千元左右，性价比在同级别里属于中上水平。\n\n## 画质\n\n画质优秀。\n\n## 价格\n\n这款相机的定价是一万五千元左右，性价比在同级别里属于中上水平。\n";
        let out = engine().dedup(input);

        assert_eq!(out.matches("## 价格").count(), 1);
        assert_eq!(out.matches("定价是一万五千元").count(), 1);
        assert!(out.contains("## 画质"));
    }

    #[test]
    fn test_dropped_section_takes_nested_headings_with_it() {
        let input = "## 对比\n\n### 优点\n\n细节甲\n\n## 总结\n\n结束\n\n## 对比\n\n### 缺点\n\n细节乙\n";
        let out = engine().dedup(input);

        assert_eq!(out.matches("## 对比").count(), 1);
        // The nested heading of the dropped repeat goes with it
        assert!(!out.contains("### 缺点"));
        assert!(!out.contains("细节乙"));
        assert!(out.contains("## 总结"));
    }

    #[test]
    fn test_equal_level_heading_ends_skip() {
        let input = "## A\n\n内容一\n\n## A\n\n被丢弃的内容\n\n## B\n\n内容二\n";
        let out = engine().dedup(input);
        assert!(out.contains("## B"));
        assert!(out.contains("内容二"));
        assert!(!out.contains("被丢弃的内容"));
    }

    #[test]
    fn test_exact_duplicate_paragraph_removed() {
        let para = "两个视频都认为这款镜头的对焦速度非常出色，值得购买。\n同时弱光表现也令人满意，噪点控制良好。";
        let input = format!("{}\n\n中间其他内容demo\n\n{}\n", para, para);
        let out = engine().dedup(&input);
        assert_eq!(out.matches("对焦速度非常出色").count(), 1);
    }

    #[test]
    fn test_short_paragraph_never_deduplicated() {
        let input = "---\n\n---\n\n---\n";
        let out = engine().dedup(input);
        assert_eq!(out.matches("---").count(), 3);
    }

    #[test]
    fn test_near_identical_line_removed() {
        let input = "这款相机的视频防抖效果表现非常出色稳定\n\n其他无关内容在这里占位\n\n这款相机的视频防抖效果表现非常出色稳\n";
        let out = engine().dedup(input);
        assert_eq!(out.matches("视频防抖效果").count(), 1);
    }

    #[test]
    fn test_distinct_lines_kept() {
        let input = "第一个视频重点评测了画质表现\n\n第二个视频重点评测了续航和散热\n";
        let out = engine().dedup(input);
        assert!(out.contains("画质表现"));
        assert!(out.contains("续航和散热"));
    }

    #[test]
    fn test_blank_lines_collapse() {
        let input = "甲\n\n\n\n\n\n乙";
        let out = engine().dedup(input);
        assert_eq!(out, "甲\n\n\n乙");

        let short = "甲\n\n乙";
        assert_eq!(engine().dedup(short), "甲\n\n乙");

        // Trailing blanks go with the final newline
        assert_eq!(engine().dedup("甲\n\n\n"), "甲");
    }

    #[test]
    fn test_blank_runs_merged_by_dropped_line_collapse_in_one_pass() {
        // The duplicate sits between two blank runs; dropping it joins the
        // runs, which must still end up collapsed on the same pass
        let input = "这款相机的对焦非常快速而且精准\n\n\n这款相机的对焦非常快速而且精准\n\n\n结尾的内容也足够长可以保留";
        let e = engine();

        let once = e.dedup(input);
        assert_eq!(once, "这款相机的对焦非常快速而且精准\n\n\n结尾的内容也足够长可以保留");
        assert_eq!(e.dedup(&once), once);
    }

    #[test]
    fn test_idempotent() {
        let input = "## 价格\n\n价格合理，适合预算有限的摄影爱好者入手这款设备。\n\n## 价格\n\n价格合理，适合预算有限的摄影爱好者入手这款设备。\n\n## 其他\n\n短行\n";
        let e = engine();
        let once = e.dedup(input);
        let twice = e.dedup(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_line_count_never_grows() {
        let inputs = [
            "a\nb\nc",
            "## H\n\n\n\n\n\ntext",
            "重复的一整段比较长的中文内容出现了两次\n重复的一整段比较长的中文内容出现了两次",
        ];
        let e = engine();
        for input in inputs {
            let out = e.dedup(input);
            assert!(out.lines().count() <= input.lines().count());
        }
    }

    #[test]
    fn test_markers_ignored_in_comparison() {
        let input = "对焦性能紧追旗舰机型的水准表现 *Content-[01:30]-video1\n\n占位内容用于隔开两行文字\n\n对焦性能紧追旗舰机型的水准表现 *Content-[05:42]-video2\n";
        let out = engine().dedup(input);
        // Same conclusion with different markers is still a duplicate
        assert_eq!(out.matches("对焦性能").count(), 1);
    }
}
