//! LLM-written file and folder summaries.
//!
//! Summaries are best-effort: a provider failure produces a fixed fallback
//! text instead of an error.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;
use sift_llm::{ChatOptions, LlmProvider, Message};

use crate::fragment::{Fragment, FragmentLevel};

const SUMMARY_TEMPERATURE: f32 = 0.3;
/// Purpose used when a folder summary cannot be generated.
pub const FOLDER_FALLBACK: &str = "Multiple code files";
/// Folder name reported for files at the repository root.
pub const ROOT_FOLDER: &str = ".";

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FileSummary {
    /// One to two sentences on the purpose and key components of the file.
    pub summary: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FolderSummary {
    /// One sentence on the purpose of the folder.
    pub purpose: String,
}

#[derive(Debug, Clone)]
pub struct SummaryConfig {
    /// Files at or below this many characters are not summarized (default: 100).
    pub min_chars: usize,
    /// Characters of the file sent to the model (default: 3500).
    pub input_chars: usize,
    /// File summaries shown per folder prompt (default: 8).
    pub folder_files: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            min_chars: 100,
            input_chars: 3500,
            folder_files: 8,
        }
    }
}

pub struct Summarizer<P> {
    provider: Arc<P>,
    config: SummaryConfig,
}

impl<P: LlmProvider> Summarizer<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, config: SummaryConfig) -> Self {
        Self { provider, config }
    }

    /// Summarize one code file. Returns `None` for files too short to be worth it.
    pub async fn summarize_file(&self, path: &str, code: &str) -> Option<Fragment> {
        if code.chars().count() <= self.config.min_chars {
            return None;
        }
        let ext = Path::new(path)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let prompt = format!(
            "Summarize this {ext} file in 1-2 sentences based on the code provided.\n\n\
             Focus on: main purpose, key functions/classes, and specific technologies or \
             patterns you can identify.\nBe factual - only describe what you actually see in \
             the code.\n\n{}\n\nSummary:",
            truncate_chars(code, self.config.input_chars)
        );

        let summary = match self
            .provider
            .chat_typed::<FileSummary>(
                &[Message::user(prompt)],
                ChatOptions::with_temperature(SUMMARY_TEMPERATURE),
            )
            .await
        {
            Ok(reply) if !reply.summary.trim().is_empty() => reply.summary.trim().to_owned(),
            Ok(_) => file_fallback(path),
            Err(e) => {
                tracing::warn!(file = path, error = %e, "file summary failed, using fallback");
                file_fallback(path)
            }
        };
        Some(Fragment::file_summary(path, &summary))
    }

    /// Summarize a folder from `(path, summary)` pairs of its files.
    pub async fn summarize_folder(&self, folder: &str, files: &[(String, String)]) -> Fragment {
        if files.is_empty() {
            return Fragment::folder_summary(folder, FOLDER_FALLBACK);
        }
        let listing: Vec<String> = files
            .iter()
            .take(self.config.folder_files.max(1))
            .map(|(path, summary)| format!("- {}: {summary}", file_name(path)))
            .collect();
        let prompt = format!(
            "Summarize this folder from file overviews (1 sentence):\n\n{}\n\n\
             Provide the folder purpose.",
            listing.join("\n")
        );

        let purpose = match self
            .provider
            .chat_typed::<FolderSummary>(
                &[Message::user(prompt)],
                ChatOptions::with_temperature(SUMMARY_TEMPERATURE),
            )
            .await
        {
            Ok(reply) if !reply.purpose.trim().is_empty() => reply.purpose.trim().to_owned(),
            Ok(_) => FOLDER_FALLBACK.to_owned(),
            Err(e) => {
                tracing::warn!(folder, error = %e, "folder summary failed, using fallback");
                FOLDER_FALLBACK.to_owned()
            }
        };
        Fragment::folder_summary(folder, &purpose)
    }
}

/// Fallback text of a file summary that could not be generated.
#[must_use]
pub fn file_fallback(path: &str) -> String {
    format!("File: {} (summary unavailable)", file_name(path))
}

/// Folder owning a repo-relative path; `.` at the root.
#[must_use]
pub fn folder_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((folder, _)) if !folder.is_empty() => folder.to_owned(),
        _ => ROOT_FOLDER.to_owned(),
    }
}

/// File summaries grouped by owning folder, each group ordered by path.
#[must_use]
pub fn group_by_folder(fragments: &[Fragment]) -> BTreeMap<String, Vec<(String, String)>> {
    let mut groups: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    for fragment in fragments {
        if fragment.level() != FragmentLevel::FileSummary {
            continue;
        }
        let Some(file) = fragment.file() else {
            continue;
        };
        groups
            .entry(folder_of(file))
            .or_default()
            .push((file.to_owned(), fragment.summary_body().to_owned()));
    }
    for files in groups.values_mut() {
        files.sort();
    }
    groups
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// The first `max` characters of `s`, respecting char boundaries.
#[must_use]
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_llm::mock::MockProvider;

    fn long_code() -> String {
        "def handler(event):\n    return process(event)\n".repeat(10)
    }

    #[tokio::test]
    async fn short_files_are_not_summarized() {
        let mock = Arc::new(MockProvider::default());
        let summarizer = Summarizer::new(Arc::clone(&mock), SummaryConfig::default());
        assert!(summarizer.summarize_file("a.py", "x = 1\n").await.is_none());
        assert_eq!(mock.chat_calls(), 0);
    }

    #[tokio::test]
    async fn file_summary_uses_structured_reply() {
        let mock = Arc::new(MockProvider::with_responses(vec![
            r#"{"summary": "Routes incoming events."}"#.into(),
        ]));
        let summarizer = Summarizer::new(Arc::clone(&mock), SummaryConfig::default());
        let fragment = summarizer
            .summarize_file("svc/handler.py", &long_code())
            .await
            .unwrap();
        assert_eq!(fragment.text, "FILE: svc/handler.py\nRoutes incoming events.");
        assert_eq!(fragment.level(), FragmentLevel::FileSummary);
        assert!(mock.prompts()[0].contains("Summarize this .py file"));
    }

    #[tokio::test]
    async fn prompt_input_is_truncated() {
        let mock = Arc::new(MockProvider::with_responses(vec![r#"{"summary":"s"}"#.into()]));
        let config = SummaryConfig {
            input_chars: 10,
            ..SummaryConfig::default()
        };
        let summarizer = Summarizer::new(Arc::clone(&mock), config);
        summarizer.summarize_file("a.py", &long_code()).await.unwrap();
        assert!(mock.prompts()[0].contains("def handle\n\nSummary:"));
    }

    #[tokio::test]
    async fn provider_failure_falls_back() {
        let mock = Arc::new(MockProvider::failing_chat());
        let summarizer = Summarizer::new(Arc::clone(&mock), SummaryConfig::default());
        let file = summarizer.summarize_file("pkg/a.py", &long_code()).await.unwrap();
        assert_eq!(file.summary_body(), "File: a.py (summary unavailable)");

        let folder = summarizer
            .summarize_folder("pkg", &[("pkg/a.py".into(), "s".into())])
            .await;
        assert_eq!(folder.text, "FOLDER: pkg\nMultiple code files");
    }

    #[tokio::test]
    async fn folder_prompt_lists_at_most_configured_files() {
        let mock = Arc::new(MockProvider::with_responses(vec![
            r#"{"purpose": "Request handlers."}"#.into(),
        ]));
        let config = SummaryConfig {
            folder_files: 2,
            ..SummaryConfig::default()
        };
        let summarizer = Summarizer::new(Arc::clone(&mock), config);
        let files: Vec<(String, String)> = (0..4)
            .map(|i| (format!("api/f{i}.py"), format!("summary {i}")))
            .collect();
        let folder = summarizer.summarize_folder("api", &files).await;
        assert_eq!(folder.summary_body(), "Request handlers.");
        let prompt = &mock.prompts()[0];
        assert!(prompt.contains("- f1.py: summary 1"));
        assert!(!prompt.contains("f2.py"));
    }

    #[test]
    fn folders_of_paths() {
        assert_eq!(folder_of("main.py"), ".");
        assert_eq!(folder_of("src/main.rs"), "src");
        assert_eq!(folder_of("a/b/c.go"), "a/b");
    }

    #[test]
    fn grouping_ignores_other_levels() {
        let fragments = vec![
            Fragment::file_summary("src/b.rs", "B"),
            Fragment::file_summary("src/a.rs", "A"),
            Fragment::file_summary("main.py", "M"),
            Fragment::folder_summary("src", "old"),
        ];
        let groups = group_by_folder(&fragments);
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups["src"],
            vec![("src/a.rs".into(), "A".into()), ("src/b.rs".into(), "B".into())]
        );
        assert_eq!(groups["."], vec![("main.py".into(), "M".into())]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
