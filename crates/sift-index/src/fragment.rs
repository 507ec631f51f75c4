//! The retrievable unit and its content-addressed identity.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Marker type of gap-filling windows.
pub const GAP_WINDOW_KIND: &str = "gap_window";
/// Synthetic name given to gap windows.
pub const TOP_LEVEL_NAME: &str = "top-level";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentLevel {
    CodeFragment,
    Document,
    FileSummary,
    FolderSummary,
}

impl FragmentLevel {
    /// Levels whose body lives in the fragment store.
    #[must_use]
    pub fn is_stored(self) -> bool {
        matches!(self, Self::CodeFragment | Self::Document)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentMetadata {
    /// Repo-relative path, `/`-separated. `None` only for folder summaries.
    pub file: Option<String>,
    /// Owning folder of a folder summary (`.` for the repository root).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub level: FragmentLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_code_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// The text that gets embedded.
    pub text: String,
    pub metadata: FragmentMetadata,
}

impl Fragment {
    /// Summary fragment for one file.
    #[must_use]
    pub fn file_summary(file: &str, summary: &str) -> Self {
        Self {
            text: format!("FILE: {file}\n{summary}"),
            metadata: FragmentMetadata {
                file: Some(file.to_owned()),
                folder: None,
                start_line: 0,
                end_line: 0,
                kind: "file_summary".into(),
                level: FragmentLevel::FileSummary,
                function_name: None,
                docstring: None,
                fragment_id: None,
                full_code_path: None,
            },
        }
    }

    /// Summary fragment for one folder.
    #[must_use]
    pub fn folder_summary(folder: &str, purpose: &str) -> Self {
        Self {
            text: format!("FOLDER: {folder}\n{purpose}"),
            metadata: FragmentMetadata {
                file: None,
                folder: Some(folder.to_owned()),
                start_line: 0,
                end_line: 0,
                kind: "folder_summary".into(),
                level: FragmentLevel::FolderSummary,
                function_name: None,
                docstring: None,
                fragment_id: None,
                full_code_path: None,
            },
        }
    }

    #[must_use]
    pub fn level(&self) -> FragmentLevel {
        self.metadata.level
    }

    #[must_use]
    pub fn file(&self) -> Option<&str> {
        self.metadata.file.as_deref()
    }

    /// Body of a summary fragment, without its `FILE:`/`FOLDER:` header line.
    #[must_use]
    pub fn summary_body(&self) -> &str {
        match self.metadata.level {
            FragmentLevel::FileSummary | FragmentLevel::FolderSummary => self
                .text
                .split_once('\n')
                .map_or(self.text.as_str(), |(_, body)| body),
            _ => &self.text,
        }
    }

    /// Stable identity used for set comparisons across runs.
    #[must_use]
    pub fn identity(&self) -> String {
        let m = &self.metadata;
        match m.level {
            FragmentLevel::CodeFragment | FragmentLevel::Document => {
                m.fragment_id.clone().unwrap_or_default()
            }
            FragmentLevel::FileSummary => format!("file:{}", m.file.as_deref().unwrap_or_default()),
            FragmentLevel::FolderSummary => {
                format!("folder:{}", m.folder.as_deref().unwrap_or_default())
            }
        }
    }

    /// One-line description used in rerank prompts and compact references.
    #[must_use]
    pub fn header(&self) -> String {
        let m = &self.metadata;
        match m.level {
            FragmentLevel::FolderSummary => {
                format!("Folder summary: {}", m.folder.as_deref().unwrap_or("."))
            }
            FragmentLevel::FileSummary => {
                format!("File summary: {}", m.file.as_deref().unwrap_or_default())
            }
            FragmentLevel::Document => format!(
                "Document: {} | Lines: {}-{}",
                m.file.as_deref().unwrap_or_default(),
                m.start_line,
                m.end_line
            ),
            FragmentLevel::CodeFragment => format!(
                "Function: {} | File: {} | Lines: {}-{} | Type: {}",
                m.function_name.as_deref().unwrap_or("unknown"),
                m.file.as_deref().unwrap_or_default(),
                m.start_line,
                m.end_line,
                m.kind
            ),
        }
    }
}

/// Content-addressed fragment id: depends only on location, never on content.
#[must_use]
pub fn fragment_id(path: &str, start_line: usize, end_line: usize) -> String {
    let hash = blake3::hash(format!("{path}:{start_line}:{end_line}").as_bytes());
    hash.to_hex().as_str()[..16].to_owned()
}

/// Embedded text of a code fragment: a compact metadata summary, not the code.
#[must_use]
pub fn code_embedding_text(
    name: &str,
    path: &str,
    start_line: usize,
    end_line: usize,
    docstring: Option<&str>,
) -> String {
    let mut text = format!("Function: {name}\nFile: {path}\nLines: {start_line}-{end_line}");
    if let Some(doc) = docstring {
        let _ = write!(text, "\nDocstring: {doc}");
    }
    text
}

/// Embedded text of a whole-file document.
#[must_use]
pub fn document_embedding_text(path: &str, content: &str) -> String {
    format!("DOCUMENT: {path}\n\n{content}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fragment_id_is_16_hex_chars() {
        let id = fragment_id("src/lib.rs", 1, 10);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fragment_id_depends_on_every_component() {
        let base = fragment_id("a.py", 1, 5);
        assert_ne!(base, fragment_id("b.py", 1, 5));
        assert_ne!(base, fragment_id("a.py", 2, 5));
        assert_ne!(base, fragment_id("a.py", 1, 6));
    }

    proptest! {
        #[test]
        fn fragment_id_is_stable(path in "[a-z/]{1,30}\\.(py|rs|go)", start in 1usize..5000, len in 0usize..500) {
            prop_assert_eq!(fragment_id(&path, start, start + len), fragment_id(&path, start, start + len));
        }
    }

    #[test]
    fn code_text_with_and_without_docstring() {
        assert_eq!(
            code_embedding_text("load", "cfg.py", 3, 9, None),
            "Function: load\nFile: cfg.py\nLines: 3-9"
        );
        assert_eq!(
            code_embedding_text("load", "cfg.py", 3, 9, Some("Read config.")),
            "Function: load\nFile: cfg.py\nLines: 3-9\nDocstring: Read config."
        );
    }

    #[test]
    fn summary_body_strips_header() {
        let f = Fragment::file_summary("src/a.rs", "Parses input.\nSecond line.");
        assert_eq!(f.text, "FILE: src/a.rs\nParses input.\nSecond line.");
        assert_eq!(f.summary_body(), "Parses input.\nSecond line.");
        let folder = Fragment::folder_summary("src", "Core logic");
        assert_eq!(folder.summary_body(), "Core logic");
        assert_eq!(folder.file(), None);
    }

    #[test]
    fn identity_by_level() {
        assert_eq!(Fragment::file_summary("x.py", "s").identity(), "file:x.py");
        assert_eq!(Fragment::folder_summary(".", "p").identity(), "folder:.");
    }

    #[test]
    fn metadata_serializes_kind_as_type() {
        let f = Fragment::file_summary("x.py", "s");
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["metadata"]["type"], "file_summary");
        assert_eq!(json["metadata"]["level"], "file_summary");
        assert!(json["metadata"].get("fragment_id").is_none());
    }
}
