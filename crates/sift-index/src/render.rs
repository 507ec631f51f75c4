//! Markdown rendering of retrieved fragments.

use crate::fragment::{Fragment, FragmentLevel};
use crate::store::FragmentStore;

/// Separator placed between rendered sections.
pub const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// Full markdown section for `fragment`, with its body loaded from the store.
pub async fn render_fragment(store: &FragmentStore, fragment: &Fragment) -> String {
    let m = &fragment.metadata;
    let file = m.file.as_deref().unwrap_or_default();
    match m.level {
        FragmentLevel::CodeFragment => format!(
            "**Function: {}, File: {file}, Lines: {}-{}, Type: {}**\n```\n{}\n```",
            m.function_name.as_deref().unwrap_or("unknown"),
            m.start_line,
            m.end_line,
            m.kind,
            load_body(store, fragment).await
        ),
        FragmentLevel::Document => format!(
            "**Document: {file}**\n```\n{}\n```",
            load_body(store, fragment).await
        ),
        FragmentLevel::FileSummary => {
            format!("**File Summary: {file}**\n{}", fragment.summary_body())
        }
        FragmentLevel::FolderSummary => format!(
            "**Folder: {}**\n{}",
            m.folder.as_deref().unwrap_or("."),
            fragment.summary_body()
        ),
    }
}

/// Render every fragment, in order.
pub async fn render_all(store: &FragmentStore, fragments: &[Fragment]) -> Vec<String> {
    let mut sections = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        sections.push(render_fragment(store, fragment).await);
    }
    sections
}

/// Compact inline reference: `` `path:start-end` ``.
#[must_use]
pub fn reference(fragment: &Fragment) -> String {
    let m = &fragment.metadata;
    match m.level {
        FragmentLevel::CodeFragment | FragmentLevel::Document => format!(
            "`{}:{}-{}`",
            m.file.as_deref().unwrap_or_default(),
            m.start_line,
            m.end_line
        ),
        FragmentLevel::FileSummary => format!("`{}`", m.file.as_deref().unwrap_or_default()),
        FragmentLevel::FolderSummary => format!("`{}/`", m.folder.as_deref().unwrap_or(".")),
    }
}

async fn load_body(store: &FragmentStore, fragment: &Fragment) -> String {
    let id = fragment.metadata.fragment_id.as_deref().unwrap_or("?");
    match store.load(fragment).await {
        Ok(Some(body)) => body.trim_end_matches('\n').to_owned(),
        Ok(None) => format!("[Fragment {id} not found]"),
        Err(e) => {
            tracing::warn!(fragment = id, error = %e, "fragment body unreadable");
            format!("[Fragment {id} not found]")
        }
    }
}
