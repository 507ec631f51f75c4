//! Placeholder-based answer synthesis.
//!
//! The model sees short previews and writes prose that points at fragments
//! through `{fragmentN}` placeholders. Expansion then swaps each placeholder
//! for the full rendered fragment, dropping fragments from the tail until the
//! answer fits the token budget.

use sift_llm::{ChatOptions, LlmProvider, Message};

use crate::fragment::{Fragment, FragmentLevel};
use crate::render::{SECTION_SEPARATOR, reference, render_all};
use crate::store::FragmentStore;
use crate::summarizer::truncate_chars;

const SYNTHESIS_TEMPERATURE: f32 = 0.2;
const PLACEHOLDER_OPEN: &str = "{fragment";

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Token budget of the prompt and of the final answer (default: 15000).
    pub token_budget: usize,
    /// Characters of each rendered fragment shown in the prompt (default: 1500).
    pub preview_chars: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            token_budget: 15_000,
            preview_chars: 1500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Synthesis {
    /// Model prose with placeholders expanded. `included` lists the positions
    /// of fragments whose full body made it into `text`.
    Synthesized { text: String, included: Vec<usize> },
    /// Rendered fragments without model prose.
    Degraded {
        text: String,
        included: Vec<usize>,
        reason: String,
    },
}

impl Synthesis {
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Synthesized { text, .. } | Self::Degraded { text, .. } => text,
        }
    }

    #[must_use]
    pub fn included(&self) -> &[usize] {
        match self {
            Self::Synthesized { included, .. } | Self::Degraded { included, .. } => included,
        }
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// Rough token count: one token per four characters.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

fn placeholder(i: usize) -> String {
    format!("{PLACEHOLDER_OPEN}{i}}}")
}

fn describe(i: usize, fragment: &Fragment) -> String {
    let m = &fragment.metadata;
    let file = m.file.as_deref().unwrap_or_default();
    let what = match m.level {
        FragmentLevel::CodeFragment => format!(
            "{file} lines {}-{} ({})",
            m.start_line,
            m.end_line,
            m.function_name.as_deref().unwrap_or("unknown")
        ),
        FragmentLevel::Document => format!("Document {file}"),
        FragmentLevel::FileSummary => format!("File summary for {file}"),
        FragmentLevel::FolderSummary => {
            format!("Folder summary for {}", m.folder.as_deref().unwrap_or("."))
        }
    };
    format!("{}: {what}", placeholder(i))
}

/// Build the synthesis prompt. Fragments are added in order until the next
/// one would push the prompt past `token_budget`. Returns the prompt and the
/// number of fragments it lists.
#[must_use]
pub fn build_synthesis_prompt(
    query: &str,
    fragments: &[Fragment],
    sections: &[String],
    config: &SynthesisConfig,
) -> (String, usize) {
    let head = format!(
        "Extract ONLY the essential code/context needed for: \"{query}\"\n\n\
         Make sure to include:\n\
         - For every code snippet, include the exact file path and line numbers\n\
         - Include relevant file/folder summaries when helpful\n\
         - Call out key functions, classes, or patterns with their locations\n\n\
         IMPORTANT: Instead of copying code directly, reference fragments using placeholders \
         like {{fragment0}}, {{fragment1}}, etc.\n\
         Each placeholder will be automatically replaced with the full code snippet and metadata.\n\n\
         Make sure to return output in markdown format.\n\n\
         Do not make any code change recommendations or suggestions, only provide context to a \
         model down the line that will make the code changes.\n\n\
         Available fragments:\n"
    );
    let tail = "\nEssential context (concise):";

    let mut listing = String::new();
    let mut used = estimate_tokens(&head) + estimate_tokens(tail);
    let mut listed = 0;
    for (i, (fragment, section)) in fragments.iter().zip(sections).enumerate() {
        let entry = format!(
            "{}\n{}\n\n",
            describe(i, fragment),
            truncate_chars(section, config.preview_chars)
        );
        let cost = estimate_tokens(&entry);
        if used + cost > config.token_budget {
            break;
        }
        used += cost;
        listing.push_str(&entry);
        listed += 1;
    }
    (format!("{head}{listing}{tail}"), listed)
}

/// Replace `{fragmentN}` placeholders using `lookup`. Placeholders for which
/// `lookup` returns `None` are left as written.
pub fn replace_placeholders<'a>(text: &str, lookup: impl Fn(usize) -> Option<&'a str>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + PLACEHOLDER_OPEN.len()..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let closed = digits > 0 && after[digits..].starts_with('}');
        let replacement = closed
            .then(|| after[..digits].parse::<usize>().ok())
            .flatten()
            .and_then(&lookup);
        match replacement {
            Some(value) => {
                out.push_str(value);
                rest = &after[digits + 1..];
            }
            None => {
                out.push_str(PLACEHOLDER_OPEN);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand placeholders in `synthesis`, keeping full sections for as many
/// leading fragments as fit in `token_budget`. Placeholders of dropped
/// fragments become compact references. Returns the text and how many
/// fragments kept their full section.
#[must_use]
pub fn expand(
    synthesis: &str,
    sections: &[String],
    references: &[String],
    token_budget: usize,
) -> (String, usize) {
    let total = sections.len().min(references.len());
    for keep in (0..=total).rev() {
        let text = replace_placeholders(synthesis, |i| {
            if i < keep {
                sections.get(i).map(String::as_str)
            } else if i < total {
                references.get(i).map(String::as_str)
            } else {
                None
            }
        });
        if keep == 0 || estimate_tokens(&text) <= token_budget {
            if keep < total {
                tracing::debug!(kept = keep, total, "expanded answer trimmed to token budget");
            }
            return (text, keep);
        }
    }
    (synthesis.to_owned(), 0)
}

/// Join rendered sections, dropping from the tail until the result fits
/// `token_budget`. At least one section is always kept.
#[must_use]
pub fn join_within_budget(sections: &[String], token_budget: usize) -> (String, usize) {
    let mut keep = sections.len();
    loop {
        let text = sections[..keep].join(SECTION_SEPARATOR);
        if keep <= 1 || estimate_tokens(&text) <= token_budget {
            return (text, keep);
        }
        keep -= 1;
    }
}

/// Ask the model for a synthesis over `fragments` and expand it.
///
/// Never fails: a provider error or empty reply yields
/// [`Synthesis::Degraded`] holding the rendered fragments.
pub async fn synthesize<P: LlmProvider>(
    provider: &P,
    store: &FragmentStore,
    query: &str,
    fragments: &[Fragment],
    config: &SynthesisConfig,
) -> Synthesis {
    let sections = render_all(store, fragments).await;
    let degraded = |reason: String| {
        let (text, kept) = join_within_budget(&sections, config.token_budget);
        Synthesis::Degraded {
            text,
            included: (0..kept).collect(),
            reason,
        }
    };

    let (prompt, listed) = build_synthesis_prompt(query, fragments, &sections, config);
    if listed == 0 {
        tracing::warn!("no fragment fits the synthesis prompt budget");
        return degraded("token budget too small for any fragment".into());
    }

    let reply = match provider
        .chat(
            &[Message::user(prompt)],
            ChatOptions::with_temperature(SYNTHESIS_TEMPERATURE),
        )
        .await
    {
        Ok(reply) if !reply.trim().is_empty() => reply,
        Ok(_) => {
            tracing::warn!("empty synthesis, returning rendered fragments");
            return degraded("empty synthesis".into());
        }
        Err(e) => {
            tracing::warn!(error = %e, "synthesis failed, returning rendered fragments");
            return degraded(e.to_string());
        }
    };

    let references: Vec<String> = fragments.iter().map(reference).collect();
    let (text, kept) = expand(reply.trim(), &sections, &references, config.token_budget);
    let mut included = Vec::new();
    for i in 0..kept {
        if reply.contains(&placeholder(i)) {
            included.push(i);
        }
    }
    tracing::debug!(
        listed,
        expanded = included.len(),
        total = fragments.len(),
        "synthesis finished"
    );
    Synthesis::Synthesized { text, included }
}
