//! Grammar-driven fragment extraction with gap-filling line windows.
//!
//! Every line of a file ends up in at least one fragment: declarations found
//! in the syntax tree become code fragments, and the remaining lines are cut
//! into fixed-size windows.

use std::collections::HashSet;
use std::path::Path;

use tree_sitter::Node;

use crate::error::{IndexError, Result};
use crate::fragment::{
    Fragment, FragmentLevel, FragmentMetadata, GAP_WINDOW_KIND, TOP_LEVEL_NAME,
    code_embedding_text, document_embedding_text, fragment_id,
};
use crate::languages::{DocStyle, Lang};
use crate::registry::GrammarRegistry;
use crate::store::stored_path;

/// Kinds skipped when walking back from a declaration to its doc comment.
const DOC_TRANSPARENT_KINDS: &[&str] = &["attribute_item", "decorator", "annotation"];

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Declarations with fewer non-whitespace characters are not fragments (default: 20).
    pub min_fragment_chars: usize,
    /// Height of a gap window in lines (default: 50).
    pub gap_window_lines: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            min_fragment_chars: 20,
            gap_window_lines: 50,
        }
    }
}

/// A fragment plus the full text that belongs in the fragment store.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub fragment: Fragment,
    pub body: String,
}

struct ExtractCtx<'a> {
    source: &'a str,
    path: &'a str,
    ext: String,
    lang: Lang,
    config: &'a ExtractorConfig,
}

/// Extract the fragments of one file.
///
/// Documents yield a single fragment. Code is parsed and its uncovered lines
/// are filled with gap windows. The result is ordered by start line, with
/// enclosing fragments before their members.
///
/// # Errors
///
/// Returns an error if the language has no grammar or the parse fails.
pub fn extract_fragments(
    registry: &GrammarRegistry,
    source: &str,
    path: &str,
    lang: Lang,
    config: &ExtractorConfig,
) -> Result<Vec<Extraction>> {
    if lang.is_document() {
        return Ok(extract_document(source, path));
    }

    let tree = registry
        .with_parser(lang, |parser| parser.parse(source, None))?
        .ok_or_else(|| IndexError::Parse(format!("parse failed for {path}")))?;

    let ctx = ExtractCtx {
        source,
        path,
        ext: file_extension(path),
        lang,
        config,
    };

    let mut parsed = Vec::new();
    visit(tree.root_node(), &ctx, &mut parsed);

    let mut seen = HashSet::new();
    parsed.retain(|e: &Extraction| seen.insert(e.fragment.metadata.fragment_id.clone()));

    let mut fragments = fill_gaps(&parsed, &ctx);
    fragments.extend(parsed);
    fragments.sort_by_key(|e| {
        let m = &e.fragment.metadata;
        (m.start_line, std::cmp::Reverse(m.end_line))
    });
    Ok(fragments)
}

/// Whole-file document fragment (markdown and other prose).
#[must_use]
pub fn extract_document(source: &str, path: &str) -> Vec<Extraction> {
    let total = source.lines().count();
    if total == 0 {
        return Vec::new();
    }
    let id = fragment_id(path, 1, total);
    let fragment = Fragment {
        text: document_embedding_text(path, source),
        metadata: FragmentMetadata {
            file: Some(path.to_owned()),
            folder: None,
            start_line: 1,
            end_line: total,
            kind: "document".into(),
            level: FragmentLevel::Document,
            function_name: None,
            docstring: None,
            full_code_path: Some(stored_path(&id, &file_extension(path))),
            fragment_id: Some(id),
        },
    };
    vec![Extraction {
        fragment,
        body: source.to_owned(),
    }]
}

/// `.ext` of `path`, or `.txt` when it has none.
#[must_use]
pub fn file_extension(path: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map_or_else(|| ".txt".to_owned(), |e| format!(".{e}"))
}

fn visit(node: Node, ctx: &ExtractCtx, out: &mut Vec<Extraction>) {
    let mut cursor = node.walk();
    let children: Vec<Node> = node.named_children(&mut cursor).collect();
    for child in children {
        if !ctx.lang.target_kinds().contains(&child.kind()) {
            visit(child, ctx, out);
            continue;
        }

        let text = &ctx.source[child.byte_range()];
        if non_ws_len(text) < ctx.config.min_fragment_chars {
            visit(child, ctx, out);
            continue;
        }

        let identity = unwrap_declaration(child, ctx.lang);
        out.push(code_fragment(ctx, identity, child));
        if is_container(identity, ctx.lang) {
            visit(identity, ctx, out);
        }
    }
}

/// The declaration inside an export/decorator wrapper, or `node` itself.
fn unwrap_declaration(node: Node, lang: Lang) -> Node {
    if !lang.wrapper_kinds().contains(&node.kind()) {
        return node;
    }
    if let Some(inner) = node
        .child_by_field_name("declaration")
        .or_else(|| node.child_by_field_name("definition"))
    {
        return inner;
    }
    let mut cursor = node.walk();
    let inner = node.named_children(&mut cursor).find(|c| {
        lang.target_kinds().contains(&c.kind()) && !lang.wrapper_kinds().contains(&c.kind())
    });
    inner.unwrap_or(node)
}

fn is_container(node: Node, lang: Lang) -> bool {
    node.kind().contains("class") || lang.container_kinds().contains(&node.kind())
}

fn code_fragment(ctx: &ExtractCtx, identity: Node, span: Node) -> Extraction {
    let (start_line, end_line) = line_span(span);
    let name = entity_name(identity, ctx);
    let docstring = docstring(identity, span, ctx);
    let id = fragment_id(ctx.path, start_line, end_line);
    let fragment = Fragment {
        text: code_embedding_text(&name, ctx.path, start_line, end_line, docstring.as_deref()),
        metadata: FragmentMetadata {
            file: Some(ctx.path.to_owned()),
            folder: None,
            start_line,
            end_line,
            kind: identity.kind().to_owned(),
            level: FragmentLevel::CodeFragment,
            function_name: Some(name),
            docstring,
            full_code_path: Some(stored_path(&id, &ctx.ext)),
            fragment_id: Some(id),
        },
    };
    Extraction {
        fragment,
        body: ctx.source[span.byte_range()].to_owned(),
    }
}

/// 1-indexed inclusive line range of `node`.
fn line_span(node: Node) -> (usize, usize) {
    (node.start_position().row + 1, last_row(node) + 1)
}

/// 0-indexed last row, not counting a trailing newline the node may own.
fn last_row(node: Node) -> usize {
    let start = node.start_position();
    let end = node.end_position();
    if end.column == 0 && end.row > start.row {
        end.row - 1
    } else {
        end.row
    }
}

fn node_text<'a>(node: Node, source: &'a str) -> &'a str {
    source[node.byte_range()].trim()
}

fn entity_name(node: Node, ctx: &ExtractCtx) -> String {
    for field in ctx.lang.name_fields() {
        if let Some(found) = node.child_by_field_name(field) {
            let name = node_text(innermost_declarator(found), ctx.source);
            if !name.is_empty() {
                return name.to_owned();
            }
        }
    }

    let mut cursor = node.walk();
    let children: Vec<Node> = node.named_children(&mut cursor).collect();

    // `const handler = () => ...`, `type Config struct { ... }`
    if let Some(name) = children
        .iter()
        .find_map(|c| c.child_by_field_name("name"))
        .map(|n| node_text(n, ctx.source))
        .filter(|n| !n.is_empty())
    {
        return name.to_owned();
    }

    children
        .iter()
        .find(|c| c.kind() == "identifier")
        .map_or_else(|| "unknown".to_owned(), |c| node_text(*c, ctx.source).to_owned())
}

/// Follow nested `declarator` fields down to the declared name (C/C++).
fn innermost_declarator(mut node: Node) -> Node {
    while let Some(inner) = node.child_by_field_name("declarator") {
        node = inner;
    }
    node
}

fn docstring(identity: Node, span: Node, ctx: &ExtractCtx) -> Option<String> {
    match ctx.lang.doc_style() {
        DocStyle::LeadingString => leading_string(identity, ctx.source),
        DocStyle::BlockComment => {
            let preceding = preceding_comments(span, ctx.source);
            preceding
                .last()
                .copied()
                .filter(|c| c.starts_with("/**"))
                .or_else(|| inner_block_comment(identity, ctx.source))
                .map(clean_comment)
                .filter(|d| !d.is_empty())
        }
        DocStyle::LinePrefix(marker) => {
            let preceding = preceding_comments(span, ctx.source);
            let tail: Vec<&str> = preceding
                .iter()
                .rev()
                .take_while(|c| c.starts_with(marker) || c.starts_with("/**"))
                .copied()
                .collect();
            if tail.is_empty() {
                return None;
            }
            let joined: Vec<String> = tail.into_iter().rev().map(clean_comment).collect();
            Some(joined.join("\n")).filter(|d| !d.is_empty())
        }
    }
}

/// Comments directly above `node`, top to bottom, stopping at a blank line.
fn preceding_comments<'a>(node: Node, source: &'a str) -> Vec<&'a str> {
    let mut comments = Vec::new();
    let mut boundary = node.start_position().row;
    let mut current = node.prev_sibling();
    while let Some(prev) = current {
        let kind = prev.kind();
        if DOC_TRANSPARENT_KINDS.contains(&kind) {
            boundary = prev.start_position().row;
        } else if !prev.is_named() && node_text(prev, source).is_empty() {
            // statement terminators such as Go's newline token
        } else if kind.contains("comment") && last_row(prev) + 1 >= boundary {
            comments.push(node_text(prev, source));
            boundary = prev.start_position().row;
        } else {
            break;
        }
        current = prev.prev_sibling();
    }
    comments.reverse();
    comments
}

fn inner_block_comment<'a>(node: Node, source: &'a str) -> Option<&'a str> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|c| c.kind().contains("comment"))
        .map(|c| node_text(c, source))
        .find(|t| t.starts_with("/**"))
}

fn clean_comment(raw: &str) -> String {
    let body = raw
        .trim()
        .trim_start_matches("/**")
        .trim_start_matches("/*")
        .trim_end_matches("*/");
    body.lines()
        .map(|line| {
            let line = line.trim();
            let line = line
                .strip_prefix("///")
                .or_else(|| line.strip_prefix("//"))
                .unwrap_or(line);
            line.strip_prefix('*').unwrap_or(line).trim()
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Python-style docstring: a string literal opening the body.
fn leading_string(node: Node, source: &str) -> Option<String> {
    let body = node.child_by_field_name("body")?;
    let mut cursor = body.walk();
    let first = body.named_children(&mut cursor).next()?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let mut inner_cursor = first.walk();
    let literal = first.named_children(&mut inner_cursor).next()?;
    if literal.kind() != "string" {
        return None;
    }
    let doc = strip_quotes(node_text(literal, source))
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    let doc = doc.trim();
    (!doc.is_empty()).then(|| doc.to_owned())
}

fn strip_quotes(literal: &str) -> &str {
    let literal = literal.trim_start_matches(|c: char| "rRbBuUfF".contains(c));
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if literal.len() >= quote.len() * 2
            && let Some(inner) = literal
                .strip_prefix(quote)
                .and_then(|s| s.strip_suffix(quote))
        {
            return inner;
        }
    }
    literal
}

fn fill_gaps(parsed: &[Extraction], ctx: &ExtractCtx) -> Vec<Extraction> {
    let lines: Vec<&str> = ctx.source.lines().collect();
    let total = lines.len();
    let mut covered = vec![false; total + 1];
    for extraction in parsed {
        let m = &extraction.fragment.metadata;
        for line in m.start_line..=m.end_line.min(total) {
            covered[line] = true;
        }
    }

    let window = ctx.config.gap_window_lines.max(1);
    let mut windows = Vec::new();
    let mut line = 1;
    while line <= total {
        if covered[line] {
            line += 1;
            continue;
        }
        let gap_start = line;
        while line <= total && !covered[line] {
            line += 1;
        }
        let gap_end = line - 1;

        let mut start = gap_start;
        while start <= gap_end {
            let end = (start + window - 1).min(gap_end);
            windows.push(gap_window(ctx, start, end, lines[start - 1..end].join("\n")));
            start = end + 1;
        }
    }
    windows
}

fn gap_window(ctx: &ExtractCtx, start_line: usize, end_line: usize, body: String) -> Extraction {
    let id = fragment_id(ctx.path, start_line, end_line);
    let fragment = Fragment {
        text: code_embedding_text(TOP_LEVEL_NAME, ctx.path, start_line, end_line, None),
        metadata: FragmentMetadata {
            file: Some(ctx.path.to_owned()),
            folder: None,
            start_line,
            end_line,
            kind: GAP_WINDOW_KIND.into(),
            level: FragmentLevel::CodeFragment,
            function_name: Some(TOP_LEVEL_NAME.into()),
            docstring: None,
            full_code_path: Some(stored_path(&id, &ctx.ext)),
            fragment_id: Some(id),
        },
    };
    Extraction { fragment, body }
}

fn non_ws_len(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}
