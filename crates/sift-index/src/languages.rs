//! Language detection and per-language extraction tables.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Supported language with its tree-sitter grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Python,
    JavaScript,
    TypeScript,
    Tsx,
    Java,
    C,
    Cpp,
    Go,
    Rust,
    /// Indexed as a whole document, never parsed.
    Markdown,
}

/// How a language attaches documentation to a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocStyle {
    /// First statement of the body is a string literal.
    LeadingString,
    /// A `/** ... */` comment right before (or inside) the declaration.
    BlockComment,
    /// Consecutive comment lines starting with the given marker right before the declaration.
    LinePrefix(&'static str),
}

impl Lang {
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Tsx => "tsx",
            Self::Java => "java",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::Go => "go",
            Self::Rust => "rust",
            Self::Markdown => "markdown",
        }
    }

    /// Get the tree-sitter grammar. Returns `None` for document languages or
    /// when the corresponding feature is not enabled.
    #[must_use]
    pub fn grammar(self) -> Option<tree_sitter::Language> {
        match self {
            #[cfg(feature = "lang-python")]
            Self::Python => Some(tree_sitter_python::LANGUAGE.into()),
            #[cfg(feature = "lang-js")]
            Self::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
            #[cfg(feature = "lang-js")]
            Self::TypeScript => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            #[cfg(feature = "lang-js")]
            Self::Tsx => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
            #[cfg(feature = "lang-java")]
            Self::Java => Some(tree_sitter_java::LANGUAGE.into()),
            #[cfg(feature = "lang-c")]
            Self::C => Some(tree_sitter_c::LANGUAGE.into()),
            #[cfg(feature = "lang-c")]
            Self::Cpp => Some(tree_sitter_cpp::LANGUAGE.into()),
            #[cfg(feature = "lang-go")]
            Self::Go => Some(tree_sitter_go::LANGUAGE.into()),
            #[cfg(feature = "lang-rust")]
            Self::Rust => Some(tree_sitter_rust::LANGUAGE.into()),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    #[must_use]
    pub fn is_document(self) -> bool {
        matches!(self, Self::Markdown)
    }

    /// Node kinds that become fragments.
    #[must_use]
    pub fn target_kinds(self) -> &'static [&'static str] {
        match self {
            Self::Python => &[
                "function_definition",
                "class_definition",
                "decorated_definition",
            ],
            Self::JavaScript => &[
                "function_declaration",
                "class_declaration",
                "method_definition",
                "export_statement",
                "lexical_declaration",
                "variable_declaration",
                "arrow_function",
            ],
            Self::TypeScript | Self::Tsx => &[
                "function_declaration",
                "class_declaration",
                "abstract_class_declaration",
                "method_definition",
                "export_statement",
                "lexical_declaration",
                "variable_declaration",
                "arrow_function",
                "interface_declaration",
                "type_alias_declaration",
                "enum_declaration",
            ],
            Self::Java => &[
                "method_declaration",
                "constructor_declaration",
                "class_declaration",
                "interface_declaration",
                "enum_declaration",
            ],
            Self::C => &["function_definition", "struct_specifier"],
            Self::Cpp => &["function_definition", "class_specifier", "struct_specifier"],
            Self::Go => &[
                "function_declaration",
                "method_declaration",
                "type_declaration",
            ],
            Self::Rust => &[
                "function_item",
                "impl_item",
                "struct_item",
                "trait_item",
                "enum_item",
            ],
            Self::Markdown => &[],
        }
    }

    /// Kinds that only wrap a declaration (`export ...`, `@decorator ...`).
    #[must_use]
    pub fn wrapper_kinds(self) -> &'static [&'static str] {
        match self {
            Self::Python => &["decorated_definition"],
            Self::JavaScript | Self::TypeScript | Self::Tsx => &["export_statement"],
            _ => &[],
        }
    }

    /// Kinds whose members are surfaced as fragments of their own, in
    /// addition to any kind whose name contains `class`.
    #[must_use]
    pub fn container_kinds(self) -> &'static [&'static str] {
        match self {
            Self::Rust => &["impl_item", "trait_item"],
            Self::Java => &["interface_declaration", "enum_declaration"],
            _ => &[],
        }
    }

    /// Fields holding a declaration's name, in lookup order.
    #[must_use]
    pub fn name_fields(self) -> &'static [&'static str] {
        match self {
            Self::C => &["declarator", "name"],
            Self::Cpp => &["name", "declarator"],
            Self::Rust => &["name", "type"],
            _ => &["name"],
        }
    }

    #[must_use]
    pub fn doc_style(self) -> DocStyle {
        match self {
            Self::Python => DocStyle::LeadingString,
            Self::Rust => DocStyle::LinePrefix("///"),
            Self::Go => DocStyle::LinePrefix("//"),
            _ => DocStyle::BlockComment,
        }
    }
}

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Detect language from file extension.
#[must_use]
pub fn detect_language(path: &Path) -> Option<Lang> {
    let ext = path.extension()?.to_str()?;
    match ext {
        "py" | "pyi" => Some(Lang::Python),
        "js" | "jsx" | "mjs" | "cjs" => Some(Lang::JavaScript),
        "ts" | "mts" | "cts" => Some(Lang::TypeScript),
        "tsx" => Some(Lang::Tsx),
        "java" => Some(Lang::Java),
        "c" | "h" => Some(Lang::C),
        "cpp" | "cc" | "cxx" | "hpp" | "hh" => Some(Lang::Cpp),
        "go" => Some(Lang::Go),
        "rs" => Some(Lang::Rust),
        "md" | "markdown" => Some(Lang::Markdown),
        _ => None,
    }
}
