//! Grammar registry owned by an indexing session.
//!
//! Grammars are loaded on first use per language and parsers are pooled, so
//! concurrent extraction workers never rebuild either.

use std::collections::HashMap;
use std::sync::Mutex;

use tree_sitter::{Language, Parser};

use crate::error::{IndexError, Result};
use crate::languages::Lang;

#[derive(Default)]
pub struct GrammarRegistry {
    languages: Mutex<HashMap<Lang, Language>>,
    parsers: Mutex<HashMap<Lang, Vec<Parser>>>,
}

impl std::fmt::Debug for GrammarRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let loaded: Vec<Lang> = self
            .languages
            .lock()
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        f.debug_struct("GrammarRegistry")
            .field("loaded", &loaded)
            .finish_non_exhaustive()
    }
}

impl GrammarRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grammar for `lang`, loaded on first request.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedLanguage` if no grammar is compiled in for `lang`.
    pub fn language(&self, lang: Lang) -> Result<Language> {
        let mut languages = self
            .languages
            .lock()
            .map_err(|_| IndexError::Other("grammar registry lock poisoned".into()))?;
        if let Some(language) = languages.get(&lang) {
            return Ok(language.clone());
        }
        let language = lang
            .grammar()
            .ok_or_else(|| IndexError::UnsupportedLanguage(lang.id().to_owned()))?;
        tracing::debug!(lang = lang.id(), "grammar loaded");
        languages.insert(lang, language.clone());
        Ok(language)
    }

    /// Run `f` with a parser configured for `lang`, returning the parser to the pool afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the grammar is unavailable or rejected by tree-sitter.
    pub fn with_parser<R>(&self, lang: Lang, f: impl FnOnce(&mut Parser) -> R) -> Result<R> {
        let pooled = self
            .parsers
            .lock()
            .map_err(|_| IndexError::Other("parser pool lock poisoned".into()))?
            .get_mut(&lang)
            .and_then(Vec::pop);

        let mut parser = match pooled {
            Some(parser) => parser,
            None => {
                let mut parser = Parser::new();
                parser
                    .set_language(&self.language(lang)?)
                    .map_err(|e| IndexError::Parse(format!("{lang}: {e}")))?;
                parser
            }
        };

        let result = f(&mut parser);
        parser.reset();
        if let Ok(mut pool) = self.parsers.lock() {
            pool.entry(lang).or_default().push(parser);
        }
        Ok(result)
    }

    /// Languages whose grammar has been loaded so far.
    #[must_use]
    pub fn loaded(&self) -> usize {
        self.languages.lock().map(|m| m.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_has_no_grammar() {
        let registry = GrammarRegistry::new();
        let err = registry.language(Lang::Markdown).unwrap_err();
        assert!(matches!(err, IndexError::UnsupportedLanguage(ref l) if l == "markdown"));
        assert_eq!(registry.loaded(), 0);
    }

    #[cfg(feature = "lang-python")]
    #[test]
    fn grammar_loaded_once_and_parser_reused() {
        let registry = GrammarRegistry::new();
        let first = registry
            .with_parser(Lang::Python, |p| p.parse("def f(): pass\n", None).is_some())
            .unwrap();
        let second = registry
            .with_parser(Lang::Python, |p| p.parse("x = 1\n", None).is_some())
            .unwrap();
        assert!(first && second);
        assert_eq!(registry.loaded(), 1);
        assert_eq!(registry.parsers.lock().unwrap()[&Lang::Python].len(), 1);
    }

    #[cfg(all(feature = "lang-python", feature = "lang-rust"))]
    #[test]
    fn languages_are_cached_independently() {
        let registry = GrammarRegistry::new();
        registry.language(Lang::Python).unwrap();
        registry.language(Lang::Rust).unwrap();
        registry.language(Lang::Python).unwrap();
        assert_eq!(registry.loaded(), 2);
    }
}
