//! Character dictionaries for CTC recognition

use std::path::{Path, PathBuf};
use tracing::info;

use super::cache::KeyedCache;
use super::error::{OcrError, OcrResult};

/// Process-wide dictionary cache keyed by canonical file path and space-char flag
pub type DictionaryCache = KeyedCache<(PathBuf, bool), Dictionary>;

/// Ordered symbol table; index 0 is the CTC blank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dictionary {
    symbols: Vec<String>,
}

impl Dictionary {
    /// Build from the non-blank symbols in class order
    pub fn from_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = vec![String::new()];
        all.extend(symbols.into_iter().map(Into::into));
        Self { symbols: all }
    }

    /// Parse dictionary text: one symbol per line, optional trailing space symbol.
    ///
    /// Every line is a class, blank ones included, so indices stay aligned
    /// with the model output.
    pub fn parse(content: &str, use_space_char: bool) -> Self {
        let mut symbols: Vec<String> = content
            .lines()
            .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
            .collect();
        if use_space_char {
            symbols.push(" ".to_string());
        }
        Self::from_symbols(symbols)
    }

    pub fn load(path: &Path, use_space_char: bool) -> OcrResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| OcrError::io(path, e))?;
        let dictionary = Self::parse(&content, use_space_char);
        if dictionary.len() <= 1 {
            return Err(OcrError::DecodeFailure(format!(
                "dictionary {:?} has no symbols",
                path
            )));
        }
        info!("Loaded dictionary {:?} ({} classes)", path, dictionary.len());
        Ok(dictionary)
    }

    /// Load through the shared cache; the key is the canonical path plus the flag
    pub fn load_cached(
        cache: &DictionaryCache,
        path: &Path,
        use_space_char: bool,
    ) -> OcrResult<std::sync::Arc<Self>> {
        let canonical = path.canonicalize().map_err(|e| OcrError::io(path, e))?;
        let key = (canonical, use_space_char);
        cache.get_or_try_insert_with(&key, || Self::load(&key.0, use_space_char))
    }

    /// Number of classes including the blank
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.len() <= 1
    }

    /// Symbol for a class index; `None` for the blank and out-of-range indices
    pub fn symbol(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.symbols.get(index).map(String::as_str)
    }
}
