//! The set of files currently loaded into chat context

use serde::{Deserialize, Serialize};

/// Rough token count: one token per four characters, rounded up
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedFile {
    pub path: String,
    pub content: String,
    pub token_estimate: usize,
}

impl LoadedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            token_estimate: estimate_tokens(&content),
            content,
        }
    }
}

/// Files keyed by path, kept in the order they were first loaded.
///
/// Inserting an existing path replaces its content in place.
#[derive(Debug, Clone, Default)]
pub struct LoadedFiles {
    files: Vec<LoadedFile>,
}

impl LoadedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file. Returns true if the path was new.
    pub fn insert(&mut self, file: LoadedFile) -> bool {
        match self.files.iter_mut().find(|f| f.path == file.path) {
            Some(existing) => {
                *existing = file;
                false
            }
            None => {
                self.files.push(file);
                true
            }
        }
    }

    pub fn remove(&mut self, path: &str) -> Option<LoadedFile> {
        let index = self.files.iter().position(|f| f.path == path)?;
        Some(self.files.remove(index))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }

    pub fn get(&self, path: &str) -> Option<&LoadedFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedFile> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.files.iter().map(|f| f.token_estimate).sum()
    }

    pub fn to_vec(&self) -> Vec<LoadedFile> {
        self.files.clone()
    }
}
