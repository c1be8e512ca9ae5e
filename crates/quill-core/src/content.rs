//! Repository content seam and the local-checkout implementation

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::files::{LoadedFile, LoadedFiles};
use crate::providers::types::{FileContent, FileLoader, LOAD_ERROR_PREFIX};

const MAX_READ_SIZE: u64 = 2 * 1024 * 1024; // 2MB

/// Where note files come from: a tree of relative paths plus content reads
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Every discoverable file as a `/`-separated path relative to the root
    async fn file_tree(&self) -> Result<Vec<String>>;

    async fn read_file(&self, path: &str) -> Result<String>;
}

/// Notes stored in a directory on disk (e.g. a cloned repository)
#[derive(Debug, Clone)]
pub struct LocalContentSource {
    root: PathBuf,
    extensions: Vec<String>,
}

impl LocalContentSource {
    pub fn new(root: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            root: root.into(),
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject absolute paths and any `..` component
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches("./"));
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || !safe {
            return Err(anyhow!("Path escapes the notes directory: {}", path));
        }
        Ok(self.root.join(relative))
    }
}

fn is_hidden(relative: &Path) -> bool {
    relative
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
}

fn scan(root: &Path, extensions: &[String]) -> Result<Vec<String>> {
    let base = glob::Pattern::escape(&root.to_string_lossy());
    let mut paths = Vec::new();

    for ext in extensions {
        let pattern = format!("{}/**/*.{}", base, ext);
        let entries =
            glob::glob(&pattern).with_context(|| format!("Invalid glob pattern: {}", pattern))?;
        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            if is_hidden(relative) {
                continue;
            }
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            paths.push(parts.join("/"));
        }
    }

    paths.sort();
    paths.dedup();
    Ok(paths)
}

#[async_trait]
impl ContentSource for LocalContentSource {
    async fn file_tree(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let extensions = self.extensions.clone();
        if !root.is_dir() {
            return Err(anyhow!("Notes directory not found: {}", root.display()));
        }
        let paths = tokio::task::spawn_blocking(move || scan(&root, &extensions))
            .await
            .context("spawn_blocking task panicked")??;
        debug!("Scanned {} files under {}", paths.len(), self.root.display());
        Ok(paths)
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&full)
            .await
            .with_context(|| format!("file not found: {}", path))?;
        if metadata.len() > MAX_READ_SIZE {
            return Err(anyhow!(
                "File too large ({} bytes, max 2MB)",
                metadata.len()
            ));
        }
        tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("Failed to read file: {}", path))
    }
}

/// Read each path, turning per-path failures into error-marker content
/// rather than failing the batch
pub async fn load_file_contents(source: &dyn ContentSource, paths: &[String]) -> Vec<FileContent> {
    let mut results = Vec::with_capacity(paths.len());
    for path in paths {
        let content = match source.read_file(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to load {}: {:#}", path, e);
                format!("{} {:#}", LOAD_ERROR_PREFIX, e)
            }
        };
        results.push(FileContent {
            path: path.clone(),
            content,
        });
    }
    results
}

/// [`FileLoader`] handed to adapters: reads through a content source and
/// records every successful load into the shared loaded-file set
pub struct ContentLoader {
    source: Arc<dyn ContentSource>,
    loaded: Arc<Mutex<LoadedFiles>>,
}

impl ContentLoader {
    pub fn new(source: Arc<dyn ContentSource>, loaded: Arc<Mutex<LoadedFiles>>) -> Self {
        Self { source, loaded }
    }
}

#[async_trait]
impl FileLoader for ContentLoader {
    async fn load_files(&self, paths: &[String]) -> Result<Vec<FileContent>> {
        let files = load_file_contents(self.source.as_ref(), paths).await;
        let mut loaded = self
            .loaded
            .lock()
            .map_err(|_| anyhow!("loaded file set poisoned"))?;
        for file in files.iter().filter(|f| !f.content.starts_with(LOAD_ERROR_PREFIX)) {
            loaded.insert(LoadedFile::new(&file.path, &file.content));
        }
        Ok(files)
    }
}
