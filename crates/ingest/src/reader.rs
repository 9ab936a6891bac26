use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::SourceError;

static FRONTMATTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\A---\r?\n.*?\r?\n---\r?\n").expect("static regex"));

/// Reads markdown notes from an Obsidian vault.
pub struct VaultReader {
    min_document_len: usize,
    max_files: Option<usize>,
}

impl VaultReader {
    pub fn new(min_document_len: usize, max_files: Option<usize>) -> Self {
        Self {
            min_document_len,
            max_files,
        }
    }

    /// Sorted `*.md` paths under `vault`, skipping dot-directories (`.obsidian`, `.trash`).
    pub fn discover(&self, vault: &Path) -> Result<Vec<PathBuf>, SourceError> {
        if !vault.is_dir() {
            return Err(SourceError::VaultNotFound(vault.to_path_buf()));
        }

        let mut files: Vec<PathBuf> = WalkDir::new(vault)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
            })
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable vault entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
            .collect();

        files.sort();
        if let Some(max) = self.max_files {
            files.truncate(max);
        }

        Ok(files)
    }

    /// Returns `(relative_path, body)` pairs in path order, frontmatter removed.
    pub async fn read_vault(&self, vault: &Path) -> Result<Vec<(String, String)>, SourceError> {
        let files = self.discover(vault)?;
        let mut documents = Vec::with_capacity(files.len());

        for path in files {
            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read note, skipping");
                    continue;
                }
            };

            let body = strip_frontmatter(&content);
            if body.trim().len() < self.min_document_len {
                debug!(path = %path.display(), "Note too short, skipping");
                continue;
            }

            let relative = path
                .strip_prefix(vault)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            documents.push((relative, body.to_string()));
        }

        Ok(documents)
    }
}

pub fn strip_frontmatter(content: &str) -> &str {
    match FRONTMATTER.find(content) {
        Some(m) => &content[m.end()..],
        None => content,
    }
}
