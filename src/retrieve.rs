//! Context retrieval
//!
//! The pipeline consumes retrieval as an interface: ranked code snippets
//! with provenance for a task description. `KeywordRetriever` is the
//! built-in implementation, a deterministic token-overlap scorer over the
//! working tree, so runs work without an external index. A vector index
//! plugs in behind the same trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use walkdir::WalkDir;

/// Lines per retrieval chunk
const CHUNK_LINES: usize = 60;
const MAX_FILE_BYTES: u64 = 512 * 1024;

/// One ranked snippet with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChunk {
    pub id: String,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub score: f64,
}

#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        repo_path: &Path,
        k: usize,
    ) -> Result<Vec<CodeChunk>, String>;
}

/// Token-overlap retrieval over repository files.
///
/// Scores each fixed-size chunk by the fraction of query tokens it
/// contains; ties break on path and position so results are stable.
pub struct KeywordRetriever {
    ignore_dirs: Vec<String>,
    source_extensions: Vec<String>,
}

impl Default for KeywordRetriever {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordRetriever {
    pub fn new() -> Self {
        Self {
            ignore_dirs: vec![
                ".git".to_string(),
                "target".to_string(),
                "node_modules".to_string(),
                "dist".to_string(),
                "build".to_string(),
                ".venv".to_string(),
                "venv".to_string(),
                "__pycache__".to_string(),
                ".patchgate".to_string(),
            ],
            source_extensions: vec![
                "rs", "py", "ts", "tsx", "js", "jsx", "go", "java", "rb", "c", "cc", "cpp", "h",
                "toml", "yaml", "yml", "json", "md",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }

    fn should_index(&self, path: &Path) -> bool {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        self.source_extensions.iter().any(|s| s == ext)
    }

    fn score_chunk(query_tokens: &BTreeSet<String>, chunk: &str) -> f64 {
        if query_tokens.is_empty() {
            return 0.0;
        }
        let chunk_tokens = tokenize(chunk);
        let matched = query_tokens.iter().filter(|t| chunk_tokens.contains(*t)).count();
        matched as f64 / query_tokens.len() as f64
    }
}

#[async_trait]
impl ContextRetriever for KeywordRetriever {
    async fn retrieve(
        &self,
        query: &str,
        repo_path: &Path,
        k: usize,
    ) -> Result<Vec<CodeChunk>, String> {
        let query_tokens = tokenize(query);
        let mut chunks: Vec<CodeChunk> = Vec::new();

        let walker = WalkDir::new(repo_path).into_iter().filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !self.ignore_dirs.iter().any(|d| d == name.as_ref())
        });

        for entry in walker {
            let entry = entry.map_err(|e| format!("Failed to walk repository: {}", e))?;
            if !entry.file_type().is_file() || !self.should_index(entry.path()) {
                continue;
            }
            if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
                continue;
            }

            let content = match std::fs::read_to_string(entry.path()) {
                Ok(c) => c,
                Err(_) => continue, // binary or unreadable, skip
            };
            let rel_path = entry
                .path()
                .strip_prefix(repo_path)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");

            let lines: Vec<&str> = content.lines().collect();
            let mut start = 0;
            while start < lines.len() {
                let end = (start + CHUNK_LINES).min(lines.len());
                let text = lines[start..end].join("\n");
                let score = Self::score_chunk(&query_tokens, &text);
                if score > 0.0 {
                    chunks.push(CodeChunk {
                        id: format!("{}:{}", rel_path, start + 1),
                        path: rel_path.clone(),
                        start_line: start + 1,
                        end_line: end,
                        text,
                        score,
                    });
                }
                start = end;
            }
        }

        chunks.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
                .then_with(|| a.start_line.cmp(&b.start_line))
        });
        chunks.truncate(k);
        Ok(chunks)
    }
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 3)
        .map(String::from)
        .collect()
}
