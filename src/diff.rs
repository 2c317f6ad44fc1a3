//! Unified diff parsing and patch screening
//!
//! Parses (possibly multi-file) unified diff text into structured data,
//! derives the metadata scoring needs, and screens patches against the
//! rules a generated change must never break.

use crate::config::RunLimits;
use regex::Regex;

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl DiffLine {
    pub fn content(&self) -> &str {
        match self {
            DiffLine::Context(s) => s,
            DiffLine::Add(s) => s,
            DiffLine::Remove(s) => s,
        }
    }
}

/// A hunk in a unified diff
#[derive(Debug, Clone, PartialEq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// Get a summary of changes in this hunk
    pub fn summary(&self) -> (usize, usize) {
        let adds = self.lines.iter().filter(|l| matches!(l, DiffLine::Add(_))).count();
        let removes = self.lines.iter().filter(|l| matches!(l, DiffLine::Remove(_))).count();
        (adds, removes)
    }
}

/// One file's worth of a unified diff
#[derive(Debug, Clone, PartialEq)]
pub struct FileDiff {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<DiffHunk>,
}

impl FileDiff {
    /// Get total additions and deletions
    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            let (a, r) = h.summary();
            (acc.0 + a, acc.1 + r)
        })
    }

    /// True when the diff deletes the file outright
    pub fn is_deletion(&self) -> bool {
        self.new_path == "/dev/null"
    }
}

/// Parse a unified diff that may span multiple files
pub fn parse_multi_file_diff(diff: &str) -> Result<Vec<FileDiff>, String> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut files = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if lines[i].starts_with("--- ") {
            let file = parse_file_diff(&lines, &mut i)?;
            files.push(file);
        } else {
            i += 1;
        }
    }

    if files.is_empty() {
        return Err("No file diffs found".to_string());
    }

    Ok(files)
}

/// Parse one file section starting at a `--- ` line
fn parse_file_diff(lines: &[&str], idx: &mut usize) -> Result<FileDiff, String> {
    let old_path = strip_diff_path(lines[*idx], "--- ", "a/");
    *idx += 1;

    if *idx >= lines.len() || !lines[*idx].starts_with("+++ ") {
        return Err(format!("Expected +++ after --- for {}", old_path));
    }
    let new_path = strip_diff_path(lines[*idx], "+++ ", "b/");
    *idx += 1;

    let mut hunks = Vec::new();
    while *idx < lines.len() {
        let line = lines[*idx];
        if line.starts_with("@@ ") {
            let hunk = parse_hunk(lines, idx)?;
            hunks.push(hunk);
        } else if line.starts_with("--- ") || line.starts_with("diff ") {
            break;
        } else {
            *idx += 1;
        }
    }

    if old_path.is_empty() || new_path.is_empty() {
        return Err("Could not find file paths in diff".to_string());
    }
    if hunks.is_empty() {
        return Err(format!("No hunks found for {}", new_path));
    }

    Ok(FileDiff { old_path, new_path, hunks })
}

fn strip_diff_path(line: &str, marker: &str, prefix: &str) -> String {
    let mut path = line[marker.len()..].trim_start_matches(prefix).to_string();
    // Handle timestamp suffix
    if let Some(tab_pos) = path.find('\t') {
        path.truncate(tab_pos);
    }
    path
}

/// Parse a single hunk from the diff
fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<DiffHunk, String> {
    let header = lines[*idx];

    // Parse @@ -old_start,old_count +new_start,new_count @@
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "@@" {
        return Err(format!("Invalid hunk header: {}", header));
    }

    let (old_start, old_count) = parse_range(parts[1].trim_start_matches('-'))?;
    let (new_start, new_count) = parse_range(parts[2].trim_start_matches('+'))?;

    *idx += 1;
    let mut diff_lines = Vec::new();

    while *idx < lines.len() {
        let line = lines[*idx];

        // Stop at next hunk or next file
        if line.starts_with("@@ ") || line.starts_with("diff ") || line.starts_with("--- ") {
            break;
        }

        if line.starts_with('+') && !line.starts_with("+++") {
            diff_lines.push(DiffLine::Add(line[1..].to_string()));
        } else if line.starts_with('-') && !line.starts_with("---") {
            diff_lines.push(DiffLine::Remove(line[1..].to_string()));
        } else if line.starts_with(' ') || line.is_empty() {
            let content = if line.is_empty() { "" } else { &line[1..] };
            diff_lines.push(DiffLine::Context(content.to_string()));
        }
        // Skip other lines (like "\ No newline at end of file")

        *idx += 1;
    }

    Ok(DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: diff_lines,
    })
}

/// Parse a range like "10,5" or "10" into (start, count)
fn parse_range(s: &str) -> Result<(usize, usize), String> {
    if let Some(comma) = s.find(',') {
        let start: usize = s[..comma].parse().map_err(|_| format!("Invalid start: {}", s))?;
        let count: usize = s[comma + 1..].parse().map_err(|_| format!("Invalid count: {}", s))?;
        Ok((start, count))
    } else {
        let start: usize = s.parse().map_err(|_| format!("Invalid line number: {}", s))?;
        Ok((start, 1))
    }
}

/// An immutable proposed patch plus the metadata scoring reads off it
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Patch {
    pub diff: String,
    pub files: Vec<String>,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub rationale: String,
}

impl Patch {
    /// Parse diff text into a patch with derived metadata
    pub fn from_diff(diff: &str, rationale: &str) -> Result<Self, String> {
        let parsed = parse_multi_file_diff(diff)?;

        let mut files = Vec::new();
        let mut lines_added = 0;
        let mut lines_removed = 0;
        for file in &parsed {
            if !files.contains(&file.new_path) {
                files.push(file.new_path.clone());
            }
            let (a, r) = file.stats();
            lines_added += a;
            lines_removed += r;
        }

        Ok(Self {
            diff: diff.to_string(),
            files,
            lines_added,
            lines_removed,
            rationale: rationale.to_string(),
        })
    }

    pub fn total_lines_changed(&self) -> usize {
        self.lines_added + self.lines_removed
    }

    /// Added line contents, for secret and complexity scans
    pub fn added_lines(&self) -> Vec<&str> {
        self.diff
            .lines()
            .filter(|l| l.starts_with('+') && !l.starts_with("+++"))
            .map(|l| &l[1..])
            .collect()
    }

    pub fn removed_lines(&self) -> Vec<&str> {
        self.diff
            .lines()
            .filter(|l| l.starts_with('-') && !l.starts_with("---"))
            .map(|l| &l[1..])
            .collect()
    }
}

/// Screens generated patches against rules no patch may break.
///
/// A screening failure is a generation failure: the diff never reaches the
/// sandbox.
pub struct PatchScreen {
    max_diff_lines: usize,
    forbidden_patterns: Vec<String>,
    secret_keywords: Vec<&'static str>,
    secret_patterns: Vec<Regex>,
}

impl PatchScreen {
    pub fn new(limits: &RunLimits) -> Self {
        let secret_patterns = [
            r"sk-[a-zA-Z0-9]{20,}",
            r"AKIA[0-9A-Z]{16}",
            r"ghp_[a-zA-Z0-9]{36}",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

        Self {
            max_diff_lines: limits.max_diff_lines,
            forbidden_patterns: limits.forbidden_patterns.clone(),
            secret_keywords: vec![
                "api_key", "apikey", "secret_key", "password", "passwd", "credential",
            ],
            secret_patterns,
        }
    }

    /// Returns every violation; an empty list means the patch is clean.
    pub fn screen(&self, patch: &Patch) -> Vec<String> {
        let mut errors = Vec::new();

        for file in &patch.files {
            for pattern in &self.forbidden_patterns {
                if file.contains(pattern.as_str()) {
                    errors.push(format!("Forbidden path pattern '{}' in {}", pattern, file));
                }
            }
        }

        if let Ok(parsed) = parse_multi_file_diff(&patch.diff) {
            for file in &parsed {
                if file.is_deletion() {
                    errors.push(format!("File deletion not allowed: {}", file.old_path));
                }
            }
        }

        for line in patch.added_lines() {
            if self.contains_secret(line) {
                errors.push(format!("Potential secret in added line: {}", crate::util::truncate(line.trim(), 60)));
            }
        }

        let total = patch.total_lines_changed();
        if total > self.max_diff_lines {
            errors.push(format!(
                "Diff too large: {} lines (max {})",
                total, self.max_diff_lines
            ));
        }

        errors
    }

    fn contains_secret(&self, line: &str) -> bool {
        let lower = line.to_lowercase();
        if line.contains('=') && self.secret_keywords.iter().any(|kw| lower.contains(kw)) {
            return true;
        }
        self.secret_patterns.iter().any(|re| re.is_match(line))
    }
}
