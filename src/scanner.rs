//! Vault scanner.
//!
//! Walks the vault root and yields every markdown note with a content
//! fingerprint. Application directories (`.obsidian`, `.trash`, ...), hidden
//! files, zero-byte files and non-markdown files never enter the scan set.
//! A file that cannot be read is reported in [`ScanReport::unreadable`]
//! instead of failing the scan.

use anyhow::Result;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::models::Note;
use crate::store::FolderFilter;

/// Directories owned by the editor or its plugins rather than the user.
const SYSTEM_DIRS: &[&str] = &[
    ".obsidian",
    ".smart-connections",
    ".smart-env",
    ".trash",
    ".git",
    "img",
    "img-old",
    "smart-chats",
];

/// A note that exists but could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableNote {
    pub path: String,
    pub message: String,
}

impl UnreadableNote {
    pub fn to_error(&self) -> VaultError {
        VaultError::CorpusRead {
            path: self.path.clone(),
            message: self.message.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanReport {
    /// Readable notes, sorted by path.
    pub notes: Vec<Note>,
    pub unreadable: Vec<UnreadableNote>,
}

impl ScanReport {
    /// Distinct top-level folders with the number of notes beneath each,
    /// sorted by name. Notes at the vault root belong to no folder.
    pub fn top_level_folders(&self) -> Vec<(String, usize)> {
        let mut folders: BTreeMap<&str, usize> = BTreeMap::new();
        for note in &self.notes {
            let top = note.folder.split('/').next().unwrap_or_default();
            if !top.is_empty() {
                *folders.entry(top).or_default() += 1;
            }
        }
        folders
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect()
    }

    /// Notes inside `filter`, most recently modified first; ties by path.
    pub fn newest_first(&self, filter: &FolderFilter) -> Vec<&Note> {
        let mut notes: Vec<&Note> = self
            .notes
            .iter()
            .filter(|n| filter.matches(&n.folder))
            .collect();
        notes.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
        notes
    }
}

pub fn scan_vault(config: &VaultConfig) -> VaultResult<ScanReport> {
    let root = &config.root;
    if !root.is_dir() {
        return Err(VaultError::MissingVault(root.display().to_string()));
    }

    let exclude_set = build_globset(&config.exclude_globs)?;
    let mut report = ScanReport::default();

    let walker = WalkDir::new(root)
        .follow_links(config.follow_symlinks)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped(e));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| relative_path(root, p))
                    .unwrap_or_default();
                tracing::warn!(path = %path, error = %e, "skipping unreadable vault entry");
                report.unreadable.push(UnreadableNote {
                    path,
                    message: e.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let rel_str = relative_path(root, entry.path());
        if !rel_str.ends_with(".md") {
            continue;
        }
        if exclude_set.is_match(&rel_str) {
            continue;
        }

        match read_note(entry.path(), &rel_str) {
            Ok(Some(note)) => report.notes.push(note),
            Ok(None) => {}
            Err(message) => {
                tracing::warn!(path = %rel_str, error = %message, "cannot read note");
                report.unreadable.push(UnreadableNote {
                    path: rel_str,
                    message,
                });
            }
        }
    }

    // Sort for deterministic ordering
    report.notes.sort_by(|a, b| a.path.cmp(&b.path));
    report.unreadable.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(report)
}

fn is_skipped(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    if name.starts_with('.') {
        return true;
    }
    entry.file_type().is_dir() && SYSTEM_DIRS.contains(&name.as_ref())
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Returns `Ok(None)` for zero-byte files, which are not notes.
fn read_note(path: &Path, relative_path: &str) -> std::result::Result<Option<Note>, String> {
    let metadata = std::fs::metadata(path).map_err(|e| e.to_string())?;
    if metadata.len() == 0 {
        return Ok(None);
    }

    let modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_default();

    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    let fingerprint = fingerprint(&bytes);
    let text = String::from_utf8(bytes).map_err(|e| format!("invalid UTF-8: {}", e))?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let title = extract_title(&text).unwrap_or(stem);

    Ok(Some(Note {
        path: relative_path.to_string(),
        title,
        folder: folder_of(relative_path),
        text,
        modified,
        fingerprint,
    }))
}

/// SHA-256 hex digest of raw note bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn folder_of(relative_path: &str) -> String {
    match relative_path.rfind('/') {
        Some(pos) => relative_path[..pos].to_string(),
        None => String::new(),
    }
}

/// Split a note into its YAML frontmatter (if any) and the byte offset where
/// the body starts.
pub fn split_frontmatter(text: &str) -> (Option<&str>, usize) {
    let first_len = if text.starts_with("---\n") {
        4
    } else if text.starts_with("---\r\n") {
        5
    } else {
        return (None, 0);
    };

    let mut offset = first_len;
    for line in text[first_len..].split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "---" || trimmed == "..." {
            let yaml = &text[first_len..offset];
            return (Some(yaml), offset + line.len());
        }
        offset += line.len();
    }
    (None, 0)
}

/// Title from frontmatter `title`, else the first level-one heading.
pub fn extract_title(text: &str) -> Option<String> {
    let (yaml, body_start) = split_frontmatter(text);
    if let Some(yaml) = yaml {
        if let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(yaml) {
            if let Some(title) = value.get("title").and_then(|t| t.as_str()) {
                let title = title.trim();
                if !title.is_empty() {
                    return Some(title.to_string());
                }
            }
        }
    }

    text[body_start..]
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
