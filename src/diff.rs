//! Change detection between a vault scan and the index ledger.
//!
//! [`detect_changes`] is a pure function: it classifies every scanned note
//! and every ledger row into disjoint sets without touching disk, database
//! or network.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::models::{IndexEntry, Note};

/// Disjoint classification of note paths, each list sorted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Scanned notes with no ledger row (or whose vectors are missing).
    pub added: Vec<String>,
    /// Scanned notes whose fingerprint or embedding model changed.
    pub updated: Vec<String>,
    /// Ledger rows whose note is no longer in the vault.
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
    /// Vector index keys with neither a ledger row nor a note on disk.
    pub orphans: Vec<String>,
    /// Ledger rows whose vectors were missing from the index; also in `added`.
    pub inconsistent: Vec<String>,
}

impl ChangeSet {
    /// Number of notes that need work in an incremental run.
    pub fn pending(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len() + self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }
}

/// Classify notes for an incremental sync.
///
/// * `unreadable`: paths that exist but failed to read this scan. They are
///   never reported as deleted, so their index entries survive until the
///   file can be read again. A directory path covers every note beneath it.
/// * `indexed_keys`: note keys present in the vector index, when known.
/// * `embedding_model`: entries embedded with another model are `updated`.
pub fn detect_changes(
    scan: &[Note],
    ledger: &HashMap<String, IndexEntry>,
    unreadable: &HashSet<String>,
    indexed_keys: Option<&HashSet<String>>,
    embedding_model: &str,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let mut seen: HashSet<&str> = HashSet::with_capacity(scan.len());

    for note in scan {
        seen.insert(note.path.as_str());
        match ledger.get(&note.path) {
            None => changes.added.push(note.path.clone()),
            Some(_) if indexed_keys.is_some_and(|keys| !keys.contains(&note.path)) => {
                changes.inconsistent.push(note.path.clone());
                changes.added.push(note.path.clone());
            }
            Some(entry)
                if entry.content_hash != note.fingerprint
                    || entry.embedding_model != embedding_model =>
            {
                changes.updated.push(note.path.clone())
            }
            Some(_) => changes.unchanged.push(note.path.clone()),
        }
    }

    for path in ledger.keys() {
        if !seen.contains(path.as_str()) && !covered_by_unreadable(path, unreadable) {
            changes.deleted.push(path.clone());
        }
    }

    if let Some(keys) = indexed_keys {
        let orphans: BTreeSet<&String> = keys
            .iter()
            .filter(|k| {
                !ledger.contains_key(*k)
                    && !seen.contains(k.as_str())
                    && !covered_by_unreadable(k, unreadable)
            })
            .collect();
        changes.orphans = orphans.into_iter().cloned().collect();
    }

    changes.added.sort();
    changes.updated.sort();
    changes.deleted.sort();
    changes.unchanged.sort();
    changes.inconsistent.sort();
    changes
}

fn covered_by_unreadable(path: &str, unreadable: &HashSet<String>) -> bool {
    unreadable.contains(path)
        || unreadable
            .iter()
            .any(|dir| path.strip_prefix(dir.as_str()).is_some_and(|rest| rest.starts_with('/')))
}
