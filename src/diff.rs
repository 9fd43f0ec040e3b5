use std::collections::HashSet;
use std::path::Path;

use rayon::prelude::*;
use tracing::debug;

use crate::error::Result;
use crate::hash;
use crate::scan::TreeScanner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Added,
    Removed,
    Modified,
}

/// One difference between two trees.
///
/// Added entries carry only `target_hash`, removed entries only `source_hash`,
/// modified entries both (and they always differ).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub kind: DiffKind,
    pub path: String,
    pub source_hash: Option<String>,
    pub target_hash: Option<String>,
}

impl DiffEntry {
    pub fn added(path: impl Into<String>, target_hash: impl Into<String>) -> Self {
        Self {
            kind: DiffKind::Added,
            path: path.into(),
            source_hash: None,
            target_hash: Some(target_hash.into()),
        }
    }

    pub fn removed(path: impl Into<String>, source_hash: impl Into<String>) -> Self {
        Self {
            kind: DiffKind::Removed,
            path: path.into(),
            source_hash: Some(source_hash.into()),
            target_hash: None,
        }
    }

    pub fn modified(
        path: impl Into<String>,
        source_hash: impl Into<String>,
        target_hash: impl Into<String>,
    ) -> Self {
        Self {
            kind: DiffKind::Modified,
            path: path.into(),
            source_hash: Some(source_hash.into()),
            target_hash: Some(target_hash.into()),
        }
    }
}

/// Compare two directory trees.
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    scanner: TreeScanner,
}

impl DiffEngine {
    pub fn new(scanner: TreeScanner) -> Self {
        Self { scanner }
    }

    pub fn diff(&self, old_root: &Path, new_root: &Path) -> Result<Vec<DiffEntry>> {
        let old_files = self.scanner.scan(old_root)?;
        let new_files = self.scanner.scan(new_root)?;
        diff_scanned(old_root, &old_files, new_root, &new_files)
    }
}

/// Build the diff from two already scanned path lists.
///
/// Removed entries come first in old-scan order, then added and modified
/// entries interleaved in new-scan order. Hashing runs on the rayon pool;
/// `collect` keeps input order.
pub fn diff_scanned(
    old_root: &Path,
    old_files: &[String],
    new_root: &Path,
    new_files: &[String],
) -> Result<Vec<DiffEntry>> {
    let old_set: HashSet<&str> = old_files.iter().map(String::as_str).collect();
    let new_set: HashSet<&str> = new_files.iter().map(String::as_str).collect();

    let removed: Vec<DiffEntry> = old_files
        .par_iter()
        .filter(|path| !new_set.contains(path.as_str()))
        .map(|path| -> Result<DiffEntry> {
            let hash = hash::hash_file(&old_root.join(path))?;
            Ok(DiffEntry::removed(path.as_str(), hash))
        })
        .collect::<Result<_>>()?;

    let changed: Vec<Option<DiffEntry>> = new_files
        .par_iter()
        .map(|path| -> Result<Option<DiffEntry>> {
            let new_hash = hash::hash_file(&new_root.join(path))?;
            if !old_set.contains(path.as_str()) {
                return Ok(Some(DiffEntry::added(path.as_str(), new_hash)));
            }
            let old_hash = hash::hash_file(&old_root.join(path))?;
            if old_hash == new_hash {
                Ok(None)
            } else {
                Ok(Some(DiffEntry::modified(path.as_str(), old_hash, new_hash)))
            }
        })
        .collect::<Result<_>>()?;

    let mut entries = removed;
    entries.extend(changed.into_iter().flatten());

    debug!(
        old = old_files.len(),
        new = new_files.len(),
        entries = entries.len(),
        "diff computed"
    );

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree(root: &Path, files: &[(&str, &str)]) {
        for (rel, content) in files {
            let full = root.join(rel);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
    }

    #[test]
    fn test_same_tree_has_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        tree(dir.path(), &[("a.txt", "hi"), ("sub/b.txt", "bye")]);

        let entries = DiffEngine::default().diff(dir.path(), dir.path()).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_removed_then_added() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        tree(&old, &[("a.txt", "hi"), ("b.txt", "bye")]);
        tree(&new, &[("a.txt", "hi"), ("c.txt", "new")]);

        let entries = DiffEngine::default().diff(&old, &new).unwrap();
        assert_eq!(
            entries,
            vec![
                DiffEntry::removed("b.txt", hash::hash_bytes(b"bye")),
                DiffEntry::added("c.txt", hash::hash_bytes(b"new")),
            ]
        );
    }

    #[test]
    fn test_modified_carries_both_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        tree(&old, &[("cfg/app.ini", "v=1")]);
        tree(&new, &[("cfg/app.ini", "v=2")]);

        let entries = DiffEngine::default().diff(&old, &new).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.kind, DiffKind::Modified);
        assert_eq!(entry.path, "cfg/app.ini");
        assert_ne!(entry.source_hash, entry.target_hash);
    }

    #[test]
    fn test_excluded_files_are_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        tree(&old, &[("keep.txt", "1"), ("local.cfg", "mine")]);
        tree(&new, &[("keep.txt", "1"), ("local.cfg", "theirs")]);

        let engine = DiffEngine::new(TreeScanner::new(vec!["local.cfg".into()], vec![]));
        assert!(engine.diff(&old, &new).unwrap().is_empty());
    }
}
