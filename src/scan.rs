use std::path::Path;

use walkdir::WalkDir;

use crate::error::{PatchError, Result};

/// Lists the files under a root as forward-slash relative paths.
///
/// Filtering is by exact string match only: a path is dropped when it appears
/// in `excludes` and not in `includes`.
#[derive(Debug, Clone, Default)]
pub struct TreeScanner {
    excludes: Vec<String>,
    includes: Vec<String>,
}

impl TreeScanner {
    pub fn new(excludes: Vec<String>, includes: Vec<String>) -> Self {
        Self { excludes, includes }
    }

    /// Walk `root` and return every non-ignored file in directory-walk order.
    pub fn scan(&self, root: &Path) -> Result<Vec<String>> {
        let mut files = Vec::new();

        for entry in WalkDir::new(root).min_depth(1) {
            let entry = entry.map_err(|e| {
                PatchError::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::other(format!("directory loop under {}", root.display()))
                }))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = normalize_relative_path(entry.path(), root)?;
            if !self.is_ignored(&relative) {
                files.push(relative);
            }
        }

        Ok(files)
    }

    pub fn is_ignored(&self, relative: &str) -> bool {
        self.excludes.iter().any(|e| e == relative) && !self.includes.iter().any(|i| i == relative)
    }
}

/// Strip `root` from `path`, convert separators to `/` and trim a leading `/`.
pub fn normalize_relative_path(path: &Path, root: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        PatchError::UnsafePath(format!(
            "{} is not under {}",
            path.display(),
            root.display()
        ))
    })?;
    let text = relative.to_str().ok_or_else(|| {
        PatchError::InvalidString(format!("non-UTF8 path: {}", relative.display()))
    })?;
    Ok(text.replace('\\', "/").trim_start_matches('/').to_string())
}
