use std::path::Path;

use tempfile::TempDir;

/// Acquire an exclusively owned working directory for one compile or apply
/// run. It is created inside `root` (or the system temp dir) and removed with
/// everything in it when the guard drops, on success and on error alike.
pub fn acquire(root: Option<&Path>) -> std::io::Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("dirpatch-");
    let dir = match root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)?
        }
        None => builder.tempdir()?,
    };
    tracing::debug!(path = %dir.path().display(), "scratch directory acquired");
    Ok(dir)
}
