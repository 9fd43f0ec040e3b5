use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use crate::builder::{BuilderOptions, CompileEvent, PatchBuilder, PlannedCommand};
use crate::codec::CodecRegistry;
use crate::command::Command;
use crate::diff::{self, DiffKind};
use crate::scan::TreeScanner;

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub old_dir: PathBuf,
    pub new_dir: PathBuf,
    pub output: PathBuf,
    pub excludes: Vec<String>,
    pub includes: Vec<String>,
    /// Statements appended as execute steps after all file commands.
    pub execute: Vec<String>,
    pub overwrite: bool,
    pub temp_dir: Option<PathBuf>,
    pub builder: BuilderOptions,
    pub registry: CodecRegistry,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSummary {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_removed: usize,
    pub statements: usize,
    pub patch_size: u64,
    /// Every command in container order.
    pub commands: Vec<Command>,
}

/// Diff `old_dir` against `new_dir` and write the patch container.
/// Uses Tokio for the concurrent tree walks and Rayon (inside the builder) for
/// hashing and payload compilation.
pub async fn create_patch(options: CreateOptions) -> Result<CreateSummary> {
    // Stage 1: walk both trees concurrently
    let scanner = TreeScanner::new(options.excludes.clone(), options.includes.clone());
    let old_dir = options.old_dir.clone();
    let new_dir = options.new_dir.clone();
    let old_scanner = scanner.clone();
    let (old_files, new_files) = tokio::try_join!(
        tokio::task::spawn_blocking(move || old_scanner.scan(&old_dir)),
        tokio::task::spawn_blocking(move || scanner.scan(&new_dir)),
    )?;
    let old_files = old_files
        .with_context(|| format!("Failed to scan old directory: {}", options.old_dir.display()))?;
    let new_files = new_files
        .with_context(|| format!("Failed to scan new directory: {}", options.new_dir.display()))?;

    // Stage 2: hash and classify
    let old_root = options.old_dir.clone();
    let new_root = options.new_dir.clone();
    let entries = tokio::task::spawn_blocking(move || {
        diff::diff_scanned(&old_root, &old_files, &new_root, &new_files)
    })
    .await?
    .context("Failed to compare directories")?;

    let mut summary = CreateSummary::default();
    for entry in &entries {
        match entry.kind {
            DiffKind::Added => summary.files_added += 1,
            DiffKind::Modified => summary.files_modified += 1,
            DiffKind::Removed => summary.files_removed += 1,
        }
    }
    summary.statements = options.execute.len();

    // Stage 3: compile payloads and write the container
    let (tx, rx) = mpsc::channel::<CompileEvent>();
    let total = entries.len() + options.execute.len();
    let progress = tokio::task::spawn_blocking(move || {
        for (done, CompileEvent::Compiled { summary, .. }) in rx.iter().enumerate() {
            tracing::debug!("compiled {}/{}: {}", done + 1, total, summary);
        }
    });

    let build = tokio::task::spawn_blocking(move || -> Result<(u64, Vec<Command>)> {
        let builder = PatchBuilder::new(&options.old_dir, &options.new_dir, options.registry)
            .with_options(options.builder);
        let mut commands = builder.build_commands(&entries);
        commands.extend(options.execute.iter().map(PlannedCommand::execute_step));

        let size = builder
            .write_patch_file(
                &mut commands,
                &options.output,
                options.overwrite,
                options.temp_dir.as_deref(),
                Some(&tx),
            )
            .with_context(|| format!("Failed to write patch file: {}", options.output.display()))?;
        Ok((size, commands.into_iter().map(|p| p.command).collect()))
    });

    let (size, commands) = build.await??;
    progress.await?;

    summary.patch_size = size;
    summary.commands = commands;
    Ok(summary)
}

/// Render the patch info report: creation time, size and one tab-indented line
/// per command.
pub fn render_report(summary: &CreateSummary, created: DateTime<Local>) -> String {
    let mut report = String::new();
    let _ = writeln!(report);
    let _ = writeln!(report, "Patch Info");
    let _ = writeln!(report);
    let _ = writeln!(report, "Created: {}", created.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(report, "Patch size: {} bytes", summary.patch_size);
    let _ = writeln!(report, "Created commands: {}", summary.commands.len());
    let _ = writeln!(report);
    let _ = writeln!(report, "Commands:");
    for command in &summary.commands {
        let _ = writeln!(
            report,
            "\t{:<15}{}",
            command.kind().to_string(),
            command.subject()
        );
    }
    report
}

/// Write the patch info report for a finished run to `path`.
pub fn write_report(summary: &CreateSummary, path: &Path) -> Result<()> {
    fs::write(path, render_report(summary, Local::now()))
        .with_context(|| format!("Failed to write log file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RemoveFile;
    use chrono::TimeZone;

    #[test]
    fn test_report_lists_commands() {
        let summary = CreateSummary {
            files_removed: 1,
            patch_size: 42,
            commands: vec![Command::RemoveFile(RemoveFile {
                path: "old/readme.txt".into(),
                ignore_missing: false,
            })],
            ..CreateSummary::default()
        };
        let created = Local.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();

        let report = render_report(&summary, created);
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines[1], "Patch Info");
        assert_eq!(lines[3], "Created: 2024-03-01 09:30:00");
        assert_eq!(lines[4], "Patch size: 42 bytes");
        assert_eq!(lines[5], "Created commands: 1");
        assert_eq!(lines[7], "Commands:");
        assert_eq!(lines[8], format!("\t{:<15}old/readme.txt", "RemoveFile"));
        assert_eq!(lines.len(), 9);
    }
}
