use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::applier::{ApplyEvent, PatchApplier};
use crate::codec::CodecRegistry;
use crate::command::{Command, CommandKind};
use crate::patch_format::{PatchHeader, TextEncoding};
use crate::scratch;

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub target_dir: PathBuf,
    pub patch_path: PathBuf,
    pub temp_dir: Option<PathBuf>,
    /// Number of leading commands to step over, for resuming a failed run.
    pub skip: usize,
    pub registry: CodecRegistry,
    pub encoding: TextEncoding,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_removed: usize,
    pub statements: usize,
    pub skipped: usize,
}

impl ApplySummary {
    pub fn executed(&self) -> usize {
        self.files_added + self.files_modified + self.files_removed + self.statements
    }

    fn record(&mut self, command: &Command) {
        match command.kind() {
            CommandKind::AddFile => self.files_added += 1,
            CommandKind::ModifyFile => self.files_modified += 1,
            CommandKind::RemoveFile => self.files_removed += 1,
            CommandKind::ExecuteStep => self.statements += 1,
        }
    }
}

/// Header and command list of a patch file, without touching any target.
#[derive(Debug, Clone)]
pub struct PatchListing {
    pub header: PatchHeader,
    pub custom_header: Vec<u8>,
    pub commands: Vec<Command>,
}

fn open_patch(
    path: &Path,
    registry: CodecRegistry,
    encoding: TextEncoding,
) -> Result<PatchApplier<BufReader<File>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open patch file: {}", path.display()))?;
    PatchApplier::open_with_encoding(BufReader::new(file), registry, encoding)
        .with_context(|| format!("Failed to read patch header: {}", path.display()))
}

/// Apply a patch file to the target directory.
/// Commands run strictly in order on a blocking thread; a failure stops the run
/// and leaves earlier commands applied.
pub async fn apply_patch(options: ApplyOptions) -> Result<ApplySummary> {
    tokio::task::spawn_blocking(move || apply_blocking(&options)).await?
}

fn apply_blocking(options: &ApplyOptions) -> Result<ApplySummary> {
    if !options.target_dir.is_dir() {
        anyhow::bail!(
            "Target directory does not exist: {}",
            options.target_dir.display()
        );
    }

    let mut applier = open_patch(
        &options.patch_path,
        options.registry.clone(),
        options.encoding,
    )?;
    tracing::info!(
        patch = %options.patch_path.display(),
        commands = applier.command_count(),
        skip = options.skip,
        "applying patch"
    );

    let scratch = scratch::acquire(options.temp_dir.as_deref())
        .context("Failed to create temporary directory")?;

    let mut summary = ApplySummary::default();
    for event in applier.steps(&options.target_dir, scratch.path(), options.skip)? {
        match event {
            Ok(ApplyEvent::Skipped { .. }) => summary.skipped += 1,
            Ok(ApplyEvent::Started { .. }) => {}
            Ok(ApplyEvent::Completed { command, .. }) => summary.record(&command),
            Err(err) => {
                let done = summary.skipped + summary.executed();
                return Err(err).with_context(|| {
                    format!(
                        "Patch stopped after {done} commands; fix the cause and re-run with --skip {done}"
                    )
                });
            }
        }
    }

    Ok(summary)
}

/// Read a patch file's header and decode every command without applying it.
pub async fn inspect_patch(patch_path: PathBuf, encoding: TextEncoding) -> Result<PatchListing> {
    tokio::task::spawn_blocking(move || -> Result<PatchListing> {
        let mut applier = open_patch(&patch_path, CodecRegistry::new(), encoding)?;
        let custom_header = applier.read_custom_header()?;
        let commands = applier
            .commands()
            .with_context(|| format!("Failed to decode commands: {}", patch_path.display()))?;
        Ok(PatchListing {
            header: applier.header().clone(),
            custom_header,
            commands,
        })
    })
    .await?
}
