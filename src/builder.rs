use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use byteorder::{LittleEndian, WriteBytesExt};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::codec::{CodecRegistry, DeltaCodec, BLOCK_DELTA_TAG};
use crate::command::{AddFile, Command, ExecuteStep, ModifyFile, RemoveFile};
use crate::diff::{DiffEntry, DiffKind};
use crate::error::{PatchError, Result};
use crate::patch_format::{TextEncoding, FORMAT_VERSION, MAGIC};
use crate::scratch;

const DELTA_FILE_NAME: &str = "patch.delta";

#[derive(Debug, Clone)]
pub struct BuilderOptions {
    /// Embed added files' contents. Without them, add commands carry codec 0
    /// and an empty payload.
    pub include_added_contents: bool,
    /// Codec used to encode every payload.
    pub codec_tag: u8,
    pub encoding: TextEncoding,
    /// Opaque bytes written after the version; the applier skips them.
    pub custom_header: Vec<u8>,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            include_added_contents: true,
            codec_tag: BLOCK_DELTA_TAG,
            encoding: TextEncoding::default(),
            custom_header: Vec::new(),
        }
    }
}

/// Reported once per command as its payload finishes compiling. Order follows
/// completion, not the command list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileEvent {
    Compiled { index: usize, summary: String },
}

/// Where a command's payload comes from before compilation.
#[derive(Debug, Clone)]
struct DeltaInput {
    source: Option<PathBuf>,
    target: PathBuf,
}

/// A command together with the builder-side state needed to produce its payload.
#[derive(Debug, Clone)]
pub struct PlannedCommand {
    pub command: Command,
    input: Option<DeltaInput>,
    compiled: Option<PathBuf>,
}

impl PlannedCommand {
    /// A command with no payload.
    pub fn bare(command: Command) -> Self {
        Self {
            command,
            input: None,
            compiled: None,
        }
    }

    pub fn execute_step(statement: impl Into<String>) -> Self {
        Self::bare(Command::ExecuteStep(ExecuteStep::shell(statement)))
    }

    pub fn needs_payload(&self) -> bool {
        self.input.is_some()
    }

    pub fn compiled_path(&self) -> Option<&Path> {
        self.compiled.as_deref()
    }

    /// Encode the payload into `<scratch>/<path>/patch.delta` and record its length.
    pub fn compile(&mut self, codec: &dyn DeltaCodec, scratch: &Path) -> Result<()> {
        let Some(input) = &self.input else {
            return Ok(());
        };
        let relative = self.command.path().unwrap_or_default();
        let dir = scratch.join(relative);
        fs::create_dir_all(&dir)?;
        let output = dir.join(DELTA_FILE_NAME);

        codec
            .encode(input.source.as_deref(), &input.target, &output)
            .map_err(|e| e.into_patch_error(codec.tag()))?;
        let len = fs::metadata(&output)?.len();

        match &mut self.command {
            Command::AddFile(c) => {
                c.codec_tag = codec.tag();
                c.payload_len = len;
            }
            Command::ModifyFile(c) => {
                c.codec_tag = codec.tag();
                c.payload_len = len;
            }
            Command::RemoveFile(_) | Command::ExecuteStep(_) => {}
        }
        debug!(command = %self.command, bytes = len, "payload compiled");
        self.compiled = Some(output);
        Ok(())
    }

    /// Write fixed fields followed by the compiled payload.
    pub fn write_to<W: Write + ?Sized>(&self, sink: &mut W, encoding: TextEncoding) -> Result<()> {
        if self.needs_payload() && self.compiled.is_none() {
            return Err(PatchError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has not been compiled", self.command),
            )));
        }

        self.command.write_fields(sink, encoding)?;

        if let Some(compiled) = &self.compiled {
            let expected = self.command.payload_len();
            let copied = std::io::copy(&mut File::open(compiled)?, sink)?;
            if copied != expected {
                return Err(PatchError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "payload of {} changed size: {copied} bytes, declared {expected}",
                        self.command
                    ),
                )));
            }
        }
        Ok(())
    }
}

/// Turns a tree diff into a patch container.
#[derive(Debug, Clone)]
pub struct PatchBuilder {
    old_root: PathBuf,
    new_root: PathBuf,
    registry: CodecRegistry,
    options: BuilderOptions,
}

impl PatchBuilder {
    pub fn new(old_root: impl Into<PathBuf>, new_root: impl Into<PathBuf>, registry: CodecRegistry) -> Self {
        Self {
            old_root: old_root.into(),
            new_root: new_root.into(),
            registry,
            options: BuilderOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BuilderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }

    /// One command per entry, in diff order.
    pub fn build_commands(&self, entries: &[DiffEntry]) -> Vec<PlannedCommand> {
        entries.iter().map(|entry| self.plan(entry)).collect()
    }

    fn plan(&self, entry: &DiffEntry) -> PlannedCommand {
        let path = entry.path.clone();
        let source_hash = entry.source_hash.clone().unwrap_or_default();
        let target_hash = entry.target_hash.clone().unwrap_or_default();

        match entry.kind {
            DiffKind::Added => {
                let input = self.options.include_added_contents.then(|| DeltaInput {
                    source: None,
                    target: self.new_root.join(&path),
                });
                PlannedCommand {
                    command: Command::AddFile(AddFile {
                        path,
                        target_hash,
                        overwrite: true,
                        codec_tag: 0,
                        payload_len: 0,
                    }),
                    input,
                    compiled: None,
                }
            }
            DiffKind::Removed => PlannedCommand::bare(Command::RemoveFile(RemoveFile {
                path,
                ignore_missing: false,
            })),
            DiffKind::Modified => PlannedCommand {
                input: Some(DeltaInput {
                    source: Some(self.old_root.join(&path)),
                    target: self.new_root.join(&path),
                }),
                command: Command::ModifyFile(ModifyFile {
                    path,
                    source_hash,
                    target_hash,
                    codec_tag: 0,
                    payload_len: 0,
                }),
                compiled: None,
            },
        }
    }

    /// Produce every payload. Commands are independent, so this fans out over
    /// the rayon pool; each writes only under its own path in `scratch`.
    pub fn compile(
        &self,
        commands: &mut [PlannedCommand],
        scratch: &Path,
        progress: Option<&Sender<CompileEvent>>,
    ) -> Result<()> {
        if !commands.iter().any(PlannedCommand::needs_payload) {
            return Ok(());
        }
        let codec = self.registry.resolve(self.options.codec_tag)?;

        commands
            .par_iter_mut()
            .enumerate()
            .try_for_each_with(progress.cloned(), |tx, (index, planned)| -> Result<()> {
                planned.compile(codec.as_ref(), scratch)?;
                if let Some(tx) = tx {
                    // A dropped receiver only means nobody is watching.
                    let _ = tx.send(CompileEvent::Compiled {
                        index,
                        summary: planned.command.to_string(),
                    });
                }
                Ok(())
            })
    }

    /// Write the container. Strictly sequential, in command order.
    pub fn serialize<W: Write + ?Sized>(&self, commands: &[PlannedCommand], sink: &mut W) -> Result<()> {
        let header_len = i32::try_from(self.options.custom_header.len()).map_err(|_| {
            PatchError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "custom header too large",
            ))
        })?;
        let count = i32::try_from(commands.len()).map_err(|_| {
            PatchError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "too many commands",
            ))
        })?;

        sink.write_u32::<LittleEndian>(MAGIC)?;
        sink.write_i32::<LittleEndian>(FORMAT_VERSION)?;
        sink.write_i32::<LittleEndian>(header_len)?;
        sink.write_all(&self.options.custom_header)?;
        sink.write_i32::<LittleEndian>(count)?;

        for planned in commands {
            planned.write_to(sink, self.options.encoding)?;
        }
        Ok(())
    }

    /// Compile and serialize into `output`, using a scratch area under
    /// `temp_root` that is removed afterwards. Returns the container size.
    ///
    /// An existing `output` is refused before anything is written unless
    /// `overwrite` is set. A failure while writing leaves a truncated file.
    pub fn write_patch_file(
        &self,
        commands: &mut [PlannedCommand],
        output: &Path,
        overwrite: bool,
        temp_root: Option<&Path>,
        progress: Option<&Sender<CompileEvent>>,
    ) -> Result<u64> {
        if output.exists() && !overwrite {
            return Err(PatchError::OutputExists(output.to_path_buf()));
        }

        let scratch = scratch::acquire(temp_root)?;
        self.compile(commands, scratch.path(), progress)?;

        let file = if overwrite {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(output)?
        } else {
            OpenOptions::new().write(true).create_new(true).open(output)?
        };
        let mut writer = BufWriter::new(file);
        self.serialize(commands, &mut writer)?;
        writer.flush()?;
        drop(writer);

        let size = fs::metadata(output)?.len();
        info!(
            output = %output.display(),
            commands = commands.len(),
            bytes = size,
            "patch written"
        );
        Ok(size)
    }
}
