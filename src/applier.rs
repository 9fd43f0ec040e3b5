use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::{debug, info};

use crate::codec::CodecRegistry;
use crate::command::Command;
use crate::error::{PatchError, Result};
use crate::execute::ExecContext;
use crate::patch_format::{PatchHeader, TextEncoding, FORMAT_VERSION, MAGIC, MIN_HEADER_LEN};
use crate::scratch;

/// Lifecycle of a [`PatchApplier`]. Construction reads the header, so there is
/// no unopened value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
    HeaderRead,
    Applying,
    Done,
    Failed,
}

/// Progress of an apply run. `Started` and `Completed` bracket the execution
/// of the same command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyEvent {
    Skipped { index: usize, command: Command },
    Started { index: usize, command: Command },
    Completed { index: usize, command: Command },
}

impl ApplyEvent {
    pub fn index(&self) -> usize {
        match self {
            ApplyEvent::Skipped { index, .. }
            | ApplyEvent::Started { index, .. }
            | ApplyEvent::Completed { index, .. } => *index,
        }
    }

    pub fn command(&self) -> &Command {
        match self {
            ApplyEvent::Skipped { command, .. }
            | ApplyEvent::Started { command, .. }
            | ApplyEvent::Completed { command, .. } => command,
        }
    }
}

/// Reads a patch container and replays it against a directory.
pub struct PatchApplier<R> {
    reader: R,
    header: PatchHeader,
    header_offset: u64,
    commands_offset: u64,
    registry: CodecRegistry,
    encoding: TextEncoding,
    state: ApplierState,
}

impl<R: Read + Seek> PatchApplier<R> {
    pub fn open(reader: R, registry: CodecRegistry) -> Result<Self> {
        Self::open_with_encoding(reader, registry, TextEncoding::default())
    }

    /// Validate and read the header. The stream length is checked before
    /// any field is read.
    pub fn open_with_encoding(
        mut reader: R,
        registry: CodecRegistry,
        encoding: TextEncoding,
    ) -> Result<Self> {
        let start = reader.stream_position()?;
        let end = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(start))?;
        let len = end.saturating_sub(start);
        if len < MIN_HEADER_LEN {
            return Err(PatchError::TruncatedHeader {
                len,
                needed: MIN_HEADER_LEN,
            });
        }

        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(PatchError::CorruptHeader(format!(
                "magic 0x{magic:08X}, expected 0x{MAGIC:08X}"
            )));
        }

        let version = reader.read_i32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(PatchError::UnsupportedVersion(version));
        }

        let custom_header_len = reader.read_i32::<LittleEndian>()?;
        let custom = u64::try_from(custom_header_len).map_err(|_| {
            PatchError::CorruptHeader(format!("negative custom header length {custom_header_len}"))
        })?;
        if len < MIN_HEADER_LEN + custom {
            return Err(PatchError::TruncatedHeader {
                len,
                needed: MIN_HEADER_LEN + custom,
            });
        }
        let header_offset = reader.stream_position()?;
        reader.seek(SeekFrom::Current(i64::from(custom_header_len)))?;

        let command_count = reader.read_i32::<LittleEndian>()?;
        if command_count < 0 {
            return Err(PatchError::CorruptHeader(format!(
                "negative command count {command_count}"
            )));
        }
        let commands_offset = reader.stream_position()?;

        debug!(version, custom_header_len, command_count, "patch header read");

        Ok(Self {
            reader,
            header: PatchHeader {
                version,
                custom_header_len,
                command_count,
            },
            header_offset,
            commands_offset,
            registry,
            encoding,
            state: ApplierState::HeaderRead,
        })
    }

    pub fn header(&self) -> &PatchHeader {
        &self.header
    }

    pub fn command_count(&self) -> usize {
        self.header.command_count as usize
    }

    pub fn state(&self) -> ApplierState {
        self.state
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn expect_state(&self, expected: ApplierState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PatchError::InvalidState(self.state, expected))
        }
    }

    /// Opaque custom header bytes. The core never interprets them.
    pub fn read_custom_header(&mut self) -> Result<Vec<u8>> {
        self.expect_state(ApplierState::HeaderRead)?;
        self.reader.seek(SeekFrom::Start(self.header_offset))?;
        let mut bytes = vec![0u8; self.header.custom_header_len as usize];
        self.reader.read_exact(&mut bytes)?;
        self.reader.seek(SeekFrom::Start(self.commands_offset))?;
        Ok(bytes)
    }

    /// Decode every command's fixed fields without executing anything.
    pub fn commands(&mut self) -> Result<Vec<Command>> {
        self.expect_state(ApplierState::HeaderRead)?;
        self.reader.seek(SeekFrom::Start(self.commands_offset))?;

        // The count is untrusted until the commands are actually read.
        let mut commands = Vec::new();
        for _ in 0..self.command_count() {
            let command = Command::read(&mut self.reader, self.encoding)?;
            command.skip(&mut self.reader)?;
            commands.push(command);
        }

        self.reader.seek(SeekFrom::Start(self.commands_offset))?;
        Ok(commands)
    }

    /// Step through the patch one event at a time. The first `skip` commands
    /// are stepped over without touching the filesystem.
    pub fn steps<'a>(
        &'a mut self,
        target_root: &'a Path,
        scratch: &'a Path,
        skip: usize,
    ) -> Result<ApplySteps<'a, R>> {
        self.expect_state(ApplierState::HeaderRead)?;
        self.reader.seek(SeekFrom::Start(self.commands_offset))?;
        self.state = ApplierState::Applying;

        Ok(ApplySteps {
            applier: self,
            target_root,
            scratch,
            skip,
            next_index: 0,
            pending: None,
            finished: false,
        })
    }

    /// Apply the whole patch and return how many commands were executed.
    ///
    /// Any command failure stops the run; commands before it stay applied.
    /// Re-run with `skip` set to the number of commands that completed to
    /// resume after fixing the cause.
    pub fn apply(&mut self, target_root: &Path, temp_root: Option<&Path>, skip: usize) -> Result<usize> {
        let scratch = scratch::acquire(temp_root)?;
        let mut executed = 0;
        for event in self.steps(target_root, scratch.path(), skip)? {
            if let ApplyEvent::Completed { .. } = event? {
                executed += 1;
            }
        }
        Ok(executed)
    }
}

/// Iterator over the events of one apply run. Stops after the first error.
pub struct ApplySteps<'a, R> {
    applier: &'a mut PatchApplier<R>,
    target_root: &'a Path,
    scratch: &'a Path,
    skip: usize,
    next_index: usize,
    pending: Option<(usize, Command)>,
    finished: bool,
}

impl<R: Read + Seek> ApplySteps<'_, R> {
    fn fail(&mut self, err: PatchError) -> PatchError {
        self.finished = true;
        self.applier.state = ApplierState::Failed;
        err
    }

    fn run(&mut self, index: usize, command: Command) -> Result<ApplyEvent> {
        let ctx = ExecContext {
            target_root: self.target_root,
            scratch: self.scratch,
            registry: &self.applier.registry,
        };
        match command.execute(&mut self.applier.reader, &ctx) {
            Ok(()) => {
                debug!(index, %command, "command completed");
                Ok(ApplyEvent::Completed { index, command })
            }
            Err(err) => {
                let err = err.in_command(index, command.kind(), command.subject());
                Err(self.fail(err))
            }
        }
    }

    fn advance(&mut self) -> Result<Option<ApplyEvent>> {
        if self.next_index >= self.applier.command_count() {
            self.finished = true;
            self.applier.state = ApplierState::Done;
            return Ok(None);
        }

        let index = self.next_index;
        self.next_index += 1;
        let command = Command::read(&mut self.applier.reader, self.applier.encoding)?;

        if index < self.skip {
            command.skip(&mut self.applier.reader)?;
            debug!(index, %command, "command skipped");
            return Ok(Some(ApplyEvent::Skipped { index, command }));
        }

        info!(index, %command, "applying");
        self.pending = Some((index, command.clone()));
        Ok(Some(ApplyEvent::Started { index, command }))
    }
}

impl<R: Read + Seek> Iterator for ApplySteps<'_, R> {
    type Item = Result<ApplyEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Some((index, command)) = self.pending.take() {
            return Some(self.run(index, command));
        }
        match self.advance() {
            Ok(event) => event.map(Ok),
            Err(err) => Some(Err(self.fail(err))),
        }
    }
}
