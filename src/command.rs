//! Patch commands and their on-disk layout.
//!
//! Every command is written as an `i32` tag followed by fixed fields. Add and
//! modify commands end with `codec_tag: u8`, `payload_len: i64` and exactly
//! `payload_len` payload bytes, so a reader can always step over a payload it
//! does not execute.

use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{PatchError, Result};
use crate::patch_format::{
    read_bool, read_payload_len, read_string, write_bool, write_payload_len, write_string,
    CommandTag, TextEncoding,
};

/// Interpreter tag for the platform shell.
pub const SHELL_INTERPRETER: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    AddFile,
    RemoveFile,
    ModifyFile,
    ExecuteStep,
}

impl CommandKind {
    pub fn tag(self) -> CommandTag {
        match self {
            CommandKind::AddFile => CommandTag::AddFile,
            CommandKind::RemoveFile => CommandTag::RemoveFile,
            CommandKind::ModifyFile => CommandTag::ModifyFile,
            CommandKind::ExecuteStep => CommandTag::ExecuteStep,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::AddFile => "AddFile",
            CommandKind::RemoveFile => "RemoveFile",
            CommandKind::ModifyFile => "ModifyFile",
            CommandKind::ExecuteStep => "Execute",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddFile {
    pub path: String,
    pub target_hash: String,
    pub overwrite: bool,
    /// 0 when the file contents were not included.
    pub codec_tag: u8,
    pub payload_len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveFile {
    pub path: String,
    pub ignore_missing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyFile {
    pub path: String,
    pub source_hash: String,
    pub target_hash: String,
    pub codec_tag: u8,
    pub payload_len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteStep {
    pub interpreter_tag: u8,
    pub statement: String,
    /// Carried for authoring tools; the applier does not wait on the process.
    pub ignore_errors: bool,
}

impl ExecuteStep {
    pub fn shell(statement: impl Into<String>) -> Self {
        Self {
            interpreter_tag: SHELL_INTERPRETER,
            statement: statement.into(),
            ignore_errors: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddFile(AddFile),
    RemoveFile(RemoveFile),
    ModifyFile(ModifyFile),
    ExecuteStep(ExecuteStep),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::AddFile(_) => CommandKind::AddFile,
            Command::RemoveFile(_) => CommandKind::RemoveFile,
            Command::ModifyFile(_) => CommandKind::ModifyFile,
            Command::ExecuteStep(_) => CommandKind::ExecuteStep,
        }
    }

    /// Relative file path for file commands.
    pub fn path(&self) -> Option<&str> {
        match self {
            Command::AddFile(c) => Some(&c.path),
            Command::RemoveFile(c) => Some(&c.path),
            Command::ModifyFile(c) => Some(&c.path),
            Command::ExecuteStep(_) => None,
        }
    }

    /// What to show next to the kind in logs and errors.
    pub fn subject(&self) -> &str {
        match self {
            Command::ExecuteStep(c) => &c.statement,
            other => other.path().unwrap_or_default(),
        }
    }

    pub fn payload_len(&self) -> u64 {
        match self {
            Command::AddFile(c) => c.payload_len,
            Command::ModifyFile(c) => c.payload_len,
            Command::RemoveFile(_) | Command::ExecuteStep(_) => 0,
        }
    }

    /// Read the tag and fixed fields of the next command. The payload, if
    /// any, is left unread.
    pub fn read<R: Read + ?Sized>(reader: &mut R, encoding: TextEncoding) -> Result<Self> {
        let tag = CommandTag::from_i32(reader.read_i32::<LittleEndian>()?)?;
        Self::decode(tag, reader, encoding)
    }

    pub fn decode<R: Read + ?Sized>(
        tag: CommandTag,
        reader: &mut R,
        encoding: TextEncoding,
    ) -> Result<Self> {
        let command = match tag {
            CommandTag::AddFile => Command::AddFile(AddFile {
                path: read_string(reader, encoding)?,
                target_hash: read_string(reader, encoding)?,
                overwrite: read_bool(reader)?,
                codec_tag: reader.read_u8()?,
                payload_len: read_payload_len(reader)?,
            }),
            CommandTag::RemoveFile => Command::RemoveFile(RemoveFile {
                path: read_string(reader, encoding)?,
                ignore_missing: read_bool(reader)?,
            }),
            CommandTag::ModifyFile => Command::ModifyFile(ModifyFile {
                path: read_string(reader, encoding)?,
                source_hash: read_string(reader, encoding)?,
                target_hash: read_string(reader, encoding)?,
                codec_tag: reader.read_u8()?,
                payload_len: read_payload_len(reader)?,
            }),
            CommandTag::ExecuteStep => Command::ExecuteStep(ExecuteStep {
                interpreter_tag: reader.read_u8()?,
                statement: read_string(reader, encoding)?,
                ignore_errors: read_bool(reader)?,
            }),
        };
        Ok(command)
    }

    /// Advance past this command's payload without reading it.
    pub fn skip<R: Seek + ?Sized>(&self, reader: &mut R) -> Result<()> {
        let len = self.payload_len();
        if len > 0 {
            let offset = i64::try_from(len).map_err(|_| {
                PatchError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("payload length {len} out of range"),
                ))
            })?;
            reader.seek(SeekFrom::Current(offset))?;
        }
        Ok(())
    }

    /// Write the tag and fixed fields. For add and modify commands the caller
    /// must follow with exactly `payload_len` bytes.
    pub fn write_fields<W: Write + ?Sized>(
        &self,
        writer: &mut W,
        encoding: TextEncoding,
    ) -> Result<()> {
        writer.write_i32::<LittleEndian>(self.kind().tag() as i32)?;
        match self {
            Command::AddFile(c) => {
                write_string(writer, &c.path, encoding)?;
                write_string(writer, &c.target_hash, encoding)?;
                write_bool(writer, c.overwrite)?;
                writer.write_u8(c.codec_tag)?;
                write_payload_len(writer, c.payload_len)?;
            }
            Command::RemoveFile(c) => {
                write_string(writer, &c.path, encoding)?;
                write_bool(writer, c.ignore_missing)?;
            }
            Command::ModifyFile(c) => {
                write_string(writer, &c.path, encoding)?;
                write_string(writer, &c.source_hash, encoding)?;
                write_string(writer, &c.target_hash, encoding)?;
                writer.write_u8(c.codec_tag)?;
                write_payload_len(writer, c.payload_len)?;
            }
            Command::ExecuteStep(c) => {
                writer.write_u8(c.interpreter_tag)?;
                write_string(writer, &c.statement, encoding)?;
                write_bool(writer, c.ignore_errors)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.subject())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn modify() -> Command {
        Command::ModifyFile(ModifyFile {
            path: "bin/app.dll".into(),
            source_hash: "aa".into(),
            target_hash: "bb".into(),
            codec_tag: 1,
            payload_len: 5,
        })
    }

    #[test]
    fn test_remove_layout() {
        let command = Command::RemoveFile(RemoveFile {
            path: "a".into(),
            ignore_missing: true,
        });
        let mut buf = Vec::new();
        command.write_fields(&mut buf, TextEncoding::Utf8).unwrap();
        assert_eq!(buf, [2, 0, 0, 0, 1, b'a', 1]);
    }

    #[test]
    fn test_add_without_contents_layout() {
        let command = Command::AddFile(AddFile {
            path: "a".into(),
            target_hash: "h".into(),
            overwrite: true,
            codec_tag: 0,
            payload_len: 0,
        });
        let mut buf = Vec::new();
        command.write_fields(&mut buf, TextEncoding::Utf8).unwrap();
        assert_eq!(
            buf,
            [1, 0, 0, 0, 1, b'a', 1, b'h', 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_decode_leaves_payload_unread() {
        let mut buf = Vec::new();
        modify().write_fields(&mut buf, TextEncoding::Utf16Le).unwrap();
        let fields_len = buf.len() as u64;
        buf.extend_from_slice(b"DELTA");

        let mut cursor = Cursor::new(buf);
        let decoded = Command::read(&mut cursor, TextEncoding::Utf16Le).unwrap();
        assert_eq!(decoded, modify());
        assert_eq!(cursor.position(), fields_len);

        decoded.skip(&mut cursor).unwrap();
        assert_eq!(cursor.position(), fields_len + 5);
    }

    #[test]
    fn test_unknown_tag() {
        let mut cursor = Cursor::new(9i32.to_le_bytes().to_vec());
        let err = Command::read(&mut cursor, TextEncoding::Utf8).unwrap_err();
        assert!(matches!(err, PatchError::InvalidCommandTag(9)));
    }

    #[test]
    fn test_execute_fields() {
        let command = Command::ExecuteStep(ExecuteStep::shell("echo done"));
        let mut buf = Vec::new();
        command.write_fields(&mut buf, TextEncoding::Utf16Le).unwrap();

        let decoded = Command::read(&mut Cursor::new(buf), TextEncoding::Utf16Le).unwrap();
        assert_eq!(decoded, command);
        assert_eq!(decoded.payload_len(), 0);
        assert_eq!(decoded.to_string(), "Execute echo done");
    }

    #[test]
    fn test_display_and_path() {
        assert_eq!(modify().to_string(), "ModifyFile bin/app.dll");
        assert_eq!(modify().path(), Some("bin/app.dll"));
        assert_eq!(modify().kind().tag(), CommandTag::ModifyFile);
    }
}
