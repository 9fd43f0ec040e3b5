//! Container constants and the low-level field codecs shared by the builder
//! and the applier. All integers are little-endian.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{PatchError, Result};

/// `00 19 9A FF` on disk.
pub const MAGIC: u32 = 0xFF9A_1900;
pub const FORMAT_VERSION: i32 = 1;

/// magic + version + custom header length + command count.
pub const MIN_HEADER_LEN: u64 = 16;

/// Longest 7-bit encoded length prefix for an `i32`.
const MAX_LEN_PREFIX_BYTES: usize = 5;

/// How length-prefixed strings are encoded inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    #[default]
    Utf16Le,
    Utf8,
}

impl TextEncoding {
    fn encode(self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        }
    }

    fn decode(self, bytes: Vec<u8>) -> Result<String> {
        match self {
            TextEncoding::Utf8 => {
                String::from_utf8(bytes).map_err(|e| PatchError::InvalidString(e.to_string()))
            }
            TextEncoding::Utf16Le => {
                if bytes.len() % 2 != 0 {
                    return Err(PatchError::InvalidString(format!(
                        "odd UTF-16 byte count {}",
                        bytes.len()
                    )));
                }
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16(&units).map_err(|e| PatchError::InvalidString(e.to_string()))
            }
        }
    }
}

/// Command tags as written before each command's fixed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CommandTag {
    AddFile = 1,
    RemoveFile = 2,
    ModifyFile = 3,
    ExecuteStep = 4,
}

impl CommandTag {
    pub fn from_i32(value: i32) -> Result<Self> {
        match value {
            1 => Ok(CommandTag::AddFile),
            2 => Ok(CommandTag::RemoveFile),
            3 => Ok(CommandTag::ModifyFile),
            4 => Ok(CommandTag::ExecuteStep),
            other => Err(PatchError::InvalidCommandTag(other)),
        }
    }
}

/// Fixed-size header fields read by the applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchHeader {
    pub version: i32,
    pub custom_header_len: i32,
    pub command_count: i32,
}

pub fn write_bool<W: Write + ?Sized>(writer: &mut W, value: bool) -> Result<()> {
    writer.write_u8(u8::from(value))?;
    Ok(())
}

pub fn read_bool<R: Read + ?Sized>(reader: &mut R) -> Result<bool> {
    Ok(reader.read_u8()? != 0)
}

/// Write a 7-bit encoded byte count followed by the encoded text.
pub fn write_string<W: Write + ?Sized>(
    writer: &mut W,
    text: &str,
    encoding: TextEncoding,
) -> Result<()> {
    let bytes = encoding.encode(text);
    let len = i32::try_from(bytes.len())
        .map_err(|_| PatchError::InvalidString(format!("string of {} bytes", bytes.len())))?;
    write_7bit_len(writer, len as u32)?;
    writer.write_all(&bytes)?;
    Ok(())
}

pub fn read_string<R: Read + ?Sized>(reader: &mut R, encoding: TextEncoding) -> Result<String> {
    let len = read_7bit_len(reader)?;
    let mut bytes = Vec::new();
    let read = reader.take(u64::from(len)).read_to_end(&mut bytes)?;
    if read != len as usize {
        return Err(PatchError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("string declares {len} bytes, stream ended after {read}"),
        )));
    }
    encoding.decode(bytes)
}

fn write_7bit_len<W: Write + ?Sized>(writer: &mut W, mut value: u32) -> Result<()> {
    while value >= 0x80 {
        writer.write_u8((value as u8) | 0x80)?;
        value >>= 7;
    }
    writer.write_u8(value as u8)?;
    Ok(())
}

fn read_7bit_len<R: Read + ?Sized>(reader: &mut R) -> Result<u32> {
    let mut value: u32 = 0;
    for i in 0..MAX_LEN_PREFIX_BYTES {
        let byte = reader.read_u8()?;
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            if value > i32::MAX as u32 {
                return Err(PatchError::InvalidString(format!("length {value} out of range")));
            }
            return Ok(value);
        }
    }
    Err(PatchError::InvalidString("length prefix too long".to_string()))
}

/// Payload lengths are signed 64-bit on disk and must be non-negative.
pub fn write_payload_len<W: Write + ?Sized>(writer: &mut W, len: u64) -> Result<()> {
    let len = i64::try_from(len).map_err(|_| {
        PatchError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("payload of {len} bytes is too large"),
        ))
    })?;
    writer.write_i64::<LittleEndian>(len)?;
    Ok(())
}

pub fn read_payload_len<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    let len = reader.read_i64::<LittleEndian>()?;
    u64::try_from(len).map_err(|_| {
        PatchError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("negative payload length {len}"),
        ))
    })
}
