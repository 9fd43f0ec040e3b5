//! Built-in rsync-style block delta codec.
//!
//! The payload is a zstd-compressed bincode list of [`DeltaChunk`]s: copies
//! out of the source baseline and literal inserts.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::rolling_hash::RollingHash;
use super::DeltaCodec;
use crate::error::CodecError;

pub const BLOCK_DELTA_TAG: u8 = 1;
pub const BLOCK_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaChunk {
    Copy { offset: u64, length: u64 },
    Insert { data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct BlockDeltaCodec {
    /// zstd level applied to the serialized chunk list.
    pub compression_level: i32,
}

impl Default for BlockDeltaCodec {
    fn default() -> Self {
        Self {
            compression_level: 3,
        }
    }
}

impl DeltaCodec for BlockDeltaCodec {
    fn tag(&self) -> u8 {
        BLOCK_DELTA_TAG
    }

    fn name(&self) -> &str {
        "block"
    }

    fn encode(&self, source: Option<&Path>, target: &Path, output: &Path) -> Result<(), CodecError> {
        let new_data = FileBytes::open(target)?;
        let chunks = match source {
            Some(source) if !is_incompressible(target) => {
                let old_data = FileBytes::open(source)?;
                compute_diff(&old_data, &new_data)
            }
            _ => literal(&new_data),
        };
        debug!(target = %target.display(), chunks = chunks.len(), "block delta encoded");

        let file = File::create(output)?;
        let mut encoder = zstd::Encoder::new(BufWriter::new(file), self.compression_level)?;
        bincode::serialize_into(&mut encoder, &chunks)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        encoder.finish()?.flush()?;
        Ok(())
    }

    fn decode(
        &self,
        source: Option<&Path>,
        delta: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), CodecError> {
        let decoder = zstd::Decoder::new(delta)?;
        let chunks: Vec<DeltaChunk> =
            bincode::deserialize_from(decoder).map_err(|e| CodecError::Malformed(e.to_string()))?;

        // The mapping drops on return, before the caller replaces the file.
        let old_data = match source {
            Some(path) => FileBytes::open(path)?,
            None => FileBytes::Empty,
        };
        apply_diff(&old_data, &chunks, output)
    }
}

/// Read-only view of a file: mapped when non-empty.
enum FileBytes {
    Mapped(Mmap),
    Empty,
}

impl FileBytes {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(FileBytes::Empty);
        }
        // SAFETY: read-only mapping; the patcher never writes a file while it is mapped.
        let map = unsafe { Mmap::map(&file)? };
        Ok(FileBytes::Mapped(map))
    }
}

impl Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(map) => map,
            FileBytes::Empty => &[],
        }
    }
}

/// File types that are already compressed; block matching buys nothing there.
fn is_incompressible(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(
        ext.as_deref(),
        Some(
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "mp3" | "ogg" | "mp4" | "webm"
                | "zip" | "gz" | "bz2" | "xz" | "zst" | "7z" | "rar" | "woff2" | "pdf"
        )
    )
}

fn literal(data: &[u8]) -> Vec<DeltaChunk> {
    if data.is_empty() {
        Vec::new()
    } else {
        vec![DeltaChunk::Insert {
            data: data.to_vec(),
        }]
    }
}

struct BlockSignature {
    weak: u32,
    strong: blake3::Hash,
    offset: u64,
}

/// Block-match `new` against `old`:
/// 1. Split old data into fixed-size blocks and index them by weak checksum
/// 2. Slide a window over new data, confirming candidates with BLAKE3
/// 3. Emit Copy for matches and Insert for everything between them
pub fn compute_diff(old: &[u8], new: &[u8]) -> Vec<DeltaChunk> {
    if old.is_empty() || new.len() < BLOCK_SIZE {
        return literal(new);
    }

    let signatures: Vec<BlockSignature> = old
        .chunks(BLOCK_SIZE)
        .enumerate()
        .map(|(i, block)| BlockSignature {
            weak: RollingHash::over(block).digest(),
            strong: blake3::hash(block),
            offset: (i * BLOCK_SIZE) as u64,
        })
        .collect();

    let mut table: HashMap<u32, Vec<usize>> = HashMap::with_capacity(signatures.len());
    for (idx, sig) in signatures.iter().enumerate() {
        table.entry(sig.weak).or_default().push(idx);
    }

    let mut chunks = Vec::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut rolling = RollingHash::over(&new[..BLOCK_SIZE]);
    let mut pos = 0usize;

    while pos + BLOCK_SIZE <= new.len() {
        let window = &new[pos..pos + BLOCK_SIZE];
        let matched = table.get(&rolling.digest()).and_then(|candidates| {
            let strong = blake3::hash(window);
            candidates
                .iter()
                .map(|&idx| &signatures[idx])
                .find(|sig| sig.strong == strong)
        });

        match matched {
            Some(sig) => {
                if !pending.is_empty() {
                    chunks.push(DeltaChunk::Insert {
                        data: std::mem::take(&mut pending),
                    });
                }
                push_copy(&mut chunks, sig.offset, BLOCK_SIZE as u64);
                pos += BLOCK_SIZE;
                if pos + BLOCK_SIZE <= new.len() {
                    rolling = RollingHash::over(&new[pos..pos + BLOCK_SIZE]);
                }
            }
            None => {
                pending.push(new[pos]);
                pos += 1;
                if pos + BLOCK_SIZE <= new.len() {
                    rolling.roll(new[pos - 1], new[pos + BLOCK_SIZE - 1]);
                }
            }
        }
    }

    pending.extend_from_slice(&new[pos..]);
    if !pending.is_empty() {
        chunks.push(DeltaChunk::Insert { data: pending });
    }

    chunks
}

/// Merge adjacent copies of contiguous old ranges.
fn push_copy(chunks: &mut Vec<DeltaChunk>, offset: u64, length: u64) {
    if let Some(DeltaChunk::Copy {
        offset: prev_offset,
        length: prev_length,
    }) = chunks.last_mut()
    {
        if *prev_offset + *prev_length == offset {
            *prev_length += length;
            return;
        }
    }
    chunks.push(DeltaChunk::Copy { offset, length });
}

/// Stream the reconstructed file into `output`.
pub fn apply_diff(old: &[u8], chunks: &[DeltaChunk], output: &mut dyn Write) -> Result<(), CodecError> {
    for chunk in chunks {
        match chunk {
            DeltaChunk::Copy { offset, length } => {
                let range = usize::try_from(*offset)
                    .ok()
                    .zip(usize::try_from(*length).ok())
                    .and_then(|(start, len)| Some(start..start.checked_add(len)?))
                    .filter(|range| range.end <= old.len())
                    .ok_or_else(|| {
                        CodecError::Malformed(format!(
                            "copy of {length} bytes at {offset} exceeds source of {} bytes",
                            old.len()
                        ))
                    })?;
                output.write_all(&old[range])?;
            }
            DeltaChunk::Insert { data } => output.write_all(data)?,
        }
    }
    Ok(())
}
