use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use thiserror::Error;

use super::{GgufType, GgufValue, ARCHITECTURE_KEY, CONTEXT_LENGTH_SUFFIX, GGUF_MAGIC};
use crate::types::model::ModelContainerMetadata;

/// Largest key or string payload accepted before the container is
/// considered corrupt.
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

/// Deepest array nesting accepted.
const MAX_ARRAY_DEPTH: usize = 8;

const READ_BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Not a GGUF container (magic {0:?})")]
    BadMagic([u8; 4]),
    #[error("Declared length {0} exceeds limit")]
    LengthTooLarge(u64),
    #[error("Arrays nested deeper than {MAX_ARRAY_DEPTH} levels")]
    TooDeep,
}

/// Header fields plus the two metadata values we care about
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub kv_count: u64,
    pub architecture: Option<String>,
    pub context_length: Option<u64>,
}

/// Read metadata from a file on disk.
///
/// Returns `None` for anything that is not a readable GGUF container. The
/// failure is logged, never propagated, so a directory scan can move on to
/// the next candidate.
pub fn read_file(path: &Path) -> Option<ModelContainerMetadata> {
    if !path.is_file() {
        return None;
    }

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!("Cannot open {}: {}", path.display(), e);
            return None;
        }
    };

    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    match read_metadata(&mut reader) {
        Ok(header) => {
            let file_path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Some(ModelContainerMetadata {
                file_name,
                file_path,
                architecture: header.architecture,
                context_length: header.context_length,
            })
        }
        Err(e) => {
            tracing::debug!("Skipping {}: {}", path.display(), e);
            None
        }
    }
}

/// Decode the header and key/value section from any byte stream.
///
/// Stops as soon as the declared key/value count is exhausted; tensor
/// descriptors that follow are never read.
pub fn read_metadata<R: Read>(reader: &mut R) -> Result<GgufHeader, GgufError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != GGUF_MAGIC {
        return Err(GgufError::BadMagic(magic));
    }

    let mut header = GgufHeader {
        version: read_u32(reader)?,
        tensor_count: read_u64(reader)?,
        kv_count: read_u64(reader)?,
        ..Default::default()
    };

    for _ in 0..header.kv_count {
        let key = read_string(reader)?;
        let value_type = GgufType::from_tag(read_u32(reader)?);

        if key == ARCHITECTURE_KEY {
            header.architecture = read_scalar(reader, value_type)?.and_then(GgufValue::into_string);
        } else if key.ends_with(CONTEXT_LENGTH_SUFFIX) {
            let value = read_scalar(reader, value_type)?;
            // First integer wins; duplicates across architectures are common.
            if header.context_length.is_none() {
                header.context_length = value.and_then(|v| v.as_u64());
            }
        } else {
            skip_value(reader, value_type, 0)?;
        }
    }

    Ok(header)
}

/// Decode a scalar value. Arrays and unknown tags are skipped and yield `None`.
fn read_scalar<R: Read>(reader: &mut R, ty: GgufType) -> Result<Option<GgufValue>, GgufError> {
    let value = match ty {
        GgufType::U8 => GgufValue::U8(read_array::<1, _>(reader)?[0]),
        GgufType::I8 => GgufValue::I8(read_array::<1, _>(reader)?[0] as i8),
        GgufType::U16 => GgufValue::U16(u16::from_le_bytes(read_array(reader)?)),
        GgufType::I16 => GgufValue::I16(i16::from_le_bytes(read_array(reader)?)),
        GgufType::U32 => GgufValue::U32(read_u32(reader)?),
        GgufType::I32 => GgufValue::I32(i32::from_le_bytes(read_array(reader)?)),
        GgufType::U64 => GgufValue::U64(read_u64(reader)?),
        GgufType::I64 => GgufValue::I64(i64::from_le_bytes(read_array(reader)?)),
        GgufType::F32 => GgufValue::F32(f32::from_le_bytes(read_array(reader)?)),
        GgufType::F64 => GgufValue::F64(f64::from_le_bytes(read_array(reader)?)),
        GgufType::Bool => GgufValue::Bool(read_array::<1, _>(reader)?[0] != 0),
        GgufType::String => GgufValue::String(read_string(reader)?),
        GgufType::Array | GgufType::Unknown(_) => {
            skip_value(reader, ty, 0)?;
            return Ok(None);
        }
    };
    Ok(Some(value))
}

fn skip_value<R: Read>(reader: &mut R, ty: GgufType, depth: usize) -> Result<(), GgufError> {
    match ty {
        GgufType::String => {
            let len = read_u64(reader)?;
            skip_bytes(reader, len)?;
        }
        GgufType::Array => {
            if depth >= MAX_ARRAY_DEPTH {
                return Err(GgufError::TooDeep);
            }
            let elem_type = GgufType::from_tag(read_u32(reader)?);
            let count = read_u64(reader)?;
            match elem_type.fixed_width() {
                Some(width) => {
                    let total = width.checked_mul(count).ok_or(GgufError::LengthTooLarge(count))?;
                    skip_bytes(reader, total)?;
                }
                None => {
                    for _ in 0..count {
                        skip_value(reader, elem_type, depth + 1)?;
                    }
                }
            }
        }
        fixed => {
            let width = fixed.fixed_width().unwrap_or(0);
            skip_bytes(reader, width)?;
        }
    }
    Ok(())
}

fn skip_bytes<R: Read>(reader: &mut R, n: u64) -> Result<(), GgufError> {
    if n == 0 {
        return Ok(());
    }
    let skipped = io::copy(&mut reader.by_ref().take(n), &mut io::sink())?;
    if skipped < n {
        return Err(GgufError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {} more bytes, stream ended after {}", n, skipped),
        )));
    }
    Ok(())
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, GgufError> {
    let len = read_u64(reader)?;
    if len > MAX_STRING_LEN {
        return Err(GgufError::LengthTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(match String::from_utf8(buf) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}

fn read_array<const N: usize, R: Read>(reader: &mut R) -> Result<[u8; N], GgufError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

// GGUF is little-endian on disk regardless of host order.
fn read_u32<R: Read>(reader: &mut R) -> Result<u32, GgufError> {
    Ok(u32::from_le_bytes(read_array(reader)?))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, GgufError> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}
