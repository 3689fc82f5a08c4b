//! GGUF container metadata
//!
//! Reads the header and a filtered subset of the key/value metadata of a
//! GGUF model file without touching tensor data.

mod reader;

#[cfg(test)]
pub mod testing;

pub use reader::{read_file, read_metadata, GgufError, GgufHeader};

/// Magic bytes at the start of every GGUF container
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Key holding the architecture identifier
pub const ARCHITECTURE_KEY: &str = "general.architecture";

/// Suffix shared by every architecture-scoped context length key
pub const CONTEXT_LENGTH_SUFFIX: &str = ".context_length";

/// Value type tags as stored on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgufType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    String,
    Array,
    U64,
    I64,
    F64,
    /// Tag outside the known set. Occupies zero bytes.
    Unknown(u32),
}

impl GgufType {
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::F32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::U64,
            11 => Self::I64,
            12 => Self::F64,
            other => Self::Unknown(other),
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            Self::U8 => 0,
            Self::I8 => 1,
            Self::U16 => 2,
            Self::I16 => 3,
            Self::U32 => 4,
            Self::I32 => 5,
            Self::F32 => 6,
            Self::Bool => 7,
            Self::String => 8,
            Self::Array => 9,
            Self::U64 => 10,
            Self::I64 => 11,
            Self::F64 => 12,
            Self::Unknown(tag) => tag,
        }
    }

    /// Encoded width for fixed-size scalars, `None` for strings and arrays.
    pub fn fixed_width(self) -> Option<u64> {
        match self {
            Self::U8 | Self::I8 | Self::Bool => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 => Some(4),
            Self::U64 | Self::I64 | Self::F64 => Some(8),
            Self::Unknown(_) => Some(0),
            Self::String | Self::Array => None,
        }
    }
}

/// A decoded metadata value.
///
/// Only scalar values of targeted keys are ever materialised; everything
/// else is skipped on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
}

impl GgufValue {
    /// Integer view of the value, if it is a non-negative integer of any width
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(v as u64),
            Self::U16(v) => Some(v as u64),
            Self::U32(v) => Some(v as u64),
            Self::U64(v) => Some(v),
            Self::I8(v) => u64::try_from(v).ok(),
            Self::I16(v) => u64::try_from(v).ok(),
            Self::I32(v) => u64::try_from(v).ok(),
            Self::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}
