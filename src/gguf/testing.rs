//! Synthetic GGUF containers for tests.

use std::io;
use std::path::Path;

use super::{GgufType, GGUF_MAGIC};

/// Builds a version 3 container with no tensors by default.
pub struct ContainerBuilder {
    tensor_count: u64,
    kv_count: u64,
    body: Vec<u8>,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self {
            tensor_count: 0,
            kv_count: 0,
            body: Vec::new(),
        }
    }

    pub fn tensor_count(mut self, count: u64) -> Self {
        self.tensor_count = count;
        self
    }

    fn key(&mut self, key: &str, ty: GgufType) {
        self.raw_key(key.as_bytes(), ty);
    }

    fn raw_key(&mut self, key: &[u8], ty: GgufType) {
        self.kv_count += 1;
        put_bytes(&mut self.body, key);
        self.body.extend_from_slice(&ty.tag().to_le_bytes());
    }

    /// u8 value under a key that need not be valid UTF-8
    pub fn raw_u8(mut self, key: &[u8], v: u8) -> Self {
        self.raw_key(key, GgufType::U8);
        self.body.push(v);
        self
    }

    /// String value from raw bytes
    pub fn raw_string(mut self, key: &str, v: &[u8]) -> Self {
        self.key(key, GgufType::String);
        put_bytes(&mut self.body, v);
        self
    }

    /// Array type and count with no elements after them
    pub fn array_header(mut self, key: &str, elem_tag: u32, count: u64) -> Self {
        self.key(key, GgufType::Array);
        self.body.extend_from_slice(&elem_tag.to_le_bytes());
        self.body.extend_from_slice(&count.to_le_bytes());
        self
    }

    pub fn u8(mut self, key: &str, v: u8) -> Self {
        self.key(key, GgufType::U8);
        self.body.push(v);
        self
    }

    pub fn u16(mut self, key: &str, v: u16) -> Self {
        self.key(key, GgufType::U16);
        self.body.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i16(mut self, key: &str, v: i16) -> Self {
        self.key(key, GgufType::I16);
        self.body.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(mut self, key: &str, v: u32) -> Self {
        self.key(key, GgufType::U32);
        self.body.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i32(mut self, key: &str, v: i32) -> Self {
        self.key(key, GgufType::I32);
        self.body.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(mut self, key: &str, v: u64) -> Self {
        self.key(key, GgufType::U64);
        self.body.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i64(mut self, key: &str, v: i64) -> Self {
        self.key(key, GgufType::I64);
        self.body.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn f32(mut self, key: &str, v: f32) -> Self {
        self.key(key, GgufType::F32);
        self.body.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn f64(mut self, key: &str, v: f64) -> Self {
        self.key(key, GgufType::F64);
        self.body.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bool(mut self, key: &str, v: bool) -> Self {
        self.key(key, GgufType::Bool);
        self.body.push(v as u8);
        self
    }

    pub fn string(mut self, key: &str, v: &str) -> Self {
        self.key(key, GgufType::String);
        put_str(&mut self.body, v);
        self
    }

    pub fn string_array(mut self, key: &str, items: &[&str]) -> Self {
        self.key(key, GgufType::Array);
        self.body.extend_from_slice(&GgufType::String.tag().to_le_bytes());
        self.body.extend_from_slice(&(items.len() as u64).to_le_bytes());
        for item in items {
            put_str(&mut self.body, item);
        }
        self
    }

    pub fn u32_array(mut self, key: &str, items: &[u32]) -> Self {
        self.key(key, GgufType::Array);
        self.body.extend_from_slice(&GgufType::U32.tag().to_le_bytes());
        self.body.extend_from_slice(&(items.len() as u64).to_le_bytes());
        for item in items {
            self.body.extend_from_slice(&item.to_le_bytes());
        }
        self
    }

    /// Array of arrays of u8
    pub fn nested_u8_array(mut self, key: &str, rows: &[&[u8]]) -> Self {
        self.key(key, GgufType::Array);
        self.body.extend_from_slice(&GgufType::Array.tag().to_le_bytes());
        self.body.extend_from_slice(&(rows.len() as u64).to_le_bytes());
        for row in rows {
            self.body.extend_from_slice(&GgufType::U8.tag().to_le_bytes());
            self.body.extend_from_slice(&(row.len() as u64).to_le_bytes());
            self.body.extend_from_slice(row);
        }
        self
    }

    /// Key with a tag outside the known set and no payload
    pub fn unknown(mut self, key: &str, tag: u32) -> Self {
        self.key(key, GgufType::Unknown(tag));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.body.len());
        out.extend_from_slice(&GGUF_MAGIC);
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&self.tensor_count.to_le_bytes());
        out.extend_from_slice(&self.kv_count.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.build())
    }
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}
