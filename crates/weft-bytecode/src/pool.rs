//! Constant pool for class images
//!
//! Interned string table referenced by `ConstStr` and `EnterHook`
//! instructions. Encoding order is insertion order, so re-encoding an
//! unmodified image is byte-stable.

use crate::encoder::{DecodeError, ImageReader, ImageWriter};
use rustc_hash::FxHashMap;

/// Interned string table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPool {
    entries: Vec<String>,
    index: FxHashMap<String, u32>,
}

impl ConstantPool {
    /// Create a new empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string, returning its pool index
    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(&index) = self.index.get(value) {
            return index;
        }
        let index = self.entries.len() as u32;
        self.entries.push(value.to_string());
        self.index.insert(value.to_string(), index);
        index
    }

    /// Look up a string by index
    pub fn get(&self, index: u32) -> Option<&str> {
        self.entries.get(index as usize).map(String::as_str)
    }

    /// Number of interned entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn encode(&self, writer: &mut ImageWriter) {
        writer.emit_u32(self.entries.len() as u32);
        for entry in &self.entries {
            writer.emit_string(entry);
        }
    }

    pub(crate) fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        let count = reader.read_u32()? as usize;
        let mut pool = ConstantPool::new();
        for _ in 0..count {
            let entry = reader.read_string()?;
            pool.intern(&entry);
        }
        Ok(pool)
    }
}
