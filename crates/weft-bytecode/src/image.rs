//! Class-image format
//!
//! A class image is the executable representation the host hands the
//! agent on load and receives back after weaving. The envelope is
//! magic/version/flags, the structural header (name, supertypes, fields,
//! method signatures), per-method code and handler tables, the constant
//! pool, metadata, and a trailing CRC32 checksum over the payload.

use crate::descriptor::{decode_sig, read_opt_string, MethodSig, TypeDescriptor};
use crate::encoder::{DecodeError, ImageReader, ImageWriter};
use crate::opcode::Insn;
use crate::pool::ConstantPool;
use thiserror::Error;

/// Magic number for Weft class images
pub const MAGIC: [u8; 4] = *b"WEFT";

/// Current image format version
pub const VERSION: u32 = 1;

/// Image encoding/decoding errors
#[derive(Debug, Error)]
pub enum ImageError {
    /// Decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected WEFT, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported image version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum stored in the image
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
    },

    /// Image too short to carry an envelope
    #[error("Image truncated: {0} bytes")]
    Truncated(usize),
}

/// A declared field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Modifier flags (`method_flags` namespace is reused for fields)
    pub flags: u16,
}

/// An exception-handler table entry
///
/// Ranges are instruction indices; `end` is exclusive. Lookup is
/// first-match in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerEntry {
    /// First covered instruction index
    pub start: u32,
    /// One past the last covered instruction index
    pub end: u32,
    /// Handler entry point; the exception value is on the stack there
    pub handler: u32,
}

/// A method definition with its executable body
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    /// Declared signature
    pub sig: MethodSig,
    /// Number of local slots, parameters included
    pub local_count: u16,
    /// Instruction sequence; empty for abstract methods
    pub code: Vec<Insn>,
    /// Exception-handler table
    pub handlers: Vec<HandlerEntry>,
}

/// Image metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    /// Source file path, if known
    pub source_file: Option<String>,
}

/// A decoded class image
#[derive(Debug, Clone, PartialEq)]
pub struct ClassImage {
    /// Image format version
    pub version: u32,
    /// Type-level modifier flags
    pub flags: u16,
    /// Type name
    pub name: String,
    /// Declared superclass name, if any
    pub superclass: Option<String>,
    /// Declared interface names
    pub interfaces: Vec<String>,
    /// Declared fields
    pub fields: Vec<FieldDef>,
    /// Declared methods
    pub methods: Vec<MethodDef>,
    /// Constant pool
    pub pool: ConstantPool,
    /// Metadata
    pub metadata: Metadata,
}

impl ClassImage {
    /// Create a new empty image
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: VERSION,
            flags: 0,
            name: name.into(),
            superclass: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            pool: ConstantPool::new(),
            metadata: Metadata::default(),
        }
    }

    /// Find a declared method by name
    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.sig.name == name)
    }

    /// Derive the structural descriptor of this image
    pub fn descriptor(&self) -> TypeDescriptor {
        TypeDescriptor {
            name: self.name.clone(),
            superclass: self.superclass.clone(),
            interfaces: self.interfaces.clone(),
            methods: self.methods.iter().map(|m| m.sig.clone()).collect(),
            flags: self.flags,
        }
    }

    /// Encode the image to bytes, appending the payload checksum
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ImageWriter::with_capacity(256);
        writer.emit_bytes(&MAGIC);
        writer.emit_u32(self.version);
        writer.emit_u16(self.flags);
        writer.emit_string(&self.name);
        emit_opt_string(&mut writer, self.superclass.as_deref());

        writer.emit_u32(self.interfaces.len() as u32);
        for interface in &self.interfaces {
            writer.emit_string(interface);
        }

        writer.emit_u32(self.fields.len() as u32);
        for field in &self.fields {
            writer.emit_string(&field.name);
            writer.emit_u16(field.flags);
        }

        writer.emit_u32(self.methods.len() as u32);
        for method in &self.methods {
            emit_sig(&mut writer, &method.sig);
            writer.emit_u16(method.local_count);

            let mut body = ImageWriter::new();
            for insn in &method.code {
                insn.encode(&mut body);
            }
            let body = body.into_bytes();
            writer.emit_u32(body.len() as u32);
            writer.emit_bytes(&body);

            writer.emit_u32(method.handlers.len() as u32);
            for handler in &method.handlers {
                writer.emit_u32(handler.start);
                writer.emit_u32(handler.end);
                writer.emit_u32(handler.handler);
            }
        }

        self.pool.encode(&mut writer);
        emit_opt_string(&mut writer, self.metadata.source_file.as_deref());

        let checksum = crc32fast::hash(writer.buffer());
        writer.emit_u32(checksum);
        writer.into_bytes()
    }

    /// Decode an image from bytes, verifying magic, version, and checksum
    pub fn decode(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < MAGIC.len() + 8 {
            return Err(ImageError::Truncated(bytes.len()));
        }
        let (payload, tail) = bytes.split_at(bytes.len() - 4);
        let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(ImageError::ChecksumMismatch { expected, actual });
        }

        let mut reader = ImageReader::new(payload);
        let magic = reader.read_bytes(4)?;
        if magic != MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(&magic);
            return Err(ImageError::InvalidMagic(found));
        }
        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }

        let flags = reader.read_u16()?;
        let name = reader.read_string()?;
        let superclass = read_opt_string(&mut reader)?;

        let interface_count = reader.read_u32()? as usize;
        let mut interfaces = Vec::with_capacity(interface_count);
        for _ in 0..interface_count {
            interfaces.push(reader.read_string()?);
        }

        let field_count = reader.read_u32()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(FieldDef {
                name: reader.read_string()?,
                flags: reader.read_u16()?,
            });
        }

        let method_count = reader.read_u32()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            let sig = decode_sig(&mut reader)?;
            let local_count = reader.read_u16()?;

            let code_len = reader.read_u32()? as usize;
            let body = reader.read_bytes(code_len)?;
            let mut body_reader = ImageReader::new(&body);
            let mut code = Vec::new();
            while body_reader.has_more() {
                code.push(Insn::decode(&mut body_reader)?);
            }

            let handler_count = reader.read_u32()? as usize;
            let mut handlers = Vec::with_capacity(handler_count);
            for _ in 0..handler_count {
                handlers.push(HandlerEntry {
                    start: reader.read_u32()?,
                    end: reader.read_u32()?,
                    handler: reader.read_u32()?,
                });
            }

            methods.push(MethodDef {
                sig,
                local_count,
                code,
                handlers,
            });
        }

        let pool = ConstantPool::decode(&mut reader)?;
        let source_file = read_opt_string(&mut reader)?;

        Ok(ClassImage {
            version,
            flags,
            name,
            superclass,
            interfaces,
            fields,
            methods,
            pool,
            metadata: Metadata { source_file },
        })
    }
}

fn emit_sig(writer: &mut ImageWriter, sig: &MethodSig) {
    writer.emit_string(&sig.name);
    writer.emit_u32(sig.params.len() as u32);
    for param in &sig.params {
        writer.emit_string(param);
    }
    writer.emit_string(&sig.ret);
    writer.emit_u16(sig.flags);
}

fn emit_opt_string(writer: &mut ImageWriter, value: Option<&str>) {
    match value {
        Some(value) => {
            writer.emit_u8(1);
            writer.emit_string(value);
        }
        None => writer.emit_u8(0),
    }
}
