//! Structural type descriptors
//!
//! A [`TypeDescriptor`] is the minimal structural view of a type the
//! matching engine needs: its name, supertype names, and declared method
//! signatures. It can be peeked out of raw image bytes without decoding
//! any method body, which keeps descriptor extraction cheap on the hot
//! load path.

use crate::encoder::{DecodeError, ImageReader};
use crate::image::{self, ImageError};

/// Type-level modifier flags
pub mod type_flags {
    /// The type is an interface
    pub const INTERFACE: u16 = 1 << 0;
    /// The type is abstract
    pub const ABSTRACT: u16 = 1 << 1;
    /// The type was synthesized by tooling
    pub const SYNTHETIC: u16 = 1 << 2;
}

/// Method-level modifier flags
pub mod method_flags {
    /// Publicly visible
    pub const PUBLIC: u16 = 1 << 0;
    /// Private to the declaring type
    pub const PRIVATE: u16 = 1 << 1;
    /// Static (no receiver)
    pub const STATIC: u16 = 1 << 2;
    /// Abstract (no body)
    pub const ABSTRACT: u16 = 1 << 3;
    /// Synthesized by tooling
    pub const SYNTHETIC: u16 = 1 << 4;
    /// Compiler-generated bridge
    pub const BRIDGE: u16 = 1 << 5;
}

/// A declared method signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSig {
    /// Method name
    pub name: String,
    /// Parameter type names, in order
    pub params: Vec<String>,
    /// Return type name; `"void"` for no value
    pub ret: String,
    /// Modifier flags (`method_flags`)
    pub flags: u16,
}

impl MethodSig {
    /// Whether the method was synthesized by tooling
    pub fn is_synthetic(&self) -> bool {
        self.flags & method_flags::SYNTHETIC != 0
    }

    /// Whether the method is a compiler-generated bridge
    pub fn is_bridge(&self) -> bool {
        self.flags & method_flags::BRIDGE != 0
    }

    /// Whether the method is abstract
    pub fn is_abstract(&self) -> bool {
        self.flags & method_flags::ABSTRACT != 0
    }

    /// Whether the method returns a value
    pub fn returns_value(&self) -> bool {
        self.ret != "void"
    }

    /// Override equivalence: same name and parameter list
    pub fn same_signature(&self, other: &MethodSig) -> bool {
        self.name == other.name && self.params == other.params
    }
}

/// Minimal structural view of a type
///
/// Derivable from raw image bytes via [`TypeDescriptor::peek`]; never
/// mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDescriptor {
    /// Type name
    pub name: String,
    /// Declared superclass name, if any
    pub superclass: Option<String>,
    /// Declared interface names
    pub interfaces: Vec<String>,
    /// Declared methods
    pub methods: Vec<MethodSig>,
    /// Modifier flags (`type_flags`)
    pub flags: u16,
}

impl TypeDescriptor {
    /// Build a descriptor with no supertypes and no methods
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            interfaces: Vec::new(),
            methods: Vec::new(),
            flags: 0,
        }
    }

    /// Extract the structural header from raw image bytes
    ///
    /// Decodes the name, supertypes, and method signatures only; method
    /// bodies, the constant pool, and the trailing checksum are skipped.
    pub fn peek(bytes: &[u8]) -> Result<TypeDescriptor, ImageError> {
        let mut reader = ImageReader::new(bytes);

        let magic = reader.read_bytes(4)?;
        if magic != image::MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(&magic);
            return Err(ImageError::InvalidMagic(found));
        }
        let version = reader.read_u32()?;
        if version != image::VERSION {
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

        // Fields carry no matching-relevant structure; skip them.
        let field_count = reader.read_u32()? as usize;
        for _ in 0..field_count {
            let _ = reader.read_string()?;
            let _ = reader.read_u16()?;
        }

        let method_count = reader.read_u32()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            let sig = decode_sig(&mut reader)?;
            let code_len = reader.read_u32()? as usize;
            reader.skip(code_len)?;
            let handler_count = reader.read_u32()? as usize;
            reader.skip(handler_count * 12)?;
            methods.push(sig);
        }

        Ok(TypeDescriptor {
            name,
            superclass,
            interfaces,
            methods,
            flags,
        })
    }
}

pub(crate) fn decode_sig(reader: &mut ImageReader<'_>) -> Result<MethodSig, DecodeError> {
    let name = reader.read_string()?;
    let param_count = reader.read_u32()? as usize;
    let mut params = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        params.push(reader.read_string()?);
    }
    let ret = reader.read_string()?;
    let flags = reader.read_u16()?;
    Ok(MethodSig {
        name,
        params,
        ret,
        flags,
    })
}

pub(crate) fn read_opt_string(reader: &mut ImageReader<'_>) -> Result<Option<String>, DecodeError> {
    if reader.read_u8()? != 0 {
        Ok(Some(reader.read_string()?))
    } else {
        Ok(None)
    }
}
