//! Weft Class-Image Definitions
//!
//! This crate provides the class-image format the interception engine
//! rewrites: the instruction set, the binary encoder/decoder, structural
//! type descriptors, and a structural verifier for rewritten images.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod descriptor;
pub mod encoder;
pub mod image;
pub mod opcode;
pub mod pool;
pub mod verify;

pub use descriptor::{method_flags, type_flags, MethodSig, TypeDescriptor};
pub use encoder::{DecodeError, ImageReader, ImageWriter};
pub use image::{ClassImage, FieldDef, HandlerEntry, ImageError, Metadata, MethodDef};
pub use opcode::{Insn, Opcode};
pub use pool::ConstantPool;
pub use verify::{verify_image, VerifyError};
