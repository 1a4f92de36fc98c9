//! # Echo Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide the `echo.proto` schema
//! and its compiled descriptor set for integration testing `grillo`.
//! It is not intended for production use.

/// Encoded `FileDescriptorSet` for `echo.proto`.
pub const FILE_DESCRIPTOR_SET: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/descriptors.bin"));

/// Directory holding `echo.proto`, usable as an include path.
pub const PROTO_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/proto");

/// Fully qualified name of the echo service.
pub const SERVICE: &str = "echo.Echo";
