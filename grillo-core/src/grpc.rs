//! # Dynamic gRPC Plumbing
//!
//! `tonic` services are normally strongly typed (e.g. `HelloRequest`). The codec here lets
//! them work on `serde_json::Value` instead, transcoding to and from the Protobuf binary
//! format on the fly with the descriptors loaded at startup.
pub mod codec;

pub use codec::{JsonCodec, JsonOptions};
