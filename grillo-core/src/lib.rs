//! # Grillo Core
//!
//! `grillo-core` is the engine behind the Grillo mock server. It serves any gRPC API described
//! by Protobuf schemas, answering calls according to a declarative rule document instead of
//! hand-written service code.
//!
//! ## Key Components
//!
//! * **[`SchemaLoader`]:** Compiles `.proto` files (or reads encoded descriptor sets) and links
//!   them into an immutable [`Registry`] of services and methods.
//! * **[`RuleStore`]:** Validated rules, indexed by method. [`RulesHandle`] holds the active
//!   store and swaps it atomically on reload.
//! * **[`matcher`]:** Picks the first rule whose predicates hold for a request, or the
//!   method's fallback.
//! * **[`synth`]:** Turns a rule into the ordered, possibly delayed, events of a response.
//! * **[`MockService`]:** A `tower` service exposing every registered method over gRPC, and
//!   [`serve`] to run it behind an HTTP/2 listener.
//!
//! ## JsonCodec
//!
//! An implementation of `tonic::codec::Codec` that transcodes Protobuf bytes to JSON (and back)
//! on the fly, so that rules are written and evaluated against plain JSON.
//!
//! ## Example
//!
//! ```no_run
//! use grillo_core::{MockService, RuleStore, RulesHandle, SchemaLoader, ServerOptions};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut loader = SchemaLoader::new(["protos"]);
//! loader.add_proto_files(["protos/echo.proto"])?;
//! let registry = Arc::new(loader.finish());
//!
//! let rules = RuleStore::from_path(&registry, "rules.json")?;
//! let service = MockService::new(registry, RulesHandle::new(rules), ServerOptions::default());
//!
//! grillo_core::serve(service, "127.0.0.1:50051".parse()?, std::future::pending()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect`, and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod grpc;
pub mod matcher;
pub mod registry;
pub mod rules;
pub mod schema;
pub mod server;
pub mod status;
pub mod synth;
pub mod template;

pub use grpc::{JsonCodec, JsonOptions};
pub use registry::{MethodKey, Registry, StreamingMode};
pub use rules::{RuleError, RuleStore, RulesHandle};
pub use schema::{SchemaError, SchemaLoader};
pub use server::{MockService, RequestStreamMode, ServeError, ServerOptions, serve, serve_with_listener};
pub use status::ErrorStatus;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;
