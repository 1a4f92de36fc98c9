//! # CLI
//!
//! This module defines the command-line interface of `grillo` using `clap`.
//!
//! Every option can also be set through a `GRILLO_*` environment variable, which is handy when
//! the mock runs inside a container next to the system under test.
use clap::{Args, Parser, Subcommand};
use grillo_core::{
    JsonOptions, RequestStreamMode, ServerOptions, status::parse_code, tonic::Code,
};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "grillo", version, about = "Protobuf-driven mock gRPC server")]
pub struct Cli {
    /// Log filter used when `RUST_LOG` is not set (e.g. `info`, `grillo_core=debug`)
    #[arg(long, global = true, env = "GRILLO_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the mock until interrupted
    ///
    /// Sending `SIGHUP` reloads the rule document. A document that fails to load is
    /// reported and the previous rules stay active.
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// grillo serve --proto echo.proto -I protos --rules rules.json --listen 127.0.0.1:50051
    /// ```
    Serve {
        #[command(flatten)]
        schema: SchemaArgs,

        /// Rule document (JSON, or YAML for `.yaml`/`.yml` files)
        #[arg(long, env = "GRILLO_RULES")]
        rules: Option<PathBuf>,

        /// Address to listen on
        #[arg(long, env = "GRILLO_LISTEN", default_value = "0.0.0.0:50051")]
        listen: SocketAddr,

        #[command(flatten)]
        server: ServerArgs,
    },

    /// Load the schema and the rules, report problems, and exit
    Check {
        #[command(flatten)]
        schema: SchemaArgs,

        /// Rule document to validate against the schema
        #[arg(long, env = "GRILLO_RULES")]
        rules: Option<PathBuf>,
    },

    /// List the services and methods the mock would serve
    List {
        #[command(flatten)]
        schema: SchemaArgs,
    },
}

#[derive(Args)]
pub struct SchemaArgs {
    /// Schema source: a `.proto` file or an encoded descriptor set (`.bin`, `.pb`, `.protoset`, `.desc`)
    #[arg(
        short,
        long = "proto",
        required = true,
        env = "GRILLO_PROTO",
        value_delimiter = ','
    )]
    pub protos: Vec<PathBuf>,

    /// Directory searched for `.proto` files and their imports
    #[arg(short = 'I', long = "include", env = "GRILLO_INCLUDE", value_delimiter = ',')]
    pub includes: Vec<PathBuf>,
}

#[derive(Args)]
pub struct ServerArgs {
    /// Render enums as numbers instead of names when matching requests
    #[arg(long, env = "GRILLO_ENUM_NUMBERS")]
    pub enum_numbers: bool,

    /// Leave fields holding their default value out of requests when matching
    #[arg(long, env = "GRILLO_SKIP_DEFAULTS")]
    pub skip_defaults: bool,

    /// Use lowerCamelCase JSON names instead of the `.proto` field names
    #[arg(long, env = "GRILLO_CAMEL_CASE")]
    pub camel_case: bool,

    /// Add a property per oneof naming its set field, so rules can match on it
    #[arg(long, env = "GRILLO_ONEOFS")]
    pub oneofs: bool,

    /// How client streaming requests are matched: `assembled` or `per-message`
    #[arg(long, env = "GRILLO_CLIENT_STREAM_MATCHING", default_value = "assembled")]
    pub client_stream_matching: RequestStreamMode,

    /// How bidirectional streaming requests are matched: `assembled` or `per-message`
    #[arg(long, env = "GRILLO_BIDI_STREAM_MATCHING", default_value = "per-message")]
    pub bidi_stream_matching: RequestStreamMode,

    /// Status returned when no rule answers a request (name or number)
    #[arg(
        long,
        env = "GRILLO_NO_MATCH_CODE",
        default_value = "UNIMPLEMENTED",
        value_parser = parse_status_code
    )]
    pub no_match_code: Code,
}

impl ServerArgs {
    pub fn options(&self) -> ServerOptions {
        ServerOptions {
            json: JsonOptions {
                proto_field_names: !self.camel_case,
                enum_numbers: self.enum_numbers,
                emit_defaults: !self.skip_defaults,
                oneofs: self.oneofs,
            },
            client_streaming: self.client_stream_matching,
            bidi_streaming: self.bidi_stream_matching,
            no_match_code: self.no_match_code,
        }
    }
}

fn parse_status_code(value: &str) -> Result<Code, String> {
    match parse_code(value) {
        Some(Code::Ok) => Err("A request without a matching rule cannot succeed".to_string()),
        Some(code) => Ok(code),
        None => Err(format!("Unknown gRPC status code: '{value}'")),
    }
}
