//! # Schema Loader
//!
//! Builds the [`Registry`] from protocol-buffer schema sources.
//!
//! Two kinds of sources are accepted and can be mixed freely:
//!
//! * **`.proto` files**: compiled in-process with `protox`, resolving imports against the
//!   configured include paths.
//! * **Encoded `FileDescriptorSet`s** (`.bin`, `.pb`, `.protoset`, `.desc`): the output of
//!   `protoc --descriptor_set_out`, decoded as-is.
//!
//! ## Two-phase loading
//!
//! A file that is already loaded is skipped when it declares the same thing again, no matter
//! which kind of source it came from.
//!
//! Every `add_*` call first parses all of its sources into `FileDescriptorProto`s and only then
//! links them into the descriptor pool. If any reference is left unresolved, or if a service is
//! already registered, the call fails and the loader keeps the pool it had before the call.
//!
//! ```rust,no_run
//! use grillo_core::schema::SchemaLoader;
//!
//! # fn run() -> Result<(), grillo_core::schema::SchemaError> {
//! let mut loader = SchemaLoader::new(["/xos/v1"]);
//! loader.add_sources(["xos.proto"])?;
//! loader.add_sources(["utility.proto", "dynamicload.proto"])?;
//! let registry = loader.finish();
//! # Ok(())
//! # }
//! ```
use crate::registry::Registry;
use prost::Message;
use prost_reflect::{DescriptorError, DescriptorPool};
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File extensions treated as encoded descriptor sets rather than `.proto` sources.
const DESCRIPTOR_SET_EXTENSIONS: &[&str] = &["bin", "pb", "protoset", "desc"];

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Failed to read schema file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to compile proto sources: {0}")]
    Compile(#[from] protox::Error),
    #[error("Failed to decode file descriptor set '{origin}': {source}")]
    Decode {
        origin: String,
        #[source]
        source: prost::DecodeError,
    },
    #[error("Failed to resolve schema references: {0}")]
    Resolve(#[from] DescriptorError),
    #[error("Service '{service}' is already registered by '{file}'")]
    DuplicateService { service: String, file: String },
    #[error("File '{0}' was already loaded with different contents")]
    ConflictingFile(String),
}

/// Accumulates schema sources into a descriptor pool.
#[derive(Debug, Clone, Default)]
pub struct SchemaLoader {
    include_paths: Vec<PathBuf>,
    pool: DescriptorPool,
}

impl SchemaLoader {
    /// Creates a loader resolving `.proto` imports against `include_paths`.
    pub fn new<I, P>(include_paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            include_paths: include_paths
                .into_iter()
                .map(|p| p.as_ref().to_path_buf())
                .collect(),
            pool: DescriptorPool::new(),
        }
    }

    /// Adds a batch of schema sources, dispatching on their file extension.
    pub fn add_sources<I, P>(&mut self, sources: I) -> Result<&mut Self, SchemaError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let (descriptor_sets, protos): (Vec<PathBuf>, Vec<PathBuf>) = sources
            .into_iter()
            .map(|p| p.as_ref().to_path_buf())
            .partition(|path| is_descriptor_set(path));

        let mut files = Vec::new();

        if !protos.is_empty() {
            files.extend(self.compile_protos(&protos)?);
        }

        for path in descriptor_sets {
            let bytes = std::fs::read(&path).map_err(|source| SchemaError::Io {
                path: path.clone(),
                source,
            })?;
            files.extend(decode_set(&bytes, &path.display().to_string())?);
        }

        self.link(files)?;
        Ok(self)
    }

    /// Adds `.proto` source files.
    pub fn add_proto_files<I, P>(&mut self, files: I) -> Result<&mut Self, SchemaError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let files: Vec<PathBuf> = files
            .into_iter()
            .map(|p| p.as_ref().to_path_buf())
            .collect();
        let protos = self.compile_protos(&files)?;
        self.link(protos)?;
        Ok(self)
    }

    /// Adds an encoded `FileDescriptorSet`.
    pub fn add_file_descriptor_set(&mut self, bytes: &[u8]) -> Result<&mut Self, SchemaError> {
        let files = decode_set(bytes, "<memory>")?;
        self.link(files)?;
        Ok(self)
    }

    /// Freezes the loaded schema into an immutable [`Registry`].
    pub fn finish(self) -> Registry {
        Registry::new(self.pool)
    }

    /// Phase one for `.proto` sources: parse every file and its imports.
    fn compile_protos(&self, files: &[PathBuf]) -> Result<Vec<FileDescriptorProto>, SchemaError> {
        let mut include_paths = self.include_paths.clone();

        // A source given by an on-disk path outside every include path still needs its own
        // directory as an include root, otherwise protox cannot name the file.
        for file in files {
            let inside_include = include_paths.iter().any(|dir| file.starts_with(dir));
            if file.is_file() && !inside_include {
                let parent = file
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or(Path::new("."));
                include_paths.push(parent.to_path_buf());
            }
        }

        let mut compiler = protox::Compiler::new(&include_paths)?;
        compiler.include_imports(true).include_source_info(false);
        compiler.open_files(files)?;

        Ok(compiler.file_descriptor_set().file)
    }

    /// Phase two: check for collisions, then resolve every reference against the pool.
    fn link(&mut self, files: Vec<FileDescriptorProto>) -> Result<(), SchemaError> {
        let mut fresh = Vec::with_capacity(files.len());
        let mut batch_services: HashMap<String, String> = HashMap::new();

        for mut file in files {
            // Source info depends on how the file was compiled, not on what it declares.
            file.source_code_info = None;
            let name = file.name().to_string();

            if let Some(existing) = self.pool.get_file_by_name(&name) {
                if existing.file_descriptor_proto() == &file {
                    debug!(file = %name, "Skipping already loaded schema file");
                    continue;
                }
                check_services(&self.pool, &file)?;
                return Err(SchemaError::ConflictingFile(name));
            }

            if fresh.iter().any(|f: &FileDescriptorProto| f.name() == name) {
                continue;
            }

            check_services(&self.pool, &file)?;
            for service in service_names(&file) {
                if let Some(other) = batch_services.insert(service.clone(), name.clone()) {
                    return Err(SchemaError::DuplicateService {
                        service,
                        file: other,
                    });
                }
            }

            fresh.push(file);
        }

        let mut pool = self.pool.clone();
        pool.add_file_descriptor_protos(fresh)?;
        self.pool = pool;

        Ok(())
    }
}

fn is_descriptor_set(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| DESCRIPTOR_SET_EXTENSIONS.contains(&ext))
}

fn decode_set(bytes: &[u8], origin: &str) -> Result<Vec<FileDescriptorProto>, SchemaError> {
    FileDescriptorSet::decode(bytes)
        .map(|set| set.file)
        .map_err(|source| SchemaError::Decode {
            origin: origin.to_string(),
            source,
        })
}

fn service_names(file: &FileDescriptorProto) -> impl Iterator<Item = String> + '_ {
    file.service.iter().map(move |service| match file.package() {
        "" => service.name().to_string(),
        package => format!("{package}.{}", service.name()),
    })
}

fn check_services(pool: &DescriptorPool, file: &FileDescriptorProto) -> Result<(), SchemaError> {
    for service in service_names(file) {
        if let Some(existing) = pool.get_service_by_name(&service) {
            return Err(SchemaError::DuplicateService {
                service,
                file: existing.parent_file().name().to_string(),
            });
        }
    }
    Ok(())
}
