//! # Service Registry
//!
//! The immutable service/method table the mock server is built on.
//!
//! A [`Registry`] is produced by [`crate::schema::SchemaLoader::finish`] and never changes
//! afterwards, so it can be shared between every in-flight call without locking.
use prost_reflect::{DescriptorPool, MethodDescriptor, ServiceDescriptor};
use std::collections::BTreeMap;
use std::fmt;

/// Fully qualified identity of an RPC method: `(package.Service, Method)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodKey {
    service: String,
    method: String,
}

impl MethodKey {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    /// Parses `package.Service/Method` or the HTTP/2 path form `/package.Service/Method`.
    ///
    /// Returns `None` when either side of the separator is empty.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.strip_prefix('/').unwrap_or(value);
        let (service, method) = value.split_once('/')?;

        if service.trim().is_empty() || method.trim().is_empty() || method.contains('/') {
            return None;
        }

        Some(Self::new(service, method))
    }

    /// The fully qualified service name (e.g. `echo.Echo`).
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The method name (e.g. `Say`).
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The HTTP/2 path the method is served on (e.g. `/echo.Echo/Say`).
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.method)
    }
}

impl From<&MethodDescriptor> for MethodKey {
    fn from(method: &MethodDescriptor) -> Self {
        Self::new(method.parent_service().full_name(), method.name())
    }
}

/// The RPC shape of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    /// One request, one response.
    Unary,
    /// One request, a stream of responses.
    ServerStreaming,
    /// A stream of requests, one response.
    ClientStreaming,
    /// A stream of requests, a stream of responses.
    Bidirectional,
}

impl StreamingMode {
    pub fn is_client_streaming(self) -> bool {
        matches!(self, Self::ClientStreaming | Self::Bidirectional)
    }

    pub fn is_server_streaming(self) -> bool {
        matches!(self, Self::ServerStreaming | Self::Bidirectional)
    }
}

impl From<&MethodDescriptor> for StreamingMode {
    fn from(method: &MethodDescriptor) -> Self {
        match (method.is_client_streaming(), method.is_server_streaming()) {
            (false, false) => Self::Unary,
            (false, true) => Self::ServerStreaming,
            (true, false) => Self::ClientStreaming,
            (true, true) => Self::Bidirectional,
        }
    }
}

impl fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unary => "unary",
            Self::ServerStreaming => "server-streaming",
            Self::ClientStreaming => "client-streaming",
            Self::Bidirectional => "bidirectional",
        };
        f.write_str(name)
    }
}

/// Outcome of resolving a method reference written by a rule author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(MethodKey),
    NotFound,
    /// A bare method name declared by more than one service.
    Ambiguous(Vec<MethodKey>),
}

/// Immutable table of every service and method loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pool: DescriptorPool,
    methods: BTreeMap<MethodKey, MethodDescriptor>,
}

impl Registry {
    pub(crate) fn new(pool: DescriptorPool) -> Self {
        let methods = pool
            .services()
            .flat_map(|service| service.methods().collect::<Vec<_>>())
            .map(|method| (MethodKey::from(&method), method))
            .collect();

        Self { pool, methods }
    }

    /// The descriptor pool backing this registry.
    pub fn descriptor_pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Lists all registered services.
    pub fn services(&self) -> impl Iterator<Item = ServiceDescriptor> + '_ {
        self.pool.services()
    }

    pub fn service(&self, name: &str) -> Option<ServiceDescriptor> {
        self.pool.get_service_by_name(name)
    }

    /// Lists all registered methods ordered by key.
    pub fn methods(&self) -> impl Iterator<Item = (&MethodKey, &MethodDescriptor)> {
        self.methods.iter()
    }

    pub fn method(&self, key: &MethodKey) -> Option<&MethodDescriptor> {
        self.methods.get(key)
    }

    /// Looks up a method by the HTTP/2 path of an inbound call.
    pub fn method_by_path(&self, path: &str) -> Option<(MethodKey, &MethodDescriptor)> {
        let key = MethodKey::parse(path)?;
        let method = self.methods.get(&key)?;
        Some((key, method))
    }

    /// Resolves a method reference.
    ///
    /// Fully qualified references (`package.Service/Method`) must match exactly. A bare
    /// method name is accepted only when a single service declares it.
    pub fn resolve(&self, reference: &str) -> Resolution {
        if let Some(key) = MethodKey::parse(reference) {
            return match self.methods.contains_key(&key) {
                true => Resolution::Found(key),
                false => Resolution::NotFound,
            };
        }

        let mut candidates: Vec<MethodKey> = self
            .methods
            .keys()
            .filter(|key| key.method() == reference)
            .cloned()
            .collect();

        match candidates.len() {
            0 => Resolution::NotFound,
            1 => Resolution::Found(candidates.remove(0)),
            _ => Resolution::Ambiguous(candidates),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
