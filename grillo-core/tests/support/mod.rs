//! Shared helpers for the integration tests: an in-process JSON gRPC client and the echo
//! service fixtures.
#![allow(dead_code)]

use futures_util::stream;
use grillo_core::{
    JsonCodec, JsonOptions, MethodKey, MockService, Registry, RuleStore, RulesHandle,
    SchemaLoader, ServerOptions,
};
use http_body::Body as HttpBody;
use serde_json::Value;
use std::sync::Arc;
use tonic::{
    Request, Status, Streaming,
    client::{Grpc, GrpcService},
    codegen::{Bytes, StdError},
};
use http::uri::PathAndQuery;

pub fn echo_registry() -> Arc<Registry> {
    let mut loader = SchemaLoader::default();
    loader
        .add_file_descriptor_set(echo_service::FILE_DESCRIPTOR_SET)
        .unwrap();
    Arc::new(loader.finish())
}

pub fn echo_service(rules: &str) -> MockService {
    echo_service_with(rules, ServerOptions::default())
}

pub fn echo_service_with(rules: &str, options: ServerOptions) -> MockService {
    let registry = echo_registry();
    let store = RuleStore::from_json(&registry, rules).unwrap();
    MockService::new(registry, RulesHandle::new(store), options)
}

/// A dynamic JSON client for the echo service, over any transport.
pub struct EchoClient<S = MockService> {
    grpc: Grpc<S>,
    registry: Arc<Registry>,
    options: JsonOptions,
}

impl<S> EchoClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<StdError>,
    S::ResponseBody: HttpBody<Data = Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<StdError> + Send,
{
    pub fn new(service: S) -> Self {
        Self::with_options(service, JsonOptions::default())
    }

    pub fn with_options(service: S, options: JsonOptions) -> Self {
        Self {
            grpc: Grpc::new(service),
            registry: echo_registry(),
            options,
        }
    }

    fn prepare(&self, method: &str) -> (PathAndQuery, JsonCodec) {
        let key = MethodKey::new(echo_service::SERVICE, method);
        let descriptor = self
            .registry
            .method(&key)
            .unwrap_or_else(|| panic!("echo.Echo has no method {method}"));
        let path = PathAndQuery::try_from(key.path()).unwrap();
        (path, JsonCodec::client(descriptor, self.options))
    }

    async fn ready(&mut self) {
        if let Err(err) = self.grpc.ready().await {
            let err: StdError = err.into();
            panic!("service not ready: {err}");
        }
    }

    /// Calls a unary method by name, e.g. `Say`.
    pub async fn unary(&mut self, method: &str, payload: Value) -> Result<Value, Status> {
        let (path, codec) = self.prepare(method);
        self.call_path(path, codec, payload).await
    }

    /// Calls an arbitrary path with a unary request.
    pub async fn call_path(
        &mut self,
        path: PathAndQuery,
        codec: JsonCodec,
        payload: Value,
    ) -> Result<Value, Status> {
        self.ready().await;
        self.grpc
            .unary(Request::new(payload), path, codec)
            .await
            .map(|response| response.into_inner())
    }

    pub async fn server_streaming(
        &mut self,
        method: &str,
        payload: Value,
    ) -> Result<Streaming<Value>, Status> {
        let (path, codec) = self.prepare(method);
        self.ready().await;
        self.grpc
            .server_streaming(Request::new(payload), path, codec)
            .await
            .map(|response| response.into_inner())
    }

    pub async fn client_streaming(
        &mut self,
        method: &str,
        payloads: Vec<Value>,
    ) -> Result<Value, Status> {
        let (path, codec) = self.prepare(method);
        self.ready().await;
        self.grpc
            .client_streaming(Request::new(stream::iter(payloads)), path, codec)
            .await
            .map(|response| response.into_inner())
    }

    pub async fn streaming(
        &mut self,
        method: &str,
        payloads: Vec<Value>,
    ) -> Result<Streaming<Value>, Status> {
        let (path, codec) = self.prepare(method);
        self.ready().await;
        self.grpc
            .streaming(Request::new(stream::iter(payloads)), path, codec)
            .await
            .map(|response| response.into_inner())
    }
}

/// Reads a response stream to its end: the messages, then the error status if any.
pub async fn drain(mut stream: Streaming<Value>) -> (Vec<Value>, Option<Status>) {
    let mut messages = Vec::new();
    loop {
        match stream.message().await {
            Ok(Some(message)) => messages.push(message),
            Ok(None) => return (messages, None),
            Err(status) => return (messages, Some(status)),
        }
    }
}

/// The `text` field of every message.
pub fn texts(messages: &[Value]) -> Vec<String> {
    messages
        .iter()
        .map(|m| m["text"].as_str().unwrap_or_default().to_string())
        .collect()
}
