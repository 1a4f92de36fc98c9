//! # Transport Adapter
//!
//! [`MockService`] exposes every method of a [`Registry`] as a live gRPC endpoint.
//!
//! It is a plain `tower` service over `http::Request`, so it can be driven in-process (as the
//! integration tests do) or behind the HTTP/2 listener started by [`serve`]. Each call:
//!
//! 1. Is routed by its HTTP path (`/package.Service/Method`). Unknown paths get `UNIMPLEMENTED`.
//! 2. Takes the rule snapshot active at that moment. Later reloads do not affect it.
//! 3. Decodes the request with [`JsonCodec`], asks the matcher for a rule, and streams the
//!    synthesized events back to the peer.
mod call;

use crate::{
    grpc::{JsonCodec, JsonOptions},
    registry::{Registry, StreamingMode},
    rules::RulesHandle,
};
use call::{Bidirectional, Call, ClientStreaming, ServerStreaming, Unary};
use futures_util::{Stream, StreamExt, stream};
use hyper::{body::Incoming, server::conn::http2, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::{
    convert::Infallible,
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    str::FromStr,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tonic::{
    Code, Status,
    body::Body as TonicBody,
    codegen::{Body, BoxFuture, Service, StdError},
    server::Grpc,
};
use tracing::{debug, error, info};

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How inbound request streams are fed to the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStreamMode {
    /// Collect every inbound message into a JSON array and match it once, when the peer
    /// half-closes. Field paths may index into the array (`0.text`).
    Assembled,
    /// Match every inbound message as it arrives.
    PerMessage,
}

impl FromStr for RequestStreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assembled" => Ok(Self::Assembled),
            "per-message" => Ok(Self::PerMessage),
            other => Err(format!(
                "Unknown stream matching mode '{other}', expected 'assembled' or 'per-message'"
            )),
        }
    }
}

impl fmt::Display for RequestStreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assembled => f.write_str("assembled"),
            Self::PerMessage => f.write_str("per-message"),
        }
    }
}

/// Knobs of the mock server. The defaults suit most schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    /// How requests are rendered as JSON before matching.
    pub json: JsonOptions,
    /// Matching mode for client streaming methods.
    pub client_streaming: RequestStreamMode,
    /// Matching mode for bidirectional streaming methods.
    pub bidi_streaming: RequestStreamMode,
    /// Status returned when no rule (and no fallback) answers a request.
    pub no_match_code: Code,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            json: JsonOptions::default(),
            client_streaming: RequestStreamMode::Assembled,
            bidi_streaming: RequestStreamMode::PerMessage,
            no_match_code: Code::Unimplemented,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("Failed to bind '{addr}'")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read the listener address")]
    LocalAddr(#[source] std::io::Error),
}

/// The mock gRPC service.
///
/// Cheap to clone: clones share the registry and the rules handle.
#[derive(Debug, Clone)]
pub struct MockService {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    registry: Arc<Registry>,
    rules: RulesHandle,
    options: ServerOptions,
}

impl MockService {
    pub fn new(registry: Arc<Registry>, rules: RulesHandle, options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                rules,
                options,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// The handle used to hot-swap the rules this service answers with.
    pub fn rules(&self) -> &RulesHandle {
        &self.inner.rules
    }

    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }
}

impl<B> Service<http::Request<B>> for MockService
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<TonicBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let Some((key, method)) = self.inner.registry.method_by_path(req.uri().path()) else {
            let path = req.uri().path().to_string();
            debug!(path = %path, "Rejecting call to unknown method");
            return Box::pin(async move {
                Ok(Status::unimplemented(format!("Unknown method '{path}'")).into_http())
            });
        };

        let options = self.inner.options;
        let codec = JsonCodec::server(method, options.json);
        let mode = StreamingMode::from(method);
        let call = Arc::new(Call {
            key,
            mode,
            rules: self.inner.rules.snapshot(),
            options,
        });

        debug!(method = %call.key, mode = %mode, "Handling call");

        Box::pin(async move {
            let mut grpc = Grpc::new(codec);
            let response = match mode {
                StreamingMode::Unary => grpc.unary(Unary(call), req).await,
                StreamingMode::ServerStreaming => {
                    grpc.server_streaming(ServerStreaming(call), req).await
                }
                StreamingMode::ClientStreaming => {
                    grpc.client_streaming(ClientStreaming(call), req).await
                }
                StreamingMode::Bidirectional => grpc.streaming(Bidirectional(call), req).await,
            };
            Ok(response)
        })
    }
}

/// Binds `addr` and serves `service` until `shutdown` resolves.
pub async fn serve<F>(service: MockService, addr: SocketAddr, shutdown: F) -> Result<(), ServeError>
where
    F: Future<Output = ()>,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;

    serve_with_listener(service, listener, shutdown).await
}

/// Serves `service` over HTTP/2 on an already bound listener until `shutdown` resolves.
///
/// Every connection runs on its own task and calls are multiplexed over it by `hyper`. Once
/// `shutdown` resolves no new connections are accepted and the listener is closed; calls
/// already in flight run to completion.
pub async fn serve_with_listener<F>(
    service: MockService,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), ServeError>
where
    F: Future<Output = ()>,
{
    let local_addr = listener.local_addr().map_err(ServeError::LocalAddr)?;
    info!(address = %local_addr, "Listening for requests");

    let incoming = stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await.inspect(|(stream, _)| {
            let _ = stream.set_nodelay(true);
        });
        Some((accepted, listener))
    });

    serve_incoming(service, incoming.boxed(), shutdown).await;
    info!(address = %local_addr, "Shutting down");

    Ok(())
}

/// Serves every connection yielded by `incoming` until `shutdown` resolves.
async fn serve_incoming<S, IO, F>(service: MockService, mut incoming: S, shutdown: F)
where
    S: Stream<Item = io::Result<(IO, SocketAddr)>> + Unpin,
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = incoming.next() => match accepted {
                Some(Ok((stream, peer))) => {
                    let service = service.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let handler = service_fn(move |req: http::Request<Incoming>| {
                            let mut service = service.clone();
                            async move { service.call(req).await }
                        });

                        if let Err(e) = http2::Builder::new(TokioExecutor::new())
                            .serve_connection(io, handler)
                            .await
                        {
                            debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    });
                }
                Some(Err(e)) => {
                    error!(error = %e, "Failed to accept connection");
                    // Errors such as running out of file descriptors persist for a while.
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
                None => break,
            },
            _ = &mut shutdown => break,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_stream_modes() {
        assert_eq!(
            "assembled".parse::<RequestStreamMode>(),
            Ok(RequestStreamMode::Assembled)
        );
        assert_eq!(
            "per-message".parse::<RequestStreamMode>(),
            Ok(RequestStreamMode::PerMessage)
        );
        assert!("batch".parse::<RequestStreamMode>().is_err());
        assert_eq!(RequestStreamMode::PerMessage.to_string(), "per-message");
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_after_accept_errors() {
        let mut attempts = 0;
        let incoming = stream::repeat_with(|| {
            attempts += 1;
            Err::<(tokio::net::TcpStream, SocketAddr), _>(io::Error::other("too many open files"))
        });

        serve_incoming(
            MockService::new(Arc::default(), RulesHandle::default(), ServerOptions::default()),
            incoming,
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await;

        assert!((9..=11).contains(&attempts), "accepted {attempts} times");
    }

    #[test]
    fn default_options() {
        let options = ServerOptions::default();
        assert_eq!(options.client_streaming, RequestStreamMode::Assembled);
        assert_eq!(options.bidi_streaming, RequestStreamMode::PerMessage);
        assert_eq!(options.no_match_code, Code::Unimplemented);
        assert!(options.json.proto_field_names);
    }
}
