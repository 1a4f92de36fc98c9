//! Per-call handlers, one per RPC shape.
use super::{RequestStreamMode, ServerOptions};
use crate::{
    matcher::{self, MatchOutcome},
    registry::{MethodKey, StreamingMode},
    rules::{Rule, RuleStore},
    synth::{self, ResponseEvent, ResponseEvents},
};
use futures_util::{
    StreamExt, future,
    stream::{self, BoxStream},
};
use serde_json::Value;
use std::sync::Arc;
use tonic::{
    Request, Response, Status, Streaming,
    codegen::BoxFuture,
    server::{ClientStreamingService, ServerStreamingService, StreamingService, UnaryService},
};
use tracing::{debug, warn};

type MessageStream = BoxStream<'static, Result<Value, Status>>;

/// State shared by everything serving a single call.
#[derive(Debug)]
pub(super) struct Call {
    pub(super) key: MethodKey,
    pub(super) mode: StreamingMode,
    /// The rule snapshot active when the call started.
    pub(super) rules: Arc<RuleStore>,
    pub(super) options: ServerOptions,
}

impl Call {
    fn select(&self, request: &Value) -> MatchOutcome<'_> {
        let outcome = matcher::find(&self.rules, &self.key, request);

        match &outcome {
            MatchOutcome::Matched(rule) => debug!(method = %self.key, rule = rule.index, "Matched rule"),
            MatchOutcome::Fallback(rule) => {
                debug!(method = %self.key, rule = rule.index, "Using fallback rule")
            }
            MatchOutcome::NoMatch => warn!(method = %self.key, "No rule matches the request"),
        }

        outcome
    }

    fn synthesize(&self, rule: &Arc<Rule>, request: Value) -> ResponseEvents {
        synth::synthesize(self.mode, rule.clone(), request)
    }

    fn no_match(&self) -> Status {
        Status::new(
            self.options.no_match_code,
            format!("No rule matches the request to '{}'", self.key),
        )
    }

    /// Matches `request` and synthesizes the answer.
    fn respond(&self, request: Value) -> Result<ResponseEvents, Status> {
        let rule = self.select(&request).rule().cloned();

        match rule {
            Some(rule) => Ok(self.synthesize(&rule, request)),
            None => Err(self.no_match()),
        }
    }
}

/// Waits for the single response of a unary-response call.
async fn reply(mut events: ResponseEvents) -> Result<Response<Value>, Status> {
    match events.next().await {
        Some(ResponseEvent::Reply(value)) | Some(ResponseEvent::Message(value)) => {
            Ok(Response::new(value))
        }
        Some(ResponseEvent::Failed(status)) => Err(status.to_status()),
        Some(ResponseEvent::Completed) | None => Err(Status::internal("Rule produced no response")),
    }
}

/// Turns synthesized events into the message stream written to the peer.
fn into_messages(events: ResponseEvents) -> MessageStream {
    events
        .filter_map(|event| {
            future::ready(match event {
                ResponseEvent::Message(value) | ResponseEvent::Reply(value) => Some(Ok(value)),
                ResponseEvent::Failed(status) => Some(Err(status.to_status())),
                ResponseEvent::Completed => None,
            })
        })
        .boxed()
}

async fn next_message(
    call: &Call,
    inbound: &mut Streaming<Value>,
) -> Result<Option<Value>, Status> {
    inbound.message().await.inspect_err(|status| {
        warn!(method = %call.key, error = %status.message(), "Failed to read request stream")
    })
}

async fn assemble(call: &Call, mut inbound: Streaming<Value>) -> Result<Value, Status> {
    let mut messages = Vec::new();
    while let Some(message) = next_message(call, &mut inbound).await? {
        messages.push(message);
    }
    Ok(Value::Array(messages))
}

pub(super) struct Unary(pub(super) Arc<Call>);

impl UnaryService<Value> for Unary {
    type Response = Value;
    type Future = BoxFuture<Response<Value>, Status>;

    fn call(&mut self, request: Request<Value>) -> Self::Future {
        let call = self.0.clone();
        Box::pin(async move { reply(call.respond(request.into_inner())?).await })
    }
}

pub(super) struct ServerStreaming(pub(super) Arc<Call>);

impl ServerStreamingService<Value> for ServerStreaming {
    type Response = Value;
    type ResponseStream = MessageStream;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Value>) -> Self::Future {
        let call = self.0.clone();
        Box::pin(async move {
            let events = call.respond(request.into_inner())?;
            Ok(Response::new(into_messages(events)))
        })
    }
}

pub(super) struct ClientStreaming(pub(super) Arc<Call>);

impl ClientStreamingService<Value> for ClientStreaming {
    type Response = Value;
    type Future = BoxFuture<Response<Value>, Status>;

    fn call(&mut self, request: Request<Streaming<Value>>) -> Self::Future {
        let call = self.0.clone();
        Box::pin(async move {
            let inbound = request.into_inner();
            let events = match call.options.client_streaming {
                RequestStreamMode::Assembled => call.respond(assemble(&call, inbound).await?)?,
                RequestStreamMode::PerMessage => first_match(&call, inbound).await?,
            };
            reply(events).await
        })
    }
}

/// Reads the whole request stream and answers with the rule chosen by the earliest message
/// matching a specific rule, or else by the earliest message answered by the fallback.
async fn first_match(call: &Call, mut inbound: Streaming<Value>) -> Result<ResponseEvents, Status> {
    let mut matched: Option<(Arc<Rule>, Value)> = None;
    let mut fallback: Option<(Arc<Rule>, Value)> = None;
    let mut received = false;

    while let Some(message) = next_message(call, &mut inbound).await? {
        received = true;
        if matched.is_some() {
            continue;
        }

        match call.select(&message) {
            MatchOutcome::Matched(rule) => matched = Some((rule.clone(), message)),
            MatchOutcome::Fallback(rule) if fallback.is_none() => {
                fallback = Some((rule.clone(), message))
            }
            _ => {}
        }
    }

    if !received {
        return call.respond(Value::Array(Vec::new()));
    }

    match matched.or(fallback) {
        Some((rule, request)) => Ok(call.synthesize(&rule, request)),
        None => Err(call.no_match()),
    }
}

pub(super) struct Bidirectional(pub(super) Arc<Call>);

impl StreamingService<Value> for Bidirectional {
    type Response = Value;
    type ResponseStream = MessageStream;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<Value>>) -> Self::Future {
        let call = self.0.clone();
        Box::pin(async move {
            let inbound = request.into_inner();
            let messages = match call.options.bidi_streaming {
                RequestStreamMode::Assembled => {
                    let request = assemble(&call, inbound).await?;
                    into_messages(call.respond(request)?)
                }
                RequestStreamMode::PerMessage => exchange(call, inbound),
            };
            Ok(Response::new(messages))
        })
    }
}

/// Progress of a per-message bidirectional exchange.
struct Exchange {
    call: Arc<Call>,
    inbound: Streaming<Value>,
    /// Events still to be written for the latest inbound message.
    pending: Option<ResponseEvents>,
    finished: bool,
}

/// Answers each inbound message as it arrives.
///
/// The answers of one message are written before the next message is read. An error status
/// (from an error action, a stream's terminal status or a request with no matching rule)
/// ends the call. Otherwise the call ends with `OK` once the peer half-closes.
fn exchange(call: Arc<Call>, inbound: Streaming<Value>) -> MessageStream {
    let state = Exchange {
        call,
        inbound,
        pending: None,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(events) = state.pending.as_mut() {
                let event = events.next().await;
                match event {
                    Some(ResponseEvent::Message(value)) | Some(ResponseEvent::Reply(value)) => {
                        return Some((Ok(value), state));
                    }
                    Some(ResponseEvent::Failed(status)) => {
                        state.finished = true;
                        return Some((Err(status.to_status()), state));
                    }
                    Some(ResponseEvent::Completed) | None => state.pending = None,
                }
                continue;
            }

            match next_message(&state.call, &mut state.inbound).await {
                Ok(Some(message)) => match state.call.respond(message) {
                    Ok(events) => state.pending = Some(events),
                    Err(status) => {
                        state.finished = true;
                        return Some((Err(status), state));
                    }
                },
                Ok(None) => return None,
                Err(status) => {
                    state.finished = true;
                    return Some((Err(status), state));
                }
            }
        }
    })
    .boxed()
}
