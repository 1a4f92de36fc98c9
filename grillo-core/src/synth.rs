//! # Response Synthesizer
//!
//! Turns a matched [`Rule`] into the ordered events written back to the peer.
//!
//! [`synthesize`] returns a lazy stream. Each call builds its own stream from the immutable
//! rule, so two calls answered by the same rule replay the same events with their own timers.
//! Delays are `tokio` timers awaited only while the stream is polled: dropping the stream
//! (e.g. because the peer cancelled the call) drops any pending timer with it.
use crate::{
    registry::StreamingMode,
    rules::{Action, Rule},
    status::ErrorStatus,
    template::{self, TemplateContext},
};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tonic::Code;

/// One step of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// A streamed message.
    Message(Value),
    /// Terminal: the single response of a unary or client-streaming call.
    Reply(Value),
    /// Terminal: a response stream finished with `OK`.
    Completed,
    /// Terminal: the call failed with this status.
    Failed(ErrorStatus),
}

impl ResponseEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseEvent::Message(_))
    }
}

/// Lazy, finite sequence of events ending in exactly one terminal event.
pub type ResponseEvents = BoxStream<'static, ResponseEvent>;

/// Builds the events answering `request` with `rule` for a method of the given shape.
pub fn synthesize(mode: StreamingMode, rule: Arc<Rule>, request: Value) -> ResponseEvents {
    let cursor = Cursor {
        rule,
        mode,
        request,
        position: 0,
    };

    stream::unfold(Some(cursor), |state| async move {
        let mut cursor = state?;
        let (delay, event) = cursor.advance();

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let next = (!event.is_terminal()).then_some(cursor);
        Some((event, next))
    })
    .boxed()
}

/// Per-call position within a rule's action.
struct Cursor {
    rule: Arc<Rule>,
    mode: StreamingMode,
    request: Value,
    position: usize,
}

impl Cursor {
    fn advance(&mut self) -> (Duration, ResponseEvent) {
        let position = self.position;
        self.position += 1;

        match &self.rule.action {
            Action::Response { payload, delay } => {
                match (self.mode.is_server_streaming(), position) {
                    (false, _) => (*delay, ResponseEvent::Reply(self.render(payload))),
                    (true, 0) => (*delay, ResponseEvent::Message(self.render(payload))),
                    (true, _) => (Duration::ZERO, ResponseEvent::Completed),
                }
            }
            Action::Error { status, delay } => (*delay, ResponseEvent::Failed(status.clone())),
            Action::Stream { .. } if !self.mode.is_server_streaming() => (
                Duration::ZERO,
                ResponseEvent::Failed(ErrorStatus::new(
                    Code::Internal,
                    format!(
                        "Rule #{} streams messages but '{}' is a {} method",
                        self.rule.index, self.rule.method, self.mode
                    ),
                )),
            ),
            Action::Stream { items, status } => match items.get(position) {
                Some(item) => (item.delay, ResponseEvent::Message(self.render(&item.payload))),
                None => match status {
                    Some(status) => (Duration::ZERO, ResponseEvent::Failed(status.clone())),
                    None => (Duration::ZERO, ResponseEvent::Completed),
                },
            },
        }
    }

    fn render(&self, payload: &Value) -> Value {
        let context = TemplateContext {
            request: &self.request,
            method: self.rule.method.to_string(),
        };
        template::render(payload, &context)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        registry::MethodKey,
        rules::{Rule, StreamItem},
    };
    use serde_json::json;
    use tokio::time::Instant;

    fn rule(action: Action) -> Arc<Rule> {
        Arc::new(Rule {
            index: 0,
            method: MethodKey::new("echo.Echo", "Count"),
            predicates: vec![],
            action,
        })
    }

    fn counting_stream(status: Option<ErrorStatus>) -> Arc<Rule> {
        rule(Action::Stream {
            items: (1..=3)
                .map(|seq| StreamItem {
                    payload: json!({ "seq": seq }),
                    delay: Duration::from_millis(100),
                })
                .collect(),
            status,
        })
    }

    #[tokio::test]
    async fn unary_response_is_a_single_terminal_reply() {
        let rule = rule(Action::Response {
            payload: json!({ "text": "pong" }),
            delay: Duration::ZERO,
        });

        let events: Vec<_> = synthesize(StreamingMode::Unary, rule, json!({}))
            .collect()
            .await;

        assert_eq!(events, vec![ResponseEvent::Reply(json!({ "text": "pong" }))]);
    }

    #[tokio::test]
    async fn error_is_a_single_terminal_event() {
        let status = ErrorStatus::new(Code::NotFound, "missing");
        let rule = rule(Action::Error {
            status: status.clone(),
            delay: Duration::ZERO,
        });

        let events: Vec<_> = synthesize(StreamingMode::ServerStreaming, rule, json!({}))
            .collect()
            .await;

        assert_eq!(events, vec![ResponseEvent::Failed(status)]);
    }

    #[tokio::test]
    async fn response_on_streaming_method_is_one_message_then_ok() {
        let rule = rule(Action::Response {
            payload: json!({ "text": "only" }),
            delay: Duration::ZERO,
        });

        let events: Vec<_> = synthesize(StreamingMode::Bidirectional, rule, json!({}))
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                ResponseEvent::Message(json!({ "text": "only" })),
                ResponseEvent::Completed
            ]
        );
    }

    #[tokio::test]
    async fn stream_ends_with_configured_status() {
        let status = ErrorStatus::new(Code::Unavailable, "gone");
        let events: Vec<_> = synthesize(
            StreamingMode::ServerStreaming,
            counting_stream(Some(status.clone())),
            json!({}),
        )
        .collect()
        .await;

        assert_eq!(events.len(), 4);
        assert_eq!(events[2], ResponseEvent::Message(json!({ "seq": 3 })));
        assert_eq!(events[3], ResponseEvent::Failed(status));
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_synthesis_is_restartable() {
        let rule = counting_stream(None);

        let started = Instant::now();
        let mut first = synthesize(StreamingMode::ServerStreaming, rule.clone(), json!({}));
        let mut second = synthesize(StreamingMode::ServerStreaming, rule, json!({}));

        // Drain the first call completely before touching the second one.
        let mut first_events = Vec::new();
        while let Some(event) = first.next().await {
            first_events.push(event);
        }
        assert!(started.elapsed() >= Duration::from_millis(300));

        let second_started = Instant::now();
        let mut second_events = Vec::new();
        while let Some(event) = second.next().await {
            second_events.push(event);
        }

        // The second call waits its own delays instead of sharing the first call's cursor.
        assert!(second_started.elapsed() >= Duration::from_millis(300));
        assert_eq!(first_events, second_events);
        assert_eq!(
            first_events,
            vec![
                ResponseEvent::Message(json!({ "seq": 1 })),
                ResponseEvent::Message(json!({ "seq": 2 })),
                ResponseEvent::Message(json!({ "seq": 3 })),
                ResponseEvent::Completed,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn items_are_not_emitted_before_their_delay() {
        let mut events = synthesize(StreamingMode::ServerStreaming, counting_stream(None), json!({}));

        let started = Instant::now();
        events.next().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_the_rule() {
        let rule = counting_stream(None);
        let mut events = synthesize(StreamingMode::ServerStreaming, rule.clone(), json!({}));
        assert_eq!(Arc::strong_count(&rule), 2);

        // Park the stream on its first timer, then cancel it.
        let pending = tokio::time::timeout(Duration::from_millis(10), events.next()).await;
        assert!(pending.is_err());
        drop(events);

        assert_eq!(Arc::strong_count(&rule), 1);
    }

    #[tokio::test]
    async fn payload_templates_see_the_request() {
        let rule = rule(Action::Response {
            payload: json!({ "text": "echo: {{request.text}}" }),
            delay: Duration::ZERO,
        });

        let events: Vec<_> = synthesize(StreamingMode::Unary, rule, json!({ "text": "hi" }))
            .collect()
            .await;

        assert_eq!(events, vec![ResponseEvent::Reply(json!({ "text": "echo: hi" }))]);
    }
}
