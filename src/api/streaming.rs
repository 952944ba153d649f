// SSE framing for client-facing streams, per dialect: OpenAI chat wants
// plain data frames closed by [DONE]; Anthropic and Responses want named
// events; Gemini wants data frames.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::Value;
use std::convert::Infallible;
use tokio_util::sync::CancellationToken;

use crate::manager::ClientEventReceiver;
use crate::translator::{ClientEvent, Dialect};

fn frame(event: ClientEvent) -> Event {
    let data = match &event.data {
        // Raw passthrough for chunks the converter could not parse.
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    };
    match event.event {
        Some(name) => Event::default().event(name).data(data),
        None => Event::default().data(data),
    }
}

/// Proxies translated client events as an SSE response. The cancellation
/// token is cancelled when the client goes away (the stream is dropped),
/// which closes the upstream connection.
pub fn sse_response(
    dialect: Dialect,
    mut rx: ClientEventReceiver,
    cancel: CancellationToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let _guard = cancel.drop_guard();
        while let Some(next) = rx.recv().await {
            match next {
                Ok(event) => yield Ok(frame(event)),
                Err(error) => {
                    tracing::warn!(error = %error, "upstream stream error, ending client stream");
                    let body = serde_json::json!({
                        "error": {"message": error.to_string(), "type": "upstream_error"}
                    });
                    match dialect {
                        Dialect::AnthropicMessages => {
                            yield Ok(Event::default().event("error").data(body.to_string()));
                        }
                        _ => {
                            yield Ok(Event::default().data(body.to_string()));
                        }
                    }
                    break;
                }
            }
        }
        if dialect == Dialect::OpenAiChat {
            yield Ok(Event::default().data("[DONE]"));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_string_data_is_not_requoted() {
        let event = ClientEvent::data_only(Value::String("not-json".into()));
        // Event's Debug output contains the payload; good enough to assert
        // the raw form survived framing.
        let framed = format!("{:?}", frame(event));
        assert!(framed.contains("not-json"));
        assert!(!framed.contains("\\\"not-json\\\""));
    }

    #[test]
    fn named_events_keep_their_name() {
        let event = ClientEvent::named("message_stop", json!({"type": "message_stop"}));
        let framed = format!("{:?}", frame(event));
        assert!(framed.contains("message_stop"));
    }
}
