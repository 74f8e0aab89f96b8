//! The chat stream relay: sends a chat request, reads the chunked response
//! and yields classified [`StreamEvent`]s until a terminal event, end of
//! stream, or cancellation.

use crate::ndjson::{LineParser, RecordFormat};
use anyhow::Result;
use futures::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use shared::agent_api::{ChatMessage, ChatRequest, GenerationOptions};
use shared::error::RelayError;
use shared::events::{StreamEvent, StreamState};
use shared::settings::RelaySettings;
use std::fmt::Display;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// A lazy, finite, non-restartable sequence of events.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Anything that can turn a chat request into an event stream.
pub trait EventSource: Send + Sync {
    fn open(&self, request: ChatRequest, cancel: CancellationToken) -> EventStream;
}

/// Owns the response body for one session. Dropping it releases the
/// connection; that happens exactly once, whichever way the session ends.
pub struct BodyLease<S> {
    body: S,
    session: String,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl<S> BodyLease<S> {
    pub fn new(body: S, session: impl Into<String>) -> Self {
        Self {
            body,
            session: session.into(),
            on_release: None,
        }
    }

    /// Hook run when the body is released.
    pub fn on_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }
}

impl<S: Stream + Unpin> BodyLease<S> {
    async fn next(&mut self) -> Option<S::Item> {
        self.body.next().await
    }
}

impl<S> Drop for BodyLease<S> {
    fn drop(&mut self) {
        debug!(session = %self.session, "released response body");
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

fn terminal_state(event: &StreamEvent) -> Option<StreamState> {
    match event {
        StreamEvent::Done => Some(StreamState::Completed),
        StreamEvent::Error { .. } => Some(StreamState::Failed),
        _ => None,
    }
}

/// Read loop over an already-accepted response body.
///
/// Cancellation is observed while waiting for a read, on loop re-entry and
/// before every event; a cancelled session ends without `Done` or `Error`.
/// A natural end of stream without a terminal record yields `Done`.
pub fn read_events<S, B, E>(
    mut body: BodyLease<S>,
    format: RecordFormat,
    cancel: CancellationToken,
) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let session = body.session.clone();
        let mut parser = LineParser::new(format);
        let mut outcome = StreamState::Streaming;

        'read: loop {
            if cancel.is_cancelled() {
                outcome = StreamState::Cancelled;
                break;
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome = StreamState::Cancelled;
                    break 'read;
                }
                item = body.next() => item,
            };

            let (events, end_of_stream) = match next {
                Some(Ok(bytes)) => (parser.feed(bytes.as_ref()), false),
                Some(Err(err)) => {
                    if cancel.is_cancelled() {
                        outcome = StreamState::Cancelled;
                        break;
                    }
                    let err = RelayError::transport(err.to_string());
                    warn!(session = %session, error = %err, "stream read failed");
                    (vec![StreamEvent::error(err.user_message())], true)
                }
                None => {
                    let mut events = parser.finish();
                    if !parser.is_finished() {
                        events.push(StreamEvent::Done);
                    }
                    (events, true)
                }
            };

            for event in events {
                if cancel.is_cancelled() {
                    outcome = StreamState::Cancelled;
                    break 'read;
                }
                let terminal = terminal_state(&event);
                yield event;
                if let Some(state) = terminal {
                    outcome = state;
                    break 'read;
                }
            }
            if end_of_stream {
                break;
            }
        }

        drop(body);
        debug!(session = %session, ?outcome, "relay session finished");
    })
}

fn transport_error(err: &reqwest::Error) -> RelayError {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    if err.is_connect() {
        RelayError::Transport {
            message,
            network: true,
        }
    } else {
        RelayError::transport(message)
    }
}

/// Send `request` and relay its body. Nothing happens until first poll.
fn stream_response(
    request: RequestBuilder,
    format: RecordFormat,
    cancel: CancellationToken,
) -> EventStream {
    Box::pin(async_stream::stream! {
        let session = Uuid::new_v4().simple().to_string();
        debug!(session = %session, state = ?StreamState::Requesting, "relay session opened");

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(session = %session, "cancelled before response");
                return;
            }
            sent = request.send() => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                if cancel.is_cancelled() {
                    return;
                }
                let err = transport_error(&err);
                warn!(session = %session, error = %err, "chat request failed");
                yield StreamEvent::error(err.user_message());
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                body = response.text() => body.unwrap_or_default(),
            };
            let err = RelayError::rejected(status.as_u16(), &body);
            warn!(session = %session, status = status.as_u16(), "chat request rejected");
            yield StreamEvent::error(err.user_message());
            return;
        }
        // Success statuses that cannot carry a body. An empty 200 is a stream that ends at once.
        if matches!(status, StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT) {
            yield StreamEvent::error(RelayError::NoBody.user_message());
            return;
        }

        debug!(session = %session, state = ?StreamState::Streaming, "streaming response");
        let lease = BodyLease::new(Box::pin(response.bytes_stream()), session);
        let mut events = read_events(lease, format, cancel);
        while let Some(event) = events.next().await {
            yield event;
        }
    })
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<&'a GenerationOptions>,
}

/// HTTP front end of the relay.
pub struct RelayClient {
    http: Client,
    settings: RelaySettings,
}

impl RelayClient {
    pub fn new(settings: RelaySettings) -> Result<Self> {
        // No overall timeout: generation may run for minutes. Callers bound
        // it with the cancellation token (see `open_with_timeout`).
        let http = Client::builder()
            .connect_timeout(settings.request_timeout())
            .pool_max_idle_per_host(2)
            .build()?;
        Ok(Self { http, settings })
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn stream_url(&self) -> String {
        format!("{}/api/chat/stream", self.settings.api_base())
    }

    /// Stream a chat through the suite API.
    pub fn open(&self, request: ChatRequest, cancel: CancellationToken) -> EventStream {
        let builder = self.http.post(self.stream_url()).json(&request);
        stream_response(builder, RecordFormat::Suite, cancel)
    }

    /// Like [`open`](Self::open), but cancels after `chat_timeout_secs`.
    /// Cancelling `cancel` still works; timing out does not cancel `cancel`.
    pub fn open_with_timeout(&self, request: ChatRequest, cancel: CancellationToken) -> EventStream {
        self.with_deadline(cancel, |session_cancel| self.open(request, session_cancel))
    }

    /// [`open_ollama`](Self::open_ollama) bounded by `chat_timeout_secs`.
    pub fn open_ollama_with_timeout(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> EventStream {
        self.with_deadline(cancel, |session_cancel| self.open_ollama(request, session_cancel))
    }

    fn with_deadline(
        &self,
        cancel: CancellationToken,
        open: impl FnOnce(CancellationToken) -> EventStream,
    ) -> EventStream {
        let session_cancel = cancel.child_token();
        let timeout = self.settings.chat_timeout();
        let mut inner = open(session_cancel.clone());
        Box::pin(async_stream::stream! {
            let _guard = session_cancel.clone().drop_guard();
            let timer = session_cancel;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        warn!(?timeout, "chat stream timed out, cancelling");
                        timer.cancel();
                    }
                    _ = timer.cancelled() => {}
                }
            });
            while let Some(event) = inner.next().await {
                yield event;
            }
        })
    }

    /// Stream straight from Ollama's `/api/chat`, bypassing the suite API.
    pub fn open_ollama(&self, request: &ChatRequest, cancel: CancellationToken) -> EventStream {
        let url = format!(
            "{}/api/chat",
            self.settings.ollama_base_url.trim_end_matches('/')
        );
        let body = OllamaChatRequest {
            model: &request.model,
            messages: &request.messages,
            stream: true,
            options: request.options.as_ref(),
        };
        let builder = self.http.post(url).json(&body);
        stream_response(builder, RecordFormat::Ollama, cancel)
    }
}

impl EventSource for RelayClient {
    fn open(&self, request: ChatRequest, cancel: CancellationToken) -> EventStream {
        RelayClient::open(self, request, cancel)
    }
}
