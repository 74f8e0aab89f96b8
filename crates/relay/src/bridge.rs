//! Event forwarding between a restricted UI context and the privileged host.
//!
//! The relay runs once, on the host. The client receives classified events
//! (never raw bytes) over an ordered channel; `Done` and `Error` are
//! sentinels after which the channel closes. Cancellation crosses the other
//! way as a single abort message.

use crate::callbacks::StreamCallbacks;
use crate::client::EventSource;
use anyhow::{anyhow, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared::agent_api::ChatRequest;
use shared::events::{StreamEvent, StreamState};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Non-terminal payload; one of the fields is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

/// One message on the host → client channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "payload")]
pub enum BridgeMessage {
    #[serde(rename = "chat:stream:chunk")]
    Chunk(ChunkPayload),
    #[serde(rename = "chat:stream:done")]
    Done,
    #[serde(rename = "chat:stream:error")]
    Error(String),
}

impl From<StreamEvent> for BridgeMessage {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Delta { text } => BridgeMessage::Chunk(ChunkPayload {
                delta: Some(text),
                thinking: None,
            }),
            StreamEvent::Thinking { text } => BridgeMessage::Chunk(ChunkPayload {
                delta: None,
                thinking: Some(text),
            }),
            StreamEvent::Done => BridgeMessage::Done,
            StreamEvent::Error { message } => BridgeMessage::Error(message),
        }
    }
}

impl BridgeMessage {
    /// Back to relay events, thinking before delta.
    pub fn into_events(self) -> Vec<StreamEvent> {
        match self {
            BridgeMessage::Chunk(payload) => {
                let mut events = Vec::new();
                if let Some(text) = payload.thinking {
                    events.push(StreamEvent::Thinking { text });
                }
                if let Some(text) = payload.delta {
                    events.push(StreamEvent::Delta { text });
                }
                events
            }
            BridgeMessage::Done => vec![StreamEvent::Done],
            BridgeMessage::Error(message) => vec![StreamEvent::Error { message }],
        }
    }
}

/// A chat stream request crossing into the host.
pub struct BridgeRequest {
    pub request: ChatRequest,
    events: mpsc::UnboundedSender<BridgeMessage>,
    abort: oneshot::Receiver<()>,
}

/// Create a connected client and the host's request receiver.
pub fn bridge() -> (BridgeClient, mpsc::UnboundedReceiver<BridgeRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BridgeClient { requests: tx }, rx)
}

/// Privileged side: owns the transport and runs the relay.
pub struct BridgeHost {
    source: Arc<dyn EventSource>,
}

impl BridgeHost {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self { source }
    }

    /// Serve requests until every client handle is dropped. Each request
    /// gets its own task; sessions share nothing.
    pub async fn serve(&self, mut requests: mpsc::UnboundedReceiver<BridgeRequest>) {
        while let Some(request) = requests.recv().await {
            let source = self.source.clone();
            tokio::spawn(async move { relay_one(source.as_ref(), request).await });
        }
        debug!("bridge host stopped: no clients left");
    }
}

/// Run one session and forward its events.
pub async fn relay_one(source: &dyn EventSource, request: BridgeRequest) {
    let BridgeRequest {
        request,
        events,
        abort,
    } = request;

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            received = abort => {
                match received {
                    Ok(()) => debug!("bridge abort received"),
                    Err(_) => debug!("bridge client dropped its abort handle"),
                }
                watcher.cancel();
            }
            _ = watcher.cancelled() => {}
        }
    });
    // Stops the watcher once the session is over.
    let _guard = cancel.clone().drop_guard();

    let mut stream = source.open(request, cancel.clone());
    while let Some(event) = stream.next().await {
        if events.send(BridgeMessage::from(event)).is_err() {
            debug!("bridge client went away, cancelling");
            cancel.cancel();
            break;
        }
    }
}

/// Restricted side handle. Cheap to clone.
#[derive(Clone)]
pub struct BridgeClient {
    requests: mpsc::UnboundedSender<BridgeRequest>,
}

/// Receiving end of one session.
pub struct BridgeEvents {
    rx: mpsc::UnboundedReceiver<BridgeMessage>,
}

impl BridgeEvents {
    pub async fn recv(&mut self) -> Option<BridgeMessage> {
        self.rx.recv().await
    }
}

/// Sends the session's single abort message. Later calls do nothing.
/// Dropping every clone without aborting also cancels the session.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl BridgeClient {
    pub fn open(&self, request: ChatRequest) -> Result<(BridgeEvents, AbortHandle)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (abort_tx, abort_rx) = oneshot::channel();
        self.requests
            .send(BridgeRequest {
                request,
                events: events_tx,
                abort: abort_rx,
            })
            .map_err(|_| anyhow!("bridge host is not running"))?;
        Ok((
            BridgeEvents { rx: events_rx },
            AbortHandle {
                tx: Arc::new(Mutex::new(Some(abort_tx))),
            },
        ))
    }

    /// Stream a chat through the host into `callbacks`.
    ///
    /// Cancelling `cancel` sends the abort across and returns `Cancelled`
    /// without firing `on_done` or `on_error`.
    pub async fn chat_stream(
        &self,
        request: ChatRequest,
        callbacks: &mut StreamCallbacks,
        cancel: CancellationToken,
    ) -> Result<StreamState> {
        let (mut events, abort) = self.open(request)?;
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    abort.abort();
                    return Ok(StreamState::Cancelled);
                }
                message = events.recv() => message,
            };
            let Some(message) = message else {
                return Ok(StreamState::Cancelled);
            };
            for event in message.into_events() {
                callbacks.emit(&event);
                match event {
                    StreamEvent::Done => return Ok(StreamState::Completed),
                    StreamEvent::Error { .. } => return Ok(StreamState::Failed),
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::EventStream;
    use shared::agent_api::ChatMessage;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Scripted(Vec<StreamEvent>);

    impl EventSource for Scripted {
        fn open(&self, _request: ChatRequest, _cancel: CancellationToken) -> EventStream {
            Box::pin(futures::stream::iter(self.0.clone()))
        }
    }

    /// Emits one delta, then waits for cancellation.
    struct Hanging {
        saw_cancel: Arc<AtomicBool>,
    }

    impl EventSource for Hanging {
        fn open(&self, _request: ChatRequest, cancel: CancellationToken) -> EventStream {
            let saw_cancel = self.saw_cancel.clone();
            Box::pin(async_stream::stream! {
                yield StreamEvent::delta("first");
                cancel.cancelled().await;
                saw_cancel.store(true, Ordering::SeqCst);
            })
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new("m", vec![ChatMessage::user("hi")])
    }

    fn start(source: Arc<dyn EventSource>) -> BridgeClient {
        let (client, requests) = bridge();
        tokio::spawn(async move { BridgeHost::new(source).serve(requests).await });
        client
    }

    fn recording() -> (StreamCallbacks, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (d, t, done, e) = (log.clone(), log.clone(), log.clone(), log.clone());
        let callbacks = StreamCallbacks::new(
            move |text| d.lock().push(format!("delta:{}", text)),
            move || done.lock().push("done".into()),
            move |msg| e.lock().push(format!("error:{}", msg)),
        )
        .with_thinking(move |text| t.lock().push(format!("thinking:{}", text)));
        (callbacks, log)
    }

    #[tokio::test]
    async fn test_messages_in_order_then_closed() {
        let client = start(Arc::new(Scripted(vec![
            StreamEvent::thinking("t"),
            StreamEvent::delta("Hel"),
            StreamEvent::delta("lo"),
            StreamEvent::Done,
        ])));
        let (mut events, _abort) = client.open(request()).unwrap();
        let mut received = Vec::new();
        while let Some(message) = events.recv().await {
            received.push(message);
        }
        assert_eq!(
            received,
            vec![
                BridgeMessage::Chunk(ChunkPayload {
                    delta: None,
                    thinking: Some("t".into())
                }),
                BridgeMessage::Chunk(ChunkPayload {
                    delta: Some("Hel".into()),
                    thinking: None
                }),
                BridgeMessage::Chunk(ChunkPayload {
                    delta: Some("lo".into()),
                    thinking: None
                }),
                BridgeMessage::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_chat_stream_callbacks() {
        let client = start(Arc::new(Scripted(vec![
            StreamEvent::thinking("t"),
            StreamEvent::delta("a"),
            StreamEvent::Done,
        ])));
        let (mut callbacks, log) = recording();
        let state = client
            .chat_stream(request(), &mut callbacks, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state, StreamState::Completed);
        assert_eq!(*log.lock(), vec!["thinking:t", "delta:a", "done"]);

        let client = start(Arc::new(Scripted(vec![StreamEvent::error("boom")])));
        let (mut callbacks, log) = recording();
        let state = client
            .chat_stream(request(), &mut callbacks, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state, StreamState::Failed);
        assert_eq!(*log.lock(), vec!["error:boom"]);
    }

    #[tokio::test]
    async fn test_abort_reaches_host() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let client = start(Arc::new(Hanging {
            saw_cancel: saw_cancel.clone(),
        }));
        let (mut events, abort) = client.open(request()).unwrap();
        assert_eq!(
            events.recv().await,
            Some(BridgeMessage::Chunk(ChunkPayload {
                delta: Some("first".into()),
                thinking: None
            }))
        );

        abort.abort();
        abort.abort();
        assert_eq!(events.recv().await, None);
        assert!(saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_client_cancel_is_silent() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let client = start(Arc::new(Hanging {
            saw_cancel: saw_cancel.clone(),
        }));
        let (mut callbacks, log) = recording();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let state = client.chat_stream(request(), &mut callbacks, cancel).await.unwrap();
        assert_eq!(state, StreamState::Cancelled);
        assert_eq!(*log.lock(), vec!["delta:first"]);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !saw_cancel.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("host never observed the abort");
    }

    #[tokio::test]
    async fn test_dropped_client_future_cancels_host() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let client = start(Arc::new(Hanging {
            saw_cancel: saw_cancel.clone(),
        }));
        let (mut callbacks, log) = recording();
        let result = tokio::time::timeout(
            Duration::from_millis(100),
            client.chat_stream(request(), &mut callbacks, CancellationToken::new()),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(*log.lock(), vec!["delta:first"]);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !saw_cancel.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("host kept the stream open after the client went away");
    }

    #[tokio::test]
    async fn test_open_without_host_fails() {
        let (client, requests) = bridge();
        drop(requests);
        assert!(client.open(request()).is_err());
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(BridgeMessage::Error("boom".into())).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"channel": "chat:stream:error", "payload": "boom"})
        );
        let json = serde_json::to_value(BridgeMessage::Done).unwrap();
        assert_eq!(json, serde_json::json!({"channel": "chat:stream:done"}));
    }
}
