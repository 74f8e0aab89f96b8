//! Four-callback consumer interface over a relay event stream.

use futures::{Stream, StreamExt};
use shared::events::{StreamEvent, StreamState};

type TextCallback = Box<dyn FnMut(&str) + Send>;

/// Callbacks registered by a UI consumer.
pub struct StreamCallbacks {
    on_delta: TextCallback,
    on_thinking: Option<TextCallback>,
    on_done: Box<dyn FnMut() + Send>,
    on_error: TextCallback,
}

impl StreamCallbacks {
    pub fn new(
        on_delta: impl FnMut(&str) + Send + 'static,
        on_done: impl FnMut() + Send + 'static,
        on_error: impl FnMut(&str) + Send + 'static,
    ) -> Self {
        Self {
            on_delta: Box::new(on_delta),
            on_thinking: None,
            on_done: Box::new(on_done),
            on_error: Box::new(on_error),
        }
    }

    /// Reasoning tokens are dropped unless this is set.
    pub fn with_thinking(mut self, on_thinking: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_thinking = Some(Box::new(on_thinking));
        self
    }

    /// Invoke the callback for one event.
    pub fn emit(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Delta { text } => (self.on_delta)(text),
            StreamEvent::Thinking { text } => {
                if let Some(cb) = self.on_thinking.as_mut() {
                    cb(text);
                }
            }
            StreamEvent::Done => (self.on_done)(),
            StreamEvent::Error { message } => (self.on_error)(message),
        }
    }
}

/// Drain `stream` into `callbacks` in arrival order.
///
/// Returns how the stream ended. A stream that ends without `Done` or
/// `Error` was cancelled, and neither terminal callback fires.
pub async fn dispatch<S>(mut stream: S, callbacks: &mut StreamCallbacks) -> StreamState
where
    S: Stream<Item = StreamEvent> + Unpin,
{
    while let Some(event) = stream.next().await {
        callbacks.emit(&event);
        match event {
            StreamEvent::Done => return StreamState::Completed,
            StreamEvent::Error { .. } => return StreamState::Failed,
            _ => {}
        }
    }
    StreamState::Cancelled
}
