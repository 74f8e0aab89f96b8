//! Session router for editor-protocol adapters.
//!
//! Maps prompt turns onto relay streams and forwards content deltas as
//! agent message chunks. One pending prompt per session; a new prompt or a
//! cancel notification aborts it.

use crate::client::EventSource;
use crate::health::ApiProbe;
use anyhow::{anyhow, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared::agent_api::{ChatMessage, ChatRequest};
use shared::events::StreamEvent;
use shared::settings::RelaySettings;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const API_NOT_RUNNING: &str =
    "AI Dev Suite API not running. Start with ./start-ai-dev-suite-api.sh";

/// A content block of a prompt. Only `text` blocks are used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl PromptBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: Some(text.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    Cancelled,
}

/// Where session updates go (the protocol connection).
#[async_trait::async_trait]
pub trait UpdateSink: Send + Sync {
    async fn agent_message_chunk(&self, session_id: &str, text: &str) -> Result<()>;
}

/// Join text blocks into a single user message; empty input gives none.
pub fn prompt_blocks_to_messages(blocks: &[PromptBlock]) -> Vec<ChatMessage> {
    let parts: Vec<&str> = blocks
        .iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text.as_deref())
        .collect();
    let content = parts.join("\n\n");
    let content = content.trim();
    if content.is_empty() {
        return Vec::new();
    }
    vec![ChatMessage::user(content)]
}

struct PendingPrompt {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SessionSlot {
    pending: Option<PendingPrompt>,
}

pub struct AgentSessions {
    source: Arc<dyn EventSource>,
    health: Arc<dyn ApiProbe>,
    model: String,
    knowledge_base: String,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    next_prompt: AtomicU64,
}

impl AgentSessions {
    pub fn new(
        source: Arc<dyn EventSource>,
        health: Arc<dyn ApiProbe>,
        settings: &RelaySettings,
    ) -> Self {
        Self {
            source,
            health,
            model: settings.default_model.clone(),
            knowledge_base: settings.default_knowledge_base.clone(),
            sessions: Mutex::new(HashMap::new()),
            next_prompt: AtomicU64::new(1),
        }
    }

    /// Register a session; the id is 32 random hex characters.
    pub fn new_session(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        self.sessions.lock().insert(id.clone(), SessionSlot::default());
        tracing::debug!(session = %id, "adapter session created");
        id
    }

    /// Run one prompt turn. Errors are returned; cancellation is not an error.
    pub async fn prompt(
        &self,
        session_id: &str,
        blocks: &[PromptBlock],
        sink: &dyn UpdateSink,
    ) -> Result<StopReason> {
        let (prompt_id, cancel) = self.begin(session_id)?;
        let result = self.run_prompt(session_id, blocks, sink, &cancel).await;
        self.finish(session_id, prompt_id);
        match result {
            Err(_) if cancel.is_cancelled() => Ok(StopReason::Cancelled),
            other => other,
        }
    }

    /// Abort the session's pending prompt, if any.
    pub fn cancel(&self, session_id: &str) {
        if let Some(pending) = self
            .sessions
            .lock()
            .get(session_id)
            .and_then(|slot| slot.pending.as_ref())
        {
            pending.cancel.cancel();
        }
    }

    fn begin(&self, session_id: &str) -> Result<(u64, CancellationToken)> {
        let mut sessions = self.sessions.lock();
        let slot = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("Session {} not found", session_id))?;
        if let Some(previous) = slot.pending.take() {
            previous.cancel.cancel();
        }
        let id = self.next_prompt.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        slot.pending = Some(PendingPrompt {
            id,
            cancel: cancel.clone(),
        });
        Ok((id, cancel))
    }

    fn finish(&self, session_id: &str, prompt_id: u64) {
        if let Some(slot) = self.sessions.lock().get_mut(session_id) {
            if slot.pending.as_ref().is_some_and(|p| p.id == prompt_id) {
                slot.pending = None;
            }
        }
    }

    async fn run_prompt(
        &self,
        session_id: &str,
        blocks: &[PromptBlock],
        sink: &dyn UpdateSink,
        cancel: &CancellationToken,
    ) -> Result<StopReason> {
        if !self.health.is_up().await {
            return Err(anyhow!(API_NOT_RUNNING));
        }
        let messages = prompt_blocks_to_messages(blocks);
        if messages.is_empty() {
            return Ok(StopReason::EndTurn);
        }

        let request = ChatRequest::new(&self.model, messages)
            .with_knowledge_bases(vec![self.knowledge_base.clone()]);
        let mut stream = self.source.open(request, cancel.clone());
        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            match event {
                StreamEvent::Delta { text } => sink.agent_message_chunk(session_id, &text).await?,
                StreamEvent::Error { message } => return Err(anyhow!(message)),
                StreamEvent::Done => break,
                StreamEvent::Thinking { .. } => {}
            }
        }
        if cancel.is_cancelled() {
            Ok(StopReason::Cancelled)
        } else {
            Ok(StopReason::EndTurn)
        }
    }
}
