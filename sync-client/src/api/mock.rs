//! Mock snapshot API for testing.
//!
//! Serves canned snapshots, records requests, and can hold a message fetch
//! open until the test releases it, to stage races between a snapshot and
//! pushed events.

use super::{ApiError, SnapshotApi, StartConversationRequest, StartedConversation};
use async_trait::async_trait;
use huddle_sync_types::{Conversation, ConversationId, ConversationKind, Message};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Mock snapshot API.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockSnapshotApi {
    inner: Arc<Mutex<MockSnapshotApiInner>>,
}

#[derive(Debug, Default)]
struct MockSnapshotApiInner {
    conversations: Vec<Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    gates: HashMap<ConversationId, Arc<Notify>>,
    message_requests: Vec<ConversationId>,
    start_requests: Vec<StartConversationRequest>,
    start_response: Option<StartedConversation>,
    fail_next: Option<String>,
}

impl MockSnapshotApi {
    /// Create an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the conversation list snapshot.
    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.inner.lock().unwrap().conversations = conversations;
    }

    /// Set the message snapshot for one conversation.
    pub fn set_messages(&self, conversation_id: ConversationId, messages: Vec<Message>) {
        self.inner
            .lock()
            .unwrap()
            .messages
            .insert(conversation_id, messages);
    }

    /// Set the response of the next `start_conversation`.
    pub fn set_start_response(&self, response: StartedConversation) {
        self.inner.lock().unwrap().start_response = Some(response);
    }

    /// Hold message fetches for `conversation_id` until the returned gate is
    /// notified (`gate.notify_one()`).
    pub fn hold_messages(&self, conversation_id: ConversationId) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.inner
            .lock()
            .unwrap()
            .gates
            .insert(conversation_id, Arc::clone(&gate));
        gate
    }

    /// Cause the next request to fail with a 500.
    pub fn fail_next(&self, message: &str) {
        self.inner.lock().unwrap().fail_next = Some(message.to_string());
    }

    /// Conversations whose messages were requested, in order.
    pub fn message_requests(&self) -> Vec<ConversationId> {
        self.inner.lock().unwrap().message_requests.clone()
    }

    /// Bodies of `start_conversation` calls.
    pub fn start_requests(&self) -> Vec<StartConversationRequest> {
        self.inner.lock().unwrap().start_requests.clone()
    }

    fn take_failure(inner: &mut MockSnapshotApiInner) -> Result<(), ApiError> {
        match inner.fail_next.take() {
            Some(message) => Err(ApiError::Status {
                status: 500,
                message,
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SnapshotApi for MockSnapshotApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_failure(&mut inner)?;
        Ok(inner.conversations.clone())
    }

    async fn get_conversation(
        &self,
        _kind: ConversationKind,
        id: &ConversationId,
    ) -> Result<Conversation, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_failure(&mut inner)?;
        inner
            .conversations
            .iter()
            .find(|c| &c.id == id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(id.to_string()))
    }

    async fn list_messages(
        &self,
        _kind: ConversationKind,
        id: &ConversationId,
    ) -> Result<Vec<Message>, ApiError> {
        let gate = {
            let mut inner = self.inner.lock().unwrap();
            inner.message_requests.push(id.clone());
            inner.gates.get(id).cloned()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut inner = self.inner.lock().unwrap();
        Self::take_failure(&mut inner)?;
        Ok(inner.messages.get(id).cloned().unwrap_or_default())
    }

    async fn start_conversation(
        &self,
        request: &StartConversationRequest,
    ) -> Result<StartedConversation, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_failure(&mut inner)?;
        inner.start_requests.push(request.clone());
        inner.start_response.take().ok_or_else(|| ApiError::Status {
            status: 500,
            message: "no start response configured".into(),
        })
    }
}
