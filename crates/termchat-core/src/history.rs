//! Ordered chat history and bounded prompt rendering.

use crate::{ChatTemplate, HistoryError, HistoryResult, Message, MessageId, Role};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are Qwen, created by Alibaba Cloud. You are a helpful assistant.";

/// Messages rendered into a prompt: the last three exchanges.
pub const DEFAULT_HISTORY_WINDOW: usize = 6;

/// Ordered record of exchanged messages; insertion order is chronological.
///
/// At most one message is in flight (being streamed into), and it is always
/// the most recently appended assistant message.
#[derive(Clone, Debug)]
pub struct ChatHistory {
    messages: Vec<Message>,
    system_prompt: String,
    template: ChatTemplate,
    window: usize,
    next_id: u64,
    streaming: Option<MessageId>,
}

impl Default for ChatHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatHistory {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            template: ChatTemplate::default(),
            window: DEFAULT_HISTORY_WINDOW,
            next_id: 1,
            streaming: None,
        }
    }

    pub fn with_template(mut self, template: ChatTemplate) -> Self {
        self.template = template;
        self
    }

    /// Number of trailing messages considered by [`ChatHistory::build_prompt`].
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn template(&self) -> ChatTemplate {
        self.template
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Appends a message. Empty content is legal.
    ///
    /// Appending while a message is in flight releases that message first,
    /// since it would no longer be the most recent one.
    pub fn append(&mut self, role: Role, content: impl Into<String>) -> MessageId {
        // The released message keeps whatever was streamed so far.
        self.streaming = None;
        self.push(role, content.into())
    }

    fn push(&mut self, role: Role, content: String) -> MessageId {
        let id = MessageId::new(self.next_id);
        self.next_id += 1;
        self.messages.push(Message::new(id, role, content));
        id
    }

    /// Discards every message. The system prompt is kept.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.streaming = None;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.id == id)
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    // ---- Streaming target ----

    /// Appends an empty assistant placeholder and marks it as in flight.
    pub fn begin_stream(&mut self) -> HistoryResult<MessageId> {
        if let Some(active) = self.streaming {
            return Err(HistoryError::StreamAlreadyActive(active));
        }
        let id = self.push(Role::Assistant, String::new());
        self.streaming = Some(id);
        Ok(id)
    }

    /// Appends a fragment to the in-flight message.
    pub fn push_fragment(&mut self, id: MessageId, fragment: &str) -> HistoryResult<()> {
        let Some(active) = self.streaming else {
            return Err(HistoryError::NoActiveStream);
        };
        if active != id {
            return Err(HistoryError::NotStreamTarget(id));
        }
        // The streaming target is always the last message.
        let Some(msg) = self.messages.last_mut() else {
            self.streaming = None;
            return Err(HistoryError::NoActiveStream);
        };
        msg.content.push_str(fragment);
        Ok(())
    }

    /// Releases the in-flight message, returning its id.
    pub fn end_stream(&mut self) -> Option<MessageId> {
        self.streaming.take()
    }

    pub fn streaming_id(&self) -> Option<MessageId> {
        self.streaming
    }

    // ---- Prompt rendering ----

    /// Renders the role-tagged transcript handed to the runtime.
    ///
    /// System prompt first, then the last `window` messages oldest first
    /// (empty assistant placeholders skipped, system notices never rendered),
    /// then an open assistant turn with no closing marker.
    pub fn build_prompt(&self) -> String {
        let mut out = String::new();
        self.template
            .push_turn(&mut out, Role::System, &self.system_prompt);

        let start = self.messages.len().saturating_sub(self.window);
        for msg in &self.messages[start..] {
            match msg.role {
                Role::User => self.template.push_turn(&mut out, Role::User, &msg.content),
                Role::Assistant if !msg.content.is_empty() => {
                    self.template
                        .push_turn(&mut out, Role::Assistant, &msg.content)
                }
                Role::Assistant | Role::System => {}
            }
        }

        self.template.open_turn(&mut out, Role::Assistant);
        out
    }
}
