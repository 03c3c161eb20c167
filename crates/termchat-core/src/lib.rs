//! Core, stable contracts for termchat.
//!
//! Current state: chat messages, the bounded chat history and the chat
//! templates used to render it into a prompt. No runtime, no UI.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod history;
pub mod template;

pub use history::{ChatHistory, DEFAULT_HISTORY_WINDOW, DEFAULT_SYSTEM_PROMPT};
pub use template::ChatTemplate;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(GenerationId);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Upper-case label used by the presentation layer.
    pub const fn label(self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::System => "SYSTEM",
        }
    }

    /// Role name as it appears inside a chat template header.
    pub const fn template_name(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One exchanged message.
///
/// Content is only mutable through [`ChatHistory`] while the message is the
/// active streaming target.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    content: String,
    pub created_at: SystemTime,
}

impl Message {
    fn new(id: MessageId, role: Role, content: String) -> Self {
        Self {
            id,
            role,
            content,
            created_at: SystemTime::now(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("a streaming message is already in flight: {0}")]
    StreamAlreadyActive(MessageId),

    #[error("no streaming message in flight")]
    NoActiveStream,

    #[error("message {0} is not the streaming target")]
    NotStreamTarget(MessageId),
}

pub type HistoryResult<T> = Result<T, HistoryError>;
