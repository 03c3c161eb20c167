//! LLM plumbing for termchat.
//!
//! - a model runtime adapter owning the model / context / sampler handles
//! - a token filter for template artifacts and degenerate fragments
//! - a cooperative generation controller: one unit of runtime work per tick
//! - fragment delivery through an observer trait or a channel
//!
//! Default backend is a mock implementation so the workspace compiles and tests
//! run without model assets. Real inference lives behind the `llama-cpp` feature.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use termchat_core::GenerationId;
use thiserror::Error;

pub mod backend;
pub mod config;
pub mod controller;
pub mod filter;
#[cfg(feature = "llama-cpp")]
pub mod llama;
pub mod mock;
pub mod piece;
pub mod runtime;
pub mod sink;

pub use backend::{Backend, BackendRuntime};
pub use config::{ConfigError, GenerationConfig, Manifest, RuntimeConfig, SamplerStage, SamplingParams};
pub use controller::{
	CancelHandle, GenerationController, GenerationRequest, Phase, StopReason, TickOutcome,
};
pub use filter::{FragmentClass, TokenFilter};
pub use mock::MockBackend;
pub use piece::PieceDecoder;
pub use runtime::{ModelAdapter, ModelRuntime, RuntimeBackend, TokenizeOutcome};
pub use sink::{token_channel, ChannelSink, FragmentSink, GenerationSummary, TokenEvent, TokenStream};

/// Vocabulary index of one token, as reported by the runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(pub i32);

#[derive(Debug, Error)]
pub enum LoadError {
	#[error("model file not found: {}", .0.display())]
	NotFound(PathBuf),
	#[error("invalid model file: {0}")]
	InvalidModel(String),
	#[error("failed to allocate execution context: {0}")]
	ContextAllocation(String),
	#[error("backend not available: {0}")]
	BackendUnavailable(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
	#[error("no model loaded")]
	NotLoaded,
	#[error("runtime rejected batch: {0}")]
	Rejected(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TokenizeError {
	#[error("no model loaded")]
	NotLoaded,
	#[error("tokenizer still needs {required} slots after resizing")]
	BufferTooSmall { required: usize },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StartError {
	#[error("generation {0} is already in flight")]
	Busy(GenerationId),
	#[error("invalid request: {0}")]
	InvalidRequest(String),
}

pub type LoadResult<T> = Result<T, LoadError>;
