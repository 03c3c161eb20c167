//! Application context: adapter, controller and chat history, owned together.
//!
//! The UI only calls into [`AppContext`]; it never touches the runtime.

use std::path::{Path, PathBuf};

use termchat_core::{ChatHistory, GenerationId, Message, MessageId, Role};
use termchat_llm::{
	token_channel, ChannelSink, GenerationConfig, GenerationController, GenerationRequest, Manifest,
	ModelAdapter, RuntimeBackend, TokenEvent, TokenFilter, TokenStream,
};

pub const NOT_LOADED_NOTICE: &str = "Please load a model first. Click 'LOAD MODEL' to load one.";

/// What to draw for one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageBody<'a> {
	/// The reply is open and nothing has streamed into it yet.
	Thinking,
	/// The reply was closed before its first fragment.
	Stopped,
	Text(&'a str),
}

/// Where the fragments of a generation are written.
#[derive(Clone, Copy, Debug)]
struct StreamTarget {
	generation: Option<GenerationId>,
	message: MessageId,
}

pub struct AppContext<B: RuntimeBackend> {
	// Fields drop in declaration order: presentation state, controller,
	// adapter.
	history: ChatHistory,
	stream: TokenStream,
	sink: ChannelSink,
	pending_prompt: Option<String>,
	target: Option<StreamTarget>,
	generation: GenerationConfig,
	model_path: PathBuf,
	controller: GenerationController,
	adapter: ModelAdapter<B>,
}

impl<B: RuntimeBackend> AppContext<B> {
	pub fn new(backend: B, manifest: &Manifest) -> Self {
		let adapter = ModelAdapter::new(backend, manifest.runtime.clone(), manifest.sampling.clone());
		let generation = manifest.generation.clone();
		let controller = GenerationController::new(TokenFilter::new(generation.stop_markers()));

		let mut history = ChatHistory::new()
			.with_template(generation.template)
			.with_window(generation.history_window);
		if let Some(system) = &generation.system_prompt {
			history.set_system_prompt(system.clone());
		}
		let model_path = manifest.model_path();
		history.append(
			Role::System,
			format!(
				"Welcome to termchat. Click 'LOAD MODEL' to load {}.",
				model_path.display()
			),
		);

		let (sink, stream) = token_channel();
		Self {
			history,
			stream,
			sink,
			pending_prompt: None,
			target: None,
			generation,
			model_path,
			controller,
			adapter,
		}
	}

	pub fn history(&self) -> &ChatHistory {
		&self.history
	}

	pub fn adapter(&self) -> &ModelAdapter<B> {
		&self.adapter
	}

	pub fn model_path(&self) -> &Path {
		&self.model_path
	}

	pub fn is_loaded(&self) -> bool {
		self.adapter.is_loaded()
	}

	pub fn status(&self) -> String {
		self.adapter.status()
	}

	/// True from the moment a send is accepted until its generation stops.
	pub fn is_generating(&self) -> bool {
		self.pending_prompt.is_some() || self.controller.is_active()
	}

	/// Message currently receiving fragments.
	pub fn streaming_message(&self) -> Option<MessageId> {
		self.target.map(|t| t.message)
	}

	pub fn message_body<'a>(&self, msg: &'a Message) -> MessageBody<'a> {
		let content = msg.content();
		if !content.is_empty() {
			MessageBody::Text(content)
		} else if self.streaming_message() == Some(msg.id) {
			MessageBody::Thinking
		} else if msg.role == Role::Assistant {
			MessageBody::Stopped
		} else {
			MessageBody::Text(content)
		}
	}

	/// (Re)loads the configured model, reporting the outcome in the chat.
	pub fn load_model(&mut self) {
		self.stop();
		match self.adapter.load(&self.model_path) {
			Ok(()) => {
				let notice = format!("Model loaded: {}", self.adapter.status());
				self.history.append(Role::System, notice);
			}
			Err(e) => {
				self.history.append(Role::System, format!("Failed to load model: {e}"));
			}
		}
	}

	/// Stops any generation and discards every message.
	pub fn clear(&mut self) {
		self.stop();
		self.history.clear();
	}

	/// Cancels the in-flight or queued generation. Whatever was streamed so
	/// far stays in the chat.
	pub fn stop(&mut self) {
		if self.pending_prompt.take().is_some() {
			tracing::debug!("queued generation dropped");
		}
		if self.controller.cancel().is_some() {
			self.pump_events();
		}
		if self.target.take().is_some() {
			self.history.end_stream();
		}
	}

	/// Queues a reply to `text`. The generation starts at the end of the
	/// current frame, see [`AppContext::end_frame`].
	pub fn send(&mut self, text: &str) {
		let text = text.trim();
		if text.is_empty() {
			return;
		}
		if !self.adapter.is_loaded() {
			self.history.append(Role::User, text);
			self.history.append(Role::System, NOT_LOADED_NOTICE);
			return;
		}
		if self.is_generating() {
			self.stop();
		}

		self.history.append(Role::User, text);
		let prompt = self.history.build_prompt();
		match self.history.begin_stream() {
			Ok(message) => {
				self.target = Some(StreamTarget {
					generation: None,
					message,
				});
				self.pending_prompt = Some(prompt);
			}
			Err(e) => tracing::warn!(error = %e, "cannot open reply message"),
		}
	}

	/// Runs once per frame after rendering: starts a queued generation, or
	/// advances the active one by one tick. Never both in the same frame.
	///
	/// Returns whether generation work remains.
	pub fn end_frame(&mut self) -> bool {
		if let Some(prompt) = self.pending_prompt.take() {
			self.start(prompt);
			return self.is_generating();
		}
		if self.controller.is_active() {
			self.controller.tick(&mut self.adapter);
			self.pump_events();
		}
		self.is_generating()
	}

	fn start(&mut self, prompt: String) {
		let request = GenerationRequest::new(prompt, self.generation.max_tokens, self.sink.clone());
		match self.controller.start(request) {
			Ok(id) => {
				if let Some(target) = self.target.as_mut() {
					target.generation = Some(id);
				}
			}
			Err(e) => {
				tracing::warn!(error = %e, "generation rejected");
				self.target = None;
				self.history.end_stream();
				self.history.append(Role::System, format!("Could not start generation: {e}"));
			}
		}
	}

	/// Moves delivered fragments into the chat history.
	fn pump_events(&mut self) {
		while let Some(ev) = self.stream.try_next() {
			let Some(target) = self.target else {
				continue;
			};
			if target.generation != Some(ev.generation()) {
				tracing::debug!(generation = %ev.generation(), "stale event dropped");
				continue;
			}
			match ev {
				TokenEvent::Fragment { text, .. } => {
					if let Err(e) = self.history.push_fragment(target.message, &text) {
						tracing::warn!(error = %e, "fragment dropped");
					}
				}
				TokenEvent::Finished(summary) => {
					self.target = None;
					self.history.end_stream();
					if summary.reason.is_failure() {
						self.history.append(
							Role::System,
							format!("Generation stopped: {}", summary.reason),
						);
					}
				}
			}
		}
	}
}
