//! Fragment delivery.
//!
//! The controller reports to a [`FragmentSink`] and knows nothing about where
//! fragments end up. [`ChannelSink`] forwards them as [`TokenEvent`]s so a UI
//! can drain them on its own schedule.

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use termchat_core::GenerationId;

use crate::controller::StopReason;

/// Final accounting for one generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSummary {
	pub id: GenerationId,
	pub reason: StopReason,
	pub prompt_tokens: u32,
	pub emitted_tokens: u32,
	pub response: String,
}

/// Observer of one generation.
pub trait FragmentSink {
	/// Called with each accepted, non-empty fragment, in order.
	fn on_fragment(&mut self, id: GenerationId, text: &str);

	/// Called once when the generation reaches a terminal state.
	fn on_stopped(&mut self, _summary: &GenerationSummary) {}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenEvent {
	Fragment { id: GenerationId, text: String },
	Finished(GenerationSummary),
}

impl TokenEvent {
	pub fn generation(&self) -> GenerationId {
		match self {
			TokenEvent::Fragment { id, .. } => *id,
			TokenEvent::Finished(summary) => summary.id,
		}
	}
}

/// Sink that forwards events over an unbounded channel.
///
/// A dropped receiver is not an error; the events are discarded.
#[derive(Clone, Debug)]
pub struct ChannelSink {
	tx: Sender<TokenEvent>,
}

impl FragmentSink for ChannelSink {
	fn on_fragment(&mut self, id: GenerationId, text: &str) {
		let _ = self.tx.send(TokenEvent::Fragment {
			id,
			text: text.to_string(),
		});
	}

	fn on_stopped(&mut self, summary: &GenerationSummary) {
		let _ = self.tx.send(TokenEvent::Finished(summary.clone()));
	}
}

/// Receiving end of a [`ChannelSink`].
#[derive(Clone, Debug)]
pub struct TokenStream {
	rx: Receiver<TokenEvent>,
}

impl TokenStream {
	/// Next buffered event, without blocking.
	pub fn try_next(&self) -> Option<TokenEvent> {
		self.rx.try_recv().ok()
	}

	/// Every buffered event, without blocking.
	pub fn drain(&self) -> impl Iterator<Item = TokenEvent> + '_ {
		self.rx.try_iter()
	}
}

pub fn token_channel() -> (ChannelSink, TokenStream) {
	let (tx, rx) = crossbeam_channel::unbounded();
	(ChannelSink { tx }, TokenStream { rx })
}
