//! Cooperative generation controller.
//!
//! A single-flight state machine. [`GenerationController::start`] only records
//! the request; every call to [`GenerationController::tick`] performs exactly
//! one unit of runtime work (prompt ingest, or one sample/filter/feedback
//! round) so the caller can interleave generation with rendering.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use termchat_core::GenerationId;

use crate::filter::{FragmentClass, TokenFilter};
use crate::runtime::{tokenize, ModelAdapter, ModelRuntime, RuntimeBackend};
use crate::sink::{FragmentSink, GenerationSummary};
use crate::{StartError, TokenId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
	Idle,
	PromptPending,
	PromptProcessing,
	Sampling,
}

/// Why a generation reached its terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
	EndOfSequence,
	StopSequence,
	BudgetExhausted,
	TokenizeFailed,
	DecodeFailed,
	Cancelled,
	RuntimeUnavailable,
}

impl StopReason {
	/// True for stops caused by a runtime failure rather than by the model or
	/// the user.
	pub const fn is_failure(self) -> bool {
		matches!(
			self,
			StopReason::TokenizeFailed | StopReason::DecodeFailed | StopReason::RuntimeUnavailable
		)
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			StopReason::EndOfSequence => "end_of_sequence",
			StopReason::StopSequence => "stop_sequence",
			StopReason::BudgetExhausted => "budget_exhausted",
			StopReason::TokenizeFailed => "tokenize_failed",
			StopReason::DecodeFailed => "decode_failed",
			StopReason::Cancelled => "cancelled",
			StopReason::RuntimeUnavailable => "runtime_unavailable",
		}
	}
}

impl fmt::Display for StopReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, PartialEq, Eq)]
pub enum TickOutcome {
	/// Nothing in flight.
	Idle,
	/// More work remains; tick again next frame.
	Pending,
	/// The generation just finished. The controller is idle again.
	Stopped(GenerationSummary),
}

impl TickOutcome {
	pub fn is_pending(&self) -> bool {
		matches!(self, TickOutcome::Pending)
	}
}

pub struct GenerationRequest {
	pub prompt: String,
	pub max_tokens: u32,
	sink: Box<dyn FragmentSink>,
}

impl GenerationRequest {
	pub fn new(prompt: impl Into<String>, max_tokens: u32, sink: impl FragmentSink + 'static) -> Self {
		Self {
			prompt: prompt.into(),
			max_tokens,
			sink: Box::new(sink),
		}
	}
}

impl fmt::Debug for GenerationRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("GenerationRequest")
			.field("prompt_len", &self.prompt.len())
			.field("max_tokens", &self.max_tokens)
			.finish_non_exhaustive()
	}
}

/// Cloneable cancellation flag, observed at the start of the next tick.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
	pub fn request(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_requested(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}

	fn reset(&self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

struct ActiveGeneration {
	id: GenerationId,
	request: GenerationRequest,
	response: String,
	prompt_tokens: u32,
}

pub struct GenerationController {
	phase: Phase,
	emitted: u32,
	active: Option<ActiveGeneration>,
	cancel: CancelHandle,
	filter: TokenFilter,
	next_id: u64,
	last_stop: Option<StopReason>,
}

impl Default for GenerationController {
	fn default() -> Self {
		Self::new(TokenFilter::default())
	}
}

impl GenerationController {
	pub fn new(filter: TokenFilter) -> Self {
		Self {
			phase: Phase::Idle,
			emitted: 0,
			active: None,
			cancel: CancelHandle::default(),
			filter,
			next_id: 1,
			last_stop: None,
		}
	}

	/// Queues a generation. No runtime work happens until the next tick.
	pub fn start(&mut self, request: GenerationRequest) -> Result<GenerationId, StartError> {
		if let Some(active) = &self.active {
			tracing::warn!(active = %active.id, "start rejected: generation in flight");
			return Err(StartError::Busy(active.id));
		}
		if request.max_tokens == 0 {
			return Err(StartError::InvalidRequest("max_tokens must be >= 1".into()));
		}

		let id = GenerationId::new(self.next_id);
		self.next_id += 1;
		self.cancel.reset();
		self.emitted = 0;
		self.phase = Phase::PromptPending;
		tracing::info!(
			generation = %id,
			prompt_chars = request.prompt.chars().count(),
			max_tokens = request.max_tokens,
			"generation queued"
		);
		self.active = Some(ActiveGeneration {
			id,
			request,
			response: String::new(),
			prompt_tokens: 0,
		});
		Ok(id)
	}

	/// Performs one unit of work against the adapter's loaded runtime.
	pub fn tick<B: RuntimeBackend>(&mut self, adapter: &mut ModelAdapter<B>) -> TickOutcome {
		self.step(adapter.runtime_mut())
	}

	/// Performs one unit of work against `runtime`; `None` means no model is
	/// loaded.
	pub fn step<R: ModelRuntime + ?Sized>(&mut self, runtime: Option<&mut R>) -> TickOutcome {
		if self.active.is_none() {
			return TickOutcome::Idle;
		}
		if self.cancel.is_requested() {
			return TickOutcome::Stopped(self.finish(StopReason::Cancelled));
		}
		let Some(runtime) = runtime else {
			return TickOutcome::Stopped(self.finish(StopReason::RuntimeUnavailable));
		};

		match self.phase {
			Phase::PromptPending => self.ingest_prompt(runtime),
			Phase::Sampling => self.sample_one(runtime),
			// Transient within a single tick; never observed here.
			Phase::Idle | Phase::PromptProcessing => TickOutcome::Idle,
		}
	}

	/// Stops the in-flight generation. Nothing is decoded and no fragment is
	/// delivered afterwards.
	pub fn cancel(&mut self) -> Option<GenerationSummary> {
		if self.active.is_none() {
			return None;
		}
		Some(self.finish(StopReason::Cancelled))
	}

	pub fn is_active(&self) -> bool {
		self.active.is_some()
	}

	pub fn phase(&self) -> Phase {
		self.phase
	}

	pub fn emitted_tokens(&self) -> u32 {
		self.emitted
	}

	/// Text accepted so far for the in-flight generation.
	pub fn response(&self) -> Option<&str> {
		self.active.as_ref().map(|a| a.response.as_str())
	}

	pub fn active_id(&self) -> Option<GenerationId> {
		self.active.as_ref().map(|a| a.id)
	}

	pub fn cancel_handle(&self) -> CancelHandle {
		self.cancel.clone()
	}

	pub fn last_stop_reason(&self) -> Option<StopReason> {
		self.last_stop
	}

	pub fn filter(&self) -> &TokenFilter {
		&self.filter
	}

	fn ingest_prompt<R: ModelRuntime + ?Sized>(&mut self, runtime: &mut R) -> TickOutcome {
		let tokenized = match &self.active {
			Some(active) => tokenize(&*runtime, &active.request.prompt, true),
			None => return TickOutcome::Idle,
		};
		let tokens = match tokenized {
			Ok(tokens) if !tokens.is_empty() => tokens,
			Ok(_) => {
				tracing::warn!("prompt produced no tokens");
				return TickOutcome::Stopped(self.finish(StopReason::TokenizeFailed));
			}
			Err(e) => {
				tracing::warn!(error = %e, "prompt tokenization failed");
				return TickOutcome::Stopped(self.finish(StopReason::TokenizeFailed));
			}
		};

		self.phase = Phase::PromptProcessing;
		runtime.reset_context();
		if let Err(e) = runtime.decode_batch(&tokens) {
			tracing::warn!(error = %e, tokens = tokens.len(), "prompt decode failed");
			return TickOutcome::Stopped(self.finish(StopReason::DecodeFailed));
		}

		if let Some(active) = self.active.as_mut() {
			active.prompt_tokens = u32::try_from(tokens.len()).unwrap_or(u32::MAX);
		}
		tracing::debug!(tokens = tokens.len(), "prompt processed");
		self.phase = Phase::Sampling;
		TickOutcome::Pending
	}

	fn sample_one<R: ModelRuntime + ?Sized>(&mut self, runtime: &mut R) -> TickOutcome {
		let Some(active) = self.active.as_mut() else {
			return TickOutcome::Idle;
		};
		if self.emitted >= active.request.max_tokens {
			return TickOutcome::Stopped(self.finish(StopReason::BudgetExhausted));
		}

		let token = runtime.sample_next();
		if runtime.is_end_of_sequence(token) {
			return TickOutcome::Stopped(self.finish(StopReason::EndOfSequence));
		}

		let piece = runtime.detokenize(token);
		match self.filter.classify(&piece) {
			FragmentClass::StopSequence => {
				tracing::debug!(fragment = %piece, "stop marker sampled");
				TickOutcome::Stopped(self.finish(StopReason::StopSequence))
			}
			FragmentClass::DiscardContinue => {
				tracing::trace!(fragment = %piece, "fragment discarded");
				self.feed_back(runtime, token)
			}
			FragmentClass::Emit => {
				active.response.push_str(&piece);
				self.emitted += 1;
				active.request.sink.on_fragment(active.id, &piece);
				self.feed_back(runtime, token)
			}
		}
	}

	fn feed_back<R: ModelRuntime + ?Sized>(&mut self, runtime: &mut R, token: TokenId) -> TickOutcome {
		match runtime.decode_batch(&[token]) {
			Ok(()) => TickOutcome::Pending,
			Err(e) => {
				tracing::warn!(error = %e, "token feedback decode failed");
				TickOutcome::Stopped(self.finish(StopReason::DecodeFailed))
			}
		}
	}

	fn finish(&mut self, reason: StopReason) -> GenerationSummary {
		self.phase = Phase::Idle;
		self.last_stop = Some(reason);
		let Some(mut active) = self.active.take() else {
			return GenerationSummary {
				id: GenerationId::new(0),
				reason,
				prompt_tokens: 0,
				emitted_tokens: 0,
				response: String::new(),
			};
		};

		let summary = GenerationSummary {
			id: active.id,
			reason,
			prompt_tokens: active.prompt_tokens,
			emitted_tokens: self.emitted,
			response: std::mem::take(&mut active.response),
		};
		if reason.is_failure() {
			tracing::warn!(generation = %summary.id, %reason, emitted = summary.emitted_tokens, "generation stopped");
		} else {
			tracing::info!(generation = %summary.id, %reason, emitted = summary.emitted_tokens, "generation stopped");
		}
		active.request.sink.on_stopped(&summary);
		summary
	}
}
