//! Model runtime adapter.
//!
//! The runtime itself (tokenizer, tensor decode, sampler maths) is an external
//! collaborator reached through [`ModelRuntime`]. A [`RuntimeBackend`] acquires
//! one complete handle set (model, execution context, sampler chain) per load;
//! [`ModelAdapter`] owns at most one such set at a time.

use std::path::{Path, PathBuf};

use crate::config::{RuntimeConfig, SamplingParams};
use crate::{DecodeError, LoadResult, TokenId, TokenizeError};

/// Result of asking the runtime to tokenize into a caller-sized buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenizeOutcome {
	/// The first `n` slots hold the tokens.
	Written(usize),
	/// Buffer too small; the runtime needs this many slots.
	NeedsCapacity(usize),
}

/// Primitive operations over one loaded handle set.
///
/// Implementations release their handles on drop in reverse acquisition
/// order: sampler, context, model.
pub trait ModelRuntime {
	fn tokenize_into(&self, text: &str, add_special: bool, out: &mut [TokenId]) -> TokenizeOutcome;

	/// Advances the execution context by `tokens`.
	fn decode_batch(&mut self, tokens: &[TokenId]) -> Result<(), DecodeError>;

	/// Draws the next token from the current context state.
	fn sample_next(&mut self) -> TokenId;

	/// Printable surface of `token`; empty for tokens without one.
	///
	/// Takes `&mut self` so runtimes can carry an incomplete multi-byte
	/// sequence over to the next token; such a token yields an empty string.
	fn detokenize(&mut self, token: TokenId) -> String;

	fn is_end_of_sequence(&self, token: TokenId) -> bool;

	/// Drops everything decoded so far, keeping the handles.
	fn reset_context(&mut self);
}

/// Acquires handle sets for a concrete runtime.
pub trait RuntimeBackend {
	type Runtime: ModelRuntime;

	fn name(&self) -> &str;

	/// Loads the model and allocates context and sampler. On failure nothing
	/// acquired along the way stays alive.
	fn load(&self, path: &Path, config: &RuntimeConfig, sampling: &SamplingParams) -> LoadResult<Self::Runtime>;

	fn device_description(&self, config: &RuntimeConfig) -> String {
		config.device_description()
	}
}

/// Tokenizes with one retry when the initial size estimate is too small.
pub fn tokenize<R: ModelRuntime + ?Sized>(
	runtime: &R,
	text: &str,
	add_special: bool,
) -> Result<Vec<TokenId>, TokenizeError> {
	let estimate = text.len() + if add_special { 2 } else { 0 };
	let mut tokens = vec![TokenId::default(); estimate];

	let written = match runtime.tokenize_into(text, add_special, &mut tokens) {
		TokenizeOutcome::Written(n) => n,
		TokenizeOutcome::NeedsCapacity(required) => {
			tokens.resize(required, TokenId::default());
			match runtime.tokenize_into(text, add_special, &mut tokens) {
				TokenizeOutcome::Written(n) => n,
				TokenizeOutcome::NeedsCapacity(required) => {
					return Err(TokenizeError::BufferTooSmall { required })
				}
			}
		}
	};
	tokens.truncate(written);
	Ok(tokens)
}

struct LoadedModel<R> {
	runtime: R,
	path: PathBuf,
	status: String,
}

/// Owns the runtime handles and their configuration.
pub struct ModelAdapter<B: RuntimeBackend> {
	backend: B,
	config: RuntimeConfig,
	sampling: SamplingParams,
	loaded: Option<LoadedModel<B::Runtime>>,
}

impl<B: RuntimeBackend> ModelAdapter<B> {
	pub fn new(backend: B, config: RuntimeConfig, sampling: SamplingParams) -> Self {
		Self {
			backend,
			config,
			sampling,
			loaded: None,
		}
	}

	pub fn backend(&self) -> &B {
		&self.backend
	}

	pub fn config(&self) -> &RuntimeConfig {
		&self.config
	}

	pub fn sampling(&self) -> &SamplingParams {
		&self.sampling
	}

	/// Loads a model, unloading the current one first.
	///
	/// On failure the adapter is left unloaded.
	pub fn load(&mut self, path: impl AsRef<Path>) -> LoadResult<()> {
		let path = path.as_ref();
		self.unload();

		tracing::info!(path = %path.display(), backend = self.backend.name(), "loading model");
		let runtime = match self.backend.load(path, &self.config, &self.sampling) {
			Ok(runtime) => runtime,
			Err(e) => {
				tracing::warn!(path = %path.display(), error = %e, "model load failed");
				return Err(e);
			}
		};

		let device = self.backend.device_description(&self.config);
		let status = format!(
			"{} model (ctx: {}, device: {})",
			self.backend.name(),
			self.config.context_size,
			device
		);
		tracing::info!(%status, "model loaded");
		self.loaded = Some(LoadedModel {
			runtime,
			path: path.to_path_buf(),
			status,
		});
		Ok(())
	}

	/// Releases sampler, context and model. No-op when nothing is loaded.
	pub fn unload(&mut self) {
		if let Some(loaded) = self.loaded.take() {
			let path = loaded.path.clone();
			drop(loaded);
			tracing::info!(path = %path.display(), "model unloaded");
		}
	}

	pub fn is_loaded(&self) -> bool {
		self.loaded.is_some()
	}

	pub fn status(&self) -> String {
		match &self.loaded {
			Some(loaded) => loaded.status.clone(),
			None => "No model loaded".into(),
		}
	}

	pub fn model_path(&self) -> Option<&Path> {
		self.loaded.as_ref().map(|l| l.path.as_path())
	}

	pub fn runtime(&self) -> Option<&B::Runtime> {
		self.loaded.as_ref().map(|l| &l.runtime)
	}

	pub fn runtime_mut(&mut self) -> Option<&mut B::Runtime> {
		self.loaded.as_mut().map(|l| &mut l.runtime)
	}

	// ---- Primitive operations ----

	pub fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, TokenizeError> {
		let runtime = self.runtime().ok_or(TokenizeError::NotLoaded)?;
		tokenize(runtime, text, add_special)
	}

	pub fn decode_batch(&mut self, tokens: &[TokenId]) -> Result<(), DecodeError> {
		self.runtime_mut()
			.ok_or(DecodeError::NotLoaded)?
			.decode_batch(tokens)
	}

	pub fn sample_next(&mut self) -> Option<TokenId> {
		self.runtime_mut().map(|r| r.sample_next())
	}

	pub fn detokenize(&mut self, token: TokenId) -> String {
		self.runtime_mut().map(|r| r.detokenize(token)).unwrap_or_default()
	}

	pub fn is_end_of_sequence(&self, token: TokenId) -> bool {
		self.runtime().is_some_and(|r| r.is_end_of_sequence(token))
	}
}

impl<B: RuntimeBackend> Drop for ModelAdapter<B> {
	fn drop(&mut self) {
		self.unload();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mock::{HandleKind, LedgerEvent, MockBackend};
	use crate::LoadError;
	use pretty_assertions::assert_eq;
	use std::cell::Cell;

	fn adapter(backend: MockBackend) -> ModelAdapter<MockBackend> {
		ModelAdapter::new(backend, RuntimeConfig::default(), SamplingParams::default())
	}

	/// Reports a larger requirement than the caller's estimate, like a
	/// tokenizer that expands bytes into several pieces.
	struct ExpandingRuntime {
		factor: usize,
		calls: Cell<usize>,
	}

	impl ModelRuntime for ExpandingRuntime {
		fn tokenize_into(&self, text: &str, _add_special: bool, out: &mut [TokenId]) -> TokenizeOutcome {
			self.calls.set(self.calls.get() + 1);
			let required = text.len() * self.factor;
			if out.len() < required {
				return TokenizeOutcome::NeedsCapacity(required);
			}
			for (i, slot) in out.iter_mut().take(required).enumerate() {
				*slot = TokenId(i as i32);
			}
			TokenizeOutcome::Written(required)
		}

		fn decode_batch(&mut self, _tokens: &[TokenId]) -> Result<(), DecodeError> {
			Ok(())
		}

		fn sample_next(&mut self) -> TokenId {
			TokenId(0)
		}

		fn detokenize(&mut self, _token: TokenId) -> String {
			String::new()
		}

		fn is_end_of_sequence(&self, _token: TokenId) -> bool {
			true
		}

		fn reset_context(&mut self) {}
	}

	struct StubbornRuntime;

	impl ModelRuntime for StubbornRuntime {
		fn tokenize_into(&self, _text: &str, _add_special: bool, out: &mut [TokenId]) -> TokenizeOutcome {
			TokenizeOutcome::NeedsCapacity(out.len() + 1)
		}

		fn decode_batch(&mut self, _tokens: &[TokenId]) -> Result<(), DecodeError> {
			Ok(())
		}

		fn sample_next(&mut self) -> TokenId {
			TokenId(0)
		}

		fn detokenize(&mut self, _token: TokenId) -> String {
			String::new()
		}

		fn is_end_of_sequence(&self, _token: TokenId) -> bool {
			true
		}

		fn reset_context(&mut self) {}
	}

	#[test]
	fn tokenize_retries_once_with_reported_size() {
		let runtime = ExpandingRuntime {
			factor: 4,
			calls: Cell::new(0),
		};
		let tokens = tokenize(&runtime, "abc", true).unwrap();
		assert_eq!(tokens.len(), 12);
		assert_eq!(runtime.calls.get(), 2);
	}

	#[test]
	fn tokenize_fits_without_retry() {
		let runtime = ExpandingRuntime {
			factor: 1,
			calls: Cell::new(0),
		};
		assert_eq!(tokenize(&runtime, "abcd", false).unwrap().len(), 4);
		assert_eq!(runtime.calls.get(), 1);
	}

	#[test]
	fn tokenize_gives_up_after_one_retry() {
		let err = tokenize(&StubbornRuntime, "abc", false).unwrap_err();
		assert!(matches!(err, TokenizeError::BufferTooSmall { .. }));
	}

	#[test]
	fn operations_without_model_report_not_loaded() {
		let mut adapter = adapter(MockBackend::default());
		assert!(!adapter.is_loaded());
		assert_eq!(adapter.status(), "No model loaded");
		assert_eq!(adapter.tokenize("hi", true), Err(TokenizeError::NotLoaded));
		assert_eq!(adapter.decode_batch(&[TokenId(1)]), Err(DecodeError::NotLoaded));
		assert_eq!(adapter.sample_next(), None);
		assert_eq!(adapter.detokenize(TokenId(1)), "");
		assert!(!adapter.is_end_of_sequence(TokenId(1)));

		// Unload with nothing loaded is a no-op.
		adapter.unload();
		assert!(!adapter.is_loaded());
	}

	#[test]
	fn load_reports_status_with_context_size_and_device() {
		let mut adapter = adapter(MockBackend::default());
		adapter.load("models/model.gguf").unwrap();
		assert!(adapter.is_loaded());
		assert_eq!(adapter.status(), "mock model (ctx: 2048, device: CPU (mock))");
		assert_eq!(adapter.model_path(), Some(Path::new("models/model.gguf")));
	}

	#[test]
	fn unload_releases_sampler_context_model_in_order() {
		let backend = MockBackend::default();
		let ledger = backend.ledger();
		let mut adapter = adapter(backend);
		adapter.load("a.gguf").unwrap();
		ledger.clear_events();

		adapter.unload();
		assert_eq!(
			ledger.events(),
			vec![
				LedgerEvent::Released(HandleKind::Sampler),
				LedgerEvent::Released(HandleKind::Context),
				LedgerEvent::Released(HandleKind::Model),
			]
		);
		assert_eq!(ledger.live(), 0);
		assert_eq!(adapter.status(), "No model loaded");
	}

	#[test]
	fn loading_twice_unloads_the_first_handle_set_before_acquiring() {
		let backend = MockBackend::default();
		let ledger = backend.ledger();
		let mut adapter = adapter(backend);

		adapter.load("first.gguf").unwrap();
		assert_eq!(ledger.live(), 3);
		ledger.clear_events();

		adapter.load("second.gguf").unwrap();
		assert_eq!(
			ledger.events(),
			vec![
				LedgerEvent::Released(HandleKind::Sampler),
				LedgerEvent::Released(HandleKind::Context),
				LedgerEvent::Released(HandleKind::Model),
				LedgerEvent::Acquired(HandleKind::Model),
				LedgerEvent::Acquired(HandleKind::Context),
				LedgerEvent::Acquired(HandleKind::Sampler),
			]
		);
		assert_eq!(ledger.live(), 3);
		assert_eq!(adapter.model_path(), Some(Path::new("second.gguf")));
	}

	#[test]
	fn context_allocation_failure_releases_the_model() {
		let backend = MockBackend::default().with_context_failure();
		let ledger = backend.ledger();
		let mut adapter = adapter(backend);

		let err = adapter.load("model.gguf").unwrap_err();
		assert!(matches!(err, LoadError::ContextAllocation(_)));
		assert_eq!(
			ledger.events(),
			vec![
				LedgerEvent::Acquired(HandleKind::Model),
				LedgerEvent::Released(HandleKind::Model),
			]
		);
		assert_eq!(ledger.live(), 0);
		assert!(!adapter.is_loaded());
	}

	#[test]
	fn failed_reload_leaves_adapter_unloaded() {
		let backend = MockBackend::default();
		let ledger = backend.ledger();
		let mut adapter = adapter(backend);
		adapter.load("good.gguf").unwrap();

		let err = adapter.load("").unwrap_err();
		assert!(matches!(err, LoadError::NotFound(_)));
		assert!(!adapter.is_loaded());
		assert_eq!(ledger.live(), 0);
	}

	#[test]
	fn dropping_the_adapter_releases_handles() {
		let backend = MockBackend::default();
		let ledger = backend.ledger();
		{
			let mut adapter = adapter(backend);
			adapter.load("model.gguf").unwrap();
			assert_eq!(ledger.live(), 3);
		}
		assert_eq!(ledger.live(), 0);
	}

	#[test]
	fn adapter_primitives_delegate_to_runtime() {
		let mut adapter = adapter(MockBackend::default());
		adapter.load("model.gguf").unwrap();

		let tokens = adapter.tokenize("hi", true).unwrap();
		assert_eq!(tokens.len(), 3);
		assert_eq!(adapter.detokenize(tokens[1]), "h");
		adapter.decode_batch(&tokens).unwrap();

		let next = adapter.sample_next().unwrap();
		assert!(!adapter.is_end_of_sequence(next));
		assert!(!adapter.detokenize(next).is_empty());
	}
}
