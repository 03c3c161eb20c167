//! Deterministic in-process runtime.
//!
//! Tokens are characters; replies are derived from the last user turn of the
//! ingested prompt, or taken from a fixed script. Every handle acquisition and
//! release is recorded in a shared [`MockLedger`] so lifecycle ordering can be
//! asserted.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{RuntimeConfig, SamplerStage, SamplingParams};
use crate::runtime::{ModelRuntime, RuntimeBackend, TokenizeOutcome};
use crate::{DecodeError, LoadError, LoadResult, TokenId};

pub const MOCK_BOS: TokenId = TokenId(1);
pub const MOCK_EOS: TokenId = TokenId(2);

const CHAR_BASE: i32 = 0x100;
const PIECE_BASE: i32 = 0x20_0000;

/// Placeholder heuristic: 1 token ~ 4 chars.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
	Model,
	Context,
	Sampler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerEvent {
	Acquired(HandleKind),
	Released(HandleKind),
}

#[derive(Debug, Default)]
struct LedgerState {
	events: Vec<LedgerEvent>,
	live: usize,
	sampler_chain: Option<Vec<SamplerStage>>,
}

/// Records handle lifecycle events across every runtime a backend loads.
#[derive(Debug, Default)]
pub struct MockLedger {
	inner: Mutex<LedgerState>,
}

impl MockLedger {
	fn acquire(&self, kind: HandleKind) {
		let mut inner = self.inner.lock();
		inner.events.push(LedgerEvent::Acquired(kind));
		inner.live += 1;
	}

	fn release(&self, kind: HandleKind) {
		let mut inner = self.inner.lock();
		inner.events.push(LedgerEvent::Released(kind));
		inner.live = inner.live.saturating_sub(1);
	}

	fn configure_sampler(&self, chain: Vec<SamplerStage>) {
		self.inner.lock().sampler_chain = Some(chain);
	}

	/// Chain of the most recently built sampler.
	pub fn sampler_chain(&self) -> Option<Vec<SamplerStage>> {
		self.inner.lock().sampler_chain.clone()
	}

	pub fn events(&self) -> Vec<LedgerEvent> {
		self.inner.lock().events.clone()
	}

	pub fn clear_events(&self) {
		self.inner.lock().events.clear();
	}

	/// Handles currently alive.
	pub fn live(&self) -> usize {
		self.inner.lock().live
	}
}

struct Tracked {
	kind: HandleKind,
	ledger: Arc<MockLedger>,
}

impl Tracked {
	fn acquire(kind: HandleKind, ledger: &Arc<MockLedger>) -> Self {
		ledger.acquire(kind);
		Self {
			kind,
			ledger: ledger.clone(),
		}
	}
}

impl Drop for Tracked {
	fn drop(&mut self) {
		self.ledger.release(self.kind);
	}
}

struct MockModel {
	_handle: Tracked,
	/// Multi-character pieces the sampler may produce.
	pieces: Vec<String>,
}

struct MockContext {
	_handle: Tracked,
	capacity: usize,
	ingested: Vec<TokenId>,
	decode_calls: usize,
	fail_decode_on_call: Option<usize>,
}

struct MockSampler {
	_handle: Tracked,
	script: Option<Vec<String>>,
	queue: VecDeque<TokenId>,
	planned: bool,
}

/// A loaded mock handle set.
pub struct MockRuntime {
	// Fields drop in declaration order: sampler, context, model.
	sampler: MockSampler,
	context: MockContext,
	model: MockModel,
}

impl MockRuntime {
	/// Tokens decoded into the context since the last reset.
	pub fn ingested(&self) -> &[TokenId] {
		&self.context.ingested
	}

	pub fn decode_calls(&self) -> usize {
		self.context.decode_calls
	}

	/// Text of everything decoded into the context.
	pub fn ingested_text(&self) -> String {
		self.context
			.ingested
			.iter()
			.map(|t| self.piece_text(*t))
			.collect()
	}

	fn piece_text(&self, token: TokenId) -> String {
		let id = token.0;
		if id >= PIECE_BASE {
			return self
				.model
				.pieces
				.get((id - PIECE_BASE) as usize)
				.cloned()
				.unwrap_or_default();
		}
		if id >= CHAR_BASE {
			return char::from_u32((id - CHAR_BASE) as u32)
				.map(String::from)
				.unwrap_or_default();
		}
		String::new()
	}

	fn piece_id(&mut self, piece: String) -> TokenId {
		let idx = match self.model.pieces.iter().position(|p| *p == piece) {
			Some(idx) => idx,
			None => {
				self.model.pieces.push(piece);
				self.model.pieces.len() - 1
			}
		};
		TokenId(PIECE_BASE + idx as i32)
	}

	fn plan_reply(&mut self) {
		let pieces = match self.sampler.script.clone() {
			Some(script) => script,
			None => split_pieces(&mock_response(&self.ingested_text())),
		};
		let ids: Vec<TokenId> = pieces.into_iter().map(|p| self.piece_id(p)).collect();
		self.sampler.queue = ids.into();
		self.sampler.planned = true;
	}
}

impl ModelRuntime for MockRuntime {
	fn tokenize_into(&self, text: &str, add_special: bool, out: &mut [TokenId]) -> TokenizeOutcome {
		let required = text.chars().count() + usize::from(add_special);
		if out.len() < required {
			return TokenizeOutcome::NeedsCapacity(required);
		}
		let special = add_special.then_some(MOCK_BOS);
		let chars = text.chars().map(|c| TokenId(CHAR_BASE + c as i32));
		for (slot, token) in out.iter_mut().zip(special.into_iter().chain(chars)) {
			*slot = token;
		}
		TokenizeOutcome::Written(required)
	}

	fn decode_batch(&mut self, tokens: &[TokenId]) -> Result<(), DecodeError> {
		let ctx = &mut self.context;
		ctx.decode_calls += 1;
		if ctx.fail_decode_on_call == Some(ctx.decode_calls) {
			return Err(DecodeError::Rejected("injected decode failure".into()));
		}
		if ctx.ingested.len() + tokens.len() > ctx.capacity {
			return Err(DecodeError::Rejected(format!(
				"context overflow: {} + {} > {}",
				ctx.ingested.len(),
				tokens.len(),
				ctx.capacity
			)));
		}
		ctx.ingested.extend_from_slice(tokens);
		Ok(())
	}

	fn sample_next(&mut self) -> TokenId {
		if !self.sampler.planned {
			self.plan_reply();
		}
		self.sampler.queue.pop_front().unwrap_or(MOCK_EOS)
	}

	fn detokenize(&mut self, token: TokenId) -> String {
		self.piece_text(token)
	}

	fn is_end_of_sequence(&self, token: TokenId) -> bool {
		token == MOCK_EOS
	}

	fn reset_context(&mut self) {
		self.context.ingested.clear();
		self.sampler.queue.clear();
		self.sampler.planned = false;
	}
}

/// Default backend: no model assets, deterministic output.
#[derive(Clone, Debug, Default)]
pub struct MockBackend {
	script: Option<Vec<String>>,
	fail_model: bool,
	fail_context: bool,
	fail_decode_on_call: Option<usize>,
	ledger: Arc<MockLedger>,
}

impl MockBackend {
	/// Every generation samples exactly these pieces, then end-of-sequence.
	pub fn scripted<I, S>(pieces: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			script: Some(pieces.into_iter().map(Into::into).collect()),
			..Self::default()
		}
	}

	pub fn with_model_failure(mut self) -> Self {
		self.fail_model = true;
		self
	}

	pub fn with_context_failure(mut self) -> Self {
		self.fail_context = true;
		self
	}

	/// Fails the `n`th decode call (1-based) of each loaded runtime.
	pub fn with_decode_failure_on_call(mut self, n: usize) -> Self {
		self.fail_decode_on_call = Some(n);
		self
	}

	pub fn ledger(&self) -> Arc<MockLedger> {
		self.ledger.clone()
	}
}

impl RuntimeBackend for MockBackend {
	type Runtime = MockRuntime;

	fn name(&self) -> &str {
		"mock"
	}

	fn load(&self, path: &Path, config: &RuntimeConfig, sampling: &SamplingParams) -> LoadResult<MockRuntime> {
		if path.as_os_str().is_empty() {
			return Err(LoadError::NotFound(path.to_path_buf()));
		}
		if self.fail_model {
			return Err(LoadError::InvalidModel(format!("{} is not a model file", path.display())));
		}

		let model = MockModel {
			_handle: Tracked::acquire(HandleKind::Model, &self.ledger),
			pieces: Vec::new(),
		};
		if self.fail_context {
			return Err(LoadError::ContextAllocation("mock context refused".into()));
		}
		let context = MockContext {
			_handle: Tracked::acquire(HandleKind::Context, &self.ledger),
			capacity: config.context_size as usize * CHARS_PER_TOKEN,
			ingested: Vec::new(),
			decode_calls: 0,
			fail_decode_on_call: self.fail_decode_on_call,
		};
		self.ledger.configure_sampler(sampling.stages());
		let sampler = MockSampler {
			_handle: Tracked::acquire(HandleKind::Sampler, &self.ledger),
			script: self.script.clone(),
			queue: VecDeque::new(),
			planned: false,
		};
		tracing::debug!(path = %path.display(), "mock runtime loaded");
		Ok(MockRuntime {
			sampler,
			context,
			model,
		})
	}

	fn device_description(&self, _config: &RuntimeConfig) -> String {
		"CPU (mock)".into()
	}
}

fn last_user_turn(prompt: &str) -> Option<&str> {
	const HEADERS: [&str; 2] = [
		"<|im_start|>user\n",
		"<|start_header_id|>user<|end_header_id|>\n\n",
	];
	let (idx, header) = HEADERS
		.iter()
		.filter_map(|h| prompt.rfind(h).map(|i| (i, *h)))
		.max_by_key(|(i, _)| *i)?;
	let rest = &prompt[idx + header.len()..];
	let end = rest.find("<|").unwrap_or(rest.len());
	Some(rest[..end].trim())
}

fn mock_response(prompt: &str) -> String {
	match last_user_turn(prompt) {
		Some(text) if !text.is_empty() => {
			format!("You said: \"{text}\". I am a mock runtime, load a real model for actual answers.")
		}
		_ => "Hello! I am a mock runtime.".into(),
	}
}

/// Splits text into word pieces, each carrying its leading whitespace.
fn split_pieces(text: &str) -> Vec<String> {
	let mut pieces = Vec::new();
	let mut current = String::new();
	for c in text.chars() {
		if c.is_whitespace() && current.chars().any(|p| !p.is_whitespace()) {
			pieces.push(std::mem::take(&mut current));
		}
		current.push(c);
	}
	if !current.is_empty() {
		pieces.push(current);
	}
	pieces
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::runtime::tokenize;
	use pretty_assertions::assert_eq;

	fn load(backend: &MockBackend) -> MockRuntime {
		backend
			.load(Path::new("model.gguf"), &RuntimeConfig::default(), &SamplingParams::default())
			.unwrap()
	}

	#[test]
	fn tokenize_is_character_level_with_optional_bos() {
		let mut runtime = load(&MockBackend::default());
		let tokens = tokenize(&runtime, "hé", true).unwrap();
		assert_eq!(tokens[0], MOCK_BOS);
		assert_eq!(tokens.len(), 3);
		let text: String = tokens.iter().map(|t| runtime.detokenize(*t)).collect();
		assert_eq!(text, "hé");
		assert_eq!(tokenize(&runtime, "", false).unwrap(), Vec::<TokenId>::new());
	}

	#[test]
	fn reply_echoes_last_user_turn() {
		let mut runtime = load(&MockBackend::default());
		let prompt = "<|im_start|>system\nsys<|im_end|>\n<|im_start|>user\nold<|im_end|>\n\
		              <|im_start|>assistant\nx<|im_end|>\n<|im_start|>user\nhow are you?<|im_end|>\n\
		              <|im_start|>assistant\n";
		let tokens = tokenize(&runtime, prompt, true).unwrap();
		runtime.decode_batch(&tokens).unwrap();

		let mut reply = String::new();
		loop {
			let token = runtime.sample_next();
			if runtime.is_end_of_sequence(token) {
				break;
			}
			reply.push_str(&runtime.detokenize(token));
			runtime.decode_batch(&[token]).unwrap();
		}
		assert_eq!(
			reply,
			"You said: \"how are you?\". I am a mock runtime, load a real model for actual answers."
		);
	}

	#[test]
	fn scripted_pieces_then_end_of_sequence() {
		let mut runtime = load(&MockBackend::scripted(["Hi", " there"]));
		let a = runtime.sample_next();
		let b = runtime.sample_next();
		assert_eq!(runtime.detokenize(a), "Hi");
		assert_eq!(runtime.detokenize(b), " there");
		let end = runtime.sample_next();
		assert!(runtime.is_end_of_sequence(end));

		runtime.reset_context();
		let again = runtime.sample_next();
		assert_eq!(runtime.detokenize(again), "Hi");
	}

	#[test]
	fn context_overflow_is_rejected() {
		let backend = MockBackend::default();
		let config = RuntimeConfig {
			context_size: 1,
			..RuntimeConfig::default()
		};
		let mut runtime = backend
			.load(Path::new("m.gguf"), &config, &SamplingParams::default())
			.unwrap();
		let tokens = tokenize(&runtime, "abcdef", false).unwrap();
		let err = runtime.decode_batch(&tokens).unwrap_err();
		assert!(matches!(err, DecodeError::Rejected(_)));
		assert!(runtime.ingested().is_empty());
	}

	#[test]
	fn injected_decode_failure_hits_the_requested_call() {
		let mut runtime = load(&MockBackend::default().with_decode_failure_on_call(2));
		runtime.decode_batch(&[MOCK_BOS]).unwrap();
		assert!(runtime.decode_batch(&[MOCK_BOS]).is_err());
		runtime.decode_batch(&[MOCK_BOS]).unwrap();
		assert_eq!(runtime.decode_calls(), 3);
	}

	#[test]
	fn model_failure_acquires_nothing() {
		let backend = MockBackend::default().with_model_failure();
		let err = backend
			.load(Path::new("m.gguf"), &RuntimeConfig::default(), &SamplingParams::default())
			.err()
			.unwrap();
		assert!(matches!(err, LoadError::InvalidModel(_)));
		assert!(backend.ledger().events().is_empty());
	}

	#[test]
	fn load_records_the_sampler_chain_in_order() {
		let backend = MockBackend::default();
		assert_eq!(backend.ledger().sampler_chain(), None);
		let sampling = SamplingParams {
			temperature: 0.2,
			top_k: 5,
			top_p: 0.7,
			seed: 9,
		};
		let _runtime = backend
			.load(Path::new("m.gguf"), &RuntimeConfig::default(), &sampling)
			.unwrap();
		assert_eq!(
			backend.ledger().sampler_chain(),
			Some(vec![
				SamplerStage::Temperature(0.2),
				SamplerStage::TopK(5),
				SamplerStage::TopP(0.7),
				SamplerStage::Distribution { seed: 9 },
			])
		);
	}

	#[test]
	fn split_pieces_keeps_leading_whitespace() {
		assert_eq!(split_pieces("Hello  big world"), vec!["Hello", "  big", " world"]);
		assert_eq!(split_pieces(" lead"), vec![" lead"]);
	}
}
