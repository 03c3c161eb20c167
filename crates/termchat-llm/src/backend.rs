//! Backend selector for the client and the smoke binary.

use std::path::Path;

use crate::config::{RuntimeConfig, SamplingParams};
#[cfg(feature = "llama-cpp")]
use crate::llama::{LlamaCppBackend, LlamaCppRuntime};
use crate::mock::{MockBackend, MockRuntime};
use crate::runtime::{ModelRuntime, RuntimeBackend, TokenizeOutcome};
use crate::{DecodeError, LoadError, LoadResult, TokenId};

pub enum Backend {
	Mock(MockBackend),

	#[cfg(feature = "llama-cpp")]
	Llama(LlamaCppBackend),
}

impl Backend {
	pub fn mock() -> Self {
		Self::Mock(MockBackend::default())
	}

	/// Accepts `mock` and `llama`. The latter fails with
	/// [`LoadError::BackendUnavailable`] unless built with `llama-cpp`.
	pub fn from_name(name: &str) -> LoadResult<Self> {
		match name {
			"mock" => Ok(Self::mock()),
			"llama" | "llama-cpp" => {
				#[cfg(feature = "llama-cpp")]
				{
					Ok(Self::Llama(LlamaCppBackend::new()?))
				}
				#[cfg(not(feature = "llama-cpp"))]
				{
					Err(LoadError::BackendUnavailable(
						"llama backend not enabled (rebuild with --features llama-cpp)".into(),
					))
				}
			}
			other => Err(LoadError::BackendUnavailable(format!("unknown backend: {other}"))),
		}
	}

	/// The real backend when compiled in, the mock otherwise.
	pub fn preferred() -> Self {
		#[cfg(feature = "llama-cpp")]
		{
			match LlamaCppBackend::new() {
				Ok(b) => return Self::Llama(b),
				Err(e) => tracing::warn!(error = %e, "llama.cpp unavailable, using mock backend"),
			}
		}
		Self::mock()
	}
}

impl Default for Backend {
	fn default() -> Self {
		Self::mock()
	}
}

pub enum BackendRuntime {
	Mock(MockRuntime),

	#[cfg(feature = "llama-cpp")]
	Llama(LlamaCppRuntime),
}

impl RuntimeBackend for Backend {
	type Runtime = BackendRuntime;

	fn name(&self) -> &str {
		match self {
			Backend::Mock(m) => m.name(),

			#[cfg(feature = "llama-cpp")]
			Backend::Llama(l) => l.name(),
		}
	}

	fn load(&self, path: &Path, config: &RuntimeConfig, sampling: &SamplingParams) -> LoadResult<BackendRuntime> {
		match self {
			Backend::Mock(m) => m.load(path, config, sampling).map(BackendRuntime::Mock),

			#[cfg(feature = "llama-cpp")]
			Backend::Llama(l) => l.load(path, config, sampling).map(BackendRuntime::Llama),
		}
	}

	fn device_description(&self, config: &RuntimeConfig) -> String {
		match self {
			Backend::Mock(m) => m.device_description(config),

			#[cfg(feature = "llama-cpp")]
			Backend::Llama(l) => l.device_description(config),
		}
	}
}

impl ModelRuntime for BackendRuntime {
	fn tokenize_into(&self, text: &str, add_special: bool, out: &mut [TokenId]) -> TokenizeOutcome {
		match self {
			BackendRuntime::Mock(r) => r.tokenize_into(text, add_special, out),

			#[cfg(feature = "llama-cpp")]
			BackendRuntime::Llama(r) => r.tokenize_into(text, add_special, out),
		}
	}

	fn decode_batch(&mut self, tokens: &[TokenId]) -> Result<(), DecodeError> {
		match self {
			BackendRuntime::Mock(r) => r.decode_batch(tokens),

			#[cfg(feature = "llama-cpp")]
			BackendRuntime::Llama(r) => r.decode_batch(tokens),
		}
	}

	fn sample_next(&mut self) -> TokenId {
		match self {
			BackendRuntime::Mock(r) => r.sample_next(),

			#[cfg(feature = "llama-cpp")]
			BackendRuntime::Llama(r) => r.sample_next(),
		}
	}

	fn detokenize(&mut self, token: TokenId) -> String {
		match self {
			BackendRuntime::Mock(r) => r.detokenize(token),

			#[cfg(feature = "llama-cpp")]
			BackendRuntime::Llama(r) => r.detokenize(token),
		}
	}

	fn is_end_of_sequence(&self, token: TokenId) -> bool {
		match self {
			BackendRuntime::Mock(r) => r.is_end_of_sequence(token),

			#[cfg(feature = "llama-cpp")]
			BackendRuntime::Llama(r) => r.is_end_of_sequence(token),
		}
	}

	fn reset_context(&mut self) {
		match self {
			BackendRuntime::Mock(r) => r.reset_context(),

			#[cfg(feature = "llama-cpp")]
			BackendRuntime::Llama(r) => r.reset_context(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::runtime::ModelAdapter;
	use pretty_assertions::assert_eq;

	#[test]
	fn from_name_selects_mock() {
		let backend = Backend::from_name("mock").unwrap();
		assert_eq!(backend.name(), "mock");
	}

	#[test]
	fn unknown_backend_is_unavailable() {
		let err = Backend::from_name("onnx").err().unwrap();
		assert!(matches!(err, LoadError::BackendUnavailable(_)));
	}

	#[cfg(not(feature = "llama-cpp"))]
	#[test]
	fn llama_requires_feature() {
		assert!(matches!(
			Backend::from_name("llama"),
			Err(LoadError::BackendUnavailable(_))
		));
		assert_eq!(Backend::preferred().name(), "mock");
	}

	#[test]
	fn adapter_over_selector_delegates() {
		let mut adapter = ModelAdapter::new(Backend::mock(), RuntimeConfig::default(), SamplingParams::default());
		adapter.load("model.gguf").unwrap();
		assert_eq!(adapter.status(), "mock model (ctx: 2048, device: CPU (mock))");
		let tokens = adapter.tokenize("ab", false).unwrap();
		assert_eq!(tokens.len(), 2);
		assert_eq!(adapter.detokenize(tokens[1]), "b");
	}
}
