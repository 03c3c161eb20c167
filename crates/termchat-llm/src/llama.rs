//! llama.cpp backend (feature `llama-cpp`).
//!
//! One [`LlamaCppRuntime`] owns a sampler chain and a [`ModelContext`] cell
//! holding the model together with the context that borrows it. Drop order is
//! sampler, context, model.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::OnceLock;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use self_cell::self_cell;

use crate::config::{RuntimeConfig, SamplerStage, SamplingParams};
use crate::piece::PieceDecoder;
use crate::runtime::{ModelRuntime, RuntimeBackend, TokenizeOutcome};
use crate::{DecodeError, LoadError, LoadResult, TokenId};

/// llama.cpp may only be initialized once per process.
static LLAMA_BACKEND: OnceLock<Result<LlamaBackend, String>> = OnceLock::new();

fn get_backend() -> LoadResult<&'static LlamaBackend> {
	let result = LLAMA_BACKEND.get_or_init(|| {
		let mut backend = LlamaBackend::init().map_err(|e| e.to_string())?;
		backend.void_logs();
		Ok(backend)
	});
	match result {
		Ok(backend) => Ok(backend),
		Err(e) => Err(LoadError::BackendUnavailable(format!("llama.cpp init failed: {e}"))),
	}
}

/// Largest single token surface, in bytes.
const MAX_PIECE_BYTES: usize = 128;

self_cell!(
	/// A loaded model and the context evaluating against it.
	struct ModelContext {
		owner: LlamaModel,

		#[not_covariant]
		dependent: LlamaContext,
	}
);

fn build_sampler(sampling: &SamplingParams) -> LlamaSampler {
	let stages = sampling.stages().into_iter().map(|stage| match stage {
		SamplerStage::Temperature(t) => LlamaSampler::temp(t),
		SamplerStage::TopK(k) => LlamaSampler::top_k(k as i32),
		SamplerStage::TopP(p) => LlamaSampler::top_p(p, 1),
		SamplerStage::Distribution { seed } => LlamaSampler::dist(seed),
	});
	LlamaSampler::chain_simple(stages)
}

pub struct LlamaCppBackend {
	backend: &'static LlamaBackend,
}

impl LlamaCppBackend {
	pub fn new() -> LoadResult<Self> {
		Ok(Self {
			backend: get_backend()?,
		})
	}
}

impl RuntimeBackend for LlamaCppBackend {
	type Runtime = LlamaCppRuntime;

	fn name(&self) -> &str {
		"llama.cpp"
	}

	fn load(&self, path: &Path, config: &RuntimeConfig, sampling: &SamplingParams) -> LoadResult<LlamaCppRuntime> {
		if !path.is_file() {
			return Err(LoadError::NotFound(path.to_path_buf()));
		}

		let model_params = LlamaModelParams::default().with_n_gpu_layers(config.gpu_layers);
		let model = LlamaModel::load_from_file(self.backend, path, &model_params)
			.map_err(|e| LoadError::InvalidModel(e.to_string()))?;
		tracing::debug!(vocab = model.n_vocab(), "llama.cpp model loaded");

		let n_ctx = NonZeroU32::new(config.context_size)
			.ok_or_else(|| LoadError::ContextAllocation("context_size must be >= 1".into()))?;
		let ctx_params = LlamaContextParams::default()
			.with_n_ctx(Some(n_ctx))
			.with_n_batch(config.batch_size)
			.with_n_threads(config.threads as i32)
			.with_n_threads_batch(config.threads as i32);

		let backend = self.backend;
		let cell = ModelContext::try_new(model, |model| {
			model
				.new_context(backend, ctx_params)
				.map_err(|e| LoadError::ContextAllocation(e.to_string()))
		})?;

		Ok(LlamaCppRuntime {
			sampler: build_sampler(sampling),
			cell,
			pieces: PieceDecoder::new(),
			n_past: 0,
			n_batch: config.batch_size.max(1) as usize,
		})
	}
}

pub struct LlamaCppRuntime {
	// Fields drop in declaration order; the sampler goes before the cell.
	sampler: LlamaSampler,
	cell: ModelContext,
	pieces: PieceDecoder,
	n_past: i32,
	n_batch: usize,
}

impl ModelRuntime for LlamaCppRuntime {
	fn tokenize_into(&self, text: &str, add_special: bool, out: &mut [TokenId]) -> TokenizeOutcome {
		let add_bos = if add_special { AddBos::Always } else { AddBos::Never };
		let tokens = match self.cell.borrow_owner().str_to_token(text, add_bos) {
			Ok(tokens) => tokens,
			Err(e) => {
				tracing::warn!(error = %e, "llama.cpp tokenize failed");
				return TokenizeOutcome::Written(0);
			}
		};
		if tokens.len() > out.len() {
			return TokenizeOutcome::NeedsCapacity(tokens.len());
		}
		for (slot, token) in out.iter_mut().zip(&tokens) {
			*slot = TokenId(token.0);
		}
		TokenizeOutcome::Written(tokens.len())
	}

	fn decode_batch(&mut self, tokens: &[TokenId]) -> Result<(), DecodeError> {
		let mut batch = LlamaBatch::new(self.n_batch, 1);
		let total = tokens.len();
		for (chunk_idx, chunk) in tokens.chunks(self.n_batch).enumerate() {
			batch.clear();
			for (i, token) in chunk.iter().enumerate() {
				let is_last = chunk_idx * self.n_batch + i + 1 == total;
				batch
					.add(LlamaToken::new(token.0), self.n_past + i as i32, &[0], is_last)
					.map_err(|e| DecodeError::Rejected(e.to_string()))?;
			}
			self.cell
				.with_dependent_mut(|_, context| context.decode(&mut batch))
				.map_err(|e| DecodeError::Rejected(e.to_string()))?;
			self.n_past += chunk.len() as i32;
		}
		Ok(())
	}

	fn sample_next(&mut self) -> TokenId {
		let sampler = &mut self.sampler;
		let token = self.cell.with_dependent(|_, context| sampler.sample(context, -1));
		sampler.accept(token);
		TokenId(token.0)
	}

	fn detokenize(&mut self, token: TokenId) -> String {
		let model = self.cell.borrow_owner();
		match model.token_to_piece_bytes(LlamaToken::new(token.0), MAX_PIECE_BYTES, true, None) {
			Ok(bytes) => self.pieces.push(&bytes),
			Err(e) => {
				tracing::debug!(token = token.0, error = %e, "token has no printable surface");
				String::new()
			}
		}
	}

	fn is_end_of_sequence(&self, token: TokenId) -> bool {
		self.cell.borrow_owner().is_eog_token(LlamaToken::new(token.0))
	}

	fn reset_context(&mut self) {
		self.cell.with_dependent_mut(|_, context| context.clear_kv_cache());
		self.pieces.reset();
		self.n_past = 0;
	}
}
