//! `termchat.toml` manifest: model path, runtime sizing, sampling and
//! generation policy.
//!
//! Every key has a default, so a missing file or table is fine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use termchat_core::{ChatTemplate, DEFAULT_HISTORY_WINDOW};
use thiserror::Error;

/// llama.cpp's "pick a random seed" value.
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read manifest {path}: {source}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("invalid manifest: {0}")]
	Parse(#[from] toml::de::Error),
	#[error("invalid value for {key}: {reason}")]
	Invalid { key: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSection {
	pub path: String,
}

impl Default for ModelSection {
	fn default() -> Self {
		Self {
			path: "models/model.gguf".into(),
		}
	}
}

/// Execution-context sizing, fixed at load time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
	pub context_size: u32,
	pub batch_size: u32,
	pub threads: u32,
	/// Layers offloaded to the GPU; 0 keeps everything on the CPU.
	pub gpu_layers: u32,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		Self {
			context_size: 2048,
			batch_size: 512,
			threads: 4,
			gpu_layers: 99,
		}
	}
}

impl RuntimeConfig {
	pub fn device_description(&self) -> String {
		if self.gpu_layers > 0 {
			format!("GPU offload, {} layers", self.gpu_layers)
		} else {
			format!("CPU, {} threads", self.threads)
		}
	}
}

/// Sampler chain parameters. See [`SamplingParams::stages`] for the order.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplingParams {
	pub temperature: f32,
	pub top_k: u32,
	pub top_p: f32,
	pub seed: u32,
}

impl Default for SamplingParams {
	fn default() -> Self {
		Self {
			temperature: 0.8,
			top_k: 40,
			top_p: 0.95,
			seed: DEFAULT_SEED,
		}
	}
}

/// One stage of the sampler chain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SamplerStage {
	Temperature(f32),
	TopK(u32),
	TopP(f32),
	Distribution { seed: u32 },
}

impl SamplingParams {
	/// The chain backends build, in application order: temperature, top-k,
	/// top-p, then the seeded distribution draw.
	pub fn stages(&self) -> Vec<SamplerStage> {
		vec![
			SamplerStage::Temperature(self.temperature),
			SamplerStage::TopK(self.top_k),
			SamplerStage::TopP(self.top_p),
			SamplerStage::Distribution { seed: self.seed },
		]
	}
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
	pub max_tokens: u32,
	/// Trailing messages rendered into each prompt.
	pub history_window: usize,
	pub template: ChatTemplate,
	pub system_prompt: Option<String>,
	/// Overrides the template's control markers when set.
	pub stop_markers: Option<Vec<String>>,
}

impl Default for GenerationConfig {
	fn default() -> Self {
		Self {
			max_tokens: 512,
			history_window: DEFAULT_HISTORY_WINDOW,
			template: ChatTemplate::default(),
			system_prompt: None,
			stop_markers: None,
		}
	}
}

impl GenerationConfig {
	pub fn stop_markers(&self) -> Vec<String> {
		match &self.stop_markers {
			Some(markers) => markers.clone(),
			None => self.template.default_stop_markers(),
		}
	}
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Manifest {
	pub model: ModelSection,
	pub runtime: RuntimeConfig,
	pub sampling: SamplingParams,
	pub generation: GenerationConfig,
}

impl Manifest {
	pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
		let manifest: Manifest = toml::from_str(text)?;
		manifest.validate()?;
		Ok(manifest)
	}

	/// Reads a manifest; a relative model path is resolved against the
	/// manifest's directory.
	pub fn from_path(path: impl AsRef<Path>) -> ConfigResult<Self> {
		let path = path.as_ref();
		let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.display().to_string(),
			source,
		})?;
		let mut manifest = Self::from_toml_str(&text)?;

		let base_dir = path.parent().unwrap_or(Path::new("."));
		manifest.model.path = resolve_manifest_path(base_dir, &manifest.model.path);
		Ok(manifest)
	}

	/// Like [`Manifest::from_path`], but a missing file yields the defaults.
	pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
		let path = path.as_ref();
		if !path.is_file() {
			tracing::debug!(path = %path.display(), "no manifest found, using defaults");
			return Ok(Self::default());
		}
		Self::from_path(path)
	}

	pub fn model_path(&self) -> PathBuf {
		PathBuf::from(&self.model.path)
	}

	pub fn validate(&self) -> ConfigResult<()> {
		fn non_zero(key: &'static str, value: u64) -> ConfigResult<()> {
			if value == 0 {
				return Err(ConfigError::Invalid {
					key,
					reason: "must be > 0".into(),
				});
			}
			Ok(())
		}

		non_zero("runtime.context_size", self.runtime.context_size.into())?;
		non_zero("runtime.batch_size", self.runtime.batch_size.into())?;
		non_zero("runtime.threads", self.runtime.threads.into())?;
		non_zero("generation.max_tokens", self.generation.max_tokens.into())?;
		non_zero("generation.history_window", self.generation.history_window as u64)?;

		let s = &self.sampling;
		if s.temperature.is_nan() || s.temperature < 0.0 {
			return Err(ConfigError::Invalid {
				key: "sampling.temperature",
				reason: format!("must be >= 0, got {}", s.temperature),
			});
		}
		if s.top_p.is_nan() || s.top_p <= 0.0 || s.top_p > 1.0 {
			return Err(ConfigError::Invalid {
				key: "sampling.top_p",
				reason: format!("must be in (0, 1], got {}", s.top_p),
			});
		}
		if let Some(markers) = &self.generation.stop_markers {
			if markers.iter().any(|m| m.is_empty()) {
				return Err(ConfigError::Invalid {
					key: "generation.stop_markers",
					reason: "markers must be non-empty".into(),
				});
			}
		}
		Ok(())
	}
}

fn resolve_manifest_path(base_dir: &Path, p: &str) -> String {
	let path = Path::new(p);
	if path.is_absolute() {
		p.to_string()
	} else {
		base_dir.join(path).to_string_lossy().to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn empty_manifest_uses_defaults() {
		let manifest = Manifest::from_toml_str("").unwrap();
		assert_eq!(manifest, Manifest::default());
		assert_eq!(manifest.runtime.context_size, 2048);
		assert_eq!(manifest.runtime.batch_size, 512);
		assert_eq!(manifest.runtime.threads, 4);
		assert_eq!(manifest.sampling.top_k, 40);
		assert_eq!(manifest.generation.max_tokens, 512);
		assert_eq!(manifest.generation.history_window, 6);
	}

	#[test]
	fn shipped_manifest_matches_defaults() {
		let manifest = Manifest::from_toml_str(include_str!("../../../termchat.toml")).unwrap();
		assert_eq!(manifest, Manifest::default());
	}

	#[test]
	fn partial_tables_keep_other_defaults() {
		let manifest = Manifest::from_toml_str(
			r#"
[runtime]
context_size = 4096

[sampling]
temperature = 0.2

[generation]
template = "llama3"
max_tokens = 64
"#,
		)
		.unwrap();

		assert_eq!(manifest.runtime.context_size, 4096);
		assert_eq!(manifest.runtime.batch_size, 512);
		assert_eq!(manifest.sampling.temperature, 0.2);
		assert_eq!(manifest.sampling.top_p, 0.95);
		assert_eq!(manifest.generation.template, ChatTemplate::Llama3);
		assert_eq!(manifest.generation.max_tokens, 64);
		assert_eq!(
			manifest.generation.stop_markers(),
			ChatTemplate::Llama3.default_stop_markers()
		);
	}

	#[test]
	fn explicit_stop_markers_override_template() {
		let manifest = Manifest::from_toml_str(
			r#"
[generation]
stop_markers = ["</s>"]
"#,
		)
		.unwrap();
		assert_eq!(manifest.generation.stop_markers(), vec!["</s>".to_string()]);
	}

	#[test]
	fn invalid_values_are_rejected() {
		let err = Manifest::from_toml_str("[runtime]\nthreads = 0\n").unwrap_err();
		assert!(matches!(err, ConfigError::Invalid { key: "runtime.threads", .. }));

		let err = Manifest::from_toml_str("[sampling]\ntop_p = 1.5\n").unwrap_err();
		assert!(matches!(err, ConfigError::Invalid { key: "sampling.top_p", .. }));

		let err = Manifest::from_toml_str("[generation]\nstop_markers = [\"\"]\n").unwrap_err();
		assert!(matches!(err, ConfigError::Invalid { key: "generation.stop_markers", .. }));

		let err = Manifest::from_toml_str("[generation]\ntemplate = \"alpaca\"\n").unwrap_err();
		assert!(matches!(err, ConfigError::Parse(_)));
	}

	#[test]
	fn relative_model_path_resolves_against_manifest_dir() {
		let base = Path::new("/opt/termchat");
		assert_eq!(
			resolve_manifest_path(base, "models/qwen.gguf"),
			base.join("models/qwen.gguf").to_string_lossy()
		);
		assert_eq!(resolve_manifest_path(base, "/abs/model.gguf"), "/abs/model.gguf");
	}

	#[test]
	fn missing_manifest_falls_back_to_defaults() {
		let manifest = Manifest::load_or_default("/definitely/not/here/termchat.toml").unwrap();
		assert_eq!(manifest, Manifest::default());
	}

	#[test]
	fn sampler_stages_run_in_fixed_order() {
		let params = SamplingParams {
			temperature: 0.3,
			top_k: 7,
			top_p: 0.5,
			seed: 42,
		};
		assert_eq!(
			params.stages(),
			vec![
				SamplerStage::Temperature(0.3),
				SamplerStage::TopK(7),
				SamplerStage::TopP(0.5),
				SamplerStage::Distribution { seed: 42 },
			]
		);
		assert_eq!(
			SamplingParams::default().stages(),
			vec![
				SamplerStage::Temperature(0.8),
				SamplerStage::TopK(40),
				SamplerStage::TopP(0.95),
				SamplerStage::Distribution { seed: DEFAULT_SEED },
			]
		);
	}

	#[test]
	fn device_description_reflects_gpu_offload() {
		let mut cfg = RuntimeConfig::default();
		assert_eq!(cfg.device_description(), "GPU offload, 99 layers");
		cfg.gpu_layers = 0;
		assert_eq!(cfg.device_description(), "CPU, 4 threads");
	}
}
