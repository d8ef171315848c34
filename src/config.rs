// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Application settings and the on-disk model manifest.

use std::{
	env, fs,
	path::{Path, PathBuf}
};

use serde::{Deserialize, Serialize};

use crate::{installer::InstallPlan, pipelines::Txt2ImgOptions, schedulers::SchedulerKind};

/// Environment variable pointing at an alternative settings file.
pub const CONFIG_ENV_VAR: &str = "DIFFUSION_DESK_CONFIG";
/// Settings file looked up next to the executable.
pub const CONFIG_FILE_NAME: &str = "diffusion-desk.json";

/// Top-level application settings. Every field has a default, so partial files are fine.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AppConfig {
	/// Which pretrained model to generate with.
	pub model: ModelSpec,
	/// Where exported models are cached. Defaults to `<exe dir>/model`.
	pub cache_dir: Option<PathBuf>,
	/// Where each generated image is written. Successive generations overwrite it.
	pub output_path: PathBuf,
	/// Inference parameters applied to every request.
	pub generation: GenerationDefaults,
	/// Memory-saving execution strategies.
	pub memory: MemoryOptions,
	/// Python interpreter used for package installation and model export.
	pub python: String,
	/// Command whose zero exit status indicates an NVIDIA GPU.
	pub gpu_probe: String,
	/// Packages provisioned before the first run.
	pub installer: InstallPlan
}

impl Default for AppConfig {
	fn default() -> Self {
		Self {
			model: ModelSpec::default(),
			cache_dir: None,
			output_path: PathBuf::from("output.png"),
			generation: GenerationDefaults::default(),
			memory: MemoryOptions::default(),
			python: if cfg!(windows) { "python" } else { "python3" }.to_string(),
			gpu_probe: "nvidia-smi".to_string(),
			installer: InstallPlan::default()
		}
	}
}

impl AppConfig {
	/// Reads settings from `path`.
	pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
		let bytes = fs::read(path.as_ref())?;
		Ok(serde_json::from_slice(&bytes)?)
	}

	/// Reads settings from `$DIFFUSION_DESK_CONFIG`, falling back to `diffusion-desk.json` next to the executable.
	/// A missing file yields the defaults; a malformed one is an error.
	pub fn discover() -> crate::Result<Self> {
		let path = env::var_os(CONFIG_ENV_VAR)
			.map(PathBuf::from)
			.unwrap_or_else(|| base_dir().join(CONFIG_FILE_NAME));
		if path.is_file() {
			log::info!("reading settings from {}", path.display());
			Self::from_file(path)
		} else {
			log::debug!("no settings at {}, using defaults", path.display());
			Ok(Self::default())
		}
	}

	/// The directory exported models are cached in.
	pub fn cache_dir(&self) -> PathBuf {
		self.cache_dir.clone().unwrap_or_else(|| base_dir().join("model"))
	}
}

/// The directory holding the running executable, or the working directory if that cannot be determined.
pub fn base_dir() -> PathBuf {
	env::current_exe()
		.ok()
		.and_then(|exe| exe.parent().map(Path::to_path_buf))
		.or_else(|| env::current_dir().ok())
		.unwrap_or_else(|| PathBuf::from("."))
}

/// Identifies a pretrained model: a Hugging Face repository or a local directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ModelSpec {
	/// Repository id (`org/name`) or path to an exported model directory.
	pub id: String,
	/// Optional branch, tag, or commit of the repository.
	pub revision: Option<String>
}

impl Default for ModelSpec {
	fn default() -> Self {
		Self {
			id: "stable-diffusion-v1-5/stable-diffusion-v1-5".to_string(),
			revision: None
		}
	}
}

impl ModelSpec {
	/// Directory name used for this model in the export cache.
	///
	/// ```
	/// # use diffusion_desk::config::ModelSpec;
	/// let spec = ModelSpec { id: "org/model".into(), revision: Some("fp16".into()) };
	/// assert_eq!(spec.cache_key(), "org--model@fp16");
	/// ```
	pub fn cache_key(&self) -> String {
		let key = self.id.replace(['/', '\\'], "--").replace(':', "-");
		match &self.revision {
			Some(revision) => format!("{key}@{revision}"),
			None => key
		}
	}
}

/// Parameters applied to every generation request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GenerationDefaults {
	/// Number of denoising steps.
	pub steps: usize,
	/// Output width in pixels; rounded down to a multiple of 8.
	pub width: u32,
	/// Output height in pixels; rounded down to a multiple of 8.
	pub height: u32,
	/// Classifier-free guidance scale. Values `<= 1.0` disable guidance.
	pub guidance_scale: f32,
	/// What the image should not contain.
	pub negative_prompt: Option<String>,
	/// Fixed seed for reproducible output; random per request when unset.
	pub seed: Option<u64>,
	/// Scheduler driving the denoising loop.
	pub scheduler: SchedulerKind
}

impl Default for GenerationDefaults {
	fn default() -> Self {
		Self {
			steps: 30,
			width: 512,
			height: 512,
			guidance_scale: 7.5,
			negative_prompt: None,
			seed: None,
			scheduler: SchedulerKind::default()
		}
	}
}

impl GenerationDefaults {
	/// Builds the per-request inference options.
	pub fn to_options(&self) -> Txt2ImgOptions {
		let options = Txt2ImgOptions::default()
			.with_steps(self.steps)
			.with_size(self.width, self.height)
			.with_guidance_scale(self.guidance_scale)
			.with_negative_prompt(self.negative_prompt.clone())
			.with_scheduler(self.scheduler);
		match self.seed {
			Some(seed) => options.with_seed(seed),
			None => options.with_random_seed()
		}
	}
}

/// How model weights are distributed between the accelerator and the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OffloadMode {
	/// Every model lives on the accelerator.
	None,
	/// The UNet lives on the accelerator; text encoder and VAE stay on the CPU.
	#[default]
	Model,
	/// Models are loaded right before the phase that needs them and dropped right after.
	Sequential
}

/// Memory-saving execution strategies. Each trades speed for lower peak memory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MemoryOptions {
	/// Evaluate the conditional and unconditional halves of guidance as separate UNet passes.
	pub attention_slicing: bool,
	/// Decode latents in overlapping tiles instead of all at once.
	pub vae_tiling: bool,
	/// Latent-space edge length of a VAE tile.
	pub tile_size: usize,
	/// Latent-space overlap between neighbouring tiles.
	pub tile_overlap: usize,
	/// Model placement strategy.
	pub offload: OffloadMode,
	/// Per-session CUDA memory limit in bytes.
	pub cuda_memory_limit: Option<usize>
}

impl Default for MemoryOptions {
	fn default() -> Self {
		Self {
			attention_slicing: true,
			vae_tiling: true,
			tile_size: 64,
			tile_overlap: 8,
			offload: OffloadMode::default(),
			cuda_memory_limit: None
		}
	}
}

/// Runtime a model export targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffusionFramework {
	/// ONNX graphs run with ONNX Runtime.
	Onnx
}

/// Tokenizer of a model export.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum TokenizerConfig {
	/// A fast CLIP tokenizer; `path` points at its `tokenizer.json`.
	#[serde(rename_all = "kebab-case")]
	CLIPTokenizer {
		path: String,
		model_max_length: usize,
		bos_token: u32,
		eos_token: u32
	}
}

/// A single file of a model export.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelFileConfig {
	/// Location relative to the model root.
	pub path: String
}

/// The VAE of a model export.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VAEConfig {
	/// Location of the decoder graph relative to the model root.
	pub decoder: String
}

/// Relative locations of every file a Stable Diffusion export consists of.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
#[allow(missing_docs)]
pub struct StableDiffusionLayout {
	pub tokenizer: TokenizerConfig,
	pub text_encoder: ModelFileConfig,
	pub unet: ModelFileConfig,
	pub vae: VAEConfig,
	/// `scheduler_config.json`; the Stable Diffusion v1 schedule is assumed when absent.
	#[serde(default)]
	pub scheduler: Option<ModelFileConfig>
}

/// The layout produced by `optimum.exporters.onnx` plus a fast-tokenizer `tokenizer.json`.
impl Default for StableDiffusionLayout {
	fn default() -> Self {
		Self {
			tokenizer: TokenizerConfig::CLIPTokenizer {
				path: "tokenizer/tokenizer.json".to_string(),
				model_max_length: 77,
				bos_token: 49406,
				eos_token: 49407
			},
			text_encoder: ModelFileConfig {
				path: "text_encoder/model.onnx".to_string()
			},
			unet: ModelFileConfig { path: "unet/model.onnx".to_string() },
			vae: VAEConfig {
				decoder: "vae_decoder/model.onnx".to_string()
			},
			scheduler: Some(ModelFileConfig {
				path: "scheduler/scheduler_config.json".to_string()
			})
		}
	}
}

impl StableDiffusionLayout {
	/// Files this layout requires that are absent under `root`. The scheduler config is optional.
	pub fn missing_files(&self, root: &Path) -> Vec<PathBuf> {
		let TokenizerConfig::CLIPTokenizer { path: tokenizer, .. } = &self.tokenizer;
		[tokenizer, &self.text_encoder.path, &self.unet.path, &self.vae.decoder]
			.into_iter()
			.map(|path| root.join(path))
			.filter(|path| !path.is_file())
			.collect()
	}
}

/// Contents of `diffusers.json` in a model root.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "pipeline", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ModelManifest {
	/// A Stable Diffusion text-to-image export.
	#[allow(missing_docs)]
	StableDiffusion {
		framework: DiffusionFramework,
		#[serde(flatten)]
		inner: StableDiffusionLayout
	}
}

impl ModelManifest {
	/// Manifest file name inside a model root.
	pub const FILE_NAME: &'static str = "diffusers.json";

	/// Reads the manifest under `root`, or assumes the default export layout when there is none.
	pub fn load(root: &Path) -> anyhow::Result<StableDiffusionLayout> {
		let path = root.join(Self::FILE_NAME);
		if !path.is_file() {
			return Ok(StableDiffusionLayout::default());
		}
		let manifest: ModelManifest = serde_json::from_slice(&fs::read(&path)?)?;
		match manifest {
			ModelManifest::StableDiffusion { framework, inner } => {
				anyhow::ensure!(framework == DiffusionFramework::Onnx, "unsupported framework {framework:?} in {}", path.display());
				Ok(inner)
			}
			#[allow(unreachable_patterns)]
			_ => anyhow::bail!("{} does not describe a stable diffusion pipeline", path.display())
		}
	}

	/// Writes a manifest for `layout` under `root`.
	pub fn write(root: &Path, layout: StableDiffusionLayout) -> anyhow::Result<()> {
		let manifest = ModelManifest::StableDiffusion {
			framework: DiffusionFramework::Onnx,
			inner: layout
		};
		fs::write(root.join(Self::FILE_NAME), serde_json::to_vec_pretty(&manifest)?)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partial_settings_fill_in_defaults() {
		let config: AppConfig = serde_json::from_str(r#"{ "output-path": "out/fox.png", "memory": { "offload": "sequential" } }"#).unwrap();
		assert_eq!(config.output_path, PathBuf::from("out/fox.png"));
		assert_eq!(config.memory.offload, OffloadMode::Sequential);
		assert!(config.memory.vae_tiling);
		assert_eq!(config.generation.steps, 30);
		assert_eq!(config.model, ModelSpec::default());
	}

	#[test]
	fn manifest_roundtrips_through_disk() {
		let dir = tempfile::tempdir().unwrap();
		assert_eq!(ModelManifest::load(dir.path()).unwrap(), StableDiffusionLayout::default());

		let mut layout = StableDiffusionLayout::default();
		layout.unet.path = "unet.onnx".to_string();
		ModelManifest::write(dir.path(), layout.clone()).unwrap();
		assert_eq!(ModelManifest::load(dir.path()).unwrap(), layout);
	}

	#[test]
	fn missing_files_skips_scheduler() {
		let dir = tempfile::tempdir().unwrap();
		let layout = StableDiffusionLayout::default();
		assert_eq!(layout.missing_files(dir.path()).len(), 4);

		for path in ["tokenizer/tokenizer.json", "text_encoder/model.onnx", "unet/model.onnx", "vae_decoder/model.onnx"] {
			let path = dir.path().join(path);
			fs::create_dir_all(path.parent().unwrap()).unwrap();
			fs::write(path, b"").unwrap();
		}
		assert!(layout.missing_files(dir.path()).is_empty());
	}
}
