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

//! `diffusion-desk` is a desktop text-to-image app: type a prompt, press a button, and get an image generated by a
//! pretrained Stable Diffusion model running on [ONNX Runtime].
//!
//! The library half holds everything but the window, so it can be driven from tests or other front-ends:
//! ```ignore
//! use std::sync::Arc;
//!
//! use diffusion_desk::{config::AppConfig, GenerationService, OnnxLoader, OrtEnvironment, PipelineManager};
//!
//! let config = AppConfig::discover()?;
//! let environment = OrtEnvironment::builder().with_name("diffusion-desk").build()?.into_arc();
//! let manager = Arc::new(PipelineManager::new(OnnxLoader::new(&environment, &config)));
//! let service = GenerationService::new(manager, &config);
//!
//! let generated = service.generate("photo of a red fox")?;
//! println!("saved to {}", generated.path.display());
//! ```
//!
//! See [`StableDiffusionPipeline`] for more info on the Stable Diffusion pipeline.
//!
//! [ONNX Runtime]: https://onnxruntime.ai/

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

#[doc(hidden)]
pub mod clip;
pub mod config;
mod error;
pub mod export;
pub mod installer;
pub mod manager;
pub mod pipelines;
pub mod schedulers;
pub mod service;
pub mod shell;
pub(crate) mod util;

cfg_if::cfg_if! {
	if #[cfg(feature = "gui")] {
		pub mod ui;
	}
}

pub use ort::Environment as OrtEnvironment;
use ort::ExecutionProvider;

pub use self::error::{Error, Result};
pub use self::manager::{OnnxLoader, PipelineLoader, PipelineManager, PipelineState};
pub use self::pipelines::*;
pub use self::schedulers::*;
pub use self::service::{GenerationService, Generated};
pub use self::util::prompting;
use crate::config::{MemoryOptions, OffloadMode};

/// The strategy to use for extending the device memory arena.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ArenaExtendStrategy {
	/// Subsequent memory allocations extend by larger amounts (multiplied by powers of two)
	#[default]
	PowerOfTwo,
	/// Memory allocations extend only by the requested amount.
	SameAsRequested
}

impl From<ArenaExtendStrategy> for String {
	fn from(val: ArenaExtendStrategy) -> Self {
		match val {
			ArenaExtendStrategy::PowerOfTwo => "kNextPowerOfTwo".to_string(),
			ArenaExtendStrategy::SameAsRequested => "kSameAsRequested".to_string()
		}
	}
}

/// Device options for the CUDA execution provider.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct CUDADeviceOptions {
	/// The strategy to use for extending the device memory arena. See [`ArenaExtendStrategy`] for more info.
	pub arena_extend_strategy: Option<ArenaExtendStrategy>,
	/// Per-session (aka per-model) memory limit. Models may use all available VRAM if a memory limit is not set.
	/// VRAM usage may be higher than the memory limit (though typically not by much).
	pub memory_limit: Option<usize>
}

impl CUDADeviceOptions {
	/// Options honouring the CUDA memory limit of `memory`. A limited arena only grows by what is requested.
	pub fn from_memory_options(memory: &MemoryOptions) -> Self {
		Self {
			arena_extend_strategy: memory.cuda_memory_limit.map(|_| ArenaExtendStrategy::SameAsRequested),
			memory_limit: memory.cuda_memory_limit
		}
	}
}

impl From<CUDADeviceOptions> for ExecutionProvider {
	fn from(val: CUDADeviceOptions) -> Self {
		let mut ep = ExecutionProvider::cuda();
		if let Some(arena_extend_strategy) = val.arena_extend_strategy {
			ep = ep.with("arena_extend_strategy", arena_extend_strategy);
		}
		if let Some(memory_limit) = val.memory_limit {
			ep = ep.with("gpu_mem_limit", memory_limit.to_string());
		}
		ep
	}
}

/// A device on which to place a diffusion model on.
///
/// If a device is not specified, or a configured execution provider is not available, the model will be placed on the
/// CPU.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DiffusionDevice {
	/// Use the CPU as a device. **This is the default device unless another device is specified.**
	CPU,
	/// Use NVIDIA CUDA as a device. Requires an NVIDIA Kepler GPU or later.
	///
	/// First value is the device ID (which can be set to 0 in most cases). Second value is additional execution
	/// provider parameters; see [`CUDADeviceOptions`].
	CUDA(usize, Option<CUDADeviceOptions>),
	/// Custom execution provider w/ options. Other execution providers have not been tested and may not work with some
	/// models.
	Custom(ExecutionProvider)
}

impl From<DiffusionDevice> for ExecutionProvider {
	fn from(value: DiffusionDevice) -> Self {
		match value {
			DiffusionDevice::CPU => ExecutionProvider::cpu(),
			DiffusionDevice::CUDA(device, options) => {
				let options = options.unwrap_or_default();
				let ep: ExecutionProvider = options.into();
				ep.with("device_id", device.to_string())
			}
			DiffusionDevice::Custom(ep) => ep
		}
	}
}

/// Select which device each model should be placed on.
///
/// ```
/// # use diffusion_desk::{config::OffloadMode, DiffusionDevice, DiffusionDeviceControl};
/// let devices = DiffusionDeviceControl::for_offload(OffloadMode::Model, DiffusionDevice::CUDA(0, None));
/// assert!(matches!(devices.unet, DiffusionDevice::CUDA(0, None)));
/// assert!(matches!(devices.text_encoder, DiffusionDevice::CPU));
/// ```
#[derive(Debug, Clone)]
pub struct DiffusionDeviceControl {
	/// The device on which to place the Stable Diffusion variational autoencoder decoder.
	pub vae_decoder: DiffusionDevice,
	/// The device on which to place the Stable Diffusion text encoder (CLIP).
	pub text_encoder: DiffusionDevice,
	/// The device on which to place the Stable Diffusion UNet.
	pub unet: DiffusionDevice
}

impl DiffusionDeviceControl {
	/// Constructs [`DiffusionDeviceControl`] with all models on the same device.
	///
	/// Note that if you are setting `memory_limit` in [`CUDADeviceOptions`], the memory limit is **per session** (aka
	/// per model), NOT for the entire pipeline.
	pub fn all(device: DiffusionDevice) -> Self {
		Self {
			vae_decoder: device.clone(),
			text_encoder: device.clone(),
			unet: device
		}
	}

	/// Places models for `mode`. With [`OffloadMode::Model`] only the UNet goes to `accelerator`; the other modes place
	/// everything there ([`OffloadMode::Sequential`] bounds memory by loading one model at a time instead).
	pub fn for_offload(mode: OffloadMode, accelerator: DiffusionDevice) -> Self {
		match mode {
			OffloadMode::Model => Self {
				unet: accelerator,
				..Self::default()
			},
			OffloadMode::None | OffloadMode::Sequential => Self::all(accelerator)
		}
	}
}

impl Default for DiffusionDeviceControl {
	fn default() -> Self {
		DiffusionDeviceControl::all(DiffusionDevice::CPU)
	}
}
