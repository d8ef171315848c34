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

//! Lazy, load-once ownership of the generation pipeline.

use std::{
	panic::{self, AssertUnwindSafe},
	sync::{Arc, Condvar, Mutex, MutexGuard}
};

use crate::{
	config::AppConfig,
	export::{ModelLocator, OptimumExporter},
	installer::{AcceleratorProbe, NvidiaSmi},
	util::panic_message,
	CUDADeviceOptions, DiffusionDevice, DiffusionDeviceControl, ImagePipeline, OrtEnvironment, StableDiffusionOptions, StableDiffusionPipeline
};

/// Constructs the pipeline a [`PipelineManager`] owns.
pub trait PipelineLoader: Send + Sync {
	/// The pipeline this loader produces.
	type Pipeline: ImagePipeline + 'static;

	/// Identifier of the model being loaded, used in error messages.
	fn model(&self) -> String;

	/// Builds the pipeline. Called at most once per manager.
	fn load(&self) -> anyhow::Result<Self::Pipeline>;
}

/// Lifecycle of the managed pipeline. There is no transition out of `Loaded` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
	/// Nothing has requested the pipeline yet.
	Unloaded,
	/// A caller is constructing the pipeline.
	Loading,
	/// The pipeline is ready.
	Loaded,
	/// Construction failed with this message; the manager will not retry.
	Failed(String)
}

enum Slot<P> {
	Unloaded,
	Loading,
	Loaded(Arc<P>),
	Failed { model: String, message: String }
}

/// Owns at most one pipeline, constructing it on first use.
///
/// Concurrent callers of [`PipelineManager::load`] wait for a single construction and all observe its outcome.
pub struct PipelineManager<L: PipelineLoader> {
	loader: L,
	slot: Mutex<Slot<L::Pipeline>>,
	ready: Condvar
}

impl<L: PipelineLoader> PipelineManager<L> {
	/// Creates an unloaded manager.
	pub fn new(loader: L) -> Self {
		Self {
			loader,
			slot: Mutex::new(Slot::Unloaded),
			ready: Condvar::new()
		}
	}

	fn lock(&self) -> MutexGuard<'_, Slot<L::Pipeline>> {
		// the slot is only ever replaced wholesale, so a poisoned guard still holds a consistent value
		self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Returns the pipeline, constructing it if this is the first call. Returns the same handle on every successful
	/// call; a failed construction is returned again without retrying.
	pub fn load(&self) -> crate::Result<Arc<L::Pipeline>> {
		let mut slot = self.lock();
		loop {
			match &*slot {
				Slot::Loaded(pipeline) => return Ok(Arc::clone(pipeline)),
				Slot::Failed { model, message } => {
					return Err(crate::Error::ModelLoad {
						model: model.clone(),
						message: message.clone()
					});
				}
				Slot::Loading => {
					slot = self.ready.wait(slot).unwrap_or_else(|poisoned| poisoned.into_inner());
				}
				Slot::Unloaded => break
			}
		}
		*slot = Slot::Loading;
		drop(slot);

		let model = self.loader.model();
		log::info!("loading model {model}");
		// the slot has to leave `Loading` even if the loader unwinds
		let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.loader.load()))
			.unwrap_or_else(|payload| Err(anyhow::anyhow!("model loader panicked: {}", panic_message(&*payload))));

		let mut slot = self.lock();
		let result = match outcome {
			Ok(pipeline) => {
				log::info!("model {model} loaded");
				let pipeline = Arc::new(pipeline);
				*slot = Slot::Loaded(Arc::clone(&pipeline));
				Ok(pipeline)
			}
			Err(err) => {
				let message = format!("{err:#}");
				log::error!("failed to load model {model}: {message}");
				*slot = Slot::Failed {
					model: model.clone(),
					message: message.clone()
				};
				Err(crate::Error::ModelLoad { model, message })
			}
		};
		self.ready.notify_all();
		result
	}

	/// Whether the pipeline has been constructed.
	pub fn is_loaded(&self) -> bool {
		matches!(*self.lock(), Slot::Loaded(_))
	}

	/// The current lifecycle state.
	pub fn state(&self) -> PipelineState {
		match &*self.lock() {
			Slot::Unloaded => PipelineState::Unloaded,
			Slot::Loading => PipelineState::Loading,
			Slot::Loaded(_) => PipelineState::Loaded,
			Slot::Failed { message, .. } => PipelineState::Failed(message.clone())
		}
	}
}

/// Loads a [`StableDiffusionPipeline`] for the configured model, exporting it to ONNX first if needed.
pub struct OnnxLoader {
	environment: Arc<OrtEnvironment>,
	config: AppConfig,
	locator: ModelLocator<OptimumExporter>,
	accelerator: NvidiaSmi
}

impl OnnxLoader {
	/// A loader for `config`'s model.
	pub fn new(environment: &Arc<OrtEnvironment>, config: &AppConfig) -> Self {
		Self {
			environment: Arc::clone(environment),
			config: config.clone(),
			locator: ModelLocator::new(config.cache_dir(), OptimumExporter::new(config.python.clone())),
			accelerator: NvidiaSmi::new(config.gpu_probe.clone())
		}
	}

	fn options(&self) -> StableDiffusionOptions {
		let memory = self.config.memory.clone();
		let accelerator = if cfg!(feature = "ort-cuda") && self.accelerator.cuda_available() {
			DiffusionDevice::CUDA(0, Some(CUDADeviceOptions::from_memory_options(&memory)))
		} else {
			DiffusionDevice::CPU
		};
		log::info!("placing models with {:?} offload on {accelerator:?}", memory.offload);
		StableDiffusionOptions {
			devices: DiffusionDeviceControl::for_offload(memory.offload, accelerator),
			memory
		}
	}
}

impl PipelineLoader for OnnxLoader {
	type Pipeline = StableDiffusionPipeline;

	fn model(&self) -> String {
		self.config.model.id.clone()
	}

	fn load(&self) -> anyhow::Result<StableDiffusionPipeline> {
		let root = self.locator.resolve(&self.config.model)?;
		StableDiffusionPipeline::new(&self.environment, root, self.options())
	}
}
