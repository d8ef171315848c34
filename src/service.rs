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

//! Prompt-to-file image generation on top of a [`PipelineManager`].

use std::{
	fs,
	panic::{self, AssertUnwindSafe},
	path::{Path, PathBuf},
	sync::{Arc, Mutex},
	time::{Duration, Instant}
};

use image::{DynamicImage, ImageFormat};
use rand::Rng;

use crate::{config::AppConfig, util::panic_message, ImagePipeline, PipelineLoader, PipelineManager, Prompt, Txt2ImgOptions};

/// A generated image and where it was saved.
#[derive(Debug, Clone)]
pub struct Generated {
	/// The image, as 8-bit RGB.
	pub image: DynamicImage,
	/// The PNG file the image was written to.
	pub path: PathBuf,
	/// Seed of the initial noise; generating again with it reproduces the image.
	pub seed: u64,
	/// Wall time of the whole request, including a model load if one was needed.
	pub elapsed: Duration
}

/// Turns prompts into saved images. One generation runs at a time; concurrent callers queue up.
pub struct GenerationService<L: PipelineLoader> {
	manager: Arc<PipelineManager<L>>,
	options: Txt2ImgOptions,
	output_path: PathBuf,
	gate: Mutex<()>
}

impl<L: PipelineLoader> GenerationService<L> {
	/// A service generating with `config`'s defaults and writing to its output path.
	pub fn new(manager: Arc<PipelineManager<L>>, config: &AppConfig) -> Self {
		Self::with_options(manager, config.generation.to_options(), config.output_path.clone())
	}

	/// A service generating with `options`, writing to `output_path`.
	pub fn with_options(manager: Arc<PipelineManager<L>>, options: Txt2ImgOptions, output_path: impl Into<PathBuf>) -> Self {
		Self {
			manager,
			options,
			output_path: output_path.into(),
			gate: Mutex::new(())
		}
	}

	/// Whether the model is ready, i.e. whether the next request skips loading.
	pub fn is_loaded(&self) -> bool {
		self.manager.is_loaded()
	}

	/// The manager this service generates with.
	pub fn manager(&self) -> &Arc<PipelineManager<L>> {
		&self.manager
	}

	/// Generates an image for `prompt` and writes it to the configured output path, replacing any previous image.
	pub fn generate(&self, prompt: impl AsRef<str>) -> crate::Result<Generated> {
		self.generate_to(prompt, &self.output_path)
	}

	/// Generates an image for `prompt` and writes it to `path` as PNG.
	///
	/// Empty prompts are rejected before the model is touched. The model is loaded on first use.
	pub fn generate_to(&self, prompt: impl AsRef<str>, path: impl AsRef<Path>) -> crate::Result<Generated> {
		let prompt = Prompt::new(prompt)?;
		let path = path.as_ref();

		let _gate = self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		let start = Instant::now();
		let pipeline = self.manager.load()?;

		let seed = self.options.seed.unwrap_or_else(|| rand::thread_rng().gen());
		let options = self.options.clone().with_seed(seed);
		log::info!("generating \"{prompt}\" ({} steps, seed {seed})", options.steps);
		let outcome = panic::catch_unwind(AssertUnwindSafe(|| pipeline.txt2img(&prompt, &options)))
			.unwrap_or_else(|payload| Err(anyhow::anyhow!("pipeline panicked: {}", panic_message(&*payload))));
		pipeline.release_transient();
		let image = DynamicImage::ImageRgb8(outcome.map_err(|e| crate::Error::Inference(format!("{e:#}")))?.into_rgb8());

		if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
			fs::create_dir_all(parent)?;
		}
		image
			.save_with_format(path, ImageFormat::Png)
			.map_err(|source| crate::Error::Output { path: path.to_path_buf(), source })?;

		let elapsed = start.elapsed();
		log::info!("saved {} in {:.1}s", path.display(), elapsed.as_secs_f32());
		Ok(Generated {
			image,
			path: path.to_path_buf(),
			seed,
			elapsed
		})
	}
}
