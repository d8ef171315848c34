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

#![allow(dead_code)]

use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc
	},
	thread,
	time::Duration
};

use diffusion_desk::{ImagePipeline, PipelineLoader, Prompt, Txt2ImgOptions};
use image::{DynamicImage, Rgb, RgbImage};

/// Paints a solid image whose colour depends on the seed; counts generations and releases.
#[derive(Default)]
pub struct FakePipeline {
	pub generations: AtomicUsize,
	pub releases: AtomicUsize,
	pub fail: bool,
	pub panic: bool
}

impl ImagePipeline for FakePipeline {
	fn txt2img(&self, _prompt: &Prompt, options: &Txt2ImgOptions) -> anyhow::Result<DynamicImage> {
		self.generations.fetch_add(1, Ordering::SeqCst);
		if self.fail {
			anyhow::bail!("out of memory");
		}
		assert!(!self.panic, "latent shape mismatch");
		let shade = (options.seed.unwrap_or_default() % 256) as u8;
		Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(options.width, options.height, Rgb([shade, 0, 255 - shade]))))
	}

	fn release_transient(&self) {
		self.releases.fetch_add(1, Ordering::SeqCst);
	}
}

#[derive(Clone, Default)]
pub struct FakeLoader {
	pub loads: Arc<AtomicUsize>,
	pub fail_load: bool,
	pub fail_generation: bool,
	pub panic_load: bool,
	pub panic_generation: bool,
	pub delay: Duration
}

impl PipelineLoader for FakeLoader {
	type Pipeline = FakePipeline;

	fn model(&self) -> String {
		"test/model".to_string()
	}

	fn load(&self) -> anyhow::Result<FakePipeline> {
		self.loads.fetch_add(1, Ordering::SeqCst);
		thread::sleep(self.delay);
		assert!(!self.panic_load, "failed to initialize the runtime");
		if self.fail_load {
			anyhow::bail!("unet/model.onnx is missing");
		}
		Ok(FakePipeline {
			fail: self.fail_generation,
			panic: self.panic_generation,
			..Default::default()
		})
	}
}

impl FakeLoader {
	pub fn loads(&self) -> usize {
		self.loads.load(Ordering::SeqCst)
	}
}
