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

mod impl_main;
mod impl_txt2img;
pub(crate) mod tiling;

pub use self::impl_main::StableDiffusionPipeline;
use crate::{config::MemoryOptions, schedulers::SchedulerKind, DiffusionDeviceControl};

/// Options for the Stable Diffusion pipeline: where each model is placed and which memory-saving strategies apply.
#[derive(Default, Debug, Clone)]
pub struct StableDiffusionOptions {
	/// A [`DiffusionDeviceControl`] object, mapping what device to place each model on.
	pub devices: DiffusionDeviceControl,
	/// Attention slicing, VAE tiling and offload settings.
	pub memory: MemoryOptions
}

/// Options for a single text-to-image generation. Build with the `with_*` methods.
///
/// ```
/// # use diffusion_desk::Txt2ImgOptions;
/// let options = Txt2ImgOptions::default().with_steps(20).with_size(515, 770).with_seed(42);
/// assert_eq!((options.width, options.height), (512, 768));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Txt2ImgOptions {
	/// The height of the image. **Must be divisible by 8.**
	pub height: u32,
	/// The width of the image. **Must be divisible by 8.**
	pub width: u32,
	/// Classifier-free guidance scale; values `<= 1.0` disable guidance.
	pub guidance_scale: f32,
	/// The number of denoising steps.
	pub steps: usize,
	/// Seed for the initial noise. A random seed is drawn per run when `None`.
	pub seed: Option<u64>,
	/// What the image should not contain.
	pub negative_prompt: Option<String>,
	/// The scheduler driving the denoising loop.
	pub scheduler: SchedulerKind
}
