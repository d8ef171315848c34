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

use image::DynamicImage;
use ndarray::{concatenate, s, Array4, Axis};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::impl_main::VAE_SCALE;
use crate::{schedulers::SchedulerKind, StableDiffusionPipeline, Txt2ImgOptions};

impl Default for Txt2ImgOptions {
	fn default() -> Self {
		Self {
			height: 512,
			width: 512,
			guidance_scale: 7.5,
			steps: 30,
			seed: None,
			negative_prompt: None,
			scheduler: SchedulerKind::default()
		}
	}
}

// builder for options
impl Txt2ImgOptions {
	/// Set the size of the image. **Size will be rounded down to a multiple of 8.**
	pub fn with_size(self, width: u32, height: u32) -> Self {
		self.with_width(width).with_height(height)
	}
	/// Set the width of the image. **Width will be rounded down to a multiple of 8.**
	#[inline]
	pub fn with_width(mut self, width: u32) -> Self {
		self.width = (width / 8).max(1) * 8;
		self
	}
	/// Set the height of the image. **Height will be rounded down to a multiple of 8.**
	#[inline]
	pub fn with_height(mut self, height: u32) -> Self {
		self.height = (height / 8).max(1) * 8;
		self
	}
	/// The number of steps to take to generate the image. More steps typically yields higher quality images.
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = steps;
		self
	}
	/// Set the negative prompt.
	pub fn with_negative_prompt(mut self, negative_prompt: Option<String>) -> Self {
		self.negative_prompt = negative_prompt;
		self
	}
	/// Set the seed to use when first generating noise.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}
	/// Use a random seed, so that each run generates a different image.
	pub fn with_random_seed(mut self) -> Self {
		self.seed = None;
		self
	}
	/// The 'guidance scale' for classifier-free guidance. A lower guidance scale gives the model more freedom, but the
	/// output may not match the prompt. A higher guidance scale mean the model will match the prompt more strictly,
	/// but may introduce artifacts; `7.5` is a good balance.
	pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
		self.guidance_scale = guidance_scale;
		self
	}
	/// Set the scheduler.
	pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
		self.scheduler = scheduler;
		self
	}
}

impl Txt2ImgOptions {
	/// Generates an image from a text prompt.
	///
	/// Prompts are passed as-is; callers going through [`crate::GenerationService`] get them validated and cleaned up
	/// first.
	pub fn run(&self, pipeline: &StableDiffusionPipeline, prompt: &str) -> anyhow::Result<DynamicImage> {
		let steps = self.steps;
		anyhow::ensure!(steps > 0, "at least one denoising step is required");
		if self.height % 8 != 0 || self.width % 8 != 0 {
			anyhow::bail!("`width` ({}) and `height` ({}) must be divisible by 8 for Stable Diffusion", self.width, self.height);
		}

		let seed = self.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>());
		let mut rng = StdRng::seed_from_u64(seed);

		let do_classifier_free_guidance = self.guidance_scale > 1.0;
		let (cond_embeddings, uncond_embeddings) = pipeline.encode_prompt(prompt, self.negative_prompt.as_deref(), do_classifier_free_guidance)?;

		let mut scheduler = self.scheduler.build(&pipeline.scheduler_config)?;
		scheduler.set_timesteps(steps);

		let latents_shape = (1_usize, 4_usize, self.height as usize / VAE_SCALE, self.width as usize / VAE_SCALE);
		let mut latents = Array4::<f32>::random_using(latents_shape, StandardNormal, &mut rng) * scheduler.init_noise_sigma();

		let attention_slicing = pipeline.options.memory.attention_slicing;
		let guidance_scale = self.guidance_scale;
		let batched_embeddings = match &uncond_embeddings {
			Some(uncond) if !attention_slicing => Some(concatenate(Axis(0), &[uncond.view(), cond_embeddings.view()])?),
			_ => None
		};

		let timesteps = scheduler.timesteps().to_owned();
		log::debug!("denoising {}x{} over {} steps with seed {seed}", self.width, self.height, timesteps.len());
		latents = pipeline.unet.with(&pipeline.environment, |unet| {
			for (step_index, &timestep) in timesteps.iter().enumerate() {
				let latent_model_input = scheduler.scale_model_input(latents.view(), step_index);
				let noise_pred = match (&uncond_embeddings, &batched_embeddings) {
					(_, Some(embeddings)) => {
						let input = concatenate(Axis(0), &[latent_model_input.view(), latent_model_input.view()])?;
						let noise_pred = pipeline.predict_noise(unet, input, timestep, embeddings)?;
						let noise_pred_uncond = noise_pred.slice(s![0..1, .., .., ..]);
						let noise_pred_text = noise_pred.slice(s![1..2, .., .., ..]);
						guide(noise_pred_uncond.to_owned(), noise_pred_text.to_owned(), guidance_scale)
					}
					(Some(uncond), None) => {
						let noise_pred_uncond = pipeline.predict_noise(unet, latent_model_input.clone(), timestep, uncond)?;
						let noise_pred_text = pipeline.predict_noise(unet, latent_model_input, timestep, &cond_embeddings)?;
						guide(noise_pred_uncond, noise_pred_text, guidance_scale)
					}
					(None, None) => pipeline.predict_noise(unet, latent_model_input, timestep, &cond_embeddings)?
				};

				latents = scheduler.step(noise_pred.view(), step_index, latents.view(), &mut rng)?.into_prev_sample();
			}
			Ok(latents)
		})?;

		pipeline.decode_latents(latents.view())
	}
}

/// Classifier-free guidance: pushes the conditional prediction away from the unconditional one.
fn guide(noise_pred_uncond: Array4<f32>, noise_pred_text: Array4<f32>, guidance_scale: f32) -> Array4<f32> {
	&noise_pred_uncond + &((noise_pred_text - &noise_pred_uncond) * guidance_scale)
}

#[cfg(test)]
mod tests {
	use ndarray::Array4;

	use super::guide;
	use crate::{schedulers::SchedulerKind, Txt2ImgOptions};

	#[test]
	fn sizes_round_down_to_multiples_of_eight() {
		let options = Txt2ImgOptions::default().with_size(517, 3);
		assert_eq!((options.width, options.height), (512, 8));
	}

	#[test]
	fn builders_set_fields() {
		let options = Txt2ImgOptions::default()
			.with_steps(12)
			.with_guidance_scale(1.0)
			.with_seed(7)
			.with_negative_prompt(Some("blurry".to_string()))
			.with_scheduler(SchedulerKind::EulerAncestral);
		assert_eq!(options.steps, 12);
		assert_eq!(options.seed, Some(7));
		assert_eq!(options.negative_prompt.as_deref(), Some("blurry"));
		assert_eq!(options.scheduler, SchedulerKind::EulerAncestral);
		assert_eq!(options.with_random_seed().seed, None);
	}

	#[test]
	fn guidance_extrapolates_from_unconditional() {
		let uncond = Array4::<f32>::from_elem((1, 4, 2, 2), 1.0);
		let cond = Array4::<f32>::from_elem((1, 4, 2, 2), 2.0);
		let guided = guide(uncond, cond, 7.5);
		assert!(guided.iter().all(|v| (v - 8.5).abs() < 1e-6));
	}
}
