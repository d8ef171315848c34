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

use std::{
	path::{Path, PathBuf},
	sync::{Arc, Mutex}
};

use image::{DynamicImage, RgbImage};
use ndarray::{s, Array1, Array3, Array4, ArrayD, ArrayView4, Ix3, Ix4, IxDyn};
use num_traits::ToPrimitive;
use ort::{
	tensor::{FromArray, InputTensor, OrtOwnedTensor, TensorElementDataType},
	Environment, Session, SessionBuilder
};
use rayon::prelude::*;

use super::{tiling, StableDiffusionOptions};
use crate::{
	clip::CLIPStandardTokenizer,
	config::{ModelManifest, OffloadMode, TokenizerConfig},
	schedulers::SchedulerConfig,
	DiffusionDevice
};

/// Latent scaling factor of the Stable Diffusion v1/v2 VAE.
const VAE_SCALING_FACTOR: f32 = 0.18215;
/// Ratio between image and latent resolution.
pub(crate) const VAE_SCALE: usize = 8;

fn build_session(environment: &Arc<Environment>, path: &Path, device: &DiffusionDevice) -> anyhow::Result<Session> {
	Ok(SessionBuilder::new(environment)?
		.with_execution_providers([device.clone().into()])?
		.with_model_from_file(path)?)
}

/// Whether input `index` of `session` expects 64-bit integers.
fn input_is_int64(session: &Session, index: usize) -> bool {
	session
		.inputs
		.get(index)
		.map_or(false, |input| matches!(input.input_type, TensorElementDataType::Int64))
}

/// One ONNX model of the pipeline. Resident slots keep their session for the life of the pipeline; non-resident slots
/// build it for one phase of generation and drop it afterwards.
pub(crate) struct SessionSlot {
	name: &'static str,
	path: PathBuf,
	device: DiffusionDevice,
	resident: bool,
	session: Mutex<Option<Session>>
}

impl SessionSlot {
	fn new(environment: &Arc<Environment>, name: &'static str, path: PathBuf, device: DiffusionDevice, resident: bool) -> anyhow::Result<Self> {
		anyhow::ensure!(path.is_file(), "missing {name} model at {}", path.display());
		let session = if resident {
			log::debug!("loading {name} from {} onto {device:?}", path.display());
			Some(build_session(environment, &path, &device)?)
		} else {
			None
		};
		Ok(Self {
			name,
			path,
			device,
			resident,
			session: Mutex::new(session)
		})
	}

	/// Runs `f` with this slot's session, building it first if needed.
	pub(crate) fn with<T>(&self, environment: &Arc<Environment>, f: impl FnOnce(&Session) -> anyhow::Result<T>) -> anyhow::Result<T> {
		let mut guard = self
			.session
			.lock()
			.map_err(|_| anyhow::anyhow!("{} session lock poisoned", self.name))?;
		let session = match guard.take() {
			Some(session) => session,
			None => {
				log::debug!("loading {} from {} onto {:?}", self.name, self.path.display(), self.device);
				build_session(environment, &self.path, &self.device)?
			}
		};
		let result = f(&session);
		if self.resident {
			*guard = Some(session);
		}
		result
	}

	/// Drops the session unless this slot is resident.
	pub(crate) fn release(&self) {
		if self.resident {
			return;
		}
		if let Ok(mut guard) = self.session.lock() {
			if guard.take().is_some() {
				log::debug!("released {} session", self.name);
			}
		}
	}
}

/// A [Stable Diffusion](https://github.com/CompVis/stable-diffusion) text-to-image pipeline running on ONNX Runtime.
///
/// The model root holds an ONNX export described by `diffusers.json` (see [`ModelManifest`]) or laid out the way
/// `optimum.exporters.onnx` writes it.
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// use diffusion_desk::{ImagePipeline, OrtEnvironment, Prompt, StableDiffusionOptions, StableDiffusionPipeline, Txt2ImgOptions};
///
/// let environment = OrtEnvironment::builder().with_name("diffusion-desk").build()?.into_arc();
/// let pipeline = StableDiffusionPipeline::new(&environment, "./stable-diffusion-v1-5/", StableDiffusionOptions::default())?;
///
/// let image = pipeline.txt2img(&Prompt::new("photo of a red fox")?, &Txt2ImgOptions::default())?;
/// image.save("result.png")?;
/// # Ok(())
/// # }
/// ```
pub struct StableDiffusionPipeline {
	pub(crate) environment: Arc<Environment>,
	pub(crate) options: StableDiffusionOptions,
	pub(crate) scheduler_config: SchedulerConfig,
	tokenizer: CLIPStandardTokenizer,
	text_encoder: SessionSlot,
	pub(crate) unet: SessionSlot,
	vae_decoder: SessionSlot
}

impl StableDiffusionPipeline {
	/// Creates a new Stable Diffusion pipeline, loading models from `root`.
	///
	/// With [`OffloadMode::Sequential`] the model files are only checked for existence here and are loaded when a
	/// generation needs them.
	pub fn new(environment: &Arc<Environment>, root: impl Into<PathBuf>, options: StableDiffusionOptions) -> anyhow::Result<Self> {
		let root: PathBuf = root.into();
		let layout = ModelManifest::load(&root)?;
		let missing = layout.missing_files(&root);
		if !missing.is_empty() {
			let missing: Vec<String> = missing.iter().map(|path| path.display().to_string()).collect();
			anyhow::bail!("{} is not a complete ONNX export; missing {}", root.display(), missing.join(", "));
		}

		let tokenizer = match &layout.tokenizer {
			TokenizerConfig::CLIPTokenizer {
				path,
				model_max_length,
				bos_token,
				eos_token
			} => CLIPStandardTokenizer::new(root.join(path), *model_max_length, *bos_token, *eos_token)?,
			#[allow(unreachable_patterns)]
			_ => anyhow::bail!("not a clip tokenizer")
		};

		let scheduler_config = match &layout.scheduler {
			Some(scheduler) if root.join(&scheduler.path).is_file() => SchedulerConfig::from_file(root.join(&scheduler.path)).unwrap_or_else(|e| {
				log::warn!("ignoring unsupported scheduler config {}: {e:#}", scheduler.path);
				SchedulerConfig::default()
			}),
			_ => SchedulerConfig::default()
		};

		let resident = options.memory.offload != OffloadMode::Sequential;
		let devices = &options.devices;
		let text_encoder = SessionSlot::new(environment, "text encoder", root.join(&layout.text_encoder.path), devices.text_encoder.clone(), resident)?;
		let unet = SessionSlot::new(environment, "unet", root.join(&layout.unet.path), devices.unet.clone(), resident)?;
		let vae_decoder = SessionSlot::new(environment, "vae decoder", root.join(&layout.vae.decoder), devices.vae_decoder.clone(), resident)?;

		Ok(Self {
			environment: Arc::clone(environment),
			options,
			scheduler_config,
			tokenizer,
			text_encoder,
			unet,
			vae_decoder
		})
	}

	/// Drops every session that is not resident.
	pub fn release_sessions(&self) {
		self.text_encoder.release();
		self.unet.release();
		self.vae_decoder.release();
	}

	/// Encodes the prompt into text embeddings to be used as input to the UNet. When `do_classifier_free_guidance` is
	/// set, also returns the embeddings of the negative prompt (or of the empty prompt).
	pub fn encode_prompt(&self, prompt: &str, negative_prompt: Option<&str>, do_classifier_free_guidance: bool) -> anyhow::Result<(Array3<f32>, Option<Array3<f32>>)> {
		self.text_encoder.with(&self.environment, |text_encoder| {
			let cond = self.run_text_encoder(text_encoder, prompt)?;
			let uncond = if do_classifier_free_guidance {
				Some(self.run_text_encoder(text_encoder, negative_prompt.unwrap_or(""))?)
			} else {
				None
			};
			Ok((cond, uncond))
		})
	}

	fn run_text_encoder(&self, text_encoder: &Session, text: &str) -> anyhow::Result<Array3<f32>> {
		let ids = self.tokenizer.encode_for_text_model(text)?;
		let input = if input_is_int64(text_encoder, 0) {
			InputTensor::from_array(ids.into_dyn())
		} else {
			InputTensor::from_array(ids.mapv(|id| id as i32).into_dyn())
		};
		let outputs = text_encoder.run(vec![input])?;
		let embeddings: OrtOwnedTensor<'_, f32, IxDyn> = outputs[0].try_extract()?;
		Ok(embeddings.view().to_owned().into_dimensionality::<Ix3>()?)
	}

	/// Runs one UNet evaluation and returns the predicted noise for `latents`.
	pub(crate) fn predict_noise(&self, unet: &Session, latents: Array4<f32>, timestep: f32, encoder_hidden_states: &Array3<f32>) -> anyhow::Result<Array4<f32>> {
		let timestep_input = if input_is_int64(unet, 1) {
			let timestep = timestep
				.round()
				.to_i64()
				.ok_or_else(|| anyhow::anyhow!("timestep {timestep} is not representable as an integer"))?;
			InputTensor::from_array(Array1::from_elem(1, timestep).into_dyn())
		} else {
			InputTensor::from_array(Array1::from_elem(1, timestep).into_dyn())
		};
		let latent_input: ArrayD<f32> = latents.into_dyn();
		let hidden_states: ArrayD<f32> = encoder_hidden_states.clone().into_dyn();

		let noise_pred = unet.run(vec![InputTensor::from_array(latent_input), timestep_input, InputTensor::from_array(hidden_states)])?;
		let noise_pred: OrtOwnedTensor<'_, f32, IxDyn> = noise_pred[0].try_extract()?;
		Ok(noise_pred.view().to_owned().into_dimensionality::<Ix4>()?)
	}

	fn run_vae_decoder(vae_decoder: &Session, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let image = vae_decoder.run(vec![InputTensor::from_array(latents.to_owned().into_dyn())])?;
		let image: OrtOwnedTensor<'_, f32, IxDyn> = image[0].try_extract()?;
		Ok(image.view().to_owned().into_dimensionality::<Ix4>()?)
	}

	/// Decodes UNet latents via the variational autoencoder, tiling the decode when VAE tiling is enabled.
	pub fn decode_latents(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<DynamicImage> {
		let latents = &latents / VAE_SCALING_FACTOR;
		let memory = &self.options.memory;
		let decoded = self.vae_decoder.with(&self.environment, |vae_decoder| {
			if memory.vae_tiling {
				tiling::decode_tiled(latents.view(), memory.tile_size, memory.tile_overlap, VAE_SCALE, |tile| Self::run_vae_decoder(vae_decoder, tile))
			} else {
				Self::run_vae_decoder(vae_decoder, latents.view())
			}
		})?;
		to_image(decoded.view())
	}
}

/// Converts the first decoded image of a `[batch, 3, height, width]` array in `[-1, 1]` into an RGB8 image.
pub(crate) fn to_image(decoded: ArrayView4<'_, f32>) -> anyhow::Result<DynamicImage> {
	let (_, channels, height, width) = decoded.dim();
	anyhow::ensure!(channels == 3, "expected 3 image channels from the VAE, got {channels}");
	let pixels = decoded.slice(s![0, .., .., ..]).permuted_axes([1, 2, 0]);
	let pixels = pixels.as_standard_layout();
	let pixels: Vec<u8> = pixels
		.as_slice()
		.ok_or_else(|| anyhow::anyhow!("image buffer is not contiguous"))?
		.par_iter()
		.map(|value| ((value / 2.0 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8)
		.collect();
	let image = RgbImage::from_raw(width as u32, height as u32, pixels).ok_or_else(|| anyhow::anyhow!("failed to construct image"))?;
	Ok(DynamicImage::ImageRgb8(image))
}

#[cfg(test)]
mod tests {
	use ndarray::Array4;

	use super::to_image;

	#[test]
	fn to_image_maps_unit_range_to_bytes() {
		let mut decoded = Array4::<f32>::zeros((1, 3, 2, 4));
		decoded[[0, 0, 0, 0]] = -1.0;
		decoded[[0, 1, 0, 0]] = 1.0;
		decoded[[0, 2, 0, 0]] = 3.0;
		decoded[[0, 0, 1, 3]] = 1.0;

		let image = to_image(decoded.view()).unwrap().into_rgb8();
		assert_eq!(image.dimensions(), (4, 2));
		assert_eq!(image.get_pixel(0, 0).0, [0, 255, 255]);
		assert_eq!(image.get_pixel(3, 1).0, [255, 128, 128]);
		assert_eq!(image.get_pixel(1, 0).0, [128, 128, 128]);
	}
}
