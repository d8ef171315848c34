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

//! The schedule functions, denoted Schedulers in the library take in the output of a trained model, a sample which the
//! diffusion process is iterating on, and a timestep to return a denoised sample.
//!
//! Only inference is supported: a scheduler defines how to update a sample based on an output from a pretrained model.

use std::{fs, path::Path};

use ndarray::{s, Array1, Array4, ArrayBase, ArrayView1, ArrayView4};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::util::interpolation::interp;

mod euler_ancestral_discrete;
mod euler_discrete;

pub use self::euler_ancestral_discrete::EulerAncestralDiscreteScheduler;
pub use self::euler_discrete::EulerDiscreteScheduler;

/// A mapping from a beta range to a sequence of betas for stepping the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
	/// Linear beta schedule.
	Linear,
	/// Scaled linear beta schedule, used by Stable Diffusion.
	ScaledLinear
}

/// What the denoising model predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
	/// The model predicts the noise added to the sample.
	#[default]
	Epsilon,
	/// The model predicts the velocity (Stable Diffusion 2.x at 768px).
	VPrediction
}

/// The subset of a diffusers `scheduler_config.json` the schedulers need. Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
	/// Number of diffusion steps the model was trained with.
	pub num_train_timesteps: usize,
	/// Beta at the first training step.
	pub beta_start: f32,
	/// Beta at the last training step.
	pub beta_end: f32,
	/// How betas are spaced between `beta_start` and `beta_end`.
	pub beta_schedule: BetaSchedule,
	/// What the model's output represents.
	pub prediction_type: PredictionType
}

/// Stable Diffusion v1 training parameters.
impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			num_train_timesteps: 1000,
			beta_start: 0.00085,
			beta_end: 0.012,
			beta_schedule: BetaSchedule::ScaledLinear,
			prediction_type: PredictionType::Epsilon
		}
	}
}

impl SchedulerConfig {
	/// Reads a diffusers `scheduler_config.json`.
	pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
		Ok(serde_json::from_slice(&fs::read(path.as_ref())?)?)
	}
}

/// Which scheduler drives the denoising loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
	/// [`EulerDiscreteScheduler`]
	#[default]
	Euler,
	/// [`EulerAncestralDiscreteScheduler`]
	EulerAncestral
}

impl SchedulerKind {
	/// Creates a fresh scheduler of this kind.
	pub fn build(self, config: &SchedulerConfig) -> anyhow::Result<Box<dyn DiffusionScheduler>> {
		Ok(match self {
			SchedulerKind::Euler => Box::new(EulerDiscreteScheduler::new(config)?),
			SchedulerKind::EulerAncestral => Box::new(EulerAncestralDiscreteScheduler::new(config)?)
		})
	}
}

/// The output returned by a scheduler's `step` function.
pub struct SchedulerStepOutput {
	pub(crate) prev_sample: Array4<f32>,
	pub(crate) pred_original_sample: Option<Array4<f32>>
}

impl SchedulerStepOutput {
	/// Computed sample (`x_{t-1}`) of the previous timestep. `prev_sample` should be used as the next model input in
	/// the denoising loop.
	pub fn prev_sample(&self) -> ArrayView4<'_, f32> {
		self.prev_sample.view()
	}

	/// The predicted denoised sample (`x_{0}`) based on the model output from the current timestep.
	pub fn pred_original_sample(&self) -> Option<ArrayView4<'_, f32>> {
		self.pred_original_sample.as_ref().map(ArrayBase::view)
	}

	/// Consumes the output, returning `prev_sample`.
	pub fn into_prev_sample(self) -> Array4<f32> {
		self.prev_sample
	}
}

/// A scheduler to be used in diffusion pipelines. Steps are addressed by their index into [`Self::timesteps`].
pub trait DiffusionScheduler: Send {
	/// Sets the number of inference steps. This must be called before `step` to compute the sigmas and timesteps.
	fn set_timesteps(&mut self, num_inference_steps: usize);

	/// Returns the computed scheduler timesteps, in the order they are stepped through.
	fn timesteps(&self) -> ArrayView1<'_, f32>;

	/// Returns the standard deviation of the initial noise distribution.
	fn init_noise_sigma(&self) -> f32;

	/// Scales the denoising model input to match the Euler algorithm.
	fn scale_model_input(&self, sample: ArrayView4<'_, f32>, step_index: usize) -> Array4<f32>;

	/// Predict the sample at the previous timestep by reversing the SDE.
	fn step(&mut self, model_output: ArrayView4<'_, f32>, step_index: usize, sample: ArrayView4<'_, f32>, rng: &mut StdRng)
	-> anyhow::Result<SchedulerStepOutput>;
}

/// Noise levels shared by the Karras-style Euler samplers.
#[derive(Debug, Clone)]
pub(crate) struct KarrasSigmas {
	train_sigmas: Array1<f32>,
	pub(crate) timesteps: Array1<f32>,
	pub(crate) sigmas: Array1<f32>,
	pub(crate) prediction_type: PredictionType
}

impl KarrasSigmas {
	pub(crate) fn new(config: &SchedulerConfig) -> anyhow::Result<Self> {
		let SchedulerConfig {
			num_train_timesteps,
			beta_start,
			beta_end,
			beta_schedule,
			prediction_type
		} = *config;
		if num_train_timesteps < 2 {
			anyhow::bail!("num_train_timesteps ({num_train_timesteps}) must be >1");
		}
		if !beta_start.is_normal() || !beta_end.is_normal() {
			anyhow::bail!("beta_start ({beta_start}) and beta_end ({beta_end}) must be normal (not zero, infinite, NaN, or subnormal)");
		}
		if beta_start >= beta_end {
			anyhow::bail!("beta_start must be < beta_end");
		}

		let betas = match beta_schedule {
			BetaSchedule::Linear => Array1::linspace(beta_start, beta_end, num_train_timesteps),
			BetaSchedule::ScaledLinear => {
				let mut betas = Array1::linspace(beta_start.sqrt(), beta_end.sqrt(), num_train_timesteps);
				betas.par_map_inplace(|f| *f = f.powi(2));
				betas
			}
		};

		let alphas = 1.0 - betas;
		let mut train_sigmas = alphas
			.iter()
			.scan(1.0, |prod, alpha| {
				*prod *= *alpha;
				Some(*prod)
			})
			.collect::<Array1<f32>>();
		train_sigmas.par_map_inplace(|f| {
			*f = ((1.0 - *f) / *f).sqrt();
		});

		let mut this = Self {
			train_sigmas,
			timesteps: Array1::zeros(0),
			sigmas: Array1::zeros(0),
			prediction_type
		};
		this.set_timesteps(num_train_timesteps);
		Ok(this)
	}

	pub(crate) fn set_timesteps(&mut self, num_inference_steps: usize) {
		let num_train_timesteps = self.train_sigmas.len();
		let timesteps = Array1::linspace(0.0_f32, (num_train_timesteps - 1) as f32, num_inference_steps.max(1))
			.slice(s![..;-1])
			.to_owned();

		let sigmas_xp = Array1::range(0.0, num_train_timesteps as f32, 1.0);
		let mut sigmas = Array1::zeros((timesteps.len() + 1,));
		for (i, t) in timesteps.iter().enumerate() {
			sigmas[i] = interp(*t, sigmas_xp.view(), self.train_sigmas.view());
		}

		self.sigmas = sigmas;
		self.timesteps = timesteps;
	}

	pub(crate) fn init_noise_sigma(&self) -> f32 {
		self.sigmas.iter().copied().fold(0.0, f32::max)
	}

	pub(crate) fn sigma_pair(&self, step_index: usize) -> anyhow::Result<(f32, f32)> {
		match (self.sigmas.get(step_index), self.sigmas.get(step_index + 1)) {
			(Some(from), Some(to)) => Ok((*from, *to)),
			_ => anyhow::bail!("step index {step_index} is out of this scheduler's {} steps", self.timesteps.len())
		}
	}

	pub(crate) fn scale_model_input(&self, sample: ArrayView4<'_, f32>, step_index: usize) -> Array4<f32> {
		let sigma = self.sigmas.get(step_index).copied().unwrap_or(0.0);
		sample.to_owned() / (sigma.powi(2) + 1.0).sqrt()
	}

	/// Denoised estimate `x_0` from the model output at noise level `sigma`.
	pub(crate) fn pred_original_sample(&self, model_output: ArrayView4<'_, f32>, sample: ArrayView4<'_, f32>, sigma: f32) -> Array4<f32> {
		match self.prediction_type {
			PredictionType::Epsilon => &sample - &(sigma * &model_output),
			PredictionType::VPrediction => {
				let c = sigma.powi(2) + 1.0;
				&model_output * (-sigma / c.sqrt()) + &sample / c
			}
		}
	}
}
