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

use ndarray::{Array4, ArrayView1, ArrayView4};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::rngs::StdRng;

use super::{DiffusionScheduler, KarrasSigmas, SchedulerConfig, SchedulerStepOutput};

/// Ancestral sampling with Euler method steps.
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd].
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L72
#[derive(Debug, Clone)]
pub struct EulerAncestralDiscreteScheduler {
	sigmas: KarrasSigmas
}

impl Default for EulerAncestralDiscreteScheduler {
	fn default() -> Self {
		Self {
			sigmas: KarrasSigmas::new(&SchedulerConfig::default()).expect("default scheduler config is valid")
		}
	}
}

impl EulerAncestralDiscreteScheduler {
	/// Creates a new instance of the scheduler. Fails under the same conditions as
	/// [`super::EulerDiscreteScheduler::new`].
	pub fn new(config: &SchedulerConfig) -> anyhow::Result<Self> {
		Ok(Self { sigmas: KarrasSigmas::new(config)? })
	}
}

impl DiffusionScheduler for EulerAncestralDiscreteScheduler {
	fn set_timesteps(&mut self, num_inference_steps: usize) {
		self.sigmas.set_timesteps(num_inference_steps);
	}

	fn timesteps(&self) -> ArrayView1<'_, f32> {
		self.sigmas.timesteps.view()
	}

	fn init_noise_sigma(&self) -> f32 {
		self.sigmas.init_noise_sigma()
	}

	fn scale_model_input(&self, sample: ArrayView4<'_, f32>, step_index: usize) -> Array4<f32> {
		self.sigmas.scale_model_input(sample, step_index)
	}

	fn step(&mut self, model_output: ArrayView4<'_, f32>, step_index: usize, sample: ArrayView4<'_, f32>, rng: &mut StdRng) -> anyhow::Result<SchedulerStepOutput> {
		let (sigma_from, sigma_to) = self.sigmas.sigma_pair(step_index)?;

		// 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
		let pred_original_sample = self.sigmas.pred_original_sample(model_output, sample, sigma_from);
		let sigma_up = (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2)) / sigma_from.powi(2)).sqrt();
		let sigma_down = (sigma_to.powi(2) - sigma_up.powi(2)).max(0.0).sqrt();

		// 2. convert to an ODE derivative
		let derivative = (&sample - &pred_original_sample) / sigma_from;
		let dt = sigma_down - sigma_from;
		let prev_sample = &sample + &(derivative * dt);

		let noise = Array4::<f32>::random_using(model_output.raw_dim(), StandardNormal, rng);
		let prev_sample = prev_sample + noise * sigma_up;

		Ok(SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample)
		})
	}
}
