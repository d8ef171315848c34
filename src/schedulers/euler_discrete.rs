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
use rand::rngs::StdRng;

use super::{DiffusionScheduler, KarrasSigmas, SchedulerConfig, SchedulerStepOutput};

/// Euler scheduler (Algorithm 2) from [Karras et al. (2022)](https://arxiv.org/abs/2206.00364), without churn.
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd].
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L51
#[derive(Debug, Clone)]
pub struct EulerDiscreteScheduler {
	sigmas: KarrasSigmas
}

impl Default for EulerDiscreteScheduler {
	fn default() -> Self {
		Self {
			sigmas: KarrasSigmas::new(&SchedulerConfig::default()).expect("default scheduler config is valid")
		}
	}
}

impl EulerDiscreteScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Errors
	/// Can error if:
	/// - `num_train_timesteps` is less than 2
	/// - `beta_start` or `beta_end` are not normal numbers (not zero, infinite, `NaN`, or subnormal)
	/// - `beta_end` is less than or equal to `beta_start`
	pub fn new(config: &SchedulerConfig) -> anyhow::Result<Self> {
		Ok(Self { sigmas: KarrasSigmas::new(config)? })
	}
}

impl DiffusionScheduler for EulerDiscreteScheduler {
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

	fn step(&mut self, model_output: ArrayView4<'_, f32>, step_index: usize, sample: ArrayView4<'_, f32>, _rng: &mut StdRng) -> anyhow::Result<SchedulerStepOutput> {
		let (sigma, sigma_next) = self.sigmas.sigma_pair(step_index)?;

		let pred_original_sample = self.sigmas.pred_original_sample(model_output, sample, sigma);
		let derivative = (&sample - &pred_original_sample) / sigma;
		let dt = sigma_next - sigma;
		let prev_sample = &sample + &(derivative * dt);

		Ok(SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample)
		})
	}
}

#[cfg(test)]
mod tests {
	use ndarray::Array4;
	use rand::{rngs::StdRng, SeedableRng};

	use super::*;

	#[test]
	fn perfect_noise_prediction_recovers_clean_sample() {
		let mut scheduler = EulerDiscreteScheduler::default();
		scheduler.set_timesteps(10);
		let mut rng = StdRng::seed_from_u64(0);

		let clean = Array4::<f32>::from_elem((1, 4, 2, 2), 0.25);
		let noise = Array4::<f32>::from_elem((1, 4, 2, 2), 1.0);
		let mut sample = &clean + &(&noise * scheduler.init_noise_sigma());
		for i in 0..scheduler.timesteps().len() {
			sample = scheduler.step(noise.view(), i, sample.view(), &mut rng).unwrap().into_prev_sample();
		}
		for (a, b) in sample.iter().zip(clean.iter()) {
			assert!((a - b).abs() < 1e-4, "{a} != {b}");
		}
	}

	#[test]
	fn step_past_the_schedule_is_an_error() {
		let mut scheduler = EulerDiscreteScheduler::default();
		scheduler.set_timesteps(5);
		let sample = Array4::<f32>::zeros((1, 4, 1, 1));
		assert!(scheduler.step(sample.view(), 5, sample.view(), &mut StdRng::seed_from_u64(0)).is_err());
	}
}
