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

//! Tiled VAE decoding: latents are decoded in overlapping tiles and blended back together, bounding peak memory by
//! the tile size instead of the image size.

use ndarray::{s, Array1, Array2, Array4, ArrayView4, Axis};

/// Start offsets of tiles of length `tile` covering `len`, with consecutive tiles sharing at least `overlap`
/// elements. The last tile is aligned to the end, so every element is covered.
pub(crate) fn tile_starts(len: usize, tile: usize, overlap: usize) -> Vec<usize> {
	if len <= tile {
		return vec![0];
	}
	let stride = tile.saturating_sub(overlap).max(1);
	let mut starts: Vec<usize> = (0..).map(|i| i * stride).take_while(|start| start + tile < len).collect();
	starts.push(len - tile);
	starts.dedup();
	starts
}

/// Per-pixel blend weights along one axis of a tile. Edges shared with a neighbouring tile fade linearly over
/// `overlap` pixels; all weights stay positive.
fn blend_ramp(len: usize, overlap: usize, fade_in: bool, fade_out: bool) -> Array1<f32> {
	let span = (overlap + 1) as f32;
	Array1::from_shape_fn(len, |i| {
		let mut weight = 1.0_f32;
		if overlap > 0 && fade_in {
			weight = weight.min((i + 1) as f32 / span);
		}
		if overlap > 0 && fade_out {
			weight = weight.min((len - i) as f32 / span);
		}
		weight
	})
}

/// Decodes `latents` of shape `[batch, channels, height, width]` tile by tile. `decode` maps a latent tile to pixels
/// `scale` times larger in each spatial dimension. Latents no larger than one tile are decoded in a single call.
pub(crate) fn decode_tiled<F>(latents: ArrayView4<'_, f32>, tile: usize, overlap: usize, scale: usize, mut decode: F) -> anyhow::Result<Array4<f32>>
where
	F: FnMut(ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>>
{
	anyhow::ensure!(tile > overlap, "tile size ({tile}) must be larger than the tile overlap ({overlap})");
	let (batch, _, height, width) = latents.dim();
	if height <= tile && width <= tile {
		return decode(latents);
	}

	let (tile_h, tile_w) = (tile.min(height), tile.min(width));
	let mut output: Option<Array4<f32>> = None;
	let mut weights = Array2::<f32>::zeros((height * scale, width * scale));

	for &y in &tile_starts(height, tile, overlap) {
		for &x in &tile_starts(width, tile, overlap) {
			let decoded = decode(latents.slice(s![.., .., y..y + tile_h, x..x + tile_w]))?;
			let (_, channels, decoded_h, decoded_w) = decoded.dim();
			anyhow::ensure!(
				decoded_h == tile_h * scale && decoded_w == tile_w * scale,
				"decoder returned a {decoded_w}x{decoded_h} tile for a {tile_w}x{tile_h} latent tile"
			);

			let output = output.get_or_insert_with(|| Array4::zeros((batch, channels, height * scale, width * scale)));
			let ramp_y = blend_ramp(decoded_h, overlap * scale, y > 0, y + tile_h < height);
			let ramp_x = blend_ramp(decoded_w, overlap * scale, x > 0, x + tile_w < width);
			let mask: Array2<f32> = &ramp_y.insert_axis(Axis(1)) * &ramp_x.insert_axis(Axis(0));

			let (py, px) = (y * scale, x * scale);
			let mut region = output.slice_mut(s![.., .., py..py + decoded_h, px..px + decoded_w]);
			region += &(&decoded * &mask);
			let mut region_weights = weights.slice_mut(s![py..py + decoded_h, px..px + decoded_w]);
			region_weights += &mask;
		}
	}

	let mut output = output.ok_or_else(|| anyhow::anyhow!("no tiles were decoded"))?;
	output /= &weights;
	Ok(output)
}

#[cfg(test)]
mod tests {
	use ndarray::{Array4, ArrayView4};

	use super::{decode_tiled, tile_starts};

	/// Nearest-neighbour upsampling into 3 channels; every output pixel depends on exactly one latent pixel.
	fn fake_decode(latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let (batch, _, h, w) = latents.dim();
		Ok(Array4::from_shape_fn((batch, 3, h * 8, w * 8), |(b, c, y, x)| latents[[b, 0, y / 8, x / 8]] * (c + 1) as f32 - latents[[b, 3, y / 8, x / 8]]))
	}

	#[test]
	fn tiles_cover_the_whole_extent() {
		assert_eq!(tile_starts(64, 64, 8), vec![0]);
		assert_eq!(tile_starts(40, 64, 8), vec![0]);
		assert_eq!(tile_starts(96, 64, 8), vec![0, 32]);
		assert_eq!(tile_starts(128, 48, 8), vec![0, 40, 80]);
		for len in [65, 100, 127, 200] {
			let starts = tile_starts(len, 48, 8);
			assert_eq!(starts[0], 0);
			assert_eq!(*starts.last().unwrap() + 48, len);
			assert!(starts.windows(2).all(|w| w[0] + 48 >= w[1] + 8));
		}
	}

	#[test]
	fn tiled_decode_matches_whole_decode() {
		let latents = Array4::from_shape_fn((1, 4, 20, 28), |(_, c, y, x)| (c * 7 + y * 3 + x) as f32 * 0.01);
		let whole = fake_decode(latents.view()).unwrap();

		let mut calls = 0;
		let tiled = decode_tiled(latents.view(), 12, 4, 8, |tile| {
			calls += 1;
			fake_decode(tile)
		})
		.unwrap();

		assert!(calls > 1);
		assert_eq!(tiled.dim(), whole.dim());
		for (a, b) in tiled.iter().zip(whole.iter()) {
			assert!((a - b).abs() < 1e-4, "{a} != {b}");
		}
	}

	#[test]
	fn small_latents_decode_in_one_call() {
		let latents = Array4::<f32>::ones((1, 4, 8, 8));
		let mut calls = 0;
		decode_tiled(latents.view(), 64, 8, 8, |tile| {
			calls += 1;
			fake_decode(tile)
		})
		.unwrap();
		assert_eq!(calls, 1);
	}

	#[test]
	fn overlap_must_be_smaller_than_tile() {
		let latents = Array4::<f32>::ones((1, 4, 8, 8));
		assert!(decode_tiled(latents.view(), 8, 8, 8, fake_decode).is_err());
	}
}
