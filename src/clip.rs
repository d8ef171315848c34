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

//! CLIP tokenizer implementation.

use std::path::Path;

use ndarray::Array2;
use tokenizers::{PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

/// A basic [CLIP](https://arxiv.org/abs/2103.00020) tokenizer.
///
/// CLIP is used by many diffusion models, including Stable Diffusion, for prompt tokenization and feature extraction.
/// Every encoded prompt is truncated or padded to exactly `model_max_length` tokens.
pub struct CLIPStandardTokenizer {
	inner: Tokenizer,
	model_max_length: usize,
	bos_token_id: u32,
	eos_token_id: u32
}

unsafe impl Send for CLIPStandardTokenizer {}
unsafe impl Sync for CLIPStandardTokenizer {}

impl CLIPStandardTokenizer {
	/// Loads a CLIP tokenizer from a HuggingFace `tokenizer.json`.
	pub fn new(path: impl AsRef<Path>, model_max_length: usize, bos_token_id: u32, eos_token_id: u32) -> anyhow::Result<Self> {
		let bytes = std::fs::read(path.as_ref())?;
		Self::from_bytes(bytes, model_max_length, bos_token_id, eos_token_id)
	}

	/// Loads a CLIP tokenizer from a byte array.
	pub fn from_bytes<B: AsRef<[u8]>>(bytes: B, model_max_length: usize, bos_token_id: u32, eos_token_id: u32) -> anyhow::Result<Self> {
		let mut inner: Tokenizer = serde_json::from_slice(bytes.as_ref())?;
		inner.with_truncation(Some(TruncationParams {
			max_length: model_max_length,
			..Default::default()
		}));
		inner.with_padding(Some(PaddingParams {
			strategy: PaddingStrategy::Fixed(model_max_length),
			direction: PaddingDirection::Right,
			pad_id: eos_token_id,
			pad_token: "<|endoftext|>".to_string(),
			..Default::default()
		}));
		Ok(Self {
			inner,
			model_max_length,
			bos_token_id,
			eos_token_id
		})
	}

	/// Returns the maximum length of tokens this tokenizer supports. For most CLIP models, this is 77 tokens.
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		self.model_max_length
	}

	/// Returns the ID of the end-of-string token.
	pub fn eos(&self) -> u32 {
		self.eos_token_id
	}

	/// Returns the ID of the beginning-of-string token.
	pub fn bos(&self) -> u32 {
		self.bos_token_id
	}

	/// Encodes a single prompt into its token IDs.
	pub fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
		Ok(self
			.inner
			.encode(text, true)
			.map_err(|e| anyhow::anyhow!("{e:?}"))?
			.get_ids()
			.to_vec())
	}

	/// Encodes a prompt into a `[1, model_max_length]` array to be passed to a CLIPTextModel.
	pub fn encode_for_text_model(&self, text: &str) -> anyhow::Result<Array2<i64>> {
		let ids = self.encode(text)?;
		anyhow::ensure!(ids.len() == self.len(), "tokenizer produced {} tokens, expected {}", ids.len(), self.len());
		ensure_framed(&ids, self.bos(), self.eos())?;
		Ok(Array2::from_shape_vec((1, self.len()), ids.into_iter().map(i64::from).collect())?)
	}
}

/// Checks that `ids` starts with `bos` and contains `eos`; a tokenizer without the CLIP post-processor produces neither.
fn ensure_framed(ids: &[u32], bos: u32, eos: u32) -> anyhow::Result<()> {
	anyhow::ensure!(
		ids.first() == Some(&bos) && ids.contains(&eos),
		"tokenizer does not frame prompts with the BOS/EOS tokens {bos}/{eos}"
	);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::ensure_framed;

	#[test]
	fn prompts_must_be_framed() {
		let mut ids = vec![49407; 77];
		ids[0] = 49406;
		ids[1] = 320;
		assert!(ensure_framed(&ids, 49406, 49407).is_ok());

		ids[0] = 320;
		assert!(ensure_framed(&ids, 49406, 49407).is_err());
		assert!(ensure_framed(&[49406, 320, 0, 0], 49406, 49407).is_err());
	}
}
