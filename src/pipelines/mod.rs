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

//! Diffusion pipelines.

use std::{fmt, ops::Deref};

use image::DynamicImage;

mod stable_diffusion;

pub use self::stable_diffusion::*;
use crate::util::prompting::cleanup_prompt;

/// A validated text prompt: cleaned up with [`cleanup_prompt`] and guaranteed non-empty.
///
/// ```
/// # use diffusion_desk::Prompt;
/// let prompt = Prompt::new("  a red fox,, in the snow ,")?;
/// assert_eq!(&*prompt, "a red fox, in the snow");
/// assert!(Prompt::new(" ,  ").is_err());
/// # Ok::<(), diffusion_desk::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt(String);

impl Prompt {
	/// Cleans up `text`, failing with [`crate::Error::EmptyPrompt`] if nothing is left.
	pub fn new(text: impl AsRef<str>) -> crate::Result<Self> {
		let text = cleanup_prompt(text.as_ref());
		if text.is_empty() {
			return Err(crate::Error::EmptyPrompt);
		}
		Ok(Self(text))
	}

	/// Returns the prompt text.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Deref for Prompt {
	type Target = str;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl fmt::Display for Prompt {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl TryFrom<&str> for Prompt {
	type Error = crate::Error;

	fn try_from(value: &str) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl TryFrom<String> for Prompt {
	type Error = crate::Error;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

/// A loaded text-to-image model.
pub trait ImagePipeline: Send + Sync {
	/// Generates a single image for `prompt`.
	fn txt2img(&self, prompt: &Prompt, options: &Txt2ImgOptions) -> anyhow::Result<DynamicImage>;

	/// Frees memory held only for the duration of one generation. Called after every generation, whether it
	/// succeeded or not.
	fn release_transient(&self) {}
}

impl ImagePipeline for StableDiffusionPipeline {
	fn txt2img(&self, prompt: &Prompt, options: &Txt2ImgOptions) -> anyhow::Result<DynamicImage> {
		options.run(self, prompt)
	}

	fn release_transient(&self) {
		self.release_sessions();
	}
}

#[cfg(test)]
mod tests {
	use super::Prompt;
	use crate::Error;

	#[test]
	fn rejects_whitespace_only_prompts() {
		assert!(matches!(Prompt::new(""), Err(Error::EmptyPrompt)));
		assert!(matches!(Prompt::new(" \t\n"), Err(Error::EmptyPrompt)));
		assert!(matches!(Prompt::try_from(",,"), Err(Error::EmptyPrompt)));
	}

	#[test]
	fn keeps_meaningful_text() {
		let prompt = Prompt::try_from(String::from("an astronaut riding a horse")).unwrap();
		assert_eq!(prompt.as_str(), "an astronaut riding a horse");
		assert_eq!(prompt.to_string(), "an astronaut riding a horse");
	}
}
