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

//! Utilities for cleaning up prompts.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
	static ref COMMA_REGEX: Regex = Regex::new(r#"\s*,[\s,]*"#).unwrap();
	static ref WHITESPACE_REGEX: Regex = Regex::new(r#"\s+"#).unwrap();
	static ref TRAILING_LEADING_COMMA: Regex = Regex::new(r#"^[,\s]+|[,\s]+$"#).unwrap();
}

/// Cleans up a potentially dirty prompt: runs of whitespace become one space, repeated commas collapse into one, and
/// leading/trailing commas and whitespace are removed. A prompt with no content cleans up to an empty string.
///
/// ```
/// # use diffusion_desk::prompting::cleanup_prompt;
/// assert_eq!(cleanup_prompt("  photo of a red fox,,  forest ,\n golden hour, ").as_str(), "photo of a red fox, forest, golden hour");
/// assert_eq!(cleanup_prompt(" , \t ").as_str(), "");
/// ```
pub fn cleanup_prompt<S: AsRef<str>>(prompt: S) -> String {
	let prompt = WHITESPACE_REGEX.replace_all(prompt.as_ref(), " ");
	let prompt = COMMA_REGEX.replace_all(prompt.as_ref(), ", ");
	let prompt = TRAILING_LEADING_COMMA.replace_all(prompt.as_ref(), "");
	prompt.trim().to_string()
}

#[cfg(test)]
mod tests {
	use super::cleanup_prompt;

	#[test]
	fn test_cleanup_prompt() {
		assert_eq!(cleanup_prompt("masterpiece,, best quality ,,, a lighthouse").as_str(), "masterpiece, best quality, a lighthouse");
		assert_eq!(cleanup_prompt("a  cat\tin\nspace").as_str(), "a cat in space");
		assert_eq!(cleanup_prompt("").as_str(), "");
	}
}
