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

//! Errors surfaced to callers of the generation stack.

use std::path::PathBuf;

use thiserror::Error;

/// Every failure the desktop app can show to the user. The UI displays `to_string()` verbatim.
#[derive(Error, Debug)]
pub enum Error {
	/// A required package could not be installed; startup cannot continue.
	#[error("failed to install {}: {stderr}", packages.join(" "))]
	Install {
		/// The packages passed to the package manager.
		packages: Vec<String>,
		/// The package manager's error stream.
		stderr: String
	},
	/// The pipeline could not be constructed. Sticky for the lifetime of the process.
	#[error("failed to load model `{model}`: {message}")]
	ModelLoad {
		/// Model identifier that was being loaded.
		model: String,
		/// Rendered cause chain.
		message: String
	},
	/// Inference itself failed (out of memory, bad model outputs, ...).
	#[error("image generation failed: {0}")]
	Inference(String),
	/// The prompt was empty or only whitespace.
	#[error("please enter a prompt")]
	EmptyPrompt,
	/// The generated image could not be written.
	#[error("failed to save image to {}: {source}", path.display())]
	Output {
		/// Destination that could not be written.
		path: PathBuf,
		/// Encoder or filesystem error.
		#[source]
		source: image::ImageError
	},
	/// The configuration file is malformed.
	#[error("invalid configuration: {0}")]
	Config(#[from] serde_json::Error),
	/// Filesystem or subprocess I/O failure.
	#[error(transparent)]
	Io(#[from] std::io::Error)
}

/// Result alias for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
