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

//! Resolution of a [`ModelSpec`] to a directory holding an ONNX export, exporting it on first use.

use std::{
	ffi::OsString,
	fs,
	path::{Path, PathBuf},
	process::{Command, Stdio}
};

use crate::config::{ModelManifest, ModelSpec, StableDiffusionLayout};

const SAVE_FAST_TOKENIZER: &str = "import sys; from transformers import CLIPTokenizerFast; CLIPTokenizerFast.from_pretrained(sys.argv[1]).save_pretrained(sys.argv[1])";

/// Converts a pretrained checkpoint into the ONNX layout described by [`StableDiffusionLayout::default`].
pub trait Exporter: Send + Sync {
	/// Exports `spec` into the (empty) directory `dest`.
	fn export(&self, spec: &ModelSpec, dest: &Path) -> anyhow::Result<()>;
}

/// Exports with `optimum.exporters.onnx`, then saves a fast CLIP `tokenizer.json` next to the slow tokenizer files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimumExporter {
	python: String
}

impl OptimumExporter {
	/// Exports using the interpreter `python`.
	pub fn new(python: impl Into<String>) -> Self {
		Self { python: python.into() }
	}

	/// Arguments of the exporter invocation.
	///
	/// ```
	/// # use std::path::Path;
	/// # use diffusion_desk::{config::ModelSpec, export::OptimumExporter};
	/// let spec = ModelSpec { id: "org/model".into(), revision: Some("main".into()) };
	/// let args = OptimumExporter::new("python3").export_args(&spec, Path::new("out"));
	/// assert_eq!(args, ["-m", "optimum.exporters.onnx", "--model", "org/model", "--revision", "main", "out"]);
	/// ```
	pub fn export_args(&self, spec: &ModelSpec, dest: &Path) -> Vec<OsString> {
		let mut args: Vec<OsString> = ["-m", "optimum.exporters.onnx", "--model", spec.id.as_str()].into_iter().map(OsString::from).collect();
		if let Some(revision) = &spec.revision {
			args.push("--revision".into());
			args.push(revision.into());
		}
		args.push(dest.into());
		args
	}

	fn run(&self, args: impl IntoIterator<Item = impl Into<OsString>>) -> anyhow::Result<()> {
		let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
		log::debug!("running {} {args:?}", self.python);
		let output = Command::new(&self.python)
			.args(&args)
			.stdin(Stdio::null())
			.output()
			.map_err(|e| anyhow::anyhow!("failed to run {}: {e}", self.python))?;
		if !output.status.success() {
			anyhow::bail!("{} exited with {}: {}", self.python, output.status, String::from_utf8_lossy(&output.stderr).trim());
		}
		Ok(())
	}
}

impl Exporter for OptimumExporter {
	fn export(&self, spec: &ModelSpec, dest: &Path) -> anyhow::Result<()> {
		self.run(self.export_args(spec, dest))?;
		let tokenizer_dir = dest.join("tokenizer");
		self.run([OsString::from("-c"), OsString::from(SAVE_FAST_TOKENIZER), tokenizer_dir.into_os_string()])
	}
}

/// Finds or creates the ONNX export of a model.
pub struct ModelLocator<E> {
	cache_dir: PathBuf,
	exporter: E
}

impl<E: Exporter> ModelLocator<E> {
	/// Caches exports under `<cache_dir>/onnx`.
	pub fn new(cache_dir: impl Into<PathBuf>, exporter: E) -> Self {
		Self {
			cache_dir: cache_dir.into(),
			exporter
		}
	}

	/// Where the export of `spec` is cached.
	pub fn cached_path(&self, spec: &ModelSpec) -> PathBuf {
		self.cache_dir.join("onnx").join(spec.cache_key())
	}

	/// Returns a directory with a complete ONNX export of `spec`:
	///
	/// 1. `spec.id` itself, if it is an existing directory;
	/// 2. the cached export, if it is complete;
	/// 3. a fresh export, which is then cached.
	pub fn resolve(&self, spec: &ModelSpec) -> anyhow::Result<PathBuf> {
		let local = Path::new(&spec.id);
		if local.is_dir() {
			ensure_complete(local)?;
			log::info!("using local model at {}", local.display());
			return Ok(local.to_path_buf());
		}

		let cached = self.cached_path(spec);
		if cached.is_dir() && ensure_complete(&cached).is_ok() {
			log::info!("using cached export at {}", cached.display());
			return Ok(cached);
		}

		let staging = cached.with_file_name(format!(".{}.partial", spec.cache_key()));
		if staging.exists() {
			fs::remove_dir_all(&staging)?;
		}
		fs::create_dir_all(&staging)?;
		log::info!("exporting {} to ONNX, this may take a while", spec.id);
		if let Err(e) = self.export_into(spec, &staging) {
			let _ = fs::remove_dir_all(&staging);
			return Err(e.context(format!("failed to export {}", spec.id)));
		}

		if cached.exists() {
			fs::remove_dir_all(&cached)?;
		}
		fs::rename(&staging, &cached)?;
		log::info!("cached export at {}", cached.display());
		Ok(cached)
	}

	fn export_into(&self, spec: &ModelSpec, staging: &Path) -> anyhow::Result<()> {
		self.exporter.export(spec, staging)?;
		if !staging.join(ModelManifest::FILE_NAME).is_file() {
			ModelManifest::write(staging, StableDiffusionLayout::default())?;
		}
		ensure_complete(staging)
	}
}

fn ensure_complete(root: &Path) -> anyhow::Result<()> {
	let missing = ModelManifest::load(root)?.missing_files(root);
	if !missing.is_empty() {
		let missing: Vec<String> = missing.iter().map(|path| path.display().to_string()).collect();
		anyhow::bail!("{} is not a complete ONNX export; missing {}", root.display(), missing.join(", "));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	const EXPORT_FILES: [&str; 4] = ["tokenizer/tokenizer.json", "text_encoder/model.onnx", "unet/model.onnx", "vae_decoder/model.onnx"];

	fn touch_layout(root: &Path) {
		for path in EXPORT_FILES {
			let path = root.join(path);
			fs::create_dir_all(path.parent().unwrap()).unwrap();
			fs::write(path, b"").unwrap();
		}
	}

	#[derive(Default)]
	struct FakeExporter {
		calls: AtomicUsize,
		complete: bool
	}

	impl Exporter for FakeExporter {
		fn export(&self, _: &ModelSpec, dest: &Path) -> anyhow::Result<()> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			if self.complete {
				touch_layout(dest);
			}
			Ok(())
		}
	}

	fn spec(id: &str) -> ModelSpec {
		ModelSpec { id: id.to_string(), revision: None }
	}

	#[test]
	fn exports_once_then_uses_cache() {
		let cache = tempfile::tempdir().unwrap();
		let locator = ModelLocator::new(cache.path(), FakeExporter { complete: true, ..Default::default() });

		let first = locator.resolve(&spec("org/model")).unwrap();
		assert_eq!(first, cache.path().join("onnx").join("org--model"));
		assert!(first.join(ModelManifest::FILE_NAME).is_file());

		let second = locator.resolve(&spec("org/model")).unwrap();
		assert_eq!(first, second);
		assert_eq!(locator.exporter.calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn local_directory_is_used_as_is() {
		let model = tempfile::tempdir().unwrap();
		touch_layout(model.path());
		let locator = ModelLocator::new(tempfile::tempdir().unwrap().path(), FakeExporter::default());

		let resolved = locator.resolve(&spec(model.path().to_str().unwrap())).unwrap();
		assert_eq!(resolved, model.path());
		assert_eq!(locator.exporter.calls.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn incomplete_export_is_an_error_and_not_cached() {
		let cache = tempfile::tempdir().unwrap();
		let locator = ModelLocator::new(cache.path(), FakeExporter::default());
		let err = locator.resolve(&spec("org/model")).unwrap_err();
		assert!(format!("{err:#}").contains("missing"));
		assert!(!locator.cached_path(&spec("org/model")).exists());
		assert_eq!(fs::read_dir(cache.path().join("onnx")).unwrap().count(), 0);
	}
}
