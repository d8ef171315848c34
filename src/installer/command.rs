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
	ffi::OsString,
	process::{Command, Stdio}
};

use super::{AcceleratorProbe, PackageManager, PackageProbe};

const FIND_SPEC: &str = "import importlib.util, sys; sys.exit(0 if importlib.util.find_spec(sys.argv[1]) is not None else 1)";

/// A Python interpreter, used both to probe and to install packages via `pip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonEnvironment {
	python: String
}

impl PythonEnvironment {
	/// Wraps the interpreter `python` (a name on `PATH` or a path).
	pub fn new(python: impl Into<String>) -> Self {
		Self { python: python.into() }
	}

	/// The interpreter this environment runs.
	pub fn python(&self) -> &str {
		&self.python
	}

	/// Arguments of the `pip install` invocation for `packages`.
	///
	/// ```
	/// # use diffusion_desk::installer::PythonEnvironment;
	/// let python = PythonEnvironment::new("python3");
	/// let args = python.install_args(&["torch".to_string(), "torchvision".to_string()], Some("https://download.pytorch.org/whl/cpu"));
	/// assert_eq!(args, ["-m", "pip", "install", "torch", "torchvision", "--index-url", "https://download.pytorch.org/whl/cpu"]);
	/// ```
	pub fn install_args(&self, packages: &[String], index_url: Option<&str>) -> Vec<OsString> {
		let mut args: Vec<OsString> = ["-m", "pip", "install"].into_iter().map(OsString::from).collect();
		args.extend(packages.iter().map(OsString::from));
		if let Some(index_url) = index_url {
			args.push("--index-url".into());
			args.push(index_url.into());
		}
		args
	}
}

impl PackageProbe for PythonEnvironment {
	fn is_installed(&self, import_name: &str) -> bool {
		match Command::new(&self.python)
			.args(["-c", FIND_SPEC, import_name])
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.status()
		{
			Ok(status) => status.success(),
			Err(e) => {
				log::warn!("failed to run {}: {e}", self.python);
				false
			}
		}
	}
}

impl PackageManager for PythonEnvironment {
	fn install(&self, packages: &[String], index_url: Option<&str>) -> Result<(), String> {
		log::debug!("running {} {:?}", self.python, self.install_args(packages, index_url));
		let output = Command::new(&self.python)
			.args(self.install_args(packages, index_url))
			.stdin(Stdio::null())
			.output()
			.map_err(|e| format!("failed to run {}: {e}", self.python))?;
		if output.status.success() {
			Ok(())
		} else {
			Err(String::from_utf8_lossy(&output.stderr).into_owned())
		}
	}
}

/// Detects NVIDIA GPUs by running `nvidia-smi`. A missing executable means no GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvidiaSmi {
	program: String
}

impl NvidiaSmi {
	/// Probes with `program` instead of `nvidia-smi`.
	pub fn new(program: impl Into<String>) -> Self {
		Self { program: program.into() }
	}
}

impl Default for NvidiaSmi {
	fn default() -> Self {
		Self::new("nvidia-smi")
	}
}

impl AcceleratorProbe for NvidiaSmi {
	fn cuda_available(&self) -> bool {
		Command::new(&self.program)
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.status()
			.map(|status| status.success())
			.unwrap_or(false)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn install_args_without_index() {
		let python = PythonEnvironment::new("python");
		assert_eq!(python.install_args(&["diffusers".to_string()], None), ["-m", "pip", "install", "diffusers"]);
	}

	#[test]
	fn missing_probe_program_means_no_gpu() {
		assert!(!NvidiaSmi::new("definitely-not-a-real-gpu-probe-binary").cuda_available());
	}

	#[test]
	fn missing_interpreter_reports_packages_absent() {
		let python = PythonEnvironment::new("definitely-not-a-real-python-binary");
		assert!(!python.is_installed("torch"));
		assert!(python.install(&["torch".to_string()], None).is_err());
	}
}
