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

//! Provisioning of the Python packages used to export pretrained checkpoints to ONNX.
//!
//! Installation state is never persisted: every run probes importability and installs only what is missing.

use std::fmt;

use serde::{Deserialize, Serialize};

mod command;

pub use self::command::{NvidiaSmi, PythonEnvironment};

/// Checks whether a package can be imported.
pub trait PackageProbe {
	/// Returns `true` if `import_name` is importable in the target environment.
	fn is_installed(&self, import_name: &str) -> bool;
}

/// Installs packages into the target environment.
pub trait PackageManager {
	/// Installs `packages` in a single invocation, optionally from `index_url`. On failure, returns the installer's
	/// diagnostic output.
	fn install(&self, packages: &[String], index_url: Option<&str>) -> Result<(), String>;
}

/// Detects whether a CUDA-capable GPU is present.
pub trait AcceleratorProbe {
	/// Returns `true` if a CUDA-capable GPU was found.
	fn cuda_available(&self) -> bool;
}

/// A package that is probed by one name and installed by another.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackageSpec {
	/// Module name passed to the import probe.
	pub import_name: String,
	/// Distribution name passed to the package manager.
	pub install_name: String
}

impl PackageSpec {
	/// A package whose import and install names agree.
	pub fn new(name: impl Into<String>) -> Self {
		let name = name.into();
		Self {
			import_name: name.clone(),
			install_name: name
		}
	}
}

/// The accelerated-math package family, whose build depends on the available hardware.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AcceleratedPackages {
	/// Module whose presence means the whole family is installed.
	pub import_name: String,
	/// Distributions installed together in one command.
	pub packages: Vec<String>,
	/// Package index used when a CUDA GPU is present.
	pub cuda_index_url: String,
	/// Package index used otherwise.
	pub cpu_index_url: String
}

impl Default for AcceleratedPackages {
	fn default() -> Self {
		Self {
			import_name: "torch".to_string(),
			packages: vec!["torch".to_string(), "torchvision".to_string(), "torchaudio".to_string()],
			cuda_index_url: "https://download.pytorch.org/whl/cu118".to_string(),
			cpu_index_url: "https://download.pytorch.org/whl/cpu".to_string()
		}
	}
}

/// The set of packages required before the first run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InstallPlan {
	/// When `false`, provisioning is skipped entirely.
	pub enabled: bool,
	/// Hardware-dependent packages, installed first.
	pub accelerated: AcceleratedPackages,
	/// Everything else, installed one at a time.
	pub packages: Vec<PackageSpec>
}

impl Default for InstallPlan {
	fn default() -> Self {
		Self {
			enabled: true,
			accelerated: AcceleratedPackages::default(),
			packages: ["diffusers", "transformers", "accelerate", "safetensors", "tokenizers", "optimum", "onnx"]
				.into_iter()
				.map(PackageSpec::new)
				.collect()
		}
	}
}

/// Progress of a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallEvent {
	/// Provisioning is disabled by configuration.
	Skipped,
	/// Installation of the accelerated packages is starting, against the CUDA index when `cuda` is set.
	AcceleratorDetected {
		/// Whether a CUDA GPU was detected.
		cuda: bool
	},
	/// The accelerated packages are already importable.
	AcceleratedPresent,
	/// A pip invocation is starting.
	Installing {
		/// Distributions being installed.
		packages: Vec<String>
	},
	/// A pip invocation succeeded.
	Installed {
		/// Distributions that were installed.
		packages: Vec<String>
	},
	/// A pip invocation failed. Provisioning stops after this event.
	Failed {
		/// Distributions that failed to install.
		packages: Vec<String>,
		/// Installer diagnostic output.
		stderr: String
	},
	/// Every required package is importable.
	Ready {
		/// Whether anything had to be installed.
		installed_any: bool
	}
}

impl fmt::Display for InstallEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			InstallEvent::Skipped => f.write_str("Package installation disabled"),
			InstallEvent::AcceleratorDetected { cuda: true } => f.write_str("CUDA detected - installing PyTorch with CUDA support"),
			InstallEvent::AcceleratorDetected { cuda: false } => f.write_str("No CUDA detected - installing CPU-only PyTorch"),
			InstallEvent::AcceleratedPresent => f.write_str("✓ PyTorch is available"),
			InstallEvent::Installing { packages } => write!(f, "Installing {}...", packages.join(" ")),
			InstallEvent::Installed { packages } => write!(f, "✓ {} installed successfully", packages.join(" ")),
			InstallEvent::Failed { packages, stderr } => write!(f, "✗ Failed to install {}: {}", packages.join(" "), stderr.trim()),
			InstallEvent::Ready { installed_any: true } => f.write_str("✓ All ML packages installed successfully!"),
			InstallEvent::Ready { installed_any: false } => f.write_str("✓ All ML packages are available")
		}
	}
}

/// What a provisioning run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
	/// Every distribution that was installed, in order.
	pub installed: Vec<String>,
	/// Whether the accelerated packages were installed from the CUDA index. `None` if they were not installed.
	pub cuda: Option<bool>
}

/// Ensures every package of an [`InstallPlan`] is importable.
pub struct Installer<P, M, A> {
	plan: InstallPlan,
	probe: P,
	manager: M,
	accelerator: A
}

impl Installer<PythonEnvironment, PythonEnvironment, NvidiaSmi> {
	/// An installer for the interpreter `python`, probing the GPU with `gpu_probe`.
	pub fn system(plan: InstallPlan, python: impl Into<String>, gpu_probe: impl Into<String>) -> Self {
		let python = PythonEnvironment::new(python);
		Self::new(plan, python.clone(), python, NvidiaSmi::new(gpu_probe))
	}
}

impl<P: PackageProbe, M: PackageManager, A: AcceleratorProbe> Installer<P, M, A> {
	/// Creates an installer from its collaborators.
	pub fn new(plan: InstallPlan, probe: P, manager: M, accelerator: A) -> Self {
		Self { plan, probe, manager, accelerator }
	}

	/// Installs whatever is missing, reporting progress to `sink`. Fails with [`crate::Error::Install`] on the first
	/// package that fails to install.
	pub fn ensure_packages(&self, mut sink: impl FnMut(InstallEvent)) -> crate::Result<InstallReport> {
		let mut emit = |event: InstallEvent| {
			match &event {
				InstallEvent::Failed { .. } => log::error!("{event}"),
				_ => log::info!("{event}")
			}
			sink(event);
		};

		let mut report = InstallReport::default();
		if !self.plan.enabled {
			emit(InstallEvent::Skipped);
			return Ok(report);
		}

		let accelerated = &self.plan.accelerated;
		if self.probe.is_installed(&accelerated.import_name) {
			emit(InstallEvent::AcceleratedPresent);
		} else {
			let cuda = self.accelerator.cuda_available();
			emit(InstallEvent::AcceleratorDetected { cuda });
			let index_url = if cuda { &accelerated.cuda_index_url } else { &accelerated.cpu_index_url };
			self.install(&accelerated.packages, Some(index_url), &mut emit)?;
			report.installed.extend(accelerated.packages.iter().cloned());
			report.cuda = Some(cuda);
		}

		let missing: Vec<&PackageSpec> = self.plan.packages.iter().filter(|spec| !self.probe.is_installed(&spec.import_name)).collect();
		for spec in missing {
			let packages = vec![spec.install_name.clone()];
			self.install(&packages, None, &mut emit)?;
			report.installed.extend(packages);
		}

		emit(InstallEvent::Ready {
			installed_any: !report.installed.is_empty()
		});
		Ok(report)
	}

	fn install(&self, packages: &[String], index_url: Option<&str>, emit: &mut impl FnMut(InstallEvent)) -> crate::Result<()> {
		emit(InstallEvent::Installing { packages: packages.to_vec() });
		match self.manager.install(packages, index_url) {
			Ok(()) => {
				emit(InstallEvent::Installed { packages: packages.to_vec() });
				Ok(())
			}
			Err(stderr) => {
				emit(InstallEvent::Failed {
					packages: packages.to_vec(),
					stderr: stderr.clone()
				});
				Err(crate::Error::Install {
					packages: packages.to_vec(),
					stderr
				})
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn events_render_like_the_installer_log() {
		let packages = vec!["torch".to_string(), "torchvision".to_string()];
		assert_eq!(InstallEvent::Installed { packages: packages.clone() }.to_string(), "✓ torch torchvision installed successfully");
		assert_eq!(
			InstallEvent::Failed {
				packages,
				stderr: "no matching distribution\n".to_string()
			}
			.to_string(),
			"✗ Failed to install torch torchvision: no matching distribution"
		);
	}

	#[test]
	fn plan_defaults_cover_export_toolchain() {
		let plan: InstallPlan = serde_json::from_str(r#"{ "enabled": true }"#).unwrap();
		assert_eq!(plan, InstallPlan::default());
		let names: Vec<&str> = plan.packages.iter().map(|p| p.install_name.as_str()).collect();
		assert!(names.contains(&"optimum"));
		assert!(names.contains(&"diffusers"));
		assert_eq!(plan.accelerated.packages.len(), 3);
	}
}
