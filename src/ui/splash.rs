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
	sync::mpsc::{self, Receiver, TryRecvError},
	thread
};

use eframe::egui;

use crate::{config::AppConfig, installer::Installer};

enum SplashMessage {
	Progress(String),
	Done(crate::Result<()>)
}

/// Outcome of a frame of the splash view.
pub(super) enum SplashOutcome {
	Running,
	Ready,
	Failed(String)
}

/// Runs the installer on a worker thread and streams its log.
pub(super) struct SplashView {
	lines: Vec<String>,
	receiver: Receiver<SplashMessage>
}

impl SplashView {
	pub(super) fn start(ctx: &egui::Context, config: &AppConfig) -> Self {
		let (sender, receiver) = mpsc::channel();
		let installer = Installer::system(config.installer.clone(), config.python.clone(), config.gpu_probe.clone());
		let ctx = ctx.clone();
		thread::spawn(move || {
			let progress = sender.clone();
			let progress_ctx = ctx.clone();
			let result = installer
				.ensure_packages(move |event| {
					let _ = progress.send(SplashMessage::Progress(event.to_string()));
					progress_ctx.request_repaint();
				})
				.map(|_| ());
			let _ = sender.send(SplashMessage::Done(result));
			ctx.request_repaint();
		});
		Self { lines: Vec::new(), receiver }
	}

	pub(super) fn update(&mut self, ctx: &egui::Context) -> SplashOutcome {
		let mut outcome = SplashOutcome::Running;
		loop {
			match self.receiver.try_recv() {
				Ok(SplashMessage::Progress(line)) => self.lines.push(line),
				Ok(SplashMessage::Done(Ok(()))) => outcome = SplashOutcome::Ready,
				Ok(SplashMessage::Done(Err(e))) => outcome = SplashOutcome::Failed(e.to_string()),
				Err(TryRecvError::Empty) => break,
				Err(TryRecvError::Disconnected) => {
					if matches!(outcome, SplashOutcome::Running) {
						outcome = SplashOutcome::Failed("the installer stopped unexpectedly".to_string());
					}
					break;
				}
			}
		}

		egui::CentralPanel::default().show(ctx, |ui| {
			ui.vertical_centered(|ui| {
				ui.heading(super::TITLE);
				ui.horizontal(|ui| {
					ui.spinner();
					ui.label("Preparing the Python environment...");
				});
			});
			ui.separator();
			egui::ScrollArea::vertical().stick_to_bottom(true).show(ui, |ui| {
				for line in &self.lines {
					ui.monospace(line);
				}
			});
		});
		outcome
	}
}
