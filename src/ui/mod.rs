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

//! The desktop window.

use std::sync::Arc;

use eframe::egui;

use crate::{config::AppConfig, shell::GenerationWorker, GenerationService, OnnxLoader, OrtEnvironment, PipelineManager};

mod app;
mod splash;

use self::{
	app::MainView,
	splash::{SplashOutcome, SplashView}
};

/// Window title.
pub const TITLE: &str = "Stable Diffusion UI";

enum Phase {
	Splash(SplashView),
	Main(Box<MainView>),
	Fatal(String)
}

/// Splash installer first, then the generator; a fatal dialog closes the app.
pub struct DesktopApp {
	config: AppConfig,
	phase: Phase
}

impl DesktopApp {
	/// Starts provisioning packages in the background.
	pub fn new(cc: &eframe::CreationContext<'_>, config: AppConfig) -> Self {
		let splash = SplashView::start(&cc.egui_ctx, &config);
		Self {
			config,
			phase: Phase::Splash(splash)
		}
	}
}

fn open_main(ctx: &egui::Context, config: &AppConfig) -> Phase {
	let environment = match OrtEnvironment::builder().with_name("diffusion-desk").build() {
		Ok(environment) => environment.into_arc(),
		Err(e) => return Phase::Fatal(format!("failed to initialize ONNX Runtime: {e}"))
	};
	let manager = Arc::new(PipelineManager::new(OnnxLoader::new(&environment, config)));
	let service = Arc::new(GenerationService::new(manager, config));
	let ctx = ctx.clone();
	Phase::Main(Box::new(MainView::new(GenerationWorker::new(service, move || ctx.request_repaint()))))
}

impl eframe::App for DesktopApp {
	fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
		let next = match &mut self.phase {
			Phase::Splash(splash) => match splash.update(ctx) {
				SplashOutcome::Running => None,
				SplashOutcome::Ready => Some(open_main(ctx, &self.config)),
				SplashOutcome::Failed(message) => Some(Phase::Fatal(message))
			},
			Phase::Main(main) => {
				main.update(ctx);
				None
			}
			Phase::Fatal(message) => {
				egui::CentralPanel::default().show(ctx, |_| {});
				egui::Window::new("Error")
					.collapsible(false)
					.resizable(false)
					.anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
					.show(ctx, |ui| {
						ui.label(message.as_str());
						if ui.button("Close").clicked() {
							ctx.send_viewport_cmd(egui::ViewportCommand::Close);
						}
					});
				None
			}
		};
		if let Some(next) = next {
			self.phase = next;
			ctx.request_repaint();
		}
	}
}

/// Opens the window and blocks until it is closed.
pub fn run(config: AppConfig) -> eframe::Result<()> {
	let options = eframe::NativeOptions {
		viewport: egui::ViewportBuilder::default().with_inner_size([600.0, 720.0]).with_title(TITLE),
		..Default::default()
	};
	eframe::run_native(TITLE, options, Box::new(move |cc| Ok(Box::new(DesktopApp::new(cc, config)))))
}
