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

use eframe::egui;

use crate::{
	shell::{GenerationWorker, ShellState},
	OnnxLoader
};

/// The prompt field, generate button, status line and image surface.
pub(super) struct MainView {
	prompt: String,
	state: ShellState,
	worker: GenerationWorker<OnnxLoader>,
	texture: Option<egui::TextureHandle>
}

impl MainView {
	pub(super) fn new(worker: GenerationWorker<OnnxLoader>) -> Self {
		Self {
			prompt: String::new(),
			state: ShellState::new(),
			worker,
			texture: None
		}
	}

	pub(super) fn update(&mut self, ctx: &egui::Context) {
		while let Some(event) = self.worker.try_recv() {
			self.state.finish(event);
		}
		if let Some(image) = self.state.take_new_preview() {
			let rgb = image.to_rgb8();
			let size = [rgb.width() as usize, rgb.height() as usize];
			let color_image = egui::ColorImage::from_rgb(size, rgb.as_raw());
			self.texture = Some(ctx.load_texture("preview", color_image, egui::TextureOptions::LINEAR));
		}

		egui::CentralPanel::default().show(ctx, |ui| {
			ui.vertical_centered(|ui| {
				let field = ui.add(egui::TextEdit::singleline(&mut self.prompt).hint_text("Enter your prompt here...").desired_width(480.0));
				let submitted = field.lost_focus() && ui.input(|input| input.key_pressed(egui::Key::Enter));
				let clicked = ui.add_enabled(self.state.button_enabled(), egui::Button::new("Generate")).clicked();
				if clicked || (submitted && self.state.button_enabled()) {
					if let Some(prompt) = self.state.submit(&self.prompt, self.worker.is_loaded()) {
						self.worker.dispatch(prompt);
					}
				}

				ui.horizontal(|ui| {
					if !self.state.button_enabled() {
						ui.spinner();
					}
					ui.label(self.state.status());
				});
				if let Some(path) = self.state.saved_to() {
					ui.small(format!("saved to {}", path.display()));
				}

				if let Some(texture) = &self.texture {
					ui.add_space(10.0);
					ui.add(egui::Image::new(egui::load::SizedTexture::from_handle(texture)));
				}
			});
		});

		let mut dismissed = false;
		if let Some(message) = self.state.error() {
			egui::Window::new("Error")
				.collapsible(false)
				.resizable(false)
				.anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
				.show(ctx, |ui| {
					ui.label(message);
					dismissed = ui.button("OK").clicked();
				});
		}
		if dismissed {
			self.state.dismiss_error();
		}
	}
}
