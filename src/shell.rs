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

//! Toolkit-independent state of the main window and the background worker that runs generations for it.
//!
//! The window only ever touches [`ShellState`] from its own thread; the worker reports back over a channel.

use std::{
	panic::{self, AssertUnwindSafe},
	path::PathBuf,
	sync::{
		mpsc::{self, Receiver, Sender},
		Arc
	},
	thread
};

use image::DynamicImage;

use crate::{util::panic_message, GenerationService, Generated, PipelineLoader, Prompt};

/// Shown when the prompt is empty.
pub const STATUS_EMPTY_PROMPT: &str = "Please enter a prompt!";
/// Shown while the first request loads the model.
pub const STATUS_LOADING: &str = "Loading model...";
/// Shown while the model is denoising.
pub const STATUS_GENERATING: &str = "Generating image...";
/// Shown after a successful generation.
pub const STATUS_DONE: &str = "Done!";
/// Shown after a failed generation, next to the error dialog.
pub const STATUS_FAILED: &str = "Generation failed";

/// Largest edge of the displayed preview.
pub const PREVIEW_SIZE: u32 = 512;

/// Outcome of a dispatched request.
#[derive(Debug)]
pub enum ShellEvent {
	/// The image was generated and saved.
	Finished(Generated),
	/// Generation failed with this user-facing message.
	Failed(String)
}

/// What the main window shows.
#[derive(Debug, Default)]
pub struct ShellState {
	status: String,
	in_flight: bool,
	preview: Option<DynamicImage>,
	preview_changed: bool,
	saved_to: Option<PathBuf>,
	error: Option<String>
}

impl ShellState {
	/// An idle window with an empty status line.
	pub fn new() -> Self {
		Self::default()
	}

	/// Handles a press of the generate button. Returns the prompt to dispatch, or `None` if the request is rejected
	/// (empty prompt, or a request already in flight). On acceptance the button is disabled until [`Self::finish`].
	pub fn submit(&mut self, text: &str, pipeline_loaded: bool) -> Option<Prompt> {
		if self.in_flight {
			return None;
		}
		match Prompt::new(text) {
			Ok(prompt) => {
				self.in_flight = true;
				self.error = None;
				self.status = if pipeline_loaded { STATUS_GENERATING } else { STATUS_LOADING }.to_string();
				Some(prompt)
			}
			Err(_) => {
				self.status = STATUS_EMPTY_PROMPT.to_string();
				None
			}
		}
	}

	/// Applies the outcome of the request in flight and re-enables the button. Events arriving with nothing in flight
	/// are ignored.
	pub fn finish(&mut self, event: ShellEvent) {
		if !self.in_flight {
			log::warn!("ignoring a generation result with no request in flight");
			return;
		}
		self.in_flight = false;
		match event {
			ShellEvent::Finished(generated) => {
				self.status = STATUS_DONE.to_string();
				self.preview = Some(preview(&generated.image));
				self.preview_changed = true;
				self.saved_to = Some(generated.path);
			}
			ShellEvent::Failed(message) => {
				self.status = STATUS_FAILED.to_string();
				self.error = Some(message);
			}
		}
	}

	/// The status line.
	pub fn status(&self) -> &str {
		&self.status
	}

	/// Whether the generate button accepts presses.
	pub fn button_enabled(&self) -> bool {
		!self.in_flight
	}

	/// The latest preview, at most [`PREVIEW_SIZE`] on each edge.
	pub fn preview(&self) -> Option<&DynamicImage> {
		self.preview.as_ref()
	}

	/// Returns the latest preview once after each successful generation, for uploading to the display.
	pub fn take_new_preview(&mut self) -> Option<&DynamicImage> {
		if std::mem::take(&mut self.preview_changed) {
			self.preview.as_ref()
		} else {
			None
		}
	}

	/// Where the latest image was saved.
	pub fn saved_to(&self) -> Option<&PathBuf> {
		self.saved_to.as_ref()
	}

	/// The message the error dialog should show, if any.
	pub fn error(&self) -> Option<&str> {
		self.error.as_deref()
	}

	/// Closes the error dialog.
	pub fn dismiss_error(&mut self) {
		self.error = None;
	}
}

/// Scales `image` down to fit a [`PREVIEW_SIZE`] square, keeping its aspect ratio.
pub fn preview(image: &DynamicImage) -> DynamicImage {
	if image.width() <= PREVIEW_SIZE && image.height() <= PREVIEW_SIZE {
		image.clone()
	} else {
		image.thumbnail(PREVIEW_SIZE, PREVIEW_SIZE)
	}
}

/// Runs each request on its own thread and delivers the outcome as a [`ShellEvent`].
pub struct GenerationWorker<L: PipelineLoader + 'static> {
	service: Arc<GenerationService<L>>,
	sender: Sender<ShellEvent>,
	receiver: Receiver<ShellEvent>,
	notify: Arc<dyn Fn() + Send + Sync>
}

impl<L: PipelineLoader + 'static> GenerationWorker<L> {
	/// A worker for `service`. `notify` is called from the worker thread after each event is sent, to wake the UI.
	pub fn new(service: Arc<GenerationService<L>>, notify: impl Fn() + Send + Sync + 'static) -> Self {
		let (sender, receiver) = mpsc::channel();
		Self {
			service,
			sender,
			receiver,
			notify: Arc::new(notify)
		}
	}

	/// Whether the model is ready.
	pub fn is_loaded(&self) -> bool {
		self.service.is_loaded()
	}

	/// Starts generating `prompt` in the background.
	pub fn dispatch(&self, prompt: Prompt) {
		let service = Arc::clone(&self.service);
		let sender = self.sender.clone();
		let notify = Arc::clone(&self.notify);
		thread::spawn(move || {
			let event = match panic::catch_unwind(AssertUnwindSafe(|| service.generate(prompt.as_str()))) {
				Ok(Ok(generated)) => ShellEvent::Finished(generated),
				Ok(Err(e)) => ShellEvent::Failed(e.to_string()),
				Err(payload) => ShellEvent::Failed(format!("image generation failed: {}", panic_message(&*payload)))
			};
			if sender.send(event).is_err() {
				log::debug!("window closed before generation finished");
			}
			notify();
		});
	}

	/// Returns the next finished request, without blocking.
	pub fn try_recv(&self) -> Option<ShellEvent> {
		self.receiver.try_recv().ok()
	}

	/// Waits for the next finished request.
	pub fn recv(&self) -> Option<ShellEvent> {
		self.receiver.recv().ok()
	}
}
