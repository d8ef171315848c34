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
	path::PathBuf,
	sync::{mpsc, Arc},
	time::Duration
};

use diffusion_desk::{
	shell::{GenerationWorker, ShellEvent, ShellState, STATUS_DONE, STATUS_EMPTY_PROMPT, STATUS_GENERATING, STATUS_FAILED, STATUS_LOADING},
	GenerationService, Generated, PipelineManager, Txt2ImgOptions
};
use image::{DynamicImage, RgbImage};

mod common;
use self::common::FakeLoader;

fn generated(width: u32, height: u32) -> Generated {
	Generated {
		image: DynamicImage::ImageRgb8(RgbImage::new(width, height)),
		path: PathBuf::from("output.png"),
		seed: 1,
		elapsed: Duration::from_secs(1)
	}
}

#[test]
fn empty_prompt_is_rejected_without_disabling_the_button() {
	let mut state = ShellState::new();
	assert!(state.submit("   ", false).is_none());
	assert_eq!(state.status(), STATUS_EMPTY_PROMPT);
	assert!(state.button_enabled());
}

#[test]
fn button_is_disabled_exactly_while_in_flight() {
	let mut state = ShellState::new();

	let prompt = state.submit("a red fox", false).unwrap();
	assert_eq!(&*prompt, "a red fox");
	assert_eq!(state.status(), STATUS_LOADING);
	assert!(!state.button_enabled());
	assert!(state.submit("another", true).is_none());

	state.finish(ShellEvent::Finished(generated(1024, 768)));
	assert!(state.button_enabled());
	assert_eq!(state.status(), STATUS_DONE);
	assert_eq!(state.preview().map(|p| (p.width(), p.height())), Some((512, 384)));
	assert!(state.take_new_preview().is_some());
	assert!(state.take_new_preview().is_none());

	assert!(state.submit("again", true).is_some());
	assert_eq!(state.status(), STATUS_GENERATING);
}

#[test]
fn failures_reenable_the_button_and_raise_the_dialog() {
	let mut state = ShellState::new();
	state.submit("a red fox", true).unwrap();
	state.finish(ShellEvent::Failed("image generation failed: out of memory".to_string()));

	assert!(state.button_enabled());
	assert_eq!(state.error(), Some("image generation failed: out of memory"));
	state.dismiss_error();
	assert!(state.error().is_none());

	// a duplicate result does not flip anything
	state.finish(ShellEvent::Finished(generated(8, 8)));
	assert!(state.preview().is_none());
}

#[test]
fn worker_reports_back_and_wakes_the_ui() {
	let dir = tempfile::tempdir().unwrap();
	let service = Arc::new(GenerationService::with_options(
		Arc::new(PipelineManager::new(FakeLoader::default())),
		Txt2ImgOptions::default().with_size(32, 32),
		dir.path().join("output.png")
	));
	let (woken, wakeups) = mpsc::channel();
	let worker = GenerationWorker::new(service, move || {
		let _ = woken.send(());
	});

	let mut state = ShellState::new();
	let prompt = state.submit("a lighthouse", worker.is_loaded()).unwrap();
	assert_eq!(state.status(), STATUS_LOADING);
	worker.dispatch(prompt);

	wakeups.recv_timeout(Duration::from_secs(10)).unwrap();
	let event = worker.try_recv().unwrap();
	state.finish(event);
	assert_eq!(state.status(), STATUS_DONE);
	assert!(worker.is_loaded());
	assert!(dir.path().join("output.png").is_file());

	let prompt = state.submit("a lighthouse at night", worker.is_loaded()).unwrap();
	assert_eq!(state.status(), STATUS_GENERATING);
	worker.dispatch(prompt);
	let event = worker.recv().unwrap();
	state.finish(event);
	assert!(state.button_enabled());
}

#[test]
fn worker_reports_crashed_generations_as_failures() {
	let dir = tempfile::tempdir().unwrap();
	let loader = FakeLoader {
		panic_generation: true,
		..Default::default()
	};
	let service = Arc::new(GenerationService::with_options(
		Arc::new(PipelineManager::new(loader)),
		Txt2ImgOptions::default().with_size(32, 32),
		dir.path().join("output.png")
	));
	let (woken, wakeups) = mpsc::channel();
	let worker = GenerationWorker::new(service, move || {
		let _ = woken.send(());
	});

	let mut state = ShellState::new();
	worker.dispatch(state.submit("a lighthouse", worker.is_loaded()).unwrap());
	wakeups.recv_timeout(Duration::from_secs(10)).unwrap();
	state.finish(worker.try_recv().unwrap());

	assert!(state.button_enabled());
	assert_eq!(state.status(), STATUS_FAILED);
	assert!(state.error().unwrap().contains("latent shape mismatch"));
	assert!(!dir.path().join("output.png").exists());
}
