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
	sync::{atomic::Ordering, Arc},
	thread
};

use diffusion_desk::{config::AppConfig, Error, GenerationService, PipelineManager, PipelineState, Txt2ImgOptions};

mod common;
use self::common::FakeLoader;

fn service(loader: &FakeLoader, output: &std::path::Path) -> GenerationService<FakeLoader> {
	let options = Txt2ImgOptions::default().with_size(64, 48).with_steps(2);
	GenerationService::with_options(Arc::new(PipelineManager::new(loader.clone())), options, output)
}

#[test]
fn empty_prompts_never_touch_the_model() {
	let dir = tempfile::tempdir().unwrap();
	let loader = FakeLoader::default();
	let service = service(&loader, &dir.path().join("output.png"));

	for prompt in ["", "   ", "\n\t", " , ,"] {
		assert!(matches!(service.generate(prompt), Err(Error::EmptyPrompt)));
	}
	assert_eq!(loader.loads(), 0);
	assert!(!service.is_loaded());
	assert!(!dir.path().join("output.png").exists());
}

#[test]
fn generation_loads_on_demand_and_writes_png() {
	let dir = tempfile::tempdir().unwrap();
	let output = dir.path().join("output.png");
	let loader = FakeLoader::default();
	let service = service(&loader, &output);
	assert!(!service.is_loaded());

	let generated = service.generate("a lighthouse at dusk").unwrap();
	assert!(service.is_loaded());
	assert_eq!(service.manager().state(), PipelineState::Loaded);
	assert_eq!(generated.path, output);
	assert_eq!((generated.image.width(), generated.image.height()), (64, 48));

	let saved = image::open(&output).unwrap();
	assert_eq!((saved.width(), saved.height()), (64, 48));
	assert_eq!(saved.to_rgb8(), generated.image.to_rgb8());

	let pipeline = service.manager().load().unwrap();
	assert_eq!(pipeline.generations.load(Ordering::SeqCst), 1);
	assert_eq!(pipeline.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn later_generations_overwrite_the_output() {
	let dir = tempfile::tempdir().unwrap();
	let output = dir.path().join("output.png");
	let loader = FakeLoader::default();
	let service = service(&loader, &output);

	service.generate("first").unwrap();
	let second = service.generate("second").unwrap();
	assert_eq!(image::open(&output).unwrap().to_rgb8(), second.image.to_rgb8());
	assert_eq!(loader.loads(), 1);
}

#[test]
fn explicit_paths_create_parent_directories() {
	let dir = tempfile::tempdir().unwrap();
	let loader = FakeLoader::default();
	let service = service(&loader, &dir.path().join("output.png"));

	let nested = dir.path().join("renders/2024/fox.png");
	let generated = service.generate_to("a red fox", &nested).unwrap();
	assert_eq!(generated.path, nested);
	assert!(nested.is_file());
	assert!(!dir.path().join("output.png").exists());
}

#[test]
fn fixed_seeds_are_reported_and_reproducible() {
	let dir = tempfile::tempdir().unwrap();
	let options = Txt2ImgOptions::default().with_size(16, 16).with_seed(42);
	let service = GenerationService::with_options(Arc::new(PipelineManager::new(FakeLoader::default())), options, dir.path().join("a.png"));

	let a = service.generate("same").unwrap();
	let b = service.generate_to("same", dir.path().join("b.png")).unwrap();
	assert_eq!(a.seed, 42);
	assert_eq!(a.image.to_rgb8(), b.image.to_rgb8());
}

#[test]
fn inference_failure_still_releases_memory() {
	let dir = tempfile::tempdir().unwrap();
	let loader = FakeLoader {
		fail_generation: true,
		..Default::default()
	};
	let service = service(&loader, &dir.path().join("output.png"));

	match service.generate("a lighthouse") {
		Err(Error::Inference(message)) => assert!(message.contains("out of memory")),
		other => panic!("unexpected result: {other:?}")
	}
	let pipeline = service.manager().load().unwrap();
	assert_eq!(pipeline.releases.load(Ordering::SeqCst), 1);
	assert!(service.is_loaded());
}

#[test]
fn pipeline_panics_become_inference_errors() {
	let dir = tempfile::tempdir().unwrap();
	let loader = FakeLoader {
		panic_generation: true,
		..Default::default()
	};
	let service = service(&loader, &dir.path().join("output.png"));

	match service.generate("a lighthouse") {
		Err(Error::Inference(message)) => assert!(message.contains("latent shape mismatch")),
		other => panic!("unexpected result: {other:?}")
	}
	let pipeline = service.manager().load().unwrap();
	assert_eq!(pipeline.releases.load(Ordering::SeqCst), 1);
	// the gate is still usable
	assert!(matches!(service.generate("again"), Err(Error::Inference(_))));
}

#[test]
fn load_failure_surfaces_as_model_load() {
	let dir = tempfile::tempdir().unwrap();
	let loader = FakeLoader {
		fail_load: true,
		..Default::default()
	};
	let service = service(&loader, &dir.path().join("output.png"));

	assert!(matches!(service.generate("a fox"), Err(Error::ModelLoad { .. })));
	assert!(matches!(service.generate("a fox"), Err(Error::ModelLoad { .. })));
	assert_eq!(loader.loads(), 1);
}

#[test]
fn concurrent_requests_are_serialized() {
	let dir = tempfile::tempdir().unwrap();
	let loader = FakeLoader::default();
	let service = Arc::new(service(&loader, &dir.path().join("output.png")));

	let handles: Vec<_> = (0..4)
		.map(|i| {
			let service = Arc::clone(&service);
			let path = dir.path().join(format!("{i}.png"));
			thread::spawn(move || service.generate_to(format!("prompt {i}"), path).unwrap())
		})
		.collect();
	for handle in handles {
		assert!(handle.join().unwrap().path.is_file());
	}

	let pipeline = service.manager().load().unwrap();
	assert_eq!(pipeline.generations.load(Ordering::SeqCst), 4);
	assert_eq!(pipeline.releases.load(Ordering::SeqCst), 4);
	assert_eq!(loader.loads(), 1);
}

#[test]
fn service_uses_configured_output_path() {
	let dir = tempfile::tempdir().unwrap();
	let mut config = AppConfig::default();
	config.output_path = dir.path().join("configured.png");
	config.generation.width = 32;
	config.generation.height = 32;
	let service = GenerationService::new(Arc::new(PipelineManager::new(FakeLoader::default())), &config);

	let generated = service.generate("a quiet harbour").unwrap();
	assert_eq!(generated.path, config.output_path);
	assert_eq!(generated.image.width(), 32);
}
