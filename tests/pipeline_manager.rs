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

use std::{sync::Arc, thread, time::Duration};

use diffusion_desk::{Error, PipelineManager, PipelineState};

mod common;
use self::common::FakeLoader;

#[test]
fn starts_unloaded() {
	let manager = PipelineManager::new(FakeLoader::default());
	assert!(!manager.is_loaded());
	assert_eq!(manager.state(), PipelineState::Unloaded);
}

#[test]
fn load_is_idempotent() {
	let loader = FakeLoader::default();
	let manager = PipelineManager::new(loader.clone());

	let first = manager.load().unwrap();
	let second = manager.load().unwrap();
	assert!(Arc::ptr_eq(&first, &second));
	assert!(manager.is_loaded());
	assert_eq!(manager.state(), PipelineState::Loaded);
	assert_eq!(loader.loads(), 1);
}

#[test]
fn concurrent_loads_construct_once() {
	let loader = FakeLoader {
		delay: Duration::from_millis(50),
		..Default::default()
	};
	let manager = Arc::new(PipelineManager::new(loader.clone()));

	let handles: Vec<_> = (0..8)
		.map(|_| {
			let manager = Arc::clone(&manager);
			thread::spawn(move || manager.load().unwrap())
		})
		.collect();
	let pipelines: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

	assert_eq!(loader.loads(), 1);
	assert!(pipelines.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}

#[test]
fn failed_load_is_sticky() {
	let loader = FakeLoader {
		fail_load: true,
		..Default::default()
	};
	let manager = PipelineManager::new(loader.clone());

	for _ in 0..3 {
		match manager.load() {
			Err(Error::ModelLoad { model, message }) => {
				assert_eq!(model, "test/model");
				assert!(message.contains("unet/model.onnx"));
			}
			Err(other) => panic!("unexpected error: {other}"),
			Ok(_) => panic!("load should have failed")
		}
	}
	assert_eq!(loader.loads(), 1);
	assert!(!manager.is_loaded());
	assert!(matches!(manager.state(), PipelineState::Failed(message) if message.contains("missing")));
}

#[test]
fn panicking_loader_fails_instead_of_hanging() {
	let loader = FakeLoader {
		panic_load: true,
		..Default::default()
	};
	let manager = Arc::new(PipelineManager::new(loader.clone()));

	let first = {
		let manager = Arc::clone(&manager);
		thread::spawn(move || manager.load().map(|_| ()))
	};
	match first.join().unwrap() {
		Err(Error::ModelLoad { message, .. }) => assert!(message.contains("failed to initialize the runtime")),
		other => panic!("unexpected result: {other:?}")
	}
	assert!(matches!(manager.state(), PipelineState::Failed(message) if message.contains("panicked")));

	// later callers see the failure instead of waiting on the load
	let (done, finished) = std::sync::mpsc::channel();
	let second = Arc::clone(&manager);
	thread::spawn(move || {
		let _ = done.send(second.load().is_err());
	});
	assert!(finished.recv_timeout(Duration::from_secs(5)).unwrap());
	assert_eq!(loader.loads(), 1);
}
