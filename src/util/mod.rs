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

pub(crate) mod interpolation;
pub mod prompting;

use std::any::Any;

/// Extracts the message of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		(*message).to_string()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"unknown panic".to_string()
	}
}

#[cfg(test)]
mod tests {
	use std::panic;

	use super::panic_message;

	#[test]
	fn panic_payloads_become_messages() {
		let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
		assert_eq!(panic_message(&*payload), "static");
		let payload = panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
		assert_eq!(panic_message(&*payload), "formatted 7");
		let payload = panic::catch_unwind(|| panic::panic_any(3_u8)).unwrap_err();
		assert_eq!(panic_message(&*payload), "unknown panic");
	}
}
