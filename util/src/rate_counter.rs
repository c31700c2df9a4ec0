// Copyright 2024 The GridLink Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Utility to track the rate of data transfers

use std::time::{SystemTime, UNIX_EPOCH};

struct Entry {
	bytes: u64,
	time_millis: u64,
}

/// A rate counter tracks the number of transfers, the amount of data
/// exchanged and the rate of transfer over the last minute. The counter
/// does not try to be accurate and update times proactively, instead it
/// only does so lazily. As a result, produced rates are worst-case
/// estimates.
pub struct RateCounter {
	last_min: Vec<Entry>,
}

impl RateCounter {
	/// Instantiate a new rate counter
	pub fn new() -> RateCounter {
		RateCounter { last_min: vec![] }
	}

	/// Increments number of bytes transferred, updating counts and rates.
	pub fn inc(&mut self, bytes: u64) {
		let now_millis = millis_since_epoch();
		self.last_min.push(Entry {
			bytes,
			time_millis: now_millis,
		});
		while !self.last_min.is_empty() && self.last_min[0].time_millis + 60_000 < now_millis {
			self.last_min.remove(0);
		}
	}

	/// Number of bytes counted in the last minute
	pub fn bytes_per_min(&self) -> u64 {
		self.last_min.iter().map(|e| e.bytes).sum()
	}

	/// Count of transfers in the last minute
	pub fn count_per_min(&self) -> u64 {
		self.last_min.len() as u64
	}
}

impl Default for RateCounter {
	fn default() -> RateCounter {
		RateCounter::new()
	}
}

// turns out getting the millisecs since epoch in Rust isn't as easy as it
// could be
fn millis_since_epoch() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|since_epoch| since_epoch.as_secs() * 1000 + u64::from(since_epoch.subsec_millis()))
		.unwrap_or(0)
}
