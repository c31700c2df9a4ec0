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

//! Implements hex-encoding from bytes to string and decoding of strings
//! to bytes. Simple enough that we can just have our own, used mostly
//! for byte-level message dumps in debug logs.

use std::fmt::Write;

/// Encode the provided bytes into a hex string
pub fn to_hex(bytes: &[u8]) -> String {
	let mut s = String::with_capacity(bytes.len() * 2);
	for byte in bytes {
		write!(&mut s, "{:02x}", byte).expect("hex format");
	}
	s
}

/// Decode a hex string into bytes.
pub fn from_hex(hex_str: &str) -> Result<Vec<u8>, std::num::ParseIntError> {
	let hex_trim = if hex_str.starts_with("0x") {
		&hex_str[2..]
	} else {
		hex_str
	};
	(0..hex_trim.len() / 2)
		.map(|i| u8::from_str_radix(&hex_trim[2 * i..2 * i + 2], 16))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hex_round_trip() {
		let b = vec![0u8, 5, 0xac, 0x1e, 0xff];
		assert_eq!(to_hex(&b), "0005ac1eff");
		assert_eq!(from_hex("0005ac1eff").unwrap(), b);
		assert_eq!(from_hex("0x0005ac1eff").unwrap(), b);
	}
}
