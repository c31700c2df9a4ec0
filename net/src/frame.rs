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

//! Frame layer: every wire message is `[packed length][packed channel id]
//! [message bytes]`, the length counting everything after itself. Writers
//! reserve the largest possible packed length up front and fill it in once
//! the payload size is known; readers parse the length incrementally and
//! refuse to buffer frames above the configured bound.

use std::io;

use bytes::{Bytes, BytesMut};

use crate::core::ser::{
	packed_i32_size, BinWriter, Error as SerError, Reader, Writer, MAX_PACKED_INT32_BYTES,
};
use crate::transport::Stream;
use crate::types::Error;

/// Builds the full frame for a message already serialized (and filtered)
/// into `body`, enforcing the outgoing size bound.
pub(crate) fn encode_frame(
	channel_id: i32,
	body: &[u8],
	max_outgoing: usize,
) -> Result<Vec<u8>, Error> {
	let payload_len = packed_i32_size(channel_id) + body.len();
	if max_outgoing > 0 && payload_len > max_outgoing {
		return Err(Error::Connection(io::Error::new(
			io::ErrorKind::InvalidData,
			format!(
				"outgoing message of {} bytes exceeds the maximum of {} bytes",
				payload_len, max_outgoing
			),
		)));
	}

	let mut buf = Vec::with_capacity(MAX_PACKED_INT32_BYTES + payload_len);
	buf.extend_from_slice(&[0u8; MAX_PACKED_INT32_BYTES]);
	{
		let mut writer = BinWriter::new(&mut buf);
		writer
			.write_packed_i32(channel_id)
			.map_err(Error::Encode)?;
		writer.write_fixed_bytes(body).map_err(Error::Encode)?;
	}

	// back-fill the length into the tail of the reservation
	let mut prefix = Vec::with_capacity(MAX_PACKED_INT32_BYTES);
	{
		let mut writer = BinWriter::new(&mut prefix);
		writer
			.write_packed_i32(payload_len as i32)
			.map_err(Error::Encode)?;
	}
	let start = MAX_PACKED_INT32_BYTES - prefix.len();
	buf[start..MAX_PACKED_INT32_BYTES].copy_from_slice(&prefix);
	buf.drain(..start);
	Ok(buf)
}

// Adapts a shared Stream to the serialization Reader so the packed length
// can be parsed with the common bounded decoder.
struct StreamReader<'a> {
	stream: &'a Stream,
}

impl<'a> Reader for StreamReader<'a> {
	fn read_u8(&mut self) -> Result<u8, SerError> {
		let mut buf = [0u8; 1];
		self.stream.read_exact(&mut buf)?;
		Ok(buf[0])
	}
	fn read_u16(&mut self) -> Result<u16, SerError> {
		let mut buf = [0u8; 2];
		self.stream.read_exact(&mut buf)?;
		Ok(u16::from_be_bytes(buf))
	}
	fn read_u32(&mut self) -> Result<u32, SerError> {
		let mut buf = [0u8; 4];
		self.stream.read_exact(&mut buf)?;
		Ok(u32::from_be_bytes(buf))
	}
	fn read_u64(&mut self) -> Result<u64, SerError> {
		let mut buf = [0u8; 8];
		self.stream.read_exact(&mut buf)?;
		Ok(u64::from_be_bytes(buf))
	}
	fn read_fixed_bytes(&mut self, len: usize) -> Result<Vec<u8>, SerError> {
		let mut buf = vec![0u8; len];
		self.stream.read_exact(&mut buf)?;
		Ok(buf)
	}
}

fn ser_to_net(e: SerError) -> Error {
	match e {
		SerError::IOErr(io_err) => Error::Connection(io_err),
		other => Error::Decode(other),
	}
}

/// Reads one frame off the stream: the packed length, then exactly that
/// many bytes. The returned buffer starts at the packed channel id. The
/// second value is the total number of bytes consumed from the stream.
///
/// A frame longer than `max_incoming` (when non-zero) fails before its
/// body is buffered.
pub(crate) fn read_frame(stream: &Stream, max_incoming: usize) -> Result<(Bytes, u64), Error> {
	let len = {
		let mut reader = StreamReader { stream };
		reader.read_packed_i32().map_err(ser_to_net)?
	};
	if len <= 0 {
		return Err(Error::Decode(SerError::CorruptedData));
	}
	let len = len as usize;
	if max_incoming > 0 && len > max_incoming {
		return Err(Error::Connection(io::Error::new(
			io::ErrorKind::InvalidData,
			format!(
				"incoming message of {} bytes exceeds the maximum of {} bytes",
				len, max_incoming
			),
		)));
	}

	let mut buf = BytesMut::with_capacity(len);
	buf.resize(len, 0);
	stream
		.read_exact(&mut buf[..])
		.map_err(Error::Connection)?;
	let total = (packed_i32_size(len as i32) + len) as u64;
	Ok((buf.freeze(), total))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::ser::BufReader;

	#[test]
	fn frame_layout() {
		let body = b"payload".to_vec();
		let frame = encode_frame(7, &body, 0).unwrap();

		let mut reader = BufReader::new(&frame);
		let len = reader.read_packed_i32().unwrap() as usize;
		// the length covers the channel id and the body, nothing else
		assert_eq!(len, reader.remaining());
		assert_eq!(reader.read_packed_i32().unwrap(), 7);
		assert_eq!(reader.read_fixed_bytes(body.len()).unwrap(), body);
		assert_eq!(reader.remaining(), 0);
	}

	#[test]
	fn frame_length_counts_channel_id() {
		// channel 0 packs to one byte
		let frame = encode_frame(0, &[1, 2, 3], 0).unwrap();
		let mut reader = BufReader::new(&frame);
		assert_eq!(reader.read_packed_i32().unwrap(), 4);
	}

	#[test]
	fn wide_channel_ids_are_framed() {
		let frame = encode_frame(i32::max_value(), &[0xAB; 64], 0).unwrap();
		let mut reader = BufReader::new(&frame);
		let len = reader.read_packed_i32().unwrap() as usize;
		assert_eq!(len, reader.remaining());
		assert_eq!(reader.read_packed_i32().unwrap(), i32::max_value());
	}

	#[test]
	fn outgoing_size_guard() {
		let body = vec![0u8; 1024];
		// one byte of packed channel id pushes this over the limit
		match encode_frame(0, &body, 1024) {
			Err(Error::Connection(e)) => {
				assert_eq!(e.kind(), io::ErrorKind::InvalidData);
			}
			other => panic!("expected connection error, got {:?}", other),
		}
		assert!(encode_frame(0, &body, 1025).is_ok());
		assert!(encode_frame(0, &body, 0).is_ok());
	}
}
