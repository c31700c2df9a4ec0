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

//! Serialization and deserialization layer specialized for binary encoding.
//! Ensures consistency and safety over the grid wire format.
//!
//! To use it simply implement `Writeable` or `Readable` and then use the
//! `serialize` or `deserialize` functions on them as appropriate.
//!
//! Multi-byte integers are big-endian. Variable-length integers use the
//! packed format: little-endian 7-bit groups with a continuation bit, the
//! first byte carrying six value bits plus the sign in bit 0x40. A negative
//! value is complemented once up front, then its magnitude continues.

use std::fmt;
use std::io;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Maximum number of bytes an encoded packed 32-bit integer may occupy.
pub const MAX_PACKED_INT32_BYTES: usize = 5;

/// Maximum number of bytes an encoded packed 64-bit integer may occupy.
pub const MAX_PACKED_INT64_BYTES: usize = 10;

/// Possible errors deriving from serializing or deserializing.
#[derive(Debug)]
pub enum Error {
	/// Wraps an io error produced when reading or writing
	IOErr(io::Error),
	/// Data wasn't in a consumable format
	CorruptedData,
	/// A packed integer ran past its maximum encoded size
	PackedOverflow {
		/// the encoded size cap that was exceeded
		max_bytes: usize,
	},
	/// When asked to read too much data
	TooLargeRead(u64),
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::IOErr(e)
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::IOErr(e) => write!(f, "io error: {}", e),
			Error::CorruptedData => write!(f, "corrupted data"),
			Error::PackedOverflow { max_bytes } => {
				write!(f, "packed integer longer than {} bytes", max_bytes)
			}
			Error::TooLargeRead(len) => write!(f, "refusing to read {} bytes", len),
		}
	}
}

impl std::error::Error for Error {}

/// Implementations defined how different numbers and binary structures are
/// written to an underlying stream or container (depending on implementation).
pub trait Writer {
	/// Writes a u8 as bytes
	fn write_u8(&mut self, n: u8) -> Result<(), Error>;

	/// Writes a u16 as bytes
	fn write_u16(&mut self, n: u16) -> Result<(), Error>;

	/// Writes a u32 as bytes
	fn write_u32(&mut self, n: u32) -> Result<(), Error>;

	/// Writes a u64 as bytes
	fn write_u64(&mut self, n: u64) -> Result<(), Error>;

	/// Writes a fixed number of bytes. The reader is expected to know the
	/// actual length on read.
	fn write_fixed_bytes(&mut self, bytes: &[u8]) -> Result<(), Error>;

	/// Writes an i32 in the packed variable-length encoding.
	fn write_packed_i32(&mut self, n: i32) -> Result<(), Error> {
		let mut b = 0u32;
		let mut n = n;
		if n < 0 {
			b = 0x40;
			n = !n;
		}
		b |= (n as u32) & 0x3F;
		let mut n = (n as u32) >> 6;
		while n != 0 {
			self.write_u8((b | 0x80) as u8)?;
			b = n & 0x7F;
			n >>= 7;
		}
		self.write_u8(b as u8)
	}

	/// Writes an i64 in the packed variable-length encoding.
	fn write_packed_i64(&mut self, n: i64) -> Result<(), Error> {
		let mut b = 0u64;
		let mut n = n;
		if n < 0 {
			b = 0x40;
			n = !n;
		}
		b |= (n as u64) & 0x3F;
		let mut n = (n as u64) >> 6;
		while n != 0 {
			self.write_u8((b | 0x80) as u8)?;
			b = n & 0x7F;
			n >>= 7;
		}
		self.write_u8(b as u8)
	}

	/// Writes a variable length byte vector, prefixing it with its packed length.
	fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
		self.write_packed_i32(bytes.len() as i32)?;
		self.write_fixed_bytes(bytes)
	}

	/// Writes a length-prefixed UTF-8 string.
	fn write_string(&mut self, s: &str) -> Result<(), Error> {
		self.write_bytes(s.as_bytes())
	}
}

/// Implementations defined how different numbers and binary structures are
/// read from an underlying stream or container (depending on implementation).
pub trait Reader {
	/// Read a u8 from the underlying Read
	fn read_u8(&mut self) -> Result<u8, Error>;

	/// Read a u16 from the underlying Read
	fn read_u16(&mut self) -> Result<u16, Error>;

	/// Read a u32 from the underlying Read
	fn read_u32(&mut self) -> Result<u32, Error>;

	/// Read a u64 from the underlying Read
	fn read_u64(&mut self) -> Result<u64, Error>;

	/// Read a fixed number of bytes from the underlying reader.
	fn read_fixed_bytes(&mut self, len: usize) -> Result<Vec<u8>, Error>;

	/// Reads a packed i32, refusing to consume more than five bytes.
	fn read_packed_i32(&mut self) -> Result<i32, Error> {
		let b = u32::from(self.read_u8()?);
		let neg = b & 0x40 != 0;
		let mut n = b & 0x3F;
		let mut shift = 6;
		let mut more = b & 0x80 != 0;
		let mut count = 1;
		while more {
			if count >= MAX_PACKED_INT32_BYTES {
				return Err(Error::PackedOverflow {
					max_bytes: MAX_PACKED_INT32_BYTES,
				});
			}
			let b = u32::from(self.read_u8()?);
			n |= (b & 0x7F) << shift;
			shift += 7;
			more = b & 0x80 != 0;
			count += 1;
		}
		let n = n as i32;
		Ok(if neg { !n } else { n })
	}

	/// Reads a packed i64, refusing to consume more than ten bytes.
	fn read_packed_i64(&mut self) -> Result<i64, Error> {
		let b = u64::from(self.read_u8()?);
		let neg = b & 0x40 != 0;
		let mut n = b & 0x3F;
		let mut shift = 6;
		let mut more = b & 0x80 != 0;
		let mut count = 1;
		while more {
			if count >= MAX_PACKED_INT64_BYTES {
				return Err(Error::PackedOverflow {
					max_bytes: MAX_PACKED_INT64_BYTES,
				});
			}
			let b = u64::from(self.read_u8()?);
			n |= (b & 0x7F) << shift;
			shift += 7;
			more = b & 0x80 != 0;
			count += 1;
		}
		let n = n as i64;
		Ok(if neg { !n } else { n })
	}

	/// Reads a length-prefixed byte vector. The length must be non-negative
	/// and, when `max_len` is non-zero, no larger than `max_len`.
	fn read_bytes(&mut self, max_len: usize) -> Result<Vec<u8>, Error> {
		let len = self.read_packed_i32()?;
		if len < 0 {
			return Err(Error::CorruptedData);
		}
		let len = len as usize;
		if max_len > 0 && len > max_len {
			return Err(Error::TooLargeRead(len as u64));
		}
		self.read_fixed_bytes(len)
	}

	/// Reads a length-prefixed UTF-8 string.
	fn read_string(&mut self, max_len: usize) -> Result<String, Error> {
		let bytes = self.read_bytes(max_len)?;
		String::from_utf8(bytes).map_err(|_| Error::CorruptedData)
	}
}

/// Trait that every type that can be serialized as binary must implement.
/// Writes directly to a Writer, a utility type thinly wrapping an
/// underlying Write implementation.
pub trait Writeable {
	/// Write the data held by this Writeable to the provided writer
	fn write(&self, writer: &mut dyn Writer) -> Result<(), Error>;
}

/// Trait that every type that can be deserialized from binary must implement.
/// Reads directly to a Reader, a utility type thinly wrapping an
/// underlying Read implementation.
pub trait Readable: Sized {
	/// Reads the data necessary to this Readable from the provided reader
	fn read(reader: &mut dyn Reader) -> Result<Self, Error>;
}

/// Deserializes a Readable from any std::io::Read implementation.
pub fn deserialize<T: Readable>(source: &mut dyn Read) -> Result<T, Error> {
	let mut reader = BinReader::new(source);
	T::read(&mut reader)
}

/// Serializes a Writeable into any std::io::Write implementation.
pub fn serialize(sink: &mut dyn Write, thing: &dyn Writeable) -> Result<(), Error> {
	let mut writer = BinWriter::new(sink);
	thing.write(&mut writer)
}

/// Utility function to serialize a writeable directly in memory using a
/// Vec<u8>.
pub fn ser_vec(thing: &dyn Writeable) -> Result<Vec<u8>, Error> {
	let mut vec = Vec::with_capacity(64);
	serialize(&mut vec, thing)?;
	Ok(vec)
}

/// Utility wrapper for an underlying byte Reader. Defines higher level
/// methods to read numbers, byte vectors, strings, etc.
pub struct BinReader<'a> {
	source: &'a mut dyn Read,
}

impl<'a> BinReader<'a> {
	/// Constructor for a new BinReader for the provided source
	pub fn new(source: &'a mut dyn Read) -> BinReader<'a> {
		BinReader { source }
	}
}

impl<'a> Reader for BinReader<'a> {
	fn read_u8(&mut self) -> Result<u8, Error> {
		self.source.read_u8().map_err(Error::IOErr)
	}
	fn read_u16(&mut self) -> Result<u16, Error> {
		self.source.read_u16::<BigEndian>().map_err(Error::IOErr)
	}
	fn read_u32(&mut self) -> Result<u32, Error> {
		self.source.read_u32::<BigEndian>().map_err(Error::IOErr)
	}
	fn read_u64(&mut self) -> Result<u64, Error> {
		self.source.read_u64::<BigEndian>().map_err(Error::IOErr)
	}
	fn read_fixed_bytes(&mut self, len: usize) -> Result<Vec<u8>, Error> {
		let mut buf = vec![0u8; len];
		self.source.read_exact(&mut buf)?;
		Ok(buf)
	}
}

/// A Reader over an in-memory byte slice, tracking how much it consumed.
pub struct BufReader<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> BufReader<'a> {
	/// Wraps the provided byte slice
	pub fn new(data: &'a [u8]) -> BufReader<'a> {
		BufReader { data, pos: 0 }
	}

	/// Number of bytes consumed so far
	pub fn bytes_read(&self) -> usize {
		self.pos
	}

	/// Number of bytes left unread
	pub fn remaining(&self) -> usize {
		self.data.len() - self.pos
	}

	fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
		if self.remaining() < len {
			return Err(Error::IOErr(io::Error::new(
				io::ErrorKind::UnexpectedEof,
				"buffer underrun",
			)));
		}
		let out = &self.data[self.pos..self.pos + len];
		self.pos += len;
		Ok(out)
	}
}

impl<'a> Reader for BufReader<'a> {
	fn read_u8(&mut self) -> Result<u8, Error> {
		Ok(self.take(1)?[0])
	}
	fn read_u16(&mut self) -> Result<u16, Error> {
		let b = self.take(2)?;
		Ok(u16::from_be_bytes([b[0], b[1]]))
	}
	fn read_u32(&mut self) -> Result<u32, Error> {
		let b = self.take(4)?;
		Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
	}
	fn read_u64(&mut self) -> Result<u64, Error> {
		let b = self.take(8)?;
		Ok(u64::from_be_bytes([
			b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
		]))
	}
	fn read_fixed_bytes(&mut self, len: usize) -> Result<Vec<u8>, Error> {
		Ok(self.take(len)?.to_vec())
	}
}

/// Utility wrapper for an underlying byte Writer. Defines higher level
/// methods to write numbers, byte vectors, strings, etc.
pub struct BinWriter<'a> {
	sink: &'a mut dyn Write,
}

impl<'a> BinWriter<'a> {
	/// Wraps a standard Write in a new BinWriter
	pub fn new(sink: &'a mut dyn Write) -> BinWriter<'a> {
		BinWriter { sink }
	}
}

impl<'a> Writer for BinWriter<'a> {
	fn write_u8(&mut self, n: u8) -> Result<(), Error> {
		self.sink.write_u8(n).map_err(Error::IOErr)
	}
	fn write_u16(&mut self, n: u16) -> Result<(), Error> {
		self.sink.write_u16::<BigEndian>(n).map_err(Error::IOErr)
	}
	fn write_u32(&mut self, n: u32) -> Result<(), Error> {
		self.sink.write_u32::<BigEndian>(n).map_err(Error::IOErr)
	}
	fn write_u64(&mut self, n: u64) -> Result<(), Error> {
		self.sink.write_u64::<BigEndian>(n).map_err(Error::IOErr)
	}
	fn write_fixed_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
		self.sink.write_all(bytes).map_err(Error::IOErr)
	}
}

/// Returns the number of bytes the packed encoding of `n` occupies,
/// without writing anything.
pub fn packed_i32_size(n: i32) -> usize {
	let mut size = 1;
	let n = if n < 0 { !n } else { n };
	let mut n = (n as u32) >> 6;
	while n != 0 {
		size += 1;
		n >>= 7;
	}
	size
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pack_i32(n: i32) -> Vec<u8> {
		let mut vec = vec![];
		{
			let mut w = BinWriter::new(&mut vec);
			w.write_packed_i32(n).unwrap();
		}
		vec
	}

	fn pack_i64(n: i64) -> Vec<u8> {
		let mut vec = vec![];
		{
			let mut w = BinWriter::new(&mut vec);
			w.write_packed_i64(n).unwrap();
		}
		vec
	}

	#[test]
	fn packed_i32_known_encodings() {
		assert_eq!(pack_i32(0), vec![0x00]);
		assert_eq!(pack_i32(1), vec![0x01]);
		assert_eq!(pack_i32(-1), vec![0x40]);
		assert_eq!(pack_i32(63), vec![0x3F]);
		assert_eq!(pack_i32(64), vec![0x80, 0x01]);
		assert_eq!(pack_i32(-65), vec![0xC0, 0x01]);
		assert_eq!(pack_i32(i32::max_value()).len(), 5);
		assert_eq!(pack_i32(i32::min_value()).len(), 5);
	}

	#[test]
	fn packed_i32_round_trip() {
		let cases = [
			0,
			1,
			-1,
			63,
			64,
			-64,
			-65,
			8192,
			-8192,
			1 << 20,
			-(1 << 20),
			i32::max_value(),
			i32::min_value(),
			i32::max_value() - 1,
			i32::min_value() + 1,
		];
		for n in cases.iter() {
			let buf = pack_i32(*n);
			assert!(buf.len() <= MAX_PACKED_INT32_BYTES);
			let mut r = BufReader::new(&buf);
			assert_eq!(r.read_packed_i32().unwrap(), *n, "value {}", n);
			assert_eq!(r.remaining(), 0);
		}
	}

	#[test]
	fn packed_i64_round_trip() {
		let cases = [
			0i64,
			-1,
			63,
			64,
			1 << 35,
			-(1 << 35),
			i64::from(i32::max_value()) + 1,
			i64::from(i32::min_value()) - 1,
			i64::max_value(),
			i64::min_value(),
		];
		for n in cases.iter() {
			let buf = pack_i64(*n);
			assert!(buf.len() <= MAX_PACKED_INT64_BYTES);
			let mut r = BufReader::new(&buf);
			assert_eq!(r.read_packed_i64().unwrap(), *n, "value {}", n);
			assert_eq!(r.remaining(), 0);
		}
	}

	#[test]
	fn packed_decode_is_bounded() {
		// five continuation bytes push an i32 past its cap
		let buf = [0x80u8, 0x80, 0x80, 0x80, 0x80, 0x01];
		let mut r = BufReader::new(&buf);
		match r.read_packed_i32() {
			Err(Error::PackedOverflow { max_bytes: 5 }) => {}
			other => panic!("expected overflow, got {:?}", other),
		}

		// ten continuation bytes push an i64 past its cap
		let buf = [0x80u8; 11];
		let mut r = BufReader::new(&buf);
		match r.read_packed_i64() {
			Err(Error::PackedOverflow { max_bytes: 10 }) => {}
			other => panic!("expected overflow, got {:?}", other),
		}
	}

	#[test]
	fn packed_size_matches_encoding() {
		for n in [0, 1, -1, 63, 64, -65, 1 << 13, i32::max_value(), i32::min_value()].iter() {
			assert_eq!(packed_i32_size(*n), pack_i32(*n).len(), "value {}", n);
		}
	}

	#[test]
	fn bytes_round_trip() {
		let mut vec = vec![];
		{
			let mut w = BinWriter::new(&mut vec);
			w.write_bytes(b"grid").unwrap();
			w.write_string("link").unwrap();
		}
		let mut r = BufReader::new(&vec);
		assert_eq!(r.read_bytes(0).unwrap(), b"grid");
		assert_eq!(r.read_string(0).unwrap(), "link");
	}

	#[test]
	fn bounded_bytes_read() {
		let mut vec = vec![];
		{
			let mut w = BinWriter::new(&mut vec);
			w.write_bytes(&[0u8; 128]).unwrap();
		}
		let mut r = BufReader::new(&vec);
		match r.read_bytes(64) {
			Err(Error::TooLargeRead(128)) => {}
			other => panic!("expected too-large error, got {:?}", other),
		}
	}
}
