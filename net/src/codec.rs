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

//! Message (de)serialization seams. The `Codec` turns one message into the
//! bytes that follow the channel id inside a frame and back, delegating the
//! payload to the channel's `Serializer`. An ordered chain of
//! `StreamFilter`s can transform those bytes symmetrically in both
//! directions (compression, obfuscation and the like).

use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::Channel;
use crate::core::ser::{Error as SerError, Reader, Writer};
use crate::msg::Message;
use crate::protocol::MessageFactory;
use crate::types::Error;

/// Serializes and deserializes message payloads for one channel. The
/// default implementation speaks the binary grid format; replacing it on a
/// channel swaps the payload representation without touching framing.
pub trait Serializer: Send + Sync {
	/// Writes the type id and body of `message`.
	fn serialize(&self, writer: &mut dyn Writer, message: &dyn Message) -> Result<(), SerError>;

	/// Reads a type id, materializes the message through `factory` and
	/// fills its body.
	fn deserialize(
		&self,
		reader: &mut dyn Reader,
		factory: &dyn MessageFactory,
	) -> Result<Box<dyn Message>, Error>;
}

/// The built-in binary serializer: a packed type id followed by the
/// message body.
pub struct BinarySerializer;

impl Serializer for BinarySerializer {
	fn serialize(&self, writer: &mut dyn Writer, message: &dyn Message) -> Result<(), SerError> {
		writer.write_packed_i32(message.type_id())?;
		message.write_body(writer)
	}

	fn deserialize(
		&self,
		reader: &mut dyn Reader,
		factory: &dyn MessageFactory,
	) -> Result<Box<dyn Message>, Error> {
		let type_id = reader.read_packed_i32().map_err(Error::Decode)?;
		let mut message = factory.create(type_id)?;
		message.read_body(reader).map_err(Error::Decode)?;
		Ok(message)
	}
}

/// Encodes and decodes one message given its target channel context.
pub trait Codec: Send + Sync {
	/// Encodes `message` for `channel` into the provided writer.
	fn encode(
		&self,
		channel: &Channel,
		message: &dyn Message,
		writer: &mut dyn Writer,
	) -> Result<(), Error>;

	/// Decodes one message using the channel's serializer and factory.
	fn decode(&self, channel: &Channel, reader: &mut dyn Reader)
		-> Result<Box<dyn Message>, Error>;
}

/// Default codec: defers entirely to the channel-bound serializer.
pub struct BinaryCodec;

impl Codec for BinaryCodec {
	fn encode(
		&self,
		channel: &Channel,
		message: &dyn Message,
		writer: &mut dyn Writer,
	) -> Result<(), Error> {
		channel
			.serializer()
			.serialize(writer, message)
			.map_err(Error::Encode)
	}

	fn decode(
		&self,
		channel: &Channel,
		reader: &mut dyn Reader,
	) -> Result<Box<dyn Message>, Error> {
		channel
			.serializer()
			.deserialize(reader, channel.factory().as_ref())
	}
}

/// A named symmetric transform over serialized message bytes. The channel
/// id stays outside the filtered region so a failing pipeline can still
/// address its channel.
pub trait StreamFilter: Send + Sync {
	/// Registry name of the filter.
	fn name(&self) -> &str;

	/// Transforms outbound bytes.
	fn encode(&self, data: Vec<u8>) -> Result<Vec<u8>, Error>;

	/// Inverse transform over inbound bytes.
	fn decode(&self, data: Vec<u8>) -> Result<Vec<u8>, Error>;
}

/// Named filter registry the configuration's `filters` list is resolved
/// against.
#[derive(Default)]
pub struct FilterRegistry {
	by_name: HashMap<String, Arc<dyn StreamFilter>>,
}

impl FilterRegistry {
	/// An empty registry.
	pub fn new() -> FilterRegistry {
		FilterRegistry {
			by_name: HashMap::new(),
		}
	}

	/// Registers a filter under its own name, replacing any previous
	/// registration.
	pub fn register(&mut self, filter: Arc<dyn StreamFilter>) {
		self.by_name.insert(filter.name().to_string(), filter);
	}

	/// Resolves an ordered name list into the filter chain, outermost
	/// first.
	pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn StreamFilter>>, Error> {
		let mut chain = Vec::with_capacity(names.len());
		for name in names {
			match self.by_name.get(name) {
				Some(filter) => chain.push(filter.clone()),
				None => {
					return Err(Error::Config(format!("no filter named \"{}\"", name)));
				}
			}
		}
		Ok(chain)
	}
}

/// Runs outbound bytes through the chain, outermost filter first.
pub(crate) fn apply_write(
	filters: &[Arc<dyn StreamFilter>],
	data: Vec<u8>,
) -> Result<Vec<u8>, Error> {
	let mut data = data;
	for filter in filters {
		data = filter.encode(data)?;
	}
	Ok(data)
}

/// Runs inbound bytes through the chain in reverse, outermost filter last.
pub(crate) fn apply_read(
	filters: &[Arc<dyn StreamFilter>],
	data: Vec<u8>,
) -> Result<Vec<u8>, Error> {
	let mut data = data;
	for filter in filters.iter().rev() {
		data = filter.decode(data)?;
	}
	Ok(data)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::ser::{BinWriter, BufReader};
	use crate::msg::{PeerResponse, ResponseResult};
	use crate::protocol::ControlFactory;
	use std::sync::Weak;

	fn control_channel() -> Arc<Channel> {
		Channel::new(
			0,
			Weak::new(),
			Arc::new(BinarySerializer),
			Arc::new(ControlFactory),
			None,
			None,
		)
	}

	struct XorFilter {
		key: u8,
	}

	impl StreamFilter for XorFilter {
		fn name(&self) -> &str {
			"xor"
		}
		fn encode(&self, data: Vec<u8>) -> Result<Vec<u8>, Error> {
			Ok(data.into_iter().map(|b| b ^ self.key).collect())
		}
		fn decode(&self, data: Vec<u8>) -> Result<Vec<u8>, Error> {
			Ok(data.into_iter().map(|b| b ^ self.key).collect())
		}
	}

	struct ReverseFilter;

	impl StreamFilter for ReverseFilter {
		fn name(&self) -> &str {
			"reverse"
		}
		fn encode(&self, mut data: Vec<u8>) -> Result<Vec<u8>, Error> {
			data.reverse();
			Ok(data)
		}
		fn decode(&self, mut data: Vec<u8>) -> Result<Vec<u8>, Error> {
			data.reverse();
			Ok(data)
		}
	}

	fn encode_on(channel: &Channel, message: &dyn Message) -> Vec<u8> {
		let mut buf = vec![];
		{
			let mut writer = BinWriter::new(&mut buf);
			BinaryCodec.encode(channel, message, &mut writer).unwrap();
		}
		buf
	}

	#[test]
	fn codec_round_trip() {
		let channel = control_channel();
		let message = PeerResponse::ok(5, ResponseResult::ChannelId(12));
		let buf = encode_on(&channel, &message);

		let mut reader = BufReader::new(&buf);
		let decoded = BinaryCodec.decode(&channel, &mut reader).unwrap();
		let decoded = decoded.as_any().downcast_ref::<PeerResponse>().unwrap();
		assert_eq!(decoded.request_id, 5);
		assert_eq!(decoded.result, ResponseResult::ChannelId(12));
		assert_eq!(reader.remaining(), 0);
	}

	#[test]
	fn filter_pipeline_is_symmetric() {
		let filters: Vec<Arc<dyn StreamFilter>> =
			vec![Arc::new(XorFilter { key: 0x5A }), Arc::new(ReverseFilter)];

		let channel = control_channel();
		let message = PeerResponse::ok(9, ResponseResult::Text("redirected".to_string()));
		let clear = encode_on(&channel, &message);

		let wire = apply_write(&filters, clear.clone()).unwrap();
		assert_ne!(wire, clear);
		let back = apply_read(&filters, wire).unwrap();
		assert_eq!(back, clear);

		let mut reader = BufReader::new(&back);
		let decoded = BinaryCodec.decode(&channel, &mut reader).unwrap();
		assert_eq!(decoded.type_id(), message.type_id());
	}

	#[test]
	fn unknown_filter_name_is_a_config_error() {
		let mut registry = FilterRegistry::new();
		registry.register(Arc::new(XorFilter { key: 1 }));
		assert!(registry.resolve(&["xor".to_string()]).is_ok());
		match registry.resolve(&["gzip".to_string()]) {
			Err(Error::Config(_)) => {}
			Ok(_) => panic!("expected config error, got Ok"),
			Err(e) => panic!("expected config error, got {:?}", e),
		}
	}

	#[test]
	fn decode_of_unknown_type_fails() {
		let channel = control_channel();
		let mut buf = vec![];
		{
			let mut writer = BinWriter::new(&mut buf);
			writer.write_packed_i32(-99).unwrap();
		}
		let mut reader = BufReader::new(&buf);
		assert!(BinaryCodec.decode(&channel, &mut reader).is_err());
	}
}
