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

//! Message types that transit over the wire and related serialization code.
//!
//! Control messages (negative type ids) ride the control channel and drive
//! connection and channel lifecycle. External protocol messages use
//! non-negative type ids and are produced by the message factory of their
//! channel's protocol.

use std::any::Any;

use crate::core::ser::{Error as SerError, Reader, Writer};

/// Activates a channel previously reserved with `CreateChannel`.
pub const TYPE_ACCEPT_CHANNEL: i32 = -1;
/// Peer-requested release of a single channel.
pub const TYPE_CLOSE_CHANNEL: i32 = -2;
/// Peer-requested release of the connection.
pub const TYPE_CLOSE_CONNECTION: i32 = -3;
/// Reserves a channel id for a named protocol.
pub const TYPE_CREATE_CHANNEL: i32 = -4;
/// Queue-internal service shutdown marker, never framed.
pub const TYPE_NOTIFY_SHUTDOWN: i32 = -5;
/// Queue-internal service startup marker, never framed.
pub const TYPE_NOTIFY_STARTUP: i32 = -6;
/// Opens a connection: version negotiation plus identity assertion.
pub const TYPE_OPEN_CONNECTION: i32 = -7;
/// Heartbeat probe.
pub const TYPE_PING_REQUEST: i32 = -8;
/// Heartbeat answer.
pub const TYPE_PING_RESPONSE: i32 = -9;
/// Queue-internal raw inbound frame, never framed itself.
pub const TYPE_ENCODED_MESSAGE: i32 = -10;
/// One-way notification that the sender released a channel.
pub const TYPE_NOTIFY_CHANNEL_CLOSED: i32 = -11;
/// One-way notification that the sender released the connection.
pub const TYPE_NOTIFY_CONNECTION_CLOSED: i32 = -12;
/// Generic result carrier for control requests.
pub const TYPE_RESPONSE: i32 = -13;

/// Cap applied to strings and byte fields inside control messages.
const MAX_FIELD_BYTES: usize = 1 << 16;

/// Cap on collection sizes inside control messages.
const MAX_FIELD_COUNT: i32 = 1 << 10;

/// One logical unit on the wire. Implementations serialize their own body;
/// the enclosing envelope (type id, channel id, frame length) is written by
/// the serializer and framer.
pub trait Message: Send + 'static {
	/// Wire type identifier. Negative ids belong to the control protocol.
	fn type_id(&self) -> i32;

	/// Serializes the message body, everything following the type id.
	fn write_body(&self, writer: &mut dyn Writer) -> Result<(), SerError>;

	/// Deserializes the message body in place.
	fn read_body(&mut self, reader: &mut dyn Reader) -> Result<(), SerError>;

	/// For requests, the correlation id once assigned.
	fn request_id(&self) -> Option<i64> {
		None
	}

	/// Assigns the correlation id prior to encoding. No-op for one-way
	/// messages.
	fn set_request_id(&mut self, _id: i64) {}

	/// For responses, the id of the request answered and whether the
	/// request failed.
	fn response_to(&self) -> Option<(i64, bool)> {
		None
	}

	/// Whether the service thread must dispatch this message inline, in
	/// reception order, rather than handing it off.
	fn execute_in_order(&self) -> bool {
		true
	}

	/// Upcast used to handle concrete message types.
	fn as_any(&self) -> &dyn Any;

	/// Mutable upcast.
	fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A human-readable name for a wire type id, for diagnostics only.
pub fn type_name(type_id: i32) -> &'static str {
	match type_id {
		TYPE_ACCEPT_CHANNEL => "AcceptChannel",
		TYPE_CLOSE_CHANNEL => "CloseChannel",
		TYPE_CLOSE_CONNECTION => "CloseConnection",
		TYPE_CREATE_CHANNEL => "CreateChannel",
		TYPE_NOTIFY_SHUTDOWN => "NotifyShutdown",
		TYPE_NOTIFY_STARTUP => "NotifyStartup",
		TYPE_OPEN_CONNECTION => "OpenConnection",
		TYPE_PING_REQUEST => "PingRequest",
		TYPE_PING_RESPONSE => "PingResponse",
		TYPE_ENCODED_MESSAGE => "EncodedMessage",
		TYPE_NOTIFY_CHANNEL_CLOSED => "NotifyChannelClosed",
		TYPE_NOTIFY_CONNECTION_CLOSED => "NotifyConnectionClosed",
		TYPE_RESPONSE => "Response",
		_ => "user",
	}
}

fn write_opt_bytes(writer: &mut dyn Writer, bytes: &Option<Vec<u8>>) -> Result<(), SerError> {
	match bytes {
		Some(b) => {
			writer.write_u8(1)?;
			writer.write_bytes(b)
		}
		None => writer.write_u8(0),
	}
}

fn read_opt_bytes(reader: &mut dyn Reader) -> Result<Option<Vec<u8>>, SerError> {
	match reader.read_u8()? {
		0 => Ok(None),
		1 => Ok(Some(reader.read_bytes(MAX_FIELD_BYTES)?)),
		_ => Err(SerError::CorruptedData),
	}
}

fn read_count(reader: &mut dyn Reader) -> Result<usize, SerError> {
	let count = reader.read_packed_i32()?;
	if count < 0 || count > MAX_FIELD_COUNT {
		return Err(SerError::CorruptedData);
	}
	Ok(count as usize)
}

/// Version range one side offers for a named protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolRange {
	pub name: String,
	pub current_version: i32,
	pub min_version: i32,
}

/// Opens the connection: carries the client identity and the protocol
/// version ranges to negotiate.
#[derive(Debug, Default)]
pub struct OpenConnectionRequest {
	pub request_id: i64,
	pub client_id: String,
	pub protocols: Vec<ProtocolRange>,
	pub identity_token: Option<Vec<u8>>,
}

impl Message for OpenConnectionRequest {
	fn type_id(&self) -> i32 {
		TYPE_OPEN_CONNECTION
	}
	fn write_body(&self, writer: &mut dyn Writer) -> Result<(), SerError> {
		writer.write_packed_i64(self.request_id)?;
		writer.write_string(&self.client_id)?;
		writer.write_packed_i32(self.protocols.len() as i32)?;
		for range in &self.protocols {
			writer.write_string(&range.name)?;
			writer.write_packed_i32(range.current_version)?;
			writer.write_packed_i32(range.min_version)?;
		}
		write_opt_bytes(writer, &self.identity_token)
	}
	fn read_body(&mut self, reader: &mut dyn Reader) -> Result<(), SerError> {
		self.request_id = reader.read_packed_i64()?;
		self.client_id = reader.read_string(MAX_FIELD_BYTES)?;
		let count = read_count(reader)?;
		self.protocols = Vec::with_capacity(count);
		for _ in 0..count {
			self.protocols.push(ProtocolRange {
				name: reader.read_string(MAX_FIELD_BYTES)?,
				current_version: reader.read_packed_i32()?,
				min_version: reader.read_packed_i32()?,
			});
		}
		self.identity_token = read_opt_bytes(reader)?;
		Ok(())
	}
	fn request_id(&self) -> Option<i64> {
		Some(self.request_id)
	}
	fn set_request_id(&mut self, id: i64) {
		self.request_id = id;
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

/// Reserves a channel id for a protocol on the remote peer.
#[derive(Debug, Default)]
pub struct CreateChannelRequest {
	pub request_id: i64,
	pub protocol: String,
	pub current_version: i32,
	pub min_version: i32,
}

impl Message for CreateChannelRequest {
	fn type_id(&self) -> i32 {
		TYPE_CREATE_CHANNEL
	}
	fn write_body(&self, writer: &mut dyn Writer) -> Result<(), SerError> {
		writer.write_packed_i64(self.request_id)?;
		writer.write_string(&self.protocol)?;
		writer.write_packed_i32(self.current_version)?;
		writer.write_packed_i32(self.min_version)?;
		Ok(())
	}
	fn read_body(&mut self, reader: &mut dyn Reader) -> Result<(), SerError> {
		self.request_id = reader.read_packed_i64()?;
		self.protocol = reader.read_string(MAX_FIELD_BYTES)?;
		self.current_version = reader.read_packed_i32()?;
		self.min_version = reader.read_packed_i32()?;
		Ok(())
	}
	fn request_id(&self) -> Option<i64> {
		Some(self.request_id)
	}
	fn set_request_id(&mut self, id: i64) {
		self.request_id = id;
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

/// Activates a reserved channel, optionally asserting an identity.
#[derive(Debug, Default)]
pub struct AcceptChannelRequest {
	pub request_id: i64,
	pub channel_id: i32,
	pub identity_token: Option<Vec<u8>>,
}

impl Message for AcceptChannelRequest {
	fn type_id(&self) -> i32 {
		TYPE_ACCEPT_CHANNEL
	}
	fn write_body(&self, writer: &mut dyn Writer) -> Result<(), SerError> {
		writer.write_packed_i64(self.request_id)?;
		writer.write_packed_i32(self.channel_id)?;
		write_opt_bytes(writer, &self.identity_token)
	}
	fn read_body(&mut self, reader: &mut dyn Reader) -> Result<(), SerError> {
		self.request_id = reader.read_packed_i64()?;
		self.channel_id = reader.read_packed_i32()?;
		self.identity_token = read_opt_bytes(reader)?;
		Ok(())
	}
	fn request_id(&self) -> Option<i64> {
		Some(self.request_id)
	}
	fn set_request_id(&mut self, id: i64) {
		self.request_id = id;
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

/// Asks the receiver to release one channel.
#[derive(Debug, Default)]
pub struct CloseChannelRequest {
	pub request_id: i64,
	pub channel_id: i32,
	pub reason: String,
}

impl Message for CloseChannelRequest {
	fn type_id(&self) -> i32 {
		TYPE_CLOSE_CHANNEL
	}
	fn write_body(&self, writer: &mut dyn Writer) -> Result<(), SerError> {
		writer.write_packed_i64(self.request_id)?;
		writer.write_packed_i32(self.channel_id)?;
		writer.write_string(&self.reason)
	}
	fn read_body(&mut self, reader: &mut dyn Reader) -> Result<(), SerError> {
		self.request_id = reader.read_packed_i64()?;
		self.channel_id = reader.read_packed_i32()?;
		self.reason = reader.read_string(MAX_FIELD_BYTES)?;
		Ok(())
	}
	fn request_id(&self) -> Option<i64> {
		Some(self.request_id)
	}
	fn set_request_id(&mut self, id: i64) {
		self.request_id = id;
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

/// Asks the receiver to release the connection.
#[derive(Debug, Default)]
pub struct CloseConnectionRequest {
	pub request_id: i64,
	pub reason: String,
}

impl Message for CloseConnectionRequest {
	fn type_id(&self) -> i32 {
		TYPE_CLOSE_CONNECTION
	}
	fn write_body(&self, writer: &mut dyn Writer) -> Result<(), SerError> {
		writer.write_packed_i64(self.request_id)?;
		writer.write_string(&self.reason)
	}
	fn read_body(&mut self, reader: &mut dyn Reader) -> Result<(), SerError> {
		self.request_id = reader.read_packed_i64()?;
		self.reason = reader.read_string(MAX_FIELD_BYTES)?;
		Ok(())
	}
	fn request_id(&self) -> Option<i64> {
		Some(self.request_id)
	}
	fn set_request_id(&mut self, id: i64) {
		self.request_id = id;
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

/// Heartbeat probe. Carries an id for logging symmetry, answered with a
/// `PingResponse` rather than a generic response.
#[derive(Debug, Default)]
pub struct PingRequest {
	pub request_id: i64,
}

impl Message for PingRequest {
	fn type_id(&self) -> i32 {
		TYPE_PING_REQUEST
	}
	fn write_body(&self, writer: &mut dyn Writer) -> Result<(), SerError> {
		writer.write_packed_i64(self.request_id)
	}
	fn read_body(&mut self, reader: &mut dyn Reader) -> Result<(), SerError> {
		self.request_id = reader.read_packed_i64()?;
		Ok(())
	}
	fn request_id(&self) -> Option<i64> {
		Some(self.request_id)
	}
	fn set_request_id(&mut self, id: i64) {
		self.request_id = id;
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

/// Heartbeat answer. Deliberately not a correlated response so that the
/// connection's ping bookkeeping handles it even after a waiter is gone.
#[derive(Debug, Default)]
pub struct PingResponse {
	pub request_id: i64,
}

impl Message for PingResponse {
	fn type_id(&self) -> i32 {
		TYPE_PING_RESPONSE
	}
	fn write_body(&self, writer: &mut dyn Writer) -> Result<(), SerError> {
		writer.write_packed_i64(self.request_id)
	}
	fn read_body(&mut self, reader: &mut dyn Reader) -> Result<(), SerError> {
		self.request_id = reader.read_packed_i64()?;
		Ok(())
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

/// One-way notice that the sender released a channel.
#[derive(Debug, Default)]
pub struct NotifyChannelClosed {
	pub channel_id: i32,
	pub reason: String,
}

impl Message for NotifyChannelClosed {
	fn type_id(&self) -> i32 {
		TYPE_NOTIFY_CHANNEL_CLOSED
	}
	fn write_body(&self, writer: &mut dyn Writer) -> Result<(), SerError> {
		writer.write_packed_i32(self.channel_id)?;
		writer.write_string(&self.reason)
	}
	fn read_body(&mut self, reader: &mut dyn Reader) -> Result<(), SerError> {
		self.channel_id = reader.read_packed_i32()?;
		self.reason = reader.read_string(MAX_FIELD_BYTES)?;
		Ok(())
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

/// One-way notice that the sender released the connection.
#[derive(Debug, Default)]
pub struct NotifyConnectionClosed {
	pub reason: String,
}

impl Message for NotifyConnectionClosed {
	fn type_id(&self) -> i32 {
		TYPE_NOTIFY_CONNECTION_CLOSED
	}
	fn write_body(&self, writer: &mut dyn Writer) -> Result<(), SerError> {
		writer.write_string(&self.reason)
	}
	fn read_body(&mut self, reader: &mut dyn Reader) -> Result<(), SerError> {
		self.reason = reader.read_string(MAX_FIELD_BYTES)?;
		Ok(())
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

/// Result payload of a generic control response.
#[derive(Debug, PartialEq)]
pub enum ResponseResult {
	/// Success with nothing to return.
	Empty,
	/// An opaque byte payload.
	Bytes(Vec<u8>),
	/// The id of a reserved channel.
	ChannelId(i32),
	/// Negotiated version per protocol name.
	Versions(Vec<(String, i32)>),
	/// A plain text result, usually an error description.
	Text(String),
	/// Redirect targets as (host, port32) pairs.
	Redirect(Vec<(String, i32)>),
}

impl Default for ResponseResult {
	fn default() -> ResponseResult {
		ResponseResult::Empty
	}
}

/// Generic result for control requests, correlated by request id.
#[derive(Debug, Default)]
pub struct PeerResponse {
	pub request_id: i64,
	pub failure: bool,
	pub result: ResponseResult,
}

impl PeerResponse {
	/// A success response with the given result payload.
	pub fn ok(request_id: i64, result: ResponseResult) -> PeerResponse {
		PeerResponse {
			request_id,
			failure: false,
			result,
		}
	}

	/// A failure response carrying a description.
	pub fn fail(request_id: i64, reason: &str) -> PeerResponse {
		PeerResponse {
			request_id,
			failure: true,
			result: ResponseResult::Text(reason.to_string()),
		}
	}

	/// Text carried by the result, if any.
	pub fn text(&self) -> Option<&str> {
		match &self.result {
			ResponseResult::Text(t) => Some(t),
			_ => None,
		}
	}
}

impl Message for PeerResponse {
	fn type_id(&self) -> i32 {
		TYPE_RESPONSE
	}
	fn write_body(&self, writer: &mut dyn Writer) -> Result<(), SerError> {
		writer.write_packed_i64(self.request_id)?;
		writer.write_u8(if self.failure { 1 } else { 0 })?;
		match &self.result {
			ResponseResult::Empty => writer.write_u8(0),
			ResponseResult::Bytes(b) => {
				writer.write_u8(1)?;
				writer.write_bytes(b)
			}
			ResponseResult::ChannelId(id) => {
				writer.write_u8(2)?;
				writer.write_packed_i32(*id)
			}
			ResponseResult::Versions(versions) => {
				writer.write_u8(3)?;
				writer.write_packed_i32(versions.len() as i32)?;
				for (name, version) in versions {
					writer.write_string(name)?;
					writer.write_packed_i32(*version)?;
				}
				Ok(())
			}
			ResponseResult::Text(text) => {
				writer.write_u8(4)?;
				writer.write_string(text)
			}
			ResponseResult::Redirect(targets) => {
				writer.write_u8(5)?;
				writer.write_packed_i32(targets.len() as i32)?;
				for (host, port32) in targets {
					writer.write_string(host)?;
					writer.write_packed_i32(*port32)?;
				}
				Ok(())
			}
		}
	}
	fn read_body(&mut self, reader: &mut dyn Reader) -> Result<(), SerError> {
		self.request_id = reader.read_packed_i64()?;
		self.failure = match reader.read_u8()? {
			0 => false,
			1 => true,
			_ => return Err(SerError::CorruptedData),
		};
		self.result = match reader.read_u8()? {
			0 => ResponseResult::Empty,
			1 => ResponseResult::Bytes(reader.read_bytes(MAX_FIELD_BYTES)?),
			2 => ResponseResult::ChannelId(reader.read_packed_i32()?),
			3 => {
				let count = read_count(reader)?;
				let mut versions = Vec::with_capacity(count);
				for _ in 0..count {
					let name = reader.read_string(MAX_FIELD_BYTES)?;
					let version = reader.read_packed_i32()?;
					versions.push((name, version));
				}
				ResponseResult::Versions(versions)
			}
			4 => ResponseResult::Text(reader.read_string(MAX_FIELD_BYTES)?),
			5 => {
				let count = read_count(reader)?;
				let mut targets = Vec::with_capacity(count);
				for _ in 0..count {
					let host = reader.read_string(MAX_FIELD_BYTES)?;
					let port32 = reader.read_packed_i32()?;
					targets.push((host, port32));
				}
				ResponseResult::Redirect(targets)
			}
			_ => return Err(SerError::CorruptedData),
		};
		Ok(())
	}
	fn response_to(&self) -> Option<(i64, bool)> {
		Some((self.request_id, self.failure))
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}
