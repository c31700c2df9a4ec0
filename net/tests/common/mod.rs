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

//! Scripted wire-level cluster stand-in for the messaging tests. Frames
//! are parsed and produced by hand with the serialization primitives so
//! the tests pin the wire format independently of the client's codec.

#![allow(dead_code)]

use std::any::Any;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gridlink_core::ser::{BinWriter, BufReader, Error as SerError, Reader, Writer};
use gridlink_net::types::ConnectionEvent;
use gridlink_net::{ConnectionListener, Message, MessageFactory, MessagingConfig, Protocol};

// control protocol type ids, as they appear on the wire
pub const T_ACCEPT_CHANNEL: i32 = -1;
pub const T_CLOSE_CHANNEL: i32 = -2;
pub const T_CLOSE_CONNECTION: i32 = -3;
pub const T_CREATE_CHANNEL: i32 = -4;
pub const T_OPEN_CONNECTION: i32 = -7;
pub const T_PING_REQUEST: i32 = -8;
pub const T_PING_RESPONSE: i32 = -9;
pub const T_NOTIFY_CHANNEL_CLOSED: i32 = -11;
pub const T_NOTIFY_CONNECTION_CLOSED: i32 = -12;
pub const T_RESPONSE: i32 = -13;

pub const SERVER_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// A listener bound to an ephemeral loopback port.
pub fn bind() -> (TcpListener, SocketAddr) {
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let addr = listener.local_addr().unwrap();
	(listener, addr)
}

/// Client configuration pointing at one endpoint.
pub fn config_for(addr: SocketAddr, subport: i32) -> MessagingConfig {
	let mut config = MessagingConfig::default();
	config.remote_addresses = vec![addr.to_string()];
	config.subport = subport;
	config
}

/// Accepts one client and applies a read timeout so a broken test fails
/// instead of hanging.
pub fn accept(listener: &TcpListener) -> TcpStream {
	let (stream, _) = listener.accept().unwrap();
	stream
		.set_read_timeout(Some(SERVER_IO_TIMEOUT))
		.unwrap();
	stream
}

/// Reads the 8-byte subport prelude.
pub fn read_prelude(stream: &mut TcpStream) -> [u8; 8] {
	let mut prelude = [0u8; 8];
	stream.read_exact(&mut prelude).unwrap();
	prelude
}

/// One parsed inbound frame.
#[derive(Debug)]
pub struct Frame {
	pub channel_id: i32,
	pub type_id: i32,
	/// body bytes following the type id
	pub body: Vec<u8>,
}

impl Frame {
	/// The packed request id leading the body of every request.
	pub fn request_id(&self) -> i64 {
		let mut reader = BufReader::new(&self.body);
		reader.read_packed_i64().unwrap()
	}
}

fn read_packed_len(stream: &mut TcpStream) -> std::io::Result<i32> {
	let mut first = [0u8; 1];
	stream.read_exact(&mut first)?;
	let b = u32::from(first[0]);
	let neg = b & 0x40 != 0;
	let mut n = b & 0x3F;
	let mut shift = 6;
	let mut more = b & 0x80 != 0;
	while more {
		let mut next = [0u8; 1];
		stream.read_exact(&mut next)?;
		let b = u32::from(next[0]);
		n |= (b & 0x7F) << shift;
		shift += 7;
		more = b & 0x80 != 0;
	}
	let n = n as i32;
	Ok(if neg { !n } else { n })
}

/// Reads and parses one frame.
pub fn read_frame(stream: &mut TcpStream) -> std::io::Result<Frame> {
	let len = read_packed_len(stream)? as usize;
	let mut payload = vec![0u8; len];
	stream.read_exact(&mut payload)?;

	let mut reader = BufReader::new(&payload);
	let channel_id = reader.read_packed_i32().unwrap();
	let type_id = reader.read_packed_i32().unwrap();
	let body = payload[reader.bytes_read()..].to_vec();
	Ok(Frame {
		channel_id,
		type_id,
		body,
	})
}

/// Frames `body` (type id included) for `channel_id` and writes it.
pub fn write_frame(stream: &mut TcpStream, channel_id: i32, body: &[u8]) {
	let mut payload = vec![];
	{
		let mut writer = BinWriter::new(&mut payload);
		writer.write_packed_i32(channel_id).unwrap();
		writer.write_fixed_bytes(body).unwrap();
	}
	let mut framed = vec![];
	{
		let mut writer = BinWriter::new(&mut framed);
		writer.write_packed_i32(payload.len() as i32).unwrap();
	}
	framed.extend_from_slice(&payload);
	stream.write_all(&framed).unwrap();
}

fn response_head(request_id: i64, failure: bool) -> Vec<u8> {
	let mut body = vec![];
	{
		let mut writer = BinWriter::new(&mut body);
		writer.write_packed_i32(T_RESPONSE).unwrap();
		writer.write_packed_i64(request_id).unwrap();
		writer.write_u8(if failure { 1 } else { 0 }).unwrap();
	}
	body
}

/// A success response with an empty result.
pub fn response_empty(request_id: i64) -> Vec<u8> {
	let mut body = response_head(request_id, false);
	{
		let mut writer = BinWriter::new(&mut body);
		writer.write_u8(0).unwrap();
	}
	body
}

/// A success response carrying a reserved channel id.
pub fn response_channel_id(request_id: i64, channel_id: i32) -> Vec<u8> {
	let mut body = response_head(request_id, false);
	{
		let mut writer = BinWriter::new(&mut body);
		writer.write_u8(2).unwrap();
		writer.write_packed_i32(channel_id).unwrap();
	}
	body
}

/// A success response with negotiated protocol versions.
pub fn response_versions(request_id: i64, versions: &[(String, i32)]) -> Vec<u8> {
	let mut body = response_head(request_id, false);
	{
		let mut writer = BinWriter::new(&mut body);
		writer.write_u8(3).unwrap();
		writer.write_packed_i32(versions.len() as i32).unwrap();
		for (name, version) in versions {
			writer.write_string(name).unwrap();
			writer.write_packed_i32(*version).unwrap();
		}
	}
	body
}

/// A success response redirecting the client elsewhere.
pub fn response_redirect(request_id: i64, targets: &[(String, i32)]) -> Vec<u8> {
	let mut body = response_head(request_id, false);
	{
		let mut writer = BinWriter::new(&mut body);
		writer.write_u8(5).unwrap();
		writer.write_packed_i32(targets.len() as i32).unwrap();
		for (host, port32) in targets {
			writer.write_string(host).unwrap();
			writer.write_packed_i32(*port32).unwrap();
		}
	}
	body
}

/// A ping answer.
pub fn ping_response(request_id: i64) -> Vec<u8> {
	let mut body = vec![];
	{
		let mut writer = BinWriter::new(&mut body);
		writer.write_packed_i32(T_PING_RESPONSE).unwrap();
		writer.write_packed_i64(request_id).unwrap();
	}
	body
}

/// Protocol ranges offered in an open connection request.
pub fn parse_open(body: &[u8]) -> Vec<(String, i32, i32)> {
	let mut reader = BufReader::new(body);
	let _request_id = reader.read_packed_i64().unwrap();
	let _client_id = reader.read_string(0).unwrap();
	let count = reader.read_packed_i32().unwrap();
	let mut ranges = vec![];
	for _ in 0..count {
		let name = reader.read_string(0).unwrap();
		let current = reader.read_packed_i32().unwrap();
		let min = reader.read_packed_i32().unwrap();
		ranges.push((name, current, min));
	}
	ranges
}

/// Handles one open connection exchange, negotiating every offered
/// protocol at its current version. Returns the open request frame.
pub fn serve_open(stream: &mut TcpStream) -> Frame {
	let frame = read_frame(stream).unwrap();
	assert_eq!(frame.channel_id, 0);
	assert_eq!(frame.type_id, T_OPEN_CONNECTION);
	let versions: Vec<(String, i32)> = parse_open(&frame.body)
		.into_iter()
		.map(|(name, current, _min)| (name, current))
		.collect();
	let response = response_versions(frame.request_id(), &versions);
	write_frame(stream, 0, &response);
	frame
}

/// Handles one channel open (reserve then accept), assigning
/// `channel_id`.
pub fn serve_channel_open(stream: &mut TcpStream, channel_id: i32) {
	let frame = read_frame(stream).unwrap();
	assert_eq!(frame.channel_id, 0);
	assert_eq!(frame.type_id, T_CREATE_CHANNEL);
	write_frame(
		stream,
		0,
		&response_channel_id(frame.request_id(), channel_id),
	);

	let frame = read_frame(stream).unwrap();
	assert_eq!(frame.channel_id, 0);
	assert_eq!(frame.type_id, T_ACCEPT_CHANNEL);
	write_frame(stream, 0, &response_empty(frame.request_id()));
}

/// Collects connection lifecycle events for assertions.
#[derive(Default)]
pub struct EventLog {
	events: Mutex<Vec<ConnectionEvent>>,
}

impl EventLog {
	pub fn new() -> Arc<EventLog> {
		Arc::new(EventLog::default())
	}

	pub fn snapshot(&self) -> Vec<ConnectionEvent> {
		self.events.lock().unwrap().clone()
	}

	pub fn error_reasons(&self) -> Vec<String> {
		self.snapshot()
			.into_iter()
			.filter_map(|event| match event {
				ConnectionEvent::Error { reason, .. } => Some(reason),
				_ => None,
			})
			.collect()
	}
}

impl ConnectionListener for EventLog {
	fn on_event(&self, event: &ConnectionEvent) {
		self.events.lock().unwrap().push(event.clone());
	}
}

/// Polls until `check` passes or the deadline expires.
pub fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
	let deadline = std::time::Instant::now() + timeout;
	while std::time::Instant::now() < deadline {
		if check() {
			return true;
		}
		std::thread::sleep(Duration::from_millis(10));
	}
	check()
}

// A tiny external protocol used to exercise the user-message path.

pub const ECHO_PROTOCOL: &str = "Echo";
pub const ECHO_REQUEST: i32 = 1;
pub const ECHO_RESPONSE: i32 = 2;

#[derive(Debug, Default)]
pub struct EchoRequest {
	pub request_id: i64,
	pub text: String,
}

impl Message for EchoRequest {
	fn type_id(&self) -> i32 {
		ECHO_REQUEST
	}
	fn write_body(&self, writer: &mut dyn Writer) -> Result<(), SerError> {
		writer.write_packed_i64(self.request_id)?;
		writer.write_string(&self.text)
	}
	fn read_body(&mut self, reader: &mut dyn Reader) -> Result<(), SerError> {
		self.request_id = reader.read_packed_i64()?;
		self.text = reader.read_string(0)?;
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

#[derive(Debug, Default)]
pub struct EchoResponse {
	pub request_id: i64,
	pub text: String,
}

impl Message for EchoResponse {
	fn type_id(&self) -> i32 {
		ECHO_RESPONSE
	}
	fn write_body(&self, writer: &mut dyn Writer) -> Result<(), SerError> {
		writer.write_packed_i64(self.request_id)?;
		writer.write_string(&self.text)
	}
	fn read_body(&mut self, reader: &mut dyn Reader) -> Result<(), SerError> {
		self.request_id = reader.read_packed_i64()?;
		self.text = reader.read_string(0)?;
		Ok(())
	}
	fn response_to(&self) -> Option<(i64, bool)> {
		Some((self.request_id, false))
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

pub struct EchoFactory;

impl MessageFactory for EchoFactory {
	fn version(&self) -> i32 {
		1
	}
	fn create(&self, type_id: i32) -> Result<Box<dyn Message>, gridlink_net::Error> {
		match type_id {
			ECHO_REQUEST => Ok(Box::new(EchoRequest::default())),
			ECHO_RESPONSE => Ok(Box::new(EchoResponse::default())),
			other => Err(gridlink_net::Error::ProtocolMismatch(format!(
				"unknown echo message type {}",
				other
			))),
		}
	}
}

pub fn echo_protocol() -> Protocol {
	Protocol::new(ECHO_PROTOCOL, 1, 1).with_factory(Arc::new(EchoFactory))
}

/// A server-side echo answer for a received echo request frame.
pub fn echo_response_body(frame: &Frame) -> Vec<u8> {
	let mut reader = BufReader::new(&frame.body);
	let request_id = reader.read_packed_i64().unwrap();
	let text = reader.read_string(0).unwrap();
	let mut body = vec![];
	{
		let mut writer = BinWriter::new(&mut body);
		writer.write_packed_i32(ECHO_RESPONSE).unwrap();
		writer.write_packed_i64(request_id).unwrap();
		writer.write_string(&text).unwrap();
	}
	body
}
