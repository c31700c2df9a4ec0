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

mod common;

use std::io::Write;
use std::thread;
use std::time::Duration;

use common::*;
use gridlink_core::ser::{BinWriter, Writer};
use gridlink_net::{Error, TcpInitiator};

// An advertised frame length above the inbound bound kills the
// connection before the body is ever buffered.
#[test]
fn oversize_inbound_frame_closes_the_connection() {
	gridlink_util::init_test_logger();

	let (listener, addr) = bind();
	let server = thread::spawn(move || {
		let mut stream = accept(&listener);
		serve_open(&mut stream);

		// announce a frame one byte over the limit
		let mut prefix = vec![];
		{
			let mut writer = BinWriter::new(&mut prefix);
			writer.write_packed_i32(1025).unwrap();
		}
		stream.write_all(&prefix).unwrap();
		stream.write_all(&[0u8; 16]).unwrap();

		// the client walks away without reading the rest
		while read_frame(&mut stream).is_ok() {}
	});

	let mut config = config_for(addr, -1);
	config.max_incoming_message_size = 1024;

	let events = EventLog::new();
	let mut initiator = TcpInitiator::new(config).unwrap();
	initiator.add_listener(events.clone()).unwrap();
	initiator.start().unwrap();

	let conn = initiator.ensure_connection().unwrap();
	assert!(
		wait_for(Duration::from_secs(2), || !conn.is_open()),
		"connection survived an oversize frame"
	);

	let reasons = events.error_reasons();
	assert!(
		reasons.iter().any(|r| r.contains("exceeds the maximum")),
		"unexpected close reasons: {:?}",
		reasons
	);

	server.join().unwrap();
	initiator.stop();
}

// An outbound message above the bound fails the send before anything is
// written; the channel is released, the connection survives.
#[test]
fn oversize_outbound_send_fails_and_closes_the_channel() {
	gridlink_util::init_test_logger();

	let (listener, addr) = bind();
	let server = thread::spawn(move || {
		let mut stream = accept(&listener);
		serve_open(&mut stream);
		serve_channel_open(&mut stream, 7);

		// nothing of the oversize message reaches the wire; the next
		// frame is the channel release
		let frame = read_frame(&mut stream).unwrap();
		assert_eq!(frame.channel_id, 0);
		assert_eq!(frame.type_id, T_NOTIFY_CHANNEL_CLOSED);

		while read_frame(&mut stream).is_ok() {}
	});

	let mut config = config_for(addr, -1);
	config.max_outgoing_message_size = 256;

	let mut initiator = TcpInitiator::new(config).unwrap();
	initiator.register_protocol(echo_protocol()).unwrap();
	initiator.start().unwrap();

	let conn = initiator.ensure_connection().unwrap();
	let channel = conn.open_channel(ECHO_PROTOCOL, None).unwrap();

	let result = channel.request(Box::new(EchoRequest {
		request_id: 0,
		text: "x".repeat(1024),
	}));
	match result {
		Err(Error::Connection(e)) => {
			assert!(e.to_string().contains("exceeds the maximum"), "{}", e)
		}
		Err(e) => panic!("expected an i/o error, got {:?}", e),
		Ok(_) => panic!("expected the send to fail"),
	}

	assert!(
		wait_for(Duration::from_secs(2), || !channel.is_open()),
		"channel survived an oversize send"
	);
	assert!(conn.is_open());
	assert_eq!(channel.pending_requests(), 0);

	conn.close();
	server.join().unwrap();
	initiator.stop();
}
