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

use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use gridlink_net::{Error, TcpInitiator};

// A request against a mute peer expires on the caller's clock; the
// connection and channel survive and the timeout is counted.
#[test]
fn request_timeout_leaves_the_connection_open() {
	gridlink_util::init_test_logger();

	let (listener, addr) = bind();
	let server = thread::spawn(move || {
		let mut stream = accept(&listener);
		serve_open(&mut stream);
		serve_channel_open(&mut stream, 5);

		// swallow the echo request, never answer it
		let frame = read_frame(&mut stream).unwrap();
		assert_eq!(frame.channel_id, 5);
		assert_eq!(frame.type_id, ECHO_REQUEST);

		// hold the socket open until the client winds down
		while read_frame(&mut stream).is_ok() {}
	});

	let mut config = config_for(addr, -1);
	config.request_timeout_ms = 200;

	let mut initiator = TcpInitiator::new(config).unwrap();
	initiator.register_protocol(echo_protocol()).unwrap();
	initiator.start().unwrap();

	let conn = initiator.ensure_connection().unwrap();
	let channel = conn.open_channel(ECHO_PROTOCOL, None).unwrap();

	let begun = Instant::now();
	let result = channel.request(Box::new(EchoRequest {
		request_id: 0,
		text: "anyone there?".to_string(),
	}));
	match result {
		Err(Error::RequestTimeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 200),
		Err(e) => panic!("expected a request timeout, got {:?}", e),
		Ok(_) => panic!("expected a request timeout, got a response"),
	}
	assert!(begun.elapsed() >= Duration::from_millis(200));

	// nothing was torn down on the way
	assert!(conn.is_open());
	assert!(channel.is_open());
	assert_eq!(channel.pending_requests(), 0);
	assert_eq!(
		initiator
			.peer()
			.stats()
			.unwrap()
			.timeout_count
			.load(Ordering::Relaxed),
		1
	);

	conn.close();
	server.join().unwrap();
	initiator.stop();
}

// With heartbeats on and a peer that never answers them, the connection
// dies within a tick of the ping timeout, and only one ping is ever in
// flight.
#[test]
fn ping_timeout_closes_the_connection() {
	gridlink_util::init_test_logger();

	let (listener, addr) = bind();
	let (count_tx, count_rx) = mpsc::channel();

	let server = thread::spawn(move || {
		let mut stream = accept(&listener);
		serve_open(&mut stream);

		let mut pings = 0u32;
		loop {
			match read_frame(&mut stream) {
				Ok(frame) => {
					// an abortive close sends nothing, least of all a
					// connection release
					assert_eq!(frame.type_id, T_PING_REQUEST, "unexpected {:?}", frame);
					pings += 1;
				}
				Err(_) => break,
			}
		}
		count_tx.send(pings).unwrap();
	});

	let mut config = config_for(addr, -1);
	config.heartbeat_interval_ms = 100;
	config.heartbeat_timeout_ms = 100;

	let events = EventLog::new();
	let mut initiator = TcpInitiator::new(config).unwrap();
	initiator.add_listener(events.clone()).unwrap();
	initiator.start().unwrap();

	let conn = initiator.ensure_connection().unwrap();
	assert!(conn.is_open());

	// ping at ~100ms, unanswered, timed out at ~200ms
	assert!(
		wait_for(Duration::from_secs(2), || !conn.is_open()),
		"connection did not close on ping timeout"
	);

	let reasons = events.error_reasons();
	assert!(
		reasons
			.iter()
			.any(|r| r.contains("did not receive a response to a ping within 100 millis")),
		"unexpected close reasons: {:?}",
		reasons
	);

	assert_eq!(count_rx.recv().unwrap(), 1, "more than one ping in flight");
	server.join().unwrap();
	initiator.stop();
}
