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

use std::thread;
use std::time::Duration;

use common::*;
use gridlink_core::ser::BufReader;
use gridlink_core::ser::Reader;
use gridlink_net::TcpInitiator;

// A well-framed message whose body does not decode closes only the
// channel it addressed; the rest of the connection keeps going.
#[test]
fn malformed_body_closes_only_its_channel() {
	gridlink_util::init_test_logger();

	let (listener, addr) = bind();
	let server = thread::spawn(move || {
		let mut stream = accept(&listener);
		serve_open(&mut stream);
		serve_channel_open(&mut stream, 5);

		// a packed type id that never terminates within its bound
		write_frame(&mut stream, 5, &[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]);

		// the client releases exactly that channel
		let frame = read_frame(&mut stream).unwrap();
		assert_eq!(frame.channel_id, 0);
		assert_eq!(frame.type_id, T_NOTIFY_CHANNEL_CLOSED);
		let mut body = BufReader::new(&frame.body);
		assert_eq!(body.read_packed_i32().unwrap(), 5);

		while read_frame(&mut stream).is_ok() {}
	});

	let mut initiator = TcpInitiator::new(config_for(addr, -1)).unwrap();
	initiator.register_protocol(echo_protocol()).unwrap();
	initiator.start().unwrap();

	let conn = initiator.ensure_connection().unwrap();
	let channel = conn.open_channel(ECHO_PROTOCOL, None).unwrap();
	assert!(channel.is_open());

	assert!(
		wait_for(Duration::from_secs(2), || !channel.is_open()),
		"channel survived a malformed body"
	);

	// the connection and its control channel never flinched
	assert!(conn.is_open());
	assert!(conn.channel(5).is_none());
	assert!(conn.channel(0).is_some());

	// a second close of the dead channel changes nothing
	channel.close(false, None);
	assert!(!channel.is_open());

	conn.close();
	server.join().unwrap();
	initiator.stop();
}
