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
use std::sync::{mpsc, Arc};
use std::thread;

use common::*;
use gridlink_net::{TcpInitiator, NAME_SERVICE_SUBPORT};

// Opens a connection against a scripted endpoint and checks the whole
// exchange byte for byte: subport prelude, open handshake, graceful close.
#[test]
fn open_close_happy_path() {
	gridlink_util::init_test_logger();

	let (listener, addr) = bind();
	let (prelude_tx, prelude_rx) = mpsc::channel();

	let server = thread::spawn(move || {
		let mut stream = accept(&listener);
		let prelude = read_prelude(&mut stream);
		prelude_tx.send(prelude).unwrap();

		serve_open(&mut stream);

		// a graceful close announces itself before the socket goes away
		let frame = read_frame(&mut stream).unwrap();
		assert_eq!(frame.channel_id, 0);
		assert_eq!(frame.type_id, T_NOTIFY_CONNECTION_CLOSED);
		assert!(read_frame(&mut stream).is_err(), "expected end of stream");
	});

	let mut initiator = TcpInitiator::new(config_for(addr, NAME_SERVICE_SUBPORT)).unwrap();
	initiator.start().unwrap();

	let conn = initiator.ensure_connection().unwrap();
	assert!(conn.is_open());
	assert!(conn.stats().bytes_sent.load(Ordering::Relaxed) > 0);

	// ensuring again returns the same connection, no second socket
	let again = initiator.ensure_connection().unwrap();
	assert!(Arc::ptr_eq(&conn, &again));

	// the name service prelude, byte for byte
	assert_eq!(
		prelude_rx.recv().unwrap(),
		[0x00, 0x05, 0xAC, 0x1E, 0x00, 0x00, 0x00, 0x03]
	);

	conn.close();
	assert!(!conn.is_open());
	// closing twice changes nothing
	conn.close();
	assert!(!conn.is_open());

	server.join().unwrap();
	initiator.stop();
}

// The control channel is one object for the lifetime of its connection.
#[test]
fn control_channel_identity() {
	gridlink_util::init_test_logger();

	let (listener, addr) = bind();
	let server = thread::spawn(move || {
		let mut stream = accept(&listener);
		serve_open(&mut stream);
		// park until the client closes
		while read_frame(&mut stream).is_ok() {}
	});

	let mut initiator = TcpInitiator::new(config_for(addr, -1)).unwrap();
	initiator.start().unwrap();
	let conn = initiator.ensure_connection().unwrap();

	let first = conn.channel(0).unwrap();
	let second = conn.channel(0).unwrap();
	assert!(Arc::ptr_eq(&first, &second));
	assert_eq!(first.id(), 0);
	assert!(first.is_open());

	conn.close();
	assert!(conn.channel(0).is_none());

	server.join().unwrap();
	initiator.stop();
}
