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

//! Blocking full-duplex TLS over a `TcpStream`. rustls drives the record
//! layer; the session state sits behind a mutex so one thread can read
//! while others write. Socket reads happen outside the session lock, so a
//! reader blocked on the wire never starves writers.
//!
//! Lock order is session before write half, everywhere.

use std::convert::TryFrom;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use crate::util::Mutex;

use crate::types::{Error, TlsConfig};

pub struct TlsStream {
	session: Mutex<ClientConnection>,
	read_half: TcpStream,
	write_half: Mutex<TcpStream>,
}

impl TlsStream {
	/// Wraps an established TCP stream, completing the TLS handshake on
	/// the calling thread before returning.
	pub fn connect(sock: TcpStream, config: &TlsConfig) -> Result<TlsStream, Error> {
		let roots = load_roots(&config.ca_file)?;
		let client_config = ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth();
		let server_name = ServerName::try_from(config.server_name.clone()).map_err(|_| {
			Error::Config(format!(
				"invalid tls server name \"{}\"",
				config.server_name
			))
		})?;
		let mut session = ClientConnection::new(Arc::new(client_config), server_name)
			.map_err(|e| Error::Tls(e.to_string()))?;

		let mut io_ref = &sock;
		while session.is_handshaking() {
			session
				.complete_io(&mut io_ref)
				.map_err(Error::Connection)?;
		}
		debug!(
			"tls session established with {}",
			sock.peer_addr()
				.map(|a| a.to_string())
				.unwrap_or_else(|_| "?".to_owned())
		);

		let read_half = sock.try_clone().map_err(Error::Connection)?;
		Ok(TlsStream {
			session: Mutex::new(session),
			read_half,
			write_half: Mutex::new(sock),
		})
	}

	/// Blocking read of exactly `buf.len()` plaintext bytes. A clean TLS
	/// close or socket EOF surfaces as `UnexpectedEof`.
	pub fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
		let mut filled = 0;
		while filled < buf.len() {
			let n = self.read_some(&mut buf[filled..])?;
			if n == 0 {
				return Err(io::Error::new(
					io::ErrorKind::UnexpectedEof,
					"tls stream closed",
				));
			}
			filled += n;
		}
		Ok(())
	}

	fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
		loop {
			{
				let mut session = self.session.lock();
				match session.reader().read(buf) {
					Ok(n) => return Ok(n),
					Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
					Err(e) => return Err(e),
				}
			}

			// out of plaintext; pull more records off the socket without
			// holding the session lock
			let mut wire = [0u8; 16 * 1024];
			let n = {
				let mut read_half = &self.read_half;
				read_half.read(&mut wire)?
			};
			if n == 0 {
				return Ok(0);
			}

			let mut session = self.session.lock();
			let mut rest = &wire[..n];
			while !rest.is_empty() {
				let consumed = session.read_tls(&mut rest)?;
				if consumed == 0 {
					break;
				}
				session
					.process_new_packets()
					.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
			}
			// the session may owe the peer records (rekeys, alerts)
			if session.wants_write() {
				let mut write_half = self.write_half.lock();
				while session.wants_write() {
					session.write_tls(&mut *write_half)?;
				}
			}
		}
	}

	/// Writes all of `buf` as plaintext and flushes the produced records.
	/// The session lock is held across the socket write so records from
	/// concurrent writers cannot interleave.
	pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
		let mut session = self.session.lock();
		session.writer().write_all(buf)?;
		let mut write_half = self.write_half.lock();
		while session.wants_write() {
			session.write_tls(&mut *write_half)?;
		}
		Ok(())
	}

	/// Best-effort close_notify followed by socket teardown.
	pub fn shutdown(&self) {
		{
			let mut session = self.session.lock();
			session.send_close_notify();
			let mut write_half = self.write_half.lock();
			while session.wants_write() {
				if session.write_tls(&mut *write_half).is_err() {
					break;
				}
			}
		}
		let _ = self.read_half.shutdown(Shutdown::Both);
	}

	pub fn peer_addr(&self) -> io::Result<SocketAddr> {
		self.read_half.peer_addr()
	}
}

fn load_roots(ca_file: &str) -> Result<RootCertStore, Error> {
	let file = File::open(ca_file)
		.map_err(|e| Error::Config(format!("cannot open tls ca file \"{}\": {}", ca_file, e)))?;
	let mut pem = BufReader::new(file);
	let mut roots = RootCertStore::empty();
	for cert in rustls_pemfile::certs(&mut pem) {
		let cert = cert
			.map_err(|e| Error::Config(format!("malformed certificate in {}: {}", ca_file, e)))?;
		roots
			.add(cert)
			.map_err(|e| Error::Tls(e.to_string()))?;
	}
	if roots.is_empty() {
		return Err(Error::Config(format!(
			"no certificates found in \"{}\"",
			ca_file
		)));
	}
	Ok(roots)
}
