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

//! Opens byte streams to remote cluster endpoints: timeout-bounded
//! connects, socket option tuning, the optional TLS wrap and the subport
//! prelude that selects a multiplexed service behind a single listen port.
//!
//! The resulting `Stream` is shared between one reading thread and any
//! number of writing threads; writes are serialized by a mutex in both the
//! plain and the TLS shape.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use std::{fmt, io};

use net2::{TcpBuilder, TcpStreamExt};

use crate::util::Mutex;

use crate::tls::TlsStream;
use crate::types::{Error, MessagingConfig, TcpOptions};

/// Identifier written ahead of the subport to select the multiplexed
/// service protocol.
pub const MULTIPLEX_PROTOCOL_ID: u32 = 0x0005_AC1E;

/// A byte stream to a cluster endpoint, plain or TLS.
pub enum Stream {
	Plain {
		read_half: TcpStream,
		write_half: Mutex<TcpStream>,
	},
	Tls(TlsStream),
}

impl Stream {
	/// Blocking read of exactly `buf.len()` bytes. Only the connection's
	/// read loop calls this.
	pub fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
		match self {
			Stream::Plain { read_half, .. } => {
				let mut read_half = read_half;
				read_half.read_exact(buf)
			}
			Stream::Tls(tls) => tls.read_exact(buf),
		}
	}

	/// Writes a whole buffer, serialized against concurrent writers.
	pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
		match self {
			Stream::Plain { write_half, .. } => {
				let mut guard = write_half.lock();
				guard.write_all(buf)?;
				guard.flush()
			}
			Stream::Tls(tls) => tls.write_all(buf),
		}
	}

	/// Tears the stream down, unblocking any reader stuck in `read_exact`.
	pub fn shutdown(&self) {
		match self {
			Stream::Plain { read_half, .. } => {
				let _ = read_half.shutdown(Shutdown::Both);
			}
			Stream::Tls(tls) => tls.shutdown(),
		}
	}

	/// Remote endpoint of the stream, if still known.
	pub fn peer_addr(&self) -> Option<SocketAddr> {
		match self {
			Stream::Plain { read_half, .. } => read_half.peer_addr().ok(),
			Stream::Tls(tls) => tls.peer_addr().ok(),
		}
	}
}

impl fmt::Debug for Stream {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let kind = match self {
			Stream::Plain { .. } => "tcp",
			Stream::Tls(_) => "tls",
		};
		match self.peer_addr() {
			Some(addr) => write!(f, "{}://{}", kind, addr),
			None => write!(f, "{}://?", kind),
		}
	}
}

/// Opens a stream to `addr` per the configuration, wrapping it in TLS when
/// configured and writing the subport prelude when `subport` is not -1.
pub fn open_stream(
	addr: &SocketAddr,
	config: &MessagingConfig,
	subport: i32,
) -> Result<Stream, Error> {
	let sock = connect_socket(addr, config)?;
	tune_socket(&sock, &config.tcp);

	let stream = match &config.tls {
		Some(tls_config) => Stream::Tls(TlsStream::connect(sock, tls_config)?),
		None => {
			let read_half = sock.try_clone().map_err(Error::Connection)?;
			Stream::Plain {
				read_half,
				write_half: Mutex::new(sock),
			}
		}
	};

	if subport != -1 {
		let mut prelude = [0u8; 8];
		prelude[..4].copy_from_slice(&MULTIPLEX_PROTOCOL_ID.to_be_bytes());
		prelude[4..].copy_from_slice(&subport.to_be_bytes());
		stream.write_all(&prelude).map_err(Error::Connection)?;
		trace!("selected subport {} on {}", subport, addr);
	}

	Ok(stream)
}

fn connect_socket(addr: &SocketAddr, config: &MessagingConfig) -> Result<TcpStream, Error> {
	let tcp = &config.tcp;
	if let Some(local) = &tcp.local_address {
		// binding a local address goes through a builder; the builder
		// connect cannot be deadline-bounded
		let local: SocketAddr = local
			.parse()
			.map_err(|_| Error::Config(format!("invalid local address \"{}\"", local)))?;
		let builder = if addr.is_ipv4() {
			TcpBuilder::new_v4()
		} else {
			TcpBuilder::new_v6()
		}
		.map_err(Error::Connection)?;
		if tcp.reuse_address {
			if let Err(e) = builder.reuse_address(true) {
				warn!("unable to set SO_REUSEADDR: {}", e);
			}
		}
		builder.bind(local).map_err(Error::Connection)?;
		builder.connect(addr).map_err(Error::Connection)
	} else {
		match config.connect_timeout() {
			Some(timeout) => {
				TcpStream::connect_timeout(addr, timeout).map_err(Error::Connection)
			}
			None => TcpStream::connect(addr).map_err(Error::Connection),
		}
	}
}

// Socket options are advisory: a platform refusing one is worth a warning,
// never a failed connect.
fn tune_socket(sock: &TcpStream, tcp: &TcpOptions) {
	if let Err(e) = sock.set_nodelay(tcp.no_delay) {
		warn!("unable to set TCP_NODELAY on {:?}: {}", sock.peer_addr(), e);
	}
	let keepalive = if tcp.keep_alive {
		Some(Duration::from_secs(60))
	} else {
		None
	};
	if let Err(e) = TcpStreamExt::set_keepalive(sock, keepalive) {
		warn!("unable to set SO_KEEPALIVE: {}", e);
	}
	if tcp.receive_buffer_size > 0 {
		if let Err(e) = TcpStreamExt::set_recv_buffer_size(sock, tcp.receive_buffer_size) {
			warn!("unable to set SO_RCVBUF to {}: {}", tcp.receive_buffer_size, e);
		}
	}
	if tcp.send_buffer_size > 0 {
		if let Err(e) = TcpStreamExt::set_send_buffer_size(sock, tcp.send_buffer_size) {
			warn!("unable to set SO_SNDBUF to {}: {}", tcp.send_buffer_size, e);
		}
	}
	if tcp.linger_timeout_ms >= 0 {
		let linger = Duration::from_millis(tcp.linger_timeout_ms as u64);
		if let Err(e) = TcpStreamExt::set_linger(sock, Some(linger)) {
			warn!("unable to set SO_LINGER to {:?}: {}", linger, e);
		}
	}
}
