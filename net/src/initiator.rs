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

//! The client-role connection factory. `ensure_connection` hands out the
//! current open connection or establishes a new one, walking the address
//! provider's candidates and any redirect targets the cluster answers
//! with before giving up.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::util::Mutex;

use crate::channel::{IdentityTransformer, Principal, Receiver};
use crate::codec::{Codec, Serializer, StreamFilter};
use crate::conn::Connection;
use crate::peer::{Peer, PeerShared, ServiceState};
use crate::protocol::Protocol;
use crate::types::{ConnectionListener, Error, MessagingConfig};

/// Bound on redirect hops followed within one open attempt.
const MAX_REDIRECT_HOPS: usize = 8;

/// Produces candidate endpoints for connection opens and learns from the
/// outcome: `accept` after a successful open, `reject` for a dead
/// candidate.
pub trait AddressProvider: Send {
	/// The next candidate, or `None` once the current round is exhausted.
	/// A drained provider re-arms for the next round.
	fn next_address(&mut self) -> Option<SocketAddr>;

	/// The previously returned candidate produced an open connection.
	fn accept(&mut self) {}

	/// The previously returned candidate failed.
	fn reject(&mut self, _cause: &Error) {}
}

/// Default provider: cycles through the configured addresses, restarting
/// each round at the last accepted candidate.
pub struct RoundRobinProvider {
	addresses: Vec<SocketAddr>,
	next: usize,
	remaining: usize,
}

impl RoundRobinProvider {
	/// Resolves the configured `host:port` strings. Fails when nothing
	/// resolves.
	pub fn from_config(config: &MessagingConfig) -> Result<RoundRobinProvider, Error> {
		let mut addresses = vec![];
		for entry in &config.remote_addresses {
			match entry.to_socket_addrs() {
				Ok(resolved) => addresses.extend(resolved),
				Err(e) => warn!("skipping unresolvable address \"{}\": {}", entry, e),
			}
		}
		if addresses.is_empty() {
			return Err(Error::Config(
				"no resolvable remote addresses configured".into(),
			));
		}
		let remaining = addresses.len();
		Ok(RoundRobinProvider {
			addresses,
			next: 0,
			remaining,
		})
	}
}

impl AddressProvider for RoundRobinProvider {
	fn next_address(&mut self) -> Option<SocketAddr> {
		if self.remaining == 0 {
			// round over; re-arm for the next one
			self.remaining = self.addresses.len();
			return None;
		}
		let addr = self.addresses[self.next % self.addresses.len()];
		self.next = (self.next + 1) % self.addresses.len();
		self.remaining -= 1;
		Some(addr)
	}

	fn accept(&mut self) {
		// start the next round from the address that just worked
		self.next = if self.next == 0 {
			self.addresses.len() - 1
		} else {
			self.next - 1
		};
		self.remaining = self.addresses.len();
	}

	fn reject(&mut self, _cause: &Error) {}
}

/// Splits a port32 into (base port, subport). Plain ports carry no
/// subport; extended ports pack both into the complement.
pub fn parse_port32(port32: i32) -> (i32, i32) {
	let inv = !port32;
	if inv >> 16 == -1 {
		return (port32, -1);
	}
	let base = inv >> 16;
	let sub = inv & 0xFFFF;
	if base < -1 {
		// high half reinterpreted as unsigned
		((inv as u32 >> 16) as i32, sub)
	} else {
		(base, sub)
	}
}

/// Packs a base port and subport into a port32; the inverse of
/// `parse_port32`.
pub fn make_port32(port: u16, subport: i32) -> i32 {
	if subport < 0 {
		i32::from(port)
	} else {
		!((u32::from(port) << 16 | (subport as u32 & 0xFFFF)) as i32)
	}
}

enum OpenOutcome {
	Opened(Arc<Connection>),
	Redirected(Vec<(String, i32)>),
}

/// Client-role initiator over TCP (or TLS): owns at most one connection
/// at a time and the peer service driving it.
pub struct TcpInitiator {
	peer: Peer,
	provider: Mutex<Box<dyn AddressProvider>>,
	// doubles as the per-initiator ensure lock
	current: Mutex<Option<Arc<Connection>>>,
}

impl TcpInitiator {
	/// An initiator over the default round-robin provider built from the
	/// configured remote addresses.
	pub fn new(config: MessagingConfig) -> Result<TcpInitiator, Error> {
		let provider = Box::new(RoundRobinProvider::from_config(&config)?);
		TcpInitiator::with_provider(config, provider)
	}

	/// An initiator over a custom address provider.
	pub fn with_provider(
		config: MessagingConfig,
		provider: Box<dyn AddressProvider>,
	) -> Result<TcpInitiator, Error> {
		Ok(TcpInitiator {
			peer: Peer::new(config)?,
			provider: Mutex::new(provider),
			current: Mutex::new(None),
		})
	}

	/// Registers a protocol with the underlying peer.
	pub fn register_protocol(&mut self, protocol: Protocol) -> Result<(), Error> {
		self.peer.register_protocol(protocol)
	}

	/// Registers a default receiver with the underlying peer.
	pub fn register_receiver(&mut self, receiver: Arc<dyn Receiver>) -> Result<(), Error> {
		self.peer.register_receiver(receiver)
	}

	/// Registers a named stream filter.
	pub fn register_filter(&mut self, filter: Arc<dyn StreamFilter>) -> Result<(), Error> {
		self.peer.register_filter(filter)
	}

	/// Subscribes a connection lifecycle listener.
	pub fn add_listener(&mut self, listener: Arc<dyn ConnectionListener>) -> Result<(), Error> {
		self.peer.add_listener(listener)
	}

	/// Replaces the message codec.
	pub fn set_codec(&mut self, codec: Arc<dyn Codec>) -> Result<(), Error> {
		self.peer.set_codec(codec)
	}

	/// Replaces the channel payload serializer.
	pub fn set_serializer(&mut self, serializer: Arc<dyn Serializer>) -> Result<(), Error> {
		self.peer.set_serializer(serializer)
	}

	/// Sets the principal asserted on opens.
	pub fn set_principal(&mut self, principal: Arc<dyn Principal>) -> Result<(), Error> {
		self.peer.set_principal(principal)
	}

	/// Replaces the identity transformer.
	pub fn set_identity_transformer(
		&mut self,
		identity: Arc<dyn IdentityTransformer>,
	) -> Result<(), Error> {
		self.peer.set_identity_transformer(identity)
	}

	/// Starts the peer service. Connections can be ensured afterwards.
	pub fn start(&mut self) -> Result<(), Error> {
		self.peer.start()
	}

	/// Releases the current connection and stops the peer service.
	pub fn stop(&mut self) {
		if let Some(conn) = self.current.lock().take() {
			conn.close();
		}
		self.peer.stop();
	}

	/// Lifecycle state of the underlying peer service.
	pub fn state(&self) -> ServiceState {
		self.peer.state()
	}

	/// The underlying peer service.
	pub fn peer(&self) -> &Peer {
		&self.peer
	}

	/// Returns the current connection, opening one if none is open.
	/// Serialized per initiator: concurrent callers share the outcome.
	pub fn ensure_connection(&self) -> Result<Arc<Connection>, Error> {
		let mut current = self.current.lock();
		if let Some(conn) = current.as_ref() {
			if conn.is_open() {
				return Ok(conn.clone());
			}
		}
		*current = None;

		let conn = self.open_connection()?;
		*current = Some(conn.clone());
		Ok(conn)
	}

	fn open_connection(&self) -> Result<Arc<Connection>, Error> {
		let shared = self.peer.shared()?;
		let mut provider = self.provider.lock();
		let mut attempted: Vec<String> = vec![];

		while let Some(addr) = provider.next_address() {
			attempted.push(addr.to_string());
			match self.try_open(&shared, addr, shared.config.subport) {
				Ok(OpenOutcome::Opened(conn)) => {
					provider.accept();
					return Ok(conn);
				}
				Ok(OpenOutcome::Redirected(targets)) => {
					// walk the redirect targets before asking the provider
					// for anything else
					match self.follow_redirects(&shared, targets, &mut attempted) {
						Some(conn) => {
							provider.accept();
							return Ok(conn);
						}
						None => continue,
					}
				}
				Err(e) => {
					warn!("unable to open a connection to {}: {}", addr, e);
					provider.reject(&e);
				}
			}
		}

		Err(Error::Exhausted(attempted))
	}

	fn follow_redirects(
		&self,
		shared: &Arc<PeerShared>,
		targets: Vec<(String, i32)>,
		attempted: &mut Vec<String>,
	) -> Option<Arc<Connection>> {
		let mut queue: VecDeque<(String, i32)> = targets.into();
		let mut hops = 0;

		while let Some((host, port32)) = queue.pop_front() {
			if hops >= MAX_REDIRECT_HOPS {
				warn!("abandoning redirect chain after {} hops", hops);
				return None;
			}
			hops += 1;

			let (port, subport) = parse_port32(port32);
			if port < 0 || port > i32::from(u16::max_value()) {
				warn!("skipping redirect target {} with invalid port32 {}", host, port32);
				continue;
			}
			let resolved = match (host.as_str(), port as u16).to_socket_addrs() {
				Ok(resolved) => resolved,
				Err(e) => {
					warn!("skipping unresolvable redirect target {}: {}", host, e);
					continue;
				}
			};

			for addr in resolved {
				attempted.push(addr.to_string());
				match self.try_open(shared, addr, subport) {
					Ok(OpenOutcome::Opened(conn)) => return Some(conn),
					Ok(OpenOutcome::Redirected(more)) => {
						queue.extend(more);
						break;
					}
					Err(e) => {
						warn!("redirect target {} failed: {}", addr, e);
					}
				}
			}
		}
		None
	}

	fn try_open(
		&self,
		shared: &Arc<PeerShared>,
		addr: SocketAddr,
		subport: i32,
	) -> Result<OpenOutcome, Error> {
		let conn = Connection::connect(shared, addr, subport)?;
		match conn.open() {
			Ok(None) => Ok(OpenOutcome::Opened(conn)),
			Ok(Some(targets)) => Ok(OpenOutcome::Redirected(targets)),
			Err(e) => Err(e),
		}
	}
}

impl Drop for TcpInitiator {
	fn drop(&mut self) {
		self.stop();
	}
}
