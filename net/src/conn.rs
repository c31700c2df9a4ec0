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

//! The stateful wrapper around one stream to a cluster endpoint. A
//! connection owns its transport, the set of open channels and a dedicated
//! read loop; every inbound frame is handed to the peer's service queue
//! untouched. Sends happen on the calling thread.
//!
//! Once closed a connection is done for; reconnecting means a new one.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::util::{to_hex, Mutex, RateCounter, RwLock};

use crate::channel::{Channel, Receiver};
use crate::codec;
use crate::core::ser::BinWriter;
use crate::frame;
use crate::msg::{
	self, AcceptChannelRequest, CreateChannelRequest, Message, NotifyConnectionClosed,
	OpenConnectionRequest, PeerResponse, PingRequest, ProtocolRange, ResponseResult,
};
use crate::peer::{PeerShared, Task};
use crate::transport::{self, Stream};
use crate::types::{CloseCause, ConnStats, ConnectionEvent, Error, PeerStats, CONTROL_CHANNEL_ID};

#[derive(Debug, Clone, Copy, PartialEq)]
enum ConnState {
	Initial,
	Opening,
	Open,
	Closing,
	Closed,
}

/// One open (or opening, or torn down) connection to a cluster endpoint.
pub struct Connection {
	id: Uuid,
	self_ref: Weak<Connection>,
	remote: SocketAddr,
	established: DateTime<Utc>,
	peer: Arc<PeerShared>,
	stream: Stream,
	state: Mutex<ConnState>,
	channels: RwLock<HashMap<i32, Arc<Channel>>>,
	negotiated: RwLock<HashMap<String, i32>>,
	ping_sent: Mutex<Option<Instant>>,
	stats: ConnStats,
	sent_rate: RwLock<RateCounter>,
	recv_rate: RwLock<RateCounter>,
	reader_stop: Arc<AtomicBool>,
	reader_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
	/// Establishes the transport to `addr` and prepares the control
	/// channel and read loop. The connection is not open until `open`
	/// completes the handshake.
	pub(crate) fn connect(
		peer: &Arc<PeerShared>,
		addr: SocketAddr,
		subport: i32,
	) -> Result<Arc<Connection>, Error> {
		debug!("connecting to {} (subport {})", addr, subport);
		let stream = transport::open_stream(&addr, &peer.config, subport)?;

		let conn = Arc::new_cyclic(|me| Connection {
			id: Uuid::new_v4(),
			self_ref: me.clone(),
			remote: addr,
			established: Utc::now(),
			peer: peer.clone(),
			stream,
			state: Mutex::new(ConnState::Initial),
			channels: RwLock::new(HashMap::new()),
			negotiated: RwLock::new(HashMap::new()),
			ping_sent: Mutex::new(None),
			stats: ConnStats::default(),
			sent_rate: RwLock::new(RateCounter::new()),
			recv_rate: RwLock::new(RateCounter::new()),
			reader_stop: Arc::new(AtomicBool::new(false)),
			reader_thread: Mutex::new(None),
		});

		*conn.state.lock() = ConnState::Opening;

		let ch0 = Channel::new(
			CONTROL_CHANNEL_ID,
			Arc::downgrade(&conn),
			peer.serializer.clone(),
			peer.control_factory.clone(),
			None,
			peer.principal.clone(),
		);
		ch0.mark_open();
		conn.channels.write().insert(CONTROL_CHANNEL_ID, ch0);

		conn.spawn_reader()?;
		Ok(conn)
	}

	/// Unique id of this connection.
	pub fn id(&self) -> Uuid {
		self.id
	}

	/// The endpoint this connection talks to.
	pub fn remote_addr(&self) -> SocketAddr {
		self.remote
	}

	/// When the transport was established.
	pub fn established(&self) -> DateTime<Utc> {
		self.established
	}

	/// Whether the open handshake has completed and no close has begun.
	pub fn is_open(&self) -> bool {
		*self.state.lock() == ConnState::Open
	}

	pub(crate) fn is_usable(&self) -> bool {
		match *self.state.lock() {
			ConnState::Opening | ConnState::Open => true,
			_ => false,
		}
	}

	/// Cumulative transfer counters.
	pub fn stats(&self) -> &ConnStats {
		&self.stats
	}

	/// Bytes sent and received over the last minute.
	pub fn transfer_rates(&self) -> (u64, u64) {
		(
			self.sent_rate.read().bytes_per_min(),
			self.recv_rate.read().bytes_per_min(),
		)
	}

	/// The negotiated version of a protocol, once the connection is open.
	pub fn negotiated_version(&self, protocol: &str) -> Option<i32> {
		self.negotiated.read().get(protocol).cloned()
	}

	/// The channel registered under `id`, including the control channel 0.
	pub fn channel(&self, id: i32) -> Option<Arc<Channel>> {
		self.channels.read().get(&id).cloned()
	}

	/// Number of channels currently registered, control channel included.
	pub fn channel_count(&self) -> usize {
		self.channels.read().len()
	}

	pub(crate) fn remove_channel(&self, id: i32) {
		self.channels.write().remove(&id);
	}

	pub(crate) fn request_timeout(&self) -> Option<Duration> {
		self.peer.config.request_timeout()
	}

	pub(crate) fn peer_stats(&self) -> &PeerStats {
		&self.peer.stats
	}

	pub(crate) fn ping_outstanding(&self) -> Option<Instant> {
		*self.ping_sent.lock()
	}

	pub(crate) fn clear_ping(&self) {
		*self.ping_sent.lock() = None;
	}

	/// Emits a heartbeat on the control channel. At most one is in flight;
	/// callers check `ping_outstanding` first.
	pub(crate) fn send_ping(&self) {
		let ch0 = match self.channel(CONTROL_CHANNEL_ID) {
			Some(c) => c,
			None => return,
		};
		let ping = PingRequest {
			request_id: ch0.next_request_id(),
		};
		match self.post(&ch0, &ping) {
			Ok(()) => *self.ping_sent.lock() = Some(Instant::now()),
			Err(e) => debug!("unable to send ping on connection {}: {}", self.id, e),
		}
	}

	/// Performs the open handshake on the calling thread: version
	/// negotiation and identity assertion, bounded by the connect timeout.
	/// Returns redirect targets instead when the cluster answers with
	/// them; the connection is torn down in every non-open outcome.
	pub(crate) fn open(&self) -> Result<Option<Vec<(String, i32)>>, Error> {
		let peer = &self.peer;
		let token = match peer.identity.transform(peer.principal.as_deref()) {
			Ok(token) => token,
			Err(e) => {
				self.close_with(false, CloseCause::Failure(e.to_string()));
				return Err(e);
			}
		};

		let mut ranges: Vec<ProtocolRange> = peer
			.protocols
			.values()
			.map(|p| ProtocolRange {
				name: p.name().to_string(),
				current_version: p.current_version(),
				min_version: p.min_version(),
			})
			.collect();
		ranges.sort_by(|a, b| a.name.cmp(&b.name));

		let request = OpenConnectionRequest {
			request_id: 0,
			client_id: self.id.to_string(),
			protocols: ranges,
			identity_token: token,
		};

		let ch0 = match self.channel(CONTROL_CHANNEL_ID) {
			Some(c) => c,
			None => return Err(Error::ConnectionClosed("control channel is gone".into())),
		};

		let response =
			match ch0.request_with_timeout(Box::new(request), peer.config.connect_timeout()) {
				Ok(r) => r,
				Err(e) => {
					self.close_with(false, CloseCause::Failure(format!("open failed: {}", e)));
					return Err(e);
				}
			};

		let response = match response.as_any().downcast_ref::<PeerResponse>() {
			Some(r) => r,
			None => {
				let e = Error::ProtocolMismatch("unexpected open connection response".into());
				self.close_with(false, CloseCause::Failure(e.to_string()));
				return Err(e);
			}
		};

		if response.failure {
			let reason = response.text().unwrap_or("connection rejected").to_string();
			self.close_with(false, CloseCause::Failure(reason.clone()));
			return Err(Error::ConnectionClosed(reason));
		}

		match &response.result {
			ResponseResult::Redirect(targets) => {
				let targets = targets.clone();
				debug!(
					"connection to {} redirected to {} target(s)",
					self.remote,
					targets.len()
				);
				self.close_with(false, CloseCause::Local);
				Ok(Some(targets))
			}
			ResponseResult::Versions(versions) => {
				for protocol in peer.protocols.values() {
					let negotiated = versions
						.iter()
						.find(|(name, _)| name == protocol.name())
						.map(|(_, version)| *version);
					let result = match negotiated {
						Some(version) => protocol.check_negotiated(version),
						None => Err(Error::ProtocolMismatch(format!(
							"peer did not negotiate protocol {}",
							protocol.name()
						))),
					};
					if let Err(e) = result {
						self.close_with(false, CloseCause::Failure(e.to_string()));
						return Err(e);
					}
				}
				*self.negotiated.write() = versions.iter().cloned().collect();
				*self.state.lock() = ConnState::Open;
				if let Some(me) = self.self_ref.upgrade() {
					self.peer.set_current(&me);
				}
				info!("connection {} to {} open", self.id, self.remote);
				self.peer.emit(&ConnectionEvent::Opened {
					id: self.id,
					remote: self.remote.to_string(),
					at: self.established,
				});
				Ok(None)
			}
			other => {
				let e = Error::ProtocolMismatch(format!(
					"unexpected open connection result {:?}",
					other
				));
				self.close_with(false, CloseCause::Failure(e.to_string()));
				Err(e)
			}
		}
	}

	/// Opens a channel for a registered protocol: reserves an id through
	/// the control channel, then activates it asserting the configured
	/// identity. The receiver, explicit or registered with the peer, must
	/// speak the protocol.
	pub fn open_channel(
		&self,
		protocol_name: &str,
		receiver: Option<Arc<dyn Receiver>>,
	) -> Result<Arc<Channel>, Error> {
		let peer = &self.peer;
		let protocol = peer.protocols.get(protocol_name).ok_or_else(|| {
			Error::ProtocolMismatch(format!("unknown protocol {}", protocol_name))
		})?;

		let receiver = receiver.or_else(|| peer.receivers.get(protocol_name).cloned());
		if let Some(r) = &receiver {
			if r.protocol() != protocol_name {
				return Err(Error::ProtocolMismatch(format!(
					"receiver speaks {}, channel requires {}",
					r.protocol(),
					protocol_name
				)));
			}
		}

		let version = self
			.negotiated_version(protocol_name)
			.ok_or_else(|| {
				Error::ProtocolMismatch(format!(
					"no negotiated version for protocol {}",
					protocol_name
				))
			})?;
		let factory = protocol.factory(version).ok_or_else(|| {
			Error::ProtocolMismatch(format!(
				"no message factory for protocol {} version {}",
				protocol_name, version
			))
		})?;

		let ch0 = self
			.channel(CONTROL_CHANNEL_ID)
			.ok_or_else(|| Error::ConnectionClosed("control channel is gone".into()))?;

		// phase one: the peer reserves an id
		let reserve = CreateChannelRequest {
			request_id: 0,
			protocol: protocol_name.to_string(),
			current_version: protocol.current_version(),
			min_version: protocol.min_version(),
		};
		let response = ch0.request(Box::new(reserve))?;
		let channel_id = match expect_response(&response)? {
			(false, ResponseResult::ChannelId(id)) if *id > 0 => *id,
			(true, _) => {
				let reason = response
					.as_any()
					.downcast_ref::<PeerResponse>()
					.and_then(|r| r.text())
					.unwrap_or("channel rejected");
				return Err(Error::ChannelClosed {
					channel: -1,
					reason: reason.to_string(),
				});
			}
			_ => {
				return Err(Error::ProtocolMismatch(
					"unexpected create channel result".into(),
				))
			}
		};

		let channel = Channel::new(
			channel_id,
			self.self_ref.clone(),
			peer.serializer.clone(),
			factory,
			receiver,
			peer.principal.clone(),
		);
		// registered before activation so early inbound traffic resolves
		self.channels.write().insert(channel_id, channel.clone());

		// phase two: activate, asserting identity
		let token = peer.identity.transform(peer.principal.as_deref())?;
		let accept = AcceptChannelRequest {
			request_id: 0,
			channel_id,
			identity_token: token,
		};
		match ch0.request(Box::new(accept)) {
			Ok(response) => match expect_response(&response)? {
				(false, _) => {}
				(true, _) => {
					self.remove_channel(channel_id);
					let reason = response
						.as_any()
						.downcast_ref::<PeerResponse>()
						.and_then(|r| r.text())
						.unwrap_or("channel not accepted");
					return Err(Error::ChannelClosed {
						channel: channel_id,
						reason: reason.to_string(),
					});
				}
			},
			Err(e) => {
				self.remove_channel(channel_id);
				return Err(e);
			}
		}

		channel.mark_open();
		debug!(
			"channel {} open for protocol {} version {}",
			channel_id, protocol_name, version
		);
		Ok(channel)
	}

	/// Encodes and writes one message for `channel`. Encode failures
	/// schedule the channel (the connection for channel 0) for close;
	/// write failures schedule an abortive connection close.
	pub(crate) fn post(
		&self,
		channel: &Channel,
		message: &dyn Message,
	) -> Result<(), Error> {
		self.post_message(channel, message, false)
	}

	fn post_message(
		&self,
		channel: &Channel,
		message: &dyn Message,
		closing_ok: bool,
	) -> Result<(), Error> {
		{
			let state = self.state.lock();
			let usable = match *state {
				ConnState::Opening | ConnState::Open => true,
				ConnState::Closing => closing_ok,
				_ => false,
			};
			if !usable {
				return Err(Error::ConnectionClosed("connection is not open".into()));
			}
		}

		let frame = match self.encode_message(channel, message) {
			Ok(frame) => frame,
			Err(e) => {
				warn!(
					"unable to encode {} for channel {}: {}",
					msg::type_name(message.type_id()),
					channel.id(),
					e
				);
				self.schedule_close_for(channel, &e);
				return Err(e);
			}
		};

		if self.peer.debug {
			debug!(
				"sent {} on channel {}: {}",
				msg::type_name(message.type_id()),
				channel.id(),
				to_hex(&frame)
			);
		}

		if let Err(e) = self.stream.write_all(&frame) {
			warn!("write failed on connection {}: {}", self.id, e);
			if let Some(me) = self.self_ref.upgrade() {
				let cause = CloseCause::Failure(format!("write failed: {}", e));
				let _ = self.peer.queue.send(Task::CloseConnection {
					conn: me,
					notify: false,
					cause,
				});
			}
			return Err(Error::Connection(e));
		}

		self.stats
			.bytes_sent
			.fetch_add(frame.len() as u64, Ordering::Relaxed);
		self.stats.msgs_sent.fetch_add(1, Ordering::Relaxed);
		self.sent_rate.write().inc(frame.len() as u64);
		Ok(())
	}

	fn encode_message(&self, channel: &Channel, message: &dyn Message) -> Result<Vec<u8>, Error> {
		let mut body = Vec::with_capacity(64);
		{
			let mut writer = BinWriter::new(&mut body);
			self.peer.codec.encode(channel, message, &mut writer)?;
		}
		let body = codec::apply_write(&self.peer.filters, body)?;
		frame::encode_frame(
			channel.id(),
			&body,
			self.peer.config.max_outgoing_message_size,
		)
	}

	fn schedule_close_for(&self, channel: &Channel, cause: &Error) {
		if channel.id() == CONTROL_CHANNEL_ID {
			if let Some(me) = self.self_ref.upgrade() {
				let _ = self.peer.queue.send(Task::CloseConnection {
					conn: me,
					notify: true,
					cause: CloseCause::Failure(cause.to_string()),
				});
			}
		} else if let Some(channel) = self.channel(channel.id()) {
			let _ = self.peer.queue.send(Task::CloseChannel {
				channel,
				notify: true,
				reason: cause.to_string(),
			});
		}
	}

	/// Gracefully releases the connection: the peer is notified on the
	/// control channel, then everything is torn down. Closing twice has no
	/// further effect.
	pub fn close(&self) {
		self.close_with(true, CloseCause::Local);
	}

	pub(crate) fn close_with(&self, notify: bool, cause: CloseCause) {
		{
			let mut state = self.state.lock();
			match *state {
				ConnState::Closing | ConnState::Closed => return,
				_ => *state = ConnState::Closing,
			}
		}

		let reason = cause.reason().to_string();
		if cause.is_failure() {
			warn!(
				"closing connection {} to {}: {}",
				self.id, self.remote, reason
			);
		} else {
			debug!(
				"closing connection {} to {}: {}",
				self.id, self.remote, reason
			);
		}

		if notify {
			if let Some(ch0) = self.channel(CONTROL_CHANNEL_ID) {
				let release = NotifyConnectionClosed {
					reason: reason.clone(),
				};
				if let Err(e) = self.post_message(&ch0, &release, true) {
					debug!("unable to notify peer of connection close: {}", e);
				}
			}
		}

		// stop the read loop, then the stream and transport beneath it
		self.reader_stop.store(true, Ordering::SeqCst);
		self.stream.shutdown();
		if let Some(handle) = self.reader_thread.lock().take() {
			if thread::current().id() != handle.thread().id() {
				let _ = handle.join();
			}
		}

		// fail every waiter on every channel with the close cause
		let channels: Vec<Arc<Channel>> =
			self.channels.write().drain().map(|(_, c)| c).collect();
		for channel in channels {
			channel.force_close(&reason);
		}

		self.clear_ping();
		*self.state.lock() = ConnState::Closed;
		self.peer.clear_current(self);

		let event = if cause.is_failure() {
			ConnectionEvent::Error {
				id: self.id,
				reason,
			}
		} else {
			ConnectionEvent::Closed {
				id: self.id,
				reason,
			}
		};
		self.peer.emit(&event);
	}

	fn spawn_reader(&self) -> Result<(), Error> {
		let conn = match self.self_ref.upgrade() {
			Some(me) => me,
			None => return Err(Error::ConnectionClosed("connection is gone".into())),
		};
		let stop = self.reader_stop.clone();
		let max_incoming = self.peer.config.max_incoming_message_size;
		let handle = thread::Builder::new()
			.name("grid-recv".to_string())
			.spawn(move || {
				loop {
					if stop.load(Ordering::SeqCst) {
						break;
					}
					match frame::read_frame(&conn.stream, max_incoming) {
						Ok((data, total)) => {
							conn.stats
								.bytes_received
								.fetch_add(total, Ordering::Relaxed);
							conn.recv_rate.write().inc(total);
							let task = Task::EncodedMessage {
								conn: conn.clone(),
								data,
							};
							if conn.peer.queue.send(task).is_err() {
								break;
							}
						}
						Err(e) => {
							if stop.load(Ordering::SeqCst) {
								break;
							}
							if is_disconnect(&e) {
								debug!(
									"connection {} to {}: peer closed the stream",
									conn.id, conn.remote
								);
								conn.close_with(
									false,
									CloseCause::Failure("end of stream".to_string()),
								);
							} else {
								error!(
									"read failed on connection {} to {}: {}",
									conn.id, conn.remote, e
								);
								conn.close_with(false, CloseCause::Failure(e.to_string()));
							}
							break;
						}
					}
				}
				trace!("read loop for connection {} exited", conn.id);
			})
			.map_err(Error::Connection)?;
		*self.reader_thread.lock() = Some(handle);
		Ok(())
	}
}

fn is_disconnect(e: &Error) -> bool {
	match e {
		Error::Connection(io_err) => match io_err.kind() {
			io::ErrorKind::UnexpectedEof
			| io::ErrorKind::ConnectionAborted
			| io::ErrorKind::ConnectionReset
			| io::ErrorKind::BrokenPipe => true,
			_ => false,
		},
		_ => false,
	}
}

fn expect_response(message: &Box<dyn Message>) -> Result<(bool, &ResponseResult), Error> {
	match message.as_any().downcast_ref::<PeerResponse>() {
		Some(response) => Ok((response.failure, &response.result)),
		None => Err(Error::ProtocolMismatch("unexpected response message".into())),
	}
}
