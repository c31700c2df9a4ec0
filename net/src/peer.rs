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

//! The peer service: one thread owning an ordered work queue. Inbound
//! frames are decoded and dispatched here, correlated responses delivered
//! to their waiters, heartbeats emitted and checked, and deferred closes
//! carried out between work items. The service thread never blocks waiting
//! for any individual response.

use std::collections::HashMap;
use std::env;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::util::{to_hex, Mutex, RwLock};

use crate::channel::{
	Channel, IdentityTransformer, NameTokenTransformer, Principal, Receiver as MsgReceiver,
};
use crate::codec::{self, BinaryCodec, BinarySerializer, Codec, FilterRegistry, Serializer,
	StreamFilter};
use crate::conn::Connection;
use crate::core::ser::{BufReader, Reader};
use crate::msg::{
	self, CloseChannelRequest, CloseConnectionRequest, CreateChannelRequest, Message,
	NotifyChannelClosed, NotifyConnectionClosed, PeerResponse, PingRequest, PingResponse,
	ResponseResult,
};
use crate::protocol::{messaging_protocol, MessageFactory, Protocol, MESSAGING_PROTOCOL,
	MESSAGING_VERSION};
use crate::types::{
	CloseCause, ConnectionEvent, ConnectionListener, Error, MessagingConfig, PeerStats,
	CONTROL_CHANNEL_ID, MESSAGING_DEBUG_ENV,
};

/// Lifecycle of the peer service. States only ever advance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServiceState {
	Initial,
	Starting,
	Started,
	Stopping,
	Stopped,
}

/// Work items processed in order by the service thread.
pub(crate) enum Task {
	/// A raw inbound frame, starting at its packed channel id.
	EncodedMessage { conn: Arc<Connection>, data: Bytes },
	/// Deferred close of one channel.
	CloseChannel {
		channel: Arc<Channel>,
		notify: bool,
		reason: String,
	},
	/// Deferred close of a whole connection.
	CloseConnection {
		conn: Arc<Connection>,
		notify: bool,
		cause: CloseCause,
	},
	/// Posted by the service to itself when it comes up.
	NotifyStartup,
	/// Stops the service loop after closing the current connection.
	NotifyShutdown,
}

/// Everything the service thread, connections and channels share. Frozen
/// at service start.
pub(crate) struct PeerShared {
	pub config: MessagingConfig,
	pub codec: Arc<dyn Codec>,
	pub filters: Vec<Arc<dyn StreamFilter>>,
	pub protocols: HashMap<String, Arc<Protocol>>,
	pub receivers: HashMap<String, Arc<dyn MsgReceiver>>,
	pub listeners: Vec<Arc<dyn ConnectionListener>>,
	pub serializer: Arc<dyn Serializer>,
	pub control_factory: Arc<dyn MessageFactory>,
	pub identity: Arc<dyn IdentityTransformer>,
	pub principal: Option<Arc<dyn Principal>>,
	pub queue: Sender<Task>,
	pub stats: PeerStats,
	pub current: RwLock<Weak<Connection>>,
	pub debug: bool,
}

impl PeerShared {
	pub fn emit(&self, event: &ConnectionEvent) {
		for listener in &self.listeners {
			listener.on_event(event);
		}
	}

	pub fn set_current(&self, conn: &Arc<Connection>) {
		*self.current.write() = Arc::downgrade(conn);
	}

	pub fn clear_current(&self, conn: &Connection) {
		let mut current = self.current.write();
		if let Some(c) = current.upgrade() {
			if c.id() == conn.id() {
				*current = Weak::new();
			}
		}
	}

	pub fn current(&self) -> Option<Arc<Connection>> {
		self.current.read().upgrade()
	}
}

/// The client-side peer service. Owns the protocol and receiver
/// registries, the codec and filter configuration, and — once started —
/// the single service thread.
pub struct Peer {
	config: MessagingConfig,
	protocols: HashMap<String, Arc<Protocol>>,
	receivers: HashMap<String, Arc<dyn MsgReceiver>>,
	filter_registry: FilterRegistry,
	listeners: Vec<Arc<dyn ConnectionListener>>,
	codec: Arc<dyn Codec>,
	serializer: Arc<dyn Serializer>,
	identity: Arc<dyn IdentityTransformer>,
	principal: Option<Arc<dyn Principal>>,
	state: Arc<Mutex<ServiceState>>,
	shared: Option<Arc<PeerShared>>,
	handle: Option<JoinHandle<()>>,
}

impl Peer {
	/// A peer in its initial state. Registrations and configuration are
	/// only legal before `start`.
	pub fn new(config: MessagingConfig) -> Result<Peer, Error> {
		config.validate()?;
		let mut protocols = HashMap::new();
		let messaging = Arc::new(messaging_protocol());
		protocols.insert(messaging.name().to_string(), messaging);
		Ok(Peer {
			config,
			protocols,
			receivers: HashMap::new(),
			filter_registry: FilterRegistry::new(),
			listeners: vec![],
			codec: Arc::new(BinaryCodec),
			serializer: Arc::new(BinarySerializer),
			identity: Arc::new(NameTokenTransformer),
			principal: None,
			state: Arc::new(Mutex::new(ServiceState::Initial)),
			shared: None,
			handle: None,
		})
	}

	/// Current lifecycle state.
	pub fn state(&self) -> ServiceState {
		*self.state.lock()
	}

	fn check_initial(&self) -> Result<(), Error> {
		if self.state() != ServiceState::Initial {
			return Err(Error::Config(
				"configuration is only legal before the service starts".into(),
			));
		}
		Ok(())
	}

	/// Registers a protocol by name. The registry is frozen at start.
	pub fn register_protocol(&mut self, protocol: Protocol) -> Result<(), Error> {
		self.check_initial()?;
		self.protocols
			.insert(protocol.name().to_string(), Arc::new(protocol));
		Ok(())
	}

	/// Registers a default receiver for the protocol it advertises.
	pub fn register_receiver(&mut self, receiver: Arc<dyn MsgReceiver>) -> Result<(), Error> {
		self.check_initial()?;
		self.receivers
			.insert(receiver.protocol().to_string(), receiver);
		Ok(())
	}

	/// Adds a filter to the registry the configuration names resolve
	/// against.
	pub fn register_filter(&mut self, filter: Arc<dyn StreamFilter>) -> Result<(), Error> {
		self.check_initial()?;
		self.filter_registry.register(filter);
		Ok(())
	}

	/// Subscribes a connection lifecycle listener.
	pub fn add_listener(&mut self, listener: Arc<dyn ConnectionListener>) -> Result<(), Error> {
		self.check_initial()?;
		self.listeners.push(listener);
		Ok(())
	}

	/// Replaces the message codec.
	pub fn set_codec(&mut self, codec: Arc<dyn Codec>) -> Result<(), Error> {
		self.check_initial()?;
		self.codec = codec;
		Ok(())
	}

	/// Replaces the channel payload serializer.
	pub fn set_serializer(&mut self, serializer: Arc<dyn Serializer>) -> Result<(), Error> {
		self.check_initial()?;
		self.serializer = serializer;
		Ok(())
	}

	/// Sets the principal asserted on opens.
	pub fn set_principal(&mut self, principal: Arc<dyn Principal>) -> Result<(), Error> {
		self.check_initial()?;
		self.principal = Some(principal);
		Ok(())
	}

	/// Replaces the identity transformer producing open tokens.
	pub fn set_identity_transformer(
		&mut self,
		identity: Arc<dyn IdentityTransformer>,
	) -> Result<(), Error> {
		self.check_initial()?;
		self.identity = identity;
		Ok(())
	}

	/// Starts the service thread. The protocol, receiver and filter
	/// registries freeze here.
	pub fn start(&mut self) -> Result<(), Error> {
		self.check_initial()?;
		let filters = self.filter_registry.resolve(&self.config.filters)?;
		let control_factory = self
			.protocols
			.get(MESSAGING_PROTOCOL)
			.and_then(|p| p.factory(MESSAGING_VERSION))
			.ok_or_else(|| Error::Config("control protocol factory is missing".into()))?;
		let debug = env::var(MESSAGING_DEBUG_ENV)
			.map(|v| v == "true")
			.unwrap_or(false);

		let (tx, rx) = channel::unbounded();
		let shared = Arc::new(PeerShared {
			config: self.config.clone(),
			codec: self.codec.clone(),
			filters,
			protocols: self.protocols.clone(),
			receivers: self.receivers.clone(),
			listeners: self.listeners.clone(),
			serializer: self.serializer.clone(),
			control_factory,
			identity: self.identity.clone(),
			principal: self.principal.clone(),
			queue: tx.clone(),
			stats: PeerStats::default(),
			current: RwLock::new(Weak::new()),
			debug,
		});

		*self.state.lock() = ServiceState::Starting;
		let loop_shared = shared.clone();
		let loop_state = self.state.clone();
		let handle = thread::Builder::new()
			.name("grid-peer".to_string())
			.spawn(move || run_service(loop_shared, rx, loop_state))
			.map_err(Error::Connection)?;
		let _ = tx.send(Task::NotifyStartup);

		self.shared = Some(shared);
		self.handle = Some(handle);
		Ok(())
	}

	/// Stops the service: the current connection is released gracefully,
	/// then the service thread exits. Stopping twice has no effect.
	pub fn stop(&mut self) {
		{
			let mut state = self.state.lock();
			match *state {
				ServiceState::Starting | ServiceState::Started => {
					*state = ServiceState::Stopping
				}
				_ => return,
			}
		}
		if let Some(shared) = &self.shared {
			let _ = shared.queue.send(Task::NotifyShutdown);
		}
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
	}

	/// Service counters, live once started.
	pub fn stats(&self) -> Option<&PeerStats> {
		self.shared.as_ref().map(|s| &s.stats)
	}

	pub(crate) fn shared(&self) -> Result<Arc<PeerShared>, Error> {
		self.shared
			.clone()
			.ok_or_else(|| Error::Config("the messaging service is not started".into()))
	}
}

impl Drop for Peer {
	fn drop(&mut self) {
		self.stop();
	}
}

const BASE_WAIT: Duration = Duration::from_millis(250);

fn run_service(shared: Arc<PeerShared>, queue: Receiver<Task>, state: Arc<Mutex<ServiceState>>) {
	let heartbeat = shared.config.heartbeat();
	let mut next_ping = heartbeat.map(|(interval, _)| Instant::now() + interval);

	loop {
		// sleep until there is work, the next ping, or the next ping check
		let now = Instant::now();
		let mut wait = BASE_WAIT;
		if let Some((_, timeout)) = heartbeat {
			if let Some(at) = next_ping {
				wait = wait.min(at.saturating_duration_since(now));
			}
			if let Some(conn) = shared.current() {
				if let Some(sent) = conn.ping_outstanding() {
					wait = wait.min((sent + timeout).saturating_duration_since(now));
				}
			}
		}
		wait = wait.max(Duration::from_millis(1));

		match queue.recv_timeout(wait) {
			Ok(task) => {
				let begun = Instant::now();
				let mut stop = handle_task(&shared, &state, task);
				while !stop {
					match queue.try_recv() {
						Ok(task) => stop = handle_task(&shared, &state, task),
						Err(_) => break,
					}
				}
				shared
					.stats
					.busy_millis
					.fetch_add(begun.elapsed().as_millis() as u64, Ordering::Relaxed);
				if stop {
					break;
				}
			}
			Err(RecvTimeoutError::Timeout) => {}
			Err(RecvTimeoutError::Disconnected) => break,
		}

		if let Some((interval, timeout)) = heartbeat {
			let now = Instant::now();
			if let Some(conn) = shared.current() {
				if let Some(sent) = conn.ping_outstanding() {
					// at most one ping is ever in flight
					if now.duration_since(sent) >= timeout {
						let reason = format!(
							"did not receive a response to a ping within {} millis",
							timeout.as_millis()
						);
						error!("connection {}: {}", conn.id(), reason);
						conn.close_with(false, CloseCause::Failure(reason));
					}
				} else if next_ping.map(|at| now >= at).unwrap_or(false) {
					conn.send_ping();
				}
			}
			if next_ping.map(|at| now >= at).unwrap_or(false) {
				next_ping = Some(now + interval);
			}
		}
	}

	*state.lock() = ServiceState::Stopped;
	debug!("messaging service stopped");
}

fn handle_task(
	shared: &Arc<PeerShared>,
	state: &Arc<Mutex<ServiceState>>,
	task: Task,
) -> bool {
	match task {
		Task::NotifyStartup => {
			shared.stats.reset();
			*state.lock() = ServiceState::Started;
			info!("messaging service started");
			false
		}
		Task::NotifyShutdown => {
			if let Some(conn) = shared.current() {
				conn.close_with(true, CloseCause::Local);
			}
			true
		}
		Task::EncodedMessage { conn, data } => {
			dispatch(shared, &conn, &data);
			false
		}
		Task::CloseChannel {
			channel,
			notify,
			reason,
		} => {
			channel.close(notify, Some(&reason));
			false
		}
		Task::CloseConnection {
			conn,
			notify,
			cause,
		} => {
			conn.close_with(notify, cause);
			false
		}
	}
}

/// Decodes one inbound frame and routes the message: correlated responses
/// to their waiters, control traffic to the connection bookkeeping,
/// everything else to the channel's receiver.
fn dispatch(shared: &Arc<PeerShared>, conn: &Arc<Connection>, data: &Bytes) {
	// the channel id sits outside the filtered region, so it is always
	// addressable even when the pipeline fails on the rest
	let mut head = BufReader::new(&data[..]);
	let channel_id = match head.read_packed_i32() {
		Ok(id) => id,
		Err(e) => {
			warn!("inbound frame with unreadable channel id: {}", e);
			conn.close_with(
				false,
				CloseCause::Failure(format!("malformed frame: {}", e)),
			);
			return;
		}
	};

	let channel = match conn.channel(channel_id) {
		Some(channel) => channel,
		None => {
			// the channel may well have been closed locally already
			trace!("dropping message for unknown channel {}", channel_id);
			return;
		}
	};

	let message = codec::apply_read(&shared.filters, data[head.bytes_read()..].to_vec())
		.and_then(|body| {
			let mut reader = BufReader::new(&body);
			shared.codec.decode(&channel, &mut reader)
		});
	let message = match message {
		Ok(message) => message,
		Err(e) => {
			if channel_id == CONTROL_CHANNEL_ID {
				warn!("undecodable message on the control channel: {}", e);
				conn.close_with(
					false,
					CloseCause::Failure(format!("malformed control message: {}", e)),
				);
			} else {
				warn!(
					"undecodable message on channel {}, closing it: {}",
					channel_id, e
				);
				channel.close(true, Some(&format!("malformed message: {}", e)));
			}
			return;
		}
	};

	conn.stats()
		.msgs_received
		.fetch_add(1, Ordering::Relaxed);
	shared
		.stats
		.msgs_processed
		.fetch_add(1, Ordering::Relaxed);
	if shared.debug {
		debug!(
			"received {} on channel {}: {}",
			msg::type_name(message.type_id()),
			channel_id,
			to_hex(&data[..])
		);
	}

	if let Some((request_id, _failure)) = message.response_to() {
		if !channel.complete_request(request_id, Ok(message)) {
			// the waiter timed out or went away; responses do not outlive
			// their requests
			trace!(
				"dropping response {} with no waiter on channel {}",
				request_id,
				channel_id
			);
		}
		return;
	}

	if channel_id == CONTROL_CHANNEL_ID {
		handle_control(shared, conn, &channel, message);
		return;
	}

	if !channel.is_open() {
		trace!("dropping message for closed channel {}", channel_id);
		return;
	}

	match channel.receiver() {
		Some(receiver) => receiver.on_message(&channel, message),
		None => debug!(
			"no receiver on channel {}, dropping {} message",
			channel_id,
			msg::type_name(message.type_id())
		),
	}
}

/// Control traffic on channel 0 that is not a correlated response.
fn handle_control(
	shared: &Arc<PeerShared>,
	conn: &Arc<Connection>,
	ch0: &Arc<Channel>,
	message: Box<dyn Message>,
) {
	let type_id = message.type_id();
	let any = message.as_any();

	if let Some(ping) = any.downcast_ref::<PingRequest>() {
		// the cluster probes us; answer in kind
		let pong = PingResponse {
			request_id: ping.request_id,
		};
		if let Err(e) = conn.post(ch0, &pong) {
			debug!("unable to answer ping: {}", e);
		}
		return;
	}

	if any.downcast_ref::<PingResponse>().is_some() {
		conn.clear_ping();
		trace!("ping answered on connection {}", conn.id());
		return;
	}

	if let Some(notice) = any.downcast_ref::<NotifyConnectionClosed>() {
		info!(
			"connection {} released by peer: {}",
			conn.id(),
			notice.reason
		);
		conn.close_with(false, CloseCause::Remote(notice.reason.clone()));
		return;
	}

	if let Some(notice) = any.downcast_ref::<NotifyChannelClosed>() {
		if let Some(channel) = conn.channel(notice.channel_id) {
			channel.close(false, Some(&notice.reason));
		}
		return;
	}

	if let Some(request) = any.downcast_ref::<CloseConnectionRequest>() {
		let response = PeerResponse::ok(request.request_id, ResponseResult::Empty);
		if let Err(e) = conn.post(ch0, &response) {
			debug!("unable to acknowledge connection close: {}", e);
		}
		// teardown is deferred so it never re-enters this handler
		let _ = shared.queue.send(Task::CloseConnection {
			conn: conn.clone(),
			notify: false,
			cause: CloseCause::Remote(request.reason.clone()),
		});
		return;
	}

	if let Some(request) = any.downcast_ref::<CloseChannelRequest>() {
		let response = PeerResponse::ok(request.request_id, ResponseResult::Empty);
		if let Err(e) = conn.post(ch0, &response) {
			debug!("unable to acknowledge channel close: {}", e);
		}
		if let Some(channel) = conn.channel(request.channel_id) {
			let _ = shared.queue.send(Task::CloseChannel {
				channel,
				notify: false,
				reason: request.reason.clone(),
			});
		}
		return;
	}

	if let Some(request) = any.downcast_ref::<CreateChannelRequest>() {
		// this peer is a client; it does not accept cluster-initiated
		// channels
		let response = PeerResponse::fail(
			request.request_id,
			"client peers do not accept channel opens",
		);
		if let Err(e) = conn.post(ch0, &response) {
			debug!("unable to reject channel open: {}", e);
		}
		return;
	}

	warn!(
		"unhandled control message {} on connection {}",
		msg::type_name(type_id),
		conn.id()
	);
}
