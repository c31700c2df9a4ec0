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

//! A channel is one logically independent conversation multiplexed over a
//! connection. Channels own their pending-request table and hand out
//! monotonic request ids; the waiter side of correlation lives here as
//! `Status`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::util::{Condvar, Mutex};

use crate::codec::Serializer;
use crate::conn::Connection;
use crate::core::ser::BinWriter;
use crate::core::ser::Writer;
use crate::msg::{Message, NotifyChannelClosed};
use crate::protocol::MessageFactory;
use crate::types::{Error, CONTROL_CHANNEL_ID};

/// Handles unsolicited inbound messages on a channel. A receiver speaks
/// exactly one protocol; channel opens verify the match. Invoked on the
/// peer's service thread, so implementations must not block.
pub trait Receiver: Send + Sync {
	/// Name of the protocol this receiver understands.
	fn protocol(&self) -> &str;

	/// An unsolicited message arrived on the channel.
	fn on_message(&self, channel: &Arc<Channel>, message: Box<dyn Message>);

	/// The channel carrying this receiver was closed.
	fn on_channel_closed(&self, _channel: &Arc<Channel>) {}
}

/// An identity on whose behalf a connection or channel is opened.
pub trait Principal: Send + Sync {
	/// The principal's name.
	fn name(&self) -> &str;
}

/// The simplest principal: a bare name.
pub struct NamePrincipal(pub String);

impl Principal for NamePrincipal {
	fn name(&self) -> &str {
		&self.0
	}
}

/// Turns a principal into the opaque token bytes asserted to the cluster
/// on open. The cluster-side counterpart parses and asserts the token.
pub trait IdentityTransformer: Send + Sync {
	/// Produces a token for the principal, or `None` for anonymous opens.
	fn transform(&self, principal: Option<&dyn Principal>) -> Result<Option<Vec<u8>>, Error>;
}

/// Default transformer: the token is the length-prefixed principal name.
pub struct NameTokenTransformer;

impl IdentityTransformer for NameTokenTransformer {
	fn transform(&self, principal: Option<&dyn Principal>) -> Result<Option<Vec<u8>>, Error> {
		match principal {
			Some(p) => {
				let mut buf = vec![];
				{
					let mut writer = BinWriter::new(&mut buf);
					writer.write_string(p.name()).map_err(|e| {
						Error::Security(format!("unable to encode identity token: {}", e))
					})?;
				}
				Ok(Some(buf))
			}
			None => Ok(None),
		}
	}
}

/// Waiter for one correlated request. Completed exactly once with the
/// response, an error, or a timeout observed by the waiting side.
pub struct Status {
	request_id: i64,
	timeout: Option<Duration>,
	state: Mutex<StatusState>,
	cond: Condvar,
}

struct StatusState {
	done: bool,
	result: Option<Result<Box<dyn Message>, Error>>,
}

impl Status {
	fn new(request_id: i64, timeout: Option<Duration>) -> Status {
		Status {
			request_id,
			timeout,
			state: Mutex::new(StatusState {
				done: false,
				result: None,
			}),
			cond: Condvar::new(),
		}
	}

	/// Delivers the outcome. A second completion is ignored.
	pub(crate) fn complete(&self, result: Result<Box<dyn Message>, Error>) {
		let mut state = self.state.lock();
		if state.done {
			return;
		}
		state.done = true;
		state.result = Some(result);
		self.cond.notify_all();
	}

	/// Blocks the calling thread until completion or the deadline.
	fn wait(&self) -> Result<Box<dyn Message>, Error> {
		let deadline = self.timeout.map(|t| Instant::now() + t);
		let mut state = self.state.lock();
		loop {
			if state.done {
				return state
					.result
					.take()
					.unwrap_or_else(|| Err(Error::ConnectionClosed("response consumed".into())));
			}
			match deadline {
				Some(deadline) => {
					if Instant::now() >= deadline {
						return Err(self.timeout_error());
					}
					let timed_out = self.cond.wait_until(&mut state, deadline).timed_out();
					if timed_out && !state.done {
						return Err(self.timeout_error());
					}
				}
				None => self.cond.wait(&mut state),
			}
		}
	}

	fn timeout_error(&self) -> Error {
		Error::RequestTimeout {
			request_id: self.request_id,
			timeout_ms: self.timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
		}
	}
}

/// A logical, bidirectionally independent conversation within a
/// connection. Id 0 is the control channel created with the connection
/// itself; ids above 0 are reserved through the control channel.
pub struct Channel {
	id: i32,
	self_ref: Weak<Channel>,
	conn: Weak<Connection>,
	serializer: Arc<dyn Serializer>,
	factory: Arc<dyn MessageFactory>,
	receiver: Option<Arc<dyn Receiver>>,
	principal: Option<Arc<dyn Principal>>,
	open: AtomicBool,
	closed: AtomicBool,
	next_request_id: AtomicI64,
	pending: Mutex<HashMap<i64, Arc<Status>>>,
}

impl Channel {
	pub(crate) fn new(
		id: i32,
		conn: Weak<Connection>,
		serializer: Arc<dyn Serializer>,
		factory: Arc<dyn MessageFactory>,
		receiver: Option<Arc<dyn Receiver>>,
		principal: Option<Arc<dyn Principal>>,
	) -> Arc<Channel> {
		Arc::new_cyclic(|me| Channel {
			id,
			self_ref: me.clone(),
			conn,
			serializer,
			factory,
			receiver,
			principal,
			open: AtomicBool::new(false),
			closed: AtomicBool::new(false),
			next_request_id: AtomicI64::new(1),
			pending: Mutex::new(HashMap::new()),
		})
	}

	/// The channel id within its connection.
	pub fn id(&self) -> i32 {
		self.id
	}

	/// Whether the channel is open for traffic.
	pub fn is_open(&self) -> bool {
		self.open.load(Ordering::SeqCst)
	}

	pub(crate) fn mark_open(&self) {
		self.open.store(true, Ordering::SeqCst);
	}

	/// The serializer encoding this channel's payloads.
	pub fn serializer(&self) -> &Arc<dyn Serializer> {
		&self.serializer
	}

	/// The message factory of the channel's negotiated protocol version.
	pub fn factory(&self) -> &Arc<dyn MessageFactory> {
		&self.factory
	}

	pub(crate) fn receiver(&self) -> Option<&Arc<dyn Receiver>> {
		self.receiver.as_ref()
	}

	/// The principal this channel asserts, if any.
	pub fn principal(&self) -> Option<&Arc<dyn Principal>> {
		self.principal.as_ref()
	}

	/// The connection this channel belongs to, while it is alive.
	pub fn connection(&self) -> Option<Arc<Connection>> {
		self.conn.upgrade()
	}

	fn conn(&self) -> Result<Arc<Connection>, Error> {
		self.conn
			.upgrade()
			.ok_or_else(|| Error::ConnectionClosed("connection is gone".into()))
	}

	fn closed_error(&self) -> Error {
		Error::ChannelClosed {
			channel: self.id,
			reason: "channel is closed".into(),
		}
	}

	pub(crate) fn next_request_id(&self) -> i64 {
		self.next_request_id.fetch_add(1, Ordering::SeqCst)
	}

	/// Sends a message without correlation. Returns once the frame has
	/// been handed to the stream.
	pub fn send(&self, message: Box<dyn Message>) -> Result<(), Error> {
		let conn = self.conn()?;
		if !self.is_open() {
			return Err(self.closed_error());
		}
		conn.post(self, message.as_ref())
	}

	/// Sends a request and blocks until its response arrives, the
	/// configured request timeout elapses, or the channel or connection
	/// closes, whichever happens first.
	pub fn request(&self, message: Box<dyn Message>) -> Result<Box<dyn Message>, Error> {
		let timeout = self.conn()?.request_timeout();
		self.request_with_timeout(message, timeout)
	}

	/// Same as `request` with an explicit deadline, `None` waiting
	/// forever.
	pub fn request_with_timeout(
		&self,
		mut message: Box<dyn Message>,
		timeout: Option<Duration>,
	) -> Result<Box<dyn Message>, Error> {
		let conn = self.conn()?;
		if !self.is_open() {
			return Err(self.closed_error());
		}

		let request_id = self.next_request_id();
		message.set_request_id(request_id);

		let status = Arc::new(Status::new(request_id, timeout));
		self.pending.lock().insert(request_id, status.clone());

		// a close racing the registration above would miss the waiter
		if !self.is_open() {
			self.pending.lock().remove(&request_id);
			return Err(self.closed_error());
		}

		if let Err(e) = conn.post(self, message.as_ref()) {
			self.pending.lock().remove(&request_id);
			return Err(e);
		}

		match status.wait() {
			Err(e @ Error::RequestTimeout { .. }) => {
				// late responses find no waiter and are dropped
				self.pending.lock().remove(&request_id);
				conn.peer_stats().timeout_count.fetch_add(1, Ordering::Relaxed);
				Err(e)
			}
			other => other,
		}
	}

	/// Completes the waiter registered for `request_id`, returning false
	/// when no waiter exists anymore.
	pub(crate) fn complete_request(
		&self,
		request_id: i64,
		result: Result<Box<dyn Message>, Error>,
	) -> bool {
		match self.pending.lock().remove(&request_id) {
			Some(status) => {
				status.complete(result);
				true
			}
			None => false,
		}
	}

	/// Number of requests still waiting for a response.
	pub fn pending_requests(&self) -> usize {
		self.pending.lock().len()
	}

	/// Closes the channel. When `notify` is set and the connection is
	/// still usable, the peer is told so it can release its side. Pending
	/// waiters fail with `cause`, or a generic closed-channel error.
	/// Closing twice is a no-op; the control channel only closes with its
	/// connection.
	pub fn close(&self, notify: bool, cause: Option<&str>) {
		if self.id == CONTROL_CHANNEL_ID {
			warn!("ignoring attempt to close the control channel directly");
			return;
		}
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.open.store(false, Ordering::SeqCst);

		let reason = cause.unwrap_or("channel closed locally");
		debug!("closing channel {}: {}", self.id, reason);

		if let Some(conn) = self.conn.upgrade() {
			if notify && conn.is_usable() {
				if let Some(ch0) = conn.channel(CONTROL_CHANNEL_ID) {
					let release = NotifyChannelClosed {
						channel_id: self.id,
						reason: reason.to_string(),
					};
					if let Err(e) = conn.post(&ch0, &release) {
						debug!("unable to notify peer of channel {} close: {}", self.id, e);
					}
				}
			}
			conn.remove_channel(self.id);
		}

		self.fail_pending(|request_id| {
			let _ = request_id;
			Error::ChannelClosed {
				channel: self.id,
				reason: reason.to_string(),
			}
		});

		if let Some(receiver) = &self.receiver {
			if let Some(me) = self.self_ref.upgrade() {
				receiver.on_channel_closed(&me);
			}
		}
	}

	/// Teardown path used when the whole connection goes away: no
	/// notification, waiters fail with the connection's close cause.
	pub(crate) fn force_close(&self, reason: &str) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.open.store(false, Ordering::SeqCst);
		let reason = reason.to_string();
		self.fail_pending(move |_| Error::ConnectionClosed(reason.clone()));
		if let Some(receiver) = &self.receiver {
			if let Some(me) = self.self_ref.upgrade() {
				receiver.on_channel_closed(&me);
			}
		}
	}

	fn fail_pending(&self, error_for: impl Fn(i64) -> Error) {
		let pending: Vec<(i64, Arc<Status>)> = self.pending.lock().drain().collect();
		for (request_id, status) in pending {
			status.complete(Err(error_for(request_id)));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::codec::BinarySerializer;
	use crate::msg::{PeerResponse, ResponseResult};
	use crate::protocol::ControlFactory;
	use std::thread;

	fn detached() -> Arc<Channel> {
		Channel::new(
			3,
			Weak::new(),
			Arc::new(BinarySerializer),
			Arc::new(ControlFactory),
			None,
			None,
		)
	}

	#[test]
	fn request_ids_are_monotonic() {
		let channel = detached();
		assert_eq!(channel.next_request_id(), 1);
		assert_eq!(channel.next_request_id(), 2);
		assert_eq!(channel.next_request_id(), 3);
	}

	#[test]
	fn request_on_dead_connection_fails() {
		let channel = detached();
		channel.mark_open();
		let result = channel.request(Box::new(PeerResponse::default()));
		match result {
			Err(Error::ConnectionClosed(_)) => {}
			Ok(_) => panic!("expected closed connection, got Ok"),
			Err(e) => panic!("expected closed connection, got {:?}", e),
		}
	}

	#[test]
	fn status_completes_exactly_once() {
		let status = Arc::new(Status::new(1, None));
		status.complete(Ok(Box::new(PeerResponse::ok(1, ResponseResult::Empty))));
		status.complete(Err(Error::ConnectionClosed("late".into())));

		let out = status.wait().unwrap();
		let out = out.as_any().downcast_ref::<PeerResponse>().unwrap();
		assert_eq!(out.request_id, 1);
	}

	#[test]
	fn status_times_out() {
		let status = Status::new(9, Some(Duration::from_millis(50)));
		let begun = Instant::now();
		match status.wait() {
			Err(Error::RequestTimeout {
				request_id: 9,
				timeout_ms: 50,
			}) => {}
			Ok(_) => panic!("expected timeout, got Ok"),
			Err(e) => panic!("expected timeout, got {:?}", e),
		}
		assert!(begun.elapsed() >= Duration::from_millis(50));
	}

	#[test]
	fn status_wakes_waiter() {
		let status = Arc::new(Status::new(4, Some(Duration::from_secs(10))));
		let waiter = status.clone();
		let handle = thread::spawn(move || waiter.wait());

		thread::sleep(Duration::from_millis(20));
		status.complete(Ok(Box::new(PeerResponse::ok(4, ResponseResult::Empty))));

		let out = handle.join().unwrap().unwrap();
		assert_eq!(out.response_to(), Some((4, false)));
	}

	#[test]
	fn completion_drains_the_pending_table() {
		let channel = detached();
		let status = Arc::new(Status::new(7, None));
		channel.pending.lock().insert(7, status.clone());

		assert!(channel.complete_request(7, Err(Error::ConnectionClosed("bye".into()))));
		assert_eq!(channel.pending_requests(), 0);
		// a second response for the same id finds no waiter
		assert!(!channel.complete_request(7, Err(Error::ConnectionClosed("bye".into()))));
	}
}
