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

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::ser;

/// Identifier of the control channel present on every open connection.
pub const CONTROL_CHANNEL_ID: i32 = 0;

/// Well-known subport of the cluster name service.
pub const NAME_SERVICE_SUBPORT: i32 = 3;

/// Default timeout applied to correlated requests, in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Environment variable toggling per-message debug logging.
pub const MESSAGING_DEBUG_ENV: &str = "GRIDLINK_MESSAGING_DEBUG";

#[derive(Debug)]
pub enum Error {
	/// Underlying socket or stream failure, fatal to the connection.
	Connection(io::Error),
	/// The connection closed before or while an operation needed it.
	ConnectionClosed(String),
	/// A single channel closed or failed; the connection survives.
	ChannelClosed {
		channel: i32,
		reason: String,
	},
	/// A correlated request ran past its deadline. The channel stays open.
	RequestTimeout {
		request_id: i64,
		timeout_ms: u64,
	},
	/// Version negotiation failed, or a protocol is unknown to this peer.
	ProtocolMismatch(String),
	/// An inbound frame or message body could not be decoded.
	Decode(ser::Error),
	/// An outbound message could not be serialized.
	Encode(ser::Error),
	/// An identity token could not be produced or parsed.
	Security(String),
	/// Invalid static configuration, reported synchronously.
	Config(String),
	/// Every candidate address and redirect target was attempted.
	Exhausted(Vec<String>),
	/// TLS setup or handshake failure.
	Tls(String),
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Connection(e)
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Connection(e) => write!(f, "connection i/o error: {}", e),
			Error::ConnectionClosed(reason) => write!(f, "connection closed: {}", reason),
			Error::ChannelClosed { channel, reason } => {
				write!(f, "channel {} closed: {}", channel, reason)
			}
			Error::RequestTimeout {
				request_id,
				timeout_ms,
			} => write!(
				f,
				"request {} timed out after {} millis",
				request_id, timeout_ms
			),
			Error::ProtocolMismatch(reason) => write!(f, "protocol mismatch: {}", reason),
			Error::Decode(e) => write!(f, "unable to decode message: {}", e),
			Error::Encode(e) => write!(f, "unable to encode message: {}", e),
			Error::Security(reason) => write!(f, "security failure: {}", reason),
			Error::Config(reason) => write!(f, "invalid configuration: {}", reason),
			Error::Exhausted(attempted) => write!(
				f,
				"could not establish a connection to any of [{}]",
				attempted.join(", ")
			),
			Error::Tls(reason) => write!(f, "tls failure: {}", reason),
		}
	}
}

impl std::error::Error for Error {}

/// TCP socket tuning applied to every outbound connection. Failures to
/// apply an option are logged as warnings, not raised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TcpOptions {
	/// whether SO_KEEPALIVE is requested
	pub keep_alive: bool,
	/// whether SO_REUSEADDR is requested when binding locally
	pub reuse_address: bool,
	/// whether Nagle's algorithm is disabled (TCP_NODELAY)
	pub no_delay: bool,
	/// socket receive buffer size in bytes, 0 for the OS default
	pub receive_buffer_size: usize,
	/// socket send buffer size in bytes, 0 for the OS default
	pub send_buffer_size: usize,
	/// SO_LINGER timeout in milliseconds, negative to leave disabled
	pub linger_timeout_ms: i64,
	/// optional local address ("host:port") to bind before connecting
	pub local_address: Option<String>,
}

impl Default for TcpOptions {
	fn default() -> TcpOptions {
		TcpOptions {
			keep_alive: true,
			reuse_address: true,
			no_delay: true,
			receive_buffer_size: 0,
			send_buffer_size: 0,
			linger_timeout_ms: -1,
			local_address: None,
		}
	}
}

/// TLS settings for connections to a TLS-fronted cluster endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
	/// server name presented for SNI and certificate validation
	pub server_name: String,
	/// path to a PEM file with the CA certificates to trust
	pub ca_file: String,
}

/// Configuration of a messaging peer and its initiator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
	/// per-request timeout in milliseconds, 0 for no deadline
	pub request_timeout_ms: u64,
	/// connect (and open) timeout in milliseconds, 0 to fall back to the
	/// request timeout
	pub connect_timeout_ms: u64,
	/// heartbeat interval in milliseconds, 0 to disable heartbeats
	pub heartbeat_interval_ms: u64,
	/// heartbeat timeout in milliseconds, 0 to use the interval; never
	/// effectively larger than the interval
	pub heartbeat_timeout_ms: u64,
	/// largest accepted inbound frame in bytes, 0 for unlimited
	pub max_incoming_message_size: usize,
	/// largest emitted outbound frame in bytes, 0 for unlimited
	pub max_outgoing_message_size: usize,
	/// ordered names of stream filters to apply, resolved against the
	/// peer's filter registry
	pub filters: Vec<String>,
	/// candidate cluster endpoints as "host:port" strings
	pub remote_addresses: Vec<String>,
	/// subport selecting a multiplexed service behind the endpoint,
	/// -1 for none
	pub subport: i32,
	/// TCP socket options
	pub tcp: TcpOptions,
	/// optional TLS wrap of the transport
	pub tls: Option<TlsConfig>,
}

impl Default for MessagingConfig {
	fn default() -> MessagingConfig {
		MessagingConfig {
			request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
			connect_timeout_ms: 0,
			heartbeat_interval_ms: 0,
			heartbeat_timeout_ms: 0,
			max_incoming_message_size: 0,
			max_outgoing_message_size: 0,
			filters: vec![],
			remote_addresses: vec![],
			subport: -1,
			tcp: TcpOptions::default(),
			tls: None,
		}
	}
}

impl MessagingConfig {
	/// Checks the static parts of the configuration.
	pub fn validate(&self) -> Result<(), Error> {
		if let Some(tls) = &self.tls {
			if tls.server_name.is_empty() {
				return Err(Error::Config("tls server name must not be empty".into()));
			}
			if tls.ca_file.is_empty() {
				return Err(Error::Config("tls ca file must not be empty".into()));
			}
		}
		if let Some(local) = &self.tcp.local_address {
			if local.parse::<std::net::SocketAddr>().is_err() {
				return Err(Error::Config(format!(
					"invalid local address \"{}\"",
					local
				)));
			}
		}
		if self.subport < -1 {
			return Err(Error::Config(format!("invalid subport {}", self.subport)));
		}
		Ok(())
	}

	/// Deadline applied to correlated requests, `None` for no deadline.
	pub fn request_timeout(&self) -> Option<Duration> {
		match self.request_timeout_ms {
			0 => None,
			ms => Some(Duration::from_millis(ms)),
		}
	}

	/// Deadline applied to connects and connection opens. Falls back to the
	/// request timeout, `None` for no deadline.
	pub fn connect_timeout(&self) -> Option<Duration> {
		match self.connect_timeout_ms {
			0 => self.request_timeout(),
			ms => Some(Duration::from_millis(ms)),
		}
	}

	/// Effective heartbeat (interval, timeout) pair, `None` when disabled.
	/// A zero timeout uses the interval; a larger one is clamped to it.
	pub fn heartbeat(&self) -> Option<(Duration, Duration)> {
		if self.heartbeat_interval_ms == 0 {
			return None;
		}
		let interval = self.heartbeat_interval_ms;
		let timeout = match self.heartbeat_timeout_ms {
			0 => interval,
			ms => ms.min(interval),
		};
		Some((
			Duration::from_millis(interval),
			Duration::from_millis(timeout),
		))
	}
}

/// Cumulative transfer counters for one connection. Updated by the read
/// loop and by sending threads, read by anyone.
#[derive(Debug, Default)]
pub struct ConnStats {
	/// bytes written to the stream, framing included
	pub bytes_sent: AtomicU64,
	/// bytes read off the stream, framing included
	pub bytes_received: AtomicU64,
	/// messages successfully encoded and written
	pub msgs_sent: AtomicU64,
	/// messages successfully decoded and dispatched
	pub msgs_received: AtomicU64,
}

/// Counters owned by the peer service, reset on service start.
#[derive(Debug, Default)]
pub struct PeerStats {
	/// correlated requests that expired before their response arrived
	pub timeout_count: AtomicU64,
	/// messages the service loop decoded and dispatched
	pub msgs_processed: AtomicU64,
	/// cumulative service-loop busy time in milliseconds
	pub busy_millis: AtomicU64,
}

impl PeerStats {
	pub(crate) fn reset(&self) {
		self.timeout_count.store(0, Ordering::Relaxed);
		self.msgs_processed.store(0, Ordering::Relaxed);
		self.busy_millis.store(0, Ordering::Relaxed);
	}
}

/// Connection lifecycle notifications delivered to registered listeners.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
	/// The connection completed its open handshake.
	Opened {
		id: Uuid,
		remote: String,
		at: DateTime<Utc>,
	},
	/// The connection was released in an orderly fashion, locally or by
	/// the peer.
	Closed {
		id: Uuid,
		reason: String,
	},
	/// The connection was torn down because of a failure.
	Error {
		id: Uuid,
		reason: String,
	},
}

/// Observer of connection lifecycle events. Invoked on whichever thread
/// performs the transition, so implementations must not block.
pub trait ConnectionListener: Send + Sync {
	/// A connection changed state.
	fn on_event(&self, event: &ConnectionEvent);
}

/// Why a connection is being torn down; selects both the notification
/// behavior and the event kind surfaced to listeners.
#[derive(Debug, Clone)]
pub enum CloseCause {
	/// Orderly local release.
	Local,
	/// Orderly release requested by the remote peer.
	Remote(String),
	/// Failure; surfaced to listeners as an error event.
	Failure(String),
}

impl CloseCause {
	pub(crate) fn reason(&self) -> &str {
		match self {
			CloseCause::Local => "closed locally",
			CloseCause::Remote(r) => r,
			CloseCause::Failure(r) => r,
		}
	}

	pub(crate) fn is_failure(&self) -> bool {
		match self {
			CloseCause::Failure(_) => true,
			_ => false,
		}
	}
}
