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

//! Named, versioned message schemas. A `Protocol` describes the message
//! types exchanged on a channel; each supported version of a protocol has
//! a `MessageFactory` producing empty message instances by wire type id.

use std::collections::HashMap;
use std::sync::Arc;

use crate::msg::{self, Message};
use crate::types::Error;

/// Name of the built-in control protocol spoken on channel 0.
pub const MESSAGING_PROTOCOL: &str = "Messaging";

/// Current version of the built-in control protocol.
pub const MESSAGING_VERSION: i32 = 1;

/// Creates message instances by wire type id for one protocol version.
pub trait MessageFactory: Send + Sync {
	/// The protocol version this factory serves.
	fn version(&self) -> i32;

	/// Instantiates an empty message of the given type, ready for its body
	/// to be read.
	fn create(&self, type_id: i32) -> Result<Box<dyn Message>, Error>;
}

/// A named versioned message schema. Identity is the name; versions range
/// from `min_version` to `current_version`, each backed by a factory.
pub struct Protocol {
	name: String,
	current_version: i32,
	min_version: i32,
	factories: HashMap<i32, Arc<dyn MessageFactory>>,
}

impl Protocol {
	/// Declares a protocol supporting versions `min_version` up to
	/// `current_version`.
	pub fn new(name: &str, current_version: i32, min_version: i32) -> Protocol {
		Protocol {
			name: name.to_string(),
			current_version,
			min_version,
			factories: HashMap::new(),
		}
	}

	/// Attaches a factory for one of the supported versions.
	pub fn with_factory(mut self, factory: Arc<dyn MessageFactory>) -> Protocol {
		self.factories.insert(factory.version(), factory);
		self
	}

	/// The protocol name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Newest supported version.
	pub fn current_version(&self) -> i32 {
		self.current_version
	}

	/// Oldest supported version.
	pub fn min_version(&self) -> i32 {
		self.min_version
	}

	/// The factory serving the given version, if registered.
	pub fn factory(&self, version: i32) -> Option<Arc<dyn MessageFactory>> {
		self.factories.get(&version).cloned()
	}

	/// Verifies a version negotiated by the remote peer against the range
	/// this protocol supports.
	pub fn check_negotiated(&self, version: i32) -> Result<(), Error> {
		if version < self.min_version || version > self.current_version {
			return Err(Error::ProtocolMismatch(format!(
				"peer negotiated version {} for protocol {}, supported range is {}..={}",
				version, self.name, self.min_version, self.current_version
			)));
		}
		Ok(())
	}
}

/// The control protocol spoken on channel 0.
pub fn messaging_protocol() -> Protocol {
	Protocol::new(MESSAGING_PROTOCOL, MESSAGING_VERSION, MESSAGING_VERSION)
		.with_factory(Arc::new(ControlFactory))
}

/// Factory for the control message set.
pub struct ControlFactory;

impl MessageFactory for ControlFactory {
	fn version(&self) -> i32 {
		MESSAGING_VERSION
	}

	fn create(&self, type_id: i32) -> Result<Box<dyn Message>, Error> {
		let message: Box<dyn Message> = match type_id {
			msg::TYPE_ACCEPT_CHANNEL => Box::new(msg::AcceptChannelRequest::default()),
			msg::TYPE_CLOSE_CHANNEL => Box::new(msg::CloseChannelRequest::default()),
			msg::TYPE_CLOSE_CONNECTION => Box::new(msg::CloseConnectionRequest::default()),
			msg::TYPE_CREATE_CHANNEL => Box::new(msg::CreateChannelRequest::default()),
			msg::TYPE_OPEN_CONNECTION => Box::new(msg::OpenConnectionRequest::default()),
			msg::TYPE_PING_REQUEST => Box::new(msg::PingRequest::default()),
			msg::TYPE_PING_RESPONSE => Box::new(msg::PingResponse::default()),
			msg::TYPE_NOTIFY_CHANNEL_CLOSED => Box::new(msg::NotifyChannelClosed::default()),
			msg::TYPE_NOTIFY_CONNECTION_CLOSED => {
				Box::new(msg::NotifyConnectionClosed::default())
			}
			msg::TYPE_RESPONSE => Box::new(msg::PeerResponse::default()),
			other => {
				return Err(Error::ProtocolMismatch(format!(
					"unknown control message type {}",
					other
				)))
			}
		};
		Ok(message)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn control_factory_creates_known_types() {
		let factory = ControlFactory;
		for type_id in &[
			msg::TYPE_ACCEPT_CHANNEL,
			msg::TYPE_CLOSE_CHANNEL,
			msg::TYPE_CLOSE_CONNECTION,
			msg::TYPE_CREATE_CHANNEL,
			msg::TYPE_OPEN_CONNECTION,
			msg::TYPE_PING_REQUEST,
			msg::TYPE_PING_RESPONSE,
			msg::TYPE_NOTIFY_CHANNEL_CLOSED,
			msg::TYPE_NOTIFY_CONNECTION_CLOSED,
			msg::TYPE_RESPONSE,
		] {
			let created = factory.create(*type_id).unwrap();
			assert_eq!(created.type_id(), *type_id);
		}
	}

	#[test]
	fn control_factory_rejects_unknown_types() {
		// the queue-internal markers never materialize from the wire
		assert!(ControlFactory.create(msg::TYPE_NOTIFY_SHUTDOWN).is_err());
		assert!(ControlFactory.create(msg::TYPE_ENCODED_MESSAGE).is_err());
		assert!(ControlFactory.create(99).is_err());
	}

	#[test]
	fn negotiated_version_must_be_in_range() {
		let protocol = Protocol::new("CacheService", 9, 4);
		assert!(protocol.check_negotiated(4).is_ok());
		assert!(protocol.check_negotiated(9).is_ok());
		assert!(protocol.check_negotiated(3).is_err());
		assert!(protocol.check_negotiated(10).is_err());
	}
}
