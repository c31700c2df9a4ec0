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

//! Peer messaging for the GridLink data grid client. Multiplexes logically
//! independent channels over a single TCP (or TLS) stream, correlates
//! requests with responses, keeps connections alive with heartbeats and
//! follows redirection hints returned by the cluster.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

use gridlink_core as core;
use gridlink_util as util;

pub mod channel;
pub mod codec;
pub mod conn;
mod frame;
pub mod initiator;
pub mod msg;
pub mod peer;
pub mod protocol;
mod tls;
pub mod transport;
pub mod types;

pub use crate::channel::{Channel, IdentityTransformer, Principal, Receiver};
pub use crate::codec::{Codec, FilterRegistry, Serializer, StreamFilter};
pub use crate::conn::Connection;
pub use crate::initiator::{AddressProvider, RoundRobinProvider, TcpInitiator};
pub use crate::msg::Message;
pub use crate::peer::{Peer, ServiceState};
pub use crate::protocol::{MessageFactory, Protocol};
pub use crate::types::{
	ConnectionEvent, ConnectionListener, Error, MessagingConfig, TcpOptions, TlsConfig,
	CONTROL_CHANNEL_ID, NAME_SERVICE_SUBPORT,
};
