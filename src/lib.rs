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

//! Client for the GridLink distributed in-memory data grid.
//!
//! The heart of the client is the peer messaging subsystem in
//! [`gridlink_net`]: a multiplexed request/response runtime over TCP or
//! TLS. A typical embedding configures a [`net::TcpInitiator`], registers
//! its protocols and receivers, starts it and calls
//! [`net::TcpInitiator::ensure_connection`] whenever it needs the wire:
//!
//! ```no_run
//! use gridlink::net::{MessagingConfig, TcpInitiator};
//!
//! let mut config = MessagingConfig::default();
//! config.remote_addresses = vec!["grid.example.com:9099".to_string()];
//! config.heartbeat_interval_ms = 30_000;
//!
//! let mut initiator = TcpInitiator::new(config).unwrap();
//! initiator.start().unwrap();
//! let conn = initiator.ensure_connection().unwrap();
//! println!("connected to {}", conn.remote_addr());
//! ```

pub use gridlink_core as core;
pub use gridlink_net as net;
pub use gridlink_util as util;
