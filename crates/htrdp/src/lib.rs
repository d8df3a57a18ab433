// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HTRDP - TRDP Process Data engine
//!
//! A pure Rust implementation of the TRDP (Train Realtime Data Protocol,
//! IEC 61375-2-3) Process Data subsystem: cyclic UDP publish/subscribe for
//! rail vehicle networks, with sequence-counter deduplication, topography
//! validation, redundancy switchover and an indexed send scheduler for
//! dense telegram populations.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use htrdp::{PublishRequest, SessionConfig, SessionManager, SubscribeRequest};
//! use std::time::Duration;
//!
//! fn main() -> htrdp::Result<()> {
//!     let manager = SessionManager::new();
//!     let session = manager.open_session(SessionConfig::default())?;
//!
//!     // Cyclic publisher: 100 ms push data onto a multicast group
//!     let pub_handle = session.publish(PublishRequest {
//!         com_id: 10001,
//!         dest_ip: "239.255.1.1".parse().unwrap(),
//!         interval: Duration::from_millis(100),
//!         data: Some(vec![0u8; 32]),
//!         ..PublishRequest::default()
//!     })?;
//!
//!     // Subscriber with 1.2 s supervision
//!     let sub_handle = session.subscribe(SubscribeRequest {
//!         com_id: 10002,
//!         timeout: Some(Duration::from_micros(1_200_000)),
//!         ..SubscribeRequest::default()
//!     })?;
//!
//!     loop {
//!         session.process()?;
//!         session.put(pub_handle, &[0xAA; 32])?;
//!         let mut buf = [0u8; 1432];
//!         if let Ok((n, info)) = session.get(sub_handle, &mut buf) {
//!             let _ = (&buf[..n], info.seq_count);
//!         }
//!         std::thread::sleep(session.get_interval());
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      Application Layer                       |
//! |  publish/put/request          subscribe/get/callback         |
//! +--------------------------------------------------------------+
//! |                        Session Layer                         |
//! |  lifecycle | lock triplet | topo counts | statistics         |
//! +--------------------------------------------------------------+
//! |                          PD Engine                           |
//! |  send scheduler (list / indexed) | receive pipeline          |
//! |  sequence tracker | timeout supervisor | redundancy          |
//! +--------------------------------------------------------------+
//! |                    Wire & Transport Layer                    |
//! |  PD v1/v2 frame codec + FCS | socket pool | DSCP | pktinfo   |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Threading
//!
//! The engine spawns no threads. Drive it single-threaded via
//! [`Session::process`] + [`Session::get_interval`], or split transmit and
//! receive across two threads with [`Session::process_send`] and
//! [`Session::process_receive`]; the internal lock order (session, tx, rx)
//! makes the split safe.
//!
//! ## See Also
//!
//! - IEC 61375-2-3 (TRDP)
//! - [`Session`] - Start here
//! - [`SessionManager`] - Session ownership and lifecycle

/// Protocol constants, session defaults, indexed-scheduler geometry.
pub mod config;
/// Entity model: publications, subscriptions, handles, sequence tracking.
pub mod core;
/// The PD runtime: schedulers, receive pipeline, timeouts, redundancy.
pub mod engine;
/// Error taxonomy.
pub mod error;
/// PD wire format: frame codec, FCS, statistics image.
pub mod protocol;
/// Session lifecycle and public API.
pub mod session;
/// Socket layer: pooled UDP sockets, DSCP, destination recovery.
pub mod transport;

pub use crate::core::subscription::TimeoutBehavior;
pub use crate::core::{PdFlags, PubHandle, SubHandle};
pub use config::{CycleBase, PdDefaults, SendParams, SessionConfig};
pub use engine::index::IndexPreset;
pub use engine::{Marshaller, PdCallback, PdInfo, PdStatus};
pub use error::{Error, Result, WireFault};
pub use protocol::{MsgType, TopoCounts};
pub use session::registry::SessionManager;
pub use session::stats::{
    GlobalStatistics, PdCounters, PubStatistics, RedundancyStatistics, SubStatistics,
};
pub use session::{PublishRequest, PullRequest, Session, SubscribeRequest};

/// HTRDP version string.
pub const VERSION: &str = "0.4.1";
