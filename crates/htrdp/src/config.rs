// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol constants and session configuration.
//!
//! Wire constants are fixed by IEC 61375-2-3 and must not be changed;
//! session defaults may be overridden per publication/subscription.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::Marshaller;

/// Default UDP port for PD traffic (send and receive).
pub const PD_UDP_PORT: u16 = 17224;

/// Maximum PD payload for a v1 frame.
pub const MAX_PD_DATA_SIZE: usize = 1432;
/// Maximum PD payload for a v2 (TSN) frame.
pub const MAX_TSN_DATA_SIZE: usize = 1024;

/// v1 PD header size on the wire.
pub const PD_HEADER_SIZE: usize = 40;
/// v2 (TSN) PD header size on the wire.
pub const PD2_HEADER_SIZE: usize = 24;

/// Largest possible PD datagram (v1 header + max payload, padded).
pub const MAX_PD_PACKET_SIZE: usize = PD_HEADER_SIZE + MAX_PD_DATA_SIZE;
/// Smallest datagram worth parsing (the v2 header).
pub const MIN_PD_PACKET_SIZE: usize = PD2_HEADER_SIZE;

/// v1 protocol version as sent (high byte significant, low byte compat).
pub const PROTO_VERSION: u16 = 0x0100;
/// Mask applied when checking the v1 protocol version.
pub const PROTO_VERSION_MASK: u16 = 0xFF00;
/// v2 (TSN) protocol version byte.
pub const TSN_PROTO_VERSION: u8 = 0x02;

/// ComId the engine subscribes to for statistics pull requests.
pub const STATISTICS_PULL_COMID: u32 = 31;
/// ComId the engine publishes its statistics snapshot on.
pub const GLOBAL_STATS_REPLY_COMID: u32 = 35;

/// Upper bound of PD sockets per session.
pub const MAX_PD_SOCKET_COUNT: usize = 80;
/// Upper bound of multicast groups joined per socket.
pub const MAX_MULTICAST_PER_SOCKET: usize = 20;
/// Upper bound of distinct sources tracked per subscription.
pub const MAX_SEQ_SOURCES_PER_SUBSCRIPTION: usize = 64;

/// Default time-to-live for PD sends.
pub const PD_DEFAULT_TTL: u8 = 64;
/// Default DSCP (traffic class) for PD sends.
pub const PD_DEFAULT_QOS: u8 = 5;
/// Default subscription timeout when the caller passes zero is "no timeout";
/// this is the suggested cyclic interval for callers that want one.
pub const PD_DEFAULT_TIMEOUT: Duration = Duration::from_micros(100_000);

/// Indexed-scheduler cycle-budget report thresholds (percent of wall clock
/// spent vs. expected; optimal is 100, more means the host is too slow).
pub const CLOCK_PERCENT_INFO_LIMIT: f32 = 95.0;
pub const CLOCK_PERCENT_WARNING_LIMIT: f32 = 105.0;
pub const CLOCK_PERCENT_ERROR_LIMIT: f32 = 120.0;

/// Slot geometry for the indexed scheduler tiers.
///
/// Base10 gives 1/10/100 ms slot cycles with decimal range limits; Base2
/// gives power-of-two ranges for hosts whose process cycle is binary-timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleBase {
    #[default]
    Base10,
    Base2,
}

/// Resolved slot geometry, all values in microseconds.
#[derive(Debug, Clone, Copy)]
pub struct CycleGeometry {
    /// Smallest dispatch step the loop advances per iteration.
    pub min_cycle: u32,
    pub low_cycle: u32,
    pub low_limit: u32,
    pub mid_cycle: u32,
    pub mid_limit: u32,
    pub high_cycle: u32,
    pub high_limit: u32,
}

impl CycleBase {
    pub const fn geometry(self) -> CycleGeometry {
        match self {
            CycleBase::Base10 => CycleGeometry {
                min_cycle: 1_000,
                low_cycle: 1_000,
                low_limit: 100_000,
                mid_cycle: 10_000,
                mid_limit: 1_000_000,
                high_cycle: 100_000,
                high_limit: 10_000_000,
            },
            CycleBase::Base2 => CycleGeometry {
                min_cycle: 1_000,
                low_cycle: 1_000,
                low_limit: 128_000,
                mid_cycle: 8_000,
                mid_limit: 1_024_000,
                high_cycle: 64_000,
                high_limit: 8_192_000,
            },
        }
    }
}

/// Per-send socket parameters (DSCP class, TTL, optional VLAN hint).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendParams {
    pub qos: u8,
    pub ttl: u8,
    pub vlan: u16,
}

impl Default for SendParams {
    fn default() -> Self {
        Self {
            qos: PD_DEFAULT_QOS,
            ttl: PD_DEFAULT_TTL,
            vlan: 0,
        }
    }
}

/// Session defaults applied when a publish/subscribe call passes `None`.
#[derive(Clone)]
pub struct PdDefaults {
    pub send_params: SendParams,
    /// Default subscription timeout; `Duration::ZERO` disables supervision.
    pub timeout: Duration,
    /// UDP port for PD traffic.
    pub port: u16,
    /// Marshalling capability, applied where the marshall flag is set.
    pub marshaller: Option<Arc<dyn Marshaller>>,
}

impl Default for PdDefaults {
    fn default() -> Self {
        Self {
            send_params: SendParams::default(),
            timeout: PD_DEFAULT_TIMEOUT,
            port: PD_UDP_PORT,
            marshaller: None,
        }
    }
}

impl std::fmt::Debug for PdDefaults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdDefaults")
            .field("send_params", &self.send_params)
            .field("timeout", &self.timeout)
            .field("port", &self.port)
            .field("marshaller", &self.marshaller.is_some())
            .finish()
    }
}

/// Configuration for one PD session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interface address this session binds to; `UNSPECIFIED` picks the
    /// primary non-loopback interface.
    pub own_ip: Ipv4Addr,
    /// Optional leader/host label, padded into the statistics snapshot.
    pub host_name: String,
    /// Defaults for publish/subscribe calls.
    pub pd: PdDefaults,
    /// Enables the three-tier indexed send scheduler and the receive-side
    /// index tables (built by `update_session`).
    pub indexed_scheduling: bool,
    /// Slot geometry for indexed scheduling.
    pub cycle_base: CycleBase,
    /// Expected call period of `process_send` in indexed mode, microseconds.
    pub process_cycle: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            own_ip: Ipv4Addr::UNSPECIFIED,
            host_name: String::new(),
            pd: PdDefaults::default(),
            indexed_scheduling: false,
            cycle_base: CycleBase::default(),
            process_cycle: 1_000,
        }
    }
}

/// Round a payload size up to the next 32-bit boundary.
#[inline]
pub const fn roundup4(len: usize) -> usize {
    (len + 3) & !3
}

/// Gross v1 packet size for a given payload size.
#[inline]
pub const fn packet_size_pd(data_size: usize) -> usize {
    PD_HEADER_SIZE + roundup4(data_size)
}

/// Gross v2 (TSN) packet size for a given payload size.
#[inline]
pub const fn packet_size_pd2(data_size: usize) -> usize {
    PD2_HEADER_SIZE + roundup4(data_size)
}
