// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session statistics: live counters and snapshot types.
//!
//! Counters are atomics because tx and rx paths bump them under different
//! locks. Snapshots are taken field-by-field; PD statistics are tolerant of
//! the odd torn read, they are diagnostics, not control data.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::core::subscription::TimeoutBehavior;
use crate::engine::PdStatus;

/// Live PD counters for one session.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub num_send: AtomicU32,
    pub num_rcv: AtomicU32,
    pub num_crc_err: AtomicU32,
    pub num_wire_err: AtomicU32,
    pub num_topo_err: AtomicU32,
    pub num_no_subs: AtomicU32,
    pub num_timeout: AtomicU32,
    pub num_missed: AtomicU32,
}

impl SessionStats {
    #[inline]
    pub fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU32, n: u32) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PdCounters {
        PdCounters {
            num_send: self.num_send.load(Ordering::Relaxed),
            num_rcv: self.num_rcv.load(Ordering::Relaxed),
            num_crc_err: self.num_crc_err.load(Ordering::Relaxed),
            num_wire_err: self.num_wire_err.load(Ordering::Relaxed),
            num_topo_err: self.num_topo_err.load(Ordering::Relaxed),
            num_no_subs: self.num_no_subs.load(Ordering::Relaxed),
            num_timeout: self.num_timeout.load(Ordering::Relaxed),
            num_missed: self.num_missed.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.num_send.store(0, Ordering::Relaxed);
        self.num_rcv.store(0, Ordering::Relaxed);
        self.num_crc_err.store(0, Ordering::Relaxed);
        self.num_wire_err.store(0, Ordering::Relaxed);
        self.num_topo_err.store(0, Ordering::Relaxed);
        self.num_no_subs.store(0, Ordering::Relaxed);
        self.num_timeout.store(0, Ordering::Relaxed);
        self.num_missed.store(0, Ordering::Relaxed);
    }
}

/// Frozen PD counter set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PdCounters {
    pub num_send: u32,
    pub num_rcv: u32,
    pub num_crc_err: u32,
    pub num_wire_err: u32,
    pub num_topo_err: u32,
    pub num_no_subs: u32,
    pub num_timeout: u32,
    pub num_missed: u32,
}

/// Global statistics snapshot, the payload of the comId-35 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalStatistics {
    /// Engine version, packed as major.minor.update.evolution bytes.
    pub version: u32,
    /// Seconds since session open.
    pub uptime_s: u32,
    /// Host label, truncated/NUL-padded to 16 bytes on the wire.
    pub host_name: String,
    pub own_ip: Ipv4Addr,
    pub process_cycle_us: u32,
    pub num_joined_mc: u32,
    pub num_publishers: u32,
    pub num_subscribers: u32,
    pub pd: PdCounters,
}

/// Per-publication statistics entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubStatistics {
    pub com_id: u32,
    pub dest_ip: Ipv4Addr,
    pub cycle: Duration,
    pub red_id: u32,
    pub num_send: u32,
}

/// Per-subscription statistics entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubStatistics {
    pub com_id: u32,
    pub joined_addr: Ipv4Addr,
    pub filter_lo: Ipv4Addr,
    pub filter_hi: Ipv4Addr,
    pub timeout: Duration,
    pub behavior: TimeoutBehavior,
    pub num_recv: u32,
    pub num_missed: u32,
    pub status: PdStatus,
}

/// Per-redundancy-group statistics entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedundancyStatistics {
    pub red_id: u32,
    pub leader: bool,
    pub num_publications: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_and_snapshot() {
        let s = SessionStats::default();
        SessionStats::bump(&s.num_send);
        SessionStats::bump(&s.num_send);
        SessionStats::add(&s.num_missed, 5);
        let snap = s.snapshot();
        assert_eq!(snap.num_send, 2);
        assert_eq!(snap.num_missed, 5);
        assert_eq!(snap.num_rcv, 0);
    }

    #[test]
    fn test_reset_clears_all() {
        let s = SessionStats::default();
        SessionStats::bump(&s.num_crc_err);
        SessionStats::bump(&s.num_timeout);
        s.reset();
        assert_eq!(s.snapshot(), PdCounters::default());
    }
}
