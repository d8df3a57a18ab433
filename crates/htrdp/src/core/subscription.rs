// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription descriptor: one telegram this session listens for.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::core::{PdFlags, SequenceTracker};
use crate::engine::{PdCallback, PdStatus};
use crate::protocol::{FrameBuf, TopoCounts};

/// What `get` returns while the subscription is timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutBehavior {
    /// Zero the caller's buffer once the subscription times out.
    #[default]
    SetToZero,
    /// Keep returning the last received bytes unchanged.
    KeepLastValue,
}

/// Subscription filter. `dest_ip` is the bound unicast address or multicast
/// group (`UNSPECIFIED` accepts any destination); the source filter is a
/// closed range, zero-wildcarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAddress {
    pub com_id: u32,
    pub service_id: u32,
    pub src_lo: Ipv4Addr,
    pub src_hi: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub topo: TopoCounts,
}

/// Lookup key derived from one received frame.
#[derive(Debug, Clone, Copy)]
pub struct RxKey {
    pub com_id: u32,
    pub src_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub service_id: u32,
    pub topo: TopoCounts,
}

impl SubAddress {
    /// Filter test used by both the linear and the indexed lookup.
    pub fn matches(&self, key: &RxKey) -> bool {
        if self.com_id != key.com_id {
            return false;
        }
        if self.service_id != 0 && self.service_id != key.service_id {
            return false;
        }
        if !self.dest_ip.is_unspecified() && self.dest_ip != key.dest_ip {
            return false;
        }
        if self.src_lo.is_unspecified() {
            return true;
        }
        if self.src_hi.is_unspecified() {
            return self.src_lo == key.src_ip;
        }
        (self.src_lo..=self.src_hi).contains(&key.src_ip)
    }
}

pub struct Subscription {
    pub addr: SubAddress,
    /// Timeout interval; `ZERO` disables supervision.
    pub interval: Duration,
    /// Latest instant a refresh must arrive by.
    pub next_due: Option<Instant>,
    pub to_behavior: TimeoutBehavior,
    /// Last received frame; `None` until the first valid reception.
    pub frame: Option<FrameBuf>,
    pub seq: SequenceTracker,
    /// Last accepted sequence counter (mirrors the staged frame).
    pub cur_seq: u32,
    pub last_src: Option<Ipv4Addr>,
    /// Real destination of the last received packet (own IP or mc group).
    pub last_dest: Ipv4Addr,
    pub sock_idx: Option<usize>,
    pub mc_group: Option<Ipv4Addr>,
    pub callback: Option<PdCallback>,
    pub flags: PdFlags,
    pub timed_out: bool,
    pub last_status: PdStatus,
    pub num_recv: u32,
    pub num_missed: u32,
}

impl Subscription {
    /// Re-arm the timeout window after a valid reception.
    pub fn refresh(&mut self, now: Instant) {
        if !self.interval.is_zero() {
            self.next_due = Some(now + self.interval);
        }
        self.timed_out = false;
        self.last_status = PdStatus::Ok;
    }

    pub fn is_late(&self, now: Instant) -> bool {
        !self.interval.is_zero() && self.next_due.is_some_and(|due| due < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(com_id: u32, src: [u8; 4], dest: [u8; 4]) -> RxKey {
        RxKey {
            com_id,
            src_ip: Ipv4Addr::from(src),
            dest_ip: Ipv4Addr::from(dest),
            service_id: 0,
            topo: TopoCounts::ZERO,
        }
    }

    fn sub(com_id: u32) -> SubAddress {
        SubAddress {
            com_id,
            service_id: 0,
            src_lo: Ipv4Addr::UNSPECIFIED,
            src_hi: Ipv4Addr::UNSPECIFIED,
            dest_ip: Ipv4Addr::UNSPECIFIED,
            topo: TopoCounts::ZERO,
        }
    }

    #[test]
    fn test_wildcard_matches_any_source() {
        let s = sub(10002);
        assert!(s.matches(&key(10002, [10, 0, 1, 17], [10, 0, 1, 1])));
        assert!(s.matches(&key(10002, [192, 168, 9, 9], [239, 1, 1, 1])));
        assert!(!s.matches(&key(10003, [10, 0, 1, 17], [10, 0, 1, 1])));
    }

    #[test]
    fn test_exact_source_filter() {
        let mut s = sub(10002);
        s.src_lo = Ipv4Addr::new(10, 0, 1, 17);
        assert!(s.matches(&key(10002, [10, 0, 1, 17], [10, 0, 1, 1])));
        assert!(!s.matches(&key(10002, [10, 0, 1, 18], [10, 0, 1, 1])));
    }

    #[test]
    fn test_source_range_filter() {
        let mut s = sub(10002);
        s.src_lo = Ipv4Addr::new(10, 0, 1, 10);
        s.src_hi = Ipv4Addr::new(10, 0, 1, 20);
        assert!(s.matches(&key(10002, [10, 0, 1, 10], [0, 0, 0, 0])));
        assert!(s.matches(&key(10002, [10, 0, 1, 20], [0, 0, 0, 0])));
        assert!(!s.matches(&key(10002, [10, 0, 1, 21], [0, 0, 0, 0])));
    }

    #[test]
    fn test_destination_filter() {
        let mut s = sub(10002);
        s.dest_ip = Ipv4Addr::new(239, 255, 1, 1);
        assert!(s.matches(&key(10002, [10, 0, 1, 17], [239, 255, 1, 1])));
        assert!(!s.matches(&key(10002, [10, 0, 1, 17], [239, 255, 1, 2])));
    }

    #[test]
    fn test_service_id_filter() {
        let mut s = sub(10002);
        s.service_id = 42;
        let mut k = key(10002, [10, 0, 1, 17], [10, 0, 1, 1]);
        assert!(!s.matches(&k));
        k.service_id = 42;
        assert!(s.matches(&k));
    }
}
