// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publication descriptor: one cyclic (or pull-only) telegram this session
//! transmits.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::PdFlags;
use crate::engine::PdCallback;
use crate::protocol::{FrameBuf, MsgType};

/// Publication identity. No two publications in a session may share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAddress {
    pub src_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub com_id: u32,
    pub service_id: u32,
}

pub struct Publication {
    pub addr: PubAddress,
    /// Cyclic send interval; `ZERO` means pull-only (no timer).
    pub interval: Duration,
    pub next_due: Option<Instant>,
    /// Redundancy group; 0 = not redundant.
    pub red_id: u32,
    /// Push-stream sequence state; `None` = never sent, first send emits 0.
    pub push_seq: Option<u32>,
    /// Pull-stream (Pp/Pr) sequence state.
    pub pull_seq: Option<u32>,
    /// Current wire image; payload staged by `put`.
    pub frame: FrameBuf,
    pub sock_idx: Option<usize>,
    pub sock: Option<Arc<UdpSocket>>,
    /// Destination override for the next pulled reply.
    pub pull_ip: Ipv4Addr,
    pub flags: PdFlags,
    /// No data staged yet; the scheduler skips the telegram.
    pub invalid_data: bool,
    /// Redundancy follower: timers advance, nothing is emitted.
    pub follower: bool,
    /// One-shot trigger (pull reply pending, or this element is a PR).
    pub req_to_send: bool,
    pub pre_send: Option<PdCallback>,
    pub num_sent: u32,
}

impl Publication {
    /// Advance the counter for `msg_type`'s stream and return the value to
    /// put on the wire. A never-sent stream emits 0.
    pub fn next_seq(&mut self, msg_type: MsgType) -> u32 {
        let state = if msg_type.is_pull() {
            &mut self.pull_seq
        } else {
            &mut self.push_seq
        };
        let next = match *state {
            None => 0,
            Some(cur) => cur.wrapping_add(1),
        };
        *state = Some(next);
        next
    }

    /// Re-arm the cyclic timer after a send, snapping forward if the
    /// schedule has fallen more than one interval behind.
    pub fn rearm(&mut self, now: Instant) {
        if self.interval.is_zero() {
            return;
        }
        if let Some(due) = self.next_due {
            let next = due + self.interval;
            self.next_due = Some(if next <= now { now + self.interval } else { next });
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.req_to_send || self.next_due.is_some_and(|due| due <= now)
    }
}
