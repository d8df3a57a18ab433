// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire image of the statistics snapshot (the comId-35 pulled reply).
//!
//! All integer fields are network byte order; the host label is a fixed
//! 16-byte field padded with NUL.

use std::net::Ipv4Addr;

use crate::error::{Error, Result, WireFault};
use crate::session::stats::{GlobalStatistics, PdCounters};

/// Encoded size of one statistics snapshot.
pub const STATS_WIRE_SIZE: usize = 76;

const LABEL_SIZE: usize = 16;

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Serialize a snapshot for the pulled statistics reply.
pub fn encode(stats: &GlobalStatistics) -> Vec<u8> {
    let mut out = Vec::with_capacity(STATS_WIRE_SIZE);
    put_u32(&mut out, stats.version);
    put_u32(&mut out, stats.uptime_s);

    let mut label = [0u8; LABEL_SIZE];
    let name = stats.host_name.as_bytes();
    let n = name.len().min(LABEL_SIZE - 1);
    label[..n].copy_from_slice(&name[..n]);
    out.extend_from_slice(&label);

    put_u32(&mut out, u32::from(stats.own_ip));
    put_u32(&mut out, stats.process_cycle_us);
    put_u32(&mut out, stats.num_joined_mc);
    put_u32(&mut out, stats.num_publishers);
    put_u32(&mut out, stats.num_subscribers);
    put_u32(&mut out, stats.pd.num_send);
    put_u32(&mut out, stats.pd.num_rcv);
    put_u32(&mut out, stats.pd.num_crc_err);
    put_u32(&mut out, stats.pd.num_wire_err);
    put_u32(&mut out, stats.pd.num_topo_err);
    put_u32(&mut out, stats.pd.num_no_subs);
    put_u32(&mut out, stats.pd.num_timeout);
    put_u32(&mut out, stats.pd.num_missed);
    out
}

/// Parse a received statistics reply.
pub fn decode(bytes: &[u8]) -> Result<GlobalStatistics> {
    if bytes.len() < STATS_WIRE_SIZE {
        return Err(Error::Wire(WireFault::Size));
    }
    let label = &bytes[8..8 + LABEL_SIZE];
    let end = label.iter().position(|&b| b == 0).unwrap_or(LABEL_SIZE);
    let host_name = String::from_utf8_lossy(&label[..end]).into_owned();

    Ok(GlobalStatistics {
        version: get_u32(bytes, 0),
        uptime_s: get_u32(bytes, 4),
        host_name,
        own_ip: Ipv4Addr::from(get_u32(bytes, 24)),
        process_cycle_us: get_u32(bytes, 28),
        num_joined_mc: get_u32(bytes, 32),
        num_publishers: get_u32(bytes, 36),
        num_subscribers: get_u32(bytes, 40),
        pd: PdCounters {
            num_send: get_u32(bytes, 44),
            num_rcv: get_u32(bytes, 48),
            num_crc_err: get_u32(bytes, 52),
            num_wire_err: get_u32(bytes, 56),
            num_topo_err: get_u32(bytes, 60),
            num_no_subs: get_u32(bytes, 64),
            num_timeout: get_u32(bytes, 68),
            num_missed: get_u32(bytes, 72),
        },
    })
}
