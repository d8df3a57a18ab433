// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The PD runtime: send schedulers, receive pipeline, timeout supervision,
//! redundancy control, and the callback surface shared by all of them.

pub mod index;
pub mod receive;
pub mod redundancy;
pub mod scheduler;
pub mod timeout;

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{MsgType, TopoCounts};

/// Result code delivered inside a [`PdInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PdStatus {
    #[default]
    Ok,
    /// Subscription exceeded its interval.
    Timeout,
    /// Frame carried stale topography counters.
    Topo,
}

/// Snapshot handed to pre-send and receive callbacks.
///
/// This is a value type: it never borrows engine-owned frame memory, so a
/// callback cannot retain references into internal buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdInfo {
    pub com_id: u32,
    pub src_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub topo: TopoCounts,
    pub msg_type: MsgType,
    pub seq_count: u32,
    pub proto_version: u16,
    pub reply_com_id: u32,
    pub reply_ip: Ipv4Addr,
    pub service_id: u32,
    pub status: PdStatus,
}

impl PdInfo {
    /// Empty record used as a base before field population.
    pub fn empty(com_id: u32) -> Self {
        Self {
            com_id,
            src_ip: Ipv4Addr::UNSPECIFIED,
            dest_ip: Ipv4Addr::UNSPECIFIED,
            topo: TopoCounts::ZERO,
            msg_type: MsgType::Pd,
            seq_count: 0,
            proto_version: 0,
            reply_com_id: 0,
            reply_ip: Ipv4Addr::UNSPECIFIED,
            service_id: 0,
            status: PdStatus::Ok,
        }
    }
}

/// Callback invoked with a populated [`PdInfo`] and the frame payload.
///
/// Receive callbacks for one subscription are serialized by the rx lock;
/// pre-send callbacks run under the tx lock and must not block.
pub type PdCallback = Arc<dyn Fn(&PdInfo, &[u8]) + Send + Sync>;

/// Dataset marshalling capability, applied inside put/get when the
/// marshall flag is set on a publication or subscription.
pub trait Marshaller: Send + Sync {
    fn marshal(&self, com_id: u32, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;
    fn unmarshal(&self, com_id: u32, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;
}
