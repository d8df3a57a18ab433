// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PD frame codec over owned wire buffers.
//!
//! A [`FrameBuf`] holds one complete datagram (header + padded payload) and
//! exposes typed accessors; raw header bytes are never handed out mutably.
//! All multi-byte header fields are network byte order except the FCS word,
//! which is little-endian.
//!
//! v1 header (40 bytes):
//!
//! ```text
//! offset size field
//!  0     2   protocolVersion (0x01xx)
//!  2     2   msgType ('Pd' 'Pp' 'Pr' 'Pe')
//!  4     4   comId
//!  8     4   etbTopoCnt
//! 12     4   opTrnTopoCnt
//! 16     4   datasetLength
//! 20     4   reserved / serviceId
//! 24     4   replyComId
//! 28     4   replyIpAddress
//! 32     4   sequenceCounter
//! 36     4   frameCheckSum (CRC32 over bytes 0..35, little-endian)
//! ```
//!
//! v2 (TSN) header (24 bytes): protocolVersion (0x02), msgType,
//! datasetLength (u16), comId, serviceId, reserved, sequenceCounter, FCS
//! over the first 20 bytes. Both header generations start with the
//! protocol version, so a receiver can classify a datagram from its first
//! byte alone (0x01 = v1, 0x02 = v2).

use std::net::Ipv4Addr;

use crate::config::{
    packet_size_pd, packet_size_pd2, MAX_PD_DATA_SIZE, MAX_PD_PACKET_SIZE, MAX_TSN_DATA_SIZE,
    PD2_HEADER_SIZE, PD_HEADER_SIZE, PROTO_VERSION, PROTO_VERSION_MASK, TSN_PROTO_VERSION,
};
use crate::error::{Error, Result, WireFault};
use crate::protocol::crc::{crc32, INITFCS};
use crate::protocol::{MsgType, TopoCounts};

/// Frame format generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdVersion {
    V1,
    V2,
}

/// One complete PD datagram, owned.
#[derive(Debug, Clone)]
pub struct FrameBuf {
    version: PdVersion,
    bytes: Vec<u8>,
}

// v1 field offsets
const V1_PROTO: usize = 0;
const V1_MSG_TYPE: usize = 2;
const V1_COM_ID: usize = 4;
const V1_ETB_TOPO: usize = 8;
const V1_OPTRN_TOPO: usize = 12;
const V1_DATASET_LEN: usize = 16;
const V1_SERVICE_ID: usize = 20;
const V1_REPLY_COM_ID: usize = 24;
const V1_REPLY_IP: usize = 28;
const V1_SEQ: usize = 32;
const V1_FCS: usize = 36;

// v2 field offsets
const V2_PROTO: usize = 0;
const V2_MSG_TYPE: usize = 1;
const V2_DATASET_LEN: usize = 2;
const V2_COM_ID: usize = 4;
const V2_SERVICE_ID: usize = 8;
const V2_SEQ: usize = 16;
const V2_FCS: usize = 20;

#[inline]
fn get_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
fn get_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
fn put_u16(bytes: &mut [u8], at: usize, v: u16) {
    bytes[at..at + 2].copy_from_slice(&v.to_be_bytes());
}

#[inline]
fn put_u32(bytes: &mut [u8], at: usize, v: u32) {
    bytes[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

impl FrameBuf {
    /// Create an empty v1 push frame for a publication.
    pub fn v1(com_id: u32, service_id: u32, topo: TopoCounts, data_size: usize) -> Self {
        let mut f = Self {
            version: PdVersion::V1,
            bytes: vec![0u8; packet_size_pd(data_size)],
        };
        put_u16(&mut f.bytes, V1_PROTO, PROTO_VERSION);
        f.set_msg_type(MsgType::Pd);
        put_u32(&mut f.bytes, V1_COM_ID, com_id);
        put_u32(&mut f.bytes, V1_SERVICE_ID, service_id);
        put_u32(&mut f.bytes, V1_DATASET_LEN, data_size as u32);
        f.set_topo(topo);
        f
    }

    /// Create an empty v2 (TSN) frame for a publication.
    pub fn v2(com_id: u32, service_id: u32, data_size: usize) -> Self {
        let mut f = Self {
            version: PdVersion::V2,
            bytes: vec![0u8; packet_size_pd2(data_size)],
        };
        f.bytes[V2_PROTO] = TSN_PROTO_VERSION;
        f.set_msg_type(MsgType::TsnPd);
        put_u32(&mut f.bytes, V2_COM_ID, com_id);
        put_u32(&mut f.bytes, V2_SERVICE_ID, service_id);
        put_u16(&mut f.bytes, V2_DATASET_LEN, data_size as u16);
        f
    }

    /// Validate a received datagram and take ownership of it.
    ///
    /// Runs the full structural check: size window, protocol version, FCS,
    /// message type, dataset length. Never panics on arbitrary input.
    pub fn from_wire(bytes: Vec<u8>) -> Result<Self> {
        let version = check(&bytes)?;
        Ok(Self { version, bytes })
    }

    pub fn version(&self) -> PdVersion {
        self.version
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn header_size(&self) -> usize {
        match self.version {
            PdVersion::V1 => PD_HEADER_SIZE,
            PdVersion::V2 => PD2_HEADER_SIZE,
        }
    }

    pub fn com_id(&self) -> u32 {
        match self.version {
            PdVersion::V1 => get_u32(&self.bytes, V1_COM_ID),
            PdVersion::V2 => get_u32(&self.bytes, V2_COM_ID),
        }
    }

    pub fn service_id(&self) -> u32 {
        match self.version {
            PdVersion::V1 => get_u32(&self.bytes, V1_SERVICE_ID),
            PdVersion::V2 => get_u32(&self.bytes, V2_SERVICE_ID),
        }
    }

    pub fn proto_version(&self) -> u16 {
        match self.version {
            PdVersion::V1 => get_u16(&self.bytes, V1_PROTO),
            PdVersion::V2 => u16::from(self.bytes[V2_PROTO]),
        }
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        match self.version {
            PdVersion::V1 => MsgType::from_wire_v1(get_u16(&self.bytes, V1_MSG_TYPE)),
            PdVersion::V2 => MsgType::from_wire_v2(self.bytes[V2_MSG_TYPE]),
        }
    }

    pub fn set_msg_type(&mut self, mt: MsgType) {
        match self.version {
            PdVersion::V1 => {
                if let Some(raw) = mt.wire_v1() {
                    put_u16(&mut self.bytes, V1_MSG_TYPE, raw);
                }
            }
            PdVersion::V2 => {
                if let Some(raw) = mt.wire_v2() {
                    self.bytes[V2_MSG_TYPE] = raw;
                }
            }
        }
    }

    pub fn seq(&self) -> u32 {
        match self.version {
            PdVersion::V1 => get_u32(&self.bytes, V1_SEQ),
            PdVersion::V2 => get_u32(&self.bytes, V2_SEQ),
        }
    }

    pub fn set_seq(&mut self, seq: u32) {
        match self.version {
            PdVersion::V1 => put_u32(&mut self.bytes, V1_SEQ, seq),
            PdVersion::V2 => put_u32(&mut self.bytes, V2_SEQ, seq),
        }
    }

    /// Topography counters; always zero for v2 frames.
    pub fn topo(&self) -> TopoCounts {
        match self.version {
            PdVersion::V1 => TopoCounts::new(
                get_u32(&self.bytes, V1_ETB_TOPO),
                get_u32(&self.bytes, V1_OPTRN_TOPO),
            ),
            PdVersion::V2 => TopoCounts::ZERO,
        }
    }

    pub fn set_topo(&mut self, topo: TopoCounts) {
        if self.version == PdVersion::V1 {
            put_u32(&mut self.bytes, V1_ETB_TOPO, topo.etb);
            put_u32(&mut self.bytes, V1_OPTRN_TOPO, topo.op_trn);
        }
    }

    pub fn reply_com_id(&self) -> u32 {
        match self.version {
            PdVersion::V1 => get_u32(&self.bytes, V1_REPLY_COM_ID),
            PdVersion::V2 => 0,
        }
    }

    pub fn set_reply_com_id(&mut self, com_id: u32) {
        if self.version == PdVersion::V1 {
            put_u32(&mut self.bytes, V1_REPLY_COM_ID, com_id);
        }
    }

    pub fn reply_ip(&self) -> Ipv4Addr {
        match self.version {
            PdVersion::V1 => Ipv4Addr::from(get_u32(&self.bytes, V1_REPLY_IP)),
            PdVersion::V2 => Ipv4Addr::UNSPECIFIED,
        }
    }

    pub fn set_reply_ip(&mut self, ip: Ipv4Addr) {
        if self.version == PdVersion::V1 {
            put_u32(&mut self.bytes, V1_REPLY_IP, u32::from(ip));
        }
    }

    pub fn dataset_len(&self) -> usize {
        match self.version {
            PdVersion::V1 => get_u32(&self.bytes, V1_DATASET_LEN) as usize,
            PdVersion::V2 => get_u16(&self.bytes, V2_DATASET_LEN) as usize,
        }
    }

    /// The payload, truncated to the declared dataset length.
    pub fn payload(&self) -> &[u8] {
        let start = self.header_size();
        let end = (start + self.dataset_len()).min(self.bytes.len());
        &self.bytes[start..end]
    }

    /// Stage new payload bytes, resizing the buffer to the padded gross size.
    pub fn set_payload(&mut self, data: &[u8]) -> Result<()> {
        let (max, gross) = match self.version {
            PdVersion::V1 => (MAX_PD_DATA_SIZE, packet_size_pd(data.len())),
            PdVersion::V2 => (MAX_TSN_DATA_SIZE, packet_size_pd2(data.len())),
        };
        if data.len() > max {
            return Err(Error::Param("payload exceeds PD dataset limit"));
        }
        self.bytes.resize(gross, 0);
        let start = self.header_size();
        self.bytes[start..start + data.len()].copy_from_slice(data);
        // zero the padding so comparisons over the gross size are stable
        for b in &mut self.bytes[start + data.len()..] {
            *b = 0;
        }
        match self.version {
            PdVersion::V1 => put_u32(&mut self.bytes, V1_DATASET_LEN, data.len() as u32),
            PdVersion::V2 => put_u16(&mut self.bytes, V2_DATASET_LEN, data.len() as u16),
        }
        Ok(())
    }

    fn fcs_offset(&self) -> usize {
        match self.version {
            PdVersion::V1 => V1_FCS,
            PdVersion::V2 => V2_FCS,
        }
    }

    /// Recompute and store the FCS. Call after any header mutation.
    pub fn update_fcs(&mut self) {
        let at = self.fcs_offset();
        let fcs = crc32(INITFCS, &self.bytes[..at]);
        self.bytes[at..at + 4].copy_from_slice(&fcs.to_le_bytes());
    }

    /// Write the per-send fields (type, topo, sequence) and reseal the FCS.
    pub fn prepare_send(&mut self, mt: MsgType, topo: TopoCounts, seq: u32) {
        self.set_msg_type(mt);
        self.set_topo(topo);
        self.set_seq(seq);
        self.update_fcs();
    }
}

/// Structural check of a received datagram: size window, then protocol
/// version, FCS, message type and dataset length, in that order.
pub fn check(bytes: &[u8]) -> Result<PdVersion> {
    if bytes.len() < PD2_HEADER_SIZE || bytes.len() > MAX_PD_PACKET_SIZE {
        return Err(Error::Wire(WireFault::Size));
    }

    // Both header generations lead with the protocol version: the first
    // byte is 0x01 for v1 and 0x02 for v2, so classification is exact.
    if bytes[V2_PROTO] == TSN_PROTO_VERSION {
        let stored = u32::from_le_bytes([
            bytes[V2_FCS],
            bytes[V2_FCS + 1],
            bytes[V2_FCS + 2],
            bytes[V2_FCS + 3],
        ]);
        if crc32(INITFCS, &bytes[..V2_FCS]) != stored {
            return Err(Error::Crc);
        }
        if MsgType::from_wire_v2(bytes[V2_MSG_TYPE]).is_none() {
            return Err(Error::Wire(WireFault::MsgType));
        }
        let dsl = get_u16(bytes, V2_DATASET_LEN) as usize;
        if dsl > MAX_TSN_DATA_SIZE || packet_size_pd2(dsl) > bytes.len() {
            return Err(Error::Wire(WireFault::DatasetLength));
        }
        return Ok(PdVersion::V2);
    }

    if bytes.len() < PD_HEADER_SIZE {
        return Err(Error::Wire(WireFault::Size));
    }
    if get_u16(bytes, V1_PROTO) & PROTO_VERSION_MASK != PROTO_VERSION {
        return Err(Error::Wire(WireFault::Version));
    }
    let stored = u32::from_le_bytes([
        bytes[V1_FCS],
        bytes[V1_FCS + 1],
        bytes[V1_FCS + 2],
        bytes[V1_FCS + 3],
    ]);
    if crc32(INITFCS, &bytes[..V1_FCS]) != stored {
        return Err(Error::Crc);
    }
    if MsgType::from_wire_v1(get_u16(bytes, V1_MSG_TYPE)).is_none() {
        return Err(Error::Wire(WireFault::MsgType));
    }
    let dsl = get_u32(bytes, V1_DATASET_LEN) as usize;
    if dsl > MAX_PD_DATA_SIZE || packet_size_pd(dsl) > bytes.len() {
        return Err(Error::Wire(WireFault::DatasetLength));
    }
    Ok(PdVersion::V1)
}
