// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reference-counted UDP socket pool.
//!
//! Publications and subscriptions share sockets keyed by (port, params,
//! direction). Multicast joins are counted per socket so a group is left
//! exactly when the last subscription binding it releases its reference,
//! and joined on exactly one socket per session.
//!
//! Send sockets bind to (own_ip, ephemeral): the destination of a PD is
//! always the configured PD port, never the source port of a previous
//! frame, and binding the send socket to the PD port itself would steal
//! unicast delivery from the wildcard-bound receive socket.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{SendParams, MAX_MULTICAST_PER_SOCKET, MAX_PD_SOCKET_COUNT};
use crate::error::{Error, Result};
use crate::transport::dscp::set_socket_qos;
use crate::transport::pktinfo::enable_pktinfo;

struct McJoin {
    group: Ipv4Addr,
    refs: u32,
}

/// One pooled socket and its bookkeeping.
pub struct SocketEntry {
    sock: Arc<UdpSocket>,
    port: u16,
    params: SendParams,
    rcv_mostly: bool,
    refcount: u32,
    mc_joins: Vec<McJoin>,
}

impl SocketEntry {
    pub fn sock(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.sock)
    }

    pub fn is_rcv(&self) -> bool {
        self.rcv_mostly
    }

    pub fn params(&self) -> SendParams {
        self.params
    }

    fn joined(&self, group: Ipv4Addr) -> bool {
        self.mc_joins.iter().any(|j| j.group == group)
    }
}

/// Session-scoped socket pool (guarded by the session lock).
pub struct SocketPool {
    own_ip: Ipv4Addr,
    entries: Vec<Option<SocketEntry>>,
}

impl SocketPool {
    pub fn new(own_ip: Ipv4Addr) -> Self {
        Self {
            own_ip,
            entries: Vec::new(),
        }
    }

    pub fn own_ip(&self) -> Ipv4Addr {
        self.own_ip
    }

    /// Number of live sockets.
    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find or create a socket for the given parameters; returns its pool
    /// index and a send/recv-capable clone of the socket.
    ///
    /// A requested multicast group is joined on the returned socket unless
    /// another pooled socket already carries it, in which case that socket
    /// is reused regardless of spare capacity elsewhere.
    pub fn request(
        &mut self,
        mc_group: Option<Ipv4Addr>,
        port: u16,
        params: SendParams,
        rcv_mostly: bool,
    ) -> Result<(usize, Arc<UdpSocket>)> {
        let matches = |e: &SocketEntry| {
            e.rcv_mostly == rcv_mostly && e.port == port && e.params == params
        };

        // A group already joined pins the request to its socket.
        let found = if let Some(group) = mc_group {
            self.position(|e| matches(e) && e.joined(group))
                .or_else(|| {
                    self.position(|e| matches(e) && e.mc_joins.len() < MAX_MULTICAST_PER_SOCKET)
                })
        } else {
            self.position(matches)
        };

        let idx = match found {
            Some(idx) => idx,
            None => self.open_socket(port, params, rcv_mostly)?,
        };

        let entry = self.entries[idx].as_mut().ok_or(Error::Init)?;
        if let Some(group) = mc_group {
            if let Some(join) = entry.mc_joins.iter_mut().find(|j| j.group == group) {
                join.refs += 1;
            } else {
                join_group(&entry.sock, group, self.own_ip)?;
                entry.mc_joins.push(McJoin { group, refs: 1 });
            }
        }
        entry.refcount += 1;
        log::debug!(
            "[POOL] request idx={} port={} rcv={} refs={} mc={:?}",
            idx,
            port,
            rcv_mostly,
            entry.refcount,
            mc_group
        );
        Ok((idx, Arc::clone(&entry.sock)))
    }

    /// Drop one reference; leaves the group when its join count reaches
    /// zero and closes the socket when the last reference goes.
    pub fn release(&mut self, idx: usize, mc_group: Option<Ipv4Addr>) {
        let Some(slot) = self.entries.get_mut(idx) else {
            return;
        };
        let Some(entry) = slot.as_mut() else {
            return;
        };

        if let Some(group) = mc_group {
            if let Some(pos) = entry.mc_joins.iter().position(|j| j.group == group) {
                entry.mc_joins[pos].refs -= 1;
                if entry.mc_joins[pos].refs == 0 {
                    if let Err(e) = entry.sock.leave_multicast_v4(&group, &self.own_ip) {
                        log::debug!("[POOL] leave {} failed (non-fatal): {}", group, e);
                    }
                    entry.mc_joins.remove(pos);
                    log::debug!("[POOL] left multicast group {}", group);
                }
            }
        }

        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            log::debug!("[POOL] closing socket idx={}", idx);
            *slot = None;
        }
    }

    pub fn entry(&self, idx: usize) -> Option<&SocketEntry> {
        self.entries.get(idx).and_then(|e| e.as_ref())
    }

    /// All groups currently joined, across all sockets.
    pub fn joined_groups(&self) -> Vec<Ipv4Addr> {
        let mut groups: Vec<Ipv4Addr> = self
            .entries
            .iter()
            .flatten()
            .flat_map(|e| e.mc_joins.iter().map(|j| j.group))
            .collect();
        groups.sort_unstable();
        groups.dedup();
        groups
    }

    /// Close everything (session teardown / reinit).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn position<F: Fn(&SocketEntry) -> bool>(&self, f: F) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.as_ref().is_some_and(&f))
    }

    fn open_socket(&mut self, port: u16, params: SendParams, rcv_mostly: bool) -> Result<usize> {
        if self.len() >= MAX_PD_SOCKET_COUNT {
            return Err(Error::Mem("socket pool exhausted"));
        }

        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(Error::Io)?;
        raw.set_reuse_address(true).map_err(Error::Io)?;

        let sock: UdpSocket = if rcv_mostly {
            let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
            raw.bind(&bind.into()).map_err(Error::Io)?;
            let sock: UdpSocket = raw.into();
            sock.set_nonblocking(true).map_err(Error::Io)?;
            if let Err(e) = enable_pktinfo(&sock) {
                log::debug!("[POOL] pktinfo unavailable: {}", e);
            }
            sock
        } else {
            let bind = SocketAddrV4::new(self.own_ip, 0);
            raw.bind(&bind.into()).map_err(Error::Io)?;
            if !self.own_ip.is_unspecified() {
                if let Err(e) = raw.set_multicast_if_v4(&self.own_ip) {
                    log::debug!("[POOL] multicast_if {} failed: {}", self.own_ip, e);
                }
            }
            let sock: UdpSocket = raw.into();
            sock.set_ttl(u32::from(params.ttl)).map_err(Error::Io)?;
            sock.set_multicast_ttl_v4(u32::from(params.ttl))
                .map_err(Error::Io)?;
            sock.set_multicast_loop_v4(true).map_err(Error::Io)?;
            if let Err(e) = set_socket_qos(&sock, params.qos) {
                log::debug!("[POOL] DSCP {} not applied: {}", params.qos, e);
            }
            sock
        };

        let entry = SocketEntry {
            sock: Arc::new(sock),
            port,
            params,
            rcv_mostly,
            refcount: 0,
            mc_joins: Vec::new(),
        };

        let idx = match self.entries.iter().position(|e| e.is_none()) {
            Some(free) => {
                self.entries[free] = Some(entry);
                free
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };
        log::debug!(
            "[POOL] opened socket idx={} port={} rcv={} qos={} ttl={}",
            idx,
            port,
            rcv_mostly,
            params.qos,
            params.ttl
        );
        Ok(idx)
    }
}

fn join_group(sock: &UdpSocket, group: Ipv4Addr, iface: Ipv4Addr) -> Result<()> {
    match sock.join_multicast_v4(&group, &iface) {
        Ok(()) => {
            log::debug!("[POOL] joined multicast group {} on {}", group, iface);
            Ok(())
        }
        // Already joined on the same physical NIC (Linux EADDRINUSE).
        Err(e) if e.raw_os_error() == Some(98) => {
            log::debug!("[POOL] group {} already joined, continuing", group);
            Ok(())
        }
        Err(e) => {
            log::warn!("[POOL] multicast join {} failed: {}", group, e);
            Err(Error::Io(e))
        }
    }
}
