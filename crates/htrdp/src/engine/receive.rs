// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receive side: socket readiness, frame validation, subscription dispatch.
//!
//! Per-frame errors are counted and logged, never escalated into session
//! teardown. The pull-request path crosses from rx to tx state and uses
//! `try_lock`: under tx contention the reply is dropped with a warning
//! rather than risking a lock-order inversion (the reply is cyclicly
//! retransmittable by a later request anyway).

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{GLOBAL_STATS_REPLY_COMID, MAX_PD_PACKET_SIZE, STATISTICS_PULL_COMID};
use crate::core::subscription::RxKey;
use crate::core::{Arena, PubHandle, SubHandle, SubKind, Subscription};
use crate::engine::index::RcvTables;
use crate::engine::scheduler::{send_element, TxState};
use crate::engine::{PdInfo, PdStatus};
use crate::error::{Error, Result};
use crate::protocol::{valid_topo_counts, FrameBuf, MsgType, PdVersion, TopoCounts};
use crate::session::stats::SessionStats;
use crate::transport::pktinfo::recv_with_dst;

const EVENT_CAPACITY: usize = 64;

/// One watched receive socket.
struct RxSock {
    idx: usize,
    sock: Arc<UdpSocket>,
    refs: u32,
}

/// Receive-side state, guarded by the rx lock.
pub struct RxState {
    pub subs: Arena<Subscription, SubKind>,
    /// Linear lookup order (subscription age).
    pub order: Vec<SubHandle>,
    /// Receive-side index tables, built by `update_session` when enabled.
    pub rcv_index: Option<RcvTables>,
    sockets: Vec<RxSock>,
    poll: Option<mio::Poll>,
    events: mio::Events,
}

impl RxState {
    pub fn new() -> Self {
        let poll = match mio::Poll::new() {
            Ok(p) => Some(p),
            Err(e) => {
                log::debug!("[RX] poller unavailable, falling back to scan: {}", e);
                None
            }
        };
        Self {
            subs: Arena::new(),
            order: Vec::new(),
            rcv_index: None,
            sockets: Vec::new(),
            poll,
            events: mio::Events::with_capacity(EVENT_CAPACITY),
        }
    }

    /// Start draining `sock` (pool index `idx`) during receive passes.
    pub fn watch_socket(&mut self, idx: usize, sock: Arc<UdpSocket>) {
        if let Some(entry) = self.sockets.iter_mut().find(|e| e.idx == idx) {
            entry.refs += 1;
            return;
        }
        #[cfg(unix)]
        if let Some(poll) = &self.poll {
            use mio::unix::SourceFd;
            use std::os::unix::io::AsRawFd;
            let fd = sock.as_raw_fd();
            if let Err(e) =
                poll.registry()
                    .register(&mut SourceFd(&fd), mio::Token(idx), mio::Interest::READABLE)
            {
                log::warn!("[RX] register socket idx={} failed: {}", idx, e);
            }
        }
        self.sockets.push(RxSock { idx, sock, refs: 1 });
    }

    /// Drop one watch reference; the socket leaves the read set with the
    /// last subscription using it.
    pub fn unwatch_socket(&mut self, idx: usize) {
        let Some(pos) = self.sockets.iter().position(|e| e.idx == idx) else {
            return;
        };
        self.sockets[pos].refs -= 1;
        if self.sockets[pos].refs > 0 {
            return;
        }
        #[cfg(unix)]
        if let Some(poll) = &self.poll {
            use mio::unix::SourceFd;
            use std::os::unix::io::AsRawFd;
            let fd = self.sockets[pos].sock.as_raw_fd();
            if let Err(e) = poll.registry().deregister(&mut SourceFd(&fd)) {
                log::debug!("[RX] deregister socket idx={} failed: {}", idx, e);
            }
        }
        self.sockets.remove(pos);
    }

    pub fn watched_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Drop every socket watch (session teardown).
    pub fn clear_watches(&mut self) {
        #[cfg(unix)]
        if let Some(poll) = &self.poll {
            use mio::unix::SourceFd;
            use std::os::unix::io::AsRawFd;
            for entry in &self.sockets {
                let fd = entry.sock.as_raw_fd();
                let _ = poll.registry().deregister(&mut SourceFd(&fd));
            }
        }
        self.sockets.clear();
    }

    /// Earliest subscription timeout instant, `None` without supervision.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        for (_, s) in self.subs.iter() {
            if s.interval.is_zero() || s.timed_out {
                continue;
            }
            if let Some(due) = s.next_due {
                earliest = Some(earliest.map_or(due, |e| e.min(due)));
            }
        }
        earliest
    }
}

impl Default for RxState {
    fn default() -> Self {
        Self::new()
    }
}

/// Cross-state context for one receive pass.
pub(crate) struct RxContext<'a> {
    pub own_ip: Ipv4Addr,
    pub session_topo: TopoCounts,
    pub port: u16,
    pub stats: &'a SessionStats,
    pub tx: &'a Mutex<TxState>,
    /// Renders the current statistics snapshot payload; invoked under the
    /// tx lock when a statistics pull request arrives.
    pub stats_payload: &'a dyn Fn() -> Vec<u8>,
}

/// Drain every readable socket and dispatch the received frames.
///
/// `wait` bounds the poll; `None` means a non-blocking sweep. Returns the
/// last per-frame error; `Ok` when everything was consumed cleanly.
pub(crate) fn receive_pass(
    rx: &mut RxState,
    ctx: &RxContext<'_>,
    wait: Option<Duration>,
) -> Result<()> {
    let ready: Vec<(usize, Arc<UdpSocket>)> = match (&mut rx.poll, cfg!(unix)) {
        (Some(poll), true) => {
            if let Err(e) = poll.poll(&mut rx.events, Some(wait.unwrap_or(Duration::ZERO))) {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    return Err(Error::Io(e));
                }
                return Ok(());
            }
            let mut ready = Vec::new();
            for event in rx.events.iter() {
                let idx = event.token().0;
                if let Some(e) = rx.sockets.iter().find(|e| e.idx == idx) {
                    ready.push((e.idx, Arc::clone(&e.sock)));
                }
            }
            ready
        }
        // Poll-less fallback: sweep every watched socket.
        _ => rx
            .sockets
            .iter()
            .map(|e| (e.idx, Arc::clone(&e.sock)))
            .collect(),
    };

    let mut result = Ok(());
    let mut scratch = vec![0u8; MAX_PD_PACKET_SIZE];
    for (_, sock) in ready {
        loop {
            match recv_with_dst(&sock, &mut scratch) {
                Ok(meta) => {
                    // Frames that entered through a foreign interface do
                    // not belong to this session.
                    if !ctx.own_ip.is_unspecified()
                        && !meta.if_addr.is_unspecified()
                        && meta.if_addr != ctx.own_ip
                    {
                        continue;
                    }
                    match handle_frame(rx, ctx, &scratch[..meta.len], meta.src, meta.dst) {
                        Ok(()) | Err(Error::NoSub) => {}
                        Err(e) => {
                            log::debug!("[RX] frame from {} dropped: {}", meta.src, e);
                            result = Err(e);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("[RX] socket read failed: {}", e);
                    result = Err(Error::Io(e));
                    break;
                }
            }
        }
    }
    result
}

/// Validate and dispatch one datagram: structural check, topography gate,
/// subscription lookup, sequence check, staging, pull handling, callback.
pub(crate) fn handle_frame(
    rx: &mut RxState,
    ctx: &RxContext<'_>,
    bytes: &[u8],
    src: SocketAddrV4,
    dst: Ipv4Addr,
) -> Result<()> {
    let frame = match FrameBuf::from_wire(bytes.to_vec()) {
        Ok(f) => f,
        Err(Error::Crc) => {
            SessionStats::bump(&ctx.stats.num_crc_err);
            return Err(Error::Crc);
        }
        Err(e) => {
            SessionStats::bump(&ctx.stats.num_wire_err);
            return Err(e);
        }
    };
    let is_tsn = frame.version() == PdVersion::V2;

    // Session-level topography gate: stale frames are dropped before any
    // subscription sees them.
    if !is_tsn && !valid_topo_counts(ctx.session_topo, frame.topo()) {
        SessionStats::bump(&ctx.stats.num_topo_err);
        return Err(Error::Topo);
    }

    let msg_type = frame
        .msg_type()
        .ok_or(Error::Wire(crate::error::WireFault::MsgType))?;
    let src_ip = *src.ip();
    let dest_ip = if dst.is_unspecified() { ctx.own_ip } else { dst };
    let key = RxKey {
        com_id: frame.com_id(),
        src_ip,
        dest_ip,
        service_id: frame.service_id(),
        topo: frame.topo(),
    };

    let found = match &rx.rcv_index {
        Some(tables) => tables.find(&rx.subs, &key),
        None => rx
            .order
            .iter()
            .copied()
            .find(|&h| rx.subs.get(h).is_some_and(|s| s.addr.matches(&key))),
    };
    let Some(handle) = found else {
        SessionStats::bump(&ctx.stats.num_no_subs);
        return Err(Error::NoSub);
    };

    // Reply routing data must outlive the frame, which is staged below.
    let reply_com_id = frame.reply_com_id();
    let reply_ip = frame.reply_ip();
    let new_seq = frame.seq();

    let mut inform;
    let mut status = PdStatus::Ok;
    let mut result = Ok(());

    let sub = rx.subs.get_mut(handle).ok_or(Error::NoSub)?;
    let sub_topo_ok = key.topo.is_zero() || valid_topo_counts(sub.addr.topo, key.topo);
    if sub_topo_ok {
        let restart = new_seq == 0 || sub.timed_out;
        match sub.seq.check(src_ip, msg_type, new_seq, restart)? {
            crate::core::SeqCheck::Duplicate => {
                log::debug!(
                    "[RX] old PD data ignored (src {} comId {})",
                    src_ip,
                    key.com_id
                );
                return Ok(());
            }
            crate::core::SeqCheck::Accept { missed } => {
                if sub.num_recv > 0 && missed > 0 {
                    sub.num_missed = sub.num_missed.wrapping_add(missed);
                    SessionStats::add(&ctx.stats.num_missed, missed);
                }
            }
        }

        sub.cur_seq = new_seq;
        sub.last_src = Some(src_ip);
        sub.last_dest = dest_ip;

        let changed = match &sub.frame {
            Some(old) => old.payload() != frame.payload(),
            None => true,
        };
        inform = is_tsn
            || (sub.flags.callback && (sub.flags.force_cb || sub.timed_out || changed));

        sub.frame = Some(frame);
        sub.refresh(Instant::now());
        sub.num_recv = sub.num_recv.wrapping_add(1);
        SessionStats::bump(&ctx.stats.num_rcv);
    } else {
        SessionStats::bump(&ctx.stats.num_topo_err);
        sub.last_status = PdStatus::Topo;
        status = PdStatus::Topo;
        inform = true;
        result = Err(Error::Topo);
    }

    // A pull request addressed to us triggers the matching publication,
    // immediately and under the tx lock.
    if msg_type == MsgType::Pr && !is_tsn && sub_topo_ok {
        match ctx.tx.try_lock() {
            None => {
                // Documented trade-off: rx holds its lock here, so tx is
                // only tried; a busy transmitter drops this reply.
                log::warn!("[RX] pull request could not take the tx lock, reply dropped");
            }
            Some(mut tx) => {
                let pulled = locate_pulled(&mut tx, &key, reply_com_id, reply_ip, ctx);
                match pulled {
                    PulledElement::None => {}
                    PulledElement::NoReplyAddressed => inform = true,
                    PulledElement::Found(h) => {
                        if let Some(p) = tx.pubs.get_mut(h) {
                            p.pull_ip = if reply_ip.is_unspecified() {
                                src_ip
                            } else {
                                reply_ip
                            };
                            p.req_to_send = true;
                        }
                        if let Err(e) = send_element(
                            &mut tx,
                            h,
                            ctx.session_topo,
                            ctx.port,
                            ctx.stats,
                            true,
                            Instant::now(),
                        ) {
                            log::warn!("[RX] pull reply send failed: {}", e);
                        }
                        inform = true;
                    }
                }
            }
        }
    }

    if inform {
        let sub = rx.subs.get_mut(handle).ok_or(Error::NoSub)?;
        if sub.flags.callback {
            if let Some(cb) = sub.callback.clone() {
                let info = pd_info_for_sub(sub, msg_type, status);
                let payload: Vec<u8> = sub
                    .frame
                    .as_ref()
                    .map(|f| f.payload().to_vec())
                    .unwrap_or_default();
                cb(&info, &payload);
            }
        }
    }

    result
}

enum PulledElement {
    None,
    /// Request carried no reply routing (fire-and-forget notification).
    NoReplyAddressed,
    Found(PubHandle),
}

fn locate_pulled(
    tx: &mut TxState,
    key: &RxKey,
    reply_com_id: u32,
    reply_ip: Ipv4Addr,
    ctx: &RxContext<'_>,
) -> PulledElement {
    let find = |tx: &TxState, com_id: u32| {
        tx.pubs
            .iter()
            .find(|(_, p)| p.addr.com_id == com_id)
            .map(|(h, _)| h)
    };

    if key.com_id == STATISTICS_PULL_COMID {
        match find(tx, GLOBAL_STATS_REPLY_COMID) {
            Some(h) => {
                let payload = (ctx.stats_payload)();
                if let Some(p) = tx.pubs.get_mut(h) {
                    if p.frame.set_payload(&payload).is_ok() {
                        p.invalid_data = false;
                    }
                }
                PulledElement::Found(h)
            }
            None => {
                log::error!("[RX] statistics request failed, reply not published");
                PulledElement::None
            }
        }
    } else if reply_com_id == 0 && reply_ip.is_unspecified() {
        PulledElement::NoReplyAddressed
    } else {
        let com_id = if reply_com_id != 0 {
            reply_com_id
        } else {
            key.com_id
        };
        match find(tx, com_id) {
            Some(h) => PulledElement::Found(h),
            None => PulledElement::None,
        }
    }
}

pub(crate) fn pd_info_for_sub(sub: &Subscription, msg_type: MsgType, status: PdStatus) -> PdInfo {
    let mut info = PdInfo::empty(sub.addr.com_id);
    info.msg_type = msg_type;
    info.status = status;
    info.src_ip = sub.last_src.unwrap_or(Ipv4Addr::UNSPECIFIED);
    info.dest_ip = sub.last_dest;
    info.seq_count = sub.cur_seq;
    info.service_id = sub.addr.service_id;
    if let Some(frame) = &sub.frame {
        info.topo = frame.topo();
        info.proto_version = frame.proto_version();
        info.reply_com_id = frame.reply_com_id();
        info.reply_ip = frame.reply_ip();
    }
    info
}
