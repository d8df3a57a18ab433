// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session lifecycle and the public PD API.
//!
//! One [`Session`] owns a publish queue, a subscribe queue, a socket pool
//! and the statistics counters. State is split across three locks acquired
//! in a fixed order: session (socket pool), then tx (publish queue), then
//! rx (subscribe queue). A dedicated send thread and a dedicated receive
//! thread can run `process_send`/`process_receive` without contending.
//!
//! The receive-to-transmit crossing (remote pull requests) never waits on
//! tx; see `engine::receive`.

pub mod registry;
pub mod stats;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::config::{
    SendParams, SessionConfig, GLOBAL_STATS_REPLY_COMID, STATISTICS_PULL_COMID,
};
use crate::core::subscription::{SubAddress, TimeoutBehavior};
use crate::core::{PdFlags, PubAddress, PubHandle, Publication, SequenceTracker, SubHandle, Subscription};
use crate::engine::index::{IndexPreset, IndexTables, RcvTables};
use crate::engine::receive::{pd_info_for_sub, receive_pass, RxContext, RxState};
use crate::engine::scheduler::{process_send_legacy, send_element, TxState};
use crate::engine::{index, redundancy, timeout, PdCallback, PdInfo, PdStatus};
use crate::error::{Error, Result};
use crate::protocol::{stats as stats_wire, FrameBuf, MsgType, TopoCounts};
use crate::session::stats::{
    GlobalStatistics, PubStatistics, RedundancyStatistics, SessionStats, SubStatistics,
};
use crate::transport::{resolve_own_ip, SocketPool};

/// Engine version, packed major.minor.update.evolution.
const ENGINE_VERSION: u32 = 0x0004_0100;

/// Parameters for `publish` and `request`-free publications.
pub struct PublishRequest {
    pub com_id: u32,
    /// Destination (unicast or multicast). May stay unspecified for
    /// pull-only telegrams (interval zero).
    pub dest_ip: Ipv4Addr,
    pub service_id: u32,
    /// Cyclic interval; `ZERO` makes the telegram pull-only.
    pub interval: Duration,
    /// Redundancy group; 0 = not redundant.
    pub red_id: u32,
    pub flags: PdFlags,
    /// Socket parameters; `None` takes the session defaults.
    pub send_params: Option<SendParams>,
    /// Initial payload; without it the telegram stays quiet until `put`.
    pub data: Option<Vec<u8>>,
    pub pre_send: Option<PdCallback>,
}

impl Default for PublishRequest {
    fn default() -> Self {
        Self {
            com_id: 0,
            dest_ip: Ipv4Addr::UNSPECIFIED,
            service_id: 0,
            interval: Duration::ZERO,
            red_id: 0,
            flags: PdFlags::default(),
            send_params: None,
            data: None,
            pre_send: None,
        }
    }
}

/// Parameters for `subscribe`.
pub struct SubscribeRequest {
    pub com_id: u32,
    pub service_id: u32,
    /// Source filter range; unspecified accepts any source.
    pub src_lo: Ipv4Addr,
    pub src_hi: Ipv4Addr,
    /// Bound destination: a multicast group to join, a unicast address,
    /// or unspecified for any.
    pub dest_ip: Ipv4Addr,
    /// Supervision interval; `None` takes the session default,
    /// `Some(ZERO)` disables supervision.
    pub timeout: Option<Duration>,
    pub to_behavior: TimeoutBehavior,
    pub flags: PdFlags,
    pub callback: Option<PdCallback>,
}

impl Default for SubscribeRequest {
    fn default() -> Self {
        Self {
            com_id: 0,
            service_id: 0,
            src_lo: Ipv4Addr::UNSPECIFIED,
            src_hi: Ipv4Addr::UNSPECIFIED,
            dest_ip: Ipv4Addr::UNSPECIFIED,
            timeout: None,
            to_behavior: TimeoutBehavior::default(),
            flags: PdFlags {
                callback: true,
                ..PdFlags::default()
            },
            callback: None,
        }
    }
}

/// Parameters for `request` (an outgoing pull request).
pub struct PullRequest {
    /// ComId of the requested telegram.
    pub com_id: u32,
    /// Where the PR itself is sent.
    pub dest_ip: Ipv4Addr,
    /// ComId the publisher should reply on (0 = same as `com_id`).
    pub reply_com_id: u32,
    /// Address the reply should go to (unspecified = our source address
    /// as seen by the publisher).
    pub reply_ip: Ipv4Addr,
    /// Subscription whose timeout is re-armed while the reply is pending.
    pub sub: Option<SubHandle>,
}

struct SessionShared {
    pool: SocketPool,
}

/// One PD engine instance.
pub struct Session {
    id: u64,
    cfg: SessionConfig,
    own_ip: Ipv4Addr,
    topo: ArcSwap<TopoCounts>,
    shared: Mutex<SessionShared>,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
    stats: SessionStats,
    num_pubs: AtomicU32,
    num_subs: AtomicU32,
    num_joined: AtomicU32,
    opened_at: Instant,
}

impl Session {
    // ===== Lifecycle =====

    pub(crate) fn open(cfg: SessionConfig, id: u64) -> Result<Arc<Self>> {
        let own_ip = resolve_own_ip(cfg.own_ip)?;
        let session = Arc::new(Self {
            id,
            own_ip,
            topo: ArcSwap::from_pointee(TopoCounts::ZERO),
            shared: Mutex::new(SessionShared {
                pool: SocketPool::new(own_ip),
            }),
            tx: Mutex::new(TxState::new()),
            rx: Mutex::new(RxState::new()),
            stats: SessionStats::default(),
            num_pubs: AtomicU32::new(0),
            num_subs: AtomicU32::new(0),
            num_joined: AtomicU32::new(0),
            opened_at: Instant::now(),
            cfg,
        });

        // The engine serves its own statistics: a pull-only reply telegram
        // and the subscription its pull requests arrive on. Failure here
        // aborts the open.
        session.publish(PublishRequest {
            com_id: GLOBAL_STATS_REPLY_COMID,
            ..PublishRequest::default()
        })?;
        session.subscribe(SubscribeRequest {
            com_id: STATISTICS_PULL_COMID,
            timeout: Some(Duration::ZERO),
            flags: PdFlags::default(),
            ..SubscribeRequest::default()
        })?;

        log::debug!("[SESSION] session {} bound to {}", id, own_ip);
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn own_ip(&self) -> Ipv4Addr {
        self.own_ip
    }

    /// Flush the session: drop all queues, watches and sockets. Called by
    /// the manager after unlinking; the lock triplet is taken in order so
    /// in-flight passes finish first.
    pub(crate) fn close(&self) {
        let mut shared = self.shared.lock();
        let mut tx = self.tx.lock();
        let mut rx = self.rx.lock();
        tx.pubs.clear();
        tx.order.clear();
        tx.index = None;
        tx.pending_release.clear();
        rx.clear_watches();
        rx.subs.clear();
        rx.order.clear();
        rx.rcv_index = None;
        shared.pool.clear();
        self.num_pubs.store(0, Ordering::Relaxed);
        self.num_subs.store(0, Ordering::Relaxed);
        self.num_joined.store(0, Ordering::Relaxed);
    }

    /// Rebuild every socket and re-join all multicast groups, keeping the
    /// publish/subscribe configuration. Used after an interface change.
    pub fn reinit(&self) -> Result<()> {
        let mut shared = self.shared.lock();
        let mut tx = self.tx.lock();
        let mut rx = self.rx.lock();

        // Socket parameters survive via the pool entries they came from.
        let pub_params: Vec<(PubHandle, SendParams)> = tx
            .pubs
            .iter()
            .map(|(h, p)| {
                let params = p
                    .sock_idx
                    .and_then(|i| shared.pool.entry(i).map(|e| e.params()))
                    .unwrap_or(self.cfg.pd.send_params);
                (h, params)
            })
            .collect();

        rx.clear_watches();
        shared.pool.clear();

        for (h, params) in pub_params {
            let (idx, sock) = shared
                .pool
                .request(None, self.cfg.pd.port, params, false)?;
            if let Some(p) = tx.pubs.get_mut(h) {
                p.sock_idx = Some(idx);
                p.sock = Some(sock);
            }
        }

        let sub_handles: Vec<(SubHandle, Option<Ipv4Addr>)> = rx
            .subs
            .iter()
            .map(|(h, s)| (h, s.mc_group))
            .collect();
        for (h, mc_group) in sub_handles {
            let (idx, sock) = shared.pool.request(
                mc_group,
                self.cfg.pd.port,
                self.cfg.pd.send_params,
                true,
            )?;
            if let Some(sub) = rx.subs.get_mut(h) {
                sub.sock_idx = Some(idx);
                sub.seq.reset_all();
            }
            rx.watch_socket(idx, sock);
        }

        self.num_joined
            .store(shared.pool.joined_groups().len() as u32, Ordering::Relaxed);
        log::info!("[SESSION] session {} re-initialised", self.id);
        Ok(())
    }

    // ===== Topography counters =====

    fn current_topo(&self) -> TopoCounts {
        **self.topo.load()
    }

    pub fn set_etb_topo_count(&self, etb: u32) {
        let cur = self.current_topo();
        self.topo.store(Arc::new(TopoCounts { etb, ..cur }));
        log::info!("[SESSION] ETB topo count set to {}", etb);
    }

    pub fn etb_topo_count(&self) -> u32 {
        self.current_topo().etb
    }

    pub fn set_op_train_topo_count(&self, op_trn: u32) {
        let cur = self.current_topo();
        self.topo.store(Arc::new(TopoCounts { op_trn, ..cur }));
        log::info!("[SESSION] opTrn topo count set to {}", op_trn);
    }

    pub fn op_train_topo_count(&self) -> u32 {
        self.current_topo().op_trn
    }

    // ===== Publisher =====

    /// Create a publication. Cyclic telegrams need a destination; pull-only
    /// ones (interval zero) may leave it unspecified and are addressed by
    /// the incoming request.
    pub fn publish(&self, req: PublishRequest) -> Result<PubHandle> {
        if req.com_id == 0 {
            return Err(Error::Param("comId must not be zero"));
        }
        if !req.interval.is_zero() && req.dest_ip.is_unspecified() {
            return Err(Error::Param("cyclic publication needs a destination"));
        }

        let params = req.send_params.unwrap_or(self.cfg.pd.send_params);
        let topo = self.current_topo();
        let addr = PubAddress {
            src_ip: self.own_ip,
            dest_ip: req.dest_ip,
            com_id: req.com_id,
            service_id: req.service_id,
        };

        let mut shared = self.shared.lock();
        let (sock_idx, sock) = shared
            .pool
            .request(None, self.cfg.pd.port, params, false)?;

        let mut tx = self.tx.lock();
        if tx.pubs.iter().any(|(_, p)| p.addr == addr) {
            shared.pool.release(sock_idx, None);
            return Err(Error::Param("publication identity already in use"));
        }

        let mut frame = if req.flags.tsn {
            FrameBuf::v2(req.com_id, req.service_id, 0)
        } else {
            FrameBuf::v1(req.com_id, req.service_id, topo, 0)
        };

        let mut invalid_data = true;
        if let Some(data) = &req.data {
            let staged = self.marshalled(req.com_id, data, req.flags.marshall)?;
            frame.set_payload(&staged)?;
            invalid_data = false;
        }

        let handle = tx.pubs.insert(Publication {
            addr,
            interval: req.interval,
            next_due: (!req.interval.is_zero()).then(Instant::now),
            red_id: req.red_id,
            push_seq: None,
            pull_seq: None,
            frame,
            sock_idx: Some(sock_idx),
            sock: Some(sock),
            pull_ip: Ipv4Addr::UNSPECIFIED,
            flags: req.flags,
            invalid_data,
            follower: false,
            req_to_send: false,
            pre_send: req.pre_send,
            num_sent: 0,
        });
        tx.order.push(handle);
        self.num_pubs.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "[SESSION] published comId {} -> {} every {:?}",
            req.com_id,
            req.dest_ip,
            req.interval
        );
        Ok(handle)
    }

    /// Rebind a publication to the session's current topography counters
    /// and optionally to a new destination. Sequence state, buffers,
    /// callbacks and flags survive.
    pub fn republish(&self, handle: PubHandle, dest_ip: Option<Ipv4Addr>) -> Result<()> {
        let topo = self.current_topo();
        let mut tx = self.tx.lock();
        let p = tx.pubs.get_mut(handle).ok_or(Error::NoPub)?;
        p.frame.set_topo(topo);
        if let Some(dest) = dest_ip {
            if dest.is_unspecified() && !p.interval.is_zero() {
                return Err(Error::Param("cyclic publication needs a destination"));
            }
            p.addr.dest_ip = dest;
        }
        Ok(())
    }

    pub fn unpublish(&self, handle: PubHandle) -> Result<()> {
        let mut shared = self.shared.lock();
        let mut tx = self.tx.lock();
        let p = tx.pubs.remove(handle).ok_or(Error::NoPub)?;
        tx.order.retain(|h| *h != handle);
        if let Some(idx) = p.sock_idx {
            shared.pool.release(idx, None);
        }
        self.num_pubs.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stage new payload data; it goes on the wire with the next due send.
    pub fn put(&self, handle: PubHandle, data: &[u8]) -> Result<()> {
        let mut tx = self.tx.lock();
        let p = tx.pubs.get_mut(handle).ok_or(Error::NoPub)?;
        let staged = self.marshalled(p.addr.com_id, data, p.flags.marshall)?;
        p.frame.set_payload(&staged)?;
        p.invalid_data = false;
        Ok(())
    }

    /// Stage new payload data and transmit it right away, outside the
    /// cyclic schedule.
    pub fn put_immediate(&self, handle: PubHandle, data: &[u8]) -> Result<()> {
        self.put(handle, data)?;
        let topo = self.current_topo();
        let mut tx = self.tx.lock();
        let result = send_element(
            &mut tx,
            handle,
            topo,
            self.cfg.pd.port,
            &self.stats,
            false,
            Instant::now(),
        );
        let pending: Vec<_> = tx.pending_release.drain(..).collect();
        drop(tx);
        self.release_pending(pending);
        result
    }

    /// Issue a pull request for `com_id`. The PR is queued at the head of
    /// the send queue and emitted by the next send pass, once.
    pub fn request(&self, req: PullRequest) -> Result<()> {
        if req.com_id == 0 {
            return Err(Error::Param("comId must not be zero"));
        }
        if req.dest_ip.is_unspecified() {
            return Err(Error::Param("pull request needs a destination"));
        }

        let topo = self.current_topo();
        let mut shared = self.shared.lock();
        let (sock_idx, sock) = shared
            .pool
            .request(None, self.cfg.pd.port, self.cfg.pd.send_params, false)?;

        {
            let mut tx = self.tx.lock();
            let mut frame = FrameBuf::v1(req.com_id, 0, topo, 0);
            frame.set_msg_type(MsgType::Pr);
            frame.set_reply_com_id(req.reply_com_id);
            frame.set_reply_ip(req.reply_ip);

            let handle = tx.pubs.insert(Publication {
                addr: PubAddress {
                    src_ip: self.own_ip,
                    dest_ip: req.dest_ip,
                    com_id: req.com_id,
                    service_id: 0,
                },
                interval: Duration::ZERO,
                next_due: None,
                red_id: 0,
                push_seq: None,
                pull_seq: None,
                frame,
                sock_idx: Some(sock_idx),
                sock: Some(sock),
                pull_ip: Ipv4Addr::UNSPECIFIED,
                flags: PdFlags::default(),
                invalid_data: false,
                follower: false,
                req_to_send: true,
                pre_send: None,
                num_sent: 0,
            });
            tx.order.insert(0, handle);
        }

        // While the reply is outstanding the subscription must not time
        // out on the requester.
        if let Some(sub_handle) = req.sub {
            let mut rx = self.rx.lock();
            if let Some(sub) = rx.subs.get_mut(sub_handle) {
                if sub.addr.com_id != STATISTICS_PULL_COMID && !sub.interval.is_zero() {
                    sub.next_due = Some(Instant::now() + sub.interval);
                }
            }
        }
        Ok(())
    }

    // ===== Subscriber =====

    pub fn subscribe(&self, req: SubscribeRequest) -> Result<SubHandle> {
        if req.com_id == 0 {
            return Err(Error::Param("comId must not be zero"));
        }
        let timeout = req.timeout.unwrap_or(self.cfg.pd.timeout);
        let mc_group = req.dest_ip.is_multicast().then_some(req.dest_ip);
        let topo = self.current_topo();

        let mut shared = self.shared.lock();
        let (sock_idx, sock) = shared.pool.request(
            mc_group,
            self.cfg.pd.port,
            self.cfg.pd.send_params,
            true,
        )?;
        self.num_joined
            .store(shared.pool.joined_groups().len() as u32, Ordering::Relaxed);

        let mut rx = self.rx.lock();
        let handle = rx.subs.insert(Subscription {
            addr: SubAddress {
                com_id: req.com_id,
                service_id: req.service_id,
                src_lo: req.src_lo,
                src_hi: req.src_hi,
                dest_ip: req.dest_ip,
                topo,
            },
            interval: timeout,
            next_due: (!timeout.is_zero()).then(|| Instant::now() + timeout),
            to_behavior: req.to_behavior,
            frame: None,
            seq: SequenceTracker::new(),
            cur_seq: 0,
            last_src: None,
            last_dest: Ipv4Addr::UNSPECIFIED,
            sock_idx: Some(sock_idx),
            mc_group,
            callback: req.callback,
            flags: req.flags,
            timed_out: false,
            last_status: PdStatus::Ok,
            num_recv: 0,
            num_missed: 0,
        });
        rx.order.push(handle);
        rx.watch_socket(sock_idx, sock);
        self.num_subs.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "[SESSION] subscribed comId {} (dest {}, timeout {:?})",
            req.com_id,
            req.dest_ip,
            timeout
        );
        Ok(handle)
    }

    /// Rebind a subscription to the current topography counters and
    /// optionally to a new destination/multicast group. Reception state
    /// and statistics survive; the sequence trackers restart.
    pub fn resubscribe(&self, handle: SubHandle, dest_ip: Option<Ipv4Addr>) -> Result<()> {
        let topo = self.current_topo();
        let mut shared = self.shared.lock();
        let mut rx = self.rx.lock();
        let sub = rx.subs.get(handle).ok_or(Error::NoSub)?;
        let old_idx = sub.sock_idx;
        let old_mc = sub.mc_group;
        let new_dest = dest_ip.unwrap_or(sub.addr.dest_ip);
        let new_mc = new_dest.is_multicast().then_some(new_dest);

        if new_mc != old_mc {
            let (idx, sock) = shared.pool.request(
                new_mc,
                self.cfg.pd.port,
                self.cfg.pd.send_params,
                true,
            )?;
            if let Some(old) = old_idx {
                rx.unwatch_socket(old);
                shared.pool.release(old, old_mc);
            }
            rx.watch_socket(idx, sock);
            let sub = rx.subs.get_mut(handle).ok_or(Error::NoSub)?;
            sub.sock_idx = Some(idx);
            sub.mc_group = new_mc;
        }

        let sub = rx.subs.get_mut(handle).ok_or(Error::NoSub)?;
        sub.addr.dest_ip = new_dest;
        sub.addr.topo = topo;
        sub.seq.reset_all();
        self.num_joined
            .store(shared.pool.joined_groups().len() as u32, Ordering::Relaxed);
        Ok(())
    }

    pub fn unsubscribe(&self, handle: SubHandle) -> Result<()> {
        let mut shared = self.shared.lock();
        let mut rx = self.rx.lock();
        let sub = rx.subs.remove(handle).ok_or(Error::NoSub)?;
        rx.order.retain(|h| *h != handle);
        if let Some(idx) = sub.sock_idx {
            rx.unwatch_socket(idx);
            shared.pool.release(idx, sub.mc_group);
        }
        self.num_joined
            .store(shared.pool.joined_groups().len() as u32, Ordering::Relaxed);
        self.num_subs.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Copy the last received payload into `buf`.
    ///
    /// While the subscription is timed out, `SetToZero` yields zeroes and
    /// `KeepLastValue` the stale bytes; either way the returned `PdInfo`
    /// carries `PdStatus::Timeout`.
    pub fn get(&self, handle: SubHandle, buf: &mut [u8]) -> Result<(usize, PdInfo)> {
        let rx = self.rx.lock();
        let sub = rx.subs.get(handle).ok_or(Error::NoSub)?;
        let Some(frame) = &sub.frame else {
            return Err(Error::NoData);
        };

        let msg_type = frame.msg_type().unwrap_or(MsgType::Pd);
        let status = if sub.timed_out {
            PdStatus::Timeout
        } else {
            sub.last_status
        };
        let info = pd_info_for_sub(sub, msg_type, status);

        if sub.timed_out && sub.to_behavior == TimeoutBehavior::SetToZero {
            let n = frame.dataset_len().min(buf.len());
            buf[..n].fill(0);
            return Ok((n, info));
        }

        let payload = if sub.flags.marshall {
            match &self.cfg.pd.marshaller {
                Some(m) => {
                    let mut out = Vec::new();
                    m.unmarshal(sub.addr.com_id, frame.payload(), &mut out)?;
                    out
                }
                None => frame.payload().to_vec(),
            }
        } else {
            frame.payload().to_vec()
        };

        if buf.len() < payload.len() {
            return Err(Error::Param("buffer too small for dataset"));
        }
        buf[..payload.len()].copy_from_slice(&payload);
        Ok((payload.len(), info))
    }

    // ===== Redundancy =====

    pub fn set_redundant(&self, group: u32, leader: bool) -> Result<()> {
        let mut tx = self.tx.lock();
        redundancy::set_redundant(&mut tx, group, leader)
    }

    pub fn is_redundant_leader(&self, group: u32) -> Result<bool> {
        let tx = self.tx.lock();
        redundancy::get_redundant(&tx, group)
    }

    // ===== Processing =====

    /// One send pass. Indexed when the tables are built, list-walking
    /// otherwise.
    pub fn process_send(&self) -> Result<()> {
        let now = Instant::now();
        let topo = self.current_topo();
        let mut tx = self.tx.lock();
        let result = if self.cfg.indexed_scheduling && tx.index.is_some() {
            index::process_send_indexed(&mut tx, now, topo, self.cfg.pd.port, &self.stats)
        } else {
            if self.cfg.indexed_scheduling {
                log::debug!("[SESSION] index tables not built yet, walking the queue");
            }
            process_send_legacy(&mut tx, now, topo, self.cfg.pd.port, &self.stats)
        };
        let pending: Vec<_> = tx.pending_release.drain(..).collect();
        drop(tx);
        self.release_pending(pending);
        result
    }

    /// One receive pass plus timeout supervision. `wait` bounds the poll;
    /// `None` sweeps without blocking.
    pub fn process_receive(&self, wait: Option<Duration>) -> Result<()> {
        let topo = self.current_topo();
        let mut rx = self.rx.lock();
        let payload_fn = || stats_wire::encode(&self.statistics_lockfree());
        let ctx = RxContext {
            own_ip: self.own_ip,
            session_topo: topo,
            port: self.cfg.pd.port,
            stats: &self.stats,
            tx: &self.tx,
            stats_payload: &payload_fn,
        };
        let result = receive_pass(&mut rx, &ctx, wait);
        timeout::handle_timeouts(&mut rx, Instant::now(), &self.stats);
        result
    }

    /// Single-threaded convenience: send, then receive, then supervise.
    pub fn process(&self) -> Result<()> {
        let mut result = self.process_send();
        if let Err(e) = self.process_receive(None) {
            result = Err(e);
        }
        result
    }

    /// Recommended wait before the next `process` call.
    pub fn get_interval(&self) -> Duration {
        let geom = self.cfg.cycle_base.geometry();
        if self.cfg.indexed_scheduling {
            return Duration::from_micros(u64::from(self.cfg.process_cycle));
        }
        // Longest wait still guaranteeing a timely timeout report.
        let max_wait = Duration::from_micros(u64::from(geom.high_limit / 1000));
        let now = Instant::now();
        let tx_due = self.tx.lock().next_due(now);
        let rx_due = self.rx.lock().next_timeout();
        let earliest = match (tx_due, rx_due) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match earliest {
            Some(t) => t.saturating_duration_since(now).min(max_wait),
            None => max_wait,
        }
    }

    /// (Re)build the indexed scheduler tables from the current queues.
    /// Call after the publish/subscribe population settled, and again
    /// after any later change to it.
    pub fn update_session(&self) -> Result<()> {
        if !self.cfg.indexed_scheduling {
            return Ok(());
        }
        let geom = self.cfg.cycle_base.geometry();
        let mut tx = self.tx.lock();
        let preset = tx.preset;
        let tables = IndexTables::build(geom, self.cfg.process_cycle, &tx.pubs, preset)?;
        tx.index = Some(tables);
        drop(tx);
        let mut rx = self.rx.lock();
        let rcv_tables = RcvTables::build(&rx.subs);
        rx.rcv_index = Some(rcv_tables);
        Ok(())
    }

    /// Size hints for the next `update_session` table build.
    pub fn preset_index_session(&self, preset: IndexPreset) {
        self.tx.lock().preset = preset;
    }

    // ===== Statistics =====

    /// Snapshot without touching any session lock (used from within the
    /// receive path when a statistics pull arrives).
    fn statistics_lockfree(&self) -> GlobalStatistics {
        GlobalStatistics {
            version: ENGINE_VERSION,
            uptime_s: self.opened_at.elapsed().as_secs() as u32,
            host_name: self.cfg.host_name.clone(),
            own_ip: self.own_ip,
            process_cycle_us: self.cfg.process_cycle,
            num_joined_mc: self.num_joined.load(Ordering::Relaxed),
            num_publishers: self.num_pubs.load(Ordering::Relaxed),
            num_subscribers: self.num_subs.load(Ordering::Relaxed),
            pd: self.stats.snapshot(),
        }
    }

    pub fn statistics(&self) -> GlobalStatistics {
        self.statistics_lockfree()
    }

    pub fn publisher_statistics(&self) -> Vec<PubStatistics> {
        let tx = self.tx.lock();
        tx.pubs
            .iter()
            .map(|(_, p)| PubStatistics {
                com_id: p.addr.com_id,
                dest_ip: p.addr.dest_ip,
                cycle: p.interval,
                red_id: p.red_id,
                num_send: p.num_sent,
            })
            .collect()
    }

    pub fn subscriber_statistics(&self) -> Vec<SubStatistics> {
        let rx = self.rx.lock();
        rx.subs
            .iter()
            .map(|(_, s)| SubStatistics {
                com_id: s.addr.com_id,
                joined_addr: s.mc_group.unwrap_or(Ipv4Addr::UNSPECIFIED),
                filter_lo: s.addr.src_lo,
                filter_hi: s.addr.src_hi,
                timeout: s.interval,
                behavior: s.to_behavior,
                num_recv: s.num_recv,
                num_missed: s.num_missed,
                status: s.last_status,
            })
            .collect()
    }

    pub fn redundancy_statistics(&self) -> Vec<RedundancyStatistics> {
        let tx = self.tx.lock();
        let mut groups: Vec<RedundancyStatistics> = Vec::new();
        for (_, p) in tx.pubs.iter() {
            if p.red_id == 0 {
                continue;
            }
            match groups.iter_mut().find(|g| g.red_id == p.red_id) {
                Some(g) => g.num_publications += 1,
                None => groups.push(RedundancyStatistics {
                    red_id: p.red_id,
                    leader: !p.follower,
                    num_publications: 1,
                }),
            }
        }
        groups.sort_by_key(|g| g.red_id);
        groups
    }

    pub fn joined_multicast_groups(&self) -> Vec<Ipv4Addr> {
        self.shared.lock().pool.joined_groups()
    }

    // ===== Internals =====

    fn marshalled(&self, com_id: u32, data: &[u8], marshall: bool) -> Result<Vec<u8>> {
        if marshall {
            if let Some(m) = &self.cfg.pd.marshaller {
                let mut out = Vec::new();
                m.marshal(com_id, data, &mut out)?;
                return Ok(out);
            }
        }
        Ok(data.to_vec())
    }

    fn release_pending(&self, pending: Vec<(usize, Option<Ipv4Addr>)>) {
        if pending.is_empty() {
            return;
        }
        let mut shared = self.shared.lock();
        for (idx, mc) in pending {
            shared.pool.release(idx, mc);
        }
    }
}
