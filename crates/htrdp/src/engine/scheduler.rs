// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transmit side: the publish queue and the list-walking send pass.
//!
//! `send_element` is the single-telegram transmit path used by the legacy
//! pass, the indexed dispatcher and the immediate pull-reply trigger. A
//! failing telegram never aborts a pass; the last error is reported after
//! every due publication had its turn.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use crate::core::{Arena, PubHandle, PubKind, Publication};
use crate::engine::index::{IndexPreset, IndexTables};
use crate::engine::{PdInfo, PdStatus};
use crate::error::{Error, Result};
use crate::protocol::{valid_topo_counts, MsgType, TopoCounts};
use crate::session::stats::SessionStats;

/// Transmit-side state, guarded by the tx lock.
pub struct TxState {
    pub pubs: Arena<Publication, PubKind>,
    /// Send-pass walk order; PR one-shots are queued at the front.
    pub order: Vec<PubHandle>,
    /// Indexed-scheduler tables, built by `update_session` when enabled.
    pub index: Option<IndexTables>,
    /// Table sizing hints, set via `preset_index_session`.
    pub preset: IndexPreset,
    /// Socket references to drop once the session lock is available
    /// (released socket cleanup must not be done under tx).
    pub pending_release: Vec<(usize, Option<Ipv4Addr>)>,
}

impl TxState {
    pub fn new() -> Self {
        Self {
            pubs: Arena::new(),
            order: Vec::new(),
            index: None,
            preset: IndexPreset::default(),
            pending_release: Vec::new(),
        }
    }

    /// Earliest instant any publication becomes due, `None` if nothing is
    /// scheduled. A pending one-shot makes the queue due immediately.
    pub fn next_due(&self, now: Instant) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        for (_, p) in self.pubs.iter() {
            if p.req_to_send {
                return Some(now);
            }
            if let Some(due) = p.next_due {
                earliest = Some(earliest.map_or(due, |e| e.min(due)));
            }
        }
        earliest
    }
}

impl Default for TxState {
    fn default() -> Self {
        Self::new()
    }
}

fn pd_info_for_pub(p: &Publication, mt: MsgType, seq: u32) -> PdInfo {
    PdInfo {
        com_id: p.addr.com_id,
        src_ip: p.addr.src_ip,
        dest_ip: p.addr.dest_ip,
        topo: p.frame.topo(),
        msg_type: mt,
        seq_count: seq,
        proto_version: p.frame.proto_version(),
        reply_com_id: p.frame.reply_com_id(),
        reply_ip: p.frame.reply_ip(),
        service_id: p.addr.service_id,
        status: PdStatus::Ok,
    }
}

/// Transmit one publication now.
///
/// Handles the pulled-reply message-type swap, topography validation,
/// redundancy-follower suppression, timer re-arming and the one-shot
/// removal of PR elements. `rearm` is false when the indexed dispatcher
/// drives the timing.
pub(crate) fn send_element(
    tx: &mut TxState,
    handle: PubHandle,
    session_topo: TopoCounts,
    port: u16,
    stats: &SessionStats,
    rearm: bool,
    now: Instant,
) -> Result<()> {
    let mut remove_after = false;
    let mut result = Ok(());

    {
        let Some(p) = tx.pubs.get_mut(handle) else {
            return Err(Error::NoPub);
        };

        if !p.invalid_data {
            let cur_mt = p.frame.msg_type().unwrap_or(MsgType::Pd);
            // A push telegram with a pending request goes out as a pulled
            // reply; the type is restored right after the send.
            let pull_swap = p.req_to_send && cur_mt == MsgType::Pd;
            let eff_mt = if pull_swap { MsgType::Pp } else { cur_mt };

            let seq = p.next_seq(eff_mt);
            let frame_topo = p.frame.topo();
            p.frame.prepare_send(eff_mt, frame_topo, seq);

            if !valid_topo_counts(session_topo, frame_topo) {
                log::info!(
                    "[PD] comId {} not sent: topography counters out of date",
                    p.addr.com_id
                );
                SessionStats::bump(&stats.num_topo_err);
                result = Err(Error::Topo);
            } else if p.sock.is_none() {
                log::error!("[PD] comId {} has no socket, skipping", p.addr.com_id);
            } else if !p.follower {
                if let Some(cb) = p.pre_send.clone() {
                    let info = pd_info_for_pub(p, eff_mt, seq);
                    cb(&info, p.frame.payload());
                }
                let dest = if p.req_to_send && !p.pull_ip.is_unspecified() {
                    p.pull_ip
                } else {
                    p.addr.dest_ip
                };
                let target = SocketAddrV4::new(dest, port);
                let sock = p.sock.as_ref().map(std::sync::Arc::clone);
                match sock
                    .ok_or(Error::Init)
                    .and_then(|s| s.send_to(p.frame.as_bytes(), target).map_err(Error::from))
                {
                    Ok(_) => {
                        SessionStats::bump(&stats.num_send);
                        p.num_sent = p.num_sent.wrapping_add(1);
                    }
                    Err(e) => {
                        log::warn!("[PD] send comId {} to {} failed: {}", p.addr.com_id, target, e);
                        result = Err(e);
                    }
                }
            }

            if pull_swap {
                // Restore the cyclic type; the reply did not consume the
                // telegram's timer slot.
                p.frame.set_msg_type(MsgType::Pd);
            } else if rearm {
                p.rearm(now);
            }

            if p.req_to_send {
                p.req_to_send = false;
                p.pull_ip = Ipv4Addr::UNSPECIFIED;
            }

            if p.frame.msg_type() == Some(MsgType::Pr) {
                remove_after = true;
            }
        }
    }

    // PR elements are one-shot: unlink and schedule the socket release.
    if remove_after {
        if let Some(p) = tx.pubs.remove(handle) {
            tx.order.retain(|h| *h != handle);
            if let Some(idx) = p.sock_idx {
                tx.pending_release.push((idx, None));
            }
            log::debug!("[PD] pull request comId {} sent and removed", p.addr.com_id);
        }
    }

    result
}

/// One legacy send pass: walk the queue, transmit everything due.
pub(crate) fn process_send_legacy(
    tx: &mut TxState,
    now: Instant,
    session_topo: TopoCounts,
    port: u16,
    stats: &SessionStats,
) -> Result<()> {
    let mut result = Ok(());
    for handle in tx.order.clone() {
        let due = tx.pubs.get(handle).is_some_and(|p| p.is_due(now));
        if due {
            if let Err(e) = send_element(tx, handle, session_topo, port, stats, true, now) {
                result = Err(e);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PdFlags, PubAddress};
    use crate::protocol::FrameBuf;
    use std::net::UdpSocket;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_pub(com_id: u32, dest: Ipv4Addr, interval_ms: u64, sock: Arc<UdpSocket>) -> Publication {
        let mut frame = FrameBuf::v1(com_id, 0, TopoCounts::ZERO, 4);
        frame.set_payload(&[1, 2, 3, 4]).expect("payload fits");
        Publication {
            addr: PubAddress {
                src_ip: Ipv4Addr::LOCALHOST,
                dest_ip: dest,
                com_id,
                service_id: 0,
            },
            interval: Duration::from_millis(interval_ms),
            next_due: Some(Instant::now()),
            red_id: 0,
            push_seq: None,
            pull_seq: None,
            frame,
            sock_idx: Some(0),
            sock: Some(sock),
            pull_ip: Ipv4Addr::UNSPECIFIED,
            flags: PdFlags::default(),
            invalid_data: false,
            follower: false,
            req_to_send: false,
            pre_send: None,
            num_sent: 0,
        }
    }

    fn harness() -> (TxState, Arc<UdpSocket>, UdpSocket, u16) {
        let rx = UdpSocket::bind("127.0.0.1:0").expect("bind rx");
        rx.set_nonblocking(true).expect("nonblocking");
        let port = rx.local_addr().expect("addr").port();
        let tx_sock = Arc::new(UdpSocket::bind("127.0.0.1:0").expect("bind tx"));
        (TxState::new(), tx_sock, rx, port)
    }

    #[test]
    fn test_due_publication_is_sent_with_seq_zero() {
        let (mut tx, sock, rx, port) = harness();
        let h = tx.pubs.insert(test_pub(10001, Ipv4Addr::LOCALHOST, 100, sock));
        tx.order.push(h);

        let stats = SessionStats::default();
        process_send_legacy(&mut tx, Instant::now(), TopoCounts::ZERO, port, &stats)
            .expect("send pass");

        let mut buf = [0u8; 1500];
        let n = rx.recv(&mut buf).expect("frame arrives");
        let frame = FrameBuf::from_wire(buf[..n].to_vec()).expect("valid frame");
        assert_eq!(frame.com_id(), 10001);
        assert_eq!(frame.seq(), 0);
        assert_eq!(frame.msg_type(), Some(MsgType::Pd));
        assert_eq!(stats.snapshot().num_send, 1);
    }

    #[test]
    fn test_not_due_not_sent() {
        let (mut tx, sock, rx, port) = harness();
        let mut p = test_pub(10001, Ipv4Addr::LOCALHOST, 100, sock);
        p.next_due = Some(Instant::now() + Duration::from_secs(5));
        let h = tx.pubs.insert(p);
        tx.order.push(h);

        let stats = SessionStats::default();
        process_send_legacy(&mut tx, Instant::now(), TopoCounts::ZERO, port, &stats)
            .expect("send pass");
        let mut buf = [0u8; 1500];
        assert!(rx.recv(&mut buf).is_err(), "nothing on the wire");
    }

    #[test]
    fn test_invalid_data_skipped() {
        let (mut tx, sock, rx, port) = harness();
        let mut p = test_pub(10001, Ipv4Addr::LOCALHOST, 100, sock);
        p.invalid_data = true;
        let h = tx.pubs.insert(p);
        tx.order.push(h);

        let stats = SessionStats::default();
        process_send_legacy(&mut tx, Instant::now(), TopoCounts::ZERO, port, &stats)
            .expect("send pass");
        let mut buf = [0u8; 1500];
        assert!(rx.recv(&mut buf).is_err());
        assert_eq!(stats.snapshot().num_send, 0);
    }

    #[test]
    fn test_follower_advances_seq_but_stays_silent() {
        let (mut tx, sock, rx, port) = harness();
        let mut p = test_pub(30001, Ipv4Addr::LOCALHOST, 100, sock);
        p.red_id = 7;
        p.follower = true;
        let h = tx.pubs.insert(p);
        tx.order.push(h);

        let stats = SessionStats::default();
        process_send_legacy(&mut tx, Instant::now(), TopoCounts::ZERO, port, &stats)
            .expect("send pass");

        let mut buf = [0u8; 1500];
        assert!(rx.recv(&mut buf).is_err(), "follower must not transmit");
        assert_eq!(stats.snapshot().num_send, 0);
        // Virtual time still advanced.
        assert_eq!(tx.pubs.get(h).expect("pub").push_seq, Some(0));
    }

    #[test]
    fn test_topo_mismatch_blocks_send() {
        let (mut tx, sock, rx, port) = harness();
        let mut frame_pub = test_pub(10001, Ipv4Addr::LOCALHOST, 100, sock);
        frame_pub.frame.set_topo(TopoCounts::new(100, 0));
        let h = tx.pubs.insert(frame_pub);
        tx.order.push(h);

        let stats = SessionStats::default();
        let err = process_send_legacy(
            &mut tx,
            Instant::now(),
            TopoCounts::new(101, 0),
            port,
            &stats,
        );
        assert!(matches!(err, Err(Error::Topo)));
        let mut buf = [0u8; 1500];
        assert!(rx.recv(&mut buf).is_err());
        assert_eq!(stats.snapshot().num_topo_err, 1);
    }

    #[test]
    fn test_pull_reply_swaps_to_pp_and_back() {
        let (mut tx, sock, rx, port) = harness();
        let mut p = test_pub(20001, Ipv4Addr::LOCALHOST, 0, sock);
        p.next_due = None;
        p.req_to_send = true;
        p.pull_ip = Ipv4Addr::LOCALHOST;
        let h = tx.pubs.insert(p);
        tx.order.push(h);

        let stats = SessionStats::default();
        process_send_legacy(&mut tx, Instant::now(), TopoCounts::ZERO, port, &stats)
            .expect("send pass");

        let mut buf = [0u8; 1500];
        let n = rx.recv(&mut buf).expect("reply arrives");
        let frame = FrameBuf::from_wire(buf[..n].to_vec()).expect("valid frame");
        assert_eq!(frame.msg_type(), Some(MsgType::Pp), "reply goes out as Pp");

        let p = tx.pubs.get(h).expect("pub still queued");
        assert_eq!(p.frame.msg_type(), Some(MsgType::Pd), "type restored");
        assert!(!p.req_to_send);
        assert!(p.pull_ip.is_unspecified());
        assert_eq!(p.pull_seq, Some(0));
        assert_eq!(p.push_seq, None, "push stream untouched");
    }

    #[test]
    fn test_pr_element_is_one_shot() {
        let (mut tx, sock, rx, port) = harness();
        let mut p = test_pub(20001, Ipv4Addr::LOCALHOST, 0, sock);
        p.next_due = None;
        p.frame.set_msg_type(MsgType::Pr);
        p.frame.set_reply_com_id(20001);
        p.req_to_send = true;
        let h = tx.pubs.insert(p);
        tx.order.insert(0, h);

        let stats = SessionStats::default();
        process_send_legacy(&mut tx, Instant::now(), TopoCounts::ZERO, port, &stats)
            .expect("send pass");

        let mut buf = [0u8; 1500];
        let n = rx.recv(&mut buf).expect("request arrives");
        let frame = FrameBuf::from_wire(buf[..n].to_vec()).expect("valid frame");
        assert_eq!(frame.msg_type(), Some(MsgType::Pr));

        assert!(tx.pubs.get(h).is_none(), "PR removed after emission");
        assert!(tx.order.is_empty());
        assert_eq!(tx.pending_release, vec![(0, None)]);
    }

    #[test]
    fn test_failing_telegram_does_not_abort_pass() {
        let (mut tx, sock, rx, port) = harness();
        // First telegram fails topo validation, second one is healthy.
        let mut bad = test_pub(1, Ipv4Addr::LOCALHOST, 100, Arc::clone(&sock));
        bad.frame.set_topo(TopoCounts::new(99, 0));
        let hb = tx.pubs.insert(bad);
        let hg = tx.pubs.insert(test_pub(2, Ipv4Addr::LOCALHOST, 100, sock));
        tx.order.extend([hb, hg]);

        let stats = SessionStats::default();
        let result = process_send_legacy(
            &mut tx,
            Instant::now(),
            TopoCounts::new(100, 0),
            port,
            &stats,
        );
        assert!(matches!(result, Err(Error::Topo)), "last error reported");

        let mut buf = [0u8; 1500];
        let n = rx.recv(&mut buf).expect("healthy telegram still sent");
        let frame = FrameBuf::from_wire(buf[..n].to_vec()).expect("valid frame");
        assert_eq!(frame.com_id(), 2);
    }

    #[test]
    fn test_next_due_earliest_wins() {
        let (mut tx, sock, _rx, _port) = harness();
        let now = Instant::now();
        let mut a = test_pub(1, Ipv4Addr::LOCALHOST, 100, Arc::clone(&sock));
        a.next_due = Some(now + Duration::from_millis(50));
        let mut b = test_pub(2, Ipv4Addr::LOCALHOST, 100, sock);
        b.next_due = Some(now + Duration::from_millis(10));
        tx.pubs.insert(a);
        tx.pubs.insert(b);
        assert_eq!(tx.next_due(now), Some(now + Duration::from_millis(10)));
    }
}
