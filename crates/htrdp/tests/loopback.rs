// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end loopback tests: frames really cross a UDP socket.
//!
//! One session publishes to its own PD port on 127.0.0.1 and subscribes to
//! the same comIds, exercising the full send scheduler, wire codec, socket
//! pool and receive pipeline. Timing assertions use generous margins so
//! loaded CI machines do not flake.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use htrdp::protocol::frame::FrameBuf;
use htrdp::protocol::stats as stats_wire;
use htrdp::{
    MsgType, PdStatus, PublishRequest, PullRequest, SessionConfig, SessionManager,
    SubscribeRequest, TimeoutBehavior, TopoCounts,
};

fn session_on(port: u16) -> (SessionManager, Arc<htrdp::Session>) {
    let mut cfg = SessionConfig {
        own_ip: Ipv4Addr::LOCALHOST,
        host_name: "loopback-test".to_string(),
        ..SessionConfig::default()
    };
    cfg.pd.port = port;
    let mgr = SessionManager::new();
    let session = mgr.open_session(cfg).expect("open session");
    (mgr, session)
}

/// Pump send+receive until `done` or the deadline passes.
fn pump(session: &htrdp::Session, millis: u64, mut done: impl FnMut() -> bool) {
    for _ in 0..millis / 5 {
        let _ = session.process();
        if done() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_put_schedule_receive_get_roundtrip() {
    let (mgr, s) = session_on(27330);
    let received = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&received);

    let sub = s
        .subscribe(SubscribeRequest {
            com_id: 10001,
            callback: Some(Arc::new(move |info, _data| {
                if info.status == PdStatus::Ok {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })),
            ..SubscribeRequest::default()
        })
        .expect("subscribe");

    let payload = [0xAA_u8; 40];
    s.publish(PublishRequest {
        com_id: 10001,
        dest_ip: Ipv4Addr::LOCALHOST,
        interval: Duration::from_millis(50),
        data: Some(payload.to_vec()),
        ..PublishRequest::default()
    })
    .expect("publish");

    pump(&s, 2000, || received.load(Ordering::Relaxed) > 0);
    assert!(received.load(Ordering::Relaxed) > 0, "no frame received");

    let mut buf = [0u8; 1432];
    let (n, info) = s.get(sub, &mut buf).expect("staged data");
    assert_eq!(n, 40);
    assert_eq!(&buf[..n], &payload[..]);
    assert_eq!(info.msg_type, MsgType::Pd);
    assert_eq!(info.status, PdStatus::Ok);
    assert_eq!(info.src_ip, Ipv4Addr::LOCALHOST);

    let stats = s.statistics();
    assert!(stats.pd.num_send >= 1);
    assert!(stats.pd.num_rcv >= 1);
    mgr.close_session(&s);
}

#[test]
fn test_cyclic_sequence_counters_contiguous() {
    let (mgr, s) = session_on(27331);
    let seqs: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seqs);

    s.subscribe(SubscribeRequest {
        com_id: 10010,
        flags: htrdp::PdFlags {
            callback: true,
            force_cb: true,
            ..htrdp::PdFlags::default()
        },
        callback: Some(Arc::new(move |info, _data| {
            if info.status == PdStatus::Ok {
                sink.lock().expect("not poisoned").push(info.seq_count);
            }
        })),
        ..SubscribeRequest::default()
    })
    .expect("subscribe");

    s.publish(PublishRequest {
        com_id: 10010,
        dest_ip: Ipv4Addr::LOCALHOST,
        interval: Duration::from_millis(20),
        data: Some(vec![1, 2, 3, 4]),
        ..PublishRequest::default()
    })
    .expect("publish");

    pump(&s, 2000, || seqs.lock().expect("not poisoned").len() >= 4);

    let observed = seqs.lock().expect("not poisoned").clone();
    assert!(observed.len() >= 4, "too few receptions: {:?}", observed);
    for (i, &seq) in observed.iter().enumerate() {
        assert_eq!(seq, i as u32, "sequence counters must be contiguous");
    }
    mgr.close_session(&s);
}

#[test]
fn test_timeout_fires_and_get_zeroes() {
    let (mgr, s) = session_on(27332);
    let timeouts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&timeouts);

    let sub = s
        .subscribe(SubscribeRequest {
            com_id: 10020,
            timeout: Some(Duration::from_millis(150)),
            to_behavior: TimeoutBehavior::SetToZero,
            callback: Some(Arc::new(move |info, _data| {
                if info.status == PdStatus::Timeout {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })),
            ..SubscribeRequest::default()
        })
        .expect("subscribe");

    let publisher = s
        .publish(PublishRequest {
            com_id: 10020,
            dest_ip: Ipv4Addr::LOCALHOST,
            interval: Duration::from_millis(30),
            data: Some(vec![0x55; 8]),
            ..PublishRequest::default()
        })
        .expect("publish");

    // Let a few frames through, then silence the publisher.
    pump(&s, 1000, || {
        s.statistics().pd.num_rcv >= 2
    });
    assert!(s.statistics().pd.num_rcv >= 2, "publisher never heard");
    s.unpublish(publisher).expect("unpublish");

    // Drive only the receive side past the timeout.
    pump(&s, 1500, || timeouts.load(Ordering::Relaxed) > 0);
    let after_transition = timeouts.load(Ordering::Relaxed);
    assert!(after_transition >= 1, "timeout callback never fired");

    // Staying late does not re-fire the callback.
    pump(&s, 400, || false);
    assert_eq!(
        timeouts.load(Ordering::Relaxed),
        after_transition,
        "repeated timeouts must be suppressed"
    );

    let mut buf = [0xFF_u8; 16];
    let (n, info) = s.get(sub, &mut buf).expect("stale entry readable");
    assert_eq!(info.status, PdStatus::Timeout);
    assert_eq!(n, 8);
    assert!(buf[..n].iter().all(|&b| b == 0), "SetToZero must zero");
    mgr.close_session(&s);
}

#[test]
fn test_pull_request_roundtrip() {
    let (mgr, s) = session_on(27333);
    let replies: Arc<Mutex<Vec<(MsgType, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);

    s.subscribe(SubscribeRequest {
        com_id: 20001,
        flags: htrdp::PdFlags {
            callback: true,
            force_cb: true,
            ..htrdp::PdFlags::default()
        },
        callback: Some(Arc::new(move |info, data| {
            sink.lock()
                .expect("not poisoned")
                .push((info.msg_type, data.to_vec()));
        })),
        ..SubscribeRequest::default()
    })
    .expect("subscribe");

    // Pull-only publication: never sent until requested.
    s.publish(PublishRequest {
        com_id: 20001,
        data: Some(b"pulled payload".to_vec()),
        ..PublishRequest::default()
    })
    .expect("publish");

    pump(&s, 300, || false);
    assert_eq!(
        s.statistics().pd.num_send,
        0,
        "pull-only telegram must stay quiet"
    );

    s.request(PullRequest {
        com_id: 20001,
        dest_ip: Ipv4Addr::LOCALHOST,
        reply_com_id: 20001,
        reply_ip: Ipv4Addr::LOCALHOST,
        sub: None,
    })
    .expect("request");

    pump(&s, 2000, || {
        replies
            .lock()
            .expect("not poisoned")
            .iter()
            .any(|(mt, _)| *mt == MsgType::Pp)
    });

    let seen = replies.lock().expect("not poisoned").clone();
    let reply = seen.iter().find(|(mt, _)| *mt == MsgType::Pp);
    let (_, data) = reply.expect("pulled reply must arrive");
    assert_eq!(data.as_slice(), b"pulled payload");
    mgr.close_session(&s);
}

#[test]
fn test_statistics_pull_returns_snapshot() {
    let (mgr, s) = session_on(27334);
    let snapshots: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);

    // Listen for the comId-35 reply the engine produces.
    s.subscribe(SubscribeRequest {
        com_id: 35,
        flags: htrdp::PdFlags {
            callback: true,
            force_cb: true,
            ..htrdp::PdFlags::default()
        },
        callback: Some(Arc::new(move |info, data| {
            if info.msg_type == MsgType::Pp {
                sink.lock().expect("not poisoned").push(data.to_vec());
            }
        })),
        ..SubscribeRequest::default()
    })
    .expect("subscribe");

    // Ask ourselves for statistics (comId 31 pull request).
    s.request(PullRequest {
        com_id: 31,
        dest_ip: Ipv4Addr::LOCALHOST,
        reply_com_id: 0,
        reply_ip: Ipv4Addr::UNSPECIFIED,
        sub: None,
    })
    .expect("request");

    pump(&s, 2000, || !snapshots.lock().expect("not poisoned").is_empty());

    let seen = snapshots.lock().expect("not poisoned").clone();
    let image = seen.first().expect("statistics reply must arrive");
    let decoded = stats_wire::decode(image).expect("valid statistics image");
    assert_eq!(decoded.own_ip, Ipv4Addr::LOCALHOST);
    assert_eq!(decoded.host_name, "loopback-test");
    assert!(decoded.num_publishers >= 1);
    assert!(decoded.num_subscribers >= 1);
    mgr.close_session(&s);
}

#[test]
fn test_stale_topo_frame_dropped() {
    let (mgr, s) = session_on(27335);
    s.set_etb_topo_count(100);

    let received = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&received);
    s.subscribe(SubscribeRequest {
        com_id: 10030,
        callback: Some(Arc::new(move |info, _data| {
            if info.status == PdStatus::Ok {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        })),
        ..SubscribeRequest::default()
    })
    .expect("subscribe");

    // Craft a frame from a peer on a stale topography (ETB 101).
    let stale = {
        let mut f = FrameBuf::v1(10030, 0, TopoCounts::new(101, 0), 4);
        f.set_payload(&[9, 9, 9, 9]).expect("payload fits");
        f.prepare_send(MsgType::Pd, TopoCounts::new(101, 0), 0);
        f
    };
    let raw = UdpSocket::bind("127.0.0.1:0").expect("bind");
    raw.send_to(stale.as_bytes(), "127.0.0.1:27335")
        .expect("send");

    pump(&s, 300, || false);
    assert_eq!(received.load(Ordering::Relaxed), 0, "no callback");
    assert!(s.statistics().pd.num_topo_err >= 1);

    // A frame on the current topography passes.
    let fresh = {
        let mut f = FrameBuf::v1(10030, 0, TopoCounts::new(100, 0), 4);
        f.set_payload(&[1, 1, 1, 1]).expect("payload fits");
        f.prepare_send(MsgType::Pd, TopoCounts::new(100, 0), 0);
        f
    };
    raw.send_to(fresh.as_bytes(), "127.0.0.1:27335")
        .expect("send");
    pump(&s, 2000, || received.load(Ordering::Relaxed) > 0);
    assert_eq!(received.load(Ordering::Relaxed), 1);
    mgr.close_session(&s);
}

#[test]
fn test_indexed_scheduler_transmits_all() {
    let mut cfg = SessionConfig {
        own_ip: Ipv4Addr::LOCALHOST,
        indexed_scheduling: true,
        process_cycle: 5_000,
        ..SessionConfig::default()
    };
    cfg.pd.port = 27336;
    let mgr = SessionManager::new();
    let s = mgr.open_session(cfg).expect("open");

    for i in 0..30_u32 {
        s.publish(PublishRequest {
            com_id: 50_000 + i,
            dest_ip: Ipv4Addr::LOCALHOST,
            interval: Duration::from_millis(10 + u64::from(i)),
            data: Some(i.to_be_bytes().to_vec()),
            ..PublishRequest::default()
        })
        .expect("publish");
    }
    s.update_session().expect("tables build");

    for _ in 0..60 {
        s.process_send().expect("indexed pass");
        std::thread::sleep(Duration::from_millis(5));
    }

    for p in s.publisher_statistics() {
        if p.com_id >= 50_000 {
            assert!(
                p.num_send > 0,
                "comId {} never scheduled by the index",
                p.com_id
            );
        }
    }
    mgr.close_session(&s);
}
