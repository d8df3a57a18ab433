// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timeout supervision for subscriptions.
//!
//! A subscription transitions into the timed-out state once; repeated
//! lateness is suppressed until a valid reception clears the flag (which
//! also resets its sequence tracker on the next packet). The statistics
//! pull subscription never bothers the user with timeouts.

use std::time::Instant;

use crate::config::STATISTICS_PULL_COMID;
use crate::engine::receive::RxState;
use crate::engine::{PdInfo, PdStatus};
use crate::session::stats::SessionStats;

/// Sweep the subscriptions and fire the timeout transition callbacks.
///
/// With the receive-side index built, the sweep walks the interval-sorted
/// table and stops at the first subscription that is not yet late.
pub(crate) fn handle_timeouts(rx: &mut RxState, now: Instant, stats: &SessionStats) {
    let (handles, indexed) = match &rx.rcv_index {
        Some(tables) => (tables.timeout_order().to_vec(), true),
        None => (rx.order.clone(), false),
    };

    for handle in handles {
        let Some(sub) = rx.subs.get_mut(handle) else {
            continue;
        };
        if !sub.is_late(now) {
            if indexed {
                // Interval-sorted: everything after this is later still.
                break;
            }
            continue;
        }
        if sub.timed_out || sub.addr.com_id == STATISTICS_PULL_COMID {
            continue;
        }

        SessionStats::bump(&stats.num_timeout);
        sub.last_status = PdStatus::Timeout;
        sub.timed_out = true;
        log::debug!(
            "[TIMEOUT] comId {} late (interval {:?})",
            sub.addr.com_id,
            sub.interval
        );

        if let Some(cb) = sub.callback.clone() {
            let mut info = PdInfo::empty(sub.addr.com_id);
            info.status = PdStatus::Timeout;
            info.src_ip = sub.last_src.unwrap_or(sub.addr.src_lo);
            info.dest_ip = sub.last_dest;
            info.service_id = sub.addr.service_id;
            let payload: Vec<u8> = match &sub.frame {
                Some(frame) => {
                    info.msg_type = frame.msg_type().unwrap_or(info.msg_type);
                    info.seq_count = frame.seq();
                    info.topo = frame.topo();
                    info.proto_version = frame.proto_version();
                    frame.payload().to_vec()
                }
                None => Vec::new(),
            };
            cb(&info, &payload);
        }
    }
}
