// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Redundancy leader/follower control.
//!
//! Publications sharing a redundancy group across sessions are mutually
//! exclusive on the wire: followers keep their timers and sequence state
//! warm but never transmit. Every leader assertion resets the push stream
//! so the first frame after it carries sequence counter 0, which receivers
//! observe as a restart.

use crate::engine::scheduler::TxState;
use crate::error::{Error, Result};

/// Set the leader/follower role for `group` (0 addresses every redundant
/// publication in the session).
pub(crate) fn set_redundant(tx: &mut TxState, group: u32, leader: bool) -> Result<()> {
    let mut matched = false;
    for (_, p) in tx.pubs.iter_mut() {
        if p.red_id == 0 {
            continue;
        }
        if group != 0 && p.red_id != group {
            continue;
        }
        matched = true;
        p.follower = !leader;
        if leader {
            // Restart the push stream on the wire, switchover or not.
            p.push_seq = None;
            log::info!(
                "[RED] comId {} leading group {}, push stream restarted",
                p.addr.com_id,
                p.red_id
            );
        }
    }

    if !matched && group != 0 {
        return Err(Error::Param("unknown redundancy group"));
    }
    Ok(())
}

/// Leader flag of the first publication in `group`.
pub(crate) fn get_redundant(tx: &TxState, group: u32) -> Result<bool> {
    tx.pubs
        .iter()
        .find(|(_, p)| p.red_id == group && group != 0)
        .map(|(_, p)| !p.follower)
        .ok_or(Error::Param("unknown redundancy group"))
}
