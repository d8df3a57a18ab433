// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-subscription sequence-counter deduplication.
//!
//! One subscription may legitimately receive the same comId from several
//! sources (multicast, redundant senders); each (source, message type)
//! stream is tracked separately.

use std::net::Ipv4Addr;

use crate::config::MAX_SEQ_SOURCES_PER_SUBSCRIPTION;
use crate::error::{Error, Result};
use crate::protocol::MsgType;

#[derive(Debug, Clone, Copy)]
struct SeqEntry {
    src: Ipv4Addr,
    msg_type: MsgType,
    last_seq: u32,
}

/// Outcome of a sequence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// Counter advanced; `missed` counts the gap to the previous one.
    Accept { missed: u32 },
    /// Counter did not advance: duplicate or reordered-old, drop silently.
    Duplicate,
}

/// Growable list of (source, msgType, lastSeq) tuples.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    entries: Vec<SeqEntry>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, src: Ipv4Addr, msg_type: MsgType) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.src == src && e.msg_type == msg_type)
    }

    /// Forget the stream state for one source, forcing the next packet to
    /// be taken as a restart.
    pub fn reset_source(&mut self, src: Ipv4Addr, msg_type: MsgType) {
        if let Some(i) = self.position(src, msg_type) {
            self.entries.swap_remove(i);
        }
    }

    /// Forget all stream state (topography change, resubscribe).
    pub fn reset_all(&mut self) {
        self.entries.clear();
    }

    /// Apply the acceptance rule for one received counter.
    ///
    /// `restart` forces a reset of the stream first (caller passes it for
    /// seq==0 and for subscriptions recovering from a timeout). A source
    /// seen for the first time is always accepted.
    pub fn check(
        &mut self,
        src: Ipv4Addr,
        msg_type: MsgType,
        seq: u32,
        restart: bool,
    ) -> Result<SeqCheck> {
        if restart {
            self.reset_source(src, msg_type);
        }
        match self.position(src, msg_type) {
            Some(i) => {
                let last = self.entries[i].last_seq;
                if seq <= last {
                    Ok(SeqCheck::Duplicate)
                } else {
                    self.entries[i].last_seq = seq;
                    Ok(SeqCheck::Accept {
                        missed: seq - last - 1,
                    })
                }
            }
            None => {
                if self.entries.len() >= MAX_SEQ_SOURCES_PER_SUBSCRIPTION {
                    return Err(Error::Mem("sequence tracker source list full"));
                }
                self.entries.push(SeqEntry {
                    src,
                    msg_type,
                    last_seq: seq,
                });
                Ok(SeqCheck::Accept { missed: 0 })
            }
        }
    }

    pub fn sources(&self) -> usize {
        self.entries.len()
    }
}
