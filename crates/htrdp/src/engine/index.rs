// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Indexed scheduling for dense telegram populations.
//!
//! Publications are partitioned by interval into three slot tables (low,
//! mid, high) plus a linear list for extreme intervals. Each table is a
//! flat [slots][depth] array of optional handles; dispatch touches exactly
//! one slot row per tier per tick, so a send pass is O(depth) instead of
//! O(publications).
//!
//! Receive-side counterparts: a comId-sorted table for O(log n)
//! subscription lookup and an interval-sorted table for early-exit timeout
//! sweeps.

use std::time::Instant;

use crate::config::{
    CycleGeometry, CLOCK_PERCENT_ERROR_LIMIT, CLOCK_PERCENT_INFO_LIMIT,
    CLOCK_PERCENT_WARNING_LIMIT,
};
use crate::core::{Arena, PubHandle, PubKind, Publication, SubHandle, SubKind, Subscription};
use crate::core::subscription::RxKey;
use crate::engine::scheduler::{send_element, TxState};
use crate::error::{Error, Result};
use crate::protocol::{MsgType, TopoCounts};
use crate::session::stats::SessionStats;

/// Caller-supplied table sizing, set via `preset_index_session`.
#[derive(Debug, Clone, Copy)]
pub struct IndexPreset {
    pub low_depth: u32,
    pub mid_depth: u32,
    pub high_depth: u32,
}

impl Default for IndexPreset {
    fn default() -> Self {
        Self {
            low_depth: 2,
            mid_depth: 2,
            high_depth: 2,
        }
    }
}

/// One transmit tier: a [slots][depth] table of publication references.
pub struct CatTable {
    slot_cycle: u32,
    slots: u32,
    depth: u32,
    cells: Vec<Option<PubHandle>>,
}

impl CatTable {
    fn new(range_us: u32, slot_cycle: u32, needed_cells: u32, preset_depth: u32) -> Self {
        let slots = range_us / slot_cycle;
        // One row of headroom over the raw demand: the backward start-row
        // search cannot always pack rows perfectly.
        let depth = preset_depth.max(needed_cells / slots.max(1) + 2).max(2);
        Self {
            slot_cycle,
            slots,
            depth,
            cells: vec![None; (slots * depth) as usize],
        }
    }

    #[inline]
    fn cell(&self, slot: u32, d: u32) -> Option<PubHandle> {
        self.cells[(slot * self.depth + d) as usize]
    }

    #[inline]
    fn set_cell(&mut self, slot: u32, d: u32, h: PubHandle) {
        self.cells[(slot * self.depth + d) as usize] = Some(h);
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Occupied handles of one slot row. Rows fill depth-compact, so the
    /// first empty cell terminates the row.
    fn row_handles(&self, slot: u32) -> Vec<PubHandle> {
        let mut out = Vec::new();
        for d in 0..self.depth {
            match self.cell(slot, d) {
                Some(h) => out.push(h),
                None => break,
            }
        }
        out
    }

    /// Place one publication `count` times, `stride` rows apart.
    ///
    /// The start row is searched backward from `stride - 1` so the telegram
    /// is never scheduled later than one interval after table start. When a
    /// row's depth is exhausted mid-run the entry shifts to the next row,
    /// which adds up to one slot cycle of jitter.
    fn distribute(&mut self, handle: PubHandle, com_id: u32, interval_us: u32) -> Result<()> {
        if interval_us == 0 || self.slot_cycle == 0 {
            log::error!("[INDEX] cannot distribute a zero-interval telegram");
            return Err(Error::Param("zero interval in index table"));
        }

        let stride = interval_us / self.slot_cycle;
        let mut remaining = self.slots * self.slot_cycle / interval_us;

        if stride == 0 || stride * remaining > self.slots {
            log::error!(
                "[INDEX] comId {}: interval {}us does not fit the {}us slot table",
                com_id,
                interval_us,
                self.slot_cycle
            );
            return Err(Error::Param("interval incompatible with table"));
        }

        let mut start = None;
        'search: for d in 0..self.depth {
            for s in (0..stride).rev() {
                if self.cell(s, d).is_none() {
                    start = Some((s, d));
                    break 'search;
                }
            }
        }
        let Some((start_slot, start_depth)) = start else {
            log::error!("[INDEX] no room for comId {} in index table", com_id);
            return Err(Error::Mem("index table full"));
        };

        let mut slot = start_slot;
        let mut depth_from = start_depth;
        while slot < self.slots && remaining > 0 {
            let mut placed = false;
            for d in depth_from..self.depth {
                if self.cell(slot, d).is_none() {
                    self.set_cell(slot, d, handle);
                    remaining -= 1;
                    depth_from = 0;
                    placed = true;
                    break;
                }
            }
            if placed {
                slot += stride;
            } else {
                slot += 1;
                log::warn!(
                    "[INDEX] depth exceeded: comId {} ({}ms) gets up to {}ms extra jitter",
                    com_id,
                    interval_us / 1000,
                    self.slot_cycle / 1000
                );
            }
        }

        if remaining > 0 {
            log::error!("[INDEX] comId {}: {} entries left unplaced", com_id, remaining);
            return Err(Error::Mem("index table depth exhausted"));
        }
        Ok(())
    }
}

/// Transmit-side index state built by `update_session`.
pub struct IndexTables {
    geom: CycleGeometry,
    process_cycle: u32,
    current_cycle: u32,
    low: CatTable,
    mid: CatTable,
    high: CatTable,
    ext: Vec<PubHandle>,
    cycle_start: Instant,
}

#[derive(PartialEq)]
enum Tier {
    Ignore,
    Low,
    Mid,
    High,
    Ext,
}

fn tier_for(p: &Publication, geom: &CycleGeometry) -> Tier {
    let us = p.interval.as_micros() as u64;
    if us == 0 || p.flags.tsn {
        // Pull-only telegrams are driven by requests, TSN ones by the
        // hardware-timed path.
        return Tier::Ignore;
    }
    if us <= u64::from(geom.low_limit) {
        Tier::Low
    } else if us <= u64::from(geom.mid_limit) {
        Tier::Mid
    } else if us < u64::from(geom.high_limit) {
        Tier::High
    } else {
        Tier::Ext
    }
}

impl IndexTables {
    /// Build the three tier tables from the current publish queue.
    pub fn build(
        geom: CycleGeometry,
        process_cycle: u32,
        pubs: &Arena<Publication, PubKind>,
        preset: IndexPreset,
    ) -> Result<Self> {
        // First pass: cell demand per tier.
        let mut need = [0u32; 3];
        for (_, p) in pubs.iter() {
            let us = p.interval.as_micros() as u32;
            match tier_for(p, &geom) {
                Tier::Low => need[0] += geom.low_limit / us.max(1),
                Tier::Mid => need[1] += geom.mid_limit / us.max(1),
                Tier::High => need[2] += geom.high_limit / us.max(1),
                _ => {}
            }
        }

        let mut tables = Self {
            geom,
            process_cycle,
            current_cycle: 0,
            low: CatTable::new(geom.low_limit, geom.low_cycle, need[0], preset.low_depth),
            mid: CatTable::new(geom.mid_limit, geom.mid_cycle, need[1], preset.mid_depth),
            high: CatTable::new(geom.high_limit, geom.high_cycle, need[2], preset.high_depth),
            ext: Vec::new(),
            cycle_start: Instant::now(),
        };

        for (h, p) in pubs.iter() {
            let us = p.interval.as_micros() as u32;
            match tier_for(p, &geom) {
                Tier::Ignore => {}
                Tier::Low => tables.low.distribute(h, p.addr.com_id, us)?,
                Tier::Mid => tables.mid.distribute(h, p.addr.com_id, us)?,
                Tier::High => tables.high.distribute(h, p.addr.com_id, us)?,
                Tier::Ext => tables.ext.push(h),
            }
        }

        log::info!(
            "[INDEX] tables built: low {}x{}, mid {}x{}, high {}x{}, ext {}",
            tables.low.slots,
            tables.low.depth,
            tables.mid.slots,
            tables.mid.depth,
            tables.high.slots,
            tables.high.depth,
            tables.ext.len()
        );
        Ok(tables)
    }

    #[cfg(test)]
    fn occurrences(&self, tier: &CatTable, h: PubHandle) -> Vec<u32> {
        (0..tier.slots)
            .filter(|&s| tier.row_handles(s).contains(&h))
            .collect()
    }
}

/// One indexed send pass. Assumes it is called once per configured process
/// cycle; a longer period is compensated by looping over the missed slots.
pub(crate) fn process_send_indexed(
    tx: &mut TxState,
    now: Instant,
    session_topo: TopoCounts,
    port: u16,
    stats: &SessionStats,
) -> Result<()> {
    let Some(mut tables) = tx.index.take() else {
        return Err(Error::Block);
    };
    let mut result = Ok(());
    let mut send = |tx: &mut TxState, h: PubHandle, result: &mut Result<()>| {
        if tx.pubs.get(h).is_none() {
            return; // unpublished since the last table build
        }
        if let Err(e) = send_element(tx, h, session_topo, port, stats, false, now) {
            *result = Err(e);
        }
    };

    let ticks = (tables.process_cycle / tables.geom.min_cycle).max(1);
    for _ in 0..ticks {
        let cycle_n = tables.current_cycle;

        // Shortest intervals first.
        let idx_low = (cycle_n / tables.low.slot_cycle) % tables.low.slots;
        for h in tables.low.row_handles(idx_low) {
            send(tx, h, &mut result);
        }

        // Mid-tier work sits in the middle of its slot window so it does
        // not pile onto the low-tier burst at the window start.
        let ratio = tables.geom.mid_cycle / tables.geom.low_cycle;
        if idx_low % ratio == ratio / 2 {
            let idx_mid = (cycle_n / tables.mid.slot_cycle) % tables.mid.slots;
            for h in tables.mid.row_handles(idx_mid) {
                send(tx, h, &mut result);
            }

            // Drain pending pull requests sitting at the queue head.
            loop {
                let Some(&head) = tx.order.first() else {
                    break;
                };
                let is_pr = tx.pubs.get(head).is_some_and(|p| {
                    p.req_to_send && p.frame.msg_type() == Some(MsgType::Pr)
                });
                if !is_pr {
                    break;
                }
                if let Err(e) = send_element(tx, head, session_topo, port, stats, false, now) {
                    result = Err(e);
                }
                if tx.order.first() == Some(&head) {
                    break; // not removed, stop rather than spin
                }
            }
        }

        if idx_low == 0 {
            let idx_high = (cycle_n / tables.high.slot_cycle) % tables.high.slots;
            for h in tables.high.row_handles(idx_high) {
                send(tx, h, &mut result);
            }

            // Intervals beyond the high tier run on plain timers, checked
            // once per high slot cycle.
            for &h in &tables.ext {
                let due = tx
                    .pubs
                    .get_mut(h)
                    .filter(|p| p.next_due.is_some_and(|d| d <= now))
                    .map(|p| {
                        if let Some(d) = p.next_due {
                            p.next_due = Some(d + p.interval);
                        }
                    })
                    .is_some();
                if due {
                    send(tx, h, &mut result);
                }
            }
        }

        tables.current_cycle += tables.geom.min_cycle;
        if tables.current_cycle >= tables.high.slots * tables.high.slot_cycle {
            report_cycle_budget(&tables, now);
            tables.cycle_start = now;
            tables.current_cycle = 0;
        }
    }

    tx.index = Some(tables);
    result
}

/// Compare wall-clock time spent against the expected table span and log
/// at a severity matching how far behind the host is.
fn report_cycle_budget(tables: &IndexTables, now: Instant) {
    let spent_us = now.duration_since(tables.cycle_start).as_micros() as f32;
    let percent = 100.0 * spent_us / tables.current_cycle as f32;
    let msg = format!(
        "index tables wrapped: expected {} ms, clock {} ms ({:.2}%)",
        tables.current_cycle / 1000,
        (spent_us / 1000.0) as u32,
        percent
    );
    if percent > CLOCK_PERCENT_ERROR_LIMIT {
        log::error!("[INDEX] {}", msg);
    } else if percent > CLOCK_PERCENT_WARNING_LIMIT {
        log::warn!("[INDEX] {}", msg);
    } else if percent > CLOCK_PERCENT_INFO_LIMIT {
        log::info!("[INDEX] {}", msg);
    } else {
        log::debug!("[INDEX] {}", msg);
    }
}

/// Receive-side index tables.
pub struct RcvTables {
    /// (comId, handle), sorted by comId.
    by_com_id: Vec<(u32, SubHandle)>,
    /// Handles with finite timeout, sorted by interval ascending.
    by_timeout: Vec<SubHandle>,
}

impl RcvTables {
    pub fn build(subs: &Arena<Subscription, SubKind>) -> Self {
        let mut by_com_id: Vec<(u32, SubHandle)> =
            subs.iter().map(|(h, s)| (s.addr.com_id, h)).collect();
        by_com_id.sort_by_key(|&(com_id, _)| com_id);

        let mut with_interval: Vec<(std::time::Duration, SubHandle)> = subs
            .iter()
            .filter(|(_, s)| !s.interval.is_zero())
            .map(|(h, s)| (s.interval, h))
            .collect();
        with_interval.sort_by_key(|&(interval, _)| interval);

        Self {
            by_com_id,
            by_timeout: with_interval.into_iter().map(|(_, h)| h).collect(),
        }
    }

    /// Binary search for the comId, walk back to the first entry of the
    /// run, then test each subscriber of that comId against the key.
    pub fn find(&self, subs: &Arena<Subscription, SubKind>, key: &RxKey) -> Option<SubHandle> {
        let mut i = self
            .by_com_id
            .binary_search_by_key(&key.com_id, |&(c, _)| c)
            .ok()?;
        while i > 0 && self.by_com_id[i - 1].0 == key.com_id {
            i -= 1;
        }
        while i < self.by_com_id.len() && self.by_com_id[i].0 == key.com_id {
            let h = self.by_com_id[i].1;
            if subs.get(h).is_some_and(|s| s.addr.matches(key)) {
                return Some(h);
            }
            i += 1;
        }
        None
    }

    /// Timeout sweep order (interval ascending, infinite excluded).
    pub fn timeout_order(&self) -> &[SubHandle] {
        &self.by_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CycleBase;
    use crate::core::{PdFlags, PubAddress};
    use crate::protocol::FrameBuf;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn cyclic_pub(com_id: u32, interval_ms: u64) -> Publication {
        Publication {
            addr: PubAddress {
                src_ip: Ipv4Addr::UNSPECIFIED,
                dest_ip: Ipv4Addr::new(239, 255, 1, 1),
                com_id,
                service_id: 0,
            },
            interval: Duration::from_millis(interval_ms),
            next_due: None,
            red_id: 0,
            push_seq: None,
            pull_seq: None,
            frame: FrameBuf::v1(com_id, 0, TopoCounts::ZERO, 0),
            sock_idx: None,
            sock: None,
            pull_ip: Ipv4Addr::UNSPECIFIED,
            flags: PdFlags::default(),
            invalid_data: true,
            follower: false,
            req_to_send: false,
            pre_send: None,
            num_sent: 0,
        }
    }

    fn build_for(intervals_ms: &[u64]) -> (Arena<Publication, PubKind>, Vec<PubHandle>, IndexTables) {
        let mut pubs: Arena<Publication, PubKind> = Arena::new();
        let handles: Vec<PubHandle> = intervals_ms
            .iter()
            .enumerate()
            .map(|(i, &ms)| pubs.insert(cyclic_pub(10_000 + i as u32, ms)))
            .collect();
        let tables = IndexTables::build(
            CycleBase::Base10.geometry(),
            1_000,
            &pubs,
            IndexPreset::default(),
        )
        .expect("tables build");
        (pubs, handles, tables)
    }

    #[test]
    fn test_tier_partition() {
        let geom = CycleBase::Base10.geometry();
        assert!(tier_for(&cyclic_pub(1, 10), &geom) == Tier::Low);
        assert!(tier_for(&cyclic_pub(1, 100), &geom) == Tier::Low);
        assert!(tier_for(&cyclic_pub(1, 101), &geom) == Tier::Mid);
        assert!(tier_for(&cyclic_pub(1, 1000), &geom) == Tier::Mid);
        assert!(tier_for(&cyclic_pub(1, 5000), &geom) == Tier::High);
        assert!(tier_for(&cyclic_pub(1, 10_000), &geom) == Tier::Ext);
        assert!(tier_for(&cyclic_pub(1, 0), &geom) == Tier::Ignore);
        let mut tsn = cyclic_pub(1, 10);
        tsn.flags.tsn = true;
        assert!(tier_for(&tsn, &geom) == Tier::Ignore);
    }

    #[test]
    fn test_distribute_count_and_stride() {
        // 10ms interval in the 100-slot low table: 10 entries, 10 apart.
        let (_, handles, tables) = build_for(&[10]);
        let rows = tables.occurrences(&tables.low, handles[0]);
        assert_eq!(rows.len(), 10);
        for pair in rows.windows(2) {
            assert_eq!(pair[1] - pair[0], 10, "stride must equal the interval");
        }
        assert!(rows[0] < 10, "first row within one interval of table start");
    }

    #[test]
    fn test_distribute_spreads_start_rows() {
        // Several same-interval telegrams land on distinct start rows.
        let (_, handles, tables) = build_for(&[20, 20, 20]);
        let starts: Vec<u32> = handles
            .iter()
            .map(|&h| tables.occurrences(&tables.low, h)[0])
            .collect();
        assert_eq!(starts.len(), 3);
        let mut unique = starts.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 3, "start rows must differ: {:?}", starts);
    }

    #[test]
    fn test_mid_and_high_population() {
        let (_, handles, tables) = build_for(&[500, 2000]);
        assert_eq!(tables.occurrences(&tables.mid, handles[0]).len(), 2);
        assert_eq!(tables.occurrences(&tables.high, handles[1]).len(), 5);
    }

    #[test]
    fn test_ext_entries_listed() {
        let (_, handles, tables) = build_for(&[30_000]);
        assert_eq!(tables.ext, vec![handles[0]]);
    }

    #[test]
    fn test_rcv_find_among_same_com_id() {
        use crate::core::subscription::{SubAddress, Subscription, TimeoutBehavior};
        use crate::core::SequenceTracker;
        use crate::engine::PdStatus;

        let mut subs: Arena<Subscription, SubKind> = Arena::new();
        let mk = |com_id: u32, src: Ipv4Addr| Subscription {
            addr: SubAddress {
                com_id,
                service_id: 0,
                src_lo: src,
                src_hi: Ipv4Addr::UNSPECIFIED,
                dest_ip: Ipv4Addr::UNSPECIFIED,
                topo: TopoCounts::ZERO,
            },
            interval: Duration::from_millis(100),
            next_due: None,
            to_behavior: TimeoutBehavior::SetToZero,
            frame: None,
            seq: SequenceTracker::new(),
            cur_seq: 0,
            last_src: None,
            last_dest: Ipv4Addr::UNSPECIFIED,
            sock_idx: None,
            mc_group: None,
            callback: None,
            flags: PdFlags::default(),
            timed_out: false,
            last_status: PdStatus::Ok,
            num_recv: 0,
            num_missed: 0,
        };
        let a = Ipv4Addr::new(10, 0, 1, 1);
        let b = Ipv4Addr::new(10, 0, 1, 2);
        let _h0 = subs.insert(mk(999, a));
        let h1 = subs.insert(mk(1000, a));
        let h2 = subs.insert(mk(1000, b));
        let _h3 = subs.insert(mk(1001, a));

        let tables = RcvTables::build(&subs);
        let key = |src: Ipv4Addr| RxKey {
            com_id: 1000,
            src_ip: src,
            dest_ip: Ipv4Addr::new(10, 0, 1, 99),
            service_id: 0,
            topo: TopoCounts::ZERO,
        };
        assert_eq!(tables.find(&subs, &key(a)), Some(h1));
        assert_eq!(tables.find(&subs, &key(b)), Some(h2));
        assert_eq!(tables.find(&subs, &key(Ipv4Addr::new(10, 0, 1, 3))), None);
        let mut missing = key(a);
        missing.com_id = 555;
        assert_eq!(tables.find(&subs, &missing), None);
    }

    #[test]
    fn test_timeout_order_sorted_ascending() {
        use crate::core::subscription::{SubAddress, Subscription, TimeoutBehavior};
        use crate::core::SequenceTracker;
        use crate::engine::PdStatus;

        let mut subs: Arena<Subscription, SubKind> = Arena::new();
        let mk = |ms: u64| Subscription {
            addr: SubAddress {
                com_id: 1,
                service_id: 0,
                src_lo: Ipv4Addr::UNSPECIFIED,
                src_hi: Ipv4Addr::UNSPECIFIED,
                dest_ip: Ipv4Addr::UNSPECIFIED,
                topo: TopoCounts::ZERO,
            },
            interval: Duration::from_millis(ms),
            next_due: None,
            to_behavior: TimeoutBehavior::SetToZero,
            frame: None,
            seq: SequenceTracker::new(),
            cur_seq: 0,
            last_src: None,
            last_dest: Ipv4Addr::UNSPECIFIED,
            sock_idx: None,
            mc_group: None,
            callback: None,
            flags: PdFlags::default(),
            timed_out: false,
            last_status: PdStatus::Ok,
            num_recv: 0,
            num_missed: 0,
        };
        let slow = subs.insert(mk(500));
        let infinite = subs.insert(mk(0));
        let fast = subs.insert(mk(50));

        let tables = RcvTables::build(&subs);
        assert_eq!(tables.timeout_order(), &[fast, slow]);
        assert!(!tables.timeout_order().contains(&infinite));
    }
}
