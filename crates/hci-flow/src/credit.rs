//! # Controller Credit Accounting
//!
//! One credit admits one outstanding packet into the controller's buffer until
//! a Number-Of-Completed-Packets event hands it back. Credits come from at most
//! two pools: classic (always present) and LE (optional; LE links draw from
//! the classic pool when it is absent).
//!
//! Pending-credit records are keyed by handle and live independently of link
//! registration: they are created on the first send and only shrink on
//! completion or an explicit [`CreditTracker::clear`].
//!
//! The pools are accounted separately even when the controller backs both
//! with one physical buffer, so spare capacity can be counted twice there.

use std::collections::HashMap;

use serde::Serialize;
use tracing::error;

use crate::packet::{ConnectionHandle, LinkType};

// ─── Pools ───────────────────────────────────────────────────────────────────

/// Controller buffer geometry for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferInfo {
    /// Largest payload the controller accepts in one packet.
    pub max_packet_size: usize,
    /// Packets the controller can hold at once.
    pub max_credits: usize,
}

impl BufferInfo {
    pub fn new(max_packet_size: usize, max_credits: usize) -> Self {
        BufferInfo {
            max_packet_size,
            max_credits,
        }
    }
}

/// Credit pool a link draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PoolKind {
    Classic,
    Le,
}

/// Record of packets handed to the controller but not yet completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCredit {
    pub link_type: LinkType,
    pub outstanding: usize,
}

// ─── CreditTracker ───────────────────────────────────────────────────────────

/// Per-pool sent counts and per-handle outstanding counts.
#[derive(Debug, Clone)]
pub struct CreditTracker {
    classic: BufferInfo,
    le: Option<BufferInfo>,
    sent_classic: usize,
    sent_le: usize,
    pending: HashMap<ConnectionHandle, PendingCredit>,
}

impl CreditTracker {
    pub fn new(classic: BufferInfo, le: Option<BufferInfo>) -> Self {
        CreditTracker {
            classic,
            le,
            sent_classic: 0,
            sent_le: 0,
            pending: HashMap::new(),
        }
    }

    /// Pool that packets for `link_type` draw credit from.
    pub fn pool_for(&self, link_type: LinkType) -> PoolKind {
        match link_type {
            LinkType::Le if self.le.is_some() => PoolKind::Le,
            _ => PoolKind::Classic,
        }
    }

    pub fn has_le_pool(&self) -> bool {
        self.le.is_some()
    }

    /// Buffer geometry of `pool`. The classic pool stands in for a missing LE
    /// pool.
    pub fn buffer(&self, pool: PoolKind) -> BufferInfo {
        match pool {
            PoolKind::Classic => self.classic,
            PoolKind::Le => self.le.unwrap_or(self.classic),
        }
    }

    /// Packets currently outstanding in `pool`.
    pub fn sent(&self, pool: PoolKind) -> usize {
        match pool {
            PoolKind::Classic => self.sent_classic,
            PoolKind::Le => self.sent_le,
        }
    }

    /// Credits `pool` can still hand out.
    pub fn spare(&self, pool: PoolKind) -> usize {
        self.buffer(pool).max_credits.saturating_sub(self.sent(pool))
    }

    fn sent_mut(&mut self, pool: PoolKind) -> &mut usize {
        match pool {
            PoolKind::Classic => &mut self.sent_classic,
            PoolKind::Le => &mut self.sent_le,
        }
    }

    /// Account for one packet handed to the controller on `handle`.
    pub fn record_sent(&mut self, handle: ConnectionHandle, link_type: LinkType) {
        let pool = self.pool_for(link_type);
        let record = self.pending.entry(handle).or_insert(PendingCredit {
            link_type,
            outstanding: 0,
        });
        record.outstanding += 1;
        let max = self.buffer(pool).max_credits;
        let sent = self.sent_mut(pool);
        *sent += 1;
        debug_assert!(*sent <= max, "{pool:?} pool over-committed: {sent} > {max}");
    }

    /// Return `count` completed packets' credit for `handle`.
    ///
    /// Returns `None` for a handle with no record. Completing more packets
    /// than are outstanding means the accounting has diverged from the
    /// controller and is fatal.
    pub fn complete(&mut self, handle: ConnectionHandle, count: usize) -> Option<usize> {
        let record = self.pending.get_mut(&handle)?;
        if count > record.outstanding {
            let outstanding = record.outstanding;
            error!(
                %handle,
                completed = count,
                outstanding,
                "controller completed more packets than were outstanding"
            );
            panic!(
                "credit accounting diverged on handle {handle}: {count} completed, {outstanding} outstanding"
            );
        }
        record.outstanding -= count;
        let link_type = record.link_type;
        if record.outstanding == 0 {
            self.pending.remove(&handle);
        }
        let pool = self.pool_for(link_type);
        *self.sent_mut(pool) -= count;
        Some(count)
    }

    /// Drop the record for `handle` without waiting for completions. Returns
    /// the credit handed back to its pool.
    pub fn clear(&mut self, handle: ConnectionHandle) -> usize {
        let Some(record) = self.pending.remove(&handle) else {
            return 0;
        };
        let pool = self.pool_for(record.link_type);
        *self.sent_mut(pool) -= record.outstanding;
        record.outstanding
    }

    /// Packets outstanding on `handle`.
    pub fn outstanding(&self, handle: ConnectionHandle) -> usize {
        self.pending.get(&handle).map_or(0, |r| r.outstanding)
    }

    pub fn pending(&self, handle: ConnectionHandle) -> Option<PendingCredit> {
        self.pending.get(&handle).copied()
    }

    /// Handles with a pending-credit record.
    pub fn pending_handles(&self) -> usize {
        self.pending.len()
    }

    /// Sum of outstanding counts over the handles drawing from `pool`.
    pub fn outstanding_in(&self, pool: PoolKind) -> usize {
        self.pending
            .values()
            .filter(|r| self.pool_for(r.link_type) == pool)
            .map(|r| r.outstanding)
            .sum()
    }
}
