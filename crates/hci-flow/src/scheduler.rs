//! # Outbound Packet Scheduler
//!
//! Owns the send queue and the controller credit accounting. No threads, no
//! locks: every method must be called from the one execution domain that owns
//! the scheduler (see `hci-dataplane`'s runtime for the actor that does this).
//!
//! ## Responsibilities
//!
//! 1. **Admission**: validate a batch, tag each packet with a ledger token,
//!    evict the oldest PDU of an overflowing classic channel, insert by priority
//! 2. **Drain**: hand packets to the transport while their pool has credit,
//!    skipping packets whose pool is exhausted
//! 3. **Completion**: return credit reported by the controller and drain again
//! 4. **Telemetry**: debounced quantile export of queue residency and size
//!
//! Accounting inconsistencies (over-completion, controller buffer overflow)
//! panic. They mean the credit state no longer matches the controller.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use quanta::{Clock, Instant};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::credit::{BufferInfo, CreditTracker, PendingCredit, PoolKind};
use crate::packet::{AclPacket, ChannelId, ConnectionHandle, LinkType, Priority};
use crate::token::{LedgerSnapshot, Token, TokenLedger};
use crate::transport::{
    flush_timeout_slots, LinkPriority, TelemetrySink, TransportError, TransportSink,
};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Queued PDUs allowed per classic `(handle, channel)` before the oldest
    /// is evicted.
    pub overflow_limit: usize,
    /// Delay between the first admission after idle and the telemetry
    /// recompute it schedules.
    pub telemetry_delay: Duration,
    /// Minimum spacing of overflow-drop log lines per `(handle, channel)`.
    pub drop_log_interval: Duration,
    /// Cut points exported on each telemetry recompute.
    pub telemetry_quantiles: Vec<f64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            overflow_limit: 32,
            telemetry_delay: Duration::from_secs(1),
            drop_log_interval: Duration::from_secs(1),
            telemetry_quantiles: vec![0.5, 0.9, 0.99],
        }
    }
}

/// Controller buffer pools as read from the controller at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControllerBuffers {
    pub classic: BufferInfo,
    pub le: Option<BufferInfo>,
}

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Caller misuse, rejected without side effects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("handle {0} is already registered")]
    AlreadyRegistered(ConnectionHandle),
    #[error("handle {0} is not registered")]
    NotRegistered(ConnectionHandle),
    #[error("handle {0} is still registered")]
    StillRegistered(ConnectionHandle),
    #[error("no packets to send")]
    EmptyBatch,
    #[error("batch spans handles {first} and {other}")]
    MixedHandles {
        first: ConnectionHandle,
        other: ConnectionHandle,
    },
    #[error("batch for handle {0} starts with a continuation fragment")]
    LeadingContinuation(ConnectionHandle),
    #[error("packet of {len} bytes exceeds controller limit of {max}")]
    PacketTooLarge { len: usize, max: usize },
    #[error("flush timeout {0:?} is out of range")]
    FlushTimeoutOutOfRange(Duration),
    #[error("flush timeout does not apply to {0:?} links")]
    FlushTimeoutUnsupported(LinkType),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ─── Queue Entries ──────────────────────────────────────────────────────────

/// A packet waiting for controller credit.
#[derive(Debug)]
pub struct QueuedPacket {
    pub packet: AclPacket,
    pub channel: ChannelId,
    pub priority: Priority,
    pub link_type: LinkType,
    pool: PoolKind,
    token: Token,
}

impl QueuedPacket {
    pub fn handle(&self) -> ConnectionHandle {
        self.packet.handle
    }

    pub fn pool(&self) -> PoolKind {
        self.pool
    }

    /// Ledger token tracking this packet's time in the queue.
    pub fn token(&self) -> &Token {
        &self.token
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct DropCounter {
    total: u64,
    unreported: u64,
    last_report: Option<Instant>,
}

// ─── Stats ──────────────────────────────────────────────────────────────────

/// Cumulative scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Packets accepted into the queue.
    pub packets_queued: u64,
    /// Packets handed to the transport.
    pub packets_sent: u64,
    /// Packets the transport refused.
    pub write_failures: u64,
    /// PDUs evicted by the overflow policy.
    pub overflow_evictions: u64,
    /// Queued packets discarded by `drop_queued_packets` / unregistration.
    pub packets_discarded: u64,
    /// Batches rejected for caller misuse.
    pub rejected_batches: u64,
    /// Telemetry samples the sink refused.
    pub telemetry_failures: u64,
}

/// Credit state of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub max_packet_size: usize,
    pub max_credits: usize,
    pub sent: usize,
}

/// Serializable point-in-time view of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub registered_links: usize,
    pub queued_packets: usize,
    pub queued_high: usize,
    pub pending_handles: usize,
    pub classic: PoolSnapshot,
    pub le: Option<PoolSnapshot>,
    pub stats: SchedulerStats,
    pub ledger: LedgerSnapshot,
}

// ─── Scheduler ──────────────────────────────────────────────────────────────

/// Credit-based outbound scheduler for one controller.
pub struct Scheduler<T: TransportSink, M: TelemetrySink> {
    config: SchedulerConfig,
    transport: T,
    telemetry: M,
    clock: Clock,
    ledger: TokenLedger,
    credits: CreditTracker,
    links: HashMap<ConnectionHandle, LinkType>,
    queue: VecDeque<QueuedPacket>,
    drops: HashMap<(ConnectionHandle, ChannelId), DropCounter>,
    telemetry_deadline: Option<Instant>,
    stats: SchedulerStats,
}

impl<T: TransportSink, M: TelemetrySink> Scheduler<T, M> {
    /// Create a scheduler. Time is taken from the ledger's clock.
    pub fn new(
        config: SchedulerConfig,
        buffers: ControllerBuffers,
        ledger: TokenLedger,
        transport: T,
        telemetry: M,
    ) -> Self {
        Scheduler {
            config,
            transport,
            telemetry,
            clock: ledger.clock(),
            ledger,
            credits: CreditTracker::new(buffers.classic, buffers.le),
            links: HashMap::new(),
            queue: VecDeque::new(),
            drops: HashMap::new(),
            telemetry_deadline: None,
            stats: SchedulerStats::default(),
        }
    }

    // ─── Links ──────────────────────────────────────────────────────────

    /// Admit `handle` for sending.
    pub fn register_link(
        &mut self,
        handle: ConnectionHandle,
        link_type: LinkType,
    ) -> Result<(), SchedulerError> {
        if self.links.contains_key(&handle) {
            warn!(%handle, "register_link: handle already registered");
            return Err(SchedulerError::AlreadyRegistered(handle));
        }
        self.links.insert(handle, link_type);
        debug!(%handle, link_type = link_type.as_str(), "link registered");
        Ok(())
    }

    /// Forget `handle` and discard its queued packets. Packets already handed
    /// to the controller keep their credit until completed or cleared.
    pub fn unregister_link(&mut self, handle: ConnectionHandle) -> Result<(), SchedulerError> {
        if self.links.remove(&handle).is_none() {
            warn!(%handle, "unregister_link: handle not registered");
            return Err(SchedulerError::NotRegistered(handle));
        }
        let dropped = self.drop_queued_packets(|p| p.handle() == handle);
        self.flush_drop_reports(handle);
        debug!(%handle, dropped, "link unregistered");
        Ok(())
    }

    /// Reclaim the credit of an unregistered link whose buffered packets the
    /// controller has discarded (e.g. after a disconnection).
    pub fn clear_controller_packet_count(
        &mut self,
        handle: ConnectionHandle,
    ) -> Result<(), SchedulerError> {
        if self.links.contains_key(&handle) {
            warn!(%handle, "clear_controller_packet_count: handle still registered");
            return Err(SchedulerError::StillRegistered(handle));
        }
        let freed = self.credits.clear(handle);
        debug!(%handle, freed, "controller packet count cleared");
        if freed > 0 {
            self.drain();
        }
        Ok(())
    }

    pub fn is_registered(&self, handle: ConnectionHandle) -> bool {
        self.links.contains_key(&handle)
    }

    pub fn link_type(&self, handle: ConnectionHandle) -> Option<LinkType> {
        self.links.get(&handle).copied()
    }

    // ─── Admission ──────────────────────────────────────────────────────

    /// Queue a single packet. It must open a PDU.
    pub fn send_packet(
        &mut self,
        packet: AclPacket,
        channel: ChannelId,
        priority: Priority,
    ) -> Result<(), SchedulerError> {
        self.send_packets(vec![packet], channel, priority)
    }

    /// Queue the fragments of one or more PDUs for a single handle, then try
    /// to send immediately.
    pub fn send_packets(
        &mut self,
        packets: Vec<AclPacket>,
        channel: ChannelId,
        priority: Priority,
    ) -> Result<(), SchedulerError> {
        let (handle, link_type) = match self.validate(&packets) {
            Ok(admitted) => admitted,
            Err(err) => {
                warn!(%channel, error = %err, "send_packets rejected");
                self.stats.rejected_batches += 1;
                return Err(err);
            }
        };

        if link_type == LinkType::Acl {
            self.evict_overflow(handle, channel);
        }

        let pool = self.credits.pool_for(link_type);
        let count = packets.len();
        let entries: Vec<QueuedPacket> = packets
            .into_iter()
            .map(|packet| QueuedPacket {
                token: self.ledger.issue(packet.len() as u64),
                packet,
                channel,
                priority,
                link_type,
                pool,
            })
            .collect();
        match priority {
            Priority::High => {
                let mut at = self
                    .queue
                    .iter()
                    .position(|p| p.priority == Priority::Low)
                    .unwrap_or(self.queue.len());
                for entry in entries {
                    self.queue.insert(at, entry);
                    at += 1;
                }
            }
            Priority::Low => self.queue.extend(entries),
        }
        self.stats.packets_queued += count as u64;
        trace!(%handle, %channel, ?priority, count, "packets queued");

        self.arm_telemetry();
        self.drain();
        Ok(())
    }

    fn validate(&self, packets: &[AclPacket]) -> Result<(ConnectionHandle, LinkType), SchedulerError> {
        let first = packets.first().ok_or(SchedulerError::EmptyBatch)?;
        let handle = first.handle;
        let link_type = *self
            .links
            .get(&handle)
            .ok_or(SchedulerError::NotRegistered(handle))?;
        if let Some(other) = packets.iter().find(|p| p.handle != handle) {
            return Err(SchedulerError::MixedHandles {
                first: handle,
                other: other.handle,
            });
        }
        if !first.is_head() {
            return Err(SchedulerError::LeadingContinuation(handle));
        }
        let max = self
            .credits
            .buffer(self.credits.pool_for(link_type))
            .max_packet_size;
        if let Some(big) = packets.iter().find(|p| p.len() > max) {
            return Err(SchedulerError::PacketTooLarge {
                len: big.len(),
                max,
            });
        }
        Ok((handle, link_type))
    }

    /// Discard every queued packet matching `predicate`. Returns how many were
    /// removed. Packets already handed to the controller are unaffected.
    pub fn drop_queued_packets<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&QueuedPacket) -> bool,
    {
        let before = self.queue.len();
        self.queue.retain(|p| !predicate(p));
        let dropped = before - self.queue.len();
        self.stats.packets_discarded += dropped as u64;
        dropped
    }

    // ─── Overflow ───────────────────────────────────────────────────────

    /// Make room for one more PDU on `(handle, channel)` by evicting the
    /// oldest queued one once the limit is reached.
    fn evict_overflow(&mut self, handle: ConnectionHandle, channel: ChannelId) {
        let is_match =
            |p: &QueuedPacket| p.handle() == handle && p.channel == channel && p.packet.is_head();
        let queued = self.queue.iter().filter(|p| is_match(p)).count();
        if queued < self.config.overflow_limit {
            return;
        }
        let Some(oldest) = self.queue.iter().position(is_match) else {
            return;
        };
        self.queue.remove(oldest);
        while self
            .queue
            .get(oldest)
            .is_some_and(|p| p.packet.boundary.is_continuation())
        {
            self.queue.remove(oldest);
        }
        self.stats.overflow_evictions += 1;
        self.record_overflow_drop(handle, channel);
    }

    fn record_overflow_drop(&mut self, handle: ConnectionHandle, channel: ChannelId) {
        let now = self.clock.now();
        let interval = self.config.drop_log_interval;
        let counter = self.drops.entry((handle, channel)).or_default();
        counter.total += 1;
        counter.unreported += 1;
        let due = match counter.last_report {
            None => true,
            Some(at) => now.duration_since(at) >= interval,
        };
        if due {
            warn!(
                %handle,
                %channel,
                dropped = counter.unreported,
                total = counter.total,
                "send queue overflow, dropped oldest PDU"
            );
            counter.unreported = 0;
            counter.last_report = Some(now);
        }
    }

    /// Log any overflow drops on `handle` not yet reported and forget its
    /// counters.
    fn flush_drop_reports(&mut self, handle: ConnectionHandle) {
        self.drops.retain(|&(h, channel), counter| {
            if h != handle {
                return true;
            }
            if counter.unreported > 0 {
                warn!(
                    %handle,
                    %channel,
                    dropped = counter.unreported,
                    total = counter.total,
                    "send queue overflow, dropped oldest PDU"
                );
            }
            false
        });
    }

    /// PDUs evicted so far on `(handle, channel)`.
    pub fn drop_count(&self, handle: ConnectionHandle, channel: ChannelId) -> u64 {
        self.drops.get(&(handle, channel)).map_or(0, |c| c.total)
    }

    // ─── Drain ──────────────────────────────────────────────────────────

    /// Hand queued packets to the transport while their pool has credit.
    ///
    /// A packet whose pool is exhausted stays where it is; packets behind it
    /// that draw on the other pool may still go.
    fn drain(&mut self) {
        let mut spare_classic = self.credits.spare(PoolKind::Classic);
        let mut spare_le = if self.credits.has_le_pool() {
            self.credits.spare(PoolKind::Le)
        } else {
            0
        };

        let mut i = 0;
        while i < self.queue.len() && (spare_classic > 0 || spare_le > 0) {
            let spare = match self.queue[i].pool {
                PoolKind::Classic => &mut spare_classic,
                PoolKind::Le => &mut spare_le,
            };
            if *spare == 0 {
                i += 1;
                continue;
            }
            let Some(mut entry) = self.queue.remove(i) else {
                break;
            };
            let handle = entry.handle();
            match self.transport.write(entry.packet.encode()) {
                Ok(()) => {
                    *spare -= 1;
                    self.credits.record_sent(handle, entry.link_type);
                    self.stats.packets_sent += 1;
                }
                Err(err) => {
                    warn!(%handle, channel = %entry.channel, error = %err, "transport write failed, packet dropped");
                    self.stats.write_failures += 1;
                }
            }
            entry.token.retire();
        }
    }

    // ─── Controller Events ──────────────────────────────────────────────

    /// Apply a Number-Of-Completed-Packets report.
    ///
    /// Handles without a pending record are ignored; they may carry traffic
    /// this scheduler does not track.
    pub fn on_packets_completed(&mut self, completions: &[(ConnectionHandle, u16)]) {
        let mut freed = 0;
        for &(handle, count) in completions {
            match self.credits.complete(handle, count as usize) {
                Some(n) => freed += n,
                None => trace!(%handle, count, "completion for untracked handle ignored"),
            }
        }
        if freed > 0 {
            self.drain();
        }
    }

    /// The controller reported that its data buffer overflowed. Credit
    /// accounting has diverged and cannot be trusted.
    pub fn on_buffer_overflow(&mut self, link_type: LinkType) -> ! {
        error!(
            link_type = link_type.as_str(),
            classic_sent = self.credits.sent(PoolKind::Classic),
            le_sent = self.credits.sent(PoolKind::Le),
            "controller data buffer overflow"
        );
        panic!("controller reported a {} data buffer overflow", link_type.as_str());
    }

    // ─── Pass-Through Requests ──────────────────────────────────────────

    /// Forward a link priority hint to the controller.
    pub fn request_priority(
        &mut self,
        handle: ConnectionHandle,
        priority: LinkPriority,
    ) -> Result<(), SchedulerError> {
        if !self.links.contains_key(&handle) {
            warn!(%handle, "request_priority: handle not registered");
            return Err(SchedulerError::NotRegistered(handle));
        }
        self.transport
            .set_link_priority(handle, priority)
            .map_err(|e| SchedulerError::Transport(e.into()))
    }

    /// Set the automatic flush timeout of a classic link. Zero disables
    /// flushing.
    pub fn set_flush_timeout(
        &mut self,
        handle: ConnectionHandle,
        timeout: Duration,
    ) -> Result<(), SchedulerError> {
        let link_type = self.link_type(handle).ok_or(SchedulerError::NotRegistered(handle))?;
        if link_type != LinkType::Acl {
            return Err(SchedulerError::FlushTimeoutUnsupported(link_type));
        }
        let slots =
            flush_timeout_slots(timeout).ok_or(SchedulerError::FlushTimeoutOutOfRange(timeout))?;
        self.transport
            .write_flush_timeout(handle, slots)
            .map_err(|e| SchedulerError::Transport(e.into()))
    }

    // ─── Telemetry ──────────────────────────────────────────────────────

    fn arm_telemetry(&mut self) {
        if self.telemetry_deadline.is_none() {
            self.telemetry_deadline = Some(self.clock.now() + self.config.telemetry_delay);
        }
    }

    /// When the next telemetry recompute is due, if one is scheduled.
    pub fn next_telemetry_deadline(&self) -> Option<Instant> {
        self.telemetry_deadline
    }

    /// Run the scheduled telemetry recompute if its deadline has passed.
    /// Returns whether it ran.
    pub fn poll_telemetry(&mut self) -> bool {
        match self.telemetry_deadline {
            Some(deadline) if self.clock.now() >= deadline => {
                self.telemetry_deadline = None;
                self.report_telemetry();
                true
            }
            _ => false,
        }
    }

    fn report_telemetry(&mut self) {
        let cuts = self.config.telemetry_quantiles.clone();
        if let Some(ages) = self.ledger.age_quantiles(&cuts) {
            for (p, age) in cuts.iter().zip(ages) {
                self.emit(&format!("acl.queue.age_us.p{}", percentile_label(*p)), age.as_micros() as f64);
            }
        }
        if let Some(sizes) = self.ledger.byte_count_quantiles(&cuts) {
            for (p, bytes) in cuts.iter().zip(sizes) {
                self.emit(&format!("acl.queue.bytes.p{}", percentile_label(*p)), bytes as f64);
            }
        }
        let bytes_in_flight = self.ledger.bytes_in_flight() as f64;
        let tokens_in_flight = self.ledger.tokens_in_flight() as f64;
        self.emit("acl.in_flight.bytes", bytes_in_flight);
        self.emit("acl.in_flight.tokens", tokens_in_flight);
    }

    fn emit(&mut self, name: &str, value: f64) {
        if let Err(err) = self.telemetry.record(name, value) {
            debug!(name, error = %err, "telemetry sample dropped");
            self.stats.telemetry_failures += 1;
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn telemetry(&self) -> &M {
        &self.telemetry
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Packets waiting for credit.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_for(&self, handle: ConnectionHandle) -> usize {
        self.queue.iter().filter(|p| p.handle() == handle).count()
    }

    /// Queue contents, front first.
    pub fn queued(&self) -> impl Iterator<Item = &QueuedPacket> {
        self.queue.iter()
    }

    /// Packets handed to the controller on `handle` and not yet completed.
    pub fn outstanding(&self, handle: ConnectionHandle) -> usize {
        self.credits.outstanding(handle)
    }

    pub fn pending_credit(&self, handle: ConnectionHandle) -> Option<PendingCredit> {
        self.credits.pending(handle)
    }

    pub fn sent_count(&self, pool: PoolKind) -> usize {
        self.credits.sent(pool)
    }

    pub fn spare_credits(&self, pool: PoolKind) -> usize {
        self.credits.spare(pool)
    }

    pub fn pool_for(&self, link_type: LinkType) -> PoolKind {
        self.credits.pool_for(link_type)
    }

    pub fn credits(&self) -> &CreditTracker {
        &self.credits
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let pool = |kind| {
            let buffer = self.credits.buffer(kind);
            PoolSnapshot {
                max_packet_size: buffer.max_packet_size,
                max_credits: buffer.max_credits,
                sent: self.credits.sent(kind),
            }
        };
        SchedulerSnapshot {
            registered_links: self.links.len(),
            queued_packets: self.queue.len(),
            queued_high: self
                .queue
                .iter()
                .filter(|p| p.priority == Priority::High)
                .count(),
            pending_handles: self.credits.pending_handles(),
            classic: pool(PoolKind::Classic),
            le: self.credits.has_le_pool().then(|| pool(PoolKind::Le)),
            stats: self.stats.clone(),
            ledger: self.ledger.snapshot(),
        }
    }
}

/// `0.5` → `"50"`, `0.999` → `"99.9"`.
fn percentile_label(p: f64) -> String {
    let pct = (p * 1000.0).round() / 10.0;
    format!("{pct}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{fragment_pdu, PacketBoundary};
    use crate::stats::RetirementLog;
    use anyhow::{anyhow, Result};
    use bytes::Bytes;
    use quanta::Mock;
    use std::sync::Arc;

    #[derive(Default)]
    struct MockTransport {
        frames: Vec<AclPacket>,
        fail_next: usize,
        refuse_commands: bool,
        priorities: Vec<(ConnectionHandle, LinkPriority)>,
        flush_timeouts: Vec<(ConnectionHandle, u16)>,
    }

    impl TransportSink for MockTransport {
        fn write(&mut self, frame: Bytes) -> Result<()> {
            if self.fail_next > 0 {
                self.fail_next -= 1;
                return Err(anyhow!("uart write failed"));
            }
            let packet = AclPacket::decode(&mut frame.clone()).expect("valid ACL frame");
            self.frames.push(packet);
            Ok(())
        }

        fn set_link_priority(&mut self, handle: ConnectionHandle, priority: LinkPriority) -> Result<()> {
            if self.refuse_commands {
                return Err(CommandRejected(0x0C).into());
            }
            self.priorities.push((handle, priority));
            Ok(())
        }

        fn write_flush_timeout(&mut self, handle: ConnectionHandle, slots: u16) -> Result<()> {
            self.flush_timeouts.push((handle, slots));
            Ok(())
        }
    }

    #[derive(Debug, PartialEq, Error)]
    #[error("command rejected with status {0:#04x}")]
    struct CommandRejected(u8);

    #[derive(Default)]
    struct RecordingTelemetry {
        samples: Vec<(String, f64)>,
        fail: bool,
    }

    impl TelemetrySink for RecordingTelemetry {
        fn record(&mut self, name: &str, value: f64) -> Result<()> {
            if self.fail {
                return Err(anyhow!("exporter offline"));
            }
            self.samples.push((name.to_string(), value));
            Ok(())
        }
    }

    type TestScheduler = Scheduler<MockTransport, RecordingTelemetry>;

    const CH: ChannelId = ChannelId(0x0040);
    const OTHER_CH: ChannelId = ChannelId(0x0041);

    fn h(raw: u16) -> ConnectionHandle {
        ConnectionHandle::new(raw).unwrap()
    }

    fn scheduler_with(classic: BufferInfo, le: Option<BufferInfo>) -> (TestScheduler, Arc<Mock>) {
        let (clock, mock) = Clock::mock();
        let ledger = TokenLedger::with_clock(RetirementLog::new(1, 64).unwrap(), clock);
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            ControllerBuffers { classic, le },
            ledger,
            MockTransport::default(),
            RecordingTelemetry::default(),
        );
        (scheduler, mock)
    }

    fn scheduler(credits: usize) -> TestScheduler {
        scheduler_with(BufferInfo::new(64, credits), None).0
    }

    fn head(handle: ConnectionHandle, tag: u8) -> AclPacket {
        AclPacket::new(handle, PacketBoundary::FirstFlushable, Bytes::from(vec![tag; 4]))
    }

    fn cont(handle: ConnectionHandle, tag: u8) -> AclPacket {
        AclPacket::new(handle, PacketBoundary::Continuing, Bytes::from(vec![tag; 4]))
    }

    fn sent_tags(s: &TestScheduler) -> Vec<u8> {
        s.transport().frames.iter().map(|p| p.payload[0]).collect()
    }

    // ─── Registration ───────────────────────────────────────────────────

    #[test]
    fn double_registration_rejected() {
        let mut s = scheduler(4);
        s.register_link(h(1), LinkType::Acl).unwrap();
        assert_eq!(
            s.register_link(h(1), LinkType::Le),
            Err(SchedulerError::AlreadyRegistered(h(1)))
        );
        assert_eq!(s.link_type(h(1)), Some(LinkType::Acl));
    }

    #[test]
    fn unregister_unknown_rejected() {
        let mut s = scheduler(4);
        assert_eq!(s.unregister_link(h(1)), Err(SchedulerError::NotRegistered(h(1))));
    }

    #[test]
    fn reregistration_after_unregister() {
        let mut s = scheduler(4);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.unregister_link(h(1)).unwrap();
        assert!(s.register_link(h(1), LinkType::Acl).is_ok());
    }

    // ─── Admission Checks ───────────────────────────────────────────────

    #[test]
    fn send_to_unregistered_rejected() {
        let mut s = scheduler(4);
        let err = s.send_packet(head(h(1), 1), CH, Priority::Low).unwrap_err();
        assert_eq!(err, SchedulerError::NotRegistered(h(1)));
        assert!(s.transport().frames.is_empty());
        assert_eq!(s.ledger().tokens_issued(), 0);
    }

    #[test]
    fn empty_batch_rejected() {
        let mut s = scheduler(4);
        assert_eq!(s.send_packets(vec![], CH, Priority::Low), Err(SchedulerError::EmptyBatch));
    }

    #[test]
    fn mixed_handles_rejected() {
        let mut s = scheduler(4);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.register_link(h(2), LinkType::Acl).unwrap();
        let err = s
            .send_packets(vec![head(h(1), 1), cont(h(2), 2)], CH, Priority::Low)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::MixedHandles { .. }));
        assert_eq!(s.stats().packets_queued, 0);
        assert_eq!(s.stats().rejected_batches, 1);
    }

    #[test]
    fn leading_continuation_rejected() {
        let mut s = scheduler(4);
        s.register_link(h(1), LinkType::Acl).unwrap();
        let err = s.send_packet(cont(h(1), 1), CH, Priority::Low).unwrap_err();
        assert_eq!(err, SchedulerError::LeadingContinuation(h(1)));
    }

    #[test]
    fn oversized_packet_rejected_against_its_pool() {
        let (mut s, _) =
            scheduler_with(BufferInfo::new(1021, 4), Some(BufferInfo::new(27, 4)));
        s.register_link(h(1), LinkType::Le).unwrap();
        s.register_link(h(2), LinkType::Acl).unwrap();
        let big = AclPacket::new(h(1), PacketBoundary::FirstNonFlushable, Bytes::from(vec![0; 28]));
        assert_eq!(
            s.send_packet(big, CH, Priority::Low),
            Err(SchedulerError::PacketTooLarge { len: 28, max: 27 })
        );
        let ok = AclPacket::new(h(2), PacketBoundary::FirstFlushable, Bytes::from(vec![0; 28]));
        assert!(s.send_packet(ok, CH, Priority::Low).is_ok());
    }

    // ─── Drain & Credits ────────────────────────────────────────────────

    #[test]
    fn sends_immediately_with_credit() {
        let mut s = scheduler(2);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.send_packet(head(h(1), 1), CH, Priority::Low).unwrap();
        assert_eq!(sent_tags(&s), vec![1]);
        assert_eq!(s.outstanding(h(1)), 1);
        assert_eq!(s.sent_count(PoolKind::Classic), 1);
        assert_eq!(s.queued_len(), 0);
    }

    #[test]
    fn queues_when_out_of_credit_and_resumes_on_completion() {
        let mut s = scheduler(1);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.send_packet(head(h(1), 1), CH, Priority::Low).unwrap();
        s.send_packet(head(h(1), 2), CH, Priority::Low).unwrap();
        assert_eq!(sent_tags(&s), vec![1]);
        assert_eq!(s.queued_len(), 1);

        s.on_packets_completed(&[(h(1), 1)]);
        assert_eq!(sent_tags(&s), vec![1, 2]);
        assert_eq!(s.outstanding(h(1)), 1);
    }

    #[test]
    fn high_priority_jumps_low() {
        let mut s = scheduler(1);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.send_packet(head(h(1), 0), CH, Priority::Low).unwrap();
        s.send_packet(head(h(1), 1), CH, Priority::Low).unwrap();
        s.send_packet(head(h(1), 2), CH, Priority::High).unwrap();
        s.send_packet(head(h(1), 3), CH, Priority::High).unwrap();

        s.on_packets_completed(&[(h(1), 1)]);
        assert_eq!(sent_tags(&s), vec![0, 2]);
        s.on_packets_completed(&[(h(1), 1)]);
        s.on_packets_completed(&[(h(1), 1)]);
        assert_eq!(sent_tags(&s), vec![0, 2, 3, 1]);
    }

    #[test]
    fn exhausted_pool_does_not_block_other_pool() {
        let (mut s, _) = scheduler_with(BufferInfo::new(64, 1), Some(BufferInfo::new(64, 1)));
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.register_link(h(2), LinkType::Le).unwrap();
        s.send_packet(head(h(1), 1), CH, Priority::Low).unwrap();
        s.send_packet(head(h(1), 2), CH, Priority::Low).unwrap();
        let le = AclPacket::new(h(2), PacketBoundary::FirstNonFlushable, Bytes::from_static(&[3]));
        s.send_packet(le, CH, Priority::Low).unwrap();

        // Classic packet 2 is stuck, LE packet 3 behind it still goes.
        assert_eq!(sent_tags(&s), vec![1, 3]);
        assert_eq!(s.queued_len(), 1);
        assert_eq!(s.sent_count(PoolKind::Le), 1);
    }

    #[test]
    fn le_shares_classic_pool_without_le_buffer() {
        let mut s = scheduler(1);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.register_link(h(2), LinkType::Le).unwrap();
        s.send_packet(head(h(1), 1), CH, Priority::Low).unwrap();
        let le = AclPacket::new(h(2), PacketBoundary::FirstNonFlushable, Bytes::from_static(&[2]));
        s.send_packet(le, CH, Priority::Low).unwrap();
        assert_eq!(sent_tags(&s), vec![1]);
        assert_eq!(s.pool_for(LinkType::Le), PoolKind::Classic);
    }

    #[test]
    fn write_failure_drops_only_that_packet() {
        let mut s = scheduler(4);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.transport_mut().fail_next = 1;
        s.send_packets(
            vec![head(h(1), 1), cont(h(1), 2), cont(h(1), 3)],
            CH,
            Priority::Low,
        )
        .unwrap();
        assert_eq!(sent_tags(&s), vec![2, 3]);
        assert_eq!(s.outstanding(h(1)), 2);
        assert_eq!(s.stats().write_failures, 1);
        assert_eq!(s.ledger().tokens_in_flight(), 0);
    }

    #[test]
    fn unknown_completion_is_ignored() {
        let mut s = scheduler(4);
        s.on_packets_completed(&[(h(7), 3)]);
        assert_eq!(s.sent_count(PoolKind::Classic), 0);
    }

    #[test]
    #[should_panic(expected = "credit accounting diverged")]
    fn over_completion_panics() {
        let mut s = scheduler(4);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.send_packet(head(h(1), 1), CH, Priority::Low).unwrap();
        s.on_packets_completed(&[(h(1), 2)]);
    }

    #[test]
    #[should_panic(expected = "data buffer overflow")]
    fn buffer_overflow_panics() {
        let mut s = scheduler(4);
        s.on_buffer_overflow(LinkType::Le);
    }

    // ─── Unregister & Clear ─────────────────────────────────────────────

    #[test]
    fn unregister_keeps_credit_for_transmitted_packets() {
        let mut s = scheduler(2);
        s.register_link(h(1), LinkType::Acl).unwrap();
        for tag in 0..4 {
            s.send_packet(head(h(1), tag), CH, Priority::Low).unwrap();
        }
        assert_eq!(s.queued_for(h(1)), 2);

        s.unregister_link(h(1)).unwrap();
        assert_eq!(s.queued_len(), 0);
        assert_eq!(s.outstanding(h(1)), 2);
        assert_eq!(s.spare_credits(PoolKind::Classic), 0);
        assert_eq!(s.stats().packets_discarded, 2);

        s.on_packets_completed(&[(h(1), 1)]);
        assert_eq!(s.outstanding(h(1)), 1);
    }

    #[test]
    fn clear_requires_unregistered_handle() {
        let mut s = scheduler(2);
        s.register_link(h(1), LinkType::Acl).unwrap();
        assert_eq!(
            s.clear_controller_packet_count(h(1)),
            Err(SchedulerError::StillRegistered(h(1)))
        );
    }

    #[test]
    fn clear_frees_credit_and_drains_others() {
        let mut s = scheduler(1);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.register_link(h(2), LinkType::Acl).unwrap();
        s.send_packet(head(h(1), 1), CH, Priority::Low).unwrap();
        s.send_packet(head(h(2), 2), CH, Priority::Low).unwrap();
        assert_eq!(sent_tags(&s), vec![1]);

        s.unregister_link(h(1)).unwrap();
        s.clear_controller_packet_count(h(1)).unwrap();
        assert!(s.pending_credit(h(1)).is_none());
        assert_eq!(sent_tags(&s), vec![1, 2]);
    }

    #[test]
    fn completion_after_clear_is_ignored() {
        let mut s = scheduler(1);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.register_link(h(2), LinkType::Acl).unwrap();
        s.send_packet(head(h(1), 1), CH, Priority::Low).unwrap();
        s.send_packet(head(h(2), 2), CH, Priority::Low).unwrap();
        s.unregister_link(h(1)).unwrap();
        s.clear_controller_packet_count(h(1)).unwrap();
        assert_eq!(s.outstanding(h(2)), 1);

        // The controller's late report for the cleared handle.
        s.on_packets_completed(&[(h(1), 1)]);
        assert_eq!(s.sent_count(PoolKind::Classic), 1);
        assert_eq!(s.outstanding(h(2)), 1);

        s.on_packets_completed(&[(h(2), 1)]);
        assert_eq!(s.sent_count(PoolKind::Classic), 0);
    }

    #[test]
    fn drop_queued_packets_by_channel() {
        let mut s = scheduler(0);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.send_packet(head(h(1), 1), CH, Priority::Low).unwrap();
        s.send_packet(head(h(1), 2), OTHER_CH, Priority::Low).unwrap();
        s.send_packet(head(h(1), 3), CH, Priority::High).unwrap();
        let dropped = s.drop_queued_packets(|p| p.channel == CH);
        assert_eq!(dropped, 2);
        let left: Vec<u8> = s.queued().map(|p| p.packet.payload[0]).collect();
        assert_eq!(left, vec![2]);
        assert_eq!(s.ledger().tokens_in_flight(), 1);
    }

    // ─── Overflow ───────────────────────────────────────────────────────

    fn saturate(s: &mut TestScheduler, handle: ConnectionHandle) {
        // Use up the only credit on a different channel.
        s.send_packet(head(handle, 0xFF), OTHER_CH, Priority::Low).unwrap();
        assert_eq!(s.spare_credits(PoolKind::Classic), 0);
    }

    #[test]
    fn overflow_evicts_oldest_pdu() {
        let mut s = scheduler(1);
        s.register_link(h(1), LinkType::Acl).unwrap();
        saturate(&mut s, h(1));
        for tag in 0..33u8 {
            s.send_packet(head(h(1), tag), CH, Priority::Low).unwrap();
        }
        assert_eq!(s.queued_len(), 32);
        assert_eq!(s.drop_count(h(1), CH), 1);
        assert_eq!(s.queued().next().map(|p| p.packet.payload[0]), Some(1));
    }

    #[test]
    fn overflow_eviction_takes_continuations() {
        let mut s = scheduler(1);
        s.register_link(h(1), LinkType::Acl).unwrap();
        saturate(&mut s, h(1));
        s.send_packets(vec![head(h(1), 0), cont(h(1), 100), cont(h(1), 101)], CH, Priority::Low)
            .unwrap();
        for tag in 1..33u8 {
            s.send_packet(head(h(1), tag), CH, Priority::Low).unwrap();
        }
        assert_eq!(s.queued_len(), 32);
        assert!(s.queued().all(|p| p.packet.is_head()));
        assert_eq!(s.stats().overflow_evictions, 1);
    }

    #[test]
    fn overflow_is_per_channel() {
        let mut s = scheduler(1);
        s.register_link(h(1), LinkType::Acl).unwrap();
        saturate(&mut s, h(1));
        for tag in 0..32u8 {
            s.send_packet(head(h(1), tag), CH, Priority::Low).unwrap();
        }
        s.send_packet(head(h(1), 99), OTHER_CH, Priority::Low).unwrap();
        assert_eq!(s.queued_len(), 33);
        assert_eq!(s.drop_count(h(1), CH), 0);
    }

    #[test]
    fn le_links_are_exempt_from_overflow() {
        let mut s = scheduler(1);
        s.register_link(h(2), LinkType::Le).unwrap();
        let le = |tag: u8| AclPacket::new(h(2), PacketBoundary::FirstNonFlushable, Bytes::from(vec![tag]));
        s.send_packet(le(0xFF), OTHER_CH, Priority::Low).unwrap();
        for tag in 0..40u8 {
            s.send_packet(le(tag), CH, Priority::Low).unwrap();
        }
        assert_eq!(s.queued_len(), 40);
        assert_eq!(s.drop_count(h(2), CH), 0);
    }

    #[test]
    fn repeated_overflow_counts_every_drop() {
        let (mut s, mock) = scheduler_with(BufferInfo::new(64, 1), None);
        s.register_link(h(1), LinkType::Acl).unwrap();
        saturate(&mut s, h(1));
        for tag in 0..40u8 {
            s.send_packet(head(h(1), tag), CH, Priority::Low).unwrap();
            mock.increment(Duration::from_millis(100));
        }
        assert_eq!(s.drop_count(h(1), CH), 8);
        assert_eq!(s.queued_len(), 32);
    }

    // ─── Fragmented PDUs ────────────────────────────────────────────────

    #[test]
    fn fragmented_pdu_is_sent_in_order() {
        let mut s = scheduler(8);
        s.register_link(h(3), LinkType::Acl).unwrap();
        let frags = fragment_pdu(h(3), LinkType::Acl, Bytes::from(vec![5u8; 150]), 64);
        s.send_packets(frags, CH, Priority::Low).unwrap();
        let sizes: Vec<usize> = s.transport().frames.iter().map(AclPacket::len).collect();
        assert_eq!(sizes, vec![64, 64, 22]);
        assert_eq!(s.outstanding(h(3)), 3);
    }

    // ─── Pass-Through ───────────────────────────────────────────────────

    #[test]
    fn priority_request_forwarded() {
        let mut s = scheduler(1);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.request_priority(h(1), LinkPriority::High).unwrap();
        assert_eq!(s.transport().priorities, vec![(h(1), LinkPriority::High)]);
        assert_eq!(
            s.request_priority(h(9), LinkPriority::High),
            Err(SchedulerError::NotRegistered(h(9)))
        );
    }

    #[test]
    fn refused_command_keeps_the_transport_error() {
        let mut s = scheduler(1);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.transport_mut().refuse_commands = true;
        let err = s.request_priority(h(1), LinkPriority::High).unwrap_err();
        let SchedulerError::Transport(transport) = &err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(
            transport.downcast_ref::<CommandRejected>(),
            Some(&CommandRejected(0x0C))
        );
        let chained = anyhow::Error::from(err);
        assert_eq!(
            format!("{chained:#}"),
            "transport rejected request: command rejected with status 0x0c"
        );
    }

    #[test]
    fn flush_timeout_validated_and_forwarded() {
        let mut s = scheduler(1);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.register_link(h(2), LinkType::Le).unwrap();
        s.set_flush_timeout(h(1), Duration::from_millis(10)).unwrap();
        assert_eq!(s.transport().flush_timeouts, vec![(h(1), 16)]);
        assert_eq!(
            s.set_flush_timeout(h(2), Duration::from_millis(10)),
            Err(SchedulerError::FlushTimeoutUnsupported(LinkType::Le))
        );
        assert!(matches!(
            s.set_flush_timeout(h(1), Duration::from_secs(2)),
            Err(SchedulerError::FlushTimeoutOutOfRange(_))
        ));
    }

    // ─── Tokens & Telemetry ─────────────────────────────────────────────

    #[test]
    fn tokens_track_queue_residency() {
        let (mut s, mock) = scheduler_with(BufferInfo::new(64, 1), None);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.send_packet(head(h(1), 1), CH, Priority::Low).unwrap();
        s.send_packet(head(h(1), 2), CH, Priority::Low).unwrap();
        assert_eq!(s.ledger().tokens_in_flight(), 1);
        assert_eq!(s.ledger().bytes_in_flight(), 4);

        mock.increment(Duration::from_millis(30));
        s.on_packets_completed(&[(h(1), 1)]);
        assert_eq!(s.ledger().tokens_in_flight(), 0);
        assert_eq!(
            s.ledger().age_quantiles(&[1.0]),
            Some(vec![Duration::from_millis(30)])
        );
    }

    #[test]
    fn telemetry_is_debounced() {
        let (mut s, mock) = scheduler_with(BufferInfo::new(64, 8), None);
        s.register_link(h(1), LinkType::Acl).unwrap();
        assert_eq!(s.next_telemetry_deadline(), None);

        s.send_packet(head(h(1), 1), CH, Priority::Low).unwrap();
        let deadline = s.next_telemetry_deadline().unwrap();
        s.send_packet(head(h(1), 2), CH, Priority::Low).unwrap();
        assert_eq!(s.next_telemetry_deadline(), Some(deadline));
        assert!(!s.poll_telemetry());
        assert!(s.telemetry().samples.is_empty());

        mock.increment(Duration::from_secs(1));
        assert!(s.poll_telemetry());
        assert_eq!(s.next_telemetry_deadline(), None);
        let names: Vec<&str> = s.telemetry().samples.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"acl.queue.bytes.p50"));
        assert!(names.contains(&"acl.queue.age_us.p99"));
        assert!(names.contains(&"acl.in_flight.tokens"));
    }

    #[test]
    fn telemetry_failures_are_swallowed() {
        let (mut s, mock) = scheduler_with(BufferInfo::new(64, 8), None);
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.send_packet(head(h(1), 1), CH, Priority::Low).unwrap();
        mock.increment(Duration::from_secs(2));
        s.telemetry.fail = true;
        assert!(s.poll_telemetry());
        assert!(s.stats().telemetry_failures > 0);
    }

    #[test]
    fn percentile_labels() {
        assert_eq!(percentile_label(0.5), "50");
        assert_eq!(percentile_label(0.99), "99");
        assert_eq!(percentile_label(0.999), "99.9");
    }

    #[test]
    fn snapshot_serializes() {
        let (mut s, _) = scheduler_with(BufferInfo::new(64, 1), Some(BufferInfo::new(27, 2)));
        s.register_link(h(1), LinkType::Acl).unwrap();
        s.send_packet(head(h(1), 1), CH, Priority::High).unwrap();
        s.send_packet(head(h(1), 2), CH, Priority::High).unwrap();
        let snap = s.snapshot();
        assert_eq!(snap.queued_high, 1);
        assert_eq!(snap.classic.sent, 1);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"registered_links\":1"));
        assert!(json.contains("\"le\":{"));
    }
}
