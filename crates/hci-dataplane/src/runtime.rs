use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use hci_flow::scheduler::SchedulerSnapshot;
use hci_flow::{
    AclPacket, ChannelId, ConnectionHandle, LinkPriority, LinkType, Priority, Scheduler,
    SchedulerError, TelemetrySink, TransportSink,
};
use quanta::Instant;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{DataPlaneConfig, RuntimeConfig};

/// Error returned when a batch cannot be handed to the data plane worker.
#[derive(Debug)]
pub enum PacketSendError {
    Full,
    Disconnected,
}

/// Hot-path batch sent via lock-free SPSC ring buffer.
struct PacketBatch {
    packets: Vec<AclPacket>,
    channel: ChannelId,
    priority: Priority,
}

type Reply<T = ()> = Sender<Result<T, SchedulerError>>;

/// Control messages sent via crossbeam channel.
enum ControlMessage {
    RegisterLink {
        handle: ConnectionHandle,
        link_type: LinkType,
        reply: Reply,
    },
    UnregisterLink {
        handle: ConnectionHandle,
        reply: Reply,
    },
    ClearControllerPacketCount {
        handle: ConnectionHandle,
        reply: Reply,
    },
    DropChannel {
        handle: ConnectionHandle,
        channel: ChannelId,
        reply: Reply<usize>,
    },
    PacketsCompleted(Vec<(ConnectionHandle, u16)>),
    BufferOverflow(LinkType),
    RequestPriority {
        handle: ConnectionHandle,
        priority: LinkPriority,
        reply: Reply,
    },
    SetFlushTimeout {
        handle: ConnectionHandle,
        timeout: Duration,
        reply: Reply,
    },
    Shutdown,
}

/// What the worker last published.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DataPlaneSnapshot {
    /// False once the worker has exited.
    pub running: bool,
    /// Batches taken off the packet ring.
    pub batches_received: u64,
    /// Of those, batches the scheduler refused.
    pub batches_rejected: u64,
    /// Control messages handled.
    pub control_messages: u64,
    /// `None` until the worker has published once.
    pub scheduler: Option<SchedulerSnapshot>,
}

impl DataPlaneSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Thread-safe handle to the data plane worker.
///
/// Owns a background thread that builds a [`Scheduler`] and runs it for the
/// life of the runtime. Every scheduler operation happens on that thread.
///
/// **Hot path** (packet batches) uses a lock-free SPSC ring buffer (`rtrb`).
/// **Control path** (links, completions, pass-through requests, shutdown)
/// uses a bounded crossbeam channel; calls that can be rejected wait for the
/// worker's answer.
///
/// Dropping the runtime triggers a graceful shutdown of the worker thread.
pub struct DataPlaneRuntime {
    packet_tx: rtrb::Producer<PacketBatch>,
    control_tx: Sender<ControlMessage>,
    shutdown: Arc<AtomicBool>,
    snapshot: Arc<Mutex<DataPlaneSnapshot>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DataPlaneRuntime {
    /// Spawn a worker whose scheduler is built from `config`, with sinks made
    /// by `make_sinks` on the worker thread.
    pub fn from_config<T, M, F>(config: DataPlaneConfig, make_sinks: F) -> Result<Self>
    where
        T: TransportSink + 'static,
        M: TelemetrySink + 'static,
        F: FnOnce() -> Result<(T, M)> + Send + 'static,
    {
        let runtime = config.runtime;
        Self::spawn(runtime, move || {
            let (transport, telemetry) = make_sinks()?;
            config.build_scheduler(transport, telemetry)
        })
    }

    /// Spawn a worker that runs the scheduler returned by `factory`.
    ///
    /// The factory runs on the worker thread, so the scheduler and its sinks
    /// need not be `Send`. Returns its error if it fails.
    pub fn spawn<T, M, F>(config: RuntimeConfig, factory: F) -> Result<Self>
    where
        T: TransportSink + 'static,
        M: TelemetrySink + 'static,
        F: FnOnce() -> Result<Scheduler<T, M>> + Send + 'static,
    {
        let (packet_tx, packet_rx) = rtrb::RingBuffer::new(config.channel_capacity);
        let (control_tx, control_rx) = bounded(64);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let snapshot = Arc::new(Mutex::new(DataPlaneSnapshot::default()));
        let snapshot_clone = snapshot.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("hci-dataplane".into())
            .spawn(move || {
                let scheduler = match factory() {
                    Ok(scheduler) => {
                        publish(&snapshot_clone, &scheduler, &WorkerCounters::default(), true);
                        let _ = ready_tx.send(Ok(()));
                        scheduler
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let fatal_snapshot = snapshot_clone.clone();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    runtime_worker(
                        scheduler,
                        packet_rx,
                        control_rx,
                        snapshot_clone,
                        config,
                        shutdown_clone,
                    )
                }));
                if let Err(payload) = outcome {
                    abort_on_fatal(&fatal_snapshot, payload.as_ref());
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = handle.join();
                return Err(err.context("building data plane scheduler"));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(anyhow!("data plane worker exited during startup"));
            }
        }

        Ok(Self {
            packet_tx,
            control_tx,
            shutdown,
            snapshot,
            handle: Some(handle),
        })
    }

    /// Enqueue a batch for the scheduler. Returns immediately.
    ///
    /// Admission errors are reported by the worker's log and counted in
    /// [`DataPlaneSnapshot::batches_rejected`], not returned here.
    pub fn try_send_packets(
        &mut self,
        packets: Vec<AclPacket>,
        channel: ChannelId,
        priority: Priority,
    ) -> Result<(), PacketSendError> {
        if self.shutdown.load(Ordering::Relaxed) || self.worker_exited() {
            return Err(PacketSendError::Disconnected);
        }
        self.packet_tx
            .push(PacketBatch {
                packets,
                channel,
                priority,
            })
            .map_err(|_| PacketSendError::Full)
    }

    pub fn register_link(&self, handle: ConnectionHandle, link_type: LinkType) -> Result<()> {
        self.request(|reply| ControlMessage::RegisterLink {
            handle,
            link_type,
            reply,
        })
    }

    pub fn unregister_link(&self, handle: ConnectionHandle) -> Result<()> {
        self.request(|reply| ControlMessage::UnregisterLink { handle, reply })
    }

    pub fn clear_controller_packet_count(&self, handle: ConnectionHandle) -> Result<()> {
        self.request(|reply| ControlMessage::ClearControllerPacketCount { handle, reply })
    }

    /// Discard everything queued on `(handle, channel)`. Returns how many
    /// packets were dropped.
    pub fn drop_channel(&self, handle: ConnectionHandle, channel: ChannelId) -> Result<usize> {
        self.request(|reply| ControlMessage::DropChannel {
            handle,
            channel,
            reply,
        })
    }

    pub fn request_priority(&self, handle: ConnectionHandle, priority: LinkPriority) -> Result<()> {
        self.request(|reply| ControlMessage::RequestPriority {
            handle,
            priority,
            reply,
        })
    }

    pub fn set_flush_timeout(&self, handle: ConnectionHandle, timeout: Duration) -> Result<()> {
        self.request(|reply| ControlMessage::SetFlushTimeout {
            handle,
            timeout,
            reply,
        })
    }

    /// Forward a Number-Of-Completed-Packets event. Completing more packets
    /// than a handle has outstanding aborts the process.
    pub fn packets_completed(&self, completions: Vec<(ConnectionHandle, u16)>) -> Result<()> {
        self.send_control(ControlMessage::PacketsCompleted(completions))
    }

    /// Forward a controller data-buffer-overflow event. The worker aborts the
    /// process when it handles it.
    pub fn buffer_overflow(&self, link_type: LinkType) -> Result<()> {
        self.send_control(ControlMessage::BufferOverflow(link_type))
    }

    /// Last snapshot the worker published (thread-safe clone).
    pub fn snapshot(&self) -> DataPlaneSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Shared handle to the snapshot for external polling.
    pub fn snapshot_handle(&self) -> Arc<Mutex<DataPlaneSnapshot>> {
        self.snapshot.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.worker_exited()
    }

    fn worker_exited(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    fn send_control(&self, msg: ControlMessage) -> Result<()> {
        self.control_tx
            .send(msg)
            .map_err(|_| anyhow!("data plane worker has exited"))
    }

    fn request<R>(&self, make: impl FnOnce(Reply<R>) -> ControlMessage) -> Result<R> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send_control(make(reply_tx))?;
        let answer = reply_rx
            .recv()
            .map_err(|_| anyhow!("data plane worker exited before replying"))?;
        Ok(answer?)
    }

    /// Gracefully shuts down the worker thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.control_tx.send(ControlMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("data plane worker panicked");
            }
        }
    }
}

impl Drop for DataPlaneRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Default)]
struct WorkerCounters {
    batches_received: u64,
    batches_rejected: u64,
    control_messages: u64,
}

fn runtime_worker<T: TransportSink, M: TelemetrySink>(
    mut scheduler: Scheduler<T, M>,
    mut packet_rx: rtrb::Consumer<PacketBatch>,
    control_rx: Receiver<ControlMessage>,
    snapshot: Arc<Mutex<DataPlaneSnapshot>>,
    config: RuntimeConfig,
    shutdown: Arc<AtomicBool>,
) {
    info!(capacity = config.channel_capacity, "data plane worker started");
    let mut counters = WorkerCounters::default();
    let mut last_publish = Instant::now();

    loop {
        // Hot path: drain all available batches from SPSC ring buffer
        drain_packets(&mut scheduler, &mut packet_rx, &mut counters);

        match control_rx.try_recv() {
            Ok(msg) => {
                // Batches pushed before this message are visible now; apply
                // them first so callers see their own ordering.
                drain_packets(&mut scheduler, &mut packet_rx, &mut counters);
                counters.control_messages += 1;
                let ControlOutcome::Continue(reply) = handle_control(&mut scheduler, msg) else {
                    break;
                };
                publish(&snapshot, &scheduler, &counters, true);
                last_publish = Instant::now();
                if let Some(reply) = reply {
                    reply.deliver();
                }
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => break,
        }

        scheduler.poll_telemetry();

        if packet_rx.is_empty() && shutdown.load(Ordering::Relaxed) {
            break;
        }

        if last_publish.elapsed() >= config.snapshot_interval {
            publish(&snapshot, &scheduler, &counters, true);
            last_publish = Instant::now();
        }

        // Brief yield when idle to avoid burning CPU
        if packet_rx.is_empty() && control_rx.is_empty() {
            thread::sleep(Duration::from_micros(100));
        }
    }

    publish(&snapshot, &scheduler, &counters, false);
    info!(
        batches = counters.batches_received,
        rejected = counters.batches_rejected,
        "data plane worker stopped"
    );
}

fn drain_packets<T: TransportSink, M: TelemetrySink>(
    scheduler: &mut Scheduler<T, M>,
    packet_rx: &mut rtrb::Consumer<PacketBatch>,
    counters: &mut WorkerCounters,
) {
    while let Ok(batch) = packet_rx.pop() {
        counters.batches_received += 1;
        if scheduler
            .send_packets(batch.packets, batch.channel, batch.priority)
            .is_err()
        {
            counters.batches_rejected += 1;
        }
    }
}

/// A reply held back until the worker has published the state it reflects.
enum PendingReply {
    Unit(Reply, Result<(), SchedulerError>),
    Count(Reply<usize>, usize),
}

impl PendingReply {
    fn deliver(self) {
        match self {
            PendingReply::Unit(reply, result) => {
                let _ = reply.send(result);
            }
            PendingReply::Count(reply, count) => {
                let _ = reply.send(Ok(count));
            }
        }
    }
}

enum ControlOutcome {
    Continue(Option<PendingReply>),
    Shutdown,
}

fn handle_control<T: TransportSink, M: TelemetrySink>(
    scheduler: &mut Scheduler<T, M>,
    msg: ControlMessage,
) -> ControlOutcome {
    let reply = match msg {
        ControlMessage::RegisterLink {
            handle,
            link_type,
            reply,
        } => PendingReply::Unit(reply, scheduler.register_link(handle, link_type)),
        ControlMessage::UnregisterLink { handle, reply } => {
            PendingReply::Unit(reply, scheduler.unregister_link(handle))
        }
        ControlMessage::ClearControllerPacketCount { handle, reply } => {
            PendingReply::Unit(reply, scheduler.clear_controller_packet_count(handle))
        }
        ControlMessage::DropChannel {
            handle,
            channel,
            reply,
        } => {
            let dropped =
                scheduler.drop_queued_packets(|p| p.handle() == handle && p.channel == channel);
            debug!(%handle, %channel, dropped, "channel queue dropped");
            PendingReply::Count(reply, dropped)
        }
        ControlMessage::PacketsCompleted(completions) => {
            scheduler.on_packets_completed(&completions);
            return ControlOutcome::Continue(None);
        }
        ControlMessage::BufferOverflow(link_type) => scheduler.on_buffer_overflow(link_type),
        ControlMessage::RequestPriority {
            handle,
            priority,
            reply,
        } => PendingReply::Unit(reply, scheduler.request_priority(handle, priority)),
        ControlMessage::SetFlushTimeout {
            handle,
            timeout,
            reply,
        } => {
            let result = scheduler.set_flush_timeout(handle, timeout);
            if let Err(err) = &result {
                warn!(%handle, ?timeout, error = %err, "flush timeout rejected");
            }
            PendingReply::Unit(reply, result)
        }
        ControlMessage::Shutdown => return ControlOutcome::Shutdown,
    };
    ControlOutcome::Continue(Some(reply))
}

/// Ends the process after a scheduler panic, whatever the panic strategy.
fn abort_on_fatal(snapshot: &Mutex<DataPlaneSnapshot>, payload: &(dyn Any + Send)) -> ! {
    let reason = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic");
    error!(reason, "fatal data plane fault, aborting");
    snapshot.lock().unwrap_or_else(|e| e.into_inner()).running = false;
    process::abort()
}

fn publish<T: TransportSink, M: TelemetrySink>(
    snapshot: &Mutex<DataPlaneSnapshot>,
    scheduler: &Scheduler<T, M>,
    counters: &WorkerCounters,
    running: bool,
) {
    let next = DataPlaneSnapshot {
        running,
        batches_received: counters.batches_received,
        batches_rejected: counters.batches_rejected,
        control_messages: counters.control_messages,
        scheduler: Some(scheduler.snapshot()),
    };
    if let Ok(mut s) = snapshot.lock() {
        *s = next;
    }
}
