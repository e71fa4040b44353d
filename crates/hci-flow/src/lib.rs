//! # hci-flow
//!
//! Host-side ACL data plane for a Bluetooth controller.
//!
//! Credit-based flow control toward the controller's packet buffers, a
//! two-level priority send queue with per-channel overflow eviction, and a
//! token ledger that measures how long packets sit in the queue.
//!
//! ## Crate structure
//!
//! - [`packet`]: ACL framing, handles, channels, PDU fragmentation
//! - [`credit`]: Controller buffer pools and per-handle outstanding counts
//! - [`stats`]: Retirement log with high-biased quantiles
//! - [`token`]: Token ledger, one-shot threshold alerts
//! - [`transport`]: Transport and telemetry collaborator traits
//! - [`scheduler`]: Outbound packet scheduler

pub mod credit;
pub mod packet;
pub mod scheduler;
pub mod stats;
pub mod token;
pub mod transport;

pub use credit::{BufferInfo, PoolKind};
pub use packet::{AclPacket, ChannelId, ConnectionHandle, LinkType, PacketBoundary, Priority};
pub use scheduler::{ControllerBuffers, Scheduler, SchedulerConfig, SchedulerError};
pub use stats::RetirementLog;
pub use token::{Alert, AlertThreshold, Token, TokenLedger};
pub use transport::{LinkPriority, NullTelemetry, TelemetrySink, TransportError, TransportSink};
