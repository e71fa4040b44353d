//! Collaborators the scheduler drives: the controller transport and the
//! telemetry exporter.

use anyhow::{bail, Result};
use bytes::Bytes;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::packet::ConnectionHandle;

/// Link priority hint forwarded to the controller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkPriority {
    #[default]
    Normal,
    /// Request that the controller favour this link (e.g. an audio sink).
    High,
}

/// Write side of the controller transport.
///
/// Writes are synchronous from the scheduler's point of view: a returned
/// `Ok` means the frame has been handed to the controller.
pub trait TransportSink {
    /// Hand one encoded ACL frame to the controller.
    fn write(&mut self, frame: Bytes) -> Result<()>;

    /// Forward a link priority hint. Transports without a command path
    /// reject it.
    fn set_link_priority(&mut self, handle: ConnectionHandle, priority: LinkPriority) -> Result<()> {
        let _ = (handle, priority);
        bail!("link priority requests are not supported by this transport")
    }

    /// Write the automatic flush timeout for a classic link, in 0.625 ms slots
    /// (0 disables flushing).
    fn write_flush_timeout(&mut self, handle: ConnectionHandle, slots: u16) -> Result<()> {
        let _ = (handle, slots);
        bail!("flush timeout requests are not supported by this transport")
    }
}

/// A transport command failure, with the transport's error chain intact.
#[derive(Debug, Clone)]
pub struct TransportError(Arc<anyhow::Error>);

impl TransportError {
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Downcast to the transport's own error type or any context it added.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("transport rejected request")
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        let inner: &(dyn StdError + 'static) = (*self.0).as_ref();
        Some(inner)
    }
}

/// Two values are equal only when they share the same underlying failure.
impl PartialEq for TransportError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TransportError {}

impl<T: TransportSink + ?Sized> TransportSink for Box<T> {
    fn write(&mut self, frame: Bytes) -> Result<()> {
        (**self).write(frame)
    }

    fn set_link_priority(&mut self, handle: ConnectionHandle, priority: LinkPriority) -> Result<()> {
        (**self).set_link_priority(handle, priority)
    }

    fn write_flush_timeout(&mut self, handle: ConnectionHandle, slots: u16) -> Result<()> {
        (**self).write_flush_timeout(handle, slots)
    }
}

/// Destination for named numeric samples. Failures are never propagated past
/// the scheduler.
pub trait TelemetrySink {
    fn record(&mut self, name: &str, value: f64) -> Result<()>;
}

impl<T: TelemetrySink + ?Sized> TelemetrySink for Box<T> {
    fn record(&mut self, name: &str, value: f64) -> Result<()> {
        (**self).record(name, value)
    }
}

/// Telemetry sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn record(&mut self, _name: &str, _value: f64) -> Result<()> {
        Ok(())
    }
}

/// One flush-timeout slot.
pub const FLUSH_TIMEOUT_SLOT: Duration = Duration::from_micros(625);

/// Largest automatic flush timeout, in slots.
pub const MAX_FLUSH_TIMEOUT_SLOTS: u16 = 0x07FF;

/// Convert a flush timeout to controller slots, rounding to the nearest slot
/// and never turning a non-zero timeout into "infinite". `None` when the
/// timeout exceeds the controller's range.
pub fn flush_timeout_slots(timeout: Duration) -> Option<u16> {
    if timeout.is_zero() {
        return Some(0);
    }
    let slot_us = FLUSH_TIMEOUT_SLOT.as_micros();
    let slots = (timeout.as_micros() + slot_us / 2) / slot_us;
    let slots = slots.max(1);
    if slots > MAX_FLUSH_TIMEOUT_SLOTS as u128 {
        None
    } else {
        Some(slots as u16)
    }
}
