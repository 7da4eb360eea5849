//! Watches the external interface for address changes.
//!
//! On Linux the kernel reports changes over rtnetlink. Elsewhere the interface is simply
//! re-checked periodically; the daemon ignores checks that find the address unchanged.

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(target_os = "linux"))]
mod polling;

#[cfg(target_os = "linux")]
use self::linux as os;
#[cfg(not(target_os = "linux"))]
use self::polling as os;

/// Something happened that may have changed the external address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceEvent {
    /// An IPv4 address of the interface was added or removed.
    AddressChanged,
    /// The interface went away.
    Departed,
    /// Periodic re-check.
    Tick,
}

/// Failure to start watching the interface.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum MonitorError {
    #[snafu(display("failed to open route socket"))]
    Socket { source: std::io::Error },
}

/// A running interface monitor, stopped when dropped.
#[derive(Debug)]
pub struct Monitor {
    _tasks: Vec<AbortOnDropHandle<()>>,
}

impl Monitor {
    /// Start watching `interface`, reporting to `sender`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        interface: String,
        sender: mpsc::Sender<InterfaceEvent>,
    ) -> Result<Self, MonitorError> {
        let tasks = os::spawn(interface, sender)?;
        Ok(Self { _tasks: tasks })
    }
}
