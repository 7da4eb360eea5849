use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, info_span};

use super::{InterfaceEvent, MonitorError};
use crate::defaults::timeouts::INTERFACE_RECHECK_INTERVAL;

pub(super) fn spawn(
    interface: String,
    sender: mpsc::Sender<InterfaceEvent>,
) -> Result<Vec<AbortOnDropHandle<()>>, MonitorError> {
    debug!(%interface, interval = ?INTERFACE_RECHECK_INTERVAL, "polling interface");
    let task = tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(INTERFACE_RECHECK_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes right away, the daemon checks at startup anyway
            interval.tick().await;
            loop {
                interval.tick().await;
                if sender.send(InterfaceEvent::Tick).await.is_err() {
                    break;
                }
            }
        }
        .instrument(info_span!("netmon.polling")),
    );
    Ok(vec![AbortOnDropHandle::new(task)])
}
