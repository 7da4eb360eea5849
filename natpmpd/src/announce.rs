//! Scheduling of external address announcements.
//!
//! After the external address changes, clients are told about it by a burst of
//! [`ANNOUNCE_DELAYS`]`.len()` unsolicited packets with exponentially growing gaps. A new
//! change while a burst is in progress starts over from the first delay.

use std::{net::Ipv4Addr, pin::Pin};

use natpmpd_proto::nat_pmp::Response;
use tokio::time::{Sleep, sleep};

use crate::defaults::ANNOUNCE_DELAYS;

/// Timer driving one announcement burst.
#[derive(Debug, Default)]
pub struct Announcer {
    /// Index into [`ANNOUNCE_DELAYS`] of the next announcement.
    next: usize,
    timer: Option<Pin<Box<Sleep>>>,
}

impl Announcer {
    /// Create an idle announcer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new burst, superseding any burst in progress.
    pub fn restart(&mut self) {
        self.next = 0;
        self.arm();
    }

    /// Stop the burst in progress, if any.
    pub fn cancel(&mut self) {
        self.timer = None;
    }

    /// Whether an announcement is scheduled.
    pub fn is_active(&self) -> bool {
        self.timer.is_some()
    }

    /// Number of announcements of the current burst already sent.
    pub fn sent(&self) -> usize {
        self.next
    }

    /// Wait until the next announcement is due.
    ///
    /// Never completes while idle. After it completes, [`Announcer::advance`] must be called
    /// once the announcement is sent.
    pub async fn wait(&mut self) {
        match self.timer.as_mut() {
            Some(timer) => timer.await,
            None => std::future::pending().await,
        }
    }

    /// Move on to the next delay, going idle after the last one.
    pub fn advance(&mut self) {
        self.next += 1;
        self.arm();
    }

    fn arm(&mut self) {
        self.timer = ANNOUNCE_DELAYS
            .get(self.next)
            .map(|delay| Box::pin(sleep(*delay)));
    }
}

/// The announcement packet for `address`.
pub fn announcement(epoch_time: u32, address: Ipv4Addr) -> Vec<u8> {
    Response::announce(epoch_time, address).encode()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use data_encoding::HEXLOWER;
    use tokio::time::Instant;

    use super::*;

    /// Runs `n` announcements of the current burst, returning when each fired relative to
    /// `start`.
    async fn run(announcer: &mut Announcer, start: Instant, n: usize) -> Vec<Duration> {
        let mut fired = Vec::new();
        for _ in 0..n {
            announcer.wait().await;
            fired.push(start.elapsed());
            announcer.advance();
        }
        fired
    }

    /// Timers resolve to whole milliseconds.
    fn assert_fired_at(fired: &[Duration], expected: &[Duration]) {
        assert_eq!(fired.len(), expected.len());
        for (fired, expected) in fired.iter().zip(expected) {
            assert!(
                *fired >= *expected && *fired <= *expected + Duration::from_millis(10),
                "fired at {fired:?}, expected {expected:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_burst() {
        let mut announcer = Announcer::new();
        assert!(!announcer.is_active());

        let start = Instant::now();
        announcer.restart();
        let fired = run(&mut announcer, start, ANNOUNCE_DELAYS.len()).await;

        let mut expected = Vec::new();
        let mut total = Duration::ZERO;
        for delay in ANNOUNCE_DELAYS {
            total += delay;
            expected.push(total);
        }
        assert_fired_at(&fired, &expected);
        assert_eq!(announcer.sent(), 10);
        assert!(!announcer.is_active());

        // idle announcers never fire
        let res = tokio::time::timeout(Duration::from_secs(3600), announcer.wait()).await;
        assert!(res.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_supersedes_burst() {
        let mut announcer = Announcer::new();
        let start = Instant::now();
        announcer.restart();
        run(&mut announcer, start, 4).await;
        assert_eq!(announcer.sent(), 4);

        // a new address shows up halfway
        let start = Instant::now();
        announcer.restart();
        assert_eq!(announcer.sent(), 0);
        let fired = run(&mut announcer, start, 2).await;
        assert_fired_at(&fired, &[Duration::ZERO, Duration::from_millis(250)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let mut announcer = Announcer::new();
        announcer.restart();
        announcer.cancel();
        assert!(!announcer.is_active());
        let res = tokio::time::timeout(Duration::from_secs(1), announcer.wait()).await;
        assert!(res.is_err());
    }

    #[test]
    fn test_announcement_packet() {
        let packet = announcement(42, Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(HEXLOWER.encode(&packet), "008000000000002ac0000201");
    }
}
