use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crawlterm_protocol::ClientMessage;

use crate::log::now_epoch_ms;

/// Outcome of a heartbeat tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Beat {
    Ping(ClientMessage),
    /// `missed` consecutive intervals went unacknowledged.
    Expired { missed: u32 },
}

/// Emits heartbeat pings while the connection is open.
///
/// The interval only exists between `start` and `stop`, so no tick can fire
/// after the transport leaves `Open`. Missed acknowledgments are counted;
/// they only turn into [`Beat::Expired`] when `max_missed` is set.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    period: Duration,
    max_missed: Option<u32>,
    interval: Option<Interval>,
    awaiting_ack: bool,
    missed: u32,
    last_ack: Option<Instant>,
    sent: u64,
}

impl HeartbeatMonitor {
    pub fn new(period: Duration, max_missed: Option<u32>) -> Self {
        Self {
            period,
            max_missed,
            interval: None,
            awaiting_ack: false,
            missed: 0,
            last_ack: None,
            sent: 0,
        }
    }

    pub fn start(&mut self) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
        self.awaiting_ack = false;
        self.missed = 0;
    }

    pub fn stop(&mut self) {
        self.interval = None;
        self.awaiting_ack = false;
        self.missed = 0;
    }

    pub fn is_active(&self) -> bool {
        self.interval.is_some()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn since_last_ack(&self) -> Option<Duration> {
        self.last_ack.map(|at| at.elapsed())
    }

    /// Wait for the next tick. Pends forever while stopped.
    pub async fn tick(&mut self) -> Beat {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
        self.on_tick()
    }

    fn on_tick(&mut self) -> Beat {
        if self.awaiting_ack {
            self.missed += 1;
            if self.max_missed.is_some_and(|max| self.missed >= max) {
                return Beat::Expired {
                    missed: self.missed,
                };
            }
        }
        self.awaiting_ack = true;
        self.sent += 1;
        Beat::Ping(ClientMessage::Ping {
            timestamp: now_epoch_ms(),
            heartbeat: true,
        })
    }

    pub fn acknowledge(&mut self) {
        self.awaiting_ack = false;
        self.missed = 0;
        self.last_ack = Some(Instant::now());
    }
}
