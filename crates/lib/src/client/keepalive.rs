//! Keepalive monitor: a periodic tick while connected.
//!
//! The monitor only says when to probe. It never declares the link dead; loss is detected by
//! the transport reporting a close or an error.

use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

pub struct KeepaliveMonitor {
    period: Duration,
    ticker: Option<Interval>,
}

impl KeepaliveMonitor {
    /// A zero period disables probing.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            ticker: None,
        }
    }

    /// Start ticking; the first tick comes one full period from now.
    pub fn start(&mut self) {
        if self.period.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
    }

    pub fn stop(&mut self) {
        self.ticker = None;
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Resolves at the next probe time; never resolves while stopped.
    pub async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
