//! Background expiry of simulation sessions.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::session::{ReapReport, SessionManager};

/// Periodically expires overdue sessions and purges finished ones.
pub struct SessionReaper {
    sessions: SessionManager,
    interval: Duration,
}

impl SessionReaper {
    pub fn new(sessions: SessionManager, interval: Duration) -> Self {
        Self { sessions, interval }
    }

    /// One reaping pass.
    pub fn tick(&self) -> ReapReport {
        let report = self.sessions.reap(Instant::now());
        if report.expired > 0 || report.purged > 0 {
            info!(
                expired = report.expired,
                purged = report.purged,
                "sessions reaped"
            );
        } else {
            debug!("reaper pass found nothing to do");
        }
        report
    }

    /// Run until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "session reaper started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.tick();
                }
                _ = shutdown.changed() => {
                    info!("session reaper shutting down");
                    break;
                }
            }
        }
    }
}
