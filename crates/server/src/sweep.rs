//! Sweep scheduler - fixed-cadence background aging of idle sessions.
//!
//! Runs independently of connection activity. Each tick takes a single
//! `now` snapshot and performs two idempotent bulk transitions: long-idle
//! ACTIVE sessions become INACTIVE, and longer-idle ACTIVE or INACTIVE
//! sessions become CLOSED. CLOSED rows are excluded from both predicates,
//! so a sweep can never regress a closed session.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{info, warn};

use crate::persistence::SessionStore;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    pub inactivity_timeout_secs: i64,
    pub close_after_secs: i64,
}

impl SweepConfig {
    /// Reject misconfigured thresholds. A negative idle window would make
    /// the cutoff comparisons meaningless, so the sweeper refuses to run
    /// instead.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.inactivity_timeout_secs < 0 {
            anyhow::bail!(
                "inactivity timeout must be a non-negative number of seconds, got {}",
                self.inactivity_timeout_secs
            );
        }
        if self.close_after_secs < 0 {
            anyhow::bail!(
                "close threshold must be a non-negative number of seconds, got {}",
                self.close_after_secs
            );
        }
        Ok(())
    }
}

pub struct Sweeper {
    store: SessionStore,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(store: SessionStore, config: SweepConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// Run forever on the configured cadence. Call from `tokio::spawn`.
    pub async fn run(self) {
        info!(
            component = "sweep",
            event = "sweep.started",
            interval_secs = self.config.interval.as_secs(),
            inactivity_timeout_secs = self.config.inactivity_timeout_secs,
            close_after_secs = self.config.close_after_secs,
            "Sweep scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            interval.tick().await;
            self.tick(Utc::now()).await;
        }
    }

    /// One sweep pass against a single `now` snapshot.
    ///
    /// A store error abandons the tick; the next tick proceeds
    /// independently. No retry, no backlog.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let inactive_cutoff =
            cutoff_rfc3339(now - chrono::Duration::seconds(self.config.inactivity_timeout_secs));
        let close_cutoff =
            cutoff_rfc3339(now - chrono::Duration::seconds(self.config.close_after_secs));

        let aged = match self.store.sweep_inactive(&inactive_cutoff).await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    component = "sweep",
                    event = "sweep.tick_failed",
                    error = %e,
                    "Inactivity sweep failed, abandoning tick"
                );
                return;
            }
        };

        let closed = match self.store.sweep_close(&close_cutoff).await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    component = "sweep",
                    event = "sweep.tick_failed",
                    error = %e,
                    "Close sweep failed, abandoning tick"
                );
                return;
            }
        };

        if aged > 0 || closed > 0 {
            info!(
                component = "sweep",
                event = "sweep.tick_complete",
                marked_inactive = aged,
                closed = closed,
                "Sweep tick transitioned sessions"
            );
        }
    }
}

fn cutoff_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
