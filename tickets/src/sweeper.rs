//! Inactivity Sweeper: reclaims abandoned tickets.
//!
//! A background task independent of any ticket's workflow. Each tick scans
//! the open tickets and routes stale ones through the Close Orchestrator; a
//! ticket that disappears mid-sweep (closed by a racing manual close) is a
//! skip, not an error.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::close::{CloseOrchestrator, CloseReason, Initiator};
use crate::error::TicketError;
use crate::ticket::SharedTicketStore;

pub struct InactivitySweeper {
    registry: SharedTicketStore,
    orchestrator: Arc<CloseOrchestrator>,
    threshold: Duration,
    period: StdDuration,
}

impl InactivitySweeper {
    pub fn new(
        registry: SharedTicketStore,
        orchestrator: Arc<CloseOrchestrator>,
        threshold: StdDuration,
        period: StdDuration,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            threshold: Duration::from_std(threshold).unwrap_or_else(|_| Duration::minutes(15)),
            period,
        }
    }

    pub async fn start(self: Arc<Self>) {
        info!(period_secs = self.period.as_secs(), "starting inactivity sweeper");
        let mut tick = interval(self.period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            self.sweep_once(Utc::now()).await;
        }
    }

    /// One pass. Returns how many tickets this pass closed.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        // collect under a short lock, act outside it
        let stale: Vec<String> = {
            let registry = self.registry.lock().expect("registry lock");
            registry
                .list_open()
                .into_iter()
                .filter(|t| now - t.last_activity_at > self.threshold)
                .map(|t| t.id)
                .collect()
        };

        let mut closed = 0;
        for ticket_id in stale {
            match self
                .orchestrator
                .close(&ticket_id, &Initiator::System, CloseReason::Inactivity)
                .await
            {
                Ok(()) => {
                    info!(ticket_id = %ticket_id, "reclaimed inactive ticket");
                    closed += 1;
                }
                Err(TicketError::AlreadyClosed(_)) | Err(TicketError::NotFound(_)) => {
                    // lost the race to another closer
                    debug!(ticket_id = %ticket_id, "ticket vanished mid-sweep; skipping");
                }
                Err(e) => {
                    warn!(ticket_id = %ticket_id, error = %e, "sweep close failed");
                }
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::RecordingConnector;
    use crate::ticket::new_shared_ticket_store;

    fn harness(threshold: StdDuration) -> (SharedTicketStore, Arc<RecordingConnector>, Arc<InactivitySweeper>) {
        let registry = new_shared_ticket_store(100);
        let connector = Arc::new(RecordingConnector::new());
        let orchestrator = Arc::new(CloseOrchestrator::new(
            registry.clone(),
            connector.clone(),
            "ticket-log".to_string(),
        ));
        let sweeper = Arc::new(InactivitySweeper::new(
            registry.clone(),
            orchestrator,
            threshold,
            StdDuration::from_millis(50),
        ));
        (registry, connector, sweeper)
    }

    #[tokio::test]
    async fn stale_tickets_are_reclaimed_and_fresh_ones_kept() {
        let (registry, connector, sweeper) = harness(StdDuration::from_secs(15 * 60));
        let now = Utc::now();
        {
            let mut r = registry.lock().unwrap();
            r.create("chan-stale", "u1", "alice", now - Duration::minutes(20))
                .unwrap();
            r.create("chan-fresh", "u2", "bob", now - Duration::minutes(5))
                .unwrap();
        }

        let closed = sweeper.sweep_once(now).await;
        assert_eq!(closed, 1);

        let open: Vec<String> = registry
            .lock()
            .unwrap()
            .list_open()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(open, vec!["chan-fresh".to_string()]);
        assert_eq!(
            connector.deleted_channels.lock().unwrap().as_slice(),
            &[("chan-stale".to_string(), "inactivity".to_string())]
        );
    }

    #[tokio::test]
    async fn touch_defers_the_sweep() {
        let (registry, _connector, sweeper) = harness(StdDuration::from_secs(15 * 60));
        let t0 = Utc::now() - Duration::minutes(20);
        registry.lock().unwrap().create("chan-1", "u1", "alice", t0).unwrap();
        registry.lock().unwrap().touch("chan-1", Utc::now());

        assert_eq!(sweeper.sweep_once(Utc::now()).await, 0);
        assert_eq!(registry.lock().unwrap().list_open().len(), 1);
    }

    #[tokio::test]
    async fn racing_sweeps_close_exactly_once() {
        let (registry, connector, sweeper) = harness(StdDuration::from_secs(60));
        let now = Utc::now();
        registry
            .lock()
            .unwrap()
            .create("chan-1", "u1", "alice", now - Duration::minutes(10))
            .unwrap();

        let a = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.sweep_once(Utc::now()).await })
        };
        let b = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.sweep_once(Utc::now()).await })
        };
        let total = a.await.unwrap() + b.await.unwrap();
        assert_eq!(total, 1, "the losing sweep must skip cleanly");
        assert_eq!(connector.channel_messages("ticket-log").len(), 1);
    }

    #[tokio::test]
    async fn background_loop_reclaims_without_manual_ticks() {
        let (registry, _connector, sweeper) = harness(StdDuration::from_millis(10));
        registry
            .lock()
            .unwrap()
            .create("chan-1", "u1", "alice", Utc::now() - Duration::seconds(5))
            .unwrap();

        let handle = tokio::spawn(sweeper.clone().start());
        for _ in 0..20 {
            if registry.lock().unwrap().list_open().is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(25)).await;
        }
        handle.abort();
        assert!(registry.lock().unwrap().list_open().is_empty());
    }
}
