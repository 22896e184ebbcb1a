//! Close Orchestrator: the single entry point for terminating a ticket.
//!
//! Every close path (manual command, close control, inactivity sweep) funnels
//! through [`CloseOrchestrator::close`]. The compare-and-set transition to
//! CLOSED decides the race: exactly one caller performs transcript capture
//! and resource teardown, every other caller observes `AlreadyClosed` and
//! no-ops. Losing a transcript never prevents closing a ticket.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::connector::ChatConnector;
use crate::error::TicketError;
use crate::ticket::{SharedTicketStore, Ticket, TicketEvent};

/// Who asked for the close.
#[derive(Debug, Clone)]
pub enum Initiator {
    User { id: String, admin: bool },
    /// The sweeper or another automated path.
    System,
}

impl Initiator {
    pub fn admin(id: impl Into<String>) -> Self {
        Initiator::User {
            id: id.into(),
            admin: true,
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Initiator::User {
            id: id.into(),
            admin: false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Initiator::User { id, .. } => id.clone(),
            Initiator::System => "system".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Manual,
    Inactivity,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Manual => "manual",
            CloseReason::Inactivity => "inactivity",
        }
    }
}

pub struct CloseOrchestrator {
    registry: SharedTicketStore,
    connector: Arc<dyn ChatConnector>,
    log_channel_id: String,
}

impl CloseOrchestrator {
    pub fn new(
        registry: SharedTicketStore,
        connector: Arc<dyn ChatConnector>,
        log_channel_id: String,
    ) -> Self {
        Self {
            registry,
            connector,
            log_channel_id,
        }
    }

    /// Closes a ticket exactly once.
    pub async fn close(
        &self,
        ticket_id: &str,
        initiator: &Initiator,
        reason: CloseReason,
    ) -> Result<(), TicketError> {
        // authorization first: an unauthorized caller changes no state
        let owner_id = {
            let registry = self.registry.lock().expect("registry lock");
            registry
                .get(ticket_id)
                .ok_or_else(|| TicketError::NotFound(ticket_id.to_string()))?
                .owner_id
        };
        match initiator {
            Initiator::System => {}
            Initiator::User { id, admin } => {
                if !admin && *id != owner_id {
                    return Err(TicketError::Unauthorized {
                        initiator: id.clone(),
                        action: format!("close ticket {}", ticket_id),
                    });
                }
            }
        }

        // the CAS: exactly one caller reaches the teardown below
        let ticket = {
            let mut registry = self.registry.lock().expect("registry lock");
            registry.transition(ticket_id, TicketEvent::CloseRequested, Utc::now())?;
            registry
                .get(ticket_id)
                .ok_or_else(|| TicketError::NotFound(ticket_id.to_string()))?
        };
        info!(
            ticket_id,
            initiator = %initiator.describe(),
            reason = reason.as_str(),
            "closing ticket"
        );

        self.archive_transcript(&ticket, reason).await;

        if let Err(e) = self.connector.delete_channel(ticket_id, reason.as_str()).await {
            // the ticket is CLOSED regardless; the channel leaks until an
            // operator removes it
            warn!(ticket_id, error = %e, "channel deletion failed");
        }
        Ok(())
    }

    /// Best effort: a lost transcript must never prevent the close.
    async fn archive_transcript(&self, ticket: &Ticket, reason: CloseReason) {
        let mut text = format!(
            "Transcript of {} (owner {} / {}), closed: {}\n",
            ticket.id, ticket.owner_name, ticket.owner_id, reason.as_str()
        );
        for line in ticket.transcript() {
            text.push_str(&line.render());
            text.push('\n');
        }

        match self.connector.send_channel(&self.log_channel_id, &text).await {
            Ok(result) if result.success => {}
            Ok(result) => {
                warn!(
                    ticket_id = %ticket.id,
                    error = ?result.error,
                    "transcript capture failed; proceeding with teardown"
                );
            }
            Err(e) => {
                warn!(
                    ticket_id = %ticket.id,
                    error = %e,
                    "transcript capture failed; proceeding with teardown"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::RecordingConnector;
    use crate::ticket::{new_shared_ticket_store, TicketState, TranscriptLine};

    struct Harness {
        registry: SharedTicketStore,
        connector: Arc<RecordingConnector>,
        orchestrator: Arc<CloseOrchestrator>,
    }

    fn harness() -> Harness {
        let registry = new_shared_ticket_store(100);
        let now = Utc::now();
        {
            let mut r = registry.lock().unwrap();
            r.create("chan-1", "u1", "alice", now).unwrap();
            r.record_line("chan-1", TranscriptLine::new(now, "u1", "alice", "hello"));
            r.record_line("chan-1", TranscriptLine::new(now, "u1", "alice", "spotify please"));
        }
        let connector = Arc::new(RecordingConnector::new());
        let orchestrator = Arc::new(CloseOrchestrator::new(
            registry.clone(),
            connector.clone(),
            "ticket-log".to_string(),
        ));
        Harness {
            registry,
            connector,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn owner_close_archives_and_tears_down() {
        let h = harness();
        h.orchestrator
            .close("chan-1", &Initiator::user("u1"), CloseReason::Manual)
            .await
            .unwrap();

        assert_eq!(
            h.registry.lock().unwrap().get("chan-1").unwrap().state,
            TicketState::Closed
        );
        let archived = h.connector.channel_messages("ticket-log");
        assert_eq!(archived.len(), 1);
        assert!(archived[0].contains("alice (u1): hello"));
        assert!(archived[0].contains("spotify please"));
        assert_eq!(
            h.connector.deleted_channels.lock().unwrap().as_slice(),
            &[("chan-1".to_string(), "manual".to_string())]
        );
    }

    #[tokio::test]
    async fn concurrent_closes_tear_down_exactly_once() {
        let h = harness();
        let manual = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .close("chan-1", &Initiator::admin("admin-1"), CloseReason::Manual)
                    .await
            })
        };
        let sweep = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .close("chan-1", &Initiator::System, CloseReason::Inactivity)
                    .await
            })
        };

        let results = [manual.await.unwrap(), sweep.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1, "exactly one teardown");
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(TicketError::AlreadyClosed(_)))));

        assert_eq!(h.connector.channel_messages("ticket-log").len(), 1);
        assert_eq!(h.connector.deleted_channels.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_owner_is_unauthorized_and_changes_nothing() {
        let h = harness();
        let result = h
            .orchestrator
            .close("chan-1", &Initiator::user("u2"), CloseReason::Manual)
            .await;
        assert!(matches!(result, Err(TicketError::Unauthorized { .. })));
        assert_eq!(
            h.registry.lock().unwrap().get("chan-1").unwrap().state,
            TicketState::Open
        );
        assert!(h.connector.deleted_channels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transcript_failure_never_blocks_teardown() {
        let h = harness();
        h.connector
            .fail_channel
            .store(true, std::sync::atomic::Ordering::SeqCst);

        h.orchestrator
            .close("chan-1", &Initiator::System, CloseReason::Inactivity)
            .await
            .unwrap();

        assert_eq!(
            h.registry.lock().unwrap().get("chan-1").unwrap().state,
            TicketState::Closed
        );
        assert_eq!(h.connector.deleted_channels.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_ticket_is_not_found() {
        let h = harness();
        assert!(matches!(
            h.orchestrator
                .close("missing", &Initiator::System, CloseReason::Manual)
                .await,
            Err(TicketError::NotFound(_))
        ));
    }
}
