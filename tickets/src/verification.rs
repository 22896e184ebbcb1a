//! Verification Coordinator: the bounded-wait proof protocol.
//!
//! A verification is a race between the ticket's inbound event stream and a
//! deadline timer, resolved at a single `select!` point. The select is biased
//! toward the event arm so an in-window proof beats a simultaneous deadline.
//! The coordinator never acts on a stale ticket: every transition it makes is
//! a compare-and-set through the registry, and a lost CAS means some other
//! path (manual close, sweep) moved the ticket on, so it abandons.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::catalog::CatalogEntry;
use crate::connector::{ChatConnector, MessageEnvelope};
use crate::error::TicketError;
use crate::ticket::{SharedTicketStore, TicketEvent};

/// Terminal outcome of one verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Proof accepted and the link reached the requester.
    Delivered,
    /// Proof accepted but private delivery failed; the ticket stays
    /// FULFILLED and an operator can redeliver.
    DeliveryFailed,
    /// The deadline elapsed; the ticket returned to OPEN for a retry.
    TimedOut,
    /// A verification was already pending for this ticket; no-op.
    AlreadyPending,
    /// The ticket moved on (e.g. was closed) while the coordinator ran.
    Superseded,
}

pub struct VerificationCoordinator {
    registry: SharedTicketStore,
    connector: Arc<dyn ChatConnector>,
    events: broadcast::Sender<MessageEnvelope>,
    window: StdDuration,
    subscription_url: String,
}

impl VerificationCoordinator {
    pub fn new(
        registry: SharedTicketStore,
        connector: Arc<dyn ChatConnector>,
        events: broadcast::Sender<MessageEnvelope>,
        window: StdDuration,
        subscription_url: String,
    ) -> Self {
        Self {
            registry,
            connector,
            events,
            window,
            subscription_url,
        }
    }

    /// Runs one full verification for `ticket_id`: announce the requirement,
    /// wait for a qualifying proof or the deadline, transition the ticket and
    /// deliver. At most one verification may be pending per ticket; a second
    /// call while one runs is an idempotent no-op.
    pub async fn run(
        &self,
        ticket_id: &str,
        owner_id: &str,
        entry: &CatalogEntry,
    ) -> Result<VerificationOutcome, TicketError> {
        let now = Utc::now();
        let deadline = now + Duration::from_std(self.window).unwrap_or_else(|_| Duration::seconds(120));

        // Subscribe before announcing so no in-window event can slip past.
        let mut rx = self.events.subscribe();

        let begun = {
            let mut registry = self.registry.lock().expect("registry lock");
            registry.begin_verification(ticket_id, &entry.key, deadline, now)
        };
        match begun {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(VerificationOutcome::AlreadyPending),
            Err(e) => {
                debug!(ticket_id, error = %e, "verification not started; ticket moved on");
                return Ok(VerificationOutcome::Superseded);
            }
        }

        let announce = format!(
            "To receive **{}** you must be subscribed: {}\n\
             After subscribing, upload a screenshot here.\n\
             You have {} seconds to upload it.",
            entry.key,
            self.subscription_url,
            self.window.as_secs()
        );
        if let Err(e) = self.connector.send_channel(ticket_id, &announce).await {
            warn!(ticket_id, error = %e, "verification announcement failed");
        }

        let proof = self.wait_for_proof(&mut rx, ticket_id, owner_id).await;

        match proof {
            Some(envelope) => self.on_proof(ticket_id, owner_id, entry, envelope).await,
            None => self.on_timeout(ticket_id).await,
        }
    }

    /// The race: first qualifying event wins, otherwise the deadline fires.
    async fn wait_for_proof(
        &self,
        rx: &mut broadcast::Receiver<MessageEnvelope>,
        ticket_id: &str,
        owner_id: &str,
    ) -> Option<MessageEnvelope> {
        let sleep = tokio::time::sleep(self.window);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                recv = rx.recv() => match recv {
                    Ok(envelope) => {
                        if qualifies(&envelope, ticket_id, owner_id) {
                            return Some(envelope);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(ticket_id, skipped, "verification receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // no further events can arrive; only the timer remains
                        sleep.as_mut().await;
                        return None;
                    }
                },
                _ = &mut sleep => return None,
            }
        }
    }

    async fn on_proof(
        &self,
        ticket_id: &str,
        owner_id: &str,
        entry: &CatalogEntry,
        envelope: MessageEnvelope,
    ) -> Result<VerificationOutcome, TicketError> {
        let accepted = {
            let mut registry = self.registry.lock().expect("registry lock");
            registry.transition(ticket_id, TicketEvent::ProofAccepted, envelope.timestamp)
        };
        if let Err(e) = accepted {
            debug!(ticket_id, error = %e, "proof arrived for a stale ticket; abandoning");
            return Ok(VerificationOutcome::Superseded);
        }
        info!(ticket_id, key = %entry.key, "proof accepted");

        let mut dm = format!(
            "Verification received. Your **{}** download link:\n{}",
            entry.key, entry.link
        );
        if !entry.is_configured() {
            dm.push_str("\nNote: this link is a placeholder; an administrator still has to configure it.");
        }

        let delivered = match self.connector.send_direct(owner_id, &dm).await {
            Ok(result) if result.success => true,
            Ok(result) => {
                warn!(ticket_id, error = ?result.error, "private delivery rejected");
                false
            }
            Err(e) => {
                warn!(ticket_id, error = %e, "private delivery failed");
                false
            }
        };

        if delivered {
            let confirmation =
                "The download link was sent to your private messages. \
                 Close this ticket when you are done; it also auto-closes after inactivity.";
            if let Err(e) = self.connector.send_channel(ticket_id, confirmation).await {
                warn!(ticket_id, error = %e, "confirmation send failed");
            }
            Ok(VerificationOutcome::Delivered)
        } else {
            // The proof was valid; only delivery failed. Do not revert.
            let remediation =
                "Your proof was accepted, but the download link could not be delivered \
                 privately. Enable private messages and ask an operator to redeliver.";
            if let Err(e) = self.connector.send_channel(ticket_id, remediation).await {
                warn!(ticket_id, error = %e, "remediation send failed");
            }
            Ok(VerificationOutcome::DeliveryFailed)
        }
    }

    async fn on_timeout(&self, ticket_id: &str) -> Result<VerificationOutcome, TicketError> {
        let reverted = {
            let mut registry = self.registry.lock().expect("registry lock");
            registry.transition(ticket_id, TicketEvent::VerificationTimedOut, Utc::now())
        };
        if let Err(e) = reverted {
            debug!(ticket_id, error = %e, "timeout for a stale ticket; abandoning");
            return Ok(VerificationOutcome::Superseded);
        }
        info!(ticket_id, "verification timed out");

        let notice =
            "Verification timed out: no screenshot arrived in time. \
             Type the resource name again to retry.";
        if let Err(e) = self.connector.send_channel(ticket_id, notice).await {
            warn!(ticket_id, error = %e, "timeout notice send failed");
        }
        Ok(VerificationOutcome::TimedOut)
    }
}

/// Strict proof matching: same channel, same author, and at least one
/// image-typed attachment (content-type prefix check only).
fn qualifies(envelope: &MessageEnvelope, ticket_id: &str, owner_id: &str) -> bool {
    envelope.channel_id == ticket_id
        && envelope.sender_id == owner_id
        && envelope.attachments.iter().any(|a| a.is_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{AttachmentRef, RecordingConnector};
    use crate::ticket::{new_shared_ticket_store, TicketState};

    const WINDOW: StdDuration = StdDuration::from_millis(200);

    fn envelope(channel: &str, sender: &str, attachments: Vec<AttachmentRef>) -> MessageEnvelope {
        MessageEnvelope {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel.to_string(),
            sender_id: sender.to_string(),
            sender_name: sender.to_string(),
            sender_joined_at: None,
            timestamp: Utc::now(),
            text: String::new(),
            attachments,
        }
    }

    fn image_attachment() -> AttachmentRef {
        AttachmentRef {
            id: "a1".to_string(),
            content_type: "image/png".to_string(),
            size_bytes: 1024,
            filename: Some("proof.png".to_string()),
        }
    }

    struct Harness {
        registry: SharedTicketStore,
        connector: Arc<RecordingConnector>,
        events: broadcast::Sender<MessageEnvelope>,
        coordinator: Arc<VerificationCoordinator>,
    }

    fn harness(link: &str) -> (Harness, CatalogEntry) {
        let registry = new_shared_ticket_store(100);
        registry
            .lock()
            .unwrap()
            .create("chan-1", "u1", "alice", Utc::now())
            .unwrap();
        let connector = Arc::new(RecordingConnector::new());
        let (events, _) = broadcast::channel(64);
        let coordinator = Arc::new(VerificationCoordinator::new(
            registry.clone(),
            connector.clone(),
            events.clone(),
            WINDOW,
            "https://example.test/subscribe".to_string(),
        ));
        let entry = CatalogEntry::new("Spotify Premium", link);
        (
            Harness {
                registry,
                connector,
                events,
                coordinator,
            },
            entry,
        )
    }

    #[tokio::test]
    async fn qualifying_proof_fulfills_and_delivers_once() {
        let (h, entry) = harness("https://example.test/dl");
        let run = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.run("chan-1", "u1", &entry).await })
        };

        tokio::time::sleep(StdDuration::from_millis(30)).await;
        h.events
            .send(envelope("chan-1", "u1", vec![image_attachment()]))
            .unwrap();

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, VerificationOutcome::Delivered);
        assert_eq!(
            h.registry.lock().unwrap().get("chan-1").unwrap().state,
            TicketState::Fulfilled
        );
        let dms = h.connector.direct_messages("u1");
        assert_eq!(dms.len(), 1, "exactly one delivery attempt");
        assert!(dms[0].contains("https://example.test/dl"));
    }

    #[tokio::test]
    async fn non_qualifying_events_are_ignored_until_timeout() {
        let (h, entry) = harness("https://example.test/dl");
        let run = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.run("chan-1", "u1", &entry).await })
        };

        tokio::time::sleep(StdDuration::from_millis(30)).await;
        // wrong author
        h.events
            .send(envelope("chan-1", "u2", vec![image_attachment()]))
            .unwrap();
        // wrong channel
        h.events
            .send(envelope("chan-2", "u1", vec![image_attachment()]))
            .unwrap();
        // not an image
        h.events
            .send(envelope(
                "chan-1",
                "u1",
                vec![AttachmentRef {
                    id: "a2".to_string(),
                    content_type: "application/pdf".to_string(),
                    size_bytes: 9,
                    filename: None,
                }],
            ))
            .unwrap();

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, VerificationOutcome::TimedOut);
        assert_eq!(
            h.registry.lock().unwrap().get("chan-1").unwrap().state,
            TicketState::Open
        );
        assert!(h.connector.direct_messages("u1").is_empty(), "no delivery");
    }

    #[tokio::test]
    async fn timeout_allows_a_retry() {
        let (h, entry) = harness("https://example.test/dl");
        let outcome = h.coordinator.run("chan-1", "u1", &entry).await.unwrap();
        assert_eq!(outcome, VerificationOutcome::TimedOut);

        // retry succeeds this time
        let run = {
            let coordinator = h.coordinator.clone();
            let entry = entry.clone();
            tokio::spawn(async move { coordinator.run("chan-1", "u1", &entry).await })
        };
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        h.events
            .send(envelope("chan-1", "u1", vec![image_attachment()]))
            .unwrap();
        assert_eq!(
            run.await.unwrap().unwrap(),
            VerificationOutcome::Delivered
        );
    }

    #[tokio::test]
    async fn delivery_failure_keeps_ticket_fulfilled_with_remediation() {
        let (h, entry) = harness("https://example.test/dl");
        h.connector
            .fail_direct
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let run = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.run("chan-1", "u1", &entry).await })
        };
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        h.events
            .send(envelope("chan-1", "u1", vec![image_attachment()]))
            .unwrap();

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, VerificationOutcome::DeliveryFailed);
        assert_eq!(
            h.registry.lock().unwrap().get("chan-1").unwrap().state,
            TicketState::Fulfilled,
            "valid proof is never reverted by a delivery failure"
        );
        let in_channel = h.connector.channel_messages("chan-1");
        assert!(in_channel
            .iter()
            .any(|m| m.contains("could not be delivered")));
    }

    #[tokio::test]
    async fn placeholder_link_is_delivered_with_warning() {
        let (h, entry) = harness(crate::catalog::PLACEHOLDER_LINK);
        let run = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.run("chan-1", "u1", &entry).await })
        };
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        h.events
            .send(envelope("chan-1", "u1", vec![image_attachment()]))
            .unwrap();

        assert_eq!(run.await.unwrap().unwrap(), VerificationOutcome::Delivered);
        let dms = h.connector.direct_messages("u1");
        assert!(dms[0].contains("placeholder"));
    }

    #[tokio::test]
    async fn close_while_awaiting_cancels_the_verification() {
        let (h, entry) = harness("https://example.test/dl");
        let run = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.run("chan-1", "u1", &entry).await })
        };
        tokio::time::sleep(StdDuration::from_millis(30)).await;

        // manual close while the coordinator waits
        h.registry
            .lock()
            .unwrap()
            .transition("chan-1", TicketEvent::CloseRequested, Utc::now())
            .unwrap();
        // the late proof must be abandoned, not delivered
        h.events
            .send(envelope("chan-1", "u1", vec![image_attachment()]))
            .unwrap();

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, VerificationOutcome::Superseded);
        assert!(h.connector.direct_messages("u1").is_empty());
        assert_eq!(
            h.registry.lock().unwrap().get("chan-1").unwrap().state,
            TicketState::Closed
        );
    }

    #[tokio::test]
    async fn second_request_while_pending_is_a_no_op() {
        let (h, entry) = harness("https://example.test/dl");
        let first = {
            let coordinator = h.coordinator.clone();
            let entry = entry.clone();
            tokio::spawn(async move { coordinator.run("chan-1", "u1", &entry).await })
        };
        tokio::time::sleep(StdDuration::from_millis(30)).await;

        let second = h
            .coordinator
            .run("chan-1", "u1", &CatalogEntry::new("CineTV", "https://c"))
            .await
            .unwrap();
        assert_eq!(second, VerificationOutcome::AlreadyPending);

        h.events
            .send(envelope("chan-1", "u1", vec![image_attachment()]))
            .unwrap();
        assert_eq!(
            first.await.unwrap().unwrap(),
            VerificationOutcome::Delivered
        );
        // the original request's key was delivered, not the second's
        assert!(h.connector.direct_messages("u1")[0].contains("Spotify Premium"));
    }
}
