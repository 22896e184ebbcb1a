//! Ticket Lifecycle State Machine
//!
//! The registry is the single source of truth for ticket state, timestamps
//! and ownership. Other components read and request transitions but never
//! mutate fields directly. All writes go through the registry lock, which
//! makes every transition a compare-and-set: exactly one caller wins a race
//! to any given state change.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TicketError;

/// State of a ticket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TicketState {
    /// Accepting catalog requests.
    Open,
    /// A verification request is pending; waiting for proof or deadline.
    AwaitingProof,
    /// Proof accepted and delivery attempted. Close control offered.
    Fulfilled,
    /// Terminal. Kept for audit, excluded from `list_open`.
    Closed,
}

impl TicketState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketState::Closed)
    }
}

/// Events accepted by the state machine.
#[derive(Debug, Clone)]
pub enum TicketEvent {
    /// A catalog request resolved and the requester is eligible.
    CatalogRequested {
        key: String,
        deadline: DateTime<Utc>,
    },
    /// A qualifying proof event arrived before the deadline.
    ProofAccepted,
    /// The deadline elapsed with no qualifying event.
    VerificationTimedOut,
    /// Manual or automatic close.
    CloseRequested,
}

impl TicketEvent {
    fn name(&self) -> &'static str {
        match self {
            TicketEvent::CatalogRequested { .. } => "catalog request",
            TicketEvent::ProofAccepted => "proof accepted",
            TicketEvent::VerificationTimedOut => "verification timeout",
            TicketEvent::CloseRequested => "close request",
        }
    }
}

/// Status of a verification request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VerificationStatus {
    Pending,
    Satisfied,
    Expired,
}

/// The bounded-wait contract between a ticket and the Verification
/// Coordinator. At most one may be pending per ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub ticket_id: String,
    pub requested_key: String,
    pub deadline: DateTime<Utc>,
    pub status: VerificationStatus,
}

/// One archived line of a ticket's message history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub at: DateTime<Utc>,
    pub author_id: String,
    pub author_name: String,
    pub text: String,
}

impl TranscriptLine {
    pub fn new(
        at: DateTime<Utc>,
        author_id: impl Into<String>,
        author_name: impl Into<String>,
        text: &str,
    ) -> Self {
        Self {
            at,
            author_id: author_id.into(),
            author_name: author_name.into(),
            text: sanitize(text),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "[{}] {} ({}): {}",
            self.at.format("%Y-%m-%d %H:%M:%S"),
            self.author_name,
            self.author_id,
            self.text
        )
    }
}

/// Strips control characters and flattens line breaks so a transcript line
/// stays a single line.
fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\n' || c == '\r' || c == '\t' {
            if !out.ends_with(' ') {
                out.push(' ');
            }
        } else if !c.is_control() {
            out.push(c);
        }
    }
    out.trim().to_string()
}

/// A private per-requester session tracking one fulfillment workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    /// The channel/session identifier.
    pub id: String,
    pub owner_id: String,
    pub owner_name: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub state: TicketState,
    pub pending_verification: Option<VerificationRequest>,
    /// Bounded message history, oldest first.
    transcript: VecDeque<TranscriptLine>,
}

impl Ticket {
    fn new(id: String, owner_id: String, owner_name: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_id,
            owner_name,
            created_at: now,
            last_activity_at: now,
            state: TicketState::Open,
            pending_verification: None,
            transcript: VecDeque::new(),
        }
    }

    pub fn transcript(&self) -> impl Iterator<Item = &TranscriptLine> {
        self.transcript.iter()
    }
}

/// In-memory ticket registry. Owns every ticket; the owner index enforces the
/// at-most-one-open-ticket-per-owner invariant atomically with creation.
#[derive(Debug)]
pub struct TicketStore {
    tickets: HashMap<String, Ticket>,
    open_by_owner: HashMap<String, String>,
    transcript_cap: usize,
}

impl TicketStore {
    pub fn new(transcript_cap: usize) -> Self {
        Self {
            tickets: HashMap::new(),
            open_by_owner: HashMap::new(),
            transcript_cap,
        }
    }

    /// Creates a ticket for `owner_id` bound to channel `ticket_id`. The
    /// already-open check and the insert happen under the same lock, so two
    /// concurrent creates for one owner cannot both succeed.
    pub fn create(
        &mut self,
        ticket_id: &str,
        owner_id: &str,
        owner_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Ticket, TicketError> {
        if let Some(existing) = self.open_by_owner.get(owner_id) {
            return Err(TicketError::AlreadyOpen {
                owner_id: owner_id.to_string(),
                ticket_id: existing.clone(),
            });
        }
        let ticket = Ticket::new(
            ticket_id.to_string(),
            owner_id.to_string(),
            owner_name.to_string(),
            now,
        );
        self.open_by_owner
            .insert(owner_id.to_string(), ticket_id.to_string());
        self.tickets.insert(ticket_id.to_string(), ticket.clone());
        Ok(ticket)
    }

    pub fn get(&self, ticket_id: &str) -> Option<Ticket> {
        self.tickets.get(ticket_id).cloned()
    }

    /// All non-terminal tickets.
    pub fn list_open(&self) -> Vec<Ticket> {
        self.tickets
            .values()
            .filter(|t| !t.state.is_terminal())
            .cloned()
            .collect()
    }

    pub fn open_ticket_for_owner(&self, owner_id: &str) -> Option<Ticket> {
        self.open_by_owner
            .get(owner_id)
            .and_then(|id| self.tickets.get(id))
            .cloned()
    }

    /// Updates `last_activity_at`, never moving it backward.
    pub fn touch(&mut self, ticket_id: &str, now: DateTime<Utc>) {
        if let Some(ticket) = self.tickets.get_mut(ticket_id) {
            if now > ticket.last_activity_at {
                ticket.last_activity_at = now;
            }
        }
    }

    /// Appends a transcript line, evicting the oldest once the cap is hit.
    pub fn record_line(&mut self, ticket_id: &str, line: TranscriptLine) {
        let cap = self.transcript_cap;
        if let Some(ticket) = self.tickets.get_mut(ticket_id) {
            if ticket.transcript.len() >= cap {
                ticket.transcript.pop_front();
            }
            ticket.transcript.push_back(line);
        }
    }

    /// Compare-and-set transition. Exactly one caller wins any race to a
    /// given state change; losers observe `AlreadyClosed` or
    /// `InvalidTransition` and must treat their view of the ticket as stale.
    pub fn transition(
        &mut self,
        ticket_id: &str,
        event: TicketEvent,
        now: DateTime<Utc>,
    ) -> Result<TicketState, TicketError> {
        let ticket = self
            .tickets
            .get_mut(ticket_id)
            .ok_or_else(|| TicketError::NotFound(ticket_id.to_string()))?;

        let next = match (ticket.state, &event) {
            (TicketState::Closed, TicketEvent::CloseRequested) => {
                return Err(TicketError::AlreadyClosed(ticket_id.to_string()));
            }
            (from, _) if from.is_terminal() => {
                return Err(TicketError::InvalidTransition {
                    ticket_id: ticket_id.to_string(),
                    from,
                    event: event.name().to_string(),
                });
            }
            (TicketState::Open, TicketEvent::CatalogRequested { key, deadline }) => {
                ticket.pending_verification = Some(VerificationRequest {
                    ticket_id: ticket_id.to_string(),
                    requested_key: key.clone(),
                    deadline: *deadline,
                    status: VerificationStatus::Pending,
                });
                TicketState::AwaitingProof
            }
            (TicketState::AwaitingProof, TicketEvent::ProofAccepted) => {
                ticket.pending_verification = None;
                TicketState::Fulfilled
            }
            (TicketState::AwaitingProof, TicketEvent::VerificationTimedOut) => {
                ticket.pending_verification = None;
                TicketState::Open
            }
            (_, TicketEvent::CloseRequested) => {
                // any pending verification is implicitly cancelled
                ticket.pending_verification = None;
                self.open_by_owner.remove(&ticket.owner_id);
                ticket.state = TicketState::Closed;
                ticket.last_activity_at = ticket.last_activity_at.max(now);
                return Ok(TicketState::Closed);
            }
            (from, _) => {
                return Err(TicketError::InvalidTransition {
                    ticket_id: ticket_id.to_string(),
                    from,
                    event: event.name().to_string(),
                });
            }
        };

        ticket.state = next;
        ticket.last_activity_at = ticket.last_activity_at.max(now);
        Ok(next)
    }

    /// Starts a verification request on an OPEN ticket. Returns `Ok(None)`
    /// when one is already pending (idempotent no-op per the coordinator
    /// contract).
    pub fn begin_verification(
        &mut self,
        ticket_id: &str,
        requested_key: &str,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<VerificationRequest>, TicketError> {
        {
            let ticket = self
                .tickets
                .get(ticket_id)
                .ok_or_else(|| TicketError::NotFound(ticket_id.to_string()))?;
            if ticket.state == TicketState::AwaitingProof
                && ticket.pending_verification.is_some()
            {
                return Ok(None);
            }
        }
        self.transition(
            ticket_id,
            TicketEvent::CatalogRequested {
                key: requested_key.to_string(),
                deadline,
            },
            now,
        )?;
        Ok(self
            .tickets
            .get(ticket_id)
            .and_then(|t| t.pending_verification.clone()))
    }
}

/// Thread-safe registry wrapper.
pub type SharedTicketStore = Arc<Mutex<TicketStore>>;

pub fn new_shared_ticket_store(transcript_cap: usize) -> SharedTicketStore {
    Arc::new(Mutex::new(TicketStore::new(transcript_cap)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> TicketStore {
        TicketStore::new(100)
    }

    #[test]
    fn second_create_for_same_owner_fails_until_close() {
        let mut s = store();
        let now = Utc::now();
        s.create("chan-1", "u1", "alice", now).unwrap();

        match s.create("chan-2", "u1", "alice", now) {
            Err(TicketError::AlreadyOpen { ticket_id, .. }) => assert_eq!(ticket_id, "chan-1"),
            other => panic!("expected AlreadyOpen, got {:?}", other.err()),
        }

        s.transition("chan-1", TicketEvent::CloseRequested, now).unwrap();
        assert!(s.create("chan-2", "u1", "alice", now).is_ok());
    }

    #[test]
    fn touch_never_moves_backward() {
        let mut s = store();
        let t0 = Utc::now();
        s.create("chan-1", "u1", "alice", t0).unwrap();

        let t2 = t0 + Duration::seconds(20);
        let t1 = t0 + Duration::seconds(10);
        s.touch("chan-1", t2);
        s.touch("chan-1", t1);
        assert_eq!(s.get("chan-1").unwrap().last_activity_at, t2);
    }

    #[test]
    fn touch_is_monotonic_under_concurrent_interleavings() {
        let shared = new_shared_ticket_store(100);
        let t0 = Utc::now();
        shared
            .lock()
            .unwrap()
            .create("chan-1", "u1", "alice", t0)
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let shared = shared.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..100 {
                    let offset = ((i * 100 + j) % 137) as i64;
                    shared
                        .lock()
                        .unwrap()
                        .touch("chan-1", t0 + Duration::seconds(offset));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let last = shared.lock().unwrap().get("chan-1").unwrap().last_activity_at;
        assert_eq!(last, t0 + Duration::seconds(136));
    }

    #[test]
    fn full_lifecycle_transitions() {
        let mut s = store();
        let now = Utc::now();
        s.create("chan-1", "u1", "alice", now).unwrap();

        let deadline = now + Duration::seconds(120);
        let req = s
            .begin_verification("chan-1", "Spotify Premium", deadline, now)
            .unwrap()
            .expect("request started");
        assert_eq!(req.status, VerificationStatus::Pending);
        assert_eq!(s.get("chan-1").unwrap().state, TicketState::AwaitingProof);

        // second request while one is pending: idempotent no-op
        assert!(s
            .begin_verification("chan-1", "CineTV", deadline, now)
            .unwrap()
            .is_none());
        assert_eq!(
            s.get("chan-1").unwrap().pending_verification.unwrap().requested_key,
            "Spotify Premium"
        );

        let state = s.transition("chan-1", TicketEvent::ProofAccepted, now).unwrap();
        assert_eq!(state, TicketState::Fulfilled);
        assert!(s.get("chan-1").unwrap().pending_verification.is_none());

        let state = s.transition("chan-1", TicketEvent::CloseRequested, now).unwrap();
        assert_eq!(state, TicketState::Closed);
    }

    #[test]
    fn timeout_returns_to_open_and_allows_retry() {
        let mut s = store();
        let now = Utc::now();
        s.create("chan-1", "u1", "alice", now).unwrap();
        let deadline = now + Duration::seconds(120);

        s.begin_verification("chan-1", "CineTV", deadline, now).unwrap();
        let state = s
            .transition("chan-1", TicketEvent::VerificationTimedOut, deadline)
            .unwrap();
        assert_eq!(state, TicketState::Open);
        assert!(s.get("chan-1").unwrap().pending_verification.is_none());

        // retry accepted
        assert!(s
            .begin_verification("chan-1", "CineTV", deadline + Duration::seconds(120), deadline)
            .unwrap()
            .is_some());
    }

    #[test]
    fn close_wins_exactly_once_under_race() {
        let shared = new_shared_ticket_store(100);
        let now = Utc::now();
        shared
            .lock()
            .unwrap()
            .create("chan-1", "u1", "alice", now)
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let shared = shared.clone();
            handles.push(std::thread::spawn(move || {
                shared
                    .lock()
                    .unwrap()
                    .transition("chan-1", TicketEvent::CloseRequested, Utc::now())
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1, "exactly one close must win");
        for lost in results.into_iter().filter(Result::is_err) {
            assert!(matches!(lost, Err(TicketError::AlreadyClosed(_))));
        }
    }

    #[test]
    fn closing_awaiting_proof_cancels_the_pending_request() {
        let mut s = store();
        let now = Utc::now();
        s.create("chan-1", "u1", "alice", now).unwrap();
        s.begin_verification("chan-1", "CineTV", now + Duration::seconds(120), now)
            .unwrap();

        s.transition("chan-1", TicketEvent::CloseRequested, now).unwrap();
        let ticket = s.get("chan-1").unwrap();
        assert_eq!(ticket.state, TicketState::Closed);
        assert!(ticket.pending_verification.is_none());

        // the coordinator's late transitions are rejected as stale
        assert!(s
            .transition("chan-1", TicketEvent::ProofAccepted, now)
            .is_err());
        assert!(matches!(
            s.transition("chan-1", TicketEvent::CloseRequested, now),
            Err(TicketError::AlreadyClosed(_))
        ));
    }

    #[test]
    fn closed_tickets_leave_list_open_but_stay_readable() {
        let mut s = store();
        let now = Utc::now();
        s.create("chan-1", "u1", "alice", now).unwrap();
        s.create("chan-2", "u2", "bob", now).unwrap();

        s.transition("chan-1", TicketEvent::CloseRequested, now).unwrap();
        let open: Vec<String> = s.list_open().into_iter().map(|t| t.id).collect();
        assert_eq!(open, vec!["chan-2".to_string()]);
        assert_eq!(s.get("chan-1").unwrap().state, TicketState::Closed);
    }

    #[test]
    fn transcript_is_bounded_and_oldest_first() {
        let mut s = TicketStore::new(3);
        let now = Utc::now();
        s.create("chan-1", "u1", "alice", now).unwrap();

        for i in 0..5 {
            s.record_line(
                "chan-1",
                TranscriptLine::new(now, "u1", "alice", &format!("message {}", i)),
            );
        }
        let lines: Vec<String> = s
            .get("chan-1")
            .unwrap()
            .transcript()
            .map(|l| l.text.clone())
            .collect();
        assert_eq!(lines, vec!["message 2", "message 3", "message 4"]);
    }

    #[test]
    fn transcript_lines_are_sanitized() {
        let now = Utc::now();
        let line = TranscriptLine::new(now, "u1", "alice", "hey\nthere\t\u{7}world");
        assert_eq!(line.text, "hey there world");
        assert!(line.render().contains("alice (u1): hey there world"));
    }
}
