//! Cooldown Gate: per-requester expiring lock on ticket creation.
//!
//! Locking is per subject (DashMap shards), never global, so unrelated
//! requesters are not serialized against each other. Expired records are
//! lazily evicted on read and treated identically to absence.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::error::TicketError;

pub struct CooldownGate {
    duration: Duration,
    expiries: DashMap<String, DateTime<Utc>>,
}

impl CooldownGate {
    pub fn new(duration: StdDuration) -> Self {
        Self {
            duration: Duration::from_std(duration).unwrap_or_else(|_| Duration::hours(48)),
            expiries: DashMap::new(),
        }
    }

    /// Pure read: reports whether a ticket may be opened now. Does NOT set a
    /// cooldown; callers must [`CooldownGate::activate`] after a successful
    /// open.
    pub fn try_acquire(&self, subject_id: &str, now: DateTime<Utc>) -> Result<(), TicketError> {
        if let Some(entry) = self.expiries.get(subject_id) {
            let expires_at = *entry;
            drop(entry);
            let remaining = expires_at - now;
            if remaining > Duration::zero() {
                return Err(TicketError::CooldownActive { remaining });
            }
            // expired: logically absent
            self.expiries
                .remove_if(subject_id, |_, exp| *exp == expires_at);
        }
        Ok(())
    }

    /// Starts a fresh cooldown of the configured duration from `now`.
    pub fn activate(&self, subject_id: &str, now: DateTime<Utc>) {
        self.expiries
            .insert(subject_id.to_string(), now + self.duration);
    }

    /// Administrative override. Idempotent: a no-op if no cooldown exists.
    pub fn release(&self, subject_id: &str) -> bool {
        self.expiries.remove(subject_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with_hours(h: u64) -> CooldownGate {
        CooldownGate::new(StdDuration::from_secs(h * 3600))
    }

    #[test]
    fn acquire_succeeds_without_prior_activation() {
        let gate = gate_with_hours(48);
        assert!(gate.try_acquire("u1", Utc::now()).is_ok());
    }

    #[test]
    fn cooldown_round_trip() {
        let gate = gate_with_hours(48);
        let t0 = Utc::now();
        gate.activate("u1", t0);

        let before = t0 + Duration::hours(48) - Duration::seconds(1);
        match gate.try_acquire("u1", before) {
            Err(TicketError::CooldownActive { remaining }) => {
                assert_eq!(remaining.num_seconds(), 1);
            }
            other => panic!("expected CooldownActive, got {:?}", other.err()),
        }

        let after = t0 + Duration::hours(48) + Duration::seconds(1);
        assert!(gate.try_acquire("u1", after).is_ok());
        // lazily evicted: still ok on a second read at the earlier instant
        assert!(gate.try_acquire("u1", before).is_ok());
    }

    #[test]
    fn try_acquire_does_not_set_a_cooldown() {
        let gate = gate_with_hours(48);
        let t0 = Utc::now();
        assert!(gate.try_acquire("u1", t0).is_ok());
        assert!(gate.try_acquire("u1", t0).is_ok());
    }

    #[test]
    fn release_is_idempotent() {
        let gate = gate_with_hours(48);
        let t0 = Utc::now();
        gate.activate("u1", t0);
        assert!(gate.release("u1"));
        assert!(!gate.release("u1"));
        assert!(gate.try_acquire("u1", t0).is_ok());
    }

    #[test]
    fn subjects_are_independent() {
        let gate = gate_with_hours(48);
        let t0 = Utc::now();
        gate.activate("u1", t0);
        assert!(gate.try_acquire("u2", t0).is_ok());
    }
}
