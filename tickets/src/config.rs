//! Engine configuration.
//!
//! All tunables of the lifecycle engine live here with their documented
//! defaults. Invalid values (zero durations, zero caps) fail fast at startup
//! through [`EngineConfig::validate`].

use std::time::Duration;

use crate::error::ConfigError;

/// Default cooldown between ticket openings per requester.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(48 * 3600);
/// Default inactivity threshold after which the sweeper reclaims a ticket.
pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(15 * 60);
/// Default period of the inactivity sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Default bounded wait for a qualifying proof upload.
pub const DEFAULT_VERIFICATION_WINDOW: Duration = Duration::from_secs(120);
/// Default minimum continuous server membership before a request is eligible.
pub const DEFAULT_MIN_MEMBERSHIP_AGE: Duration = Duration::from_secs(24 * 3600);
/// Default maximum number of transcript lines retained per ticket.
pub const DEFAULT_TRANSCRIPT_CAP: usize = 500;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a requester must wait between ticket openings.
    pub cooldown: Duration,
    /// Idle time after which a ticket is reclaimed by the sweeper.
    pub inactivity_threshold: Duration,
    /// Period of the background inactivity sweep.
    pub sweep_interval: Duration,
    /// Bounded wait for a qualifying proof event.
    pub verification_window: Duration,
    /// Minimum continuous membership before OPEN -> AWAITING_PROOF.
    pub min_membership_age: Duration,
    /// Maximum transcript lines retained and archived per ticket.
    pub transcript_cap: usize,
    /// Channel id transcripts are archived to.
    pub log_channel_id: String,
    /// Link to the action the requester must complete before uploading proof.
    pub subscription_url: String,
    /// Normalized message text that opens a ticket from a shared channel.
    pub open_trigger: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            inactivity_threshold: DEFAULT_INACTIVITY_THRESHOLD,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            verification_window: DEFAULT_VERIFICATION_WINDOW,
            min_membership_age: DEFAULT_MIN_MEMBERSHIP_AGE,
            transcript_cap: DEFAULT_TRANSCRIPT_CAP,
            log_channel_id: "ticket-log".to_string(),
            subscription_url: String::new(),
            open_trigger: "ticket".to_string(),
        }
    }
}

impl EngineConfig {
    /// Rejects configurations that would stall or disable the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cooldown.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "cooldown" });
        }
        if self.inactivity_threshold.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "inactivity_threshold",
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "sweep_interval",
            });
        }
        if self.verification_window.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "verification_window",
            });
        }
        if self.transcript_cap == 0 {
            return Err(ConfigError::ZeroCap {
                field: "transcript_cap",
            });
        }
        Ok(())
    }
}
