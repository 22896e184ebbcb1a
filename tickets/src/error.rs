//! Error types for the ticket engine.
//!
//! `TicketError` is the engine-level taxonomy reported back to requesters and
//! operators. Collaborator-boundary failures are `ConnectorError` and get
//! converted at the boundary; they never escape raw.

use chrono::Duration;
use thiserror::Error;

/// Engine-level error taxonomy.
#[derive(Debug, Error)]
pub enum TicketError {
    /// The requester already has a live ticket. Not an operator error.
    #[error("requester {owner_id} already has an open ticket: {ticket_id}")]
    AlreadyOpen { owner_id: String, ticket_id: String },

    /// A cooldown is active for the requester, with the exact remaining time.
    #[error("cooldown active: {}s remaining", remaining.num_seconds())]
    CooldownActive { remaining: Duration },

    /// The caller lacks the required capability. No state change occurred.
    #[error("initiator {initiator} is not authorized to {action}")]
    Unauthorized { initiator: String, action: String },

    /// The referenced ticket or resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The ticket was already closed by another initiator.
    #[error("ticket {0} is already closed")]
    AlreadyClosed(String),

    /// The requested state transition is not defined by the machine.
    #[error("invalid transition for ticket {ticket_id}: {from:?} does not accept {event}")]
    InvalidTransition {
        ticket_id: String,
        from: crate::ticket::TicketState,
        event: String,
    },

    /// A private-message delivery could not reach the requester. The ticket
    /// stays FULFILLED; an operator can redeliver.
    #[error("delivery to {user_id} failed: {reason}")]
    DeliveryFailed { user_id: String, reason: String },

    /// The requester does not meet the eligibility gate (e.g. minimum
    /// continuous membership duration).
    #[error("requirement not met: {0}")]
    RequirementNotMet(String),

    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Failures at the chat-platform collaborator boundary.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("channel creation failed: {0}")]
    ChannelCreate(String),

    #[error("channel deletion failed: {0}")]
    ChannelDelete(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("outbound rate limit exceeded")]
    RateLimited,

    #[error("connector not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ConnectorError {
    fn from(e: std::io::Error) -> Self {
        ConnectorError::Io(e.to_string())
    }
}

/// Startup configuration validation failures. These are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("{field} must be greater than zero")]
    ZeroCap { field: &'static str },
}

/// Catalog persistence failures.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<std::io::Error> for CatalogError {
    fn from(e: std::io::Error) -> Self {
        CatalogError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        CatalogError::Serde(e.to_string())
    }
}
