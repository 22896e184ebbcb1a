//! Ticket lifecycle and verification engine.
//!
//! A requester opens a private session, asks for a catalogued resource by
//! name, proves completion of a required action within a bounded window and
//! receives a delivered link; abandoned sessions are reclaimed by a periodic
//! sweep. The engine is transport-agnostic: everything platform-specific sits
//! behind the [`connector::ChatConnector`] trait.

pub mod catalog;
pub mod close;
pub mod config;
pub mod connector;
pub mod cooldown;
pub mod error;
pub mod gateway;
pub mod sweeper;
pub mod ticket;
pub mod verification;

pub use catalog::{
    CatalogEntry, CatalogPersistence, CatalogStore, FileCatalogPersistence,
    InMemoryCatalogPersistence, PLACEHOLDER_LINK,
};
pub use close::{CloseOrchestrator, CloseReason, Initiator};
pub use config::EngineConfig;
pub use connector::{
    AttachmentRef, ChatConnector, ChannelRef, LoopbackConnectorConfig, LoopbackWebhookConnector,
    MessageEnvelope, RecordingConnector, SendResult, UserRef,
};
pub use cooldown::CooldownGate;
pub use error::{CatalogError, ConfigError, ConnectorError, TicketError};
pub use gateway::{GatewayConfig, TicketGateway};
pub use sweeper::InactivitySweeper;
pub use ticket::{
    new_shared_ticket_store, SharedTicketStore, Ticket, TicketEvent, TicketState, TicketStore,
    TranscriptLine, VerificationRequest, VerificationStatus,
};
pub use verification::{VerificationCoordinator, VerificationOutcome};
