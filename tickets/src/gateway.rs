//! Ticket gateway: wires the engine components together.
//!
//! Owns the shared state, routes inbound envelopes through the workflow
//! (activity touch, transcript record, event fan-out, catalog matching,
//! eligibility gate), opens tickets behind the cooldown gate, exposes the
//! administrative operations, and serves the keepalive/admin HTTP surface.

use std::sync::Arc;

use axum::extract::{Json, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::catalog::{normalize, CatalogEntry, CatalogStore};
use crate::close::{CloseOrchestrator, CloseReason, Initiator};
use crate::config::EngineConfig;
use crate::connector::{ChatConnector, MessageEnvelope, UserRef};
use crate::cooldown::CooldownGate;
use crate::error::{ConnectorError, TicketError};
use crate::sweeper::InactivitySweeper;
use crate::ticket::{new_shared_ticket_store, SharedTicketStore, Ticket, TicketState, TranscriptLine};
use crate::verification::VerificationCoordinator;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Keepalive + admin HTTP bind address.
    pub bind_addr: String,
    /// Shared token for the admin HTTP surface.
    pub admin_token: String,
    pub engine: EngineConfig,
}

struct GatewayState {
    config: GatewayConfig,
    catalog: Arc<CatalogStore>,
    cooldowns: CooldownGate,
    registry: SharedTicketStore,
    connector: Arc<dyn ChatConnector>,
    events: broadcast::Sender<MessageEnvelope>,
    coordinator: Arc<VerificationCoordinator>,
    orchestrator: Arc<CloseOrchestrator>,
}

#[derive(Clone)]
pub struct TicketGateway {
    state: Arc<GatewayState>,
}

impl TicketGateway {
    pub fn new(
        config: GatewayConfig,
        catalog: Arc<CatalogStore>,
        connector: Arc<dyn ChatConnector>,
    ) -> Result<Self, TicketError> {
        config.engine.validate()?;

        let registry = new_shared_ticket_store(config.engine.transcript_cap);
        let (events, _) = broadcast::channel(256);
        let coordinator = Arc::new(VerificationCoordinator::new(
            registry.clone(),
            connector.clone(),
            events.clone(),
            config.engine.verification_window,
            config.engine.subscription_url.clone(),
        ));
        let orchestrator = Arc::new(CloseOrchestrator::new(
            registry.clone(),
            connector.clone(),
            config.engine.log_channel_id.clone(),
        ));

        let cooldowns = CooldownGate::new(config.engine.cooldown);
        Ok(Self {
            state: Arc::new(GatewayState {
                config,
                catalog,
                cooldowns,
                registry,
                connector,
                events,
                coordinator,
                orchestrator,
            }),
        })
    }

    /// Full wiring: subscribe to the connector, start the sweeper, serve the
    /// keepalive/admin HTTP surface until shutdown.
    pub async fn start(
        config: GatewayConfig,
        catalog: Arc<CatalogStore>,
        connector: Arc<dyn ChatConnector>,
    ) -> Result<(), TicketError> {
        let gateway = Self::new(config, catalog, connector)?;
        gateway.attach().await?;
        let _sweeper = gateway.spawn_sweeper();
        gateway.serve().await
    }

    /// Registers the inbound-envelope callback with the connector.
    pub async fn attach(&self) -> Result<(), TicketError> {
        let gateway = self.clone();
        self.state
            .connector
            .subscribe(Arc::new(move |envelope| {
                let gateway = gateway.clone();
                Box::pin(async move { gateway.handle_inbound(envelope).await })
            }))
            .await?;
        Ok(())
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let sweeper = Arc::new(InactivitySweeper::new(
            self.state.registry.clone(),
            self.state.orchestrator.clone(),
            self.state.config.engine.inactivity_threshold,
            self.state.config.engine.sweep_interval,
        ));
        tokio::spawn(sweeper.start())
    }

    pub async fn serve(&self) -> Result<(), TicketError> {
        let router = self.router();
        let listener = TcpListener::bind(self.state.config.bind_addr.as_str())
            .await
            .map_err(|e| ConnectorError::Io(format!("gateway bind error: {}", e)))?;
        info!(bind_addr = %self.state.config.bind_addr, "serving gateway HTTP surface");
        axum::serve(listener, router.into_make_service())
            .await
            .map_err(|e| ConnectorError::Io(format!("gateway server error: {}", e)))?;
        Ok(())
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(keepalive_handler))
            .route("/health", get(keepalive_handler))
            .route("/admin/catalog", get(list_catalog_handler).post(upsert_catalog_handler))
            .route("/admin/catalog/:key", delete(remove_catalog_handler))
            .route("/admin/tickets/:id/close", post(close_ticket_handler))
            .route("/admin/tickets/:id/redeliver", post(redeliver_handler))
            .route("/admin/cooldowns/:subject", delete(clear_cooldown_handler))
            .with_state(self.state.clone())
    }

    /// Routes one inbound envelope through the workflow.
    pub async fn handle_inbound(&self, envelope: MessageEnvelope) -> Result<(), TicketError> {
        let now = envelope.timestamp;

        let ticket = {
            let mut registry = self.state.registry.lock().expect("registry lock");
            let ticket = registry.get(&envelope.channel_id);
            if ticket.is_some() {
                registry.touch(&envelope.channel_id, now);
                registry.record_line(
                    &envelope.channel_id,
                    TranscriptLine::new(
                        now,
                        envelope.sender_id.clone(),
                        envelope.sender_name.clone(),
                        &envelope.text,
                    ),
                );
            }
            ticket
        };

        // fan out to any pending verification waits
        let _ = self.state.events.send(envelope.clone());

        let Some(ticket) = ticket else {
            // outside any ticket: only the open trigger is meaningful
            if normalize(&envelope.text) == normalize(&self.state.config.engine.open_trigger) {
                self.handle_open_trigger(&envelope).await;
            }
            return Ok(());
        };

        if ticket.state != TicketState::Open || envelope.sender_id != ticket.owner_id {
            return Ok(());
        }
        let Some(entry) = self.state.catalog.resolve(&envelope.text) else {
            return Ok(());
        };

        if let Err(reason) = self.check_eligibility(&envelope, now) {
            let text = format!("Requirement not met: {}", reason);
            if let Err(e) = self.state.connector.send_channel(&ticket.id, &text).await {
                warn!(ticket_id = %ticket.id, error = %e, "eligibility notice failed");
            }
            return Ok(());
        }

        let coordinator = self.state.coordinator.clone();
        let ticket_id = ticket.id.clone();
        let owner_id = ticket.owner_id.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.run(&ticket_id, &owner_id, &entry).await {
                error!(ticket_id = %ticket_id, error = %e, "verification run failed");
            }
        });
        Ok(())
    }

    /// Minimum continuous membership before a catalog request is accepted.
    fn check_eligibility(
        &self,
        envelope: &MessageEnvelope,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let min_age = Duration::from_std(self.state.config.engine.min_membership_age)
            .unwrap_or_else(|_| Duration::hours(24));
        match envelope.sender_joined_at {
            None => Err("could not verify how long you have been a member".to_string()),
            Some(joined_at) if now - joined_at < min_age => Err(format!(
                "you must be a member for at least {} hours before requesting",
                min_age.num_hours()
            )),
            Some(_) => Ok(()),
        }
    }

    async fn handle_open_trigger(&self, envelope: &MessageEnvelope) {
        let user = UserRef {
            id: envelope.sender_id.clone(),
            name: envelope.sender_name.clone(),
        };
        let reply = match self.open_ticket(&user).await {
            Ok(ticket) => format!("Your ticket has been created: {}", ticket.id),
            Err(TicketError::AlreadyOpen { ticket_id, .. }) => {
                format!("You already have a ticket: {}", ticket_id)
            }
            Err(TicketError::CooldownActive { remaining }) => {
                let secs = remaining.num_seconds().max(0);
                format!(
                    "You can create a new ticket in {}h {}m.",
                    secs / 3600,
                    (secs % 3600) / 60
                )
            }
            Err(e) => {
                error!(sender_id = %envelope.sender_id, error = %e, "ticket open failed");
                return;
            }
        };
        if let Err(e) = self
            .state
            .connector
            .send_channel(&envelope.channel_id, &reply)
            .await
        {
            warn!(channel_id = %envelope.channel_id, error = %e, "open reply failed");
        }
    }

    /// Opens a ticket for `user`: cooldown gate, private channel creation,
    /// atomic registry insert, cooldown activation, welcome message.
    pub async fn open_ticket(&self, user: &UserRef) -> Result<Ticket, TicketError> {
        let now = Utc::now();
        if let Some(existing) = self
            .state
            .registry
            .lock()
            .expect("registry lock")
            .open_ticket_for_owner(&user.id)
        {
            return Err(TicketError::AlreadyOpen {
                owner_id: user.id.clone(),
                ticket_id: existing.id,
            });
        }
        self.state.cooldowns.try_acquire(&user.id, now)?;

        let channel = self.state.connector.create_ticket_channel(user).await?;
        let created = {
            let mut registry = self.state.registry.lock().expect("registry lock");
            registry.create(&channel.id, &user.id, &user.name, now)
        };
        let ticket = match created {
            Ok(ticket) => ticket,
            Err(e) => {
                // lost a create race after the channel already existed
                if let Err(del) = self
                    .state
                    .connector
                    .delete_channel(&channel.id, "duplicate ticket")
                    .await
                {
                    warn!(channel_id = %channel.id, error = %del, "rollback deletion failed");
                }
                return Err(e);
            }
        };
        self.state.cooldowns.activate(&user.id, now);
        info!(ticket_id = %ticket.id, owner_id = %user.id, "ticket opened");

        if let Err(e) = self
            .state
            .connector
            .send_channel(&ticket.id, &self.welcome_text(&user.name))
            .await
        {
            warn!(ticket_id = %ticket.id, error = %e, "welcome message failed");
        }
        Ok(ticket)
    }

    fn welcome_text(&self, owner_name: &str) -> String {
        let listing = self
            .state
            .catalog
            .list()
            .into_iter()
            .map(|e| format!("- {}", e.key))
            .collect::<Vec<_>>()
            .join("\n");
        let listing = if listing.is_empty() {
            "No resources available.".to_string()
        } else {
            listing
        };
        format!(
            "Hello {} and welcome to your private ticket!\n\n\
             Available resources:\n{}\n\n\
             How it works:\n\
             1. Type the resource name in this channel to request it.\n\
             2. You will be asked to subscribe and upload a screenshot for verification.\n\
             3. After verification the download link is sent to your private messages.\n\n\
             You can open one ticket every {} hours. The ticket auto-closes after {} minutes of inactivity.",
            owner_name,
            listing,
            self.state.config.engine.cooldown.as_secs() / 3600,
            self.state.config.engine.inactivity_threshold.as_secs() / 60
        )
    }

    // --- administrative command surface; capability already verified by the
    // caller (admin token at the HTTP boundary) ---

    pub fn add_resource(&self, key: &str, link: &str) -> Result<(), TicketError> {
        self.state.catalog.upsert(key, link)?;
        info!(key, "catalog entry upserted");
        Ok(())
    }

    pub fn remove_resource(&self, key: &str) -> Result<(), TicketError> {
        if self.state.catalog.remove(key)? {
            info!(key, "catalog entry removed");
            Ok(())
        } else {
            Err(TicketError::NotFound(format!("resource {}", key)))
        }
    }

    pub fn list_resources(&self) -> Vec<CatalogEntry> {
        self.state.catalog.list()
    }

    pub async fn close_ticket(
        &self,
        ticket_id: &str,
        initiator: &Initiator,
    ) -> Result<(), TicketError> {
        self.state
            .orchestrator
            .close(ticket_id, initiator, CloseReason::Manual)
            .await
    }

    pub fn clear_cooldown(&self, subject_id: &str) -> bool {
        self.state.cooldowns.release(subject_id)
    }

    /// Re-attempts private delivery for a FULFILLED ticket whose original
    /// delivery failed (e.g. the requester had private messages disabled).
    pub async fn redeliver(&self, ticket_id: &str, key: &str) -> Result<(), TicketError> {
        let ticket = self
            .state
            .registry
            .lock()
            .expect("registry lock")
            .get(ticket_id)
            .ok_or_else(|| TicketError::NotFound(ticket_id.to_string()))?;
        if ticket.state != TicketState::Fulfilled {
            return Err(TicketError::InvalidTransition {
                ticket_id: ticket_id.to_string(),
                from: ticket.state,
                event: "redelivery".to_string(),
            });
        }
        let entry = self
            .state
            .catalog
            .resolve(key)
            .ok_or_else(|| TicketError::NotFound(format!("resource {}", key)))?;

        let dm = format!("Your **{}** download link:\n{}", entry.key, entry.link);
        match self.state.connector.send_direct(&ticket.owner_id, &dm).await {
            Ok(result) if result.success => Ok(()),
            Ok(result) => Err(TicketError::DeliveryFailed {
                user_id: ticket.owner_id,
                reason: result.error.unwrap_or_else(|| "delivery rejected".to_string()),
            }),
            Err(e) => Err(TicketError::DeliveryFailed {
                user_id: ticket.owner_id,
                reason: e.to_string(),
            }),
        }
    }

    /// Handle to the ticket registry, the single source of truth for state.
    pub fn registry(&self) -> SharedTicketStore {
        self.state.registry.clone()
    }
}

async fn keepalive_handler() -> &'static str {
    "TICKET GATEWAY (alive)"
}

fn check_admin(state: &GatewayState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let token = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if token.is_empty() || token != state.config.admin_token {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CatalogListResponse {
    entries: Vec<CatalogEntry>,
}

async fn list_catalog_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<CatalogListResponse>, StatusCode> {
    check_admin(&state, &headers)?;
    Ok(Json(CatalogListResponse {
        entries: state.catalog.list(),
    }))
}

#[derive(Debug, Deserialize)]
struct UpsertCatalogRequest {
    key: String,
    link: String,
}

async fn upsert_catalog_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(payload): Json<UpsertCatalogRequest>,
) -> Result<StatusCode, StatusCode> {
    check_admin(&state, &headers)?;
    state
        .catalog
        .upsert(&payload.key, &payload.link)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_catalog_handler(
    State(state): State<Arc<GatewayState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    check_admin(&state, &headers)?;
    let removed = state
        .catalog
        .remove(&key)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Deserialize)]
struct CloseTicketRequest {
    initiator_id: String,
}

async fn close_ticket_handler(
    State(state): State<Arc<GatewayState>>,
    Path(ticket_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<CloseTicketRequest>,
) -> Result<StatusCode, StatusCode> {
    check_admin(&state, &headers)?;
    match state
        .orchestrator
        .close(
            &ticket_id,
            &Initiator::admin(payload.initiator_id),
            CloseReason::Manual,
        )
        .await
    {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(TicketError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(TicketError::AlreadyClosed(_)) => Err(StatusCode::CONFLICT),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn clear_cooldown_handler(
    State(state): State<Arc<GatewayState>>,
    Path(subject): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    check_admin(&state, &headers)?;
    state.cooldowns.release(&subject);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RedeliverRequest {
    key: String,
}

async fn redeliver_handler(
    State(state): State<Arc<GatewayState>>,
    Path(ticket_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<RedeliverRequest>,
) -> Result<StatusCode, StatusCode> {
    check_admin(&state, &headers)?;
    let gateway = TicketGateway { state };
    match gateway.redeliver(&ticket_id, &payload.key).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(TicketError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(TicketError::DeliveryFailed { .. }) => Err(StatusCode::BAD_GATEWAY),
        Err(_) => Err(StatusCode::CONFLICT),
    }
}
