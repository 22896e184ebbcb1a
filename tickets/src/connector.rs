//! Chat-platform collaborator boundary.
//!
//! The engine depends on exactly four capabilities as an abstract interface:
//! private channel creation, channel deletion, in-channel sends and direct
//! (private) sends. Inbound messages and attachments arrive through the
//! connector's subscription callback; the engine never talks to a concrete
//! transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::post, Router};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::error::{ConnectorError, TicketError};

/// A user as the chat platform identifies it. Trusted as given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub name: String,
}

/// A channel created by the collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: String,
    pub name: String,
}

/// An attachment reference. Only the declared content type and size travel
/// through the engine; attachment bytes are never stored or inspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub filename: Option<String>,
}

impl AttachmentRef {
    /// Content-type prefix check, not content inspection.
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image")
    }
}

/// An inbound message scoped to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub sender_name: String,
    /// When the sender joined the server, if the platform knows.
    pub sender_joined_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResult {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl SendResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message_id: Some(Uuid::new_v4().to_string()),
            error: None,
        }
    }
}

pub type EnvelopeCallback = Arc<
    dyn Fn(MessageEnvelope) -> futures::future::BoxFuture<'static, Result<(), TicketError>>
        + Send
        + Sync,
>;

#[async_trait]
pub trait ChatConnector: Send + Sync {
    /// Creates a private per-ticket channel visible to the owner only.
    async fn create_ticket_channel(&self, owner: &UserRef) -> Result<ChannelRef, ConnectorError>;

    /// Releases the underlying channel resource.
    async fn delete_channel(&self, channel_id: &str, reason: &str) -> Result<(), ConnectorError>;

    /// Sends into a channel.
    async fn send_channel(&self, channel_id: &str, content: &str)
        -> Result<SendResult, ConnectorError>;

    /// Private delivery to a user. May fail if the user blocks private
    /// messages; callers surface that as `DeliveryFailed`.
    async fn send_direct(&self, user_id: &str, content: &str)
        -> Result<SendResult, ConnectorError>;

    /// Registers the inbound event callback and starts event delivery.
    async fn subscribe(&self, callback: EnvelopeCallback) -> Result<(), ConnectorError>;
}

#[derive(Debug, Clone)]
pub struct LoopbackConnectorConfig {
    pub bind_addr: String,
    pub shared_secret: String,
    /// Where outbound sends are POSTed. Without it every send fails.
    pub outbound_url: Option<String>,
    pub min_send_interval_ms: u64,
}

struct LoopbackConnectorState {
    config: LoopbackConnectorConfig,
    callback: RwLock<Option<EnvelopeCallback>>,
}

/// Webhook-based connector: inbound messages arrive on a local HTTP endpoint
/// authenticated by a shared-secret header, outbound traffic is POSTed to a
/// configured URL. Useful for bridges and integration tests.
#[derive(Clone)]
pub struct LoopbackWebhookConnector {
    state: Arc<LoopbackConnectorState>,
    client: Client,
    server_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    last_send_at: Arc<StdMutex<Option<Instant>>>,
}

impl LoopbackWebhookConnector {
    pub fn new(config: LoopbackConnectorConfig) -> Self {
        Self {
            state: Arc::new(LoopbackConnectorState {
                config,
                callback: RwLock::new(None),
            }),
            client: Client::new(),
            server_handle: Arc::new(Mutex::new(None)),
            shutdown_tx: Arc::new(Mutex::new(None)),
            last_send_at: Arc::new(StdMutex::new(None)),
        }
    }

    async fn start_server(&self) -> Result<(), ConnectorError> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let state = self.state.clone();
        let router = Router::new()
            .route("/connector/loopback/inbound", post(inbound_handler))
            .with_state(state);

        let addr: SocketAddr = self
            .state
            .config
            .bind_addr
            .parse()
            .map_err(|_| ConnectorError::Io("invalid bind_addr".to_string()))?;
        let listener = TcpListener::bind(addr).await?;
        let server = axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            let _ = server.await;
        });
        *self.server_handle.lock().await = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
    }

    fn enforce_rate_limit(&self) -> Result<(), ConnectorError> {
        let mut guard = self
            .last_send_at
            .lock()
            .map_err(|_| ConnectorError::Io("rate limiter lock poisoned".to_string()))?;
        let now = Instant::now();
        if let Some(last) = *guard {
            let min_interval = StdDuration::from_millis(self.state.config.min_send_interval_ms);
            if now.duration_since(last) < min_interval {
                return Err(ConnectorError::RateLimited);
            }
        }
        *guard = Some(now);
        Ok(())
    }

    async fn post_outbound(&self, payload: &OutboundPayload) -> Result<SendResult, ConnectorError> {
        self.enforce_rate_limit()?;
        let Some(outbound_url) = &self.state.config.outbound_url else {
            return Err(ConnectorError::Send("outbound URL not configured".to_string()));
        };

        let resp = self
            .client
            .post(outbound_url)
            .json(payload)
            .send()
            .await
            .map_err(|e| ConnectorError::Send(e.to_string()))?;

        if !resp.status().is_success() {
            return Ok(SendResult {
                success: false,
                message_id: None,
                error: Some(format!("outbound returned status {}", resp.status())),
            });
        }
        Ok(SendResult::ok())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
enum OutboundPayload {
    ChannelMessage { channel_id: String, content: String },
    DirectMessage { user_id: String, content: String },
    ChannelCreated { channel_id: String, name: String, owner_id: String },
    ChannelDeleted { channel_id: String, reason: String },
}

#[async_trait]
impl ChatConnector for LoopbackWebhookConnector {
    async fn create_ticket_channel(&self, owner: &UserRef) -> Result<ChannelRef, ConnectorError> {
        let name: String = owner
            .name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_whitespace() { '-' } else { c })
            .take(80)
            .collect();
        let channel = ChannelRef {
            id: format!("ticket-{}", Uuid::new_v4()),
            name: format!("ticket-{}", name),
        };
        if self.state.config.outbound_url.is_some() {
            // best-effort notification; the channel exists either way
            if let Err(e) = self
                .post_outbound(&OutboundPayload::ChannelCreated {
                    channel_id: channel.id.clone(),
                    name: channel.name.clone(),
                    owner_id: owner.id.clone(),
                })
                .await
            {
                warn!(error = %e, "channel-created notification failed");
            }
        }
        Ok(channel)
    }

    async fn delete_channel(&self, channel_id: &str, reason: &str) -> Result<(), ConnectorError> {
        if self.state.config.outbound_url.is_some() {
            if let Err(e) = self
                .post_outbound(&OutboundPayload::ChannelDeleted {
                    channel_id: channel_id.to_string(),
                    reason: reason.to_string(),
                })
                .await
            {
                warn!(error = %e, "channel-deleted notification failed");
            }
        }
        Ok(())
    }

    async fn send_channel(
        &self,
        channel_id: &str,
        content: &str,
    ) -> Result<SendResult, ConnectorError> {
        self.post_outbound(&OutboundPayload::ChannelMessage {
            channel_id: channel_id.to_string(),
            content: content.to_string(),
        })
        .await
    }

    async fn send_direct(
        &self,
        user_id: &str,
        content: &str,
    ) -> Result<SendResult, ConnectorError> {
        self.post_outbound(&OutboundPayload::DirectMessage {
            user_id: user_id.to_string(),
            content: content.to_string(),
        })
        .await
    }

    async fn subscribe(&self, callback: EnvelopeCallback) -> Result<(), ConnectorError> {
        *self.state.callback.write().await = Some(callback);
        self.start_server().await
    }
}

#[derive(Debug, Deserialize)]
struct LoopbackInboundPayload {
    channel_id: String,
    sender_id: String,
    sender_name: String,
    sender_joined_at: Option<DateTime<Utc>>,
    text: String,
    timestamp: Option<DateTime<Utc>>,
    attachments: Option<Vec<LoopbackInboundAttachment>>,
}

#[derive(Debug, Deserialize)]
struct LoopbackInboundAttachment {
    content_type: Option<String>,
    size_bytes: Option<u64>,
    filename: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoopbackInboundResponse {
    accepted: bool,
    message_id: Option<String>,
    error: Option<String>,
}

async fn inbound_handler(
    State(state): State<Arc<LoopbackConnectorState>>,
    headers: HeaderMap,
    Json(payload): Json<LoopbackInboundPayload>,
) -> impl IntoResponse {
    let secret = headers
        .get("x-ticket-connector-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if secret != state.config.shared_secret {
        return (
            StatusCode::UNAUTHORIZED,
            Json(LoopbackInboundResponse {
                accepted: false,
                message_id: None,
                error: Some("unauthorized".to_string()),
            }),
        );
    }

    let attachments = payload
        .attachments
        .unwrap_or_default()
        .into_iter()
        .map(|a| AttachmentRef {
            id: Uuid::new_v4().to_string(),
            content_type: a
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size_bytes: a.size_bytes.unwrap_or(0),
            filename: a.filename,
        })
        .collect();

    let message_id = Uuid::new_v4().to_string();
    let envelope = MessageEnvelope {
        id: message_id.clone(),
        channel_id: payload.channel_id,
        sender_id: payload.sender_id,
        sender_name: payload.sender_name,
        sender_joined_at: payload.sender_joined_at,
        timestamp: payload.timestamp.unwrap_or_else(Utc::now),
        text: payload.text,
        attachments,
    };

    if let Some(callback) = state.callback.read().await.clone() {
        if let Err(e) = callback(envelope).await {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(LoopbackInboundResponse {
                    accepted: false,
                    message_id: None,
                    error: Some(format!("callback error: {}", e)),
                }),
            );
        }
    }

    (
        StatusCode::OK,
        Json(LoopbackInboundResponse {
            accepted: true,
            message_id: Some(message_id),
            error: None,
        }),
    )
}

/// What a [`RecordingConnector`] sent, for assertions and log-only runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentMessage {
    Channel { channel_id: String, content: String },
    Direct { user_id: String, content: String },
}

/// In-process connector that records every interaction instead of talking to
/// a platform. Serves as the test double and as a dry-run connector.
#[derive(Default)]
pub struct RecordingConnector {
    pub sent: StdMutex<Vec<SentMessage>>,
    pub created_channels: StdMutex<Vec<ChannelRef>>,
    pub deleted_channels: StdMutex<Vec<(String, String)>>,
    /// When true, direct sends report failure (the user "blocks DMs").
    pub fail_direct: std::sync::atomic::AtomicBool,
    /// When true, channel sends error (the platform is unreachable).
    pub fail_channel: std::sync::atomic::AtomicBool,
    callback: StdMutex<Option<EnvelopeCallback>>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects an inbound envelope as if the platform delivered it.
    pub async fn inject(&self, envelope: MessageEnvelope) -> Result<(), TicketError> {
        let callback = self
            .callback
            .lock()
            .expect("connector lock")
            .clone()
            .ok_or(ConnectorError::NotConnected)?;
        callback(envelope).await
    }

    pub fn channel_messages(&self, channel_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .expect("connector lock")
            .iter()
            .filter_map(|m| match m {
                SentMessage::Channel { channel_id: c, content } if c == channel_id => {
                    Some(content.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn direct_messages(&self, user_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .expect("connector lock")
            .iter()
            .filter_map(|m| match m {
                SentMessage::Direct { user_id: u, content } if u == user_id => {
                    Some(content.clone())
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChatConnector for RecordingConnector {
    async fn create_ticket_channel(&self, owner: &UserRef) -> Result<ChannelRef, ConnectorError> {
        let channel = ChannelRef {
            id: format!("ticket-{}", Uuid::new_v4()),
            name: format!("ticket-{}", owner.name.to_lowercase()),
        };
        self.created_channels
            .lock()
            .expect("connector lock")
            .push(channel.clone());
        Ok(channel)
    }

    async fn delete_channel(&self, channel_id: &str, reason: &str) -> Result<(), ConnectorError> {
        self.deleted_channels
            .lock()
            .expect("connector lock")
            .push((channel_id.to_string(), reason.to_string()));
        Ok(())
    }

    async fn send_channel(
        &self,
        channel_id: &str,
        content: &str,
    ) -> Result<SendResult, ConnectorError> {
        if self.fail_channel.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ConnectorError::Send("platform unreachable".to_string()));
        }
        self.sent.lock().expect("connector lock").push(SentMessage::Channel {
            channel_id: channel_id.to_string(),
            content: content.to_string(),
        });
        Ok(SendResult::ok())
    }

    async fn send_direct(
        &self,
        user_id: &str,
        content: &str,
    ) -> Result<SendResult, ConnectorError> {
        if self.fail_direct.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(SendResult {
                success: false,
                message_id: None,
                error: Some("user blocks private messages".to_string()),
            });
        }
        self.sent.lock().expect("connector lock").push(SentMessage::Direct {
            user_id: user_id.to_string(),
            content: content.to_string(),
        });
        Ok(SendResult::ok())
    }

    async fn subscribe(&self, callback: EnvelopeCallback) -> Result<(), ConnectorError> {
        *self.callback.lock().expect("connector lock") = Some(callback);
        Ok(())
    }
}
