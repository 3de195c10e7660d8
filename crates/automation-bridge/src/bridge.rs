//! Dispatch and inbound routing on top of [`RequestTracker`].
//!
//! The bridge owns no socket. A [`Transport`] carries outbound messages; the
//! transport's read loop hands every decoded inbound message to
//! [`AutomationBridge::handle_message`] and reports connection loss through
//! [`AutomationBridge::handle_disconnect`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{BridgeConfig, MIN_REQUEST_TIMEOUT};
use crate::error::BridgeError;
use crate::protocol::{AutomationResponse, InboundMessage, OutboundMessage, Payload};
use crate::request_id::RequestId;
use crate::tracker::{Admission, PendingDetail, RequestTracker};

const SHUTDOWN_REASON: &str = "Automation bridge server stopped";

/// Outbound half of the worker connection.
///
/// This abstraction lets the bridge be driven without a live socket.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Deliver one message to the worker. An error means it was not sent.
    async fn send(&self, message: OutboundMessage) -> Result<(), BridgeError>;
}

/// Point-in-time view of the bridge for health endpoints and diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub connected: bool,
    pub pending_requests: usize,
    pub pending_request_details: Vec<PendingDetail>,
    pub max_pending_requests: usize,
    pub queued_requests: usize,
    pub last_request_sent_at: Option<DateTime<Utc>>,
    pub coalesced_requests: usize,
}

/// Slot in the capacity wait queue; released on drop.
struct QueueTicket<'a> {
    queued: &'a AtomicUsize,
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct AutomationBridge {
    tracker: RequestTracker,
    transport: Arc<dyn Transport>,
    config: BridgeConfig,
    queued: AtomicUsize,
    disconnected: AtomicBool,
    stopped: AtomicBool,
}

impl AutomationBridge {
    pub fn new(config: BridgeConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            tracker: RequestTracker::new(config.tracker.clone()),
            transport,
            config,
            queued: AtomicUsize::new(0),
            disconnected: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    fn is_available(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
            && !self.disconnected.load(Ordering::SeqCst)
            && self.transport.is_connected()
    }

    /// Dispatch `action` to the worker and wait for its terminal response.
    ///
    /// Identical concurrent calls to an idempotent action share one dispatch.
    /// At capacity the call waits for a slot, up to `max_queued_requests`
    /// waiters. `timeout` defaults to the configured request timeout.
    pub async fn send_request(
        &self,
        action: &str,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<AutomationResponse, BridgeError> {
        if !self.is_available() {
            return Err(BridgeError::NotConnected);
        }

        let timeout = timeout
            .map(|t| t.max(MIN_REQUEST_TIMEOUT))
            .unwrap_or(self.config.tracker.default_request_timeout);
        let mut ticket: Option<QueueTicket<'_>> = None;

        let (request_id, completion) = loop {
            let released = self.tracker.released();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.tracker.admit(action, payload.clone(), timeout) {
                Ok(Admission::Created(request_id, completion)) => break (request_id, completion),
                Ok(Admission::Joined(existing)) => return existing.await,
                Err(BridgeError::CapacityExceeded { limit }) => {
                    if ticket.is_none() {
                        ticket = Some(self.enqueue()?);
                        tracing::debug!(
                            action,
                            limit,
                            queued = self.queued.load(Ordering::SeqCst),
                            "Waiting for pending request capacity"
                        );
                    }
                    released.await;
                    if !self.is_available() {
                        return Err(BridgeError::NotConnected);
                    }
                }
                Err(e) => return Err(e),
            }
        };
        drop(ticket);

        // Shutdown or disconnect may have drained the store after the entry check.
        if !self.is_available() {
            self.tracker
                .reject_request(&request_id, BridgeError::NotConnected);
            return completion.await;
        }

        let message = OutboundMessage::AutomationRequest {
            request_id: request_id.to_string(),
            action: action.to_string(),
            payload,
        };
        if let Err(e) = self.transport.send(message).await {
            let error = match e {
                BridgeError::SendFailed(_) => e,
                other => BridgeError::SendFailed(other.to_string()),
            };
            tracing::warn!(%request_id, action, error = %error, "Failed to dispatch request");
            self.tracker.reject_request(&request_id, error);
        }

        completion.await
    }

    fn enqueue(&self) -> Result<QueueTicket<'_>, BridgeError> {
        let limit = self.config.max_queued_requests;
        self.queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| BridgeError::QueueFull { limit })?;
        Ok(QueueTicket {
            queued: &self.queued,
        })
    }

    /// Decode and route one inbound text frame. Malformed frames are logged and dropped.
    pub async fn handle_text(&self, text: &str) {
        match InboundMessage::parse(text) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => tracing::warn!(error = %e, "Dropping malformed inbound message"),
        }
    }

    /// Route one inbound message. Never fails; bad ids are logged.
    pub async fn handle_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::AutomationResponse(response) => {
                let Some(request_id) = parse_request_id(&response.request_id) else {
                    return;
                };
                if !self.tracker.is_pending(&request_id) {
                    tracing::warn!(%request_id, "Response for unknown or settled request");
                    return;
                }
                self.tracker.resolve_request(&request_id, response);
            }
            InboundMessage::ProgressUpdate(update) => {
                let Some(request_id) = parse_request_id(&update.request_id) else {
                    return;
                };
                let percent = update.valid_percent();
                if update.percent.is_some() && percent.is_none() {
                    tracing::debug!(
                        %request_id,
                        percent = update.percent,
                        "Ignoring out-of-range progress percent"
                    );
                }
                self.tracker
                    .extend_timeout(&request_id, percent, update.message.as_deref());
            }
            InboundMessage::AutomationEvent(event) => {
                let Some(raw_id) = event.request_id.clone() else {
                    tracing::debug!(event = ?event.event, "Automation event without request id");
                    return;
                };
                let Some(request_id) = parse_request_id(&raw_id) else {
                    return;
                };
                if self.tracker.is_pending(&request_id) {
                    self.tracker
                        .resolve_request(&request_id, event.into_response(raw_id));
                } else {
                    tracing::debug!(%request_id, "Automation event for request no longer pending");
                }
            }
            InboundMessage::BridgePing { .. } => {
                let pong = OutboundMessage::BridgePong {
                    timestamp: Some(Utc::now().to_rfc3339()),
                };
                if let Err(e) = self.transport.send(pong).await {
                    tracing::warn!(error = %e, "Failed to answer bridge ping");
                }
            }
            InboundMessage::BridgePong { .. } => {
                tracing::trace!("Bridge pong received");
            }
            InboundMessage::BridgeAck(ack) => {
                tracing::info!(
                    server_name = ack.server_name.as_deref(),
                    server_version = ack.server_version.as_deref(),
                    protocol_version = ack.protocol_version,
                    "Automation bridge handshake acknowledged"
                );
            }
            InboundMessage::BridgeError { error, message } => {
                tracing::warn!(
                    error = error.as_deref(),
                    detail = message.as_deref(),
                    "Automation bridge reported an error"
                );
            }
            InboundMessage::BridgeGoodbye { reason, .. } => {
                tracing::info!(reason = reason.as_deref(), "Automation bridge said goodbye");
            }
        }
    }

    /// Fail everything in flight after the worker connection dropped.
    ///
    /// The bridge refuses new work until [`Self::handle_connect`], whatever
    /// the transport reports.
    pub fn handle_disconnect(&self, reason: &str) {
        self.disconnected.store(true, Ordering::SeqCst);
        tracing::info!(
            reason,
            pending = self.tracker.pending_count(),
            "Automation bridge disconnected"
        );
        self.tracker
            .reject_all(BridgeError::Disconnected(reason.to_string()));
    }

    /// Accept work again once the transport has (re)established its connection.
    pub fn handle_connect(&self) {
        if self.disconnected.swap(false, Ordering::SeqCst) {
            tracing::info!("Automation bridge reconnected");
        }
    }

    /// Stop accepting requests and fail everything in flight.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(pending = self.tracker.pending_count(), "Automation bridge shutting down");
        self.tracker
            .reject_all(BridgeError::Rejected(SHUTDOWN_REASON.to_string()));
    }

    pub fn cancel_request(&self, request_id: &RequestId) {
        self.tracker.cancel_request(request_id);
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            connected: self.is_available(),
            pending_requests: self.tracker.pending_count(),
            pending_request_details: self.tracker.pending_details(),
            max_pending_requests: self.tracker.max_pending_requests(),
            queued_requests: self.queued.load(Ordering::SeqCst),
            last_request_sent_at: self.tracker.last_request_sent_at(),
            coalesced_requests: self.tracker.coalesced_count(),
        }
    }
}

fn parse_request_id(raw: &str) -> Option<RequestId> {
    match RequestId::parse(raw) {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(request_id = raw, error = %e, "Inbound message with invalid request id");
            None
        }
    }
}
