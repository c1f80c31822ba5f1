//! Per-socket protocol state machine
//!
//! A [`Connection`] parses inbound frames, keeps the ids of the
//! subscriptions it owns, and runs the publish pipeline: validate the
//! envelope, open it, resolve the client's session, acknowledge, then hand
//! the request to a detached task whose response is fanned out through the
//! registry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::codec::OpenError;
use crate::dispatch::Request;
use crate::nostr::{is_addressed_to, ClientMessage, Event, Filter, RelayMessage, NOSTR_CONNECT_KIND};
use crate::outbox::{ConnectionId, Outbox};
use crate::relay::Relay;
use crate::session::SessionError;

pub struct Connection {
    relay: Arc<Relay>,
    outbox: Outbox,
    subscriptions: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(relay: Arc<Relay>, outbox: Outbox) -> Self {
        Self {
            relay,
            outbox,
            subscriptions: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.outbox.connection_id()
    }

    pub fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subscriptions.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn send(&self, message: &RelayMessage) -> bool {
        self.outbox.send(message).await
    }

    /// Handle one inbound text frame. Every failure is answered on the
    /// socket; nothing propagates to the caller.
    pub async fn handle(&self, raw: &str) {
        if self.is_closed() {
            return;
        }
        if self.relay.config().log_relay_messages {
            tracing::info!(connection = self.id(), frame = %raw, "relay recv");
        }

        match ClientMessage::parse(raw) {
            Ok(ClientMessage::Subscribe { id, filters }) => self.on_subscribe(id, filters).await,
            Ok(ClientMessage::Unsubscribe { id }) => self.on_unsubscribe(&id),
            Ok(ClientMessage::Publish { event }) => self.on_publish(event).await,
            Ok(ClientMessage::Unknown { verb }) => {
                self.notice(format!("Unable to handle {verb} message")).await;
            }
            Err(e) => {
                tracing::debug!(connection = self.id(), error = %e, "rejected frame");
                self.notice(e.to_string()).await;
            }
        }
    }

    /// Close the socket and drop every subscription this connection owns.
    /// Idempotent.
    pub fn cleanup(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // closing the outbox first stops any fan-out already in flight
        self.outbox.close();

        self.subscriptions.lock().clear();
        let removed = self.relay.registry().remove_connection(self.id());
        tracing::debug!(connection = self.id(), subscriptions = removed, "connection closed");
    }

    async fn notice(&self, message: impl Into<String>) {
        self.send(&RelayMessage::notice(message)).await;
    }

    async fn reject(&self, event_id: &str, reason: &str) {
        tracing::debug!(connection = self.id(), event = %event_id, reason, "rejected event");
        self.send(&RelayMessage::ok(event_id, false, reason)).await;
    }

    async fn on_subscribe(&self, id: String, filters: Vec<Filter>) {
        self.relay.registry().add(id.as_str(), &self.outbox, filters);
        self.subscriptions.lock().insert(id.clone());
        tracing::debug!(connection = self.id(), subscription = %id, "subscribed");

        self.send(&RelayMessage::eose(id)).await;
    }

    fn on_unsubscribe(&self, id: &str) {
        if self.subscriptions.lock().remove(id) {
            self.relay.registry().remove(self.id(), id);
            tracing::debug!(connection = self.id(), subscription = %id, "unsubscribed");
        }
    }

    async fn on_publish(&self, raw: Value) {
        let event: Event = match serde_json::from_value(raw.clone()) {
            Ok(event) => event,
            Err(_) => {
                match raw.get("id").and_then(Value::as_str) {
                    Some(id) => self.reject(id, "Malformed event").await,
                    None => self.notice("Invalid event").await,
                }
                return;
            }
        };

        let event_id = event.id.to_hex();
        let client = event.pubkey.to_hex();

        if event.kind != NOSTR_CONNECT_KIND {
            return self
                .reject(&event_id, "Only kind 24133 events are accepted")
                .await;
        }
        if !is_addressed_to(&event, self.relay.public_key()) {
            return self.reject(&event_id, "Event must p-tag this relay").await;
        }
        if event.verify().is_err() {
            return self.reject(&event_id, "Invalid event signature").await;
        }

        let request: Request = match self.relay.codec().open(&event) {
            Ok(request) => request,
            Err(OpenError::NotAddressed) => {
                return self.reject(&event_id, "Event must p-tag this relay").await;
            }
            Err(OpenError::Decrypt(_)) => {
                return self
                    .reject(&event_id, "Failed to decrypt event content")
                    .await;
            }
            Err(OpenError::Decode(_)) => {
                return self
                    .reject(&event_id, "Failed to decode event content")
                    .await;
            }
        };

        let session = match self.relay.sessions().resolve(&client).await {
            Ok(session) => session,
            Err(SessionError::NotFound) => {
                return self.reject(&event_id, "No active session found").await;
            }
            Err(e) => {
                tracing::warn!(client = %client, error = %e, "session resolution failed");
                return self.reject(&event_id, "No active session found").await;
            }
        };

        self.send(&RelayMessage::ok(event_id, true, "")).await;

        if self.relay.config().log_nip46_messages {
            tracing::info!(
                client = %client,
                id = %request.id,
                method = %request.method,
                params = %serde_json::Value::from(request.params.clone()),
                "nip46 request"
            );
        }

        let relay = self.relay.clone();
        tokio::spawn(async move {
            relay.respond(session, request).await;
        });
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cleanup();
    }
}
