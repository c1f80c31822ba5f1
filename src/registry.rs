//! Subscription registry
//!
//! Process-wide table of live subscriptions. Keys are namespaced by
//! connection, so two clients may both use `"s1"` without clobbering each
//! other.

use dashmap::DashMap;

use crate::nostr::filter::match_any;
use crate::nostr::{Event, Filter, RelayMessage};
use crate::outbox::{ConnectionId, Outbox};

struct Subscription {
    filters: Vec<Filter>,
    outbox: Outbox,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: DashMap<(ConnectionId, String), Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the subscription `id` owned by `outbox`'s
    /// connection.
    pub fn add(&self, id: impl Into<String>, outbox: &Outbox, filters: Vec<Filter>) {
        let key = (outbox.connection_id(), id.into());
        self.subscriptions.insert(
            key,
            Subscription {
                filters,
                outbox: outbox.clone(),
            },
        );
    }

    pub fn remove(&self, connection: ConnectionId, id: &str) -> bool {
        self.subscriptions
            .remove(&(connection, id.to_string()))
            .is_some()
    }

    /// Drop every subscription owned by `connection`.
    pub fn remove_connection(&self, connection: ConnectionId) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|(owner, _), _| *owner != connection);
        before.saturating_sub(self.subscriptions.len())
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Send `event` to every subscription whose filters match it. Returns
    /// the number of frames queued. Never waits on a socket: a subscriber
    /// whose queue is full loses the frame.
    pub fn publish(&self, event: &Event) -> usize {
        // collect first; no shard lock is held while queueing
        let targets: Vec<(String, Outbox)> = self
            .subscriptions
            .iter()
            .filter(|entry| !entry.outbox.is_closed() && match_any(&entry.filters, event))
            .map(|entry| (entry.key().1.clone(), entry.outbox.clone()))
            .collect();

        let mut delivered = 0;
        for (subscription_id, outbox) in targets {
            let message = RelayMessage::event(subscription_id.as_str(), event.clone());
            if outbox.try_send(&message) {
                delivered += 1;
            } else {
                tracing::debug!(
                    connection = outbox.connection_id(),
                    subscription = %subscription_id,
                    "skipped fan-out"
                );
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keys;
    use crate::nostr::{p_tag, EventTemplate, PublicKey, NOSTR_CONNECT_KIND};
    use crate::outbox::Outbound;
    use tokio::sync::mpsc;

    fn outbox(id: ConnectionId) -> (Outbox, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        (Outbox::new(id, tx, false), rx)
    }

    fn envelope_to(recipient: &str) -> Event {
        EventTemplate::new(NOSTR_CONNECT_KIND, vec![p_tag(recipient).unwrap()], "ciphertext")
            .sign(&Keys::generate())
            .unwrap()
    }

    fn public_key(hex: &str) -> PublicKey {
        PublicKey::from_hex(hex).unwrap()
    }

    fn reserved() -> Filter {
        Filter::new().kind(NOSTR_CONNECT_KIND)
    }

    fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(frame)) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_publish_reaches_matching_subscribers_once() {
        let registry = SubscriptionRegistry::new();
        let (a, mut rx_a) = outbox(1);
        let (b, mut rx_b) = outbox(2);
        let (c, mut rx_c) = outbox(3);

        let client = Keys::generate().public_key_hex();
        registry.add("s1", &a, vec![reserved()]);
        registry.add(
            "s1",
            &b,
            vec![reserved().pubkey(public_key(&client)), reserved()],
        );
        registry.add(
            "other",
            &c,
            vec![reserved().pubkey(public_key(&Keys::generate().public_key_hex()))],
        );

        let event = envelope_to(&client);
        assert_eq!(registry.publish(&event), 2);

        let expected = RelayMessage::event("s1", event).as_json();
        assert_eq!(frames(&mut rx_a), vec![expected.clone()]);
        assert_eq!(frames(&mut rx_b), vec![expected]);
        assert!(frames(&mut rx_c).is_empty());
    }

    #[test]
    fn test_same_id_on_two_connections_is_two_subscriptions() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx_a) = outbox(1);
        let (b, _rx_b) = outbox(2);
        registry.add("s1", &a, vec![]);
        registry.add("s1", &b, vec![]);
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(1, "s1"));
        assert!(!registry.remove(1, "s1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_connection_drops_only_its_subscriptions() {
        let registry = SubscriptionRegistry::new();
        let (a, mut rx_a) = outbox(1);
        let (b, _rx_b) = outbox(2);
        registry.add("s1", &a, vec![reserved()]);
        registry.add("s2", &a, vec![reserved()]);
        registry.add("s1", &b, vec![]);

        assert_eq!(registry.remove_connection(1), 2);
        assert_eq!(registry.len(), 1);

        registry.publish(&envelope_to(&Keys::generate().public_key_hex()));
        assert!(frames(&mut rx_a).is_empty());
    }

    #[test]
    fn test_closed_outbox_is_skipped() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx_a) = outbox(1);
        registry.add("s1", &a, vec![reserved()]);
        a.close();

        assert_eq!(registry.publish(&envelope_to(&Keys::generate().public_key_hex())), 0);
    }

    #[test]
    fn test_stalled_subscriber_does_not_block_others() {
        let registry = SubscriptionRegistry::new();
        let (tx, _stalled_rx) = mpsc::channel(1);
        let stalled = Outbox::new(1, tx, false);
        let (healthy, mut rx) = outbox(2);
        registry.add("s1", &stalled, vec![reserved()]);
        registry.add("s1", &healthy, vec![reserved()]);

        let client = Keys::generate().public_key_hex();
        for _ in 0..5 {
            registry.publish(&envelope_to(&client));
        }

        assert_eq!(frames(&mut rx).len(), 5);
        assert_eq!(stalled.drop_count(), 4);
        assert!(!stalled.is_closed());
    }
}
