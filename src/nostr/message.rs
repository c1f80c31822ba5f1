//! Relay wire messages
//!
//! Inbound frames are parsed once into [`ClientMessage`]; outbound frames are
//! built from [`RelayMessage`]. Both the burrow verbs and the NIP-01 spellings
//! are accepted on input. Filters and events are nostr-sdk types; `EOSE` and
//! `EVENT` frames are serialised by nostr-sdk. `OK` carries whatever id the
//! client sent and `NOTICE` has burrow's three-element shape, so those two
//! are written here.

use nostr_sdk::{Event, Filter, JsonUtil, SubscriptionId};
use serde_json::{json, Value};

use super::event::NOSTR_CONNECT_KIND;
use super::filter::is_restricted_to_kind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Unable to parse message")]
    Parse,
    #[error("Unable to read message")]
    Read,
    #[error("Only filters matching kind 24133 events are accepted")]
    UnsupportedFilter,
    #[error("Invalid subscription request")]
    InvalidSubscription,
    #[error("Invalid event")]
    InvalidEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Every filter is restricted to kind 24133.
    Subscribe { id: String, filters: Vec<Filter> },
    Unsubscribe { id: String },
    /// The event is kept raw so a malformed one can still be acknowledged
    /// by id.
    Publish { event: Value },
    Unknown { verb: String },
}

impl ClientMessage {
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(raw).map_err(|_| FrameError::Parse)?;
        let mut items = match value {
            Value::Array(items) if !items.is_empty() => items.into_iter(),
            _ => return Err(FrameError::Read),
        };
        let verb = match items.next() {
            Some(Value::String(verb)) => verb,
            _ => return Err(FrameError::Read),
        };

        match verb.as_str() {
            "SUBSCRIBE" | "REQ" => {
                let id = subscription_id(items.next())?;
                let filters = subscription_filters(items.collect())?;
                Ok(Self::Subscribe { id, filters })
            }
            "UNSUBSCRIBE" | "CLOSE" => {
                let id = subscription_id(items.next())?;
                Ok(Self::Unsubscribe { id })
            }
            "PUBLISH" | "EVENT" => match items.next() {
                Some(event @ Value::Object(_)) => Ok(Self::Publish { event }),
                _ => Err(FrameError::InvalidEvent),
            },
            _ => Ok(Self::Unknown { verb }),
        }
    }
}

fn subscription_id(value: Option<Value>) -> Result<String, FrameError> {
    match value {
        Some(Value::String(id)) if !id.is_empty() => Ok(id),
        _ => Err(FrameError::InvalidSubscription),
    }
}

/// Shape first, then the kind restriction, then the full filter parse.
fn subscription_filters(raw: Vec<Value>) -> Result<Vec<Filter>, FrameError> {
    if !raw.iter().all(Value::is_object) {
        return Err(FrameError::InvalidSubscription);
    }
    if raw.is_empty()
        || !raw
            .iter()
            .all(|filter| is_restricted_to_kind(filter, NOSTR_CONNECT_KIND))
    {
        return Err(FrameError::UnsupportedFilter);
    }
    raw.into_iter()
        .map(serde_json::from_value::<Filter>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| FrameError::InvalidSubscription)
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Eose {
        subscription_id: String,
    },
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice {
        message: String,
    },
}

impl RelayMessage {
    pub fn eose(subscription_id: impl Into<String>) -> Self {
        Self::Eose {
            subscription_id: subscription_id.into(),
        }
    }

    pub fn event(subscription_id: impl Into<String>, event: Event) -> Self {
        Self::Event {
            subscription_id: subscription_id.into(),
            event: Box::new(event),
        }
    }

    pub fn ok(event_id: impl Into<String>, accepted: bool, message: impl Into<String>) -> Self {
        Self::Ok {
            event_id: event_id.into(),
            accepted,
            message: message.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Self::Notice {
            message: message.into(),
        }
    }

    pub fn as_json(&self) -> String {
        match self {
            Self::Eose { subscription_id } => {
                nostr_sdk::RelayMessage::eose(SubscriptionId::new(subscription_id)).as_json()
            }
            Self::Event {
                subscription_id,
                event,
            } => nostr_sdk::RelayMessage::event(
                SubscriptionId::new(subscription_id),
                event.as_ref().clone(),
            )
            .as_json(),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]).to_string(),
            Self::Notice { message } => json!(["NOTICE", "", message]).to_string(),
        }
    }
}
