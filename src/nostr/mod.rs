//! Nostr event model and relay wire protocol
//!
//! Provides:
//! - Event templates signed with burrow keys, on nostr-sdk's event model
//! - The reserved-kind restriction for subscription filters
//! - Inbound/outbound relay frames

pub mod event;
pub mod filter;
pub mod message;

pub use event::{is_addressed_to, p_tag, EventTemplate, NOSTR_CONNECT_KIND};
pub use message::{ClientMessage, FrameError, RelayMessage};
pub use nostr_sdk::{Event, EventId, Filter, Kind, PublicKey, Tag, Timestamp};
