//! Burrow: a nostr relay that doubles as a NIP-46 bunker for custodial
//! accounts.

pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod dispatch;
pub mod logging;
pub mod nostr;
pub mod outbox;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod signer;
pub mod storage;
pub mod store;

pub use codec::{EnvelopeCodec, OpenError, SealError};
pub use connection::Connection;
pub use crypto::Keys;
pub use dispatch::{Method, Request, RequestDispatcher, Response};
pub use outbox::{Outbound, Outbox};
pub use registry::SubscriptionRegistry;
pub use relay::{Relay, RelayConfig};
pub use session::{Session, SessionCache, SessionCacheConfig, SessionError};
pub use signer::{LocalSigner, Signer, SignerError};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use store::{AccountStore, JsonAccountStore, SecretVault};
