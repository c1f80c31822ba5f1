//! NIP-46 request dispatch
//!
//! Decrypted requests are `{id, method, params}`; every request produces
//! exactly one `{id, result}` or `{id, error}` response, including when the
//! handler panics.

use futures::FutureExt;
use nostr_sdk::JsonUtil;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;

use crate::nostr::EventTemplate;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn result(id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Ping,
    Connect,
    GetPublicKey,
    SignEvent,
    Nip44Encrypt,
    Nip44Decrypt,
    Unknown(String),
}

impl Method {
    pub fn parse(name: &str) -> Self {
        match name {
            "ping" => Self::Ping,
            "connect" => Self::Connect,
            "get_public_key" | "get_identity" => Self::GetPublicKey,
            "sign_event" | "sign" => Self::SignEvent,
            "nip44_encrypt" | "seal" => Self::Nip44Encrypt,
            "nip44_decrypt" | "open" => Self::Nip44Decrypt,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Errors a handler reports back to the client. The display strings are
/// what the client sees.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("unrecognized method")]
    UnrecognizedMethod,
    #[error("invalid secret")]
    InvalidSecret,
    #[error("failed to get public key")]
    PublicKey,
    #[error("failed to sign")]
    Sign,
    #[error("failed to encrypt")]
    Encrypt,
    #[error("failed to decrypt")]
    Decrypt,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RequestDispatcher;

impl RequestDispatcher {
    pub fn new() -> Self {
        Self
    }

    pub async fn dispatch(&self, session: &Session, request: Request) -> Response {
        let method = Method::parse(&request.method);
        let outcome = AssertUnwindSafe(self.handle(session, &method, &request.params))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => Response::result(request.id, result),
            Ok(Err(error)) => {
                tracing::debug!(id = %request.id, method = %request.method, %error, "request failed");
                Response::error(request.id, error.to_string())
            }
            Err(_) => {
                tracing::error!(id = %request.id, method = %request.method, "request handler panicked");
                Response::error(request.id, "internal error")
            }
        }
    }

    async fn handle(
        &self,
        session: &Session,
        method: &Method,
        params: &[Value],
    ) -> Result<String, DispatchError> {
        match method {
            Method::Ping => Ok("pong".to_string()),
            Method::Connect => {
                // params: [remote signer pubkey, optional secret, optional perms]
                match param_str(params, 1) {
                    Some(secret) if !secret.is_empty() && secret != session.connect_secret => {
                        Err(DispatchError::InvalidSecret)
                    }
                    _ => Ok("ack".to_string()),
                }
            }
            Method::GetPublicKey => session.signer.public_key().await.map_err(|e| {
                tracing::debug!(error = %e, "get_public_key failed");
                DispatchError::PublicKey
            }),
            Method::SignEvent => {
                let template = parse_template(params).ok_or(DispatchError::Sign)?;
                let event = session.signer.sign_event(template).await.map_err(|e| {
                    tracing::debug!(error = %e, "sign_event failed");
                    DispatchError::Sign
                })?;
                Ok(event.as_json())
            }
            Method::Nip44Encrypt => {
                let (peer, text) = peer_and_text(params).ok_or(DispatchError::Encrypt)?;
                session
                    .signer
                    .nip44_encrypt(peer, text)
                    .await
                    .map_err(|e| {
                        tracing::debug!(error = %e, "nip44_encrypt failed");
                        DispatchError::Encrypt
                    })
            }
            Method::Nip44Decrypt => {
                let (peer, text) = peer_and_text(params).ok_or(DispatchError::Decrypt)?;
                session
                    .signer
                    .nip44_decrypt(peer, text)
                    .await
                    .map_err(|e| {
                        tracing::debug!(error = %e, "nip44_decrypt failed");
                        DispatchError::Decrypt
                    })
            }
            Method::Unknown(_) => Err(DispatchError::UnrecognizedMethod),
        }
    }
}

fn param_str(params: &[Value], index: usize) -> Option<&str> {
    params.get(index).and_then(Value::as_str)
}

fn peer_and_text(params: &[Value]) -> Option<(&str, &str)> {
    Some((param_str(params, 0)?, param_str(params, 1)?))
}

/// NIP-46 sends the template as a JSON string; a bare object is accepted
/// too.
fn parse_template(params: &[Value]) -> Option<EventTemplate> {
    match params.first()? {
        Value::String(raw) => serde_json::from_str(raw).ok(),
        value @ Value::Object(_) => serde_json::from_value(value.clone()).ok(),
        _ => None,
    }
}
