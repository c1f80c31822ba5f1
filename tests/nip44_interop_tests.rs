//! Interoperability with nostr-sdk: NIP-44 payloads, BIP-340 signatures made
//! by our keys, and a NIP-46 request built entirely by a stock client.

use std::sync::Arc;
use std::time::Duration;

use burrow::crypto::{nip44, schnorr};
use burrow::nostr::{is_addressed_to, p_tag, Event, EventTemplate, NOSTR_CONNECT_KIND};
use burrow::{
    AccountStore, JsonAccountStore, Keys, MemoryStorage, Outbound, Relay, RelayConfig,
    SecretVault,
};
use nostr_sdk::nips::nip44 as sdk_nip44;
use nostr_sdk::{EventBuilder, JsonUtil, Kind, PublicKey, Tag};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn secret_bytes(keys: &Keys) -> [u8; 32] {
    hex::decode(keys.secret_key_hex())
        .unwrap()
        .try_into()
        .unwrap()
}

/// The same identity on both sides.
fn paired_keys() -> (Keys, nostr_sdk::Keys) {
    let ours = Keys::generate();
    let theirs = nostr_sdk::Keys::parse(&ours.secret_key_hex()).unwrap();
    (ours, theirs)
}

#[test]
fn test_public_keys_agree() {
    let (ours, theirs) = paired_keys();
    assert_eq!(ours.public_key_hex(), theirs.public_key().to_hex());
}

#[test]
fn test_sdk_decrypts_our_payloads() {
    let (alice, _) = paired_keys();
    let (_, bob_sdk) = paired_keys();
    let bob_pk = schnorr::parse_public_key(&bob_sdk.public_key().to_hex()).unwrap();

    let message = r#"{"id":"r1","method":"ping","params":[]}"#;
    let payload = nip44::encrypt_for_recipient(message.as_bytes(), &secret_bytes(&alice), &bob_pk)
        .unwrap();

    let alice_pk = PublicKey::from_hex(&alice.public_key_hex()).unwrap();
    let decrypted = sdk_nip44::decrypt(bob_sdk.secret_key(), &alice_pk, &payload).unwrap();
    assert_eq!(decrypted, message);
}

#[test]
fn test_we_decrypt_sdk_payloads() {
    let (_, alice_sdk) = paired_keys();
    let (bob, _) = paired_keys();

    let bob_pk = PublicKey::from_hex(&bob.public_key_hex()).unwrap();
    // long enough to cross several padding buckets
    let message = "nostr ".repeat(200);
    let payload = sdk_nip44::encrypt(
        alice_sdk.secret_key(),
        &bob_pk,
        &message,
        sdk_nip44::Version::V2,
    )
    .unwrap();

    let alice_pk = schnorr::parse_public_key(&alice_sdk.public_key().to_hex()).unwrap();
    let decrypted = nip44::decrypt_from_sender(&payload, &secret_bytes(&bob), &alice_pk).unwrap();
    assert_eq!(String::from_utf8(decrypted).unwrap(), message);
}

#[test]
fn test_sdk_verifies_our_events() {
    let (keys, sdk_keys) = paired_keys();
    let event = EventTemplate::new(
        NOSTR_CONNECT_KIND,
        vec![p_tag(&keys.public_key_hex()).unwrap()],
        "content with \"quotes\", unicode ☕ and a\nnewline",
    )
    .sign(&keys)
    .unwrap();

    let parsed = Event::from_json(event.as_json()).unwrap();
    parsed.verify().unwrap();
    assert_eq!(parsed.id, event.id);
    assert_eq!(parsed.pubkey, sdk_keys.public_key());
}

#[test]
fn test_we_verify_sdk_events() {
    let keys = nostr_sdk::Keys::generate();
    let sdk_event = EventBuilder::new(Kind::TextNote, "hello from nostr-sdk")
        .tags(vec![Tag::public_key(keys.public_key())])
        .sign_with_keys(&keys)
        .unwrap();

    let event = Event::from_json(&sdk_event.as_json()).unwrap();
    event.verify().unwrap();
    assert_eq!(event.pubkey.to_hex(), keys.public_key().to_hex());
    assert!(is_addressed_to(&event, &keys.public_key().to_hex()));
}

#[tokio::test]
async fn test_stock_client_request_round_trip() {
    let relay_keys = Keys::generate();
    let vault = SecretVault::new(Arc::new(Keys::parse(&relay_keys.secret_key_hex()).unwrap()));
    let user = Keys::generate();
    let client = nostr_sdk::Keys::generate();

    let store = Arc::new(JsonAccountStore::open(MemoryStorage::new()).unwrap());
    store
        .create_account("user@example.com", &vault.seal_secret(&user.secret_key_hex()).unwrap())
        .unwrap();
    store
        .create_session("user@example.com", &client.public_key().to_hex(), "secret")
        .unwrap();

    let relay = Relay::new(relay_keys, store, RelayConfig::default());
    let relay_pk = PublicKey::from_hex(relay.public_key()).unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let conn = relay.connect(tx);

    let filter = json!({"kinds": [24133], "#p": [client.public_key().to_hex()]});
    conn.handle(&json!(["REQ", "nip46", filter]).to_string()).await;

    let request = json!({"id": "abc", "method": "get_public_key", "params": []});
    let content = sdk_nip44::encrypt(
        client.secret_key(),
        &relay_pk,
        request.to_string(),
        sdk_nip44::Version::V2,
    )
    .unwrap();
    let envelope = EventBuilder::new(Kind::NostrConnect, content)
        .tags(vec![Tag::public_key(relay_pk)])
        .sign_with_keys(&client)
        .unwrap();
    let envelope_json: Value = serde_json::from_str(&envelope.as_json()).unwrap();
    conn.handle(&json!(["EVENT", envelope_json]).to_string()).await;

    let mut frames = Vec::new();
    while frames.len() < 3 {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Outbound::Frame(frame))) => frames.push(serde_json::from_str::<Value>(&frame).unwrap()),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    assert_eq!(frames[0], json!(["EOSE", "nip46"]));
    assert_eq!(frames[1], json!(["OK", envelope.id.to_hex(), true, ""]));

    let response = nostr_sdk::Event::from_json(frames[2][2].to_string()).unwrap();
    response.verify().unwrap();
    assert_eq!(response.kind, Kind::NostrConnect);
    assert_eq!(response.pubkey, relay_pk);

    let plaintext = sdk_nip44::decrypt(client.secret_key(), &relay_pk, &response.content).unwrap();
    let payload: Value = serde_json::from_str(&plaintext).unwrap();
    assert_eq!(payload, json!({"id": "abc", "result": user.public_key_hex()}));
}
