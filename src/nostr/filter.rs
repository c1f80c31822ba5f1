//! Subscription filters
//!
//! Filters are nostr-sdk's [`Filter`]. The kind restriction is checked on the
//! raw JSON so a kind outside the u16 range still counts as "not 24133"
//! rather than as a malformed filter.

use nostr_sdk::{Event, Filter, Kind};
use serde_json::Value;

/// True when the raw filter has a non-empty `kinds` list made only of
/// `kind`.
pub fn is_restricted_to_kind(filter: &Value, kind: Kind) -> bool {
    let wanted = u64::from(kind.as_u16());
    filter
        .get("kinds")
        .and_then(Value::as_array)
        .is_some_and(|kinds| !kinds.is_empty() && kinds.iter().all(|k| k.as_u64() == Some(wanted)))
}

/// OR across the filters of one subscription.
pub fn match_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|filter| filter.match_event(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keys;
    use crate::nostr::event::{p_tag, EventTemplate, NOSTR_CONNECT_KIND};
    use nostr_sdk::{PublicKey, Timestamp};
    use serde_json::json;

    fn envelope(to: &str) -> (Event, Keys) {
        let keys = Keys::generate();
        let event = EventTemplate::new(NOSTR_CONNECT_KIND, vec![p_tag(to).unwrap()], "ciphertext")
            .sign(&keys)
            .unwrap();
        (event, keys)
    }

    fn public_key(keys: &Keys) -> PublicKey {
        PublicKey::from_hex(&keys.public_key_hex()).unwrap()
    }

    #[test]
    fn test_kind_restriction() {
        assert!(is_restricted_to_kind(&json!({"kinds": [24133]}), NOSTR_CONNECT_KIND));
        assert!(is_restricted_to_kind(
            &json!({"kinds": [24133, 24133], "#p": ["x"]}),
            NOSTR_CONNECT_KIND
        ));
        assert!(!is_restricted_to_kind(&json!({"kinds": [24133, 1]}), NOSTR_CONNECT_KIND));
        assert!(!is_restricted_to_kind(&json!({"kinds": []}), NOSTR_CONNECT_KIND));
        assert!(!is_restricted_to_kind(&json!({}), NOSTR_CONNECT_KIND));
        assert!(!is_restricted_to_kind(&json!({"kinds": "24133"}), NOSTR_CONNECT_KIND));
    }

    #[test]
    fn test_out_of_range_kind_is_unrestricted() {
        // 24133 + 65536 must not wrap around to the reserved kind
        assert!(!is_restricted_to_kind(&json!({"kinds": [89669]}), NOSTR_CONNECT_KIND));
        assert!(!is_restricted_to_kind(&json!({"kinds": [-1]}), NOSTR_CONNECT_KIND));
    }

    #[test]
    fn test_matches_kind_and_p_tag() {
        let client = Keys::generate();
        let (event, _) = envelope(&client.public_key_hex());

        assert!(Filter::new().kind(NOSTR_CONNECT_KIND).match_event(&event));
        assert!(!Filter::new().kind(Kind::TextNote).match_event(&event));
        assert!(Filter::new()
            .kind(NOSTR_CONNECT_KIND)
            .pubkey(public_key(&client))
            .match_event(&event));
        assert!(!Filter::new()
            .kind(NOSTR_CONNECT_KIND)
            .pubkey(public_key(&Keys::generate()))
            .match_event(&event));
    }

    #[test]
    fn test_matches_authors_and_time() {
        let (event, keys) = envelope(&Keys::generate().public_key_hex());

        assert!(Filter::new().author(public_key(&keys)).match_event(&event));
        assert!(!Filter::new()
            .author(public_key(&Keys::generate()))
            .match_event(&event));

        let later = Timestamp::from(event.created_at.as_u64() + 10);
        assert!(!Filter::new().since(later).match_event(&event));
        assert!(Filter::new().until(event.created_at).match_event(&event));
    }

    #[test]
    fn test_wire_filter_matches() {
        let client = Keys::generate().public_key_hex();
        let (event, _) = envelope(&client);
        let filter: Filter =
            serde_json::from_value(json!({"kinds": [24133], "#p": [client], "limit": 0})).unwrap();
        assert!(filter.match_event(&event));
    }

    #[test]
    fn test_match_any() {
        let (event, _) = envelope(&Keys::generate().public_key_hex());
        let filters = vec![
            Filter::new().kind(Kind::TextNote),
            Filter::new().kind(NOSTR_CONNECT_KIND),
        ];
        assert!(match_any(&filters, &event));
        assert!(!match_any(&filters[..1], &event));
        assert!(!match_any(&[], &event));
    }
}
