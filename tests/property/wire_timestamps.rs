//! Property-based tests for timestamp normalization and relay frame decoding.
//!
//! Uses proptest to verify:
//! 1. Every wire shape of one instant normalizes to that instant.
//! 2. Arbitrary JSON in the `sentAt` position never makes a record
//!    undecodable; it degrades to the sentinel instead.
//! 3. Random text never causes a panic in frame decoding.

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use projchat_proto::message::ServerMessage;
use projchat_proto::relay;
use projchat_proto::timestamp::{SentAt, TimestampStyle, WireTimestamp};

/// Instants between 1970 and 2100 at millisecond precision.
fn arb_instant() -> impl Strategy<Value = DateTime<Utc>> {
    (0..4_102_444_800_000i64).prop_map(|ms| DateTime::from_timestamp_millis(ms).unwrap_or_default())
}

fn arb_json_leaf() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::Bool),
        any::<i64>().prop_map(serde_json::Value::from),
        any::<f64>().prop_map(serde_json::Value::from),
        ".{0,32}".prop_map(serde_json::Value::String),
    ]
}

fn arb_json() -> impl Strategy<Value = serde_json::Value> {
    arb_json_leaf().prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::Array),
            prop::collection::hash_map("[a-z_]{1,12}", inner, 0..4)
                .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
        ]
    })
}

proptest! {
    #[test]
    fn all_styles_agree_on_the_instant(instant in arb_instant()) {
        for style in [
            TimestampStyle::Iso,
            TimestampStyle::EpochSeconds,
            TimestampStyle::EpochMillis,
            TimestampStyle::Native,
        ] {
            let wire = style.render(instant);
            prop_assert_eq!(SentAt::from_wire(&wire), SentAt::At(instant), "style {:?}", style);

            // The same holds after a trip through JSON.
            let json = serde_json::to_value(&wire).unwrap();
            let back: WireTimestamp = serde_json::from_value(json).unwrap();
            prop_assert_eq!(SentAt::from_wire(&back), SentAt::At(instant), "style {:?}", style);
        }
    }

    #[test]
    fn underscore_epoch_fields_are_accepted(instant in arb_instant()) {
        let json = serde_json::json!({
            "_seconds": instant.timestamp(),
            "_nanoseconds": instant.timestamp_subsec_nanos(),
        });
        let wire: WireTimestamp = serde_json::from_value(json).unwrap();
        prop_assert_eq!(SentAt::from_wire(&wire), SentAt::At(instant));
    }

    #[test]
    fn any_sent_at_value_still_decodes(value in arb_json()) {
        let json = serde_json::json!({
            "id": "srv-1",
            "senderId": "bob",
            "recipientId": "alice",
            "projectId": "p",
            "content": "hi",
            "sentAt": value,
        });
        let record: ServerMessage = serde_json::from_value(json).unwrap();
        // Known or sentinel, never a decode failure.
        let sent_at = record.sent_at();
        prop_assert!(sent_at.is_known() || sent_at == SentAt::Unknown);
    }

    #[test]
    fn random_text_never_panics_frame_decode(text in ".{0,512}") {
        let _ = relay::decode(&text);
    }
}
