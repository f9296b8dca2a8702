//! Property-based tests for inbound message classification.
//!
//! **Property 3: Transcript Normalization**
//! *For any* JSON payload and any transcript-family tag, the inbound message
//! SHALL be normalized to a single `final_transcript` event carrying the
//! payload unchanged.
//!
//! **Property 4: Unknown Messages Surface as Errors**
//! *For any* tag outside the known set, the message SHALL produce exactly one
//! `error` event whose payload is the raw message, and no negotiation action.

use adk_webcall::negotiation::{NegotiationAction, NegotiationPhase, plan};
use adk_webcall::{CallErrorKind, CallEvent, InboundMessage, TranscriptTag};
use proptest::prelude::*;
use serde_json::{Value, json};

fn arb_tag() -> impl Strategy<Value = TranscriptTag> {
    proptest::sample::select(TranscriptTag::ALL.to_vec())
}

fn arb_payload() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[ -~]{0,32}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arb_phase() -> impl Strategy<Value = NegotiationPhase> {
    prop_oneof![
        Just(NegotiationPhase::Idle),
        Just(NegotiationPhase::OfferSent),
        Just(NegotiationPhase::Stable),
    ]
}

const KNOWN_TAGS: [&str; 10] = [
    "offer",
    "answer",
    "candidate",
    "conversation-update",
    "transcript",
    "final_transcript",
    "on_audio_chunk",
    "text_speak_chunk",
    "chunk",
    "on_tool_start",
];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// **Property 3: Transcript Normalization**
    #[test]
    fn prop_transcript_family_normalizes(
        tag in arb_tag(),
        payload in arb_payload(),
        phase in arb_phase(),
    ) {
        let text = json!({"type": tag.as_str(), "payload": payload}).to_string();
        let actions = plan(&InboundMessage::parse(&text), phase);
        let expected = NegotiationAction::Publish(CallEvent::FinalTranscript(payload));
        prop_assert_eq!(actions, vec![expected]);
    }

    /// **Property 4: Unknown Messages Surface as Errors**
    #[test]
    fn prop_unknown_tag_is_error(tag in "[a-z_-]{1,20}", phase in arb_phase()) {
        prop_assume!(!KNOWN_TAGS.contains(&tag.as_str()));
        let raw = json!({"type": tag, "data": 1});

        match plan(&InboundMessage::from_value(raw.clone()), phase).as_slice() {
            [NegotiationAction::Publish(CallEvent::Error(err))] => {
                prop_assert_eq!(err.kind, CallErrorKind::UnrecognizedMessage);
                prop_assert_eq!(err.payload.as_ref(), Some(&raw));
            }
            other => prop_assert!(false, "unexpected actions {:?}", other),
        }
    }
}
