//! Property-based tests for session initialization.
//!
//! **Property 1: Identity Validation**
//! *For any* `CallInit` missing an agent ID or a region (absent or empty),
//! `init` SHALL fail with a configuration error and leave the stored
//! parameters untouched.
//!
//! **Property 2: Identifier Generation**
//! *For any* `CallInit` carrying both identity fields, `init` SHALL keep every
//! supplied field and fill absent conversation/session IDs with 15-character
//! lowercase base-36 identifiers.

mod common;

use adk_webcall::config::GENERATED_ID_LEN;
use adk_webcall::{CallInit, WebCallError};
use common::Harness;
use proptest::prelude::*;

/// Generator for optional identity fields, including the empty string.
fn arb_field() -> impl Strategy<Value = Option<String>> {
    prop_oneof![Just(None), Just(Some(String::new())), "[a-z0-9-]{1,24}".prop_map(Some),]
}

fn is_generated_id(id: &str) -> bool {
    id.len() == GENERATED_ID_LEN && id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// **Property 1: Identity Validation**
    #[test]
    fn prop_missing_identity_is_rejected(
        agent_id in arb_field(),
        region in arb_field(),
    ) {
        let complete = agent_id.as_deref().is_some_and(|s| !s.is_empty())
            && region.as_deref().is_some_and(|s| !s.is_empty());
        prop_assume!(!complete);

        let h = Harness::new();
        let input = CallInit { agent_id, region, ..Default::default() };
        let result = h.call.init(input);

        prop_assert!(matches!(result, Err(WebCallError::ConfigurationError(_))));
        prop_assert!(h.call.params().is_none());
    }

    /// **Property 2: Identifier Generation**
    #[test]
    fn prop_identifiers_are_kept_or_generated(
        agent_id in "[a-z0-9-]{1,24}",
        region in "[a-z]{2,8}",
        conversation_id in arb_field(),
        session_id in arb_field(),
    ) {
        let h = Harness::new();
        let input = CallInit {
            agent_id: Some(agent_id.clone()),
            region: Some(region.clone()),
            conversation_id: conversation_id.clone(),
            session_id: session_id.clone(),
            options: None,
        };
        let params = h.call.init(input).unwrap();

        prop_assert_eq!(&params.agent_id, &agent_id);
        prop_assert_eq!(&params.region, &region);
        match conversation_id.filter(|s| !s.is_empty()) {
            Some(id) => prop_assert_eq!(&params.conversation_id, &id),
            None => prop_assert!(is_generated_id(&params.conversation_id)),
        }
        match session_id.filter(|s| !s.is_empty()) {
            Some(id) => prop_assert_eq!(&params.session_id, &id),
            None => prop_assert!(is_generated_id(&params.session_id)),
        }
        prop_assert_eq!(h.call.params(), Some(params));
    }
}

#[test]
fn test_last_init_wins() {
    let h = Harness::new();
    h.call.init(CallInit::new("first", "eu")).unwrap();
    h.call.init(CallInit::new("second", "us").with_option("voice", "calm".into())).unwrap();

    let params = h.call.params().unwrap();
    assert_eq!(params.agent_id, "second");
    assert_eq!(params.region, "us");
    assert_eq!(params.options["voice"], "calm");
}

#[test]
fn test_failed_init_keeps_previous_params() {
    let h = Harness::new();
    h.call.init(CallInit::new("agent", "eu")).unwrap();
    assert!(h.call.init(CallInit::new("", "eu")).is_err());
    assert_eq!(h.call.params().unwrap().agent_id, "agent");
}
