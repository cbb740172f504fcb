//! Property-based tests using proptest.
//!
//! Property tests verify the status state machine, the finish table and the
//! consolidated feed's ordering under arbitrary inputs. Fuzz-style cases
//! check that status parsing and fan-out decoding never panic on arbitrary
//! strings, and that flat field encoding keeps every string a string.

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use task_logger::store::kv::KeyValueRef;
use task_logger::store::memory::InMemoryKvBackend;
use task_logger::store::pubsub::FanOutMessage;
use task_logger::store::strategy::{decode_value, encode_value, field_text, StreamFields};
use task_logger::store::StorageRef;
use task_logger::types::status::finish_status;
use task_logger::{Status, TaskInfo};

// ─── Arbitrary Strategies ───────────────────────────────────────────────────

fn arb_status() -> impl Strategy<Value = Status> {
    prop::sample::select(Status::ALL.to_vec())
}

fn arb_active_status() -> impl Strategy<Value = Status> {
    prop::sample::select(vec![
        Status::Pending,
        Status::Running,
        Status::PendingApproval,
        Status::Terminating,
    ])
}

fn arb_step_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,11}"
}

// ─── Property Tests: State Machine Invariants ───────────────────────────────

proptest! {
    /// Terminal statuses reject every transition.
    #[test]
    fn terminal_states_reject_all_transitions(from in arb_status(), to in arb_status()) {
        prop_assume!(from.is_terminal());
        prop_assert!(!from.can_transition_to(&to));
    }

    /// No status transitions to itself.
    #[test]
    fn self_transitions_rejected(status in arb_status()) {
        prop_assert!(!status.can_transition_to(&status));
    }

    /// `validate_transition` agrees with `can_transition_to`.
    #[test]
    fn validate_agrees_with_graph(from in arb_status(), to in arb_status()) {
        prop_assert_eq!(
            from.validate_transition("step", &to).is_ok(),
            from.can_transition_to(&to)
        );
    }

    /// Nothing transitions back to Pending; only `reset` gets there.
    #[test]
    fn pending_is_only_initial(from in arb_status()) {
        prop_assert!(!from.can_transition_to(&Status::Pending));
    }
}

// ─── Property Tests: Finish Table ───────────────────────────────────────────

proptest! {
    /// The finish table always lands on a terminal status.
    #[test]
    fn finish_always_terminal(
        current in arb_active_status(),
        has_error in any::<bool>(),
        approval in any::<bool>(),
        skip in any::<bool>(),
    ) {
        prop_assert!(finish_status(current, has_error, approval, skip).is_terminal());
    }

    /// Approved and Denied require the pending-approval flag.
    #[test]
    fn approval_outcomes_need_the_flag(
        current in arb_active_status(),
        has_error in any::<bool>(),
        skip in any::<bool>(),
    ) {
        let next = finish_status(current, has_error, false, skip);
        prop_assert!(next != Status::Approved && next != Status::Denied);
    }

    /// A skip request always wins.
    #[test]
    fn skip_wins(
        current in arb_active_status(),
        has_error in any::<bool>(),
        approval in any::<bool>(),
    ) {
        prop_assert_eq!(finish_status(current, has_error, approval, true), Status::Skipped);
    }

    /// The finish outcome of a non-pending active step is an edge of the
    /// graph, provided the approval flag is consistent with the status.
    #[test]
    fn finish_outcome_is_an_edge(
        current in prop::sample::select(vec![
            Status::Running,
            Status::PendingApproval,
            Status::Terminating,
        ]),
        has_error in any::<bool>(),
        approval in any::<bool>(),
        skip in any::<bool>(),
    ) {
        let approval = approval || current == Status::PendingApproval;
        let next = finish_status(current, has_error, approval, skip);
        prop_assert!(current.can_transition_to(&next), "{} -> {}", current, next);
    }
}

// ─── Property Tests: Consolidated Feed ──────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Sequence ids are strictly increasing across any interleaving of
    /// steps and stream fields.
    #[test]
    fn sequence_strictly_increasing(
        writes in prop::collection::vec(
            (arb_step_name(), prop::sample::select(vec!["logs", "memory", "cpu"])),
            1..40,
        ),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let backend = Arc::new(InMemoryKvBackend::new());
            let root = KeyValueRef::for_task(
                backend,
                &TaskInfo::new("A", "J"),
                "build-logs",
                StreamFields::default(),
            );
            let mut last = 0;
            for (step, field) in &writes {
                let target = root.child("steps").child(step).child(field);
                let seq = target.push(json!("x")).await.unwrap().sequence.unwrap();
                prop_assert!(seq > last);
                last = seq;
            }

            let feed = root.consolidated_since(0).await.unwrap();
            prop_assert_eq!(feed.len(), writes.len());
            for (record, (step, field)) in feed.iter().zip(&writes) {
                prop_assert_eq!(&record.slot, &format!("steps.{step}.{field}"));
            }
            Ok(())
        })?;
    }
}

// ─── Fuzz Tests ─────────────────────────────────────────────────────────────

proptest! {
    /// Parsing arbitrary text as a status never panics, and only the wire
    /// names parse.
    #[test]
    fn status_parse_never_panics(raw in ".{0,24}") {
        if let Ok(status) = raw.parse::<Status>() {
            prop_assert_eq!(status.as_str(), raw.as_str());
        }
    }

    /// Any string survives flat encoding as a string, including text that
    /// is itself valid JSON.
    #[test]
    fn strings_survive_flat_encoding(raw in prop_oneof![
        ".{0,32}",
        "-?[0-9]{1,6}(\\.[0-9]{1,3})?",
        prop::sample::select(vec!["true", "false", "null", "[]", "{}", "\"quoted\"", " 1 "])
            .prop_map(String::from),
    ]) {
        let value = json!(raw);
        prop_assert_eq!(decode_value(&encode_value(&value)), value);
        prop_assert_eq!(field_text(&encode_value(&json!(raw))), raw);
    }

    /// Non-string scalars keep their type through flat encoding.
    #[test]
    fn scalars_survive_flat_encoding(n in any::<i64>(), b in any::<bool>()) {
        prop_assert_eq!(decode_value(&encode_value(&json!(n))), json!(n));
        prop_assert_eq!(decode_value(&encode_value(&json!(b))), json!(b));
    }

    /// Decoding arbitrary text as a fan-out message never panics.
    #[test]
    fn fan_out_decode_never_panics(raw in ".{0,64}") {
        let _ = serde_json::from_str::<FanOutMessage>(&raw);
    }
}
