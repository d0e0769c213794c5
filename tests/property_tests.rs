//! Property-based tests using proptest.
//!
//! Verifies the failure codec round-trip law, cause-chain depth bounds,
//! state machine invariants under arbitrary transition sequences, and that
//! malformed records never deserialize into a panic.

use proptest::prelude::*;

use taskfuture::codec::{ErrorCodec, ErrorRecord, GenericFailure};
use taskfuture::constants::MAX_CAUSE_DEPTH;
use taskfuture::{TaskId, TaskRecord, TaskStatus, Transition};

// ─── Arbitrary Strategies ───────────────────────────────────────────────────

fn arb_error_record() -> impl Strategy<Value = ErrorRecord> {
    let leaf = (
        "[A-Za-z]{1,16}",
        "[a-zA-Z0-9 ]{0,64}",
        any::<i64>(),
        "[a-zA-Z0-9 :]{0,32}",
    )
        .prop_map(|(kind, message, code, trace)| {
            ErrorRecord::new(kind, message, code).with_trace(trace)
        });
    leaf.prop_recursive(6, 6, 1, |inner| {
        (inner.clone(), inner).prop_map(|(outer, cause)| outer.with_cause(cause))
    })
}

fn arb_transition() -> impl Strategy<Value = Transition> {
    prop_oneof![
        Just(Transition::Start),
        Just(Transition::Cancel),
        prop::collection::vec(any::<u8>(), 0..32)
            .prop_map(|result| Transition::Complete { result }),
        arb_error_record().prop_map(|error| Transition::Fail { error }),
    ]
}

// ─── Codec Properties ───────────────────────────────────────────────────────

proptest! {
    /// Encoding a decoded record of an unregistered kind gives the record back.
    #[test]
    fn generic_round_trip_is_identity(record in arb_error_record()) {
        let codec = ErrorCodec::new();
        let decoded = codec.decode(&record);
        prop_assert!(decoded.downcast_ref::<GenericFailure>().is_some());
        prop_assert_eq!(codec.encode(&*decoded), record);
    }

    /// Records survive JSON serialization unchanged.
    #[test]
    fn record_json_round_trip(record in arb_error_record()) {
        let json = serde_json::to_string(&record).unwrap();
        let back: ErrorRecord = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, record);
    }

    /// Arbitrary JSON never panics the record deserializer.
    #[test]
    fn fuzz_error_record_json(input in "\\PC{0,200}") {
        let _ = serde_json::from_str::<ErrorRecord>(&input);
        let _ = serde_json::from_str::<TaskRecord>(&input);
    }
}

#[derive(Debug)]
struct Chain {
    depth: usize,
    source: Option<Box<Chain>>,
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "level {}", self.depth)
    }
}

impl std::error::Error for Chain {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|s| s as &(dyn std::error::Error + 'static))
    }
}

fn chain(len: usize) -> Chain {
    (1..len).fold(Chain { depth: len, source: None }, |inner, depth| Chain {
        depth: len - depth,
        source: Some(Box::new(inner)),
    })
}

proptest! {
    /// Cause chains are preserved up to the depth cap and truncated past it.
    #[test]
    fn encoded_depth_is_capped(len in 1usize..40) {
        let record = ErrorCodec::new().encode(&chain(len));
        prop_assert_eq!(record.depth(), len.min(MAX_CAUSE_DEPTH));
        prop_assert_eq!(record.message, "level 1");
    }
}

// ─── State Machine Properties ───────────────────────────────────────────────

proptest! {
    /// Any sequence of transitions keeps the record valid, bumps the version
    /// once per accepted transition, and never leaves a terminal state.
    #[test]
    fn transition_sequences_preserve_invariants(
        steps in prop::collection::vec(arb_transition(), 0..12)
    ) {
        let mut record = TaskRecord::new(TaskId::new(), Some(b"p".to_vec()), chrono::Utc::now());
        let mut accepted = 0u64;

        for step in &steps {
            let before = record.status;
            match record.apply(step, chrono::Utc::now()) {
                Ok(next) => {
                    prop_assert!(before.can_transition_to(&next.status));
                    accepted += 1;
                    record = next;
                },
                Err(_) => prop_assert!(!before.can_transition_to(&step.target())),
            }
            prop_assert!(record.validate().is_ok());
            prop_assert_eq!(record.version, accepted);
            if record.status.is_terminal() {
                prop_assert!(record.payload.is_none());
            }
        }
        prop_assert!(accepted <= 2);
        if accepted == 2 {
            prop_assert!(matches!(record.status, TaskStatus::Completed | TaskStatus::Failed));
        }
    }
}
