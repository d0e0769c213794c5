//! State machine transition tests.
//!
//! Covers the full 5x5 status matrix: 4 legal edges, everything else
//! rejected with `InvalidTransition`, and the record-level effects of each
//! legal edge.

// Imports are in sub-modules to avoid ambiguity with pretty_assertions.

// ─── Status Matrix ──────────────────────────────────────────────────────────

mod matrix {
    use rstest::rstest;
    use taskfuture::{TaskError, TaskId, TaskStatus};

    use TaskStatus::{Cancelled, Completed, Failed, Pending, Running};

    #[rstest]
    #[case(Pending, Running)]
    #[case(Pending, Cancelled)]
    #[case(Running, Completed)]
    #[case(Running, Failed)]
    fn legal_edges(#[case] from: TaskStatus, #[case] to: TaskStatus) {
        assert!(from.can_transition_to(&to));
        assert!(from.validate_transition(&TaskId::new(), &to).is_ok());
    }

    #[rstest]
    #[case(Pending, Pending)]
    #[case(Pending, Completed)]
    #[case(Pending, Failed)]
    #[case(Running, Pending)]
    #[case(Running, Running)]
    #[case(Running, Cancelled)]
    fn illegal_edges_from_live_states(#[case] from: TaskStatus, #[case] to: TaskStatus) {
        let task_id = TaskId::new();
        match from.validate_transition(&task_id, &to).unwrap_err() {
            TaskError::InvalidTransition {
                task_id: id,
                from: f,
                to: t,
            } => {
                assert_eq!(id, task_id);
                assert_eq!((f, t), (from, to));
            },
            other => panic!("expected InvalidTransition, got: {other}"),
        }
    }

    #[rstest]
    fn terminal_states_are_absorbing(
        #[values(Completed, Failed, Cancelled)] from: TaskStatus,
        #[values(Pending, Running, Completed, Failed, Cancelled)] to: TaskStatus,
    ) {
        assert!(from.is_terminal());
        assert!(!from.can_transition_to(&to));
    }

    #[test]
    fn exactly_four_legal_edges() {
        let legal = TaskStatus::ALL
            .iter()
            .flat_map(|from| TaskStatus::ALL.iter().map(move |to| (from, to)))
            .filter(|(from, to)| from.can_transition_to(to))
            .count();
        assert_eq!(legal, 4);
    }
}

// ─── Record Effects ─────────────────────────────────────────────────────────

mod record_effects {
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;
    use taskfuture::{ErrorRecord, TaskId, TaskRecord, TaskStatus, Transition};

    fn pending() -> TaskRecord {
        TaskRecord::new(TaskId::new(), Some(b"work".to_vec()), Utc::now())
    }

    #[test]
    fn start_sets_started_at_and_keeps_payload() {
        let record = pending();
        let running = record.apply(&Transition::Start, Utc::now()).unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(running.version, 1);
        assert!(running.started_at.is_some());
        assert_eq!(running.payload.as_deref(), Some(&b"work"[..]));
        running.validate().unwrap();
    }

    #[test]
    fn complete_stores_result_and_drops_payload() {
        let running = pending().apply(&Transition::Start, Utc::now()).unwrap();
        let done = running
            .apply(
                &Transition::Complete {
                    result: b"pong".to_vec(),
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.version, 2);
        assert_eq!(done.result.as_deref(), Some(&b"pong"[..]));
        assert_eq!(done.payload, None);
        assert!(done.completed_at.is_some());
        done.validate().unwrap();
    }

    #[test]
    fn fail_stores_error() {
        let running = pending().apply(&Transition::Start, Utc::now()).unwrap();
        let error = ErrorRecord::new("Timeout", "upstream timeout", 504);
        let failed = running
            .apply(
                &Transition::Fail {
                    error: error.clone(),
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error, Some(error));
        assert_eq!(failed.result, None);
        failed.validate().unwrap();
    }

    #[test]
    fn cancel_from_pending_has_no_start() {
        let cancelled = pending().apply(&Transition::Cancel, Utc::now()).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.started_at, None);
        assert!(cancelled.completed_at.is_some());
        cancelled.validate().unwrap();
    }

    #[test]
    fn skewed_clock_never_moves_timestamps_backwards() {
        let record = pending();
        let past = record.submitted_at - Duration::hours(1);
        let running = record.apply(&Transition::Start, past).unwrap();
        assert_eq!(running.started_at, Some(record.submitted_at));

        let done = running
            .apply(&Transition::Complete { result: vec![] }, past)
            .unwrap();
        assert_eq!(done.completed_at, running.started_at);
        done.validate().unwrap();
    }

    #[test]
    fn cancel_after_start_is_rejected() {
        let running = pending().apply(&Transition::Start, Utc::now()).unwrap();
        assert!(running.apply(&Transition::Cancel, Utc::now()).is_err());
    }
}
