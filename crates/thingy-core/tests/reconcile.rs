//! Reconciliation behaviour against mock collaborators.
//!
//! These tests run without hardware or network access:
//! `cargo test --package thingy-core --test reconcile`

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use thingy_core::{
    CycleOutcome, DeltaHandler, MockSensorLink, MockShadowChannel, NotificationKind,
    ReconcileOptions, Reconciler, ShadowChannel, ShadowStateStore,
};

const ADDRESS: &str = "C8:2E:11:22:33:44";
const THING: &str = "Bot";

type MockReconciler = Reconciler<MockSensorLink, MockShadowChannel>;

struct Harness {
    link: Arc<MockSensorLink>,
    channel: Arc<MockShadowChannel>,
    reconciler: Arc<MockReconciler>,
}

impl Harness {
    fn new(observed: i32, reported: i32) -> Self {
        let link = Arc::new(MockSensorLink::new(ADDRESS));
        let channel = Arc::new(MockShadowChannel::new());
        let reconciler = Arc::new(Reconciler::with_store(
            Arc::clone(&link),
            Arc::clone(&channel),
            THING,
            ReconcileOptions::default(),
            Arc::new(ShadowStateStore::with_values(observed, reported)),
        ));
        Self {
            link,
            channel,
            reconciler,
        }
    }

    fn store(&self) -> &ShadowStateStore {
        self.reconciler.store()
    }

    async fn issue(&self) -> (String, i32) {
        match self.reconciler.reconcile().await {
            CycleOutcome::UpdateIssued { token, value } => (token, value),
            other => panic!("expected an update, got {other:?}"),
        }
    }
}

fn payload(value: i32) -> String {
    format!(r#"{{"state":{{"reported":{{"temperature":"{value}"}}}}}}"#)
}

// ---------------------------------------------------------------------------
// No premature commit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_reported_moves_only_on_acceptance() {
    let h = Harness::new(22, 20);

    let (t1, _) = h.issue().await;
    assert_eq!(h.store().reported(), 20, "issuing must not commit");

    assert!(h.channel.reject(&t1, 400, "Bad Request"));
    assert_eq!(h.store().reported(), 20);

    let (t2, _) = h.issue().await;
    assert!(h.channel.time_out(&t2));
    assert_eq!(h.store().reported(), 20);

    let (t3, _) = h.issue().await;
    assert!(h.channel.accept(&t3));
    assert_eq!(h.store().reported(), 22);
}

#[tokio::test]
async fn test_malformed_acceptance_does_not_commit() {
    let h = Harness::new(22, 20);
    let (token, _) = h.issue().await;

    assert!(h.channel.respond(
        &token,
        thingy_core::ResponseStatus::Accepted,
        r#"{"state":{"reported":{"humidity":"40"}},"version":2}"#,
    ));
    assert_eq!(h.store().reported(), 20);
    assert!(h.reconciler.pending().is_empty());
}

// ---------------------------------------------------------------------------
// Idempotent no-op cycles
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_in_sync_cycles_send_nothing() {
    let h = Harness::new(21, 21);
    for _ in 0..5 {
        assert_eq!(
            h.reconciler.reconcile().await,
            CycleOutcome::InSync { value: 21 }
        );
    }
    assert_eq!(h.channel.update_count(), 0);
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_decode_through_notification_path() {
    let h = Harness::new(0, 0);
    for (raw, expected) in [(0xFFu8, -1), (0x7F, 127), (0x80, -128), (0x05, 5)] {
        h.link
            .push_raw(NotificationKind::Temperature, vec![raw, 0x00]);
        h.reconciler.run_cycle().await;
        assert_eq!(h.store().observed(), expected, "raw byte {raw:#04X}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_bad_frame_is_discarded() {
    let h = Harness::new(0, 0);
    h.link.push_temperature(21, 0);
    h.link.push_raw(NotificationKind::Temperature, vec![0x30]);
    h.link.push_button(true);

    h.reconciler.run_cycle().await;
    assert_eq!(h.store().observed(), 21);
    assert_eq!(h.channel.update_count(), 1);
}

// ---------------------------------------------------------------------------
// Retry on rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_rejected_update_is_resent_unchanged() {
    let h = Harness::new(22, 20);

    let (t1, _) = h.issue().await;
    assert_eq!(h.channel.updates()[0].payload, payload(22));
    assert!(h.channel.reject(&t1, 409, "Version conflict"));

    let (t2, _) = h.issue().await;
    assert_ne!(t1, t2, "a retry gets a fresh token");
    let updates = h.channel.updates();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1].payload, updates[0].payload);
}

#[tokio::test]
async fn test_timed_out_update_is_resent() {
    let h = Harness::new(22, 20);
    let (t1, _) = h.issue().await;
    assert_eq!(
        h.reconciler.reconcile().await,
        CycleOutcome::AlreadyPending { value: 22 }
    );

    assert!(h.channel.time_out(&t1));
    let (_, value) = h.issue().await;
    assert_eq!(value, 22);
    assert_eq!(h.channel.update_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_update_expires() {
    let h = Harness::new(22, 20);
    h.issue().await;

    // Channel never answers; after the timeout plus grace the entry goes.
    tokio::time::advance(Duration::from_secs(11)).await;
    let (_, value) = h.issue().await;
    assert_eq!(value, 22);
    assert_eq!(h.reconciler.pending().len(), 1);
}

// ---------------------------------------------------------------------------
// Token correlation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_overlapping_updates_resolve_by_token() {
    let h = Harness::new(22, 20);
    let (t1, _) = h.issue().await;

    h.store().set_observed(23);
    let (t2, _) = h.issue().await;
    assert_eq!(h.reconciler.pending().len(), 2);

    assert!(h.channel.accept(&t1));
    assert_eq!(h.store().reported(), 22);
    assert_eq!(h.reconciler.pending().get(&t2).unwrap().value, 23);

    assert!(h.channel.accept(&t2));
    assert_eq!(h.store().reported(), 23);
    assert!(h.reconciler.pending().is_empty());
}

#[tokio::test]
async fn test_older_acceptance_cannot_roll_back() {
    let h = Harness::new(22, 20);
    let (t1, _) = h.issue().await;
    h.store().set_observed(23);
    let (t2, _) = h.issue().await;

    assert!(h.channel.accept_with_version(&t2, 5));
    assert!(h.channel.accept_with_version(&t1, 4));
    assert_eq!(h.store().reported(), 23);
    assert_eq!(
        h.reconciler.reconcile().await,
        CycleOutcome::InSync { value: 23 }
    );
}

#[tokio::test]
async fn test_acknowledgement_before_issue_returns() {
    let h = Harness::new(22, 20);
    h.channel.set_accept_immediately(true);

    let (_, value) = h.issue().await;
    assert_eq!(value, 22);
    assert_eq!(h.store().reported(), 22);
    assert!(h.reconciler.pending().is_empty());
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_end_to_end_single_reading() {
    let h = Harness::new(0, 0);
    h.link.push_temperature(21, 37);

    let outcome = h.reconciler.run_cycle().await;
    let CycleOutcome::UpdateIssued { token, value } = outcome else {
        panic!("expected an update, got {outcome:?}");
    };
    assert_eq!(value, 21);
    assert_eq!(h.channel.last_update().unwrap().payload, payload(21));

    assert!(h.channel.accept(&token));
    assert_eq!(h.store().reported(), 21);

    assert_eq!(
        h.reconciler.run_cycle().await,
        CycleOutcome::InSync { value: 21 }
    );
    assert_eq!(h.channel.update_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_with_background_acknowledgements() {
    let h = Harness::new(0, 0);
    let cancel = CancellationToken::new();

    let loop_task = {
        let reconciler = Arc::clone(&h.reconciler);
        let cancel = cancel.clone();
        tokio::spawn(async move { reconciler.run(cancel).await })
    };

    h.link.push_temperature(19, 0);
    tokio::time::sleep(Duration::from_secs(1)).await;
    for token in h.channel.outstanding_tokens() {
        h.channel.reject(&token, 500, "Internal");
    }

    // Next wake retries; accept that one.
    tokio::time::sleep(Duration::from_secs(10)).await;
    for token in h.channel.outstanding_tokens() {
        h.channel.accept(&token);
    }
    assert_eq!(h.store().reported(), 19);

    tokio::time::sleep(Duration::from_secs(30)).await;
    cancel.cancel();
    loop_task.await.unwrap();

    assert_eq!(h.channel.update_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_lost_link_keeps_loop_alive() {
    let h = Harness::new(22, 20);
    h.link.set_should_fail(true, Some("link lost"));

    // The wait fails, the loop pauses one interval, then still reconciles.
    let outcome = h.reconciler.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::UpdateIssued { value: 22, .. }));
    assert_eq!(h.link.wait_count(), 1);
}

// ---------------------------------------------------------------------------
// Delta path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_delta_does_not_touch_store() {
    let h = Harness::new(22, 20);
    let delta = Arc::new(DeltaHandler::new());
    h.channel
        .subscribe_delta(THING, Arc::clone(&delta).into_handler())
        .await
        .unwrap();

    assert_eq!(
        h.channel
            .push_delta(THING, r#"{"state":{"temperature":30},"version":4}"#),
        1
    );
    assert_eq!(h.channel.push_delta(THING, "not json"), 1);

    assert_eq!(delta.last_version(), Some(4));
    assert_eq!(h.store().observed(), 22);
    assert_eq!(h.store().reported(), 20);
}

// ---------------------------------------------------------------------------
// Convergence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Reply {
    Accept,
    Reject,
    TimeOut,
    Hold,
}

fn reply_strategy() -> impl Strategy<Value = Reply> {
    prop_oneof![
        Just(Reply::Accept),
        Just(Reply::Reject),
        Just(Reply::TimeOut),
        Just(Reply::Hold),
    ]
}

async fn converge(values: Vec<i8>, replies: Vec<Reply>) -> (i32, i32) {
    let h = Harness::new(0, 0);
    let mut replies = replies.into_iter();

    for value in &values {
        h.store().set_observed(i32::from(*value));
        if let CycleOutcome::UpdateIssued { token, .. } = h.reconciler.reconcile().await {
            match replies.next().unwrap_or(Reply::Accept) {
                Reply::Accept => {
                    h.channel.accept(&token);
                }
                Reply::Reject => {
                    h.channel.reject(&token, 400, "Bad Request");
                }
                Reply::TimeOut => {
                    h.channel.time_out(&token);
                }
                Reply::Hold => {}
            }
        }
    }

    // Held requests resolve late, newest first.
    for token in h.channel.outstanding_tokens().into_iter().rev() {
        h.channel.accept(&token);
    }

    // Quiet period: every further update is accepted.
    for _ in 0..10 {
        match h.reconciler.reconcile().await {
            CycleOutcome::InSync { .. } => break,
            CycleOutcome::UpdateIssued { token, .. } => {
                h.channel.accept(&token);
            }
            CycleOutcome::AlreadyPending { .. } | CycleOutcome::UpdateFailed { .. } => {
                for token in h.channel.outstanding_tokens() {
                    h.channel.accept(&token);
                }
            }
        }
    }

    (h.store().reported(), h.store().observed())
}

proptest! {
    #[test]
    fn prop_reported_converges_to_last_observed(
        values in prop::collection::vec(any::<i8>(), 1..20),
        replies in prop::collection::vec(reply_strategy(), 0..20),
    ) {
        let last = i32::from(*values.last().unwrap());
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let (reported, observed) = runtime.block_on(converge(values, replies));
        prop_assert_eq!(observed, last);
        prop_assert_eq!(reported, last);
    }
}
