//! Two-batch ingress: dedup, stuck reclaim, and the scheduling decision.
//!
//! These are pure functions over [`SessionState`] plus a caller-supplied
//! `now`, so every interleaving can be exercised in tests without a runtime.

use crate::session::state::{Batch, BatchStatus, PendingMessage, SessionState, StuckPolicy};
use crate::{BatchId, ParsedInput};
use chrono::{DateTime, Utc};

/// Why the caller should schedule a processor pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleReason {
    /// First message of a fresh pending batch, nothing active.
    FirstMessage,
    /// A wedged active batch was just reclaimed and pending work exists.
    StuckRecovery,
    /// Pending work exists with no active batch and no first-message alarm,
    /// meaning an earlier alarm was lost.
    OrphanedPending,
}

/// Result of one ingress call.
#[derive(Debug, Clone)]
pub struct ReceiveOutcome {
    pub trace_id: String,
    pub queued: bool,
    pub batch_id: Option<BatchId>,
    pub schedule: Option<ScheduleReason>,
    /// Whether a stuck active batch was cleared on the way in.
    pub recovered_stuck: bool,
}

/// Ingress one parsed message into the session's pending batch.
///
/// Orphaned messages inside a reclaimed stuck batch are dropped, not
/// re-queued; the failure was already recorded against that batch and
/// replaying half-processed text risks double replies.
pub fn receive(
    state: &mut SessionState,
    input: &ParsedInput,
    now: DateTime<Utc>,
    policy: &StuckPolicy,
) -> ReceiveOutcome {
    let trace_id = input
        .metadata
        .request_id()
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut recovered_stuck = false;
    if let Some(active) = &state.active_batch
        && active.is_stuck(now, policy)
    {
        tracing::warn!(
            batch_id = %active.batch_id,
            status = ?active.status,
            dropped_messages = active.pending_messages.len(),
            "reclaiming stuck active batch"
        );
        state.active_batch = None;
        recovered_stuck = true;
    }

    let duplicate = state
        .active_batch
        .as_ref()
        .is_some_and(|batch| batch.contains_request(&trace_id))
        || state
            .pending_batch
            .as_ref()
            .is_some_and(|batch| batch.contains_request(&trace_id))
        || state.seen_request(&trace_id);

    if duplicate {
        tracing::debug!(trace_id = %trace_id, "duplicate request dropped");
        return ReceiveOutcome {
            trace_id,
            queued: false,
            batch_id: None,
            schedule: None,
            recovered_stuck,
        };
    }

    let pending = state.pending_batch.get_or_insert_with(Batch::new);

    pending.pending_messages.push(PendingMessage {
        text: input.text.clone(),
        timestamp: now,
        request_id: trace_id.clone(),
        user_id: input.user_id.clone(),
        chat_id: input.chat_id.clone(),
        username: input.username.clone(),
        is_admin: input.metadata.is_admin(),
        event_id: input.metadata.event_id().map(str::to_string),
        origin: input.origin.clone(),
    });
    pending.last_message_at = Some(now);

    if pending.status == BatchStatus::Idle {
        pending.status = BatchStatus::Collecting;
        pending.batch_started_at = Some(now);
    }

    let first_message = pending.pending_messages.len() == 1;
    let batch_id = pending.batch_id;
    let no_active = state.active_batch.is_none();

    let schedule = if recovered_stuck {
        Some(ScheduleReason::StuckRecovery)
    } else if no_active && first_message {
        Some(ScheduleReason::FirstMessage)
    } else if no_active {
        Some(ScheduleReason::OrphanedPending)
    } else {
        None
    };

    state.updated_at = now;

    ReceiveOutcome {
        trace_id,
        queued: true,
        batch_id: Some(batch_id),
        schedule,
        recovered_stuck,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InputMetadata, ReplyOrigin};

    fn policy() -> StuckPolicy {
        StuckPolicy {
            heartbeat_timeout: chrono::Duration::seconds(30),
            hard_ceiling: chrono::Duration::minutes(5),
        }
    }

    fn input(text: &str, request_id: Option<&str>) -> ParsedInput {
        ParsedInput {
            text: text.to_string(),
            user_id: "u1".into(),
            chat_id: "c1".into(),
            username: Some("alice".into()),
            metadata: InputMetadata::Rest {
                request_id: request_id.map(str::to_string),
                event_id: None,
                is_admin: false,
                reply_url: None,
            },
            origin: ReplyOrigin::Chat {
                chat_id: "c1".into(),
            },
        }
    }

    fn fresh_state(now: DateTime<Utc>) -> SessionState {
        SessionState::new("u1", "c1", now)
    }

    #[test]
    fn first_message_schedules_and_starts_collecting() {
        let now = Utc::now();
        let mut state = fresh_state(now);

        let outcome = receive(&mut state, &input("hello", Some("r1")), now, &policy());

        assert!(outcome.queued);
        assert_eq!(outcome.trace_id, "r1");
        assert_eq!(outcome.schedule, Some(ScheduleReason::FirstMessage));

        let pending = state.pending_batch.as_ref().expect("pending batch");
        assert_eq!(pending.status, BatchStatus::Collecting);
        assert_eq!(pending.pending_messages.len(), 1);
        assert_eq!(pending.batch_started_at, Some(now));
        assert_eq!(outcome.batch_id, Some(pending.batch_id));
    }

    #[test]
    fn burst_coalesces_into_one_batch_with_one_alarm() {
        let now = Utc::now();
        let mut state = fresh_state(now);

        let first = receive(&mut state, &input("a", Some("r1")), now, &policy());
        let second = receive(&mut state, &input("b", Some("r2")), now, &policy());
        let third = receive(&mut state, &input("c", Some("r3")), now, &policy());

        assert_eq!(first.schedule, Some(ScheduleReason::FirstMessage));
        // Later messages of the same burst find pending work but no active
        // batch, so they re-arm the alarm rather than trusting the first one.
        assert_eq!(second.schedule, Some(ScheduleReason::OrphanedPending));
        assert_eq!(third.schedule, Some(ScheduleReason::OrphanedPending));

        let pending = state.pending_batch.as_ref().expect("pending");
        assert_eq!(pending.pending_messages.len(), 3);
        assert_eq!(first.batch_id, third.batch_id);
    }

    #[test]
    fn messages_land_in_pending_while_a_batch_is_active() {
        let now = Utc::now();
        let mut state = fresh_state(now);

        let mut active = Batch::new();
        active.status = BatchStatus::Processing;
        active.last_heartbeat = Some(now);
        state.active_batch = Some(active);

        let outcome = receive(&mut state, &input("x", Some("r1")), now, &policy());

        assert!(outcome.queued);
        assert_eq!(outcome.schedule, None);
        assert!(state.active_batch.is_some(), "active batch untouched");
        assert_eq!(
            state
                .pending_batch
                .as_ref()
                .expect("pending")
                .pending_messages
                .len(),
            1
        );
    }

    #[test]
    fn duplicate_request_id_is_dropped_without_mutation() {
        let now = Utc::now();
        let mut state = fresh_state(now);

        receive(&mut state, &input("x", Some("r1")), now, &policy());
        let snapshot = serde_json::to_string(&state.pending_batch).expect("serialize");

        let outcome = receive(&mut state, &input("x", Some("r1")), now, &policy());

        assert!(!outcome.queued);
        assert_eq!(outcome.batch_id, None);
        assert_eq!(outcome.schedule, None);
        let after = serde_json::to_string(&state.pending_batch).expect("serialize");
        assert_eq!(snapshot, after, "state unchanged by duplicate");
    }

    #[test]
    fn duplicate_against_active_batch_is_dropped() {
        let now = Utc::now();
        let mut state = fresh_state(now);

        receive(&mut state, &input("x", Some("r1")), now, &policy());
        // Promote by hand: pending becomes active.
        let mut active = state.pending_batch.take().expect("pending");
        active.status = BatchStatus::Processing;
        active.last_heartbeat = Some(now);
        state.active_batch = Some(active);

        let outcome = receive(&mut state, &input("x", Some("r1")), now, &policy());
        assert!(!outcome.queued);
        assert!(state.pending_batch.is_none());
    }

    #[test]
    fn completed_request_ids_still_dedup() {
        let now = Utc::now();
        let mut state = fresh_state(now);
        state.record_processed_requests(["r1"]);

        let outcome = receive(&mut state, &input("x", Some("r1")), now, &policy());
        assert!(!outcome.queued);
        assert!(state.pending_batch.is_none());
    }

    #[test]
    fn same_text_new_request_id_queues_again() {
        let now = Utc::now();
        let mut state = fresh_state(now);
        state.record_processed_requests(["r1"]);

        let outcome = receive(&mut state, &input("x", Some("r2")), now, &policy());
        assert!(outcome.queued);
    }

    #[test]
    fn stuck_active_batch_is_reclaimed_and_messages_dropped() {
        let now = Utc::now();
        let mut state = fresh_state(now);

        let mut active = Batch::new();
        active.status = BatchStatus::Processing;
        active.last_heartbeat = Some(now - chrono::Duration::seconds(60));
        active.pending_messages.push(PendingMessage {
            text: "orphan".into(),
            timestamp: now - chrono::Duration::seconds(90),
            request_id: "r0".into(),
            user_id: "u1".into(),
            chat_id: "c1".into(),
            username: None,
            is_admin: false,
            event_id: None,
            origin: ReplyOrigin::Chat {
                chat_id: "c1".into(),
            },
        });
        state.active_batch = Some(active);

        let outcome = receive(&mut state, &input("y", Some("r2")), now, &policy());

        assert!(outcome.queued);
        assert!(outcome.recovered_stuck);
        assert_eq!(outcome.schedule, Some(ScheduleReason::StuckRecovery));
        assert!(state.active_batch.is_none());

        // The orphaned message is gone: only the new message is queued.
        let pending = state.pending_batch.as_ref().expect("pending");
        assert_eq!(pending.pending_messages.len(), 1);
        assert_eq!(pending.pending_messages[0].text, "y");
    }

    #[test]
    fn healthy_active_batch_is_left_alone() {
        let now = Utc::now();
        let mut state = fresh_state(now);

        let mut active = Batch::new();
        active.status = BatchStatus::Processing;
        active.last_heartbeat = Some(now - chrono::Duration::seconds(5));
        let active_id = active.batch_id;
        state.active_batch = Some(active);

        let outcome = receive(&mut state, &input("y", Some("r2")), now, &policy());

        assert!(!outcome.recovered_stuck);
        assert_eq!(outcome.schedule, None);
        assert_eq!(
            state.active_batch.as_ref().map(|batch| batch.batch_id),
            Some(active_id)
        );
    }

    #[test]
    fn missing_request_id_gets_a_fresh_trace() {
        let now = Utc::now();
        let mut state = fresh_state(now);

        let first = receive(&mut state, &input("a", None), now, &policy());
        let second = receive(&mut state, &input("a", None), now, &policy());

        assert!(first.queued);
        assert!(second.queued);
        assert_ne!(first.trace_id, second.trace_id);
    }

    /// No interleaving of receive calls may produce two queued messages with
    /// the same request ID across both batches.
    #[test]
    fn request_ids_stay_unique_across_batches() {
        let now = Utc::now();
        let mut state = fresh_state(now);
        let ids = ["r1", "r2", "r1", "r3", "r2", "r1", "r4", "r3"];

        for (i, id) in ids.iter().enumerate() {
            // Promote midway to exercise the active+pending split.
            if i == 3 {
                let mut active = state.pending_batch.take().expect("pending");
                active.status = BatchStatus::Processing;
                active.last_heartbeat = Some(now);
                state.active_batch = Some(active);
            }
            receive(&mut state, &input("t", Some(id)), now, &policy());
        }

        let mut seen = std::collections::HashSet::new();
        let batches = state.active_batch.iter().chain(state.pending_batch.iter());
        for message in batches.flat_map(|batch| batch.pending_messages.iter()) {
            assert!(
                seen.insert(message.request_id.clone()),
                "duplicate request id {} in state",
                message.request_id
            );
        }
        assert_eq!(seen.len(), 4);
    }
}
