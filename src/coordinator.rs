//! Queue Coordinator (spec.md §4.1): reacts to participant-document
//! updates, promotes contributors through per-circuit waiting queues.

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::domain::{Circuit, ContributionStep, Participant, ParticipantStatus};
use crate::error::{CoordinatorError, Result};
use crate::retry::commit_with_retry;
use crate::store::{ParticipantChange, Store, StoreWrite};

/// The classification of a participant before/after pair, and the
/// circuit it concerns (as a 0-based `sequence_position`), per
/// spec.md §4.1. `progress` in the source data is 1-based (I3), so a
/// `progress` of `p` addresses the circuit at `sequence_position ==
/// p - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    ReadyForFirst { sequence_position: u32 },
    ReadyForNext { sequence_position: u32 },
    ResumingAfterTimeout { sequence_position: u32 },
    JustCompletedContribution { sequence_position: u32 },
    JustCompletedEverything { sequence_position: u32 },
    Ignored,
}

/// Classifies a participant before/after pair (spec.md §4.1).
pub fn classify(change: &ParticipantChange) -> Classification {
    let (before, after) = (&change.before, &change.after);

    if after.status == ParticipantStatus::Ready && before.contribution_progress == 0 {
        return Classification::ReadyForFirst {
            sequence_position: after.contribution_progress.saturating_sub(1),
        };
    }

    if after.status == ParticipantStatus::Ready
        && after.contribution_progress == before.contribution_progress + 1
        && before.contribution_progress != 0
    {
        return Classification::ReadyForNext {
            sequence_position: after.contribution_progress.saturating_sub(1),
        };
    }

    if after.status == ParticipantStatus::Ready
        && after.contribution_progress == before.contribution_progress
        && before.contribution_progress != 0
    {
        return Classification::ResumingAfterTimeout {
            sequence_position: after.contribution_progress.saturating_sub(1),
        };
    }

    if before.status == ParticipantStatus::Contributing
        && before.contribution_step == ContributionStep::Verifying
        && after.status == ParticipantStatus::Contributed
        && after.contribution_step == ContributionStep::Completed
        && after.contribution_progress == before.contribution_progress
    {
        return Classification::JustCompletedContribution {
            sequence_position: before.contribution_progress.saturating_sub(1),
        };
    }

    if after.status == ParticipantStatus::Done && before.status != ParticipantStatus::Done {
        return Classification::JustCompletedEverything {
            sequence_position: before.contribution_progress.saturating_sub(1),
        };
    }

    Classification::Ignored
}

async fn circuit_at_sequence_position(
    store: &dyn Store,
    ceremony_id: &str,
    sequence_position: u32,
) -> Result<Circuit> {
    store
        .list_circuits(ceremony_id)
        .await?
        .into_iter()
        .find(|c| c.sequence_position == sequence_position)
        .ok_or_else(|| {
            CoordinatorError::NotFound(format!(
                "circuit at sequence position {sequence_position} in ceremony {ceremony_id}"
            ))
        })
}

/// Single-participant coordination on circuit `C` (spec.md §4.1):
/// Scenario A (queue empty), A' (resume), or B (someone else is
/// already contributing).
#[instrument(skip(store, clock), fields(ceremony_id, participant = %participant.user_id, sequence_position))]
async fn single_participant_coordination(
    store: &dyn Store,
    clock: &dyn Clock,
    ceremony_id: &str,
    sequence_position: u32,
    mut participant: Participant,
) -> Result<()> {
    let mut circuit = circuit_at_sequence_position(store, ceremony_id, sequence_position).await?;
    let now = clock.now_millis();
    let p = participant.user_id.clone();

    let queue = &mut circuit.waiting_queue;
    if queue.current_contributor.is_none() && queue.contributors.is_empty() {
        // Scenario A: queue empty.
        queue.current_contributor = Some(p.clone());
        queue.contributors.push(p);
        participant.status = ParticipantStatus::Contributing;
        participant.contribution_step = ContributionStep::Downloading;
        participant.contribution_started_at = now;
        debug!("queue empty, participant becomes current contributor");
    } else if queue.current_contributor.as_deref() == Some(p.as_str()) {
        // Scenario A': resume after timeout — participant is already
        // the holder, just coming back from READY.
        participant.status = ParticipantStatus::Contributing;
        participant.contribution_step = ContributionStep::Downloading;
        debug!("resuming existing contributor slot");
    } else {
        // Scenario B: someone else holds the slot.
        queue.contributors.push(p);
        participant.status = ParticipantStatus::Waiting;
        participant.contribution_started_at = 0;
        debug!("another contributor holds the slot, appended to queue");
    }

    participant.last_updated = now;

    commit_with_retry(
        store,
        vec![
            StoreWrite::UpsertParticipant(participant),
            StoreWrite::UpsertCircuit(circuit),
        ],
    )
    .await
}

/// Multi-participant coordination on circuit `C` (spec.md §4.1):
/// `participant` just finished `C` and must be the head of the queue.
#[instrument(skip(store, clock), fields(ceremony_id, participant = %completed_participant_id, sequence_position))]
async fn multi_participant_coordination(
    store: &dyn Store,
    clock: &dyn Clock,
    ceremony_id: &str,
    sequence_position: u32,
    completed_participant_id: &str,
) -> Result<()> {
    let mut circuit = circuit_at_sequence_position(store, ceremony_id, sequence_position).await?;
    let now = clock.now_millis();

    let queue = &mut circuit.waiting_queue;
    let head = queue.contributors.first().cloned();
    match head {
        Some(ref h) if h == completed_participant_id => {
            queue.contributors.remove(0);
        }
        Some(h) => {
            warn!("queue head {h} does not match completed participant {completed_participant_id}; ignoring");
            return Ok(());
        }
        None => {
            warn!("queue already empty for completed participant {completed_participant_id}");
            return Ok(());
        }
    }

    let mut writes = Vec::new();
    if let Some(next_id) = queue.contributors.first().cloned() {
        queue.current_contributor = Some(next_id.clone());
        let mut next_participant = store.get_participant(ceremony_id, &next_id).await?;
        next_participant.status = ParticipantStatus::Contributing;
        next_participant.contribution_step = ContributionStep::Downloading;
        next_participant.contribution_started_at = now;
        next_participant.last_updated = now;
        writes.push(StoreWrite::UpsertParticipant(next_participant));
    } else {
        queue.current_contributor = None;
    }

    writes.push(StoreWrite::UpsertCircuit(circuit));

    commit_with_retry(store, writes).await
}

/// Entry point invoked for every observed participant document update
/// (spec.md §4.1). Non-coordination transitions are ignored.
pub async fn handle_participant_change(
    store: &dyn Store,
    clock: &dyn Clock,
    ceremony_id: &str,
    change: ParticipantChange,
) -> Result<()> {
    match classify(&change) {
        Classification::ReadyForFirst { sequence_position }
        | Classification::ReadyForNext { sequence_position }
        | Classification::ResumingAfterTimeout { sequence_position } => {
            single_participant_coordination(
                store,
                clock,
                ceremony_id,
                sequence_position,
                change.after,
            )
            .await
        }
        Classification::JustCompletedContribution { sequence_position }
        | Classification::JustCompletedEverything { sequence_position } => {
            multi_participant_coordination(
                store,
                clock,
                ceremony_id,
                sequence_position,
                &change.after.user_id,
            )
            .await
        }
        Classification::Ignored => Ok(()),
    }
}

/// Subscribes to the Store's participant-change trigger and runs the
/// Coordinator for every event until the channel closes. Intended to
/// be `tokio::spawn`ed once per ceremony at startup.
pub async fn run(store: Arc<dyn Store>, clock: Arc<dyn Clock>, ceremony_id: String) {
    let mut rx = store.subscribe_participant_changes();
    loop {
        match rx.recv().await {
            Ok(change) => {
                if let Err(e) =
                    handle_participant_change(store.as_ref(), clock.as_ref(), &ceremony_id, change)
                        .await
                {
                    warn!("coordinator handler failed: {e}");
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("coordinator lagged behind store triggers, skipped {skipped} events");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
