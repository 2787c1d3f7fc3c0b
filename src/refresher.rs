//! Refresher (spec.md §4.3): triggered by a new contribution document,
//! attaches its id to the matching partial entry on the participant
//! and advances the participant's status.

use std::sync::Arc;
use tracing::warn;

use crate::clock::Clock;
use crate::domain::{ContributionStep, ParticipantStatus};
use crate::error::Result;
use crate::retry::commit_with_retry;
use crate::store::{ContributionCreated, Store, StoreWrite};

/// Implements the Refresher's reaction to a contribution document
/// creation (spec.md §4.3).
pub async fn handle_contribution_created(
    store: &dyn Store,
    clock: &dyn Clock,
    event: ContributionCreated,
) -> Result<()> {
    let contribution = event.contribution;
    let circuits = store.list_circuits(&contribution.ceremony_id).await?;
    let circuit_count = circuits.len() as u32;

    let mut participant = store
        .get_participant(&contribution.ceremony_id, &contribution.participant_id)
        .await?;

    let target = participant
        .contributions
        .iter()
        .position(|c| c.is_awaiting_attachment());
    match target {
        Some(i) => participant.contributions[i].doc = Some(contribution.id.clone()),
        None => {
            // Nothing to attach: the contributor's upload path never
            // recorded a partial entry for this contribution (or it
            // was already attached by a retried delivery). Still
            // advance status below so the ceremony isn't stuck.
            warn!(
                "no awaiting partial contribution entry for participant {} to attach {}",
                contribution.participant_id, contribution.id
            );
        }
    }

    if participant.status != ParticipantStatus::Finalizing {
        participant.status = if participant.contribution_progress + 1 > circuit_count {
            ParticipantStatus::Done
        } else {
            ParticipantStatus::Contributed
        };
        participant.contribution_step = ContributionStep::Completed;
        participant.contribution_started_at = 0;
        participant.verification_started_at = 0;
    }

    participant.last_updated = clock.now_millis();

    commit_with_retry(store, vec![StoreWrite::UpsertParticipant(participant)]).await
}

/// Subscribes to the Store's contribution-created trigger and runs the
/// Refresher for every event until the channel closes.
pub async fn run(store: Arc<dyn Store>, clock: Arc<dyn Clock>) {
    let mut rx = store.subscribe_contribution_created();
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Err(e) = handle_contribution_created(store.as_ref(), clock.as_ref(), event).await
                {
                    warn!("refresher handler failed: {e}");
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("refresher lagged behind store triggers, skipped {skipped} events");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
