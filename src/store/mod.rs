//! Transactional document store abstraction (spec.md §6).
//!
//! The Store is the single source of truth. Handlers never talk to
//! Postgres directly — they read documents through this trait and
//! submit one [`StoreBatch`] per invocation via [`Store::commit`],
//! which must apply in full or not at all (spec.md §7). After a
//! successful commit, the Store is responsible for emitting the
//! before/after change events that drive the Coordinator and
//! Refresher (spec.md §9: "the Store emits `(before, after)`
//! messages").

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::{Ceremony, Circuit, Contribution, Participant};
use crate::error::Result;

/// A single mutation submitted as part of an atomic batch.
#[derive(Debug, Clone)]
pub enum StoreWrite {
    UpsertParticipant(Participant),
    UpsertCircuit(Circuit),
    CreateContribution(Contribution),
    UpdateContribution(Contribution),
}

pub type StoreBatch = Vec<StoreWrite>;

/// Before/after snapshot of a participant document update, the
/// message the Queue Coordinator reacts to.
#[derive(Debug, Clone)]
pub struct ParticipantChange {
    pub before: Participant,
    pub after: Participant,
}

/// A newly created contribution document, the message the Refresher
/// reacts to.
#[derive(Debug, Clone)]
pub struct ContributionCreated {
    pub contribution: Contribution,
}

/// Capacity of the in-process trigger channels. Generous enough that a
/// slow subscriber during a test or a brief coordinator restart won't
/// drop events under normal load; a lagging subscriber still observes
/// a `RecvError::Lagged` rather than silently missing events.
pub const TRIGGER_CHANNEL_CAPACITY: usize = 1024;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_ceremony(&self, ceremony_id: &str) -> Result<Ceremony>;

    async fn get_circuit(&self, ceremony_id: &str, circuit_id: &str) -> Result<Circuit>;

    async fn list_circuits(&self, ceremony_id: &str) -> Result<Vec<Circuit>>;

    async fn get_participant(&self, ceremony_id: &str, user_id: &str) -> Result<Participant>;

    /// Looks up the `final` contribution document for a circuit,
    /// i.e. the one whose `zkeyIndex` is the `final` token.
    async fn get_final_contribution(
        &self,
        ceremony_id: &str,
        circuit_id: &str,
    ) -> Result<Contribution>;

    /// Applies every write in `batch` atomically, then emits the
    /// corresponding trigger events. On error, none of the writes are
    /// visible to subsequent reads (spec.md §7).
    async fn commit(&self, batch: StoreBatch) -> Result<()>;

    fn subscribe_participant_changes(&self) -> broadcast::Receiver<ParticipantChange>;

    fn subscribe_contribution_created(&self) -> broadcast::Receiver<ContributionCreated>;
}
