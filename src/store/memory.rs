//! In-memory [`Store`] implementation used by unit and integration
//! tests in place of Postgres.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::{Ceremony, Circuit, Contribution, Participant, ZkeyIndex};
use crate::error::CoordinatorError;

use super::{
    ContributionCreated, ParticipantChange, Store, StoreBatch, StoreWrite,
    TRIGGER_CHANNEL_CAPACITY,
};

type CircuitKey = (String, String);
type ParticipantKey = (String, String);

struct Tables {
    ceremonies: HashMap<String, Ceremony>,
    circuits: HashMap<CircuitKey, Circuit>,
    participants: HashMap<ParticipantKey, Participant>,
    contributions: HashMap<String, Contribution>,
}

pub struct InMemoryStore {
    tables: Mutex<Tables>,
    participant_tx: broadcast::Sender<ParticipantChange>,
    contribution_tx: broadcast::Sender<ContributionCreated>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let (participant_tx, _) = broadcast::channel(TRIGGER_CHANNEL_CAPACITY);
        let (contribution_tx, _) = broadcast::channel(TRIGGER_CHANNEL_CAPACITY);
        Self {
            tables: Mutex::new(Tables {
                ceremonies: HashMap::new(),
                circuits: HashMap::new(),
                participants: HashMap::new(),
                contributions: HashMap::new(),
            }),
            participant_tx,
            contribution_tx,
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/seed helper: insert a ceremony document directly, bypassing
    /// the trigger pipeline (ceremonies are created externally, per
    /// spec.md §3).
    pub fn seed_ceremony(&self, ceremony: Ceremony) {
        self.tables.lock().unwrap().ceremonies.insert(ceremony.id.clone(), ceremony);
    }

    pub fn seed_circuit(&self, circuit: Circuit) {
        let key = (circuit.ceremony_id.clone(), circuit.id.clone());
        self.tables.lock().unwrap().circuits.insert(key, circuit);
    }

    /// Test/seed helper: insert a participant directly (bypassing
    /// triggers) to establish initial state before exercising a
    /// handler under test.
    pub fn seed_participant(&self, participant: Participant) {
        let key = (participant.ceremony_id.clone(), participant.user_id.clone());
        self.tables.lock().unwrap().participants.insert(key, participant);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_ceremony(&self, ceremony_id: &str) -> crate::error::Result<Ceremony> {
        self.tables
            .lock()
            .unwrap()
            .ceremonies
            .get(ceremony_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(format!("ceremony {ceremony_id}")))
    }

    async fn get_circuit(&self, ceremony_id: &str, circuit_id: &str) -> crate::error::Result<Circuit> {
        self.tables
            .lock()
            .unwrap()
            .circuits
            .get(&(ceremony_id.to_string(), circuit_id.to_string()))
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(format!("circuit {ceremony_id}/{circuit_id}")))
    }

    async fn list_circuits(&self, ceremony_id: &str) -> crate::error::Result<Vec<Circuit>> {
        let mut circuits: Vec<Circuit> = self
            .tables
            .lock()
            .unwrap()
            .circuits
            .values()
            .filter(|c| c.ceremony_id == ceremony_id)
            .cloned()
            .collect();
        circuits.sort_by_key(|c| c.sequence_position);
        Ok(circuits)
    }

    async fn get_participant(&self, ceremony_id: &str, user_id: &str) -> crate::error::Result<Participant> {
        self.tables
            .lock()
            .unwrap()
            .participants
            .get(&(ceremony_id.to_string(), user_id.to_string()))
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(format!("participant {ceremony_id}/{user_id}")))
    }

    async fn get_final_contribution(
        &self,
        ceremony_id: &str,
        circuit_id: &str,
    ) -> crate::error::Result<Contribution> {
        self.tables
            .lock()
            .unwrap()
            .contributions
            .values()
            .find(|c| {
                c.ceremony_id == ceremony_id
                    && c.circuit_id == circuit_id
                    && c.zkey_index == ZkeyIndex::Final
            })
            .cloned()
            .ok_or_else(|| {
                CoordinatorError::NotFound(format!(
                    "final contribution {ceremony_id}/{circuit_id}"
                ))
            })
    }

    async fn commit(&self, batch: StoreBatch) -> crate::error::Result<()> {
        // A single mutex guards the whole table set, giving the
        // serializable, all-or-nothing semantics spec.md §5/§7
        // require; a production circuit-sharded lock would scale
        // better but isn't needed for a test double.
        let mut tables = self.tables.lock().unwrap();
        let mut participant_events = Vec::new();
        let mut contribution_events = Vec::new();

        for write in &batch {
            match write {
                StoreWrite::UpsertParticipant(after) => {
                    let key = (after.ceremony_id.clone(), after.user_id.clone());
                    let before = tables.participants.get(&key).cloned().unwrap_or_else(|| {
                        let mut synthetic = after.clone();
                        synthetic.contribution_progress = 0;
                        synthetic.contribution_started_at = 0;
                        synthetic
                    });
                    tables.participants.insert(key, after.clone());
                    participant_events.push(ParticipantChange {
                        before,
                        after: after.clone(),
                    });
                }
                StoreWrite::UpsertCircuit(circuit) => {
                    let key = (circuit.ceremony_id.clone(), circuit.id.clone());
                    tables.circuits.insert(key, circuit.clone());
                }
                StoreWrite::CreateContribution(contribution) => {
                    tables
                        .contributions
                        .insert(contribution.id.clone(), contribution.clone());
                    contribution_events.push(ContributionCreated {
                        contribution: contribution.clone(),
                    });
                }
                StoreWrite::UpdateContribution(contribution) => {
                    tables
                        .contributions
                        .insert(contribution.id.clone(), contribution.clone());
                }
            }
        }
        drop(tables);

        for event in participant_events {
            // Triggers are best-effort fan-out: no subscriber is
            // required to be listening (spec.md §5 — handlers are
            // independent, Store-mediated causation only).
            let _ = self.participant_tx.send(event);
        }
        for event in contribution_events {
            let _ = self.contribution_tx.send(event);
        }

        Ok(())
    }

    fn subscribe_participant_changes(&self) -> broadcast::Receiver<ParticipantChange> {
        self.participant_tx.subscribe()
    }

    fn subscribe_contribution_created(&self) -> broadcast::Receiver<ContributionCreated> {
        self.contribution_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContributionStep, ParticipantStatus};

    fn empty_participant(ceremony_id: &str, user_id: &str) -> Participant {
        Participant {
            ceremony_id: ceremony_id.to_string(),
            user_id: user_id.to_string(),
            status: ParticipantStatus::Waiting,
            contribution_step: ContributionStep::Downloading,
            contribution_progress: 0,
            contributions: vec![],
            contribution_started_at: 0,
            verification_started_at: 0,
            last_updated: 0,
        }
    }

    #[tokio::test]
    async fn commit_upserts_and_fires_participant_change() {
        let store = InMemoryStore::new();
        let mut rx = store.subscribe_participant_changes();

        let mut p = empty_participant("c1", "alice");
        p.status = ParticipantStatus::Ready;
        store
            .commit(vec![StoreWrite::UpsertParticipant(p.clone())])
            .await
            .unwrap();

        let change = rx.try_recv().unwrap();
        assert_eq!(change.before.contribution_progress, 0);
        assert_eq!(change.after.status, ParticipantStatus::Ready);

        let fetched = store.get_participant("c1", "alice").await.unwrap();
        assert_eq!(fetched.status, ParticipantStatus::Ready);
    }

    #[tokio::test]
    async fn commit_is_atomic_across_writes_in_one_batch() {
        let store = InMemoryStore::new();
        let circuit = Circuit {
            ceremony_id: "c1".into(),
            id: "circuit-0".into(),
            sequence_position: 0,
            prefix: "circuit0".into(),
            waiting_queue: Default::default(),
            avg_timings: Default::default(),
            files: vec![],
            instance_id: "vm-0".into(),
        };
        let p = empty_participant("c1", "alice");

        store
            .commit(vec![
                StoreWrite::UpsertCircuit(circuit.clone()),
                StoreWrite::UpsertParticipant(p.clone()),
            ])
            .await
            .unwrap();

        assert!(store.get_circuit("c1", "circuit-0").await.is_ok());
        assert!(store.get_participant("c1", "alice").await.is_ok());
    }
}
