//! Contribution Verifier (spec.md §4.2): drives an isolated worker
//! through downloading a candidate zkey, running the verification
//! tool, and recording the outcome as a contribution document.

use serde::Deserialize;
use tracing::{info, warn};

use crate::auth::Principal;
use crate::blob::{self, BlobStore};
use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::domain::{
    CeremonyState, Contribution, ContributionFiles, FinalizationArtifact, ParticipantStatus,
    VerificationSoftware, ZkeyIndex,
};
use crate::error::{CoordinatorError, Result};
use crate::hashing::blake512_file_hex;
use crate::retry::commit_with_retry;
use crate::store::{Store, StoreWrite};
use crate::worker::WorkerPool;

const TRANSCRIPTS_PREFIX: &str = "transcripts";

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyContributionRequest {
    pub ceremony_id: String,
    pub circuit_id: String,
    pub contributor_or_coordinator_identifier: String,
    pub bucket_name: Option<String>,
}

/// Runs the worker command script to completion, returning its
/// combined stdout/stderr output. Always attempts to stop the worker
/// afterwards, even if a step here failed (spec.md §4.2 step 6).
async fn run_verification_worker(
    workers: &dyn WorkerPool,
    config: &CoordinatorConfig,
    instance_id: &str,
    commands: &[String],
) -> Result<String> {
    let outcome: Result<String> = async {
        workers.start(instance_id).await?;
        tokio::time::sleep(std::time::Duration::from_secs(config.worker_settle_seconds)).await;
        if !workers.status(instance_id).await.unwrap_or(false) {
            // (spec.md §9, Open Question b): a negative probe only logs;
            // we still attempt the command script.
            warn!("worker {instance_id} reports not running after settle interval");
        }
        let command_id = workers.run_command(instance_id, commands).await?;
        workers.fetch_output(&command_id, instance_id).await
    }
    .await;

    if let Err(e) = workers.stop(instance_id).await {
        warn!("failed to stop worker {instance_id}: {e}");
    }

    outcome
}

/// Implements `verifyContribution` (spec.md §4.2).
pub async fn verify_contribution(
    store: &dyn Store,
    blob: &dyn BlobStore,
    workers: &dyn WorkerPool,
    clock: &dyn Clock,
    config: &CoordinatorConfig,
    caller: &Principal,
    req: VerifyContributionRequest,
) -> Result<()> {
    if caller.identifier != req.contributor_or_coordinator_identifier {
        return Err(CoordinatorError::Auth(
            "caller identifier does not match the acting identifier".to_string(),
        ));
    }

    let ceremony = store.get_ceremony(&req.ceremony_id).await?;
    let circuit = store.get_circuit(&req.ceremony_id, &req.circuit_id).await?;
    let participant = store
        .get_participant(&req.ceremony_id, &req.contributor_or_coordinator_identifier)
        .await?;

    let is_finalizing = ceremony.state == CeremonyState::Closed && caller.is_coordinator();
    let is_contributing = participant.status == ParticipantStatus::Contributing;
    if !is_finalizing && !is_contributing {
        return Err(CoordinatorError::Precondition(format!(
            "{} is not the current contributor for circuit {} and ceremony is not closed for finalization",
            req.contributor_or_coordinator_identifier, req.circuit_id
        )));
    }

    let zkey_index = if is_finalizing {
        ZkeyIndex::Final
    } else {
        ZkeyIndex::numbered(circuit.waiting_queue.completed_contributions + 1)
    };

    let bucket = req
        .bucket_name
        .clone()
        .unwrap_or_else(|| config.default_bucket.clone());

    let candidate_zkey_path = blob::zkey_path(&circuit.prefix, zkey_index.as_str());
    let transcript_filename = blob::transcript_filename(
        &circuit.prefix,
        zkey_index.as_str(),
        &req.contributor_or_coordinator_identifier,
    );
    let transcript_storage_path = blob::transcript_path(TRANSCRIPTS_PREFIX, &transcript_filename);

    let run_id = uuid::Uuid::new_v4();
    let local_zkey = format!("/tmp/{run_id}-{candidate_zkey_path}");
    let local_transcript = format!("/tmp/{run_id}-{transcript_filename}");
    let genesis_zkey_path = blob::zkey_path(&circuit.prefix, &crate::domain::format_zkey_index(0));

    let mut commands = vec![format!(
        "aws s3 cp s3://{bucket}/{candidate_zkey_path} {local_zkey}"
    )];
    let mut verify_args = vec![local_zkey.clone(), format!("s3://{bucket}/{genesis_zkey_path}")];
    verify_args.extend(circuit.files.iter().cloned());
    commands.push(format!(
        "zkey-verify {} > {local_transcript} 2>&1",
        verify_args.join(" ")
    ));
    commands.push(format!(
        "aws s3 cp {local_transcript} s3://{bucket}/{transcript_storage_path}"
    ));
    commands.push(format!("rm -f {local_zkey} {local_transcript}"));

    let verification_started_at = clock.now_millis();
    let worker_outcome =
        run_verification_worker(workers, config, &circuit.instance_id, &commands).await;
    let verify_cloud_function_time = clock.now_millis() - verification_started_at;

    let valid = matches!(&worker_outcome, Ok(output) if output.contains("ZKey Ok!"));
    if let Err(e) = &worker_outcome {
        warn!("worker failed during verification, treating contribution as invalid: {e}");
    }

    let now = clock.now_millis();
    let contribution_id = uuid::Uuid::new_v4().to_string();

    let mut writes = Vec::new();
    let contribution = if valid {
        if !is_finalizing {
            tokio::time::sleep(std::time::Duration::from_secs(
                config.transcript_settle_seconds,
            ))
            .await;
        }

        let awaiting: Vec<usize> = participant
            .contributions
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_awaiting_attachment())
            .map(|(i, _)| i)
            .collect();
        if awaiting.len() != 1 {
            return Err(CoordinatorError::Precondition(format!(
                "expected exactly one partial contribution awaiting attachment, found {}",
                awaiting.len()
            )));
        }
        let computation_time = participant.contributions[awaiting[0]]
            .computation_time
            .expect("is_awaiting_attachment guarantees computation_time is set");

        blob.download(&bucket, &transcript_storage_path, &local_transcript)
            .await
            .map_err(|e| {
                warn!("failed to re-download transcript {transcript_storage_path} for hashing: {e}");
                e
            })?;
        let transcript_hash = blake512_file_hex(&local_transcript).await.map_err(|e| {
            warn!("failed to hash downloaded transcript {local_transcript}: {e}");
            e
        })?;
        let _ = tokio::fs::remove_file(&local_transcript).await;

        if !is_finalizing {
            let mut updated_circuit = circuit.clone();
            let avg = &mut updated_circuit.avg_timings;
            avg.contribution_computation =
                crate::domain::AvgTimings::roll(avg.contribution_computation, computation_time);
            let full_contribution_time = verification_started_at - participant.contribution_started_at;
            avg.full_contribution =
                crate::domain::AvgTimings::roll(avg.full_contribution, full_contribution_time);
            avg.verify_cloud_function = crate::domain::AvgTimings::roll(
                avg.verify_cloud_function,
                verify_cloud_function_time,
            );
            updated_circuit.waiting_queue.completed_contributions += 1;
            writes.push(StoreWrite::UpsertCircuit(updated_circuit));
        }

        Contribution {
            id: contribution_id,
            ceremony_id: req.ceremony_id.clone(),
            circuit_id: req.circuit_id.clone(),
            participant_id: req.contributor_or_coordinator_identifier.clone(),
            zkey_index,
            valid: true,
            files: Some(ContributionFiles {
                transcript_filename,
                transcript_storage_path,
                transcript_hash,
                zkey_filename: candidate_zkey_path.clone(),
                zkey_storage_path: candidate_zkey_path,
            }),
            verification_software: Some(VerificationSoftware {
                name: config.verification_software.name.clone(),
                version: config.verification_software.version.clone(),
                commit_hash: config.verification_software.commit_hash.clone(),
            }),
            contribution_computation_time: Some(computation_time),
            full_contribution_time: if is_finalizing {
                None
            } else {
                Some(verification_started_at - participant.contribution_started_at)
            },
            verify_cloud_function_time: if is_finalizing {
                None
            } else {
                Some(verify_cloud_function_time)
            },
            last_updated: now,
            verification_key: None::<FinalizationArtifact>,
            verifier_contract: None::<FinalizationArtifact>,
            beacon: None,
        }
    } else {
        blob.delete(&bucket, &candidate_zkey_path).await.ok();

        if !is_finalizing {
            let mut updated_circuit = circuit.clone();
            updated_circuit.waiting_queue.failed_contributions += 1;
            writes.push(StoreWrite::UpsertCircuit(updated_circuit));
        }

        Contribution {
            id: contribution_id,
            ceremony_id: req.ceremony_id.clone(),
            circuit_id: req.circuit_id.clone(),
            participant_id: req.contributor_or_coordinator_identifier.clone(),
            zkey_index,
            valid: false,
            files: None,
            verification_software: None,
            contribution_computation_time: None,
            full_contribution_time: None,
            verify_cloud_function_time: None,
            last_updated: now,
            verification_key: None,
            verifier_contract: None,
            beacon: None,
        }
    };

    writes.push(StoreWrite::CreateContribution(contribution));
    info!(valid, is_finalizing, "committing contribution verification result");
    commit_with_retry(store, writes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::blob::BlobStore;
    use crate::clock::fake::FakeClock;
    use crate::domain::{
        AvgTimings, Ceremony, Circuit, ContributionStep, Participant, PartialContribution,
        WaitingQueue,
    };
    use crate::store::memory::InMemoryStore;
    use crate::worker::fake::FakeWorkerPool;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeBlobStore {
        deleted: Mutex<Vec<String>>,
    }

    impl FakeBlobStore {
        fn new() -> Self {
            Self {
                deleted: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl BlobStore for FakeBlobStore {
        async fn download(&self, _bucket: &str, _path: &str, local_file: &str) -> Result<()> {
            tokio::fs::write(local_file, b"transcript contents").await.ok();
            Ok(())
        }

        async fn delete(&self, _bucket: &str, path: &str) -> Result<()> {
            self.deleted.lock().unwrap().push(path.to_string());
            Ok(())
        }
    }

    fn ceremony(state: CeremonyState) -> Ceremony {
        Ceremony {
            id: "cer1".into(),
            state,
            prefix: "cer1".into(),
            title: "Test".into(),
        }
    }

    fn circuit() -> Circuit {
        Circuit {
            ceremony_id: "cer1".into(),
            id: "circuit-0".into(),
            sequence_position: 0,
            prefix: "circuit0".into(),
            waiting_queue: WaitingQueue::default(),
            avg_timings: AvgTimings::default(),
            files: vec!["pot.ptau".into()],
            instance_id: "vm-0".into(),
        }
    }

    fn contributing_participant(progress: u32, computation_time: i64) -> Participant {
        Participant {
            ceremony_id: "cer1".into(),
            user_id: "alice".into(),
            status: ParticipantStatus::Contributing,
            contribution_step: ContributionStep::Verifying,
            contribution_progress: progress,
            contributions: vec![PartialContribution {
                hash: Some("abc123".into()),
                computation_time: Some(computation_time),
                doc: None,
            }],
            contribution_started_at: 1_000,
            verification_started_at: 0,
            last_updated: 1_000,
        }
    }

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            database_url: "postgres://unused".into(),
            port: 0,
            default_bucket: "ceremony-bucket".into(),
            jwt_secret: "secret".into(),
            worker_settle_seconds: 0,
            transcript_settle_seconds: 0,
            verification_software: crate::config::VerificationSoftwareConfig {
                name: "snarkjs".into(),
                version: "0.7.0".into(),
                commit_hash: "deadbeef".into(),
            },
        }
    }

    fn request() -> VerifyContributionRequest {
        VerifyContributionRequest {
            ceremony_id: "cer1".into(),
            circuit_id: "circuit-0".into(),
            contributor_or_coordinator_identifier: "alice".into(),
            bucket_name: None,
        }
    }

    #[tokio::test]
    async fn valid_contribution_creates_document_and_rolls_timings() {
        let store = InMemoryStore::new();
        store.seed_ceremony(ceremony(CeremonyState::Opened));
        store.seed_circuit(circuit());
        store.seed_participant(contributing_participant(1, 250));

        let blob = FakeBlobStore::new();
        let workers = FakeWorkerPool::valid();
        let clock = FakeClock::new(2_000);
        let caller = Principal {
            identifier: "alice".into(),
            role: Role::Participant,
        };

        verify_contribution(&store, &blob, &workers, &clock, &config(), &caller, request())
            .await
            .unwrap();

        let updated_circuit = store.get_circuit("cer1", "circuit-0").await.unwrap();
        assert_eq!(updated_circuit.waiting_queue.completed_contributions, 1);
        assert_eq!(updated_circuit.avg_timings.contribution_computation, 250);
    }

    #[tokio::test]
    async fn invalid_contribution_deletes_zkey_and_records_failure() {
        let store = InMemoryStore::new();
        store.seed_ceremony(ceremony(CeremonyState::Opened));
        store.seed_circuit(circuit());
        store.seed_participant(contributing_participant(1, 250));

        let blob = FakeBlobStore::new();
        let workers = FakeWorkerPool::invalid();
        let clock = FakeClock::new(2_000);
        let caller = Principal {
            identifier: "alice".into(),
            role: Role::Participant,
        };

        verify_contribution(&store, &blob, &workers, &clock, &config(), &caller, request())
            .await
            .unwrap();

        let updated_circuit = store.get_circuit("cer1", "circuit-0").await.unwrap();
        assert_eq!(updated_circuit.waiting_queue.failed_contributions, 1);
        assert_eq!(updated_circuit.waiting_queue.completed_contributions, 0);
        assert_eq!(blob.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn worker_failure_is_recorded_as_invalid_contribution() {
        let store = InMemoryStore::new();
        store.seed_ceremony(ceremony(CeremonyState::Opened));
        store.seed_circuit(circuit());
        store.seed_participant(contributing_participant(1, 250));

        let blob = FakeBlobStore::new();
        let workers = FakeWorkerPool::failing_run();
        let clock = FakeClock::new(2_000);
        let caller = Principal {
            identifier: "alice".into(),
            role: Role::Participant,
        };

        verify_contribution(&store, &blob, &workers, &clock, &config(), &caller, request())
            .await
            .unwrap();

        let updated_circuit = store.get_circuit("cer1", "circuit-0").await.unwrap();
        assert_eq!(updated_circuit.waiting_queue.failed_contributions, 1);
        assert_eq!(workers.stopped.lock().unwrap(), vec!["vm-0".to_string()]);
    }

    #[tokio::test]
    async fn missing_partial_entry_is_precondition_error() {
        let store = InMemoryStore::new();
        store.seed_ceremony(ceremony(CeremonyState::Opened));
        store.seed_circuit(circuit());
        let mut p = contributing_participant(1, 250);
        p.contributions.clear();
        store.seed_participant(p);

        let blob = FakeBlobStore::new();
        let workers = FakeWorkerPool::valid();
        let clock = FakeClock::new(2_000);
        let caller = Principal {
            identifier: "alice".into(),
            role: Role::Participant,
        };

        let err = verify_contribution(&store, &blob, &workers, &clock, &config(), &caller, request())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Precondition(_)));
    }

    #[tokio::test]
    async fn finalization_path_does_not_advance_counters() {
        let store = InMemoryStore::new();
        store.seed_ceremony(ceremony(CeremonyState::Closed));
        store.seed_circuit(circuit());
        let mut coordinator_participant = contributing_participant(1, 250);
        coordinator_participant.user_id = "coord-1".into();
        coordinator_participant.status = ParticipantStatus::Finalizing;
        store.seed_participant(coordinator_participant);

        let blob = FakeBlobStore::new();
        let workers = FakeWorkerPool::valid();
        let clock = FakeClock::new(2_000);
        let caller = Principal {
            identifier: "coord-1".into(),
            role: Role::Coordinator,
        };
        let mut req = request();
        req.contributor_or_coordinator_identifier = "coord-1".into();

        verify_contribution(&store, &blob, &workers, &clock, &config(), &caller, req)
            .await
            .unwrap();

        let updated_circuit = store.get_circuit("cer1", "circuit-0").await.unwrap();
        assert_eq!(updated_circuit.waiting_queue.completed_contributions, 0);
    }
}
