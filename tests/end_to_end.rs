//! End-to-end scenarios exercising the Coordinator, Verifier,
//! Refresher and Finalizer together through a shared in-memory Store,
//! mirroring the ceremony walkthroughs in spec.md §8.

use ceremony_coordinator::auth::{Principal, Role};
use ceremony_coordinator::blob::fake::FakeBlobStore;
use ceremony_coordinator::clock::fake::FakeClock;
use ceremony_coordinator::config::{CoordinatorConfig, VerificationSoftwareConfig};
use ceremony_coordinator::coordinator::handle_participant_change;
use ceremony_coordinator::domain::{
    AvgTimings, Ceremony, CeremonyState, Circuit, Contribution, ContributionStep,
    Participant, ParticipantStatus, PartialContribution, WaitingQueue, ZkeyIndex,
};
use ceremony_coordinator::finalizer::{self, FinalizeCircuitRequest};
use ceremony_coordinator::refresher::handle_contribution_created;
use ceremony_coordinator::store::memory::InMemoryStore;
use ceremony_coordinator::store::{ParticipantChange, Store, StoreWrite};
use ceremony_coordinator::verifier::{self, VerifyContributionRequest};
use ceremony_coordinator::worker::fake::FakeWorkerPool;

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        database_url: "postgres://unused".into(),
        port: 0,
        default_bucket: "ceremony-bucket".into(),
        jwt_secret: "secret".into(),
        worker_settle_seconds: 0,
        transcript_settle_seconds: 0,
        verification_software: VerificationSoftwareConfig {
            name: "snarkjs".into(),
            version: "0.7.0".into(),
            commit_hash: "deadbeef".into(),
        },
    }
}

fn seed_ceremony_and_circuits(store: &InMemoryStore, circuit_count: u32) {
    store.seed_ceremony(Ceremony {
        id: "cer1".into(),
        state: CeremonyState::Opened,
        prefix: "cer1".into(),
        title: "Test Ceremony".into(),
    });
    for i in 0..circuit_count {
        store.seed_circuit(Circuit {
            ceremony_id: "cer1".into(),
            id: format!("circuit-{i}"),
            sequence_position: i,
            prefix: format!("circuit{i}"),
            waiting_queue: WaitingQueue::default(),
            avg_timings: AvgTimings::default(),
            files: vec![],
            instance_id: format!("vm-{i}"),
        });
    }
}

fn waiting_participant(user_id: &str) -> Participant {
    Participant {
        ceremony_id: "cer1".into(),
        user_id: user_id.into(),
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
async fn solo_happy_path_one_circuit() {
    let store = InMemoryStore::new();
    seed_ceremony_and_circuits(&store, 1);
    store.seed_participant(waiting_participant("u1"));
    let clock = FakeClock::new(1_000);

    // u1 joins the queue: Scenario A, queue empty, becomes the holder.
    let before = store.get_participant("cer1", "u1").await.unwrap();
    let mut after = before.clone();
    after.status = ParticipantStatus::Ready;
    after.contribution_progress = 1;
    handle_participant_change(&store, &clock, "cer1", ParticipantChange { before, after })
        .await
        .unwrap();

    let u1 = store.get_participant("cer1", "u1").await.unwrap();
    assert_eq!(u1.status, ParticipantStatus::Contributing);
    let circuit = store.get_circuit("cer1", "circuit-0").await.unwrap();
    assert_eq!(circuit.waiting_queue.current_contributor.as_deref(), Some("u1"));

    // u1's upload step records a partial entry awaiting attachment.
    let mut u1 = store.get_participant("cer1", "u1").await.unwrap();
    u1.contributions.push(PartialContribution {
        hash: Some("abc".into()),
        computation_time: Some(100),
        doc: None,
    });
    u1.contribution_step = ContributionStep::Verifying;
    store
        .commit(vec![StoreWrite::UpsertParticipant(u1)])
        .await
        .unwrap();

    let blob = FakeBlobStore::new();
    let workers = FakeWorkerPool::valid();
    let config = test_config();
    let caller = Principal {
        identifier: "u1".into(),
        role: Role::Participant,
    };
    let req = VerifyContributionRequest {
        ceremony_id: "cer1".into(),
        circuit_id: "circuit-0".into(),
        contributor_or_coordinator_identifier: "u1".into(),
        bucket_name: None,
    };

    let mut rx = store.subscribe_contribution_created();
    verifier::verify_contribution(&store, &blob, &workers, &clock, &config, &caller, req)
        .await
        .unwrap();

    let circuit = store.get_circuit("cer1", "circuit-0").await.unwrap();
    assert_eq!(circuit.waiting_queue.completed_contributions, 1);

    let event = rx.try_recv().unwrap();
    assert_eq!(event.contribution.zkey_index, ZkeyIndex::numbered(1));
    assert!(event.contribution.valid);
    let contribution_id = event.contribution.id.clone();

    handle_contribution_created(&store, &clock, event).await.unwrap();
    let u1 = store.get_participant("cer1", "u1").await.unwrap();
    assert_eq!(u1.status, ParticipantStatus::Done);
    assert_eq!(u1.contribution_step, ContributionStep::Completed);
    assert_eq!(u1.contributions[0].doc.as_deref(), Some(contribution_id.as_str()));
}

#[tokio::test]
async fn contention_second_participant_promoted_after_first_completes() {
    let store = InMemoryStore::new();
    seed_ceremony_and_circuits(&store, 1);
    store.seed_participant(waiting_participant("a"));
    store.seed_participant(waiting_participant("b"));
    let clock = FakeClock::new(1_000);

    for id in ["a", "b"] {
        let before = store.get_participant("cer1", id).await.unwrap();
        let mut after = before.clone();
        after.status = ParticipantStatus::Ready;
        after.contribution_progress = 1;
        handle_participant_change(&store, &clock, "cer1", ParticipantChange { before, after })
            .await
            .unwrap();
    }

    let a = store.get_participant("cer1", "a").await.unwrap();
    let b = store.get_participant("cer1", "b").await.unwrap();
    assert_eq!(a.status, ParticipantStatus::Contributing);
    assert_eq!(b.status, ParticipantStatus::Waiting);

    // a finishes its contribution; b should be promoted to the slot.
    let before = a.clone();
    let mut after = before.clone();
    after.status = ParticipantStatus::Contributed;
    after.contribution_step = ContributionStep::Completed;
    handle_participant_change(&store, &clock, "cer1", ParticipantChange { before, after })
        .await
        .unwrap();

    let b = store.get_participant("cer1", "b").await.unwrap();
    assert_eq!(b.status, ParticipantStatus::Contributing);
    let circuit = store.get_circuit("cer1", "circuit-0").await.unwrap();
    assert_eq!(circuit.waiting_queue.current_contributor.as_deref(), Some("b"));
}

#[tokio::test]
async fn invalid_contribution_deletes_zkey_but_still_advances_participant() {
    let store = InMemoryStore::new();
    seed_ceremony_and_circuits(&store, 1);
    let mut p = waiting_participant("u1");
    p.status = ParticipantStatus::Contributing;
    p.contribution_step = ContributionStep::Verifying;
    p.contribution_progress = 1;
    p.contribution_started_at = 500;
    p.contributions.push(PartialContribution {
        hash: Some("abc".into()),
        computation_time: Some(100),
        doc: None,
    });
    store.seed_participant(p);

    let blob = FakeBlobStore::new();
    blob.put("ceremony-bucket", "circuit0_00001.zkey", b"candidate zkey bytes");
    let workers = FakeWorkerPool::invalid();
    let clock = FakeClock::new(1_000);
    let config = test_config();
    let caller = Principal {
        identifier: "u1".into(),
        role: Role::Participant,
    };
    let req = VerifyContributionRequest {
        ceremony_id: "cer1".into(),
        circuit_id: "circuit-0".into(),
        contributor_or_coordinator_identifier: "u1".into(),
        bucket_name: None,
    };

    let mut rx = store.subscribe_contribution_created();
    verifier::verify_contribution(&store, &blob, &workers, &clock, &config, &caller, req)
        .await
        .unwrap();

    assert!(!blob.contains("ceremony-bucket", "circuit0_00001.zkey"));
    let circuit = store.get_circuit("cer1", "circuit-0").await.unwrap();
    assert_eq!(circuit.waiting_queue.failed_contributions, 1);

    let event = rx.try_recv().unwrap();
    assert!(!event.contribution.valid);
    handle_contribution_created(&store, &clock, event).await.unwrap();
    let u1 = store.get_participant("cer1", "u1").await.unwrap();
    assert_eq!(u1.status, ParticipantStatus::Done);
}

#[tokio::test]
async fn timeout_resumption_preserves_contribution_started_at() {
    let store = InMemoryStore::new();
    seed_ceremony_and_circuits(&store, 2);
    let mut circuit = store.get_circuit("cer1", "circuit-1").await.unwrap();
    circuit.waiting_queue.current_contributor = Some("c".to_string());
    circuit.waiting_queue.contributors = vec!["c".to_string()];
    store.seed_circuit(circuit);

    let mut before = waiting_participant("c");
    before.status = ParticipantStatus::TimedOut;
    before.contribution_progress = 2;
    before.contribution_started_at = 4_200;
    let mut after = before.clone();
    after.status = ParticipantStatus::Ready;

    let clock = FakeClock::new(9_000);
    handle_participant_change(&store, &clock, "cer1", ParticipantChange { before, after })
        .await
        .unwrap();

    let c = store.get_participant("cer1", "c").await.unwrap();
    assert_eq!(c.status, ParticipantStatus::Contributing);
    assert_eq!(c.contribution_started_at, 4_200);
}

#[tokio::test]
async fn rolling_average_uses_ema_with_smoothing_one_half() {
    let store = InMemoryStore::new();
    seed_ceremony_and_circuits(&store, 1);
    let blob = FakeBlobStore::new();
    let config = test_config();
    let clock = FakeClock::new(10_000);

    for (progress, computation_time) in [(1u32, 100i64), (2, 300)] {
        let mut p = waiting_participant("solo");
        p.status = ParticipantStatus::Contributing;
        p.contribution_step = ContributionStep::Verifying;
        p.contribution_progress = progress;
        p.contribution_started_at = 9_000;
        p.contributions.push(PartialContribution {
            hash: Some(format!("h{progress}")),
            computation_time: Some(computation_time),
            doc: None,
        });
        store.seed_participant(p);

        let workers = FakeWorkerPool::valid();
        let caller = Principal {
            identifier: "solo".into(),
            role: Role::Participant,
        };
        let req = VerifyContributionRequest {
            ceremony_id: "cer1".into(),
            circuit_id: "circuit-0".into(),
            contributor_or_coordinator_identifier: "solo".into(),
            bucket_name: None,
        };
        verifier::verify_contribution(&store, &blob, &workers, &clock, &config, &caller, req)
            .await
            .unwrap();
    }

    let circuit = store.get_circuit("cer1", "circuit-0").await.unwrap();
    // roll(0, 100) = 100, roll(100, 300) = (100 + 300) / 2 = 200.
    assert_eq!(circuit.avg_timings.contribution_computation, 200);
    assert_eq!(circuit.waiting_queue.completed_contributions, 2);
}

#[tokio::test]
async fn finalization_sets_beacon_and_artifact_hashes() {
    let store = InMemoryStore::new();
    store.seed_ceremony(Ceremony {
        id: "cer1".into(),
        state: CeremonyState::Closed,
        prefix: "cer1".into(),
        title: "Test Ceremony".into(),
    });
    store.seed_circuit(Circuit {
        ceremony_id: "cer1".into(),
        id: "circuit-0".into(),
        sequence_position: 0,
        prefix: "circuit0".into(),
        waiting_queue: WaitingQueue::default(),
        avg_timings: AvgTimings::default(),
        files: vec![],
        instance_id: "vm-0".into(),
    });
    store
        .commit(vec![StoreWrite::CreateContribution(Contribution {
            id: "final-contrib".into(),
            ceremony_id: "cer1".into(),
            circuit_id: "circuit-0".into(),
            participant_id: "coord-1".into(),
            zkey_index: ZkeyIndex::Final,
            valid: true,
            files: None,
            verification_software: None,
            contribution_computation_time: None,
            full_contribution_time: None,
            verify_cloud_function_time: None,
            last_updated: 0,
            verification_key: None,
            verifier_contract: None,
            beacon: None,
        })])
        .await
        .unwrap();

    let blob = FakeBlobStore::new();
    let clock = FakeClock::new(42_000);
    let caller = Principal {
        identifier: "coord-1".into(),
        role: Role::Coordinator,
    };
    let req = FinalizeCircuitRequest {
        ceremony_id: "cer1".into(),
        circuit_id: "circuit-0".into(),
        bucket_name: "ceremony-bucket".into(),
        beacon: "beacon-xyz".into(),
    };

    finalizer::finalize_circuit(&store, &blob, &clock, &caller, req)
        .await
        .unwrap();

    let updated = store.get_final_contribution("cer1", "circuit-0").await.unwrap();
    assert!(updated.verification_key.is_some());
    assert!(updated.verifier_contract.is_some());
    let beacon = updated.beacon.unwrap();
    assert_eq!(beacon.value, "beacon-xyz");
    assert_eq!(beacon.hash.len(), 64);
    assert_eq!(updated.last_updated, 42_000);
}
