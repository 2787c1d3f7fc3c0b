//! Finalizer (spec.md §4.4): downloads the verification-key and
//! verifier-contract artifacts, hashes them, and records the beacon.

use serde::Deserialize;

use crate::auth::Principal;
use crate::blob::{self, BlobStore};
use crate::clock::Clock;
use crate::domain::FinalizationArtifact;
use crate::error::{CoordinatorError, Result};
use crate::hashing::{blake512_file_hex, sha256_str_hex};
use crate::retry::commit_with_retry;
use crate::store::{Store, StoreWrite};

#[derive(Debug, Clone, Deserialize)]
pub struct FinalizeCircuitRequest {
    pub ceremony_id: String,
    pub circuit_id: String,
    pub bucket_name: String,
    pub beacon: String,
}

/// Implements `finalizeCircuit` (spec.md §4.4). Caller must be the
/// ceremony coordinator.
pub async fn finalize_circuit(
    store: &dyn Store,
    blob: &dyn BlobStore,
    clock: &dyn Clock,
    caller: &Principal,
    req: FinalizeCircuitRequest,
) -> Result<()> {
    if !caller.is_coordinator() {
        return Err(CoordinatorError::Auth(
            "finalizeCircuit requires the coordinator role".to_string(),
        ));
    }

    let circuit = store.get_circuit(&req.ceremony_id, &req.circuit_id).await?;
    let mut final_contribution = store
        .get_final_contribution(&req.ceremony_id, &req.circuit_id)
        .await?;

    let vkey_path = blob::verification_key_path(&circuit.prefix);
    let verifier_path = blob::verifier_contract_path(&circuit.prefix);

    let run_id = uuid::Uuid::new_v4();
    let local_vkey = format!("/tmp/{run_id}-vkey.json");
    let local_verifier = format!("/tmp/{run_id}-verifier.sol");

    blob.download(&req.bucket_name, &vkey_path, &local_vkey).await?;
    blob.download(&req.bucket_name, &verifier_path, &local_verifier)
        .await?;

    let vkey_hash = blake512_file_hex(&local_vkey).await?;
    let verifier_hash = blake512_file_hex(&local_verifier).await?;

    let _ = tokio::fs::remove_file(&local_vkey).await;
    let _ = tokio::fs::remove_file(&local_verifier).await;

    final_contribution.verification_key = Some(FinalizationArtifact {
        filename: vkey_path.clone(),
        storage_path: vkey_path,
        hash: vkey_hash,
    });
    final_contribution.verifier_contract = Some(FinalizationArtifact {
        filename: verifier_path.clone(),
        storage_path: verifier_path,
        hash: verifier_hash,
    });
    final_contribution.beacon = Some(crate::domain::BeaconRecord {
        hash: sha256_str_hex(&req.beacon),
        value: req.beacon,
    });
    final_contribution.last_updated = clock.now_millis();

    commit_with_retry(
        store,
        vec![StoreWrite::UpdateContribution(final_contribution)],
    )
    .await
}
