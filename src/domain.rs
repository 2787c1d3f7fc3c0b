//! Ceremony data model.
//!
//! Field names mirror the wire contract fixed by the external
//! contributor tooling (spec.md §6) — do not rename them casually.

use serde::{Deserialize, Serialize};

/// Fixed width of a zero-padded `zkeyIndex`, taken from the genesis
/// index `"00000"`.
pub const GENESIS_INDEX_LEN: usize = 5;

/// Literal token used in place of a numeric index for the
/// ceremony-closing contribution of a circuit.
pub const FINAL_TOKEN: &str = "final";

/// A circuit's monotonically allocated contribution index, or the
/// literal `final` token used for the beacon-bound last contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ZkeyIndex {
    Numbered(String),
    Final,
}

impl ZkeyIndex {
    /// Builds the zero-padded numbered index for the `n`th contribution
    /// (1-based). See (I5)/(P6).
    pub fn numbered(n: u64) -> Self {
        ZkeyIndex::Numbered(format_zkey_index(n))
    }

    pub fn as_str(&self) -> &str {
        match self {
            ZkeyIndex::Numbered(s) => s.as_str(),
            ZkeyIndex::Final => FINAL_TOKEN,
        }
    }

    /// Parses a numbered index back into its integer rank. Returns
    /// `None` for the `final` token, per (P6).
    pub fn parse_numbered(&self) -> Option<u64> {
        match self {
            ZkeyIndex::Numbered(s) => s.parse().ok(),
            ZkeyIndex::Final => None,
        }
    }
}

/// Zero-pads `n` to [`GENESIS_INDEX_LEN`] digits.
pub fn format_zkey_index(n: u64) -> String {
    format!("{:0width$}", n, width = GENESIS_INDEX_LEN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CeremonyState {
    Scheduled,
    Opened,
    Paused,
    Closed,
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantStatus {
    Waiting,
    Ready,
    Contributing,
    Contributed,
    Done,
    Finalizing,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributionStep {
    Downloading,
    Computing,
    Uploading,
    Verifying,
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvgTimings {
    pub contribution_computation: i64,
    pub full_contribution: i64,
    pub verify_cloud_function: i64,
}

impl AvgTimings {
    /// `new = prev > 0 ? (prev + sample) / 2 : sample` — an EMA with
    /// smoothing factor 0.5, not a true running mean. Preserved exactly
    /// for compatibility with existing ceremonies' reported timings
    /// (spec.md §9).
    pub fn roll(prev: i64, sample: i64) -> i64 {
        if prev > 0 {
            (prev + sample) / 2
        } else {
            sample
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitingQueue {
    pub contributors: Vec<String>,
    pub current_contributor: Option<String>,
    pub completed_contributions: u64,
    pub failed_contributions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ceremony {
    pub id: String,
    pub state: CeremonyState,
    pub prefix: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Circuit {
    pub ceremony_id: String,
    pub id: String,
    pub sequence_position: u32,
    pub prefix: String,
    pub waiting_queue: WaitingQueue,
    pub avg_timings: AvgTimings,
    pub files: Vec<String>,
    pub instance_id: String,
}

/// A partial entry in `participant.contributions`, populated by the
/// contributor's upload step and completed by the Refresher once the
/// contribution document has been created (I6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialContribution {
    pub hash: Option<String>,
    pub computation_time: Option<i64>,
    pub doc: Option<String>,
}

impl PartialContribution {
    /// The conjunction from spec.md §9: a partial entry awaiting
    /// attachment has a hash and a computation time, but no document
    /// reference yet.
    pub fn is_awaiting_attachment(&self) -> bool {
        self.hash.is_some() && self.computation_time.is_some() && self.doc.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub ceremony_id: String,
    pub user_id: String,
    pub status: ParticipantStatus,
    pub contribution_step: ContributionStep,
    pub contribution_progress: u32,
    pub contributions: Vec<PartialContribution>,
    pub contribution_started_at: i64,
    pub verification_started_at: i64,
    pub last_updated: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSoftware {
    pub name: String,
    pub version: String,
    pub commit_hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContributionFiles {
    pub transcript_filename: String,
    pub transcript_storage_path: String,
    /// Hash of the uploaded transcript. Recorded as the empty string
    /// pending retrieval, per the Open Question in spec.md §9(a) — we
    /// resolve it by re-downloading and hashing after upload (see
    /// verifier.rs).
    pub transcript_hash: String,
    pub zkey_filename: String,
    pub zkey_storage_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizationArtifact {
    pub filename: String,
    pub storage_path: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconRecord {
    pub value: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub id: String,
    pub ceremony_id: String,
    pub circuit_id: String,
    pub participant_id: String,
    pub zkey_index: ZkeyIndex,
    pub valid: bool,
    pub files: Option<ContributionFiles>,
    pub verification_software: Option<VerificationSoftware>,
    pub contribution_computation_time: Option<i64>,
    pub full_contribution_time: Option<i64>,
    pub verify_cloud_function_time: Option<i64>,
    pub last_updated: i64,
    pub verification_key: Option<FinalizationArtifact>,
    pub verifier_contract: Option<FinalizationArtifact>,
    pub beacon: Option<BeaconRecord>,
}
