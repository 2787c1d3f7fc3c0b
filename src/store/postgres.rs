//! Postgres-backed [`Store`] implementation.
//!
//! Unlike the indexer's `Database`, which leans on `sqlx::query!` for
//! compile-time-checked SQL against a live database, this Store uses
//! the runtime-checked `query`/`query_as` API: a ceremony coordinator
//! is deployed ahead of any migration having run against it in CI, so
//! macro-time schema verification isn't available. The mapping idiom
//! (`PgPool`, `PgPoolOptions`, `sqlx::migrate!`) is otherwise unchanged
//! from the teacher.
//!
//! Change notification is modeled as an in-process broadcast of the
//! before/after snapshots captured inside the same transaction that
//! performs the write. A multi-instance deployment would back this
//! with Postgres `LISTEN`/`NOTIFY` (`pg_notify('participant_changes',
//! payload)`) carrying the same JSON shape, fanned out to a
//! `PgListener` per instance; that wiring is a deployment concern we
//! leave as a documented extension point rather than building out
//! here (see DESIGN.md).

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::sync::broadcast;

use crate::domain::{
    AvgTimings, Ceremony, CeremonyState, Circuit, Contribution, ContributionFiles,
    ContributionStep, FinalizationArtifact, Participant, ParticipantStatus, VerificationSoftware,
    WaitingQueue, ZkeyIndex,
};
use crate::error::{CoordinatorError, Result};

use super::{
    ContributionCreated, ParticipantChange, Store, StoreBatch, StoreWrite,
    TRIGGER_CHANNEL_CAPACITY,
};

pub struct PostgresStore {
    pool: PgPool,
    participant_tx: broadcast::Sender<ParticipantChange>,
    contribution_tx: broadcast::Sender<ContributionCreated>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let (participant_tx, _) = broadcast::channel(TRIGGER_CHANNEL_CAPACITY);
        let (contribution_tx, _) = broadcast::channel(TRIGGER_CHANNEL_CAPACITY);
        Ok(Self {
            pool,
            participant_tx,
            contribution_tx,
        })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoordinatorError::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    async fn fetch_participant_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        ceremony_id: &str,
        user_id: &str,
    ) -> Result<Option<Participant>> {
        let row = sqlx::query(
            r#"SELECT ceremony_id, user_id, status, contribution_step, contribution_progress,
                      contributions, contribution_started_at, verification_started_at, last_updated
               FROM participants WHERE ceremony_id = $1 AND user_id = $2"#,
        )
        .bind(ceremony_id)
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(match row {
            Some(row) => Some(row_to_participant(&row)?),
            None => None,
        })
    }
}

fn row_to_participant(row: &sqlx::postgres::PgRow) -> Result<Participant> {
    let status: String = row.try_get("status")?;
    let step: String = row.try_get("contribution_step")?;
    let contributions: sqlx::types::Json<Vec<crate::domain::PartialContribution>> =
        row.try_get("contributions")?;
    Ok(Participant {
        ceremony_id: row.try_get("ceremony_id")?,
        user_id: row.try_get("user_id")?,
        status: parse_participant_status(&status)?,
        contribution_step: parse_contribution_step(&step)?,
        contribution_progress: row.try_get::<i32, _>("contribution_progress")? as u32,
        contributions: contributions.0,
        contribution_started_at: row.try_get("contribution_started_at")?,
        verification_started_at: row.try_get("verification_started_at")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn parse_participant_status(s: &str) -> Result<ParticipantStatus> {
    Ok(match s {
        "WAITING" => ParticipantStatus::Waiting,
        "READY" => ParticipantStatus::Ready,
        "CONTRIBUTING" => ParticipantStatus::Contributing,
        "CONTRIBUTED" => ParticipantStatus::Contributed,
        "DONE" => ParticipantStatus::Done,
        "FINALIZING" => ParticipantStatus::Finalizing,
        "TIMEDOUT" => ParticipantStatus::TimedOut,
        other => return Err(CoordinatorError::Database(sqlx::Error::Decode(
            format!("unknown participant status {other}").into(),
        ))),
    })
}

fn participant_status_str(status: ParticipantStatus) -> &'static str {
    match status {
        ParticipantStatus::Waiting => "WAITING",
        ParticipantStatus::Ready => "READY",
        ParticipantStatus::Contributing => "CONTRIBUTING",
        ParticipantStatus::Contributed => "CONTRIBUTED",
        ParticipantStatus::Done => "DONE",
        ParticipantStatus::Finalizing => "FINALIZING",
        ParticipantStatus::TimedOut => "TIMEDOUT",
    }
}

fn parse_contribution_step(s: &str) -> Result<ContributionStep> {
    Ok(match s {
        "DOWNLOADING" => ContributionStep::Downloading,
        "COMPUTING" => ContributionStep::Computing,
        "UPLOADING" => ContributionStep::Uploading,
        "VERIFYING" => ContributionStep::Verifying,
        "COMPLETED" => ContributionStep::Completed,
        other => return Err(CoordinatorError::Database(sqlx::Error::Decode(
            format!("unknown contribution step {other}").into(),
        ))),
    })
}

fn contribution_step_str(step: ContributionStep) -> &'static str {
    match step {
        ContributionStep::Downloading => "DOWNLOADING",
        ContributionStep::Computing => "COMPUTING",
        ContributionStep::Uploading => "UPLOADING",
        ContributionStep::Verifying => "VERIFYING",
        ContributionStep::Completed => "COMPLETED",
    }
}

fn ceremony_state_str(state: CeremonyState) -> &'static str {
    match state {
        CeremonyState::Scheduled => "SCHEDULED",
        CeremonyState::Opened => "OPENED",
        CeremonyState::Paused => "PAUSED",
        CeremonyState::Closed => "CLOSED",
        CeremonyState::Finalized => "FINALIZED",
    }
}

fn parse_ceremony_state(s: &str) -> Result<CeremonyState> {
    Ok(match s {
        "SCHEDULED" => CeremonyState::Scheduled,
        "OPENED" => CeremonyState::Opened,
        "PAUSED" => CeremonyState::Paused,
        "CLOSED" => CeremonyState::Closed,
        "FINALIZED" => CeremonyState::Finalized,
        other => return Err(CoordinatorError::Database(sqlx::Error::Decode(
            format!("unknown ceremony state {other}").into(),
        ))),
    })
}

fn row_to_circuit(row: &sqlx::postgres::PgRow) -> Result<Circuit> {
    let waiting_queue: sqlx::types::Json<WaitingQueue> = row.try_get("waiting_queue")?;
    let avg_timings: sqlx::types::Json<AvgTimings> = row.try_get("avg_timings")?;
    let files: sqlx::types::Json<Vec<String>> = row.try_get("files")?;
    Ok(Circuit {
        ceremony_id: row.try_get("ceremony_id")?,
        id: row.try_get("id")?,
        sequence_position: row.try_get::<i32, _>("sequence_position")? as u32,
        prefix: row.try_get("prefix")?,
        waiting_queue: waiting_queue.0,
        avg_timings: avg_timings.0,
        files: files.0,
        instance_id: row.try_get("instance_id")?,
    })
}

fn row_to_contribution(row: &sqlx::postgres::PgRow) -> Result<Contribution> {
    let zkey_index_str: String = row.try_get("zkey_index")?;
    let zkey_index = if zkey_index_str == crate::domain::FINAL_TOKEN {
        ZkeyIndex::Final
    } else {
        ZkeyIndex::Numbered(zkey_index_str)
    };
    let files: Option<sqlx::types::Json<ContributionFiles>> = row.try_get("files")?;
    let verification_software: Option<sqlx::types::Json<VerificationSoftware>> =
        row.try_get("verification_software")?;
    let verification_key: Option<sqlx::types::Json<FinalizationArtifact>> =
        row.try_get("verification_key")?;
    let verifier_contract: Option<sqlx::types::Json<FinalizationArtifact>> =
        row.try_get("verifier_contract")?;
    let beacon: Option<sqlx::types::Json<crate::domain::BeaconRecord>> = row.try_get("beacon")?;

    Ok(Contribution {
        id: row.try_get("id")?,
        ceremony_id: row.try_get("ceremony_id")?,
        circuit_id: row.try_get("circuit_id")?,
        participant_id: row.try_get("participant_id")?,
        zkey_index,
        valid: row.try_get("valid")?,
        files: files.map(|j| j.0),
        verification_software: verification_software.map(|j| j.0),
        contribution_computation_time: row.try_get("contribution_computation_time")?,
        full_contribution_time: row.try_get("full_contribution_time")?,
        verify_cloud_function_time: row.try_get("verify_cloud_function_time")?,
        last_updated: row.try_get("last_updated")?,
        verification_key: verification_key.map(|j| j.0),
        verifier_contract: verifier_contract.map(|j| j.0),
        beacon: beacon.map(|j| j.0),
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_ceremony(&self, ceremony_id: &str) -> Result<Ceremony> {
        let row = sqlx::query("SELECT id, state, prefix, title FROM ceremonies WHERE id = $1")
            .bind(ceremony_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("ceremony {ceremony_id}")))?;
        let state: String = row.try_get("state")?;
        Ok(Ceremony {
            id: row.try_get("id")?,
            state: parse_ceremony_state(&state)?,
            prefix: row.try_get("prefix")?,
            title: row.try_get("title")?,
        })
    }

    async fn get_circuit(&self, ceremony_id: &str, circuit_id: &str) -> Result<Circuit> {
        let row = sqlx::query(
            r#"SELECT ceremony_id, id, sequence_position, prefix, waiting_queue, avg_timings,
                      files, instance_id
               FROM circuits WHERE ceremony_id = $1 AND id = $2"#,
        )
        .bind(ceremony_id)
        .bind(circuit_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoordinatorError::NotFound(format!("circuit {ceremony_id}/{circuit_id}")))?;
        row_to_circuit(&row)
    }

    async fn list_circuits(&self, ceremony_id: &str) -> Result<Vec<Circuit>> {
        let rows = sqlx::query(
            r#"SELECT ceremony_id, id, sequence_position, prefix, waiting_queue, avg_timings,
                      files, instance_id
               FROM circuits WHERE ceremony_id = $1 ORDER BY sequence_position ASC"#,
        )
        .bind(ceremony_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_circuit).collect()
    }

    async fn get_participant(&self, ceremony_id: &str, user_id: &str) -> Result<Participant> {
        let row = sqlx::query(
            r#"SELECT ceremony_id, user_id, status, contribution_step, contribution_progress,
                      contributions, contribution_started_at, verification_started_at, last_updated
               FROM participants WHERE ceremony_id = $1 AND user_id = $2"#,
        )
        .bind(ceremony_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            CoordinatorError::NotFound(format!("participant {ceremony_id}/{user_id}"))
        })?;
        row_to_participant(&row)
    }

    async fn get_final_contribution(
        &self,
        ceremony_id: &str,
        circuit_id: &str,
    ) -> Result<Contribution> {
        let row = sqlx::query(
            r#"SELECT id, ceremony_id, circuit_id, participant_id, zkey_index, valid, files,
                      verification_software, contribution_computation_time, full_contribution_time,
                      verify_cloud_function_time, last_updated, verification_key,
                      verifier_contract, beacon
               FROM contributions
               WHERE ceremony_id = $1 AND circuit_id = $2 AND zkey_index = $3"#,
        )
        .bind(ceremony_id)
        .bind(circuit_id)
        .bind(crate::domain::FINAL_TOKEN)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            CoordinatorError::NotFound(format!("final contribution {ceremony_id}/{circuit_id}"))
        })?;
        row_to_contribution(&row)
    }

    async fn commit(&self, batch: StoreBatch) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut participant_events = Vec::new();
        let mut contribution_events = Vec::new();

        for write in &batch {
            match write {
                StoreWrite::UpsertParticipant(after) => {
                    let before = Self::fetch_participant_tx(
                        &mut tx,
                        &after.ceremony_id,
                        &after.user_id,
                    )
                    .await?
                    .unwrap_or_else(|| {
                        let mut synthetic = after.clone();
                        synthetic.contribution_progress = 0;
                        synthetic.contribution_started_at = 0;
                        synthetic
                    });

                    sqlx::query(
                        r#"INSERT INTO participants
                            (ceremony_id, user_id, status, contribution_step, contribution_progress,
                             contributions, contribution_started_at, verification_started_at, last_updated)
                           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                           ON CONFLICT (ceremony_id, user_id) DO UPDATE SET
                             status = EXCLUDED.status,
                             contribution_step = EXCLUDED.contribution_step,
                             contribution_progress = EXCLUDED.contribution_progress,
                             contributions = EXCLUDED.contributions,
                             contribution_started_at = EXCLUDED.contribution_started_at,
                             verification_started_at = EXCLUDED.verification_started_at,
                             last_updated = EXCLUDED.last_updated"#,
                    )
                    .bind(&after.ceremony_id)
                    .bind(&after.user_id)
                    .bind(participant_status_str(after.status))
                    .bind(contribution_step_str(after.contribution_step))
                    .bind(after.contribution_progress as i32)
                    .bind(sqlx::types::Json(&after.contributions))
                    .bind(after.contribution_started_at)
                    .bind(after.verification_started_at)
                    .bind(after.last_updated)
                    .execute(&mut *tx)
                    .await?;

                    participant_events.push(ParticipantChange {
                        before,
                        after: after.clone(),
                    });
                }
                StoreWrite::UpsertCircuit(circuit) => {
                    sqlx::query(
                        r#"INSERT INTO circuits
                            (ceremony_id, id, sequence_position, prefix, waiting_queue, avg_timings,
                             files, instance_id)
                           VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                           ON CONFLICT (ceremony_id, id) DO UPDATE SET
                             waiting_queue = EXCLUDED.waiting_queue,
                             avg_timings = EXCLUDED.avg_timings,
                             files = EXCLUDED.files,
                             instance_id = EXCLUDED.instance_id"#,
                    )
                    .bind(&circuit.ceremony_id)
                    .bind(&circuit.id)
                    .bind(circuit.sequence_position as i32)
                    .bind(&circuit.prefix)
                    .bind(sqlx::types::Json(&circuit.waiting_queue))
                    .bind(sqlx::types::Json(&circuit.avg_timings))
                    .bind(sqlx::types::Json(&circuit.files))
                    .bind(&circuit.instance_id)
                    .execute(&mut *tx)
                    .await?;
                }
                StoreWrite::CreateContribution(contribution) => {
                    insert_contribution(&mut tx, contribution).await?;
                    contribution_events.push(ContributionCreated {
                        contribution: contribution.clone(),
                    });
                }
                StoreWrite::UpdateContribution(contribution) => {
                    insert_contribution(&mut tx, contribution).await?;
                }
            }
        }

        tx.commit().await?;

        // Only emitted after the transaction lands; a crash between
        // commit and broadcast means a missed trigger, which the Open
        // Question in DESIGN.md addresses via Postgres NOTIFY for
        // multi-instance deployments.
        for event in participant_events {
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

async fn insert_contribution(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    contribution: &Contribution,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO contributions
            (id, ceremony_id, circuit_id, participant_id, zkey_index, valid, files,
             verification_software, contribution_computation_time, full_contribution_time,
             verify_cloud_function_time, last_updated, verification_key, verifier_contract, beacon)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
           ON CONFLICT (id) DO UPDATE SET
             valid = EXCLUDED.valid,
             files = EXCLUDED.files,
             verification_software = EXCLUDED.verification_software,
             contribution_computation_time = EXCLUDED.contribution_computation_time,
             full_contribution_time = EXCLUDED.full_contribution_time,
             verify_cloud_function_time = EXCLUDED.verify_cloud_function_time,
             last_updated = EXCLUDED.last_updated,
             verification_key = EXCLUDED.verification_key,
             verifier_contract = EXCLUDED.verifier_contract,
             beacon = EXCLUDED.beacon"#,
    )
    .bind(&contribution.id)
    .bind(&contribution.ceremony_id)
    .bind(&contribution.circuit_id)
    .bind(&contribution.participant_id)
    .bind(contribution.zkey_index.as_str())
    .bind(contribution.valid)
    .bind(contribution.files.as_ref().map(sqlx::types::Json))
    .bind(contribution.verification_software.as_ref().map(sqlx::types::Json))
    .bind(contribution.contribution_computation_time)
    .bind(contribution.full_contribution_time)
    .bind(contribution.verify_cloud_function_time)
    .bind(contribution.last_updated)
    .bind(contribution.verification_key.as_ref().map(sqlx::types::Json))
    .bind(contribution.verifier_contract.as_ref().map(sqlx::types::Json))
    .bind(contribution.beacon.as_ref().map(sqlx::types::Json))
    .execute(&mut **tx)
    .await?;
    Ok(())
}
