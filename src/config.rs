//! Coordinator configuration

use serde::Deserialize;

use crate::error::CoordinatorError;

/// Verification-software identity recorded against every contribution
/// (spec.md §6). Absence of any of these environment variables is
/// fatal to the Verifier.
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationSoftwareConfig {
    pub name: String,
    pub version: String,
    pub commit_hash: String,
}

impl VerificationSoftwareConfig {
    pub fn from_env() -> Result<Self, CoordinatorError> {
        Ok(Self {
            name: require_env("CUSTOM_CONTRIBUTION_VERIFICATION_SOFTWARE_NAME")?,
            version: require_env("CUSTOM_CONTRIBUTION_VERIFICATION_SOFTWARE_VERSION")?,
            commit_hash: require_env("CUSTOM_CONTRIBUTION_VERIFICATION_SOFTWARE_COMMIT_HASH")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// PostgreSQL database URL backing the Store.
    pub database_url: String,

    /// HTTP server port for the RPC surface.
    pub port: u16,

    /// Default bucket name for the Blob Store, when an RPC caller
    /// doesn't supply one.
    pub default_bucket: String,

    /// Shared secret used to verify bearer-token signatures.
    pub jwt_secret: String,

    /// Settle interval after starting a worker, before probing
    /// readiness (spec.md §4.2 step 4). Conservative bound standing in
    /// for a real readiness protocol (spec.md §9).
    pub worker_settle_seconds: u64,

    /// Settle interval after a valid verification, before the
    /// transcript is assumed to have propagated to the Blob Store
    /// (spec.md §4.2 step 7).
    pub transcript_settle_seconds: u64,

    pub verification_software: VerificationSoftwareConfig,
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self, CoordinatorError> {
        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            default_bucket: std::env::var("CEREMONY_BUCKET")
                .unwrap_or_else(|_| "ceremony-artifacts".to_string()),
            jwt_secret: require_env("CEREMONY_JWT_SECRET")?,
            worker_settle_seconds: std::env::var("WORKER_SETTLE_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(200),
            transcript_settle_seconds: std::env::var("TRANSCRIPT_SETTLE_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            verification_software: VerificationSoftwareConfig::from_env()?,
        })
    }
}

fn require_env(key: &str) -> Result<String, CoordinatorError> {
    std::env::var(key).map_err(|_| CoordinatorError::Config(format!("{key} not set")))
}
