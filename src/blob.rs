//! Object storage for contribution artifacts (spec.md §6).
//!
//! Path layout is bit-exact for compatibility with existing
//! contributor tooling — these helpers are the only place that layout
//! is allowed to be constructed.

use async_trait::async_trait;
use aws_sdk_s3::Client;

use crate::domain::FINAL_TOKEN;
use crate::error::{CoordinatorError, Result};

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn download(&self, bucket: &str, path: &str, local_file: &str) -> Result<()>;
    async fn delete(&self, bucket: &str, path: &str) -> Result<()>;
}

pub struct S3BlobStore {
    client: Client,
}

impl S3BlobStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(Client::new(&config))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn download(&self, bucket: &str, path: &str, local_file: &str) -> Result<()> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| CoordinatorError::Blob(anyhow::anyhow!(e)))?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| CoordinatorError::Blob(anyhow::anyhow!(e)))?;
        tokio::fs::write(local_file, data.into_bytes())
            .await
            .map_err(|e| CoordinatorError::Blob(anyhow::anyhow!(e)))?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| CoordinatorError::Blob(anyhow::anyhow!(e)))?;
        Ok(())
    }
}

/// `{circuitPrefix}_{zkeyIndex or "final"}.zkey`
pub fn zkey_path(circuit_prefix: &str, zkey_index: &str) -> String {
    format!("{circuit_prefix}_{zkey_index}.zkey")
}

/// Transcript filename under the transcripts prefix:
/// `{circuitPrefix}_{zkeyIndex}_{identifier}_verification_transcript.log`,
/// or `{circuitPrefix}_{identifier}_final_verification_transcript.log`
/// when finalizing.
pub fn transcript_filename(circuit_prefix: &str, zkey_index: &str, identifier: &str) -> String {
    if zkey_index == FINAL_TOKEN {
        format!("{circuit_prefix}_{identifier}_final_verification_transcript.log")
    } else {
        format!("{circuit_prefix}_{zkey_index}_{identifier}_verification_transcript.log")
    }
}

pub fn transcript_path(transcripts_prefix: &str, filename: &str) -> String {
    format!("{transcripts_prefix}/{filename}")
}

/// `{circuitPrefix}_vkey.json`
pub fn verification_key_path(circuit_prefix: &str) -> String {
    format!("{circuit_prefix}_vkey.json")
}

/// `{circuitPrefix}_verifier.sol`
pub fn verifier_contract_path(circuit_prefix: &str) -> String {
    format!("{circuit_prefix}_verifier.sol")
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Blob store test double backed by an in-memory map, standing in
    /// for the worker-side `aws s3 cp`/object upload that the real
    /// [`S3BlobStore`] only observes indirectly (downloads/deletes).
    #[derive(Default)]
    pub struct FakeBlobStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        pub deleted: Mutex<Vec<String>>,
    }

    impl FakeBlobStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put(&self, bucket: &str, path: &str, contents: &[u8]) {
            self.objects
                .lock()
                .unwrap()
                .insert(format!("{bucket}/{path}"), contents.to_vec());
        }

        pub fn contains(&self, bucket: &str, path: &str) -> bool {
            self.objects.lock().unwrap().contains_key(&format!("{bucket}/{path}"))
        }
    }

    #[async_trait]
    impl BlobStore for FakeBlobStore {
        async fn download(&self, bucket: &str, path: &str, local_file: &str) -> Result<()> {
            let key = format!("{bucket}/{path}");
            let data = self
                .objects
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .unwrap_or_else(|| b"fake contents".to_vec());
            tokio::fs::write(local_file, data)
                .await
                .map_err(|e| CoordinatorError::Blob(anyhow::anyhow!(e)))?;
            Ok(())
        }

        async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
            let key = format!("{bucket}/{path}");
            self.objects.lock().unwrap().remove(&key);
            self.deleted.lock().unwrap().push(key);
            Ok(())
        }
    }
}
