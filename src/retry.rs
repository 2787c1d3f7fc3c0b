//! Shared retry helper for atomic batch commits (spec.md §5/§7:
//! "transient store conflicts must retry the batch").

use std::time::Duration;

use crate::error::Result;
use crate::store::{Store, StoreBatch};

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(20);

pub async fn commit_with_retry(store: &dyn Store, batch: StoreBatch) -> Result<()> {
    let mut attempt = 0;
    loop {
        match store.commit(batch.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(BASE_BACKOFF * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
