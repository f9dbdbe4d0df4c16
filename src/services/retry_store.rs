//! Durable ledger of writes that exhausted their in-line retries.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::future::BoxFuture;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::RetryConfig,
    dao::{
        models::{FailedUpdateEntity, FailedUpdateStatus, UpdateKind, UpdatePayload},
        record_store::RetryLedger,
    },
    error::SyncError,
    services::backoff::BackoffPolicy,
};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Replays one payload; registered per [`UpdateKind`].
pub type RetryHandler =
    Arc<dyn Fn(UpdatePayload) -> BoxFuture<'static, Result<(), SyncError>> + Send + Sync>;

/// Handlers used by [`RetryStore::process_pending_updates`].
pub type RetryHandlers = HashMap<UpdateKind, RetryHandler>;

/// Result of one replay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The payload was applied.
    Completed,
    /// The attempt failed; the record is pending again.
    Rescheduled,
    /// The attempt failed and the budget is exhausted.
    Failed,
    /// Another worker owns the record, or it is no longer pending.
    Skipped,
}

/// Counts returned by [`RetryStore::process_pending_updates`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Entries written and removed from the ledger.
    pub succeeded: usize,
    /// Entries that failed again or gave up.
    pub failed: usize,
}

/// Durable retry ledger for score writes the queue could not land.
pub struct RetryStore {
    ledger: Arc<dyn RetryLedger>,
    backoff: BackoffPolicy,
    config: RetryConfig,
}

impl RetryStore {
    /// Wrap `ledger` with the given retry limits.
    pub fn new(ledger: Arc<dyn RetryLedger>, backoff: BackoffPolicy, config: RetryConfig) -> Self {
        Self {
            ledger,
            backoff,
            config,
        }
    }

    /// Append a pending record for a write that could not be applied.
    pub async fn store_failed_update(
        &self,
        code: &str,
        player_id: Uuid,
        payload: UpdatePayload,
    ) -> Result<FailedUpdateEntity, SyncError> {
        let record =
            FailedUpdateEntity::pending(code, player_id, payload, self.config.max_attempts);
        self.ledger.insert(record.clone()).await?;
        info!(
            code = %code,
            player_id = %player_id,
            record_id = %record.id,
            kind = ?record.kind,
            "stored failed update for replay"
        );
        Ok(record)
    }

    /// Pending records of one player that still have attempts left, oldest first.
    pub async fn get_pending_updates(
        &self,
        code: &str,
        player_id: Uuid,
    ) -> Result<Vec<FailedUpdateEntity>, SyncError> {
        let records = self
            .ledger
            .list_pending(Some((code.to_owned(), player_id)))
            .await?;
        Ok(records
            .into_iter()
            .filter(FailedUpdateEntity::is_retryable)
            .collect())
    }

    /// Claim a record, run `retry_fn` on its payload and record the outcome.
    pub async fn retry_update<F, Fut>(&self, id: Uuid, retry_fn: F) -> Result<RetryOutcome, SyncError>
    where
        F: FnOnce(UpdatePayload) -> Fut,
        Fut: Future<Output = Result<(), SyncError>>,
    {
        let Some(mut record) = self.ledger.claim(id).await? else {
            return Ok(RetryOutcome::Skipped);
        };

        let result = retry_fn(record.payload.clone()).await;
        let now = SystemTime::now();
        record.updated_at = now;

        let outcome = match result {
            Ok(()) => {
                record.status = FailedUpdateStatus::Completed;
                record.last_error = None;
                RetryOutcome::Completed
            }
            Err(err) => {
                record.attempts += 1;
                record.last_error = Some(err.to_string());
                if record.attempts >= record.max_attempts {
                    record.status = FailedUpdateStatus::Failed;
                    warn!(
                        record_id = %record.id,
                        code = %record.session_code,
                        player_id = %record.player_id,
                        attempts = record.attempts,
                        error = %err,
                        "failed update exhausted its retries"
                    );
                    RetryOutcome::Failed
                } else {
                    record.status = FailedUpdateStatus::Pending;
                    record.next_attempt_at = now + self.backoff.delay_for(record.attempts);
                    debug!(
                        record_id = %record.id,
                        attempts = record.attempts,
                        error = %err,
                        "failed update rescheduled"
                    );
                    RetryOutcome::Rescheduled
                }
            }
        };

        self.ledger.update(record).await?;
        Ok(outcome)
    }

    /// Replay every pending record of one player, dispatching by kind.
    pub async fn process_pending_updates(
        &self,
        code: &str,
        player_id: Uuid,
        handlers: &RetryHandlers,
    ) -> Result<ProcessReport, SyncError> {
        let mut report = ProcessReport::default();
        for record in self.get_pending_updates(code, player_id).await? {
            let Some(handler) = handlers.get(&record.kind).cloned() else {
                warn!(record_id = %record.id, kind = ?record.kind, "no retry handler registered");
                report.failed += 1;
                continue;
            };

            match self.retry_update(record.id, |payload| handler(payload)).await? {
                RetryOutcome::Completed => report.succeeded += 1,
                RetryOutcome::Rescheduled | RetryOutcome::Failed => report.failed += 1,
                RetryOutcome::Skipped => {}
            }
        }
        Ok(report)
    }

    /// (session, player) groups with at least one record due at `now`.
    pub async fn due_groups(&self, now: SystemTime) -> Result<Vec<(String, Uuid)>, SyncError> {
        let mut seen = HashSet::new();
        Ok(self
            .ledger
            .list_pending(None)
            .await?
            .into_iter()
            .filter(|record| record.is_retryable() && record.next_attempt_at <= now)
            .map(|record| (record.session_code, record.player_id))
            .filter(|group| seen.insert(group.clone()))
            .collect())
    }

    /// Return abandoned `processing` claims to pending.
    pub async fn release_stale_claims(&self) -> Result<u64, SyncError> {
        let cutoff = SystemTime::now() - self.config.processing_timeout;
        Ok(self.ledger.release_stale_claims(cutoff).await?)
    }

    /// Purge completed and failed records older than `days_old` days.
    pub async fn cleanup_old_records(&self, days_old: u32) -> Result<u64, SyncError> {
        let cutoff = SystemTime::now() - DAY * days_old;
        let purged = self.ledger.purge_finished(cutoff).await?;
        if purged > 0 {
            info!(purged, days_old, "purged finished retry records");
        }
        Ok(purged)
    }

    /// Retention window from configuration.
    pub fn retention_days(&self) -> u32 {
        self.config.retention_days
    }
}
