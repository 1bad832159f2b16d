//! One worker's receive/claim/extract/complete loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use docflow_core::{BlobRef, ErrorKind, Job, JobError, JobStatus, JobUpdate};

use super::pool::{update_stats, SharedStats, WorkerPool, WorkerPoolConfig};
use crate::broker::{Backoff, BrokerError, Delivery, DeliveryHandle};
use crate::extraction::{ExtractionError, PermanentReason, TransientReason};
use crate::jobs::{release_claim, JobStoreError, Released};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Succeeded,
    Failed,
    DeadLettered,
    Requeued,
    Discarded,
}

enum Claim {
    Claimed(Job),
    Settled(Disposition),
}

/// How a claimed run ended.
enum Run {
    Finished(Result<BlobRef, ExtractionError>),
    ClaimLost,
    Aborted,
}

pub(super) struct Worker {
    name: String,
    pool: WorkerPool,
    config: Arc<WorkerPoolConfig>,
    stats: SharedStats,
    shutdown: watch::Receiver<bool>,
    abort: watch::Receiver<bool>,
}

impl Worker {
    pub(super) fn new(
        name: String,
        pool: WorkerPool,
        config: Arc<WorkerPoolConfig>,
        stats: SharedStats,
        shutdown: watch::Receiver<bool>,
        abort: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name,
            pool,
            config,
            stats,
            shutdown,
            abort,
        }
    }

    /// Consume until shutdown, resubscribing whenever the stream ends.
    pub(super) async fn run(mut self) {
        info!(worker = %self.name, "worker started");
        let mut backoff = Backoff::new(self.config.resubscribe.clone());

        'subscribe: while !signalled(&self.shutdown) {
            let mut deliveries = match self.pool.broker.consume(&self.name).await {
                Ok(deliveries) => {
                    backoff.reset();
                    deliveries
                }
                Err(BrokerError::Closed) => break,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(worker = %self.name, error = %e, delay_ms = delay.as_millis() as u64, "subscribe failed");
                    if !sleep_unless(delay, self.shutdown.clone()).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                let mut shutdown = self.shutdown.clone();
                let next = tokio::select! {
                    biased;
                    _ = wait_for(&mut shutdown) => break 'subscribe,
                    next = deliveries.next() => next,
                };
                match next {
                    Some(delivery) => self.handle(delivery).await,
                    None => break,
                }
            }

            if signalled(&self.shutdown) {
                break;
            }
            let delay = backoff.next_delay();
            warn!(worker = %self.name, delay_ms = delay.as_millis() as u64, "subscription ended, resubscribing");
            if !sleep_unless(delay, self.shutdown.clone()).await {
                break;
            }
        }

        info!(worker = %self.name, "worker stopped");
    }

    async fn handle(&self, delivery: Delivery) {
        update_stats(&self.stats, |s| {
            s.deliveries += 1;
            s.in_flight += 1;
        });

        let span = info_span!(
            "delivery",
            worker = %self.name,
            job_id = %delivery.message.job_id,
            queued_at_attempt = delivery.message.attempt_hint,
            redelivered = delivery.redelivered
        );
        let disposition = self.process(&delivery).instrument(span).await;

        update_stats(&self.stats, |s| {
            s.in_flight = s.in_flight.saturating_sub(1);
            match disposition {
                Disposition::Succeeded => s.succeeded += 1,
                Disposition::Failed => s.failed += 1,
                Disposition::DeadLettered => s.dead_lettered += 1,
                Disposition::Requeued => s.requeued += 1,
                Disposition::Discarded => s.discarded += 1,
            }
        });
    }

    async fn process(&self, delivery: &Delivery) -> Disposition {
        let job = match self.claim(delivery).await {
            Claim::Claimed(job) => job,
            Claim::Settled(disposition) => return disposition,
        };
        let handle = &delivery.handle;

        // Budget shrank since the job was queued.
        if job.attempt_count > self.config.retry.max_attempts {
            return self.dead_letter_over_budget(job, handle).await;
        }

        info!(attempt = job.attempt_count, "job claimed");
        let mut abort = self.abort.clone();
        let run = tokio::select! {
            biased;
            _ = wait_for(&mut abort) => Run::Aborted,
            _ = self.hold_claim(&job) => Run::ClaimLost,
            result = self.run_extraction(&job) => Run::Finished(result),
        };

        match run {
            Run::Finished(Ok(output_ref)) => {
                self.complete(&job, JobStatus::Succeeded, JobUpdate::succeeded(output_ref), handle)
                    .await
            }
            Run::Finished(Err(ExtractionError::Permanent { reason, message })) => {
                warn!(attempt = job.attempt_count, ?reason, %message, "permanent extraction failure");
                let error = JobError::new(reason.error_kind(), message);
                self.complete(&job, JobStatus::Failed, JobUpdate::errored(error), handle)
                    .await
            }
            Run::Finished(Err(ExtractionError::Transient { reason, message })) => {
                info!(attempt = job.attempt_count, ?reason, %message, "transient extraction failure");
                self.release(&job, handle, &message, self.config.retry.delay_for_attempt(job.attempt_count))
                    .await
            }
            Run::ClaimLost => {
                warn!(attempt = job.attempt_count, "claim lost mid-run, abandoning extraction");
                self.ack(handle).await;
                Disposition::Discarded
            }
            Run::Aborted => {
                warn!(attempt = job.attempt_count, "extraction aborted by shutdown");
                self.release(&job, handle, "worker shut down", Duration::ZERO).await
            }
        }
    }

    /// `Queued -> Running`, or settle the delivery if this worker cannot own
    /// the job.
    async fn claim(&self, delivery: &Delivery) -> Claim {
        let job_id = delivery.message.job_id;
        let handle = &delivery.handle;

        match self
            .pool
            .store
            .transition(job_id, &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim())
            .await
        {
            Ok(job) => Claim::Claimed(job),
            Err(e) if e.is_conflict() => self.resolve_conflict(delivery).await,
            Err(JobStoreError::NotFound(_)) => {
                warn!("message for unknown job, dropping");
                self.ack(handle).await;
                Claim::Settled(Disposition::Discarded)
            }
            Err(e) => {
                error!(error = %e, "claim failed");
                Claim::Settled(self.requeue_later(handle).await)
            }
        }
    }

    /// Lost the claim race: find out why and settle accordingly.
    async fn resolve_conflict(&self, delivery: &Delivery) -> Claim {
        let handle = &delivery.handle;
        let current = match self.pool.store.get(delivery.message.job_id).await {
            Ok(job) => job,
            Err(JobStoreError::NotFound(_)) => {
                self.ack(handle).await;
                return Claim::Settled(Disposition::Discarded);
            }
            Err(e) => {
                error!(error = %e, "failed to load job after claim conflict");
                return Claim::Settled(self.requeue_later(handle).await);
            }
        };

        match current.status {
            status if status.is_terminal() => {
                debug!(%status, "job already finished, discarding duplicate delivery");
                self.ack(handle).await;
                Claim::Settled(Disposition::Discarded)
            }
            JobStatus::Pending => {
                debug!("job not queued yet, requeueing delivery");
                Claim::Settled(self.requeue_later(handle).await)
            }
            JobStatus::Queued => {
                debug!("job changed under the claim, requeueing delivery");
                self.nack(handle).await;
                Claim::Settled(Disposition::Requeued)
            }
            JobStatus::Running => {
                let lease = chrono::Duration::from_std(self.config.claim_lease).unwrap_or(chrono::Duration::MAX);
                if current.claim_expired(lease, Utc::now()) {
                    self.take_over(current, handle).await
                } else {
                    debug!("job held by another worker, discarding delivery");
                    self.ack(handle).await;
                    Claim::Settled(Disposition::Discarded)
                }
            }
            // Terminal statuses are handled above.
            _ => {
                self.ack(handle).await;
                Claim::Settled(Disposition::Discarded)
            }
        }
    }

    /// Release an abandoned claim and claim the job for this delivery.
    async fn take_over(&self, abandoned: Job, handle: &DeliveryHandle) -> Claim {
        info!(attempt = abandoned.attempt_count, "taking over abandoned claim");
        match release_claim(self.pool.store.as_ref(), &abandoned, &self.config.retry, "claim lease expired").await {
            Ok(Released::Requeued(_)) => {}
            Ok(Released::DeadLettered(dead)) => {
                self.ack(handle).await;
                self.notify(&dead).await;
                return Claim::Settled(Disposition::DeadLettered);
            }
            Err(e) if e.is_conflict() => {
                debug!("abandoned claim already released elsewhere");
                self.ack(handle).await;
                return Claim::Settled(Disposition::Discarded);
            }
            Err(e) => {
                error!(error = %e, "failed to release abandoned claim");
                return Claim::Settled(self.requeue_later(handle).await);
            }
        }

        match self
            .pool
            .store
            .transition(abandoned.id, &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim())
            .await
        {
            Ok(job) => Claim::Claimed(job),
            Err(e) if e.is_conflict() => {
                debug!("released job claimed by another worker");
                self.ack(handle).await;
                Claim::Settled(Disposition::Discarded)
            }
            Err(e) => {
                // The job is back in `Queued`; this delivery will claim it.
                error!(error = %e, "claim after release failed");
                Claim::Settled(self.requeue_later(handle).await)
            }
        }
    }

    /// Renew the claim while the job runs. Resolves only once the claim is
    /// gone: released by a sweep, or claimed again elsewhere.
    async fn hold_claim(&self, job: &Job) {
        let every = self.config.renew_every();
        loop {
            tokio::time::sleep(every).await;
            match self.pool.store.renew_claim(job.id, job.attempt_count).await {
                Ok(_) => debug!("claim renewed"),
                Err(e) if e.is_conflict() || matches!(e, JobStoreError::NotFound(_)) => {
                    debug!(error = %e, "claim no longer held");
                    return;
                }
                Err(e) => warn!(error = %e, "claim renewal failed, will retry"),
            }
        }
    }

    async fn run_extraction(&self, job: &Job) -> Result<BlobRef, ExtractionError> {
        let input = self
            .pool
            .resolver
            .input_of(job)
            .map_err(|e| ExtractionError::permanent(PermanentReason::MalformedInput, e.to_string()))?;

        let extracted = self
            .pool
            .extraction
            .extract(&input, self.config.extraction_timeout)
            .await?;

        let output = self
            .pool
            .resolver
            .output_for(job.id)
            .map_err(|e| ExtractionError::permanent(PermanentReason::MalformedInput, e.to_string()))?;
        self.pool
            .blobs
            .put_at(&output, extracted.text.into_bytes())
            .await
            .map_err(|e| ExtractionError::transient(TransientReason::BlobUnavailable, format!("writing output failed: {e}")))?;
        Ok(output)
    }

    /// Record a terminal outcome for the claim this worker holds, then ack
    /// and notify.
    async fn complete(&self, job: &Job, to: JobStatus, update: JobUpdate, handle: &DeliveryHandle) -> Disposition {
        let update = update.expecting_attempt(job.attempt_count);
        match self.pool.store.transition(job.id, &[JobStatus::Running], to, update).await {
            Ok(done) => {
                self.ack(handle).await;
                info!(status = %done.status, attempt = done.attempt_count, "job finished");
                self.notify(&done).await;
                if to == JobStatus::Succeeded {
                    Disposition::Succeeded
                } else {
                    Disposition::Failed
                }
            }
            Err(e) if e.is_conflict() => {
                debug!(error = %e, "claim was taken over, discarding result");
                self.ack(handle).await;
                Disposition::Discarded
            }
            Err(e) => {
                // Job stays `Running`; the lease brings it back.
                error!(error = %e, "failed to record outcome");
                self.nack(handle).await;
                Disposition::Requeued
            }
        }
    }

    /// Give the claim back after a transient failure or an abort.
    async fn release(&self, job: &Job, handle: &DeliveryHandle, reason: &str, delay: Duration) -> Disposition {
        match release_claim(self.pool.store.as_ref(), job, &self.config.retry, reason).await {
            Ok(Released::Requeued(_)) => {
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "backing off before requeue");
                    sleep_unless(delay, self.shutdown.clone()).await;
                }
                self.nack(handle).await;
                Disposition::Requeued
            }
            Ok(Released::DeadLettered(dead)) => {
                self.ack(handle).await;
                self.notify(&dead).await;
                Disposition::DeadLettered
            }
            Err(e) if e.is_conflict() => {
                debug!(error = %e, "claim was taken over, discarding delivery");
                self.ack(handle).await;
                Disposition::Discarded
            }
            Err(e) => {
                error!(error = %e, "failed to release claim");
                self.nack(handle).await;
                Disposition::Requeued
            }
        }
    }

    async fn dead_letter_over_budget(&self, job: Job, handle: &DeliveryHandle) -> Disposition {
        let error = JobError::new(
            ErrorKind::AttemptsExhausted,
            format!(
                "attempt {} exceeds the limit of {}",
                job.attempt_count, self.config.retry.max_attempts
            ),
        );
        let update = JobUpdate::errored(error).expecting_attempt(job.attempt_count);
        match self
            .pool
            .store
            .transition(job.id, &[JobStatus::Running], JobStatus::DeadLettered, update)
            .await
        {
            Ok(dead) => {
                warn!(attempt = dead.attempt_count, "job dead-lettered");
                self.ack(handle).await;
                self.notify(&dead).await;
                Disposition::DeadLettered
            }
            Err(e) if e.is_conflict() => {
                self.ack(handle).await;
                Disposition::Discarded
            }
            Err(e) => {
                error!(error = %e, "failed to dead-letter job");
                self.nack(handle).await;
                Disposition::Requeued
            }
        }
    }

    /// Wait `requeue_delay` (cut short by shutdown), then requeue.
    async fn requeue_later(&self, handle: &DeliveryHandle) -> Disposition {
        sleep_unless(self.config.requeue_delay, self.shutdown.clone()).await;
        self.nack(handle).await;
        Disposition::Requeued
    }

    async fn ack(&self, handle: &DeliveryHandle) {
        if let Err(e) = self.pool.broker.ack(handle).await {
            warn!(error = %e, "ack failed, delivery may be redelivered");
        }
    }

    async fn nack(&self, handle: &DeliveryHandle) {
        if let Err(e) = self.pool.broker.nack(handle, true).await {
            warn!(error = %e, "requeue failed, delivery will be redelivered");
        }
    }

    async fn notify(&self, job: &Job) {
        if let Some(outcome) = job.outcome() {
            self.pool.notifier.notify(&job.owner, job.id, outcome).await;
        }
    }
}

/// True once the signal has been sent, or its sender is gone.
fn signalled(rx: &watch::Receiver<bool>) -> bool {
    rx.has_changed().is_err() || *rx.borrow()
}

/// Resolves when the signal is sent or its sender is dropped.
async fn wait_for(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay`. Returns `false` if the signal fired first.
async fn sleep_unless(delay: Duration, mut signal: watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = wait_for(&mut signal) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
