//! # Sync Worker
//!
//! Background executor for sync jobs submitted by request handlers.
//!
//! ## Job Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Worker Flow                                 │
//! │                                                                         │
//! │  handler ──submit(job)──► mpsc queue ──► SyncWorker::run                │
//! │     │                                         │                         │
//! │     └── returns SyncTicket at once            │ one task per job        │
//! │                                               ▼                         │
//! │                                 ┌──────────────────────────┐            │
//! │                                 │  SyncJob::Sync           │            │
//! │                                 │    engine.run_sync       │            │
//! │                                 │  SyncJob::Reconcile      │            │
//! │                                 │    engine.reconcile      │            │
//! │                                 └────────────┬─────────────┘            │
//! │                                              │                          │
//! │              outcome ──► tracing + tenant status (last_error/report)   │
//! │                                                                         │
//! │  Tenants run in parallel. Shutdown stops taking jobs and waits for the │
//! │  ones already running.                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::client::LeadFetch;
use crate::config::SyncMode;
use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Jobs
// =============================================================================

/// Receipt for a queued sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTicket {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub mode: SyncMode,
    pub queued_at: DateTime<Utc>,
}

impl SyncTicket {
    pub fn new(tenant_id: impl Into<String>, mode: SyncMode) -> Self {
        SyncTicket {
            job_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            mode,
            queued_at: Utc::now(),
        }
    }
}

/// Work for the background worker.
#[derive(Debug)]
pub enum SyncJob {
    /// Fetch from the CRM and store.
    Sync(SyncTicket),

    /// Store a set that was already fetched.
    Reconcile { tenant_id: String, fetch: LeadFetch },
}

impl SyncJob {
    pub fn tenant_id(&self) -> &str {
        match self {
            SyncJob::Sync(ticket) => &ticket.tenant_id,
            SyncJob::Reconcile { tenant_id, .. } => tenant_id,
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Consumes the job queue.
pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    job_rx: mpsc::Receiver<SyncJob>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for submitting jobs and stopping the worker.
#[derive(Clone)]
pub struct SyncWorkerHandle {
    job_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: mpsc::Sender<()>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncWorker {
    /// Creates a worker plus its job and shutdown senders, without starting it.
    pub fn new(
        engine: Arc<SyncEngine>,
        queue_size: usize,
    ) -> (Self, mpsc::Sender<SyncJob>, mpsc::Sender<()>) {
        let (job_tx, job_rx) = mpsc::channel(queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let worker = SyncWorker {
            engine,
            job_rx,
            shutdown_rx,
        };

        (worker, job_tx, shutdown_tx)
    }

    /// Creates the worker and spawns its loop.
    pub fn spawn(engine: Arc<SyncEngine>, queue_size: usize) -> SyncWorkerHandle {
        let (worker, job_tx, shutdown_tx) = Self::new(engine, queue_size);
        let join = tokio::spawn(worker.run());

        SyncWorkerHandle {
            job_tx,
            shutdown_tx,
            join: Arc::new(Mutex::new(Some(join))),
        }
    }

    /// Runs the worker loop until shutdown or until every sender is gone.
    pub async fn run(mut self) {
        info!("Sync worker starting");
        let mut running: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                job = self.job_rx.recv() => {
                    match job {
                        Some(job) => {
                            let engine = self.engine.clone();
                            running.spawn(execute(engine, job));
                        }
                        None => break,
                    }
                }

                // Reap finished jobs so the set does not grow unbounded.
                Some(result) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "Sync job panicked");
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!(in_flight = running.len(), "Sync worker shutting down");
                    break;
                }
            }
        }

        while let Some(result) = running.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Sync job panicked");
            }
        }

        info!("Sync worker stopped");
    }
}

async fn execute(engine: Arc<SyncEngine>, job: SyncJob) {
    let tenant_id = job.tenant_id().to_string();

    let result = match job {
        SyncJob::Sync(ticket) => {
            debug!(
                tenant_id = %tenant_id,
                job_id = %ticket.job_id,
                mode = %ticket.mode,
                "Running sync job"
            );
            engine.run_sync(&ticket.tenant_id, ticket.mode).await
        }
        SyncJob::Reconcile { tenant_id, fetch } => {
            debug!(tenant_id = %tenant_id, leads = fetch.leads.len(), "Running reconcile job");
            engine.reconcile(&tenant_id, fetch).await
        }
    };

    match result {
        Ok(report) => info!(
            tenant_id = %tenant_id,
            created = report.created,
            updated = report.updated,
            soft_deleted = report.soft_deleted,
            "Background sync finished"
        ),
        Err(e) => error!(tenant_id = %tenant_id, error = %e, "Background sync failed"),
    }
}

impl SyncWorkerHandle {
    /// Queues a job. Waits when the queue is full.
    pub async fn submit(&self, job: SyncJob) -> SyncResult<()> {
        self.job_tx
            .send(job)
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    /// Stops taking jobs and waits for running ones to finish.
    pub async fn shutdown(&self) -> SyncResult<()> {
        // The worker may already be gone; joining below covers both cases.
        let _ = self.shutdown_tx.send(()).await;

        if let Some(join) = self.join.lock().await.take() {
            join.await
                .map_err(|e| SyncError::Internal(format!("sync worker task failed: {e}")))?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.job_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{engine_with, fast_config};
    use crate::fake::FakeCrm;
    use funnel_core::Lead;

    #[tokio::test]
    async fn test_job_runs_in_background() {
        let fake =
            Arc::new(FakeCrm::new().with_leads(vec![Lead::new(1, 100, 101).with_updated_at(5)]));
        let engine = Arc::new(engine_with(fake, fast_config()).await);
        let handle = SyncWorker::spawn(engine.clone(), 8);

        handle
            .submit(SyncJob::Sync(SyncTicket::new("acme", SyncMode::Full)))
            .await
            .unwrap();
        handle.shutdown().await.unwrap();

        let status = engine.status("acme").await;
        assert_eq!(status.last_report.unwrap().created, 1);
        assert_eq!(engine.db().leads().count_all("acme").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failure_goes_to_status() {
        let engine = Arc::new(engine_with(Arc::new(FakeCrm::new()), fast_config()).await);
        let handle = SyncWorker::spawn(engine.clone(), 8);

        handle
            .submit(SyncJob::Sync(SyncTicket::new("globex", SyncMode::Full)))
            .await
            .unwrap();
        handle.shutdown().await.unwrap();

        let status = engine.status("globex").await;
        assert!(status.last_error.unwrap().contains("globex"));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let engine = Arc::new(engine_with(Arc::new(FakeCrm::new()), fast_config()).await);
        let handle = SyncWorker::spawn(engine, 8);

        handle.shutdown().await.unwrap();
        assert!(handle.is_closed());

        let err = handle
            .submit(SyncJob::Sync(SyncTicket::new("acme", SyncMode::Full)))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ShuttingDown));

        // Second shutdown is a no-op.
        handle.shutdown().await.unwrap();
    }
}
