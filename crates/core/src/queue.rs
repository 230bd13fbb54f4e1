//! Channel-backed worker pool that runs indexing detached from the caller.
//!
//! Callers `submit` a document id and return at once; a dispatcher task feeds
//! jobs to at most `concurrency` pipeline runs. Every run is its own error
//! boundary: a panic marks the document `Failed` and the pool keeps going.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::ingest::{IndexOutcome, IndexingPipeline};
use crate::{DocumentStatus, IngestError, RequestContext};

struct Job {
    ctx: RequestContext,
    document_id: Uuid,
}

/// Tally of finished runs, returned on shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub indexed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub missing: usize,
}

impl QueueReport {
    fn record(&mut self, outcome: &IndexOutcome) {
        match outcome {
            IndexOutcome::Indexed { .. } => self.indexed += 1,
            IndexOutcome::Failed { .. } => self.failed += 1,
            IndexOutcome::Skipped { .. } => self.skipped += 1,
            IndexOutcome::Missing => self.missing += 1,
        }
    }
}

pub struct IndexingQueue {
    sender: mpsc::Sender<Job>,
    dispatcher: JoinHandle<QueueReport>,
}

impl IndexingQueue {
    /// Spawns the dispatcher. Must be called inside a Tokio runtime.
    pub fn start(pipeline: Arc<IndexingPipeline>, concurrency: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let dispatcher = tokio::spawn(dispatch(pipeline, receiver, concurrency.max(1)));
        Self { sender, dispatcher }
    }

    /// Schedules `document_id` for indexing. Waits only while the queue is full.
    pub async fn submit(&self, ctx: &RequestContext, document_id: Uuid) -> Result<(), IngestError> {
        self.sender
            .send(Job {
                ctx: ctx.detached(),
                document_id,
            })
            .await
            .map_err(|_| IngestError::QueueClosed(document_id))?;
        tracing::debug!(trace_id = %ctx.trace_id, %document_id, "indexing scheduled");
        Ok(())
    }

    /// Stops accepting work and waits for every scheduled run to finish.
    pub async fn shutdown(self) -> Result<QueueReport, IngestError> {
        drop(self.sender);
        self.dispatcher
            .await
            .map_err(|error| IngestError::Task(error.to_string()))
    }
}

async fn dispatch(
    pipeline: Arc<IndexingPipeline>,
    mut receiver: mpsc::Receiver<Job>,
    concurrency: usize,
) -> QueueReport {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut workers = JoinSet::new();
    let mut report = QueueReport::default();

    loop {
        tokio::select! {
            job = receiver.recv() => {
                let Some(job) = job else { break };
                let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
                let pipeline = pipeline.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    run_guarded(&pipeline, job).await
                });
            }
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                record(&mut report, joined);
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        record(&mut report, joined);
    }
    tracing::info!(
        indexed = report.indexed,
        failed = report.failed,
        skipped = report.skipped,
        missing = report.missing,
        "indexing queue drained"
    );
    report
}

fn record(report: &mut QueueReport, joined: Result<IndexOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => report.record(&outcome),
        Err(error) => {
            tracing::error!(error = %error, "indexing worker aborted");
            report.failed += 1;
        }
    }
}

async fn run_guarded(pipeline: &IndexingPipeline, job: Job) -> IndexOutcome {
    let run = AssertUnwindSafe(pipeline.index(&job.ctx, job.document_id))
        .catch_unwind()
        .await;

    match run {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::error!(
                trace_id = %job.ctx.trace_id,
                document_id = %job.document_id,
                "indexing run panicked"
            );
            if let Err(error) = pipeline
                .documents()
                .transition(job.document_id, DocumentStatus::Processing, DocumentStatus::Failed)
                .await
            {
                tracing::error!(error = %error, document_id = %job.document_id, "could not mark document failed");
            }
            IndexOutcome::Failed {
                code: "INTERNAL_ERROR",
                reason: "indexing run panicked".to_string(),
            }
        }
    }
}
