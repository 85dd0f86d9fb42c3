//! Background batch processing.
//!
//! ```text
//! scanner ──submit──▶ [bounded queue] ──▶ coordinator ──▶ shard 0..N ──▶ coordinator ──▶ notifier
//!                                          (decode)       (merge)        (match)
//! ```
//!
//! `submit` never blocks: a full queue is reported as
//! [`RadarError::QueueFull`]. The coordinator runs one batch at a time to
//! completion, so batches for an address are merged in arrival order. Within
//! a batch, observations are partitioned by address hash and each shard
//! merges its part on its own thread.

use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::RadarError;
use crate::logging::structured::LogContext;
use crate::pipeline::context::BatchContext;
use crate::pipeline::ingestion::{BatchFailure, BatchResult, Pipeline};
use crate::pipeline::locks::shard_for;
use crate::pipeline::merge::{MergeFailure, MergeOutcome};
use crate::pipeline::observation::{DeviceObservation, RawScan};

/// Receives the outcome of every submitted batch. Called on the coordinator
/// thread; implementations should hand work off rather than block.
pub trait BatchNotifier: Send + Sync {
    fn batch_completed(&self, result: &BatchResult);

    fn batch_failed(&self, failure: BatchFailure) {
        crate::log_error!(
            LogContext::new(&failure.batch_id),
            "BATCH_FAILED",
            retryable = failure.is_retryable(),
            pending_scans = failure.scans.len(),
            unmatched = failure.unmatched.len(),
            error = failure.error.to_string()
        );
    }
}

#[derive(Debug)]
pub enum WorkerEvent {
    Completed(BatchResult),
    Failed(BatchFailure),
}

/// Forwards outcomes into an mpsc channel.
pub struct ChannelNotifier {
    tx: Mutex<Sender<WorkerEvent>>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, Receiver<WorkerEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }
}

impl BatchNotifier for ChannelNotifier {
    fn batch_completed(&self, result: &BatchResult) {
        let _ = self.tx.lock().send(WorkerEvent::Completed(result.clone()));
    }

    fn batch_failed(&self, failure: BatchFailure) {
        let _ = self.tx.lock().send(WorkerEvent::Failed(failure));
    }
}

struct Job {
    ctx: BatchContext,
    scans: Vec<RawScan>,
}

type ShardReply = (usize, Result<MergeOutcome, MergeFailure>);

struct ShardJob {
    ctx: BatchContext,
    shard: usize,
    observations: Vec<DeviceObservation>,
    reply: Sender<ShardReply>,
}

struct Shard {
    tx: SyncSender<ShardJob>,
    handle: JoinHandle<()>,
}

pub struct PipelineWorker {
    queue: Option<SyncSender<Job>>,
    coordinator: Option<JoinHandle<()>>,
    capacity: usize,
}

impl PipelineWorker {
    /// Spawn the coordinator and shard threads.
    pub fn start(
        pipeline: Arc<Pipeline>,
        notifier: Arc<dyn BatchNotifier>,
    ) -> Result<Self, RadarError> {
        let config = pipeline.config().clone();
        config.validate()?;

        let mut shards = Vec::with_capacity(config.shard_count);
        for idx in 0..config.shard_count {
            let (tx, rx) = mpsc::sync_channel::<ShardJob>(1);
            let shard_pipeline = Arc::clone(&pipeline);
            let handle = spawn_named(format!("radar-shard-{}", idx), move || {
                shard_thread(rx, shard_pipeline)
            })?;
            shards.push(Shard { tx, handle });
        }

        let (queue_tx, queue_rx) = mpsc::sync_channel::<Job>(config.queue_capacity);
        let coordinator = spawn_named("radar-coordinator".to_string(), move || {
            coordinator_thread(queue_rx, shards, pipeline, notifier)
        })?;

        log::info!(
            "WORKER_STARTED shards={} queue_capacity={}",
            config.shard_count,
            config.queue_capacity
        );

        Ok(Self {
            queue: Some(queue_tx),
            coordinator: Some(coordinator),
            capacity: config.queue_capacity,
        })
    }

    /// Queue a batch; returns its batch id.
    pub fn submit(&self, scans: Vec<RawScan>) -> Result<String, RadarError> {
        let ctx = BatchContext::new();
        let batch_id = ctx.batch_id.clone();
        self.submit_with(ctx, scans)?;
        Ok(batch_id)
    }

    /// Queue a batch under a caller-built context.
    pub fn submit_with(&self, ctx: BatchContext, scans: Vec<RawScan>) -> Result<(), RadarError> {
        let queue = self.queue.as_ref().ok_or(RadarError::WorkerStopped)?;
        let log_ctx = ctx.log_context();
        let count = scans.len();

        match queue.try_send(Job { ctx, scans }) {
            Ok(()) => {
                log::debug!("{} BATCH_QUEUED scans={}", log_ctx, count);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                crate::log_warn!(log_ctx, "QUEUE_FULL", capacity = self.capacity);
                Err(RadarError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(RadarError::WorkerStopped),
        }
    }

    /// Stop accepting batches, finish queued ones and join every thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Closing the queue ends the coordinator loop after it drains
        self.queue.take();
        if let Some(handle) = self.coordinator.take() {
            if handle.join().is_err() {
                log::error!("WORKER_PANICKED thread=radar-coordinator");
            }
            log::info!("WORKER_STOPPED");
        }
    }
}

impl Drop for PipelineWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_named<F>(name: String, f: F) -> Result<JoinHandle<()>, RadarError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|e| RadarError::Spawn {
            thread: name,
            reason: e.to_string(),
        })
}

fn shard_thread(rx: Receiver<ShardJob>, pipeline: Arc<Pipeline>) {
    while let Ok(job) = rx.recv() {
        let outcome = pipeline.merge_engine().merge(&job.ctx, job.observations);
        let _ = job.reply.send((job.shard, outcome));
    }
}

fn coordinator_thread(
    rx: Receiver<Job>,
    shards: Vec<Shard>,
    pipeline: Arc<Pipeline>,
    notifier: Arc<dyn BatchNotifier>,
) {
    while let Ok(job) = rx.recv() {
        match run_job(&job, &shards, &pipeline) {
            Ok(result) => notifier.batch_completed(&result),
            Err(failure) => notifier.batch_failed(failure),
        }
    }

    for (idx, shard) in shards.into_iter().enumerate() {
        drop(shard.tx);
        if shard.handle.join().is_err() {
            log::error!("WORKER_PANICKED thread=radar-shard-{}", idx);
        }
    }
}

fn run_job(job: &Job, shards: &[Shard], pipeline: &Pipeline) -> Result<BatchResult, BatchFailure> {
    let ctx = &job.ctx;
    let received = job.scans.len();
    log::info!("{} BATCH_RECEIVED scans={}", ctx.log_context(), received);

    let observations = pipeline.decode(ctx, job.scans.clone());
    let issue_count = observations.iter().map(|o| o.issues.len()).sum();

    // Per shard: batch positions and the observations at them
    let mut positions: Vec<Vec<usize>> = vec![Vec::new(); shards.len()];
    let mut parts: Vec<Vec<DeviceObservation>> = (0..shards.len()).map(|_| Vec::new()).collect();
    for (pos, observation) in observations.into_iter().enumerate() {
        let shard = shard_for(&observation.address, shards.len());
        positions[shard].push(pos);
        parts[shard].push(observation);
    }

    let (reply_tx, reply_rx) = mpsc::channel();
    let mut awaiting = vec![false; shards.len()];
    let mut pending: Vec<usize> = Vec::new();
    let mut first_error = None;
    for (idx, (shard, part)) in shards.iter().zip(parts).enumerate() {
        if part.is_empty() {
            continue;
        }
        let shard_job = ShardJob {
            ctx: ctx.clone(),
            shard: idx,
            observations: part,
            reply: reply_tx.clone(),
        };
        if shard.tx.send(shard_job).is_ok() {
            awaiting[idx] = true;
        } else {
            first_error.get_or_insert(RadarError::WorkerStopped);
            pending.extend(&positions[idx]);
        }
    }
    drop(reply_tx);

    // Wait for every shard before reporting, so a failed batch is never
    // reported while another shard is still writing it.
    let mut merged = MergeOutcome::default();
    for (shard, reply) in reply_rx.iter() {
        awaiting[shard] = false;
        let outcome = match reply {
            Ok(outcome) => outcome,
            Err(failure) => {
                first_error.get_or_insert(failure.error);
                pending.extend(failure.pending.iter().map(|&i| positions[shard][i]));
                failure.partial
            }
        };
        merged.created += outcome.created;
        merged.updated += outcome.updated;
        merged.contacts_upserted += outcome.contacts_upserted;
        merged.records.extend(outcome.records);
    }

    // A shard that hung up without replying is treated as having applied
    // nothing
    for (shard, lost) in awaiting.iter().enumerate() {
        if *lost {
            first_error.get_or_insert(RadarError::WorkerStopped);
            pending.extend(&positions[shard]);
        }
    }

    if let Some(error) = first_error {
        pending.sort_unstable();
        return Err(BatchFailure::new(ctx, error, &job.scans, &pending, merged.records));
    }
    pipeline.complete(ctx, received, issue_count, merged)
}
