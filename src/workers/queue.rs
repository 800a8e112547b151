//! Job queues
//!
//! Every [`QueueName`] has its own [`JobQueue`] with independent concurrency,
//! retry/backoff, retention and stall detection. [`QueueManager`] owns the queues,
//! implements [`JobScheduler`] for producers and runs one dispatcher per queue.
//! With a [`JobStore`] attached, every scheduled job is mirrored to the shared
//! cache and survives the process that accepted it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::jobs::{Job, JobError, JobHandler, JobOptions, JobPayload, JobScheduler, QueueName};
use super::store::{run_store_sweeper, spawn_store_writer, JobStore, StoreCommand, StoredJob};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Default priority for jobs on this queue; higher runs first
    pub priority: i32,
    pub keep_completed: usize,
    pub keep_failed: usize,
    /// A job active for longer than this is considered stalled and requeued
    pub lease: Duration,
    pub poll_interval: Duration,
}

impl QueueConfig {
    pub fn defaults_for(name: QueueName) -> Self {
        let base = Self {
            concurrency: 5,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            priority: 0,
            keep_completed: 100,
            keep_failed: 500,
            lease: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        };
        match name {
            QueueName::Payments => base,
            QueueName::Refunds => Self {
                concurrency: 3,
                max_attempts: 5,
                backoff_base: Duration::from_secs(5),
                ..base
            },
            // Out-of-order notifications wait here for the event they depend on
            QueueName::Webhooks => Self {
                concurrency: 10,
                max_attempts: 12,
                backoff_base: Duration::from_secs(1),
                priority: 10,
                lease: Duration::from_secs(60),
                ..base
            },
            QueueName::Notifications => Self {
                concurrency: 5,
                max_attempts: 3,
                backoff_base: Duration::from_secs(1),
                keep_completed: 50,
                ..base
            },
            QueueName::Reconciliation => Self {
                concurrency: 1,
                max_attempts: 2,
                backoff_base: Duration::from_secs(60),
                priority: -10,
                lease: Duration::from_secs(1800),
                keep_completed: 30,
                keep_failed: 30,
                ..base
            },
        }
    }

    /// Delay before attempt `attempt + 1`, doubling per attempt and capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

// ============================================================================
// Queue state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Cancelled,
}

/// Retained history entry for a finished job
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: &'static str,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: QueueName,
    pub paused: bool,
    pub concurrency: usize,
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub stalled: u64,
}

/// A job handed to a worker. Finishing with a stale lease is ignored.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: Job,
    lease_id: Uuid,
}

#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    id: Uuid,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct ActiveEntry {
    job: Job,
    lease_id: Uuid,
    lease_until: Instant,
    task: Option<AbortHandle>,
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<Uuid, Job>,
    ready: BinaryHeap<ReadyEntry>,
    delayed: BTreeMap<(Instant, u64), Uuid>,
    active: HashMap<Uuid, ActiveEntry>,
    completed: VecDeque<JobRecord>,
    failed: VecDeque<JobRecord>,
    completed_total: u64,
    failed_total: u64,
    cancelled_total: u64,
    stalled_total: u64,
    paused: bool,
    closed: bool,
    seq: u64,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn schedule(&mut self, job: Job, run_at: Option<Instant>) {
        let seq = self.next_seq();
        let id = job.id;
        let priority = job.priority;
        self.pending.insert(id, job);
        match run_at {
            Some(at) if at > Instant::now() => {
                self.delayed.insert((at, seq), id);
            }
            _ => self.ready.push(ReadyEntry { priority, seq, id }),
        }
    }

    fn promote_due(&mut self, now: Instant) {
        let due: Vec<(Instant, u64)> = self
            .delayed
            .range(..=(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in due {
            if let Some(id) = self.delayed.remove(&key) {
                if let Some(job) = self.pending.get(&id) {
                    self.ready.push(ReadyEntry {
                        priority: job.priority,
                        seq: key.1,
                        id,
                    });
                }
            }
        }
    }

    fn record(history: &mut VecDeque<JobRecord>, cap: usize, record: JobRecord) {
        history.push_back(record);
        while history.len() > cap {
            history.pop_front();
        }
    }
}

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

fn instant_at(at: DateTime<Utc>) -> Instant {
    let now = Instant::now();
    (at - Utc::now()).to_std().map_or(now, |wait| now + wait)
}

type StoreAck = oneshot::Sender<Result<(), String>>;

pub struct JobQueue {
    name: QueueName,
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    store: Option<mpsc::UnboundedSender<StoreCommand>>,
}

impl JobQueue {
    /// Queue held in this process only
    pub fn new(name: QueueName, config: QueueConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            store: None,
        }
    }

    pub(crate) fn persisted(
        name: QueueName,
        config: QueueConfig,
        store: mpsc::UnboundedSender<StoreCommand>,
    ) -> Self {
        Self {
            store: Some(store),
            ..Self::new(name, config)
        }
    }

    fn send_to_store(&self, command: StoreCommand) {
        if let Some(store) = &self.store {
            if store.send(command).is_err() {
                warn!(queue = %self.name, "job store writer has stopped, job not persisted");
            }
        }
    }

    fn persist(&self, job: &Job, delay: Duration, ack: Option<StoreAck>) {
        self.send_to_store(StoreCommand::Save {
            stored: StoredJob {
                job: job.clone(),
                run_at: wall_clock_after(delay),
            },
            ack,
        });
    }

    fn unpersist(&self, id: Uuid) {
        self.send_to_store(StoreCommand::Remove {
            queue: self.name,
            id,
        });
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, payload: JobPayload, options: JobOptions) -> Result<Uuid, JobError> {
        self.insert(payload, options, None)
    }

    /// Like [`add`](Self::add), resolving once the job is in the store
    pub async fn add_durable(
        &self,
        payload: JobPayload,
        options: JobOptions,
    ) -> Result<Uuid, JobError> {
        if self.store.is_none() {
            return self.add(payload, options);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        let id = self.insert(payload, options, Some(ack_tx))?;
        match ack_rx.await {
            Ok(Ok(())) => Ok(id),
            Ok(Err(e)) => Err(JobError::Store(e)),
            Err(_) => Err(JobError::Store("job store writer has stopped".to_string())),
        }
    }

    fn insert(
        &self,
        payload: JobPayload,
        options: JobOptions,
        ack: Option<StoreAck>,
    ) -> Result<Uuid, JobError> {
        let job = Job {
            id: Uuid::new_v4(),
            queue: self.name,
            payload,
            priority: options.priority.unwrap_or(self.config.priority),
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(self.config.max_attempts).max(1),
            created_at: Utc::now(),
            last_error: None,
        };
        let id = job.id;
        let kind = job.payload.kind();
        {
            let mut state = self.lock();
            if state.closed {
                return Err(JobError::QueueClosed(self.name.to_string()));
            }
            let run_at = (!options.delay.is_zero()).then(|| Instant::now() + options.delay);
            self.persist(&job, options.delay, ack);
            state.schedule(job, run_at);
        }
        debug!(queue = %self.name, job_id = %id, kind, "job enqueued");
        self.notify.notify_one();
        Ok(id)
    }

    /// Next runnable job, highest priority first. `None` while paused.
    pub fn take_next(&self) -> Option<Lease> {
        let mut state = self.lock();
        if state.paused {
            return None;
        }
        state.promote_due(Instant::now());
        while let Some(entry) = state.ready.pop() {
            let Some(mut job) = state.pending.remove(&entry.id) else {
                continue;
            };
            job.attempts += 1;
            let lease_id = Uuid::new_v4();
            state.active.insert(
                job.id,
                ActiveEntry {
                    job: job.clone(),
                    lease_id,
                    lease_until: Instant::now() + self.config.lease,
                    task: None,
                },
            );
            return Some(Lease { job, lease_id });
        }
        None
    }

    /// Tie the task running `lease` to it, so revoking the lease stops the task
    pub fn attach(&self, lease: &Lease, task: AbortHandle) {
        let mut state = self.lock();
        match state.active.get_mut(&lease.job.id) {
            Some(active) if active.lease_id == lease.lease_id => active.task = Some(task),
            _ => task.abort(),
        }
    }

    fn release(&self, state: &mut QueueState, lease: &Lease) -> Option<Job> {
        match state.active.get(&lease.job.id) {
            Some(active) if active.lease_id == lease.lease_id => {
                state.active.remove(&lease.job.id).map(|a| a.job)
            }
            _ => {
                debug!(
                    queue = %self.name,
                    job_id = %lease.job.id,
                    "ignoring result for a job whose lease was revoked"
                );
                None
            }
        }
    }

    pub fn complete(&self, lease: &Lease) {
        let mut state = self.lock();
        let Some(job) = self.release(&mut state, lease) else {
            return;
        };
        self.unpersist(job.id);
        state.completed_total += 1;
        let cap = self.config.keep_completed;
        QueueState::record(
            &mut state.completed,
            cap,
            JobRecord {
                id: job.id,
                kind: job.payload.kind(),
                status: JobStatus::Completed,
                attempts: job.attempts,
                error: None,
                finished_at: Utc::now(),
            },
        );
        drop(state);
        self.notify.notify_one();
    }

    /// Retry with backoff while attempts remain and the error is retryable
    pub fn fail(&self, lease: &Lease, error: JobError) {
        let mut state = self.lock();
        let Some(mut job) = self.release(&mut state, lease) else {
            return;
        };
        job.last_error = Some(error.to_string());
        self.retry_or_bury(&mut state, job, error.is_retryable());
        drop(state);
        self.notify.notify_one();
    }

    fn retry_or_bury(&self, state: &mut QueueState, job: Job, retryable: bool) {
        if retryable && job.attempts < job.max_attempts {
            let delay = self.config.backoff(job.attempts);
            warn!(
                queue = %self.name,
                job_id = %job.id,
                kind = job.payload.kind(),
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = job.last_error.as_deref().unwrap_or(""),
                "job failed, scheduling retry"
            );
            self.persist(&job, delay, None);
            state.schedule(job, Some(Instant::now() + delay));
            return;
        }

        self.unpersist(job.id);
        error!(
            queue = %self.name,
            job_id = %job.id,
            kind = job.payload.kind(),
            attempts = job.attempts,
            error = job.last_error.as_deref().unwrap_or(""),
            "job failed permanently"
        );
        state.failed_total += 1;
        let cap = self.config.keep_failed;
        QueueState::record(
            &mut state.failed,
            cap,
            JobRecord {
                id: job.id,
                kind: job.payload.kind(),
                status: JobStatus::Failed,
                attempts: job.attempts,
                error: job.last_error.clone(),
                finished_at: Utc::now(),
            },
        );
    }

    /// Requeue a job whose worker died before reporting a result
    pub fn abandon(&self, lease: &Lease, reason: &str) {
        let mut state = self.lock();
        let Some(mut job) = self.release(&mut state, lease) else {
            return;
        };
        state.stalled_total += 1;
        job.last_error = Some(format!("stalled: {}", reason));
        self.retry_or_bury(&mut state, job, true);
        drop(state);
        self.notify.notify_one();
    }

    /// Requeue active jobs whose lease has expired. Returns how many were recovered.
    pub fn recover_stalled(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let expired: Vec<Uuid> = state
            .active
            .iter()
            .filter(|(_, a)| a.lease_until <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(active) = state.active.remove(id) {
                if let Some(task) = &active.task {
                    task.abort();
                }
                let mut job = active.job;
                warn!(queue = %self.name, job_id = %job.id, "job lease expired, requeueing");
                state.stalled_total += 1;
                job.last_error = Some("stalled: lease expired".to_string());
                self.retry_or_bury(&mut state, job, true);
            }
        }
        expired.len()
    }

    pub fn pause(&self) {
        self.lock().paused = true;
        info!(queue = %self.name, "queue paused");
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        info!(queue = %self.name, "queue resumed");
        self.notify.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Remove a waiting or delayed job. Active jobs run to completion.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut state = self.lock();
        let Some(job) = state.pending.remove(&id) else {
            return false;
        };
        state.delayed.retain(|_, v| *v != id);
        self.unpersist(id);
        state.cancelled_total += 1;
        let cap = self.config.keep_failed;
        QueueState::record(
            &mut state.failed,
            cap,
            JobRecord {
                id,
                kind: job.payload.kind(),
                status: JobStatus::Cancelled,
                attempts: job.attempts,
                error: None,
                finished_at: Utc::now(),
            },
        );
        info!(queue = %self.name, job_id = %id, "job cancelled");
        true
    }

    /// Ids of every waiting, delayed or active job in this process
    pub fn held_ids(&self) -> HashSet<Uuid> {
        let state = self.lock();
        state
            .pending
            .keys()
            .chain(state.active.keys())
            .copied()
            .collect()
    }

    /// Take over a job persisted by another process
    pub fn restore(&self, stored: StoredJob) {
        let id = stored.job.id;
        {
            let mut state = self.lock();
            if state.closed || state.pending.contains_key(&id) || state.active.contains_key(&id) {
                return;
            }
            state.schedule(stored.job, Some(instant_at(stored.run_at)));
        }
        info!(queue = %self.name, job_id = %id, run_at = %stored.run_at, "adopted persisted job");
        self.notify.notify_one();
    }

    /// Drop a job another process now owns, stopping it if it is running here
    pub fn revoke(&self, id: Uuid) {
        let mut state = self.lock();
        if state.pending.remove(&id).is_some() {
            state.delayed.retain(|_, v| *v != id);
        }
        if let Some(active) = state.active.remove(&id) {
            if let Some(task) = active.task {
                task.abort();
            }
        }
    }

    pub fn status_of(&self, id: Uuid) -> Option<JobStatus> {
        let state = self.lock();
        if state.active.contains_key(&id) {
            return Some(JobStatus::Active);
        }
        if state.pending.contains_key(&id) {
            let delayed = state.delayed.values().any(|v| *v == id);
            return Some(if delayed {
                JobStatus::Delayed
            } else {
                JobStatus::Waiting
            });
        }
        state
            .completed
            .iter()
            .chain(state.failed.iter())
            .find(|r| r.id == id)
            .map(|r| r.status)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            name: self.name,
            paused: state.paused,
            concurrency: self.config.concurrency,
            waiting: state.pending.len() - state.delayed.len(),
            delayed: state.delayed.len(),
            active: state.active.len(),
            completed: state.completed_total,
            failed: state.failed_total,
            cancelled: state.cancelled_total,
            stalled: state.stalled_total,
        }
    }

    pub fn recent_failures(&self) -> Vec<JobRecord> {
        self.lock().failed.iter().rev().cloned().collect()
    }

    /// Time until the earliest delayed job becomes due
    fn next_due_in(&self) -> Option<Duration> {
        let state = self.lock();
        state
            .delayed
            .keys()
            .next()
            .map(|(at, _)| at.saturating_duration_since(Instant::now()))
    }
}

// ============================================================================
// Manager and dispatchers
// ============================================================================

pub struct QueueManager {
    queues: BTreeMap<QueueName, Arc<JobQueue>>,
    drain_timeout: Duration,
    store: Option<(Arc<JobStore>, mpsc::UnboundedSender<StoreCommand>)>,
}

impl QueueManager {
    /// Queues held in this process only
    pub fn new(configs: BTreeMap<QueueName, QueueConfig>) -> Self {
        Self::build(configs, None)
    }

    /// Queues mirrored to `store`. Must be called inside a Tokio runtime.
    pub fn with_store(configs: BTreeMap<QueueName, QueueConfig>, store: JobStore) -> Self {
        let store = Arc::new(store);
        let writer = spawn_store_writer(store.clone());
        Self::build(configs, Some((store, writer)))
    }

    fn build(
        mut configs: BTreeMap<QueueName, QueueConfig>,
        store: Option<(Arc<JobStore>, mpsc::UnboundedSender<StoreCommand>)>,
    ) -> Self {
        let queues = QueueName::ALL
            .into_iter()
            .map(|name| {
                let config = configs
                    .remove(&name)
                    .unwrap_or_else(|| QueueConfig::defaults_for(name));
                let queue = match &store {
                    Some((_, writer)) => JobQueue::persisted(name, config, writer.clone()),
                    None => JobQueue::new(name, config),
                };
                (name, Arc::new(queue))
            })
            .collect();
        Self {
            queues,
            drain_timeout: Duration::from_secs(30),
            store,
        }
    }

    pub fn queue(&self, name: QueueName) -> Arc<JobQueue> {
        // Every QueueName is inserted in `new`
        match self.queues.get(&name) {
            Some(queue) => queue.clone(),
            None => Arc::new(JobQueue::new(name, QueueConfig::defaults_for(name))),
        }
    }

    pub fn stats(&self) -> Vec<QueueStats> {
        self.queues.values().map(|q| q.stats()).collect()
    }

    /// Cancel a queued job on whichever queue holds it
    pub fn cancel(&self, id: Uuid) -> bool {
        self.queues.values().any(|q| q.cancel(id))
    }

    /// Spawn one dispatcher per queue that has a handler, plus the store
    /// sweeper when queues are persisted
    pub fn start(
        &self,
        handlers: HashMap<QueueName, Arc<dyn JobHandler>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let sweeper = self.store.as_ref().map(|(store, _)| {
            tokio::spawn(run_store_sweeper(
                store.clone(),
                self.queues.values().cloned().collect(),
                shutdown_rx.clone(),
            ))
        });
        handlers
            .into_iter()
            .filter_map(|(name, handler)| {
                let queue = self.queues.get(&name)?.clone();
                let shutdown_rx = shutdown_rx.clone();
                let drain_timeout = self.drain_timeout;
                Some(tokio::spawn(run_dispatcher(
                    queue,
                    handler,
                    shutdown_rx,
                    drain_timeout,
                )))
            })
            .chain(sweeper)
            .collect()
    }

    pub fn close_all(&self) {
        for queue in self.queues.values() {
            queue.close();
        }
    }

    /// Hand every job still held here back to the store for another instance to
    /// adopt, and wait until all pending store writes have landed
    pub async fn release_held(&self) {
        let Some((_, writer)) = &self.store else {
            return;
        };
        let mut released = 0;
        for (name, queue) in &self.queues {
            for id in queue.held_ids() {
                let _ = writer.send(StoreCommand::Release { queue: *name, id });
                released += 1;
            }
        }
        let (done_tx, done_rx) = oneshot::channel();
        if writer.send(StoreCommand::Flush(done_tx)).is_err() || done_rx.await.is_err() {
            warn!("job store writer stopped before held jobs were released");
            return;
        }
        info!(released, "held jobs released to the store");
    }
}

#[async_trait]
impl JobScheduler for QueueManager {
    fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: JobOptions,
    ) -> Result<Uuid, JobError> {
        self.queue(queue).add(payload, options)
    }

    async fn enqueue_durable(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: JobOptions,
    ) -> Result<Uuid, JobError> {
        self.queue(queue).add_durable(payload, options).await
    }
}

async fn run_dispatcher(
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
    drain_timeout: Duration,
) {
    let concurrency = queue.config().concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    info!(queue = %queue.name(), concurrency, "queue dispatcher started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        queue.recover_stalled();

        loop {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                break;
            };
            let Some(lease) = queue.take_next() else {
                break;
            };

            let queue = queue.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let job = lease.job.clone();
                let task = tokio::spawn(async move { handler.handle(&job).await });
                queue.attach(&lease, task.abort_handle());
                match task.await {
                    Ok(Ok(())) => queue.complete(&lease),
                    Ok(Err(e)) => queue.fail(&lease, e),
                    Err(join_error) if join_error.is_cancelled() => {
                        debug!(queue = %queue.name(), job_id = %lease.job.id, "job task aborted");
                    }
                    Err(join_error) => queue.abandon(&lease, &join_error.to_string()),
                }
            });
        }

        let poll = queue.config().poll_interval;
        let wait = queue.next_due_in().map_or(poll, |d| d.min(poll));

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!(queue = %queue.name(), "queue dispatcher stopping");
                    break;
                }
            }
            _ = queue.notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    if tokio::time::timeout(
        drain_timeout,
        semaphore.acquire_many(concurrency as u32),
    )
    .await
    .is_err()
    {
        warn!(queue = %queue.name(), "timed out waiting for active jobs to finish");
    }
}
