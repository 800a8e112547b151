//! Durable copy of the job queues in the shared cache
//!
//! Every job a [`JobQueue`](super::queue::JobQueue) holds is mirrored as a JSON
//! body plus an entry in its queue's sorted-set index, scored by due time. The
//! instance holding a job keeps an owner lease on it. A job whose lease lapses,
//! because its holder died or released it on shutdown, is adopted by whichever
//! instance sweeps next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::jobs::{Job, QueueName};
use super::queue::JobQueue;
use crate::cache::keys::jobs::{IndexKey, JobKey};
use crate::cache::{CacheResult, SharedCache};

#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    /// Lifetime of an owner lease that is not renewed
    pub owner_ttl: Duration,
    /// How often held leases are renewed and orphaned jobs adopted
    pub sweep_interval: Duration,
    /// Upper bound on how long a job body is kept
    pub retention: Duration,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            owner_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            retention: Duration::from_secs(7 * 86_400),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredJob {
    pub job: Job,
    pub run_at: DateTime<Utc>,
}

pub struct JobStore {
    cache: Arc<dyn SharedCache>,
    instance_id: String,
    config: JobStoreConfig,
}

impl JobStore {
    pub fn new(cache: Arc<dyn SharedCache>, config: JobStoreConfig) -> Self {
        Self {
            cache,
            instance_id: Uuid::new_v4().to_string(),
            config,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &JobStoreConfig {
        &self.config
    }

    /// Write the job body, index it by due time and take its owner lease
    pub async fn save(&self, stored: &StoredJob) -> CacheResult<()> {
        let key = JobKey::new(stored.job.queue.as_str(), stored.job.id);
        let body = serde_json::to_string(stored)?;
        self.cache.set(&key.to_string(), &body, self.config.retention).await?;
        self.cache
            .sorted_add(
                &IndexKey::new(stored.job.queue.as_str()).to_string(),
                &stored.job.id.to_string(),
                stored.run_at.timestamp_millis(),
            )
            .await?;
        self.cache
            .set(&key.owner(), &self.instance_id, self.config.owner_ttl)
            .await
    }

    pub async fn remove(&self, queue: QueueName, id: Uuid) -> CacheResult<()> {
        let key = JobKey::new(queue.as_str(), id);
        self.cache
            .sorted_remove(&IndexKey::new(queue.as_str()).to_string(), &id.to_string())
            .await?;
        self.cache.delete(&key.to_string()).await?;
        self.cache.delete(&key.owner()).await?;
        Ok(())
    }

    /// Give up the owner lease so another instance can adopt the job at once
    pub async fn release(&self, queue: QueueName, id: Uuid) -> CacheResult<()> {
        let owner = JobKey::new(queue.as_str(), id).owner();
        if self.cache.get(&owner).await?.as_deref() == Some(self.instance_id.as_str()) {
            self.cache.delete(&owner).await?;
        }
        Ok(())
    }

    /// Extend the lease on a held job. Returns false if another instance owns it now.
    pub async fn renew(&self, queue: QueueName, id: Uuid) -> CacheResult<bool> {
        let owner = JobKey::new(queue.as_str(), id).owner();
        let ttl = self.config.owner_ttl;
        if self
            .cache
            .compare_and_swap(&owner, &self.instance_id, &self.instance_id, ttl)
            .await?
        {
            return Ok(true);
        }
        self.cache.claim(&owner, &self.instance_id, ttl).await
    }

    /// Claim every persisted job of `queue` that nobody holds
    pub async fn adopt(&self, queue: QueueName, held: &HashSet<Uuid>) -> CacheResult<Vec<StoredJob>> {
        let index = IndexKey::new(queue.as_str()).to_string();
        let mut adopted = Vec::new();

        for member in self.cache.sorted_members(&index).await? {
            let Ok(id) = member.parse::<Uuid>() else {
                warn!(queue = %queue, member = %member, "dropping malformed job index entry");
                self.cache.sorted_remove(&index, &member).await?;
                continue;
            };
            if held.contains(&id) {
                continue;
            }
            let key = JobKey::new(queue.as_str(), id);
            if !self
                .cache
                .claim(&key.owner(), &self.instance_id, self.config.owner_ttl)
                .await?
            {
                continue;
            }

            let Some(body) = self.cache.get(&key.to_string()).await? else {
                debug!(queue = %queue, job_id = %id, "discarding index entry without a job body");
                self.remove(queue, id).await?;
                continue;
            };
            match serde_json::from_str::<StoredJob>(&body) {
                Ok(stored) => adopted.push(stored),
                Err(e) => {
                    warn!(queue = %queue, job_id = %id, error = %e, "discarding unreadable persisted job");
                    self.remove(queue, id).await?;
                }
            }
        }
        Ok(adopted)
    }
}

/// Writes a queue performs, applied in order by [`run_store_writer`]
pub(crate) enum StoreCommand {
    Save {
        stored: StoredJob,
        ack: Option<oneshot::Sender<Result<(), String>>>,
    },
    Remove {
        queue: QueueName,
        id: Uuid,
    },
    Release {
        queue: QueueName,
        id: Uuid,
    },
    Flush(oneshot::Sender<()>),
}

pub(crate) fn spawn_store_writer(store: Arc<JobStore>) -> mpsc::UnboundedSender<StoreCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_store_writer(store, rx));
    tx
}

async fn run_store_writer(store: Arc<JobStore>, mut rx: mpsc::UnboundedReceiver<StoreCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            StoreCommand::Save { stored, ack } => {
                let result = store.save(&stored).await.map_err(|e| e.to_string());
                if let Err(e) = &result {
                    warn!(
                        queue = %stored.job.queue,
                        job_id = %stored.job.id,
                        kind = stored.job.payload.kind(),
                        error = %e,
                        "failed to persist job"
                    );
                }
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            }
            StoreCommand::Remove { queue, id } => {
                if let Err(e) = store.remove(queue, id).await {
                    warn!(queue = %queue, job_id = %id, error = %e, "failed to remove persisted job");
                }
            }
            StoreCommand::Release { queue, id } => {
                if let Err(e) = store.release(queue, id).await {
                    warn!(queue = %queue, job_id = %id, error = %e, "failed to release job lease");
                }
            }
            StoreCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("job store writer stopped");
}

/// Renew leases on held jobs and adopt orphaned ones until shutdown.
/// The first sweep runs immediately so jobs left by a previous process resume.
pub(crate) async fn run_store_sweeper(
    store: Arc<JobStore>,
    queues: Vec<Arc<JobQueue>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(
        instance_id = store.instance_id(),
        interval_secs = store.config().sweep_interval.as_secs(),
        "job store sweeper started"
    );
    loop {
        for queue in &queues {
            sweep(&store, queue).await;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(store.config().sweep_interval) => {}
        }
    }
    info!("job store sweeper stopped");
}

async fn sweep(store: &JobStore, queue: &JobQueue) {
    let name = queue.name();
    let held = queue.held_ids();

    for id in &held {
        match store.renew(name, *id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(queue = %name, job_id = %id, "job lease taken over by another instance");
                queue.revoke(*id);
            }
            Err(e) => {
                warn!(queue = %name, error = %e, "job lease renewal failed");
                return;
            }
        }
    }

    match store.adopt(name, &held).await {
        Ok(adopted) => {
            for stored in adopted {
                queue.restore(stored);
            }
        }
        Err(e) => warn!(queue = %name, error = %e, "failed to scan persisted jobs"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::workers::jobs::JobPayload;

    fn stored(queue: QueueName, run_at: DateTime<Utc>) -> StoredJob {
        StoredJob {
            job: Job {
                id: Uuid::new_v4(),
                queue,
                payload: JobPayload::Reconcile,
                priority: 0,
                attempts: 1,
                max_attempts: 3,
                created_at: Utc::now(),
                last_error: Some("not yet".to_string()),
            },
            run_at,
        }
    }

    fn store(cache: &InMemoryCache) -> JobStore {
        JobStore::new(Arc::new(cache.clone()), JobStoreConfig::default())
    }

    #[tokio::test]
    async fn released_jobs_are_adopted_by_another_instance() {
        let cache = InMemoryCache::new();
        let first = store(&cache);
        let second = store(&cache);
        let job = stored(QueueName::Webhooks, Utc::now());
        first.save(&job).await.unwrap();

        assert!(second
            .adopt(QueueName::Webhooks, &HashSet::new())
            .await
            .unwrap()
            .is_empty());

        first.release(QueueName::Webhooks, job.job.id).await.unwrap();
        let adopted = second.adopt(QueueName::Webhooks, &HashSet::new()).await.unwrap();
        assert_eq!(adopted, vec![job.clone()]);

        // The adopter now holds the lease
        assert!(!first.renew(QueueName::Webhooks, job.job.id).await.unwrap());
        assert!(second.renew(QueueName::Webhooks, job.job.id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_lease_makes_a_job_adoptable() {
        let cache = InMemoryCache::new();
        let first = store(&cache);
        let second = store(&cache);
        let job = stored(QueueName::Payments, Utc::now());
        first.save(&job).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let adopted = second.adopt(QueueName::Payments, &HashSet::new()).await.unwrap();
        assert_eq!(adopted.len(), 1);
    }

    #[tokio::test]
    async fn removed_jobs_are_gone_and_held_jobs_are_skipped() {
        let cache = InMemoryCache::new();
        let store = store(&cache);
        let kept = stored(QueueName::Refunds, Utc::now());
        let done = stored(QueueName::Refunds, Utc::now());
        store.save(&kept).await.unwrap();
        store.save(&done).await.unwrap();
        store.remove(QueueName::Refunds, done.job.id).await.unwrap();
        store.release(QueueName::Refunds, kept.job.id).await.unwrap();

        let held = HashSet::from([kept.job.id]);
        assert!(store.adopt(QueueName::Refunds, &held).await.unwrap().is_empty());
        let adopted = store.adopt(QueueName::Refunds, &HashSet::new()).await.unwrap();
        assert_eq!(adopted.len(), 1);
        assert_eq!(adopted[0].job.id, kept.job.id);
    }

    #[tokio::test]
    async fn index_entry_without_body_is_cleaned_up() {
        let cache = InMemoryCache::new();
        let store = store(&cache);
        let index = IndexKey::new("payments").to_string();
        cache
            .sorted_add(&index, &Uuid::new_v4().to_string(), 0)
            .await
            .unwrap();
        cache.sorted_add(&index, "garbage", 1).await.unwrap();

        assert!(store
            .adopt(QueueName::Payments, &HashSet::new())
            .await
            .unwrap()
            .is_empty());
        assert!(cache.sorted_members(&index).await.unwrap().is_empty());
    }
}
