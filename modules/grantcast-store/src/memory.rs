//! In-memory KvStore and JobQueue for tests. Same contract as the
//! Postgres adapters: TTL expiry, atomic set-if-absent, claim locking,
//! dead-lettering.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::kv::KvStore;
use crate::queue::{JobQueue, QueueName, QueuedJob};

// ---------------------------------------------------------------------------
// MemoryKv
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(entry: &(String, Option<Instant>)) -> bool {
        entry.1.is_none_or(|deadline| deadline > Instant::now())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(key)
            .filter(|e| Self::live(e))
            .map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: Option<i64>) -> Result<()> {
        let deadline = ttl_ms.map(|ms| Instant::now() + Duration::from_millis(ms as u64));
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_ms: i64) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(Self::live) {
            return Ok(false);
        }
        let deadline = Instant::now() + Duration::from_millis(ttl_ms as u64);
        entries.insert(key.to_string(), (value.to_string(), Some(deadline)));
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

struct JobRecord {
    id: Uuid,
    queue: QueueName,
    payload: serde_json::Value,
    attempts: i32,
    enqueued_at: chrono::DateTime<Utc>,
    locked_until: Option<Instant>,
    completed: bool,
    dead: bool,
    last_error: Option<String>,
    progress: i16,
}

#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<Vec<JobRecord>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs enqueued on a queue that are not yet completed or dead.
    pub fn pending(&self, queue: QueueName) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.queue == queue && !j.completed && !j.dead)
            .count()
    }

    pub fn payloads(&self, queue: QueueName) -> Vec<serde_json::Value> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.queue == queue)
            .map(|j| j.payload.clone())
            .collect()
    }

    pub fn progress_of(&self, job_id: Uuid) -> Option<i16> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == job_id)
            .map(|j| j.progress)
    }

    pub fn is_dead(&self, job_id: Uuid) -> bool {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .any(|j| j.id == job_id && j.dead)
    }

    pub fn last_error_of(&self, job_id: Uuid) -> Option<String> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == job_id)
            .and_then(|j| j.last_error.clone())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, queue: QueueName, payload: serde_json::Value) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.jobs.lock().unwrap().push(JobRecord {
            id,
            queue,
            payload,
            attempts: 0,
            enqueued_at: Utc::now(),
            locked_until: None,
            completed: false,
            dead: false,
            last_error: None,
            progress: 0,
        });
        Ok(id)
    }

    async fn claim(&self, queue: QueueName, lock_ms: i64) -> Result<Option<QueuedJob>> {
        let now = Instant::now();
        let mut jobs = self.jobs.lock().unwrap();
        for job in jobs.iter_mut() {
            let locked = job.locked_until.is_some_and(|until| until > now);
            if job.queue == queue && !job.completed && !job.dead && !locked {
                job.locked_until = Some(now + Duration::from_millis(lock_ms as u64));
                job.attempts += 1;
                return Ok(Some(QueuedJob {
                    id: job.id,
                    queue: job.queue,
                    payload: job.payload.clone(),
                    attempts: job.attempts,
                    enqueued_at: job.enqueued_at,
                }));
            }
        }
        Ok(None)
    }

    async fn renew(&self, job_id: Uuid, lock_ms: i64) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id && !j.completed) {
            job.locked_until = Some(Instant::now() + Duration::from_millis(lock_ms as u64));
        }
        Ok(())
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
            job.completed = true;
            job.locked_until = None;
            job.progress = 100;
        }
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str, max_attempts: i32) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
            job.locked_until = None;
            job.last_error = Some(error.to_string());
            if job.attempts >= max_attempts {
                job.dead = true;
            }
        }
        Ok(())
    }

    async fn set_progress(&self, job_id: Uuid, percent: i16) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
            job.progress = percent;
        }
        Ok(())
    }
}
