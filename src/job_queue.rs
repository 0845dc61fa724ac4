// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-user hydration job queue: a priority actor, one per user (§4.5).
//!
//! Modeled on the same "dedicated task owns its state, callers send
//! messages" shape as the outbox worker/queue pairing, generalized from a
//! durable SQL-backed FIFO to an in-memory per-user priority queue.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::domain::Job;

const RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_ATTEMPTS: u8 = 3;

enum Command {
    Add(Job),
    Retry(Job),
    Pop(oneshot::Sender<Option<Job>>),
    Done(String),
}

/// Handle to a running queue actor. Cheap to clone; every worker in a
/// user's swarm shares one.
#[derive(Clone)]
pub struct JobQueueHandle {
    tx: mpsc::UnboundedSender<Command>,
    completions: Arc<AtomicU64>,
    retries: Arc<AtomicU64>,
}

impl JobQueueHandle {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let completions = Arc::new(AtomicU64::new(0));
        let retries = Arc::new(AtomicU64::new(0));
        tokio::spawn(run(rx, completions.clone(), retries.clone()));
        Self { tx, completions, retries }
    }

    /// Drops the job if its id is in-flight; replaces the pending entry if
    /// the new job is strictly higher priority (lower number); else appends.
    pub fn add(&self, job: Job) {
        let _ = self.tx.send(Command::Add(job));
    }

    /// Returns the highest-priority job (lowest number, ties by earliest
    /// `added_at_ms`), moving it into the in-flight set.
    pub async fn pop(&self) -> Option<Job> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Pop(reply_tx)).is_err() {
            return None;
        }
        reply_rx.await.unwrap_or(None)
    }

    pub fn done(&self, id: impl Into<String>) {
        let _ = self.tx.send(Command::Done(id.into()));
    }

    /// On worker failure: re-add after 2s at the original priority if
    /// `attempts < 3`, else drop (§4.5).
    pub fn retry_after_failure(&self, mut job: Job) {
        if job.attempts >= MAX_ATTEMPTS {
            return;
        }
        job.attempts += 1;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RETRY_DELAY).await;
            let _ = tx.send(Command::Retry(job));
        });
    }

    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Command>,
    completions: Arc<AtomicU64>,
    retries: Arc<AtomicU64>,
) {
    let mut pending: HashMap<String, Job> = HashMap::new();
    let mut heap: BinaryHeap<Reverse<(u8, i64, String)>> = BinaryHeap::new();
    let mut in_flight: HashSet<String> = HashSet::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Add(job) => insert(&mut pending, &mut heap, &in_flight, job),
            Command::Retry(job) => {
                retries.fetch_add(1, Ordering::Relaxed);
                insert(&mut pending, &mut heap, &in_flight, job);
            }
            Command::Pop(reply) => {
                let job = pop_next(&mut pending, &mut heap, &mut in_flight);
                let _ = reply.send(job);
            }
            Command::Done(id) => {
                in_flight.remove(&id);
                completions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn insert(
    pending: &mut HashMap<String, Job>,
    heap: &mut BinaryHeap<Reverse<(u8, i64, String)>>,
    in_flight: &HashSet<String>,
    job: Job,
) {
    if in_flight.contains(&job.id) {
        return;
    }
    if let Some(existing) = pending.get(&job.id) {
        if job.priority >= existing.priority {
            return;
        }
    }
    heap.push(Reverse((job.priority, job.added_at_ms, job.id.clone())));
    pending.insert(job.id.clone(), job);
}

fn pop_next(
    pending: &mut HashMap<String, Job>,
    heap: &mut BinaryHeap<Reverse<(u8, i64, String)>>,
    in_flight: &mut HashSet<String>,
) -> Option<Job> {
    while let Some(Reverse((priority, added_at_ms, id))) = heap.pop() {
        let Some(job) = pending.get(&id) else { continue };
        // Stale heap entry left behind by a since-replaced job.
        if job.priority != priority || job.added_at_ms != added_at_ms {
            continue;
        }
        let job = pending.remove(&id).unwrap();
        in_flight.insert(id);
        return Some(job);
    }
    None
}

/// Registry of per-user queue actors, mirroring the session pool's
/// register-once/look-up-by-user shape.
pub struct JobQueueRegistry {
    queues: DashMap<String, JobQueueHandle>,
}

impl Default for JobQueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueueRegistry {
    pub fn new() -> Self {
        Self { queues: DashMap::new() }
    }

    pub fn register_user(&self, user: &str) -> JobQueueHandle {
        self.queues.entry(user.to_string()).or_insert_with(JobQueueHandle::spawn).clone()
    }

    pub fn handle_for(&self, user: &str) -> Option<JobQueueHandle> {
        self.queues.get(user).map(|h| h.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, priority: u8, added_at_ms: i64) -> Job {
        Job {
            id: id.to_string(),
            priority,
            added_at_ms,
            uid: 1,
            folder: "Inbox".to_string(),
            user: "alice".to_string(),
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn pops_highest_priority_first() {
        let q = JobQueueHandle::spawn();
        q.add(job("b", Job::PRIORITY_BACKGROUND, 2));
        q.add(job("a", Job::PRIORITY_FOREGROUND, 1));
        let popped = q.pop().await.unwrap();
        assert_eq!(popped.id, "a");
    }

    #[tokio::test]
    async fn ties_broken_by_earliest_added_at() {
        let q = JobQueueHandle::spawn();
        q.add(job("later", Job::PRIORITY_PREWARM, 10));
        q.add(job("earlier", Job::PRIORITY_PREWARM, 5));
        let popped = q.pop().await.unwrap();
        assert_eq!(popped.id, "earlier");
    }

    #[tokio::test]
    async fn add_while_in_flight_is_dropped() {
        let q = JobQueueHandle::spawn();
        q.add(job("x", Job::PRIORITY_BACKGROUND, 1));
        let popped = q.pop().await.unwrap();
        assert_eq!(popped.id, "x");
        q.add(job("x", Job::PRIORITY_FOREGROUND, 2));
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn higher_priority_replaces_pending_entry() {
        let q = JobQueueHandle::spawn();
        q.add(job("x", Job::PRIORITY_BACKGROUND, 1));
        q.add(job("x", Job::PRIORITY_FOREGROUND, 1));
        let popped = q.pop().await.unwrap();
        assert_eq!(popped.priority, Job::PRIORITY_FOREGROUND);
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn done_clears_in_flight_so_resubmission_is_accepted() {
        let q = JobQueueHandle::spawn();
        q.add(job("x", Job::PRIORITY_BACKGROUND, 1));
        let popped = q.pop().await.unwrap();
        q.done(popped.id);
        // Give the actor a tick to process Done before re-adding.
        tokio::task::yield_now().await;
        q.add(job("x", Job::PRIORITY_BACKGROUND, 2));
        assert!(q.pop().await.is_some());
    }
}
