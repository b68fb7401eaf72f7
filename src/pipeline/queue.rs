//! Dispatch queue for synthesis and governance tasks
//!
//! Asynchronous boundary between the scheduler and the worker pool. A
//! task gets at most three delivery attempts before it is dead-lettered
//! for manual inspection; the caller is responsible for reverting the
//! pattern to its prior stable state when that happens.

use crate::pipeline::types::TenantId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// Maximum delivery attempts before dead-lettering.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineTask {
    Synthesize {
        tenant_id: TenantId,
        pattern_id: Uuid,
    },
    Govern {
        tenant_id: TenantId,
        pattern_id: Uuid,
        proposal_id: Uuid,
    },
}

impl PipelineTask {
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            PipelineTask::Synthesize { tenant_id, .. } => tenant_id,
            PipelineTask::Govern { tenant_id, .. } => tenant_id,
        }
    }

    pub fn pattern_id(&self) -> Uuid {
        match self {
            PipelineTask::Synthesize { pattern_id, .. } => *pattern_id,
            PipelineTask::Govern { pattern_id, .. } => *pattern_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: PipelineTask,
    pub attempts: u32,
}

/// A task that exhausted its delivery attempts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub task: PipelineTask,
    pub attempts: u32,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// What became of a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Requeued { attempts: u32 },
    DeadLettered,
}

/// In-process dispatch queue.
pub struct TaskQueue {
    queue: Mutex<VecDeque<QueuedTask>>,
    notify: Notify,
    dead: Mutex<Vec<DeadLetter>>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dead: Mutex::new(Vec::new()),
        }
    }

    pub async fn enqueue(&self, task: PipelineTask) {
        self.queue
            .lock()
            .await
            .push_back(QueuedTask { task, attempts: 0 });
        self.notify.notify_one();
    }

    /// Wait for the next task.
    pub async fn pop(&self) -> QueuedTask {
        loop {
            if let Some(task) = self.try_pop().await {
                return task;
            }
            self.notify.notified().await;
        }
    }

    /// Next task, if one is queued.
    pub async fn try_pop(&self) -> Option<QueuedTask> {
        self.queue.lock().await.pop_front()
    }

    /// Record a failed delivery: requeue with an incremented attempt
    /// counter, or dead-letter once the budget is exhausted.
    pub async fn record_failure(&self, mut delivery: QueuedTask, error: &str) -> FailureOutcome {
        delivery.attempts += 1;
        if delivery.attempts >= MAX_DELIVERY_ATTEMPTS {
            self.dead.lock().await.push(DeadLetter {
                task: delivery.task,
                attempts: delivery.attempts,
                last_error: error.to_string(),
                dead_lettered_at: Utc::now(),
            });
            return FailureOutcome::DeadLettered;
        }
        let attempts = delivery.attempts;
        self.queue.lock().await.push_back(delivery);
        self.notify.notify_one();
        FailureOutcome::Requeued { attempts }
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Dead-lettered tasks awaiting manual inspection.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthesize_task() -> PipelineTask {
        PipelineTask::Synthesize {
            tenant_id: "acme".to_string(),
            pattern_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_pop_fifo() {
        let queue = TaskQueue::new();
        let a = synthesize_task();
        let b = synthesize_task();
        queue.enqueue(a.clone()).await;
        queue.enqueue(b.clone()).await;

        assert_eq!(queue.pop().await.task, a);
        assert_eq!(queue.pop().await.task, b);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_three_failures_dead_letter() {
        let queue = TaskQueue::new();
        queue.enqueue(synthesize_task()).await;

        let mut delivery = queue.try_pop().await.unwrap();
        for attempt in 1..MAX_DELIVERY_ATTEMPTS {
            match queue.record_failure(delivery, "boom").await {
                FailureOutcome::Requeued { attempts } => assert_eq!(attempts, attempt),
                FailureOutcome::DeadLettered => panic!("dead-lettered too early"),
            }
            delivery = queue.try_pop().await.unwrap();
        }

        let outcome = queue.record_failure(delivery, "boom").await;
        assert_eq!(outcome, FailureOutcome::DeadLettered);
        assert!(queue.is_empty().await);

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, MAX_DELIVERY_ATTEMPTS);
        assert_eq!(dead[0].last_error, "boom");
    }
}
