use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::routes::GradingJob;

/// Grading jobs waiting for a free worker, oldest first
pub struct GradingQueue {
    queue: Mutex<VecDeque<GradingJob>>,
    notify: Notify,
}

impl Default for GradingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl GradingQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, job: GradingJob) {
        self.queue.lock().await.push_back(job);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> GradingJob {
        loop {
            if let Some(job) = self.queue.lock().await.pop_front() {
                return job;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;

    fn job(id: u32) -> GradingJob {
        let (responder, _) = oneshot::channel();
        GradingJob {
            request: serde_json::from_value(json!({"exercise_id": id, "answer": ""})).unwrap(),
            responder,
        }
    }

    fn exercise_id(job: &GradingJob) -> u64 {
        job.request.exercise_id.as_ref().and_then(|v| v.as_u64()).unwrap()
    }

    #[tokio::test]
    async fn test_jobs_are_popped_in_order() {
        let queue = GradingQueue::new();
        queue.push(job(1)).await;
        queue.push(job(2)).await;
        assert_eq!(exercise_id(&queue.pop().await), 1);
        assert_eq!(exercise_id(&queue.pop().await), 2);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(GradingQueue::new());
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { exercise_id(&queue.pop().await) }
        });
        tokio::task::yield_now().await;
        queue.push(job(9)).await;
        assert_eq!(waiter.await.unwrap(), 9);
    }
}
