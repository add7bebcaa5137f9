use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::grading::GradingOrchestrator;
use crate::queue::GradingQueue;
use crate::routes::GradingJob;

/// Grades queued jobs one at a time until `token` is cancelled
pub async fn worker(
    id: u8,
    orchestrator: Arc<GradingOrchestrator>,
    queue: Arc<GradingQueue>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            job = queue.pop() => {
                let GradingJob { request, responder } = job;
                log::debug!("Worker {id} got grading job from queue");

                let result = orchestrator.grade(request).await;
                if responder.send(result).is_err() {
                    log::warn!("Client left before grading finished on worker {id}");
                }
            }
        }
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}
