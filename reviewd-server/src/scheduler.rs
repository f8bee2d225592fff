//! The worker loop.
//!
//! A single cooperative loop polls both queues once per iteration and
//! sleeps in between. Visibility timeouts provide implicit back-off;
//! running more worker processes scales horizontally because a leased
//! message is owned by at most one worker at a time. Shutdown is
//! graceful: the in-flight iteration finishes, then the loop exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use reviewd_core::{EventType, RepoAnalysisPayload, WebhookEvent};

use crate::errors::{JobError, JobOutcome};
use crate::queue::{
    QueueMessage, ANALYSIS_VISIBILITY, MAX_READ_COUNT, QUEUE_REPO_ANALYSIS, QUEUE_WEBHOOK_EVENTS,
    REVIEW_VISIBILITY,
};
use crate::{analyzer, reviewer, AppState};

pub async fn run_scheduler(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_millis(state.config.poll_interval_ms);
    info!(
        "Scheduler started (poll interval {}ms)",
        state.config.poll_interval_ms
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        poll_analysis_queue(&state).await;
        poll_webhook_queue(&state).await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
    }

    info!("Scheduler stopped");
}

/// Decide what to do with a finished job: acknowledge it, or leave it
/// for redelivery when the failure is retryable.
async fn settle<T>(
    state: &AppState,
    queue: &str,
    msg: &QueueMessage<T>,
    result: Result<JobOutcome, JobError>,
    what: &str,
) {
    match result {
        Ok(JobOutcome::Completed) => {
            if let Err(e) = state.queue.delete(queue, &msg.msg_id).await {
                warn!("Failed to acknowledge {} message: {:#}", what, e);
            }
        }
        Ok(JobOutcome::Skipped(reason)) => {
            info!("Skipped {} job: {}", what, reason);
            if let Err(e) = state.queue.delete(queue, &msg.msg_id).await {
                warn!("Failed to acknowledge {} message: {:#}", what, e);
            }
        }
        Err(e) if e.is_retryable() => {
            warn!(
                "{} job failed (delivery {}), leaving for redelivery: {}",
                what, msg.read_ct, e
            );
        }
        Err(e) => {
            error!("{} job failed terminally: {}", what, e);
            if let Err(e) = state.queue.delete(queue, &msg.msg_id).await {
                warn!("Failed to acknowledge {} message: {:#}", what, e);
            }
        }
    }
}

async fn poll_analysis_queue(state: &Arc<AppState>) {
    let msg = match state
        .queue
        .read::<RepoAnalysisPayload>(QUEUE_REPO_ANALYSIS, ANALYSIS_VISIBILITY)
        .await
    {
        Ok(Some(msg)) => msg,
        Ok(None) => return,
        Err(e) => {
            warn!("Failed to read analysis queue: {:#}", e);
            return;
        }
    };

    if msg.read_ct > MAX_READ_COUNT {
        error!(
            "Giving up on analysis of {} after {} deliveries",
            msg.body.repo_name, msg.read_ct
        );
        let _ = state.queue.delete(QUEUE_REPO_ANALYSIS, &msg.msg_id).await;
        return;
    }

    let result = analyzer::run(state, &msg.body).await;
    settle(state, QUEUE_REPO_ANALYSIS, &msg, result, "analysis").await;
}

async fn poll_webhook_queue(state: &Arc<AppState>) {
    let msg = match state
        .queue
        .read::<WebhookEvent>(QUEUE_WEBHOOK_EVENTS, REVIEW_VISIBILITY)
        .await
    {
        Ok(Some(msg)) => msg,
        Ok(None) => return,
        Err(e) => {
            warn!("Failed to read webhook queue: {:#}", e);
            return;
        }
    };

    if msg.read_ct > MAX_READ_COUNT {
        error!(
            "Giving up on review of {}#{} after {} deliveries",
            msg.body.repo_name, msg.body.pr_number, msg.read_ct
        );
        let _ = state.queue.delete(QUEUE_WEBHOOK_EVENTS, &msg.msg_id).await;
        return;
    }

    match msg.body.event_type {
        EventType::PrOpened | EventType::PrUpdated => {
            let result = reviewer::run(state, &msg.body).await;
            settle(state, QUEUE_WEBHOOK_EVENTS, &msg, result, "review").await;
        }
        EventType::PrClosed | EventType::PrReopened => {
            // Nothing to do for lifecycle events; acknowledge.
            let _ = state.queue.delete(QUEUE_WEBHOOK_EVENTS, &msg.msg_id).await;
        }
    }
}
