use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{BookingError, JobError};
use crate::model::{JobType, ScheduledJob};
use crate::processor::{BookingProcessor, DispatchOutcome};
use crate::scheduler::{JobHandler, JobScheduler};

/// Deferred-attempt and retry-attempt jobs: hand the request to the processor.
pub struct AttemptHandler {
    processor: Arc<BookingProcessor>,
}

impl AttemptHandler {
    pub fn new(processor: Arc<BookingProcessor>) -> Self {
        Self { processor }
    }

    pub fn register(scheduler: &JobScheduler, processor: Arc<BookingProcessor>) {
        let handler: Arc<dyn JobHandler> = Arc::new(Self::new(processor));
        scheduler.register(JobType::DeferredBookingAttempt, handler.clone());
        scheduler.register(JobType::RetryAttempt, handler);
    }
}

#[async_trait]
impl JobHandler for AttemptHandler {
    async fn handle(&self, job: &ScheduledJob) -> Result<bool, JobError> {
        let id = job
            .payload
            .request_id()
            .ok_or_else(|| JobError::Handler("payload carries no request id".into()))?;

        match self.processor.dispatch(id).await {
            Ok(DispatchOutcome::Started) => {
                info!(request_id = %id, "attempt dispatched");
                Ok(true)
            }
            // The request keeps its due time, so the processor poll picks it up
            // once a slot frees. Backing off here would spend the job's budget.
            Ok(DispatchOutcome::AtCapacity) => {
                debug!(request_id = %id, "processor full, leaving attempt to the poll");
                Ok(true)
            }
            Ok(outcome) => {
                debug!(request_id = %id, ?outcome, "nothing to dispatch");
                Ok(true)
            }
            Err(BookingError::NotFound(_)) => {
                debug!(request_id = %id, "request is gone");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }
}
