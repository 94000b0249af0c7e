//! Streaming job: copies a backing chain down into its top layer
//!
//! A job walks the image once, front to back. For every segment the chain
//! resolver reports as missing from the top, it takes budget from the rate
//! limiter and hands the segment to the copy engine. The cursor moves past
//! every segment whether or not anything was copied, so a job always
//! terminates after a single pass.
//!
//! State transitions:
//!
//! ```text
//! Created -> Running -> Completing -> Completed
//!                    -> Cancelling -> Cancelled
//!                    -> Erroring   -> Failed
//! ```

use crate::chain::ChainResolver;
use crate::config::StreamConfig;
use crate::copy::CopyEngine;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, JobType};
use crate::ratelimit::RateLimiter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Validated and registered, not yet scheduled
    Created,
    /// Copying segments
    Running,
    /// Reached the end of the image, finishing up
    Completing,
    /// Cancel observed, finishing up
    Cancelling,
    /// Storage failure observed, finishing up
    Erroring,
    /// Terminal: whole image streamed
    Completed,
    /// Terminal: stopped on request
    Cancelled,
    /// Terminal: stopped by a storage failure
    Failed,
}

impl JobStatus {
    /// Whether the job is finished and gone from the registry
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

/// Snapshot of an active job as reported by `query-block-jobs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Job type tag
    #[serde(rename = "type")]
    pub job_type: JobType,

    /// Device the job runs on
    pub device: String,

    /// Total logical length of the image
    pub len: u64,

    /// Progress cursor
    pub offset: u64,

    /// Speed limit in bytes per second (0 = unlimited)
    pub speed: u64,
}

/// State shared between a running job and the control path
#[derive(Debug)]
pub struct JobState {
    device: String,
    len: u64,
    offset: AtomicU64,
    bytes_copied: AtomicU64,
    limiter: RateLimiter,
    cancel: watch::Sender<bool>,
    status: watch::Sender<JobStatus>,
}

impl JobState {
    /// Create the shared state for a job on `device`
    pub fn new(device: impl Into<String>, len: u64, limiter: RateLimiter) -> Self {
        let (cancel, _) = watch::channel(false);
        let (status, _) = watch::channel(JobStatus::Created);
        Self {
            device: device.into(),
            len,
            offset: AtomicU64::new(0),
            bytes_copied: AtomicU64::new(0),
            limiter,
            cancel,
            status,
        }
    }

    /// Device the job runs on
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Current status
    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    pub(crate) fn set_status(&self, status: JobStatus) {
        tracing::trace!(device = %self.device, ?status, "Job status change");
        self.status.send_replace(status);
    }

    /// Progress cursor
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Bytes actually written into the top layer so far
    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::SeqCst)
    }

    /// Total logical length of the image
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the image has zero length
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current speed limit
    pub fn speed(&self) -> u64 {
        self.limiter.rate()
    }

    /// Change the speed limit; negative values leave it unchanged
    pub fn set_speed(&self, speed: i64) -> Result<()> {
        self.limiter.set_rate(speed)
    }

    /// Ask the job to stop at the next segment boundary
    pub fn request_cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether a cancel was requested
    pub fn cancel_requested(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Subscribe to status changes
    pub fn watch_status(&self) -> watch::Receiver<JobStatus> {
        self.status.subscribe()
    }

    /// Query snapshot
    pub fn info(&self) -> JobInfo {
        JobInfo {
            job_type: JobType::Stream,
            device: self.device.clone(),
            len: self.len,
            offset: self.offset(),
            speed: self.speed(),
        }
    }

    pub(crate) fn event(&self, kind: EventKind, error: Option<String>) -> Event {
        Event {
            kind,
            device: self.device.clone(),
            job_type: JobType::Stream,
            offset: self.offset(),
            len: self.len,
            speed: self.speed(),
            error,
            timestamp: SystemTime::now(),
        }
    }
}

/// Handle returned when a job is started
#[derive(Debug, Clone)]
pub struct JobHandle {
    device: String,
    status: watch::Receiver<JobStatus>,
}

impl JobHandle {
    pub(crate) fn new(state: &JobState) -> Self {
        Self {
            device: state.device.clone(),
            status: state.watch_status(),
        }
    }

    /// Device the job runs on
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Status as last published by the job
    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// Wait for the job to reach a terminal state
    pub async fn wait(mut self) -> JobStatus {
        loop {
            let status = *self.status.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if self.status.changed().await.is_err() {
                return *self.status.borrow();
            }
        }
    }
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(Error),
}

/// One streaming operation on one device
#[derive(Debug)]
pub struct StreamJob {
    state: Arc<JobState>,
    device: Arc<Device>,
    resolver: ChainResolver,
    engine: CopyEngine,
    chunk_size: u64,
    rewrite_chain: bool,
}

impl StreamJob {
    /// Prepare a job; fails if `base` is not below the top of the device's chain
    pub fn new(
        device: Arc<Device>,
        base: Option<&str>,
        speed: u64,
        config: &StreamConfig,
    ) -> Result<Self> {
        let resolver = ChainResolver::new(device.name(), device.chain(), base)?;
        let limiter = RateLimiter::with_slice(speed, config.burst);
        let state = Arc::new(JobState::new(device.name(), resolver.len(), limiter));

        Ok(Self {
            state,
            device,
            resolver,
            engine: CopyEngine::new(),
            chunk_size: config.chunk_size as u64,
            rewrite_chain: config.rewrite_chain,
        })
    }

    /// Shared state for the control path
    pub fn state(&self) -> &Arc<JobState> {
        &self.state
    }

    /// Run to a terminal state and return the status and event to publish.
    ///
    /// The caller publishes both, so that removal from the job table and the
    /// event can happen together.
    pub async fn run(self) -> (JobStatus, Event) {
        let state = Arc::clone(&self.state);
        state.set_status(JobStatus::Running);
        tracing::info!(
            base = self.resolver.base_name().unwrap_or("<none>"),
            len = state.len(),
            speed = state.speed(),
            "Stream job started"
        );

        let mut cancel = state.cancel.subscribe();
        let outcome = self.copy_loop(&mut cancel).await;

        match outcome {
            Outcome::Completed => {
                state.set_status(JobStatus::Completing);
                if let Err(e) = self.finish_completed() {
                    return self.fail(e);
                }
                tracing::info!(
                    copied = state.bytes_copied(),
                    "Stream job completed"
                );
                (JobStatus::Completed, state.event(EventKind::Completed, None))
            }
            Outcome::Cancelled => {
                state.set_status(JobStatus::Cancelling);
                if let Err(e) = self.resolver.chain().top().flush() {
                    tracing::warn!("Flush after cancel failed: {}", e);
                }
                tracing::info!(offset = state.offset(), "Stream job cancelled");
                (JobStatus::Cancelled, state.event(EventKind::Cancelled, None))
            }
            Outcome::Failed(e) => self.fail(e),
        }
    }

    async fn copy_loop(&self, cancel: &mut watch::Receiver<bool>) -> Outcome {
        let mut cursor = self.state.offset();

        loop {
            if *cancel.borrow_and_update() {
                return Outcome::Cancelled;
            }

            let segment = match self.resolver.next_segment(cursor, self.chunk_size) {
                Ok(Some(segment)) => segment,
                Ok(None) => return Outcome::Completed,
                Err(e) => return Outcome::Failed(e),
            };

            if segment.needs_copy() {
                tokio::select! {
                    () = self.state.limiter.acquire(segment.len) => {}
                    () = cancelled(cancel) => return Outcome::Cancelled,
                }

                match self.engine.copy(&self.resolver, segment).await {
                    Ok(written) => {
                        self.state.bytes_copied.fetch_add(written, Ordering::SeqCst);
                        tracing::debug!(
                            offset = segment.offset,
                            len = segment.len,
                            written,
                            "Copied segment"
                        );
                    }
                    Err(e) => return Outcome::Failed(e),
                }
            }

            cursor = segment.end();
            self.state.offset.store(cursor, Ordering::SeqCst);
        }
    }

    fn finish_completed(&self) -> Result<()> {
        self.resolver.chain().top().flush()?;
        if self.rewrite_chain {
            let chain = self
                .resolver
                .chain()
                .without_intermediates(self.resolver.base());
            tracing::debug!("Backing chain is now {:?}", chain);
            self.device.replace_chain(chain);
        }
        Ok(())
    }

    fn fail(&self, error: Error) -> (JobStatus, Event) {
        self.state.set_status(JobStatus::Erroring);
        tracing::warn!(offset = self.state.offset(), "Stream job failed: {}", error);
        (
            JobStatus::Failed,
            self.state.event(EventKind::Error, Some(error.to_string())),
        )
    }
}

/// Resolve once a cancel has been requested
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
