//! Table of active jobs and the control operations routed through it
//!
//! The registry is an ordinary value: build one at startup and hand it to
//! whatever accepts control commands. It allows at most one job per device.
//! A finishing job leaves the table and emits its terminal event inside the
//! same critical section, so `list()` agrees with the event stream: a query
//! that follows the event never shows the job, and one that precedes it
//! always does.

use crate::config::StreamConfig;
use crate::device::DeviceMap;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, EventNotifier, EventStream};
use crate::job::{JobHandle, JobInfo, JobState, JobStatus, StreamJob};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::Instrument;

/// Process-wide table of active streaming jobs
#[derive(Debug, Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    devices: Arc<DeviceMap>,
    notifier: Arc<EventNotifier>,
    config: StreamConfig,
    // Creation order
    jobs: Mutex<Vec<Arc<JobState>>>,
}

impl JobRegistry {
    /// Create a registry over `devices`, publishing to `notifier`
    pub fn new(
        devices: Arc<DeviceMap>,
        notifier: Arc<EventNotifier>,
        config: StreamConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                devices,
                notifier,
                config,
                jobs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Devices this registry controls
    pub fn devices(&self) -> &Arc<DeviceMap> {
        &self.inner.devices
    }

    /// Event notifier jobs publish to
    pub fn notifier(&self) -> &Arc<EventNotifier> {
        &self.inner.notifier
    }

    /// Subscribe to job events
    pub fn subscribe(&self) -> EventStream {
        self.inner.notifier.subscribe()
    }

    /// Start streaming `device` down to `base` (whole chain if `None`).
    ///
    /// Must be called from within a Tokio runtime. On error nothing is
    /// registered.
    pub fn start(&self, device: &str, base: Option<&str>, speed: Option<i64>) -> Result<JobHandle> {
        let dev = self.inner.devices.get(device)?;
        let speed = match speed {
            Some(speed) => u64::try_from(speed).map_err(|_| Error::InvalidSpeed(speed))?,
            None => self.inner.config.default_speed,
        };
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::InvalidConfig("block jobs need a running Tokio runtime".to_string())
        })?;

        let mut jobs = self.lock_jobs();
        if jobs.iter().any(|j| j.device() == device) {
            return Err(Error::JobActive(device.to_string()));
        }

        let job = StreamJob::new(dev, base, speed, &self.inner.config)?;
        let state = Arc::clone(job.state());
        let handle = JobHandle::new(&state);
        jobs.push(Arc::clone(&state));
        drop(jobs);

        let inner = Arc::clone(&self.inner);
        let span = tracing::info_span!("stream", device = %device);
        let worker = runtime.spawn(job.run().instrument(span.clone()));
        runtime.spawn(
            async move {
                // A panicking job still has to leave the table with an event
                let (status, event) = match worker.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let reason = abort_reason(e);
                        tracing::error!("Stream job aborted: {}", reason);
                        (JobStatus::Failed, state.event(EventKind::Error, Some(reason)))
                    }
                };
                inner.finish(&state, status, event);
            }
            .instrument(span),
        );

        Ok(handle)
    }

    /// Request cancellation of the job on `device`.
    ///
    /// The job stops at its next segment boundary and then emits its
    /// cancelled event; this call does not wait for that.
    pub fn cancel(&self, device: &str) -> Result<()> {
        let job = self.find(device)?;
        tracing::debug!(device, "Cancel requested");
        job.request_cancel();
        Ok(())
    }

    /// Change the speed limit of the job on `device`
    pub fn set_speed(&self, device: &str, speed: i64) -> Result<()> {
        let job = self.find(device)?;
        job.set_speed(speed)
    }

    /// Snapshot of all active jobs in creation order
    pub fn list(&self) -> Vec<JobInfo> {
        self.lock_jobs().iter().map(|j| j.info()).collect()
    }

    /// Whether `device` has an active job
    pub fn is_active(&self, device: &str) -> bool {
        self.lock_jobs().iter().any(|j| j.device() == device)
    }

    fn find(&self, device: &str) -> Result<Arc<JobState>> {
        self.lock_jobs()
            .iter()
            .find(|j| j.device() == device)
            .cloned()
            .ok_or_else(|| Error::NoActiveJob(device.to_string()))
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, Vec<Arc<JobState>>> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl RegistryInner {
    fn finish(&self, state: &Arc<JobState>, status: JobStatus, event: Event) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.retain(|j| !Arc::ptr_eq(j, state));
        self.notifier.emit(event);
        state.set_status(status);
    }
}

fn abort_reason(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return format!("job task failed: {}", error);
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    format!("job task panicked: {}", message)
}
