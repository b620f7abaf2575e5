//! Implementation of the scheduling loop.
//!
//! The loop runs on a single task. Every tick it reconciles exited jobs into
//! the ledger, releasing their devices, and then dispatches queued windows
//! onto free devices in FIFO order. The loop stops once neither queued nor
//! active work remains.
//!
//! Cancelling the loop stops further ticks but leaves launched processes
//! running; they remain in the ledger's active collection and are adopted by
//! the next scheduler session.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::DeviceId;
use crate::WindowDescriptor;
use crate::config::SchedulerConfig;
use crate::device::AllocatorError;
use crate::device::DeviceAllocator;
use crate::ledger::Ledger;
use crate::ledger::LedgerError;
use crate::ledger::TerminalStatus;
use crate::supervisor::ActiveJob;
use crate::supervisor::Outcome;
use crate::supervisor::Supervisor;

/// The state of the scheduling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Queued windows are dispatched as devices free up.
    Running,
    /// Dispatch is paused; active jobs are still reconciled.
    Paused,
    /// No further dispatch; the loop stops once active jobs finish.
    Draining,
    /// The loop has stopped.
    Stopped,
}

/// Represents an error that terminates the scheduling loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No device became free within the device-wait timeout.
    #[error("no device became free within {timeout:?} with {queued} window(s) still queued")]
    DeviceWaitTimeout {
        /// The device-wait timeout.
        timeout: Duration,
        /// The number of windows still queued.
        queued: usize,
    },

    /// The loop was interrupted.
    #[error("scheduling was interrupted with {active} job(s) still running")]
    Interrupted {
        /// The number of jobs left running.
        active: usize,
    },

    /// The ledger failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The ledger's active jobs do not fit the device pool.
    #[error("active jobs do not fit the device pool: {0}")]
    Allocator(#[from] AllocatorError),
}

/// Summarizes a scheduling run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// The number of jobs launched.
    pub dispatched: usize,
    /// The number of windows that failed to launch.
    pub launch_failures: usize,
    /// The number of jobs that completed successfully.
    pub completed: usize,
    /// The number of jobs that finished unsuccessfully.
    pub failed: usize,
    /// The number of ticks performed.
    pub ticks: usize,
    /// The maximum number of jobs active at once.
    pub max_active: usize,
}

/// Drives queued windows through the device pool.
#[derive(Debug)]
pub struct Scheduler {
    /// The scheduler configuration.
    config: SchedulerConfig,
    /// The state ledger.
    ledger: Ledger,
    /// The device allocator.
    allocator: DeviceAllocator,
    /// The process supervisor.
    supervisor: Arc<dyn Supervisor>,
    /// The jobs currently bound to a device.
    jobs: Vec<ActiveJob>,
    /// Cancels the loop.
    cancel: CancellationToken,
    /// Stops dispatch and lets active jobs finish.
    drain: CancellationToken,
    /// The current state of the loop.
    state: SchedulerState,
    /// The summary of the run so far.
    summary: RunSummary,
}

impl Scheduler {
    /// Constructs a new scheduler.
    ///
    /// Jobs left active by a previous session are adopted so that their
    /// completion is reconciled.
    pub fn new(
        config: &SchedulerConfig,
        ledger: Ledger,
        mut allocator: DeviceAllocator,
        supervisor: Arc<dyn Supervisor>,
    ) -> Result<Self, SchedulerError> {
        allocator.sync(ledger.active().iter().map(|r| (r.device, r.window.id())))?;

        let jobs: Vec<_> = ledger
            .active()
            .iter()
            .map(|r| {
                info!(
                    pid = r.pid,
                    device = r.device,
                    "adopting job for window `{window}` from a previous session",
                    window = r.window
                );
                ActiveJob {
                    window: r.window.clone(),
                    device: r.device,
                    handle: supervisor.adopt(r.pid, r.started),
                    started: r.started,
                }
            })
            .collect();

        let summary = RunSummary {
            max_active: jobs.len(),
            ..Default::default()
        };

        Ok(Self {
            config: config.clone(),
            ledger,
            allocator,
            supervisor,
            jobs,
            cancel: CancellationToken::new(),
            drain: CancellationToken::new(),
            state: SchedulerState::Running,
            summary,
        })
    }

    /// Gets the token that interrupts the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Gets the token that drains the loop when cancelled.
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    /// Gets the state ledger.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Gets the device allocator.
    pub fn allocator(&self) -> &DeviceAllocator {
        &self.allocator
    }

    /// Gets the current state of the loop.
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Gets the summary of the run so far.
    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    /// Consumes the scheduler, returning its ledger.
    pub fn into_ledger(self) -> Ledger {
        self.ledger
    }

    /// Runs the loop until no queued or active work remains.
    pub async fn run(&mut self) -> Result<RunSummary, SchedulerError> {
        info!(
            devices = self.allocator.capacity(),
            queued = self.ledger.queued_count(),
            active = self.ledger.active_count(),
            "starting scheduler"
        );

        let result = self.run_loop().await;
        self.state = SchedulerState::Stopped;

        match &result {
            Ok(summary) => info!(
                dispatched = summary.dispatched,
                completed = summary.completed,
                failed = summary.failed + summary.launch_failures,
                "scheduler finished"
            ),
            Err(e) => error!("scheduler stopped: {e}"),
        }

        result
    }

    /// Ticks until finished, sleeping the poll interval between ticks.
    async fn run_loop(&mut self) -> Result<RunSummary, SchedulerError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.interrupted());
            }

            self.tick().await?;
            if self.is_finished() {
                return Ok(self.summary);
            }

            let draining = self.drain.is_cancelled();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.interrupted()),
                _ = self.drain.cancelled(), if !draining => {
                    info!("draining: no further windows will be dispatched");
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
    }

    /// Performs a single tick.
    ///
    /// Exited jobs are reconciled first; queued windows are then dispatched
    /// unless the loop is paused or draining.
    pub async fn tick(&mut self) -> Result<(), SchedulerError> {
        self.summary.ticks += 1;
        self.reconcile()?;

        if self.drain.is_cancelled() {
            self.state = SchedulerState::Draining;
            return Ok(());
        }

        if self.ledger.is_paused()? {
            if self.state != SchedulerState::Paused {
                info!(
                    queued = self.ledger.queued_count(),
                    "dispatch is paused"
                );
            }

            self.state = SchedulerState::Paused;
            return Ok(());
        }

        if self.state == SchedulerState::Paused {
            info!("dispatch resumed");
        }

        self.state = SchedulerState::Running;
        self.dispatch().await
    }

    /// Retires every exited job and releases its device.
    ///
    /// Returns the number of jobs retired.
    pub fn reconcile(&mut self) -> Result<usize, SchedulerError> {
        let mut retired = 0;
        let mut index = 0;
        while index < self.jobs.len() {
            let status = match self.supervisor.poll_outcome(&mut self.jobs[index]) {
                Outcome::Running => {
                    index += 1;
                    continue;
                }
                Outcome::Terminal(status) => status,
            };

            let record = self
                .ledger
                .retire(self.jobs[index].window.id(), status, Utc::now())?;
            let job = self.jobs.remove(index);
            self.allocator.release(job.device);
            retired += 1;

            match status {
                TerminalStatus::Success => {
                    self.summary.completed += 1;
                    info!(
                        device = job.device,
                        elapsed = record.duration.as_secs(),
                        "window `{window}` completed",
                        window = job.window
                    );
                }
                _ => {
                    self.summary.failed += 1;
                    warn!(
                        device = job.device,
                        elapsed = record.duration.as_secs(),
                        "window `{window}` finished with status {status}",
                        window = job.window
                    );
                }
            }
        }

        if retired > 0 {
            self.allocator
                .sync(self.ledger.active().iter().map(|r| (r.device, r.window.id())))?;
        }

        Ok(retired)
    }

    /// Waits for a device to become free.
    ///
    /// Exited jobs are reconciled at every poll interval while waiting.
    /// Returns `None` if the loop starts draining or dispatch is paused while
    /// waiting.
    pub async fn wait_for_free_device(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<DeviceId>, SchedulerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(device) = self.allocator.free_device() {
                return Ok(Some(device));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SchedulerError::DeviceWaitTimeout {
                    timeout,
                    queued: self.ledger.queued_count(),
                });
            }

            debug!("waiting for a free device");
            let step = self.config.poll_interval().min(deadline - now);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.interrupted()),
                _ = self.drain.cancelled() => return Ok(None),
                _ = tokio::time::sleep(step) => {}
            }

            self.reconcile()?;
            if self.ledger.is_paused()? {
                info!(
                    queued = self.ledger.queued_count(),
                    "dispatch was paused while waiting for a free device"
                );
                return Ok(None);
            }
        }
    }

    /// Dispatches queued windows while devices are available.
    async fn dispatch(&mut self) -> Result<(), SchedulerError> {
        while !self.ledger.queued().is_empty() {
            if self.cancel.is_cancelled() || self.drain.is_cancelled() {
                break;
            }

            if self.ledger.is_paused()? {
                break;
            }

            let device = match self.allocator.free_device() {
                Some(device) => device,
                None => match self
                    .wait_for_free_device(self.config.device_wait_timeout())
                    .await?
                {
                    Some(device) => device,
                    None => break,
                },
            };

            let Some(window) = self.ledger.dequeue_front()? else {
                break;
            };

            self.launch(window, device).await?;
        }

        Ok(())
    }

    /// Launches a window on a device.
    ///
    /// A launch failure is recorded as a failed terminal record.
    async fn launch(
        &mut self,
        window: WindowDescriptor,
        device: DeviceId,
    ) -> Result<(), SchedulerError> {
        let started = Utc::now();
        match self.supervisor.launch(&window, device).await {
            Ok(handle) => {
                let job = ActiveJob {
                    window,
                    device,
                    handle,
                    started,
                };

                self.ledger.promote_to_active(job.record())?;
                self.allocator.bind(device, job.window.id().clone())?;
                info!(
                    device,
                    pid = job.handle.pid(),
                    "dispatched window `{window}`",
                    window = job.window
                );

                self.jobs.push(job);
                self.summary.dispatched += 1;
                self.summary.max_active = self.summary.max_active.max(self.jobs.len());
            }
            Err(e) => {
                error!(device, "failed to launch window `{window}`: {e}");
                self.ledger
                    .record_launch_failure(window, device, e.pid(), started, Utc::now())?;
                self.summary.launch_failures += 1;
            }
        }

        Ok(())
    }

    /// Determines if the loop has no work left.
    fn is_finished(&self) -> bool {
        self.jobs.is_empty() && (self.ledger.queued().is_empty() || self.drain.is_cancelled())
    }

    /// Builds the interruption error.
    fn interrupted(&self) -> SchedulerError {
        SchedulerError::Interrupted {
            active: self.jobs.len(),
        }
    }
}
