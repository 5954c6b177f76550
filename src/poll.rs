use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::StatusRules;
use crate::domain::{Credentials, RequestId};
use crate::error::RdaError;
use crate::rda::RdaClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Submitted,
    Processing(String),
    Ready,
    Failed(String),
}

impl JobStatus {
    pub fn classify(raw: &str, rules: &StatusRules) -> Self {
        if rules.errors.iter().any(|marker| raw.contains(marker.as_str())) {
            return JobStatus::Failed(raw.to_string());
        }
        if raw == rules.completed {
            return JobStatus::Ready;
        }
        JobStatus::Processing(raw.to_string())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Failed(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel(&self) {
        let mut cancelled = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.state.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let flagged = *self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        flagged || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn check(&self) -> Result<(), RdaError> {
        if self.is_cancelled() {
            return Err(RdaError::Cancelled);
        }
        Ok(())
    }

    /// Sleeps for `duration`, waking early on cancellation or at the deadline.
    pub fn sleep(&self, duration: Duration) -> Result<(), RdaError> {
        let mut wake = Instant::now() + duration;
        if let Some(deadline) = self.deadline {
            wake = wake.min(deadline);
        }
        let mut cancelled = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let now = Instant::now();
            if now >= wake {
                break;
            }
            let (guard, _) = self
                .state
                .signal
                .wait_timeout(cancelled, wake - now)
                .unwrap_or_else(PoisonError::into_inner);
            cancelled = guard;
        }
        drop(cancelled);
        self.check()
    }
}

/// Checks a job at a fixed interval until it is ready or has failed.
/// There is no attempt limit; stop it through the cancel token.
#[derive(Debug, Clone)]
pub struct StatusPoller {
    rules: StatusRules,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(rules: StatusRules, interval: Duration) -> Self {
        Self { rules, interval }
    }

    /// `notify` sees every status read, terminal ones included. `sleep` runs
    /// between non-terminal reads only.
    pub fn wait_until_ready<C, N, S>(
        &self,
        client: &C,
        id: &RequestId,
        credentials: &Credentials,
        cancel: &CancelToken,
        mut notify: N,
        mut sleep: S,
    ) -> Result<(), RdaError>
    where
        C: RdaClient + ?Sized,
        N: FnMut(&JobStatus, &str),
        S: FnMut(Duration) -> Result<(), RdaError>,
    {
        let mut state = JobStatus::Submitted;
        loop {
            cancel.check()?;
            let raw = client.check_status(id, credentials)?;
            let next = JobStatus::classify(&raw, &self.rules);
            if next != state {
                info!(request_id = %id, from = ?state, to = ?next, "job status changed");
            }
            state = next;
            notify(&state, &raw);

            match &state {
                JobStatus::Ready => return Ok(()),
                JobStatus::Failed(status) => return Err(RdaError::JobFailed(status.clone())),
                JobStatus::Submitted | JobStatus::Processing(_) => {
                    debug!(request_id = %id, interval = ?self.interval, "waiting for job");
                    sleep(self.interval)?;
                }
            }
        }
    }
}
