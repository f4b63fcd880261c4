// src/operation/state.rs
//! Tracker state and its transitions.

use super::JobHandle;
use crate::error::TrackerError;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Submitting,
    Polling,
    Completed,
    Failed,
}

impl Phase {
    /// `Completed` and `Failed` never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Submitting | Self::Polling)
    }

    pub fn status_line(&self) -> &'static str {
        match self {
            Self::Idle => "",
            Self::Submitting => "generating",
            Self::Polling => "processing",
            Self::Completed => "done",
            Self::Failed => "error",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Submitting => write!(f, "submitting"),
            Self::Polling => write!(f, "polling"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle of one submitted job.
///
/// Invariants: `Completed` implies `current_handle` carries a result
/// reference; `Failed` implies `last_error` is set.
#[derive(Debug, Clone)]
pub struct TrackerState<H> {
    pub phase: Phase,
    pub current_handle: Option<H>,
    pub last_error: Option<TrackerError>,
    pub cancelled: bool,
    /// Poll responses (successful or not) applied so far
    pub polls: u32,
    /// This job's failure cleared the shared credential flag
    pub credential_invalidated: bool,
    pub updated_at: DateTime<Utc>,
}

impl<H: JobHandle> TrackerState<H> {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            current_handle: None,
            last_error: None,
            cancelled: false,
            polls: 0,
            credential_invalidated: false,
            updated_at: Utc::now(),
        }
    }

    /// No further transitions will happen
    pub fn is_settled(&self) -> bool {
        self.cancelled || self.phase.is_terminal()
    }

    /// Result reference, only once the job has completed
    pub fn result_uri(&self) -> Option<&str> {
        if self.phase != Phase::Completed {
            return None;
        }
        self.current_handle.as_ref().and_then(JobHandle::result_uri)
    }

    pub(crate) fn accepts_updates(&self) -> bool {
        !self.is_settled()
    }

    pub(crate) fn begin_submission(&mut self) {
        self.phase = Phase::Submitting;
        self.touch();
    }

    pub(crate) fn start_polling(&mut self, handle: H) {
        self.current_handle = Some(handle);
        self.phase = Phase::Polling;
        self.touch();
    }

    /// Apply a refreshed handle and return the resulting phase
    pub(crate) fn apply_poll(&mut self, handle: H) -> Phase {
        let done = handle.is_done();
        let has_result = handle.result_uri().is_some();
        self.polls += 1;
        self.current_handle = Some(handle);

        if done && has_result {
            self.phase = Phase::Completed;
            self.touch();
        } else if done {
            self.fail(TrackerError::ProtocolViolation);
        } else {
            self.touch();
        }
        self.phase
    }

    pub(crate) fn apply_poll_error(&mut self, error: TrackerError) {
        self.polls += 1;
        self.fail(error);
    }

    pub(crate) fn fail(&mut self, error: TrackerError) {
        self.credential_invalidated = error.is_credential_invalid();
        self.last_error = Some(error);
        self.phase = Phase::Failed;
        self.touch();
    }

    /// Mark cancelled; returns false if already cancelled or terminal
    pub(crate) fn cancel(&mut self) -> bool {
        if !self.accepts_updates() {
            return false;
        }
        self.cancelled = true;
        self.phase = Phase::Idle;
        self.touch();
        true
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl<H: JobHandle> Default for TrackerState<H> {
    fn default() -> Self {
        Self::new()
    }
}
