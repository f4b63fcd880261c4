// src/operation/mod.rs
//! Long-running generation jobs: submit once, poll until the backend
//! reports a result, fail fast on any error.

use crate::error::{RequestError, ServiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod state;
pub mod tracker;

pub use state::{Phase, TrackerState};
pub use tracker::{OperationTracker, PollConfig, TrackerHandle};

/// Opaque job status token returned by the generation service.
///
/// The tracker only ever asks whether the job is done and whether a result
/// reference came back with it.
pub trait JobHandle: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn is_done(&self) -> bool;
    fn result_uri(&self) -> Option<&str>;
}

/// Accepts a job request and returns the initial handle
#[async_trait]
pub trait JobSubmitter: Send + Sync + 'static {
    type Handle: JobHandle;

    async fn submit(&self, request: &JobRequest) -> Result<Self::Handle, ServiceError>;
}

/// Refreshes a handle with the job's current status
#[async_trait]
pub trait JobPoller<H: JobHandle>: Send + Sync + 'static {
    async fn poll(&self, handle: &H) -> Result<H, ServiceError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Landscape => "16:9",
            Self::Portrait => "9:16",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    #[default]
    #[serde(rename = "720p")]
    Hd,
    #[serde(rename = "1080p")]
    FullHd,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hd => "720p",
            Self::FullHd => "1080p",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    pub resolution: Resolution,
}

/// Immutable description of the work to submit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRequest {
    prompt: String,
    options: GenerationOptions,
}

impl JobRequest {
    /// Validate and build a request. Prompts are passed on untrimmed.
    pub fn new(prompt: impl Into<String>, options: GenerationOptions) -> Result<Self, RequestError> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(RequestError::EmptyPrompt);
        }
        Ok(Self { prompt, options })
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn options(&self) -> GenerationOptions {
        self.options
    }
}
