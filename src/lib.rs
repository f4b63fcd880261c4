// lib.rs - Tracking of long-running video generation jobs
pub mod config;
pub mod credentials;
pub mod error;
pub mod gemini_client;
pub mod operation;

// Re-export commonly used types for convenience
pub use config::{AppConfig, ConfigError};
pub use credentials::{CredentialStatus, CredentialStore};
pub use error::{ErrorReport, ErrorTag, RequestError, ServiceError, TrackerError};
pub use gemini_client::{GeminiClient, VideoOperation};
pub use operation::{
    GenerationOptions, JobHandle, JobPoller, JobRequest, JobSubmitter, OperationTracker, Phase,
    PollConfig, TrackerHandle, TrackerState,
};
