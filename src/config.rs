// src/config.rs
//! Runtime configuration read from the environment (`.env` is loaded by main).

use crate::gemini_client::{DEFAULT_BASE_URL, DEFAULT_VIDEO_MODEL};
use crate::operation::PollConfig;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,
    pub video_model: String,
    pub poll: PollConfig,
    pub submit_retry_max_elapsed: Duration,
    pub job_retention_hours: i64,
    pub bind_addr: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset and blank values fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let poll_interval_secs: u64 = parse(&get, "VIDEO_POLL_INTERVAL_SECS", 10)?;
        if poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "VIDEO_POLL_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_base_url: get("GEMINI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            video_model: get("VEO_MODEL").unwrap_or_else(|| DEFAULT_VIDEO_MODEL.to_string()),
            poll: PollConfig {
                interval: Duration::from_secs(poll_interval_secs),
                poll_immediately: parse(&get, "VIDEO_POLL_IMMEDIATELY", false)?,
            },
            submit_retry_max_elapsed: Duration::from_secs(parse(
                &get,
                "SUBMIT_RETRY_MAX_ELAPSED_SECS",
                30,
            )?),
            job_retention_hours: parse(&get, "JOB_RETENTION_HOURS", 24)?,
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
        })
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}
