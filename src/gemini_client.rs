use crate::credentials::CredentialStore;
use crate::error::{ErrorTag, ServiceError};
use crate::operation::{JobHandle, JobPoller, JobRequest, JobSubmitter};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_VIDEO_MODEL: &str = "veo-3.1-fast-generate-preview";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    credentials: CredentialStore,
    base_url: String,
    video_model: String,
    submit_retry_max_elapsed: Duration,
}

#[derive(Debug, Serialize)]
struct PredictLongRunningRequest<'a> {
    instances: Vec<VideoInstance<'a>>,
    parameters: VideoParameters,
}

#[derive(Debug, Serialize)]
struct VideoInstance<'a> {
    prompt: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoParameters {
    aspect_ratio: &'static str,
    resolution: &'static str,
}

impl<'a> From<&'a JobRequest> for PredictLongRunningRequest<'a> {
    fn from(request: &'a JobRequest) -> Self {
        let options = request.options();
        Self {
            instances: vec![VideoInstance {
                prompt: request.prompt(),
            }],
            parameters: VideoParameters {
                aspect_ratio: options.aspect_ratio.as_str(),
                resolution: options.resolution.as_str(),
            },
        }
    }
}

/// Long-running operation resource returned by `predictLongRunning` and
/// refreshed by `GET /{name}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoOperation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<VideoOperationResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoOperationResponse {
    /// REST spelling
    #[serde(rename = "generateVideoResponse", default, skip_serializing_if = "Option::is_none")]
    pub generate_video_response: Option<GenerateVideoResponse>,
    /// SDK spelling
    #[serde(rename = "generatedVideos", default, skip_serializing_if = "Option::is_none")]
    pub generated_videos: Option<Vec<GeneratedVideo>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateVideoResponse {
    #[serde(rename = "generatedSamples", default)]
    pub generated_samples: Vec<GeneratedVideo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedVideo {
    #[serde(default)]
    pub video: Option<VideoFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFile {
    #[serde(default)]
    pub uri: Option<String>,
}

impl VideoOperationResponse {
    /// URI of the first generated video, if the backend sent one
    pub fn first_video_uri(&self) -> Option<&str> {
        let first = match (&self.generate_video_response, &self.generated_videos) {
            (Some(rest), _) => rest.generated_samples.first(),
            (None, Some(sdk)) => sdk.first(),
            (None, None) => None,
        };
        first?.video.as_ref()?.uri.as_deref()
    }
}

impl VideoOperation {
    /// Backend message for an operation that finished with an error status
    pub fn failure_message(&self) -> Option<&str> {
        if !self.is_done() {
            return None;
        }
        self.error.as_ref().map(|e| e.message.as_str())
    }
}

impl JobHandle for VideoOperation {
    fn is_done(&self) -> bool {
        self.done.unwrap_or(false)
    }

    fn result_uri(&self) -> Option<&str> {
        self.response.as_ref()?.first_video_uri()
    }
}

/// Google RPC status, as found in error bodies and failed operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiStatus {
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiStatus,
}

impl GeminiClient {
    pub fn new(credentials: CredentialStore) -> Self {
        Self {
            client: Client::new(),
            credentials,
            base_url: DEFAULT_BASE_URL.to_string(),
            video_model: DEFAULT_VIDEO_MODEL.to_string(),
            submit_retry_max_elapsed: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_video_model(mut self, model: impl Into<String>) -> Self {
        self.video_model = model.into();
        self
    }

    /// Upper bound on time spent retrying a submission that never reached the backend
    pub fn with_submit_retry(mut self, max_elapsed: Duration) -> Self {
        self.submit_retry_max_elapsed = max_elapsed;
        self
    }

    pub fn video_model(&self) -> &str {
        &self.video_model
    }

    async fn api_key(&self) -> Result<String, ServiceError> {
        self.credentials.api_key().await.ok_or_else(|| {
            ServiceError::new("API_KEY environment variable not set.")
                .with_tag(ErrorTag::Unauthenticated)
        })
    }

    /// Start a Veo generation. Connection failures and 502/503 are retried
    /// with backoff since no job was created; everything else is final.
    pub async fn start_video_generation(
        &self,
        request: &JobRequest,
    ) -> Result<VideoOperation, ServiceError> {
        let api_key = self.api_key().await?;
        let url = format!(
            "{}/models/{}:predictLongRunning",
            self.base_url, self.video_model
        );
        let body = PredictLongRunningRequest::from(request);

        tracing::debug!(
            model = %self.video_model,
            aspect_ratio = body.parameters.aspect_ratio,
            resolution = body.parameters.resolution,
            "Veo generation request"
        );

        let backoff_config = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            max_elapsed_time: Some(self.submit_retry_max_elapsed),
            ..Default::default()
        };

        let operation = || async {
            let response = self
                .client
                .post(&url)
                .query(&[("key", api_key.as_str())])
                .timeout(REQUEST_TIMEOUT)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    // a timed out request may still have created a job
                    if e.is_connect() {
                        tracing::warn!("Veo submit connection error (retrying): {}", e);
                        backoff::Error::transient(transport_error(e))
                    } else {
                        backoff::Error::permanent(transport_error(e))
                    }
                })?;

            let status = response.status();
            if status == StatusCode::BAD_GATEWAY || status == StatusCode::SERVICE_UNAVAILABLE {
                let err = api_error(response).await;
                tracing::warn!("Veo submit returned {} (retrying): {}", status, err);
                return Err(backoff::Error::transient(err));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(api_error(response).await));
            }

            response.json::<VideoOperation>().await.map_err(|e| {
                backoff::Error::permanent(ServiceError::new(format!(
                    "Failed to parse operation: {}",
                    e
                )))
            })
        };

        let operation = retry(backoff_config, operation).await?;
        tracing::info!(operation = %operation.name, "Veo generation started");
        Ok(operation)
    }

    /// Refresh an operation. Single attempt: a failed status check ends the job.
    pub async fn get_video_operation(
        &self,
        operation: &VideoOperation,
    ) -> Result<VideoOperation, ServiceError> {
        let api_key = self.api_key().await?;
        let url = format!("{}/{}", self.base_url, operation.name);

        let response = self
            .client
            .get(&url)
            .query(&[("key", api_key.as_str())])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let refreshed: VideoOperation = response
            .json()
            .await
            .map_err(|e| ServiceError::new(format!("Failed to parse operation: {}", e)))?;

        tracing::debug!(
            operation = %refreshed.name,
            done = refreshed.is_done(),
            "Veo operation status"
        );
        if let Some(message) = refreshed.failure_message() {
            tracing::warn!(operation = %refreshed.name, error = %message, "Veo operation finished with an error");
        }
        Ok(refreshed)
    }

    /// Result URIs need the API key attached before they can be fetched
    pub async fn authorized_download_url(&self, uri: &str) -> Result<Url, ServiceError> {
        let mut url = Url::parse(uri).map_err(|e| {
            ServiceError::new(format!("Invalid video URI '{}': {}", uri, e))
                .with_tag(ErrorTag::InvalidRequest)
        })?;
        let api_key = self.api_key().await?;
        url.query_pairs_mut().append_pair("key", &api_key);
        Ok(url)
    }

    pub async fn download_video(&self, uri: &str) -> Result<Vec<u8>, ServiceError> {
        let url = self.authorized_download_url(uri).await?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let bytes = response.bytes().await.map_err(transport_error)?;
        tracing::info!("Downloaded generated video ({} bytes)", bytes.len());
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl JobSubmitter for GeminiClient {
    type Handle = VideoOperation;

    async fn submit(&self, request: &JobRequest) -> Result<VideoOperation, ServiceError> {
        self.start_video_generation(request).await
    }
}

#[async_trait]
impl JobPoller<VideoOperation> for GeminiClient {
    async fn poll(&self, handle: &VideoOperation) -> Result<VideoOperation, ServiceError> {
        self.get_video_operation(handle).await
    }
}

fn transport_error(e: reqwest::Error) -> ServiceError {
    // strip the url, it carries the key
    ServiceError::new(format!("Request error: {}", e.without_url())).with_tag(ErrorTag::Transport)
}

async fn api_error(response: reqwest::Response) -> ServiceError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    parse_api_error(status, &body)
}

fn parse_api_error(status: u16, body: &str) -> ServiceError {
    match serde_json::from_str::<ApiErrorEnvelope>(body) {
        Ok(envelope) if !envelope.error.message.is_empty() => ServiceError::from_api(
            status,
            envelope.error.status.as_deref(),
            envelope.error.message,
        ),
        _ => ServiceError::from_api(status, None, format!("Gemini API error ({}): {}", status, body)),
    }
}
