// src/jobs/mod.rs
//! Registry of video generation jobs started through the API.
//! Holding a job's tracker handle here is what keeps its polling alive.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use video_lab::{JobRequest, TrackerHandle, VideoOperation};

/// Unique identifier for a video job (the tracker's id)
pub type JobId = String;

#[derive(Debug, Clone)]
pub struct VideoJob {
    pub id: JobId,
    pub request: JobRequest,
    pub created_at: DateTime<Utc>,
    pub tracker: TrackerHandle<VideoOperation>,
}

/// Job manager owns the tracker handles of every job it was given
pub struct JobManager {
    jobs: Arc<RwLock<HashMap<JobId, VideoJob>>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store a freshly submitted job
    pub async fn create_job(
        &self,
        request: JobRequest,
        tracker: TrackerHandle<VideoOperation>,
    ) -> VideoJob {
        let job = VideoJob {
            id: tracker.id().to_string(),
            request,
            created_at: Utc::now(),
            tracker,
        };
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        tracing::info!("🎬 Registered video job: {}", job.id);
        job
    }

    pub async fn get_job(&self, job_id: &str) -> Option<VideoJob> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// All jobs, newest first
    pub async fn list_jobs(&self) -> Vec<VideoJob> {
        let mut jobs: Vec<VideoJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub async fn active_job_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| !job.tracker.state().is_settled())
            .count()
    }

    /// Cancel a job; the entry stays so its final state can still be read
    pub async fn cancel_job(&self, job_id: &str) -> Option<VideoJob> {
        let job = self.get_job(job_id).await?;
        job.tracker.cancel();
        Some(job)
    }

    /// Drop settled jobs whose last transition is older than `max_age_hours`.
    /// Jobs still in flight are never evicted.
    pub async fn cleanup_old_jobs(&self, max_age_hours: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();

        jobs.retain(|job_id, job| {
            let state = job.tracker.state();
            let expired = state.is_settled() && state.updated_at <= cutoff;
            if expired {
                tracing::debug!("🗑️ Cleaned up old job: {}", job_id);
            }
            !expired
        });

        before - jobs.len()
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedJobManager = Arc<JobManager>;
