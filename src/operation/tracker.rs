// src/operation/tracker.rs
//! Drives one job from submission to a terminal phase.
//!
//! Each submission gets its own task and its own state channel. The task is
//! the only writer apart from `cancel`, and every write goes through a guard
//! that refuses to touch a cancelled or terminal state.

use super::{JobHandle, JobPoller, JobRequest, JobSubmitter, Phase, TrackerState};
use crate::credentials::CredentialStore;
use crate::error::TrackerError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between poll ticks, measured tick to tick
    pub interval: Duration,
    /// Issue the first poll right after submission instead of one interval later
    pub poll_immediately: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            poll_immediately: false,
        }
    }
}

/// Starts trackers for jobs against an injected submitter and poller
pub struct OperationTracker<S, P> {
    submitter: Arc<S>,
    poller: Arc<P>,
    credentials: CredentialStore,
    config: PollConfig,
}

impl<S, P> Clone for OperationTracker<S, P> {
    fn clone(&self) -> Self {
        Self {
            submitter: self.submitter.clone(),
            poller: self.poller.clone(),
            credentials: self.credentials.clone(),
            config: self.config,
        }
    }
}

impl<S, P> OperationTracker<S, P>
where
    S: JobSubmitter,
    P: JobPoller<S::Handle>,
{
    pub fn new(submitter: Arc<S>, poller: Arc<P>, credentials: CredentialStore) -> Self {
        Self {
            submitter,
            poller,
            credentials,
            config: PollConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PollConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> PollConfig {
        self.config
    }

    /// Submit a job and start tracking it.
    ///
    /// Returns as soon as the state has moved to `Submitting`; the submit
    /// call and all polling run on a spawned task. Must be called from
    /// within a tokio runtime.
    pub fn submit(&self, request: JobRequest) -> TrackerHandle<S::Handle> {
        let id = Uuid::new_v4().to_string();

        let mut initial = TrackerState::new();
        initial.begin_submission();
        let (state_tx, _) = watch::channel(initial);
        let state = Arc::new(state_tx);
        let cancel = CancellationToken::new();

        let run = TrackerRun {
            submitter: self.submitter.clone(),
            poller: self.poller.clone(),
            credentials: self.credentials.clone(),
            config: self.config,
            state: state.clone(),
            cancel: cancel.clone(),
            request,
        };

        tracing::info!(job_id = %id, "🎬 Submitting generation job");
        tokio::spawn(run.drive().instrument(tracing::info_span!("operation", job_id = %id)));

        TrackerHandle {
            shared: Arc::new(Shared { id, state, cancel }),
        }
    }
}

struct Shared<H> {
    id: String,
    state: Arc<watch::Sender<TrackerState<H>>>,
    cancel: CancellationToken,
}

impl<H> Drop for Shared<H> {
    // last caller handle gone: nobody can observe the job any more
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Caller's view of a live job. Clones share the same job; dropping every
/// clone abandons it.
pub struct TrackerHandle<H> {
    shared: Arc<Shared<H>>,
}

impl<H> Clone for TrackerHandle<H> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<H: JobHandle> TrackerHandle<H> {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Snapshot of the current state
    pub fn state(&self) -> TrackerState<H> {
        self.shared.state.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.borrow().phase
    }

    /// Receiver notified on every transition
    pub fn subscribe(&self) -> watch::Receiver<TrackerState<H>> {
        self.shared.state.subscribe()
    }

    /// Wait until the job is terminal or cancelled
    pub async fn settled(&self) -> TrackerState<H> {
        let mut rx = self.subscribe();
        let settled = rx.wait_for(TrackerState::is_settled).await.map(|s| s.clone());
        match settled {
            Ok(state) => state,
            // sender lives in `shared`, which we hold
            Err(_) => self.state(),
        }
    }

    /// Abandon the job. Idempotent, and a no-op once the job is terminal.
    ///
    /// Once this returns the poller is not invoked again and a poll response
    /// still in flight is discarded. The backend is not told.
    pub fn cancel(&self) {
        let changed = self.shared.state.send_if_modified(TrackerState::cancel);
        self.shared.cancel.cancel();
        if changed {
            tracing::info!(job_id = %self.shared.id, "🛑 Job cancelled");
        }
    }
}

impl<H: JobHandle> std::fmt::Debug for TrackerHandle<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerHandle")
            .field("id", &self.shared.id)
            .field("phase", &self.phase())
            .finish()
    }
}

struct TrackerRun<S: JobSubmitter, P> {
    submitter: Arc<S>,
    poller: Arc<P>,
    credentials: CredentialStore,
    config: PollConfig,
    state: Arc<watch::Sender<TrackerState<S::Handle>>>,
    cancel: CancellationToken,
    request: JobRequest,
}

impl<S, P> TrackerRun<S, P>
where
    S: JobSubmitter,
    P: JobPoller<S::Handle>,
{
    async fn drive(self) {
        let submitted = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            result = self.submitter.submit(&self.request) => result,
        };

        let handle = match submitted {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(TrackerError::Submission(e));
                return;
            }
        };

        if self.update(|s| s.start_polling(handle)).is_none() {
            return;
        }
        tracing::info!(interval = ?self.config.interval, "⏳ Job accepted, polling for status");

        let first_tick = if self.config.poll_immediately {
            Instant::now()
        } else {
            Instant::now() + self.config.interval
        };
        let mut ticker = time::interval_at(first_tick, self.config.interval);
        // a poll slower than the interval swallows the ticks it overlapped
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let Some(handle) = self.current_handle() else {
                return;
            };

            tracing::debug!("🔄 Polling job status");
            // On a multi-thread runtime a cancel landing between the check above
            // and the poller's first poll can still let that call start. Its
            // response never reaches the state: `update` rejects it.
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                result = self.poller.poll(&handle) => result,
            };

            match polled {
                Ok(refreshed) => match self.update(|s| s.apply_poll(refreshed)) {
                    Some(Phase::Polling) => continue,
                    Some(Phase::Completed) => {
                        tracing::info!("✅ Job completed");
                        return;
                    }
                    Some(_) => {
                        self.report_failure();
                        return;
                    }
                    None => return,
                },
                Err(e) => {
                    if self
                        .update(|s| s.apply_poll_error(TrackerError::Poll(e)))
                        .is_some()
                    {
                        self.report_failure();
                    }
                    return;
                }
            }
        }
    }

    /// Apply `f` unless the state was cancelled or reached a terminal phase
    fn update<R>(&self, f: impl FnOnce(&mut TrackerState<S::Handle>) -> R) -> Option<R> {
        let mut out = None;
        self.state.send_if_modified(|state| {
            if !state.accepts_updates() {
                return false;
            }
            out = Some(f(state));
            true
        });
        out
    }

    fn current_handle(&self) -> Option<S::Handle> {
        let state = self.state.borrow();
        if !state.accepts_updates() {
            return None;
        }
        state.current_handle.clone()
    }

    fn fail(&self, error: TrackerError) {
        if self.update(|s| s.fail(error)).is_some() {
            self.report_failure();
        }
    }

    fn report_failure(&self) {
        let (message, credential_invalid) = {
            let state = self.state.borrow();
            match &state.last_error {
                Some(e) => (e.to_string(), e.is_credential_invalid()),
                None => return,
            }
        };

        tracing::warn!(error = %message, "❌ Job failed");
        if credential_invalid {
            self.credentials.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::operation::GenerationOptions;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq)]
    struct FakeHandle {
        done: bool,
        result: Option<String>,
    }

    impl FakeHandle {
        fn pending() -> Self {
            Self { done: false, result: None }
        }

        fn done_with(uri: &str) -> Self {
            Self {
                done: true,
                result: Some(uri.to_string()),
            }
        }

        fn done_empty() -> Self {
            Self { done: true, result: None }
        }
    }

    impl JobHandle for FakeHandle {
        fn is_done(&self) -> bool {
            self.done
        }

        fn result_uri(&self) -> Option<&str> {
            self.result.as_deref()
        }
    }

    struct ScriptedSubmitter {
        result: Mutex<Option<Result<FakeHandle, ServiceError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSubmitter {
        fn returning(result: Result<FakeHandle, ServiceError>) -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(Some(result)),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobSubmitter for ScriptedSubmitter {
        type Handle = FakeHandle;

        async fn submit(&self, _request: &JobRequest) -> Result<FakeHandle, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(ServiceError::new("submitted twice")))
        }
    }

    #[derive(Default)]
    struct ScriptedPoller {
        responses: Mutex<VecDeque<Result<FakeHandle, ServiceError>>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedPoller {
        fn new(responses: Vec<Result<FakeHandle, ServiceError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobPoller<FakeHandle> for ScriptedPoller {
        async fn poll(&self, _handle: &FakeHandle) -> Result<FakeHandle, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(FakeHandle::pending()))
        }
    }

    fn request(prompt: &str) -> JobRequest {
        JobRequest::new(prompt, GenerationOptions::default()).unwrap()
    }

    fn tracker(
        submitter: Arc<ScriptedSubmitter>,
        poller: Arc<ScriptedPoller>,
    ) -> (OperationTracker<ScriptedSubmitter, ScriptedPoller>, CredentialStore) {
        let credentials = CredentialStore::new(Some("test-key".to_string()));
        let tracker = OperationTracker::new(submitter, poller, credentials.clone());
        (tracker, credentials)
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_starts_before_first_poll() {
        let submitter = ScriptedSubmitter::returning(Ok(FakeHandle::pending()));
        let poller = Arc::new(ScriptedPoller::new(vec![]));
        let (tracker, _) = tracker(submitter, poller.clone());

        let handle = tracker.submit(request("a cat"));
        assert_eq!(handle.phase(), Phase::Submitting);

        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.phase == Phase::Polling).await.unwrap();
        assert_eq!(poller.calls(), 0);
        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_on_second_poll() {
        let submitter = ScriptedSubmitter::returning(Ok(FakeHandle::pending()));
        let poller = Arc::new(ScriptedPoller::new(vec![
            Ok(FakeHandle::pending()),
            Ok(FakeHandle::done_with("uri://video1")),
        ]));
        let (tracker, _) = tracker(submitter.clone(), poller.clone());

        let handle = tracker.submit(request("a cat"));
        let state = handle.settled().await;

        assert_eq!(state.phase, Phase::Completed);
        assert_eq!(state.result_uri(), Some("uri://video1"));
        assert_eq!(state.polls, 2);
        assert_eq!(poller.calls(), 2);
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 1);

        // no poll N+1
        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(poller.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_without_result_fails_with_protocol_violation() {
        let submitter = ScriptedSubmitter::returning(Ok(FakeHandle::pending()));
        let poller = Arc::new(ScriptedPoller::new(vec![Ok(FakeHandle::done_empty())]));
        let (tracker, credentials) = tracker(submitter, poller.clone());

        let state = tracker.submit(request("a dog")).settled().await;

        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.last_error, Some(TrackerError::ProtocolViolation));
        assert!(credentials.is_present());
        assert_eq!(poller.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_not_found_on_submit_clears_flag() {
        let submitter = ScriptedSubmitter::returning(Err(ServiceError::new(
            "Requested entity was not found.",
        )));
        let poller = Arc::new(ScriptedPoller::new(vec![]));
        let (tracker, credentials) = tracker(submitter, poller.clone());

        let state = tracker.submit(request("a cat")).settled().await;

        assert_eq!(state.phase, Phase::Failed);
        let error = state.last_error.expect("failed state carries an error");
        assert!(matches!(error, TrackerError::Submission(_)));
        assert!(error.is_credential_invalid());
        assert!(state.credential_invalidated);
        assert!(state.current_handle.is_none());
        assert!(!credentials.is_present());
        assert_eq!(poller.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_polls_after_poll_error() {
        let submitter = ScriptedSubmitter::returning(Ok(FakeHandle::pending()));
        let poller = Arc::new(ScriptedPoller::new(vec![
            Ok(FakeHandle::pending()),
            Err(ServiceError::new("connection reset")),
            Ok(FakeHandle::done_with("uri://never")),
        ]));
        let (tracker, credentials) = tracker(submitter, poller.clone());

        let handle = tracker.submit(request("a cat"));
        let state = handle.settled().await;

        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(
            state.last_error.map(|e| e.to_string()).as_deref(),
            Some("Error checking video status: connection reset")
        );
        assert!(credentials.is_present());

        time::sleep(Duration::from_secs(300)).await;
        assert_eq!(poller.calls(), 2);
        assert_eq!(handle.state().polls, 2);
        assert_eq!(handle.phase(), Phase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_not_found_on_poll_clears_flag() {
        let submitter = ScriptedSubmitter::returning(Ok(FakeHandle::pending()));
        let poller = Arc::new(ScriptedPoller::new(vec![
            Ok(FakeHandle::pending()),
            Err(ServiceError::new("Requested entity was not found.")),
        ]));
        let (tracker, credentials) = tracker(submitter, poller.clone());

        let state = tracker.submit(request("a cat")).settled().await;

        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.polls, 2);
        let error = state.last_error.expect("failed state carries an error");
        assert!(matches!(error, TrackerError::Poll(_)));
        assert!(error.is_credential_invalid());
        assert!(state.credential_invalidated);
        assert!(!credentials.is_present());
        assert_eq!(poller.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_completion_stops_polling() {
        let submitter = ScriptedSubmitter::returning(Ok(FakeHandle::pending()));
        let poller = Arc::new(ScriptedPoller::new(vec![
            Ok(FakeHandle::pending()),
            Ok(FakeHandle::pending()),
            Ok(FakeHandle::pending()),
            Ok(FakeHandle::pending()),
            Ok(FakeHandle::done_with("uri://video1")),
        ]));
        let (tracker, _) = tracker(submitter, poller.clone());

        let handle = tracker.submit(request("a cat"));
        // polls at 10s and 20s; completion would come at 50s
        time::sleep(Duration::from_secs(25)).await;
        assert_eq!(poller.calls(), 2);

        handle.cancel();
        time::sleep(Duration::from_secs(120)).await;

        let state = handle.state();
        assert_eq!(poller.calls(), 2);
        assert!(state.cancelled);
        assert_eq!(state.phase, Phase::Idle);
        assert_ne!(state.phase, Phase::Completed);
        assert!(handle.settled().await.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let submitter = ScriptedSubmitter::returning(Ok(FakeHandle::pending()));
        let poller = Arc::new(ScriptedPoller::new(vec![]));
        let (tracker, _) = tracker(submitter, poller);

        let handle = tracker.submit(request("a cat"));
        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.phase == Phase::Polling).await.unwrap();

        handle.cancel();
        let first = handle.state();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        handle.cancel();
        let second = handle.state();
        assert!(!rx.has_changed().unwrap());
        assert_eq!(first.phase, second.phase);
        assert_eq!(first.cancelled, second.cancelled);
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_completion_is_noop() {
        let submitter = ScriptedSubmitter::returning(Ok(FakeHandle::pending()));
        let poller = Arc::new(ScriptedPoller::new(vec![Ok(FakeHandle::done_with("uri://v"))]));
        let (tracker, _) = tracker(submitter, poller);

        let handle = tracker.submit(request("a cat"));
        handle.settled().await;
        handle.cancel();

        let state = handle.state();
        assert_eq!(state.phase, Phase::Completed);
        assert!(!state.cancelled);
        assert_eq!(state.result_uri(), Some("uri://v"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_response_discarded_after_cancel() {
        let gate = Arc::new(Notify::new());
        let poller = Arc::new(ScriptedPoller {
            responses: Mutex::new(vec![Ok(FakeHandle::done_with("uri://late"))].into()),
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let submitter = ScriptedSubmitter::returning(Ok(FakeHandle::pending()));
        let (tracker, _) = tracker(submitter, poller.clone());

        let handle = tracker.submit(request("a cat"));
        while poller.calls() == 0 {
            time::sleep(Duration::from_secs(1)).await;
        }

        handle.cancel();
        gate.notify_one();
        time::sleep(Duration::from_secs(60)).await;

        let state = handle.state();
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.cancelled);
        assert_eq!(state.polls, 0);
        assert_eq!(state.current_handle, Some(FakeHandle::pending()));
        assert_eq!(poller.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_update_rejected_by_state_guard() {
        let submitter = ScriptedSubmitter::returning(Ok(FakeHandle::pending()));
        let poller = Arc::new(ScriptedPoller::new(vec![]));
        let credentials = CredentialStore::new(Some("k".to_string()));

        let mut initial = TrackerState::new();
        initial.start_polling(FakeHandle::pending());
        let (state_tx, _) = watch::channel(initial);
        let run = TrackerRun {
            submitter,
            poller,
            credentials,
            config: PollConfig::default(),
            state: Arc::new(state_tx),
            cancel: CancellationToken::new(),
            request: request("a cat"),
        };

        run.state.send_if_modified(TrackerState::cancel);
        let applied = run.update(|s| s.apply_poll(FakeHandle::done_with("uri://late")));

        assert!(applied.is_none());
        assert!(run.current_handle().is_none());
        assert_eq!(run.state.borrow().phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_polls_never_overlap() {
        let poller = Arc::new(ScriptedPoller {
            responses: Mutex::new(
                vec![
                    Ok(FakeHandle::pending()),
                    Ok(FakeHandle::pending()),
                    Ok(FakeHandle::done_with("uri://slow")),
                ]
                .into(),
            ),
            delay: Duration::from_secs(25),
            ..Default::default()
        });
        let submitter = ScriptedSubmitter::returning(Ok(FakeHandle::pending()));
        let (tracker, _) = tracker(submitter, poller.clone());

        let state = tracker.submit(request("a cat")).settled().await;

        assert_eq!(state.phase, Phase::Completed);
        assert_eq!(poller.calls(), 3);
        assert_eq!(poller.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_abandons_job() {
        let submitter = ScriptedSubmitter::returning(Ok(FakeHandle::pending()));
        let poller = Arc::new(ScriptedPoller::new(vec![]));
        let (tracker, _) = tracker(submitter, poller.clone());

        let handle = tracker.submit(request("a cat"));
        time::sleep(Duration::from_secs(15)).await;
        assert_eq!(poller.calls(), 1);

        drop(handle);
        time::sleep(Duration::from_secs(100)).await;
        assert_eq!(poller.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_immediately_issues_first_poll_at_once() {
        let submitter = ScriptedSubmitter::returning(Ok(FakeHandle::pending()));
        let poller = Arc::new(ScriptedPoller::new(vec![]));
        let (tracker, _) = tracker(submitter, poller.clone());
        let tracker = tracker.with_config(PollConfig {
            interval: Duration::from_secs(10),
            poll_immediately: true,
        });

        let handle = tracker.submit(request("a cat"));
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(poller.calls(), 1);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(poller.calls(), 2);
        handle.cancel();
    }
}
