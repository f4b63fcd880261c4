use axum::{response::Json, Extension, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use video_lab::{AppConfig, CredentialStore, GeminiClient, OperationTracker};

mod handlers;
mod jobs; // 🎬 Registry of live video jobs
mod middleware;

// AppState holds the credential store, the Gemini client, the video tracker and the job registry
pub struct AppState {
    pub config: AppConfig,
    pub credentials: CredentialStore,
    pub gemini_client: Arc<GeminiClient>,
    pub video_tracker: OperationTracker<GeminiClient, GeminiClient>,
    pub job_manager: jobs::SharedJobManager,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_logging()?;

    let config = AppConfig::from_env()?;

    let credentials = CredentialStore::new(config.gemini_api_key.clone());
    if credentials.is_present() {
        tracing::info!("✅ Gemini API key loaded");
    } else {
        tracing::warn!("GEMINI_API_KEY not found. Video generation stays disabled until a key is selected.");
        tracing::info!("To select a key at runtime, POST it to /api/credentials");
    }

    let gemini_client = Arc::new(
        GeminiClient::new(credentials.clone())
            .with_base_url(config.gemini_base_url.clone())
            .with_video_model(config.video_model.clone())
            .with_submit_retry(config.submit_retry_max_elapsed),
    );
    tracing::info!("Initializing Veo client (model: {})...", gemini_client.video_model());

    let video_tracker = OperationTracker::new(
        gemini_client.clone(),
        gemini_client.clone(),
        credentials.clone(),
    )
    .with_config(config.poll);

    let job_manager = Arc::new(jobs::JobManager::new());
    tracing::info!(
        "🎬 Job manager initialized (poll every {:?}, retention {}h)",
        config.poll.interval,
        config.job_retention_hours
    );

    let bind_addr = config.bind_addr.clone();
    let shared_state = Arc::new(AppState {
        config,
        credentials,
        gemini_client,
        video_tracker,
        job_manager,
    });

    let app = Router::new()
        .merge(handlers::videos::video_routes())
        .merge(handlers::credentials::credential_routes())
        .route("/api/status", axum::routing::get(api_status))
        .layer(axum::middleware::from_fn(middleware::logging::request_logging_middleware))
        .layer(CorsLayer::permissive())
        .layer(Extension(shared_state.clone()));

    // Evict settled jobs once they are past the retention window
    let cleanup_state = shared_state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            let removed = cleanup_state
                .job_manager
                .cleanup_old_jobs(cleanup_state.config.job_retention_hours)
                .await;
            if removed > 0 {
                tracing::info!("🗑️ Evicted {} settled video jobs", removed);
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

const DEFAULT_LOG_FILTER: &str = "info,video_lab=debug,reqwest=warn,hyper=warn";

/// Output format for log lines, picked by `LOG_FORMAT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_LOG_FILTER)?,
    };
    let format = LogFormat::from_setting(std::env::var("LOG_FORMAT").ok().as_deref());

    // job_id comes from the tracker span, keep it on every line
    let layer = match format {
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
        LogFormat::Pretty => fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry().with(filter).with(layer).init();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), ?format, "🎬 Video Lab starting up");
    Ok(())
}

// Liveness and configuration summary
async fn api_status(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "video_model": state.gemini_client.video_model(),
        "poll_interval_secs": state.config.poll.interval.as_secs(),
        "credential": state.credentials.status(),
        "active_jobs": state.job_manager.active_job_count().await,
    }))
}
