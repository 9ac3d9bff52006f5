// Transit ingestion service: runs the pipeline on an interval and exposes a
// small control/status API.

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use transit_pipeline::error::CycleError;
use transit_pipeline::features::RouteEncoder;
use transit_pipeline::fetch::{HttpFeedSource, HttpFetcher};
use transit_pipeline::schedule::{ScheduleVersionInfo, VersionOrigin};
use transit_pipeline::sinks::{JsonLinesRecordSink, LocalObjectSink};
use transit_pipeline::{Pipeline, PipelineConfig, ScheduleSource, ScheduleStore};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_LOG_FILTER: &str = "transit_pipeline=info,actix_web=info";

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    schedule: Arc<ScheduleStore>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Serialize)]
struct ScheduleStatus {
    origin: VersionOrigin,
    #[serde(flatten)]
    info: ScheduleVersionInfo,
}

// ============================================================================
// API Endpoints
// ============================================================================

async fn run_pipeline(state: web::Data<AppState>) -> HttpResponse {
    info!("Manual cycle requested");
    match state.pipeline.run_cycle().await {
        Ok(summary) => HttpResponse::Ok().json(ApiResponse::success(summary)),
        Err(e @ CycleError::Busy) => HttpResponse::Conflict().json(ApiResponse::<()>::error(e.to_string())),
        Err(e @ CycleError::Timeout(_)) => {
            HttpResponse::GatewayTimeout().json(ApiResponse::<()>::error(e.to_string()))
        }
    }
}

async fn get_summary(state: web::Data<AppState>) -> HttpResponse {
    match state.pipeline.last_summary() {
        Some(summary) => HttpResponse::Ok().json(ApiResponse::success(summary)),
        None => HttpResponse::NotFound().json(ApiResponse::<()>::error("No cycle has completed yet".to_string())),
    }
}

async fn get_schedule(state: web::Data<AppState>) -> HttpResponse {
    match state.schedule.active() {
        Some(version) => HttpResponse::Ok().json(ApiResponse::success(ScheduleStatus {
            origin: version.origin(),
            info: version.info().clone(),
        })),
        None => HttpResponse::ServiceUnavailable()
            .json(ApiResponse::<()>::error("No schedule version loaded, running degraded".to_string())),
    }
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let last_cycle = state.pipeline.last_summary().map(|s| s.started_at);
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "schedule_loaded": state.schedule.active().is_some(),
        "last_cycle_at": last_cycle,
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

// ============================================================================
// Background Tasks
// ============================================================================

async fn cycle_task(pipeline: Arc<Pipeline>, interval_secs: u64) {
    let mut interval = time::interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        match pipeline.run_cycle().await {
            Ok(_) => {}
            Err(CycleError::Busy) => warn!("Previous cycle still running, tick skipped"),
            Err(e) => error!("Cycle failed: {}", e),
        }
    }
}

async fn schedule_refresh_task(store: Arc<ScheduleStore>, source: ScheduleSource, refresh_secs: u64) {
    let mut interval = time::interval(Duration::from_secs(refresh_secs.max(60)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick fires immediately; startup already loaded a version
    interval.tick().await;

    loop {
        interval.tick().await;
        info!("Refreshing schedule");
        if let Err(e) = store.load(&source).await {
            error!("Schedule refresh failed, keeping current version: {}", e);
        }
    }
}

// ============================================================================
// Server Setup
// ============================================================================

fn to_io(e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(e.to_string())
}

/// Loads the schedule and route encoding, then wires the pipeline to the
/// configured feeds and sinks.
async fn build_state(config: &PipelineConfig) -> transit_pipeline::Result<(AppState, ScheduleSource)> {
    let timezone = config.timezone()?;
    let fetcher = HttpFetcher::new(config.fetch.clone())?;

    let schedule = Arc::new(ScheduleStore::new(
        config.schedule.clone(),
        timezone,
        Some(fetcher.clone()),
    ));
    let schedule_source = ScheduleSource::Url(config.schedule.url.clone());
    if let Err(e) = schedule.initialize(&schedule_source).await {
        // not fatal: cycles run degraded until a refresh succeeds
        error!("Initial schedule load failed: {}", e);
    }

    let encoder = match RouteEncoder::load(config.route_encoding_path()) {
        Ok(encoder) => encoder,
        Err(e) => {
            warn!("Starting with an empty route encoding table: {}", e);
            RouteEncoder::in_memory()
        }
    };

    let pipeline = Pipeline::new(
        config,
        Arc::new(HttpFeedSource::new(fetcher, config.feeds.clone())),
        schedule.clone(),
        encoder,
        Arc::new(LocalObjectSink::new(&config.output.object_store_dir)),
        Arc::new(JsonLinesRecordSink::new(&config.output.record_store_path)),
    )?;

    let state = AppState {
        pipeline: Arc::new(pipeline),
        schedule,
    };
    Ok((state, schedule_source))
}

async fn run_server(config: PipelineConfig) -> std::io::Result<()> {
    let (app_state, schedule_source) = build_state(&config).await.map_err(to_io)?;

    if config.cycle.run_on_interval {
        let pipeline = app_state.pipeline.clone();
        let interval_secs = config.cycle.interval_secs;
        tokio::spawn(async move {
            cycle_task(pipeline, interval_secs).await;
        });
    }

    let refresh_store = app_state.schedule.clone();
    let refresh_secs = config.schedule.refresh_interval_secs;
    tokio::spawn(async move {
        schedule_refresh_task(refresh_store, schedule_source, refresh_secs).await;
    });

    let bind = (config.server.bind_address.clone(), config.server.port);
    info!(
        address = %bind.0,
        port = bind.1,
        interval_secs = config.cycle.interval_secs,
        run_on_interval = config.cycle.run_on_interval,
        "Transit pipeline server starting"
    );

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api")
                    .route("/pipeline/run", web::post().to(run_pipeline))
                    .route("/pipeline/summary", web::get().to(get_summary))
                    .route("/schedule", web::get().to(get_schedule)),
            )
    })
    .bind(bind)?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TRANSIT_PIPELINE_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = match PipelineConfig::load_or_default(&config_path).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => {
            info!(path = %config_path, "Configuration loaded");
            config
        }
        Err(e) => {
            error!(path = %config_path, "Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    actix_web::rt::System::new().block_on(run_server(config))
}
